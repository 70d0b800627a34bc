//! Source streams for particle pipelines
//!
//! Sources are the leaves of a decorator chain. They own no delegate and
//! fill requested channels they do not produce from the default record.
//!
//! - [`ArrayStream`]: cursor over a shared in-memory array
//! - [`PrtFileStream`]: one on-disk particle file, strict or lenient
//! - [`ProceduralStream`]: records made on demand by a [`Generator`]
//! - [`ConcatenatedStream`]: several sources back to back
//! - [`EmptyStream`]: no records, but a schema

#![warn(missing_docs)]

pub mod array;
pub mod concat;
pub mod empty;
pub mod procedural;
pub mod prt;
pub mod sequence;

pub use array::ArrayStream;
pub use concat::ConcatenatedStream;
pub use empty::EmptyStream;
pub use procedural::{FnGenerator, Generator, LatticeGenerator, ProceduralStream};
pub use prt::{
    open_stream, write_stream, Compression, FileMetadata, LoadPolicy, PrtFileStream, PrtReaderOptions, PrtWriter,
    PrtWriterOptions,
};
pub use sequence::{FileSequence, Partition};
