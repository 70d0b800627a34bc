//! Core traits, data structures, and abstractions for particle stream pipelines
//!
//! This crate provides the record model every other crate builds on: channel
//! schemas, typed accessors into raw record buffers, conversion between
//! layouts, and the pull-based [`ParticleStream`] trait with its schema
//! negotiation protocol.

#![warn(missing_docs)]

pub mod accessor;
pub mod adaptor;
pub mod bounds;
pub mod error;
pub mod interval;
pub mod negotiation;
pub mod particle_array;
pub mod progress;
pub mod schema;
pub mod sink;
pub mod stream;

// Re-export key types for convenience
pub use accessor::{Accessor, ChannelValue, ConvertingAccessor};
pub use adaptor::SchemaAdaptor;
pub use bounds::Aabb;
pub use error::{Error, ErrorKind, Result};
pub use interval::{Interval, Time};
pub use negotiation::Negotiated;
pub use particle_array::ParticleArray;
pub use progress::{CancelFlag, NullProgress, ProgressSink};
pub use schema::{Channel, DataType, Schema};
pub use sink::{drain, ParticleSink};
pub use stream::{negotiate, ParticleStream, DEFAULT_BATCH_SIZE};

/// Well-known channel names
pub mod channels {
    /// Object- or world-space position, `float32[3]`
    pub const POSITION: &str = "Position";
    /// Velocity in units per second, `float32[3]`
    pub const VELOCITY: &str = "Velocity";
    /// Acceleration in units per second squared, `float32[3]`
    pub const ACCELERATION: &str = "Acceleration";
    /// Surface normal, `float32[3]`
    pub const NORMAL: &str = "Normal";
    /// Tangent vector, `float32[3]`
    pub const TANGENT: &str = "Tangent";
    /// Scattering colour, `float32[3]`
    pub const COLOR: &str = "Color";
    /// Density multiplier, `float32`
    pub const DENSITY: &str = "Density";
    /// Persistent particle identity, `int64`
    pub const ID: &str = "ID";
    /// Position in the source stream, `int64`
    pub const INDEX: &str = "Index";
    /// Soft selection weight in `[0, 1]`, `float32`
    pub const SELECTION: &str = "Selection";
    /// Index of the file partition a record came from, `int32`
    pub const PARTITION_INDEX: &str = "PartitionIndex";
    /// Number of partitions in the sequence, `int32`
    pub const PARTITION_COUNT: &str = "PartitionCount";
    /// Normal of the nearest culling surface, `float32[3]`
    pub const CULLING_SURFACE_NORMAL: &str = "CullingSurfaceNormal";
    /// Viewport display colour overriding `Color`, `float32[3]`
    pub const VIEWPORT_COLOR: &str = "PRTViewportColor";
}
