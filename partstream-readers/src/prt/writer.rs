//! Sequential writer for particle files

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use partstream_core::{
    drain, Error, ParticleSink, ParticleStream, ProgressSink, Result, Schema, DEFAULT_BATCH_SIZE,
};
use tracing::{debug, info};

use super::header::{swap_little_endian, Compression, FileHeader, FileMetadata, TRAILER_MAGIC};

/// Options for particle file writer
#[derive(Debug, Clone)]
pub struct PrtWriterOptions {
    /// Payload compression
    pub compression: Compression,

    /// Compression level, used by zstd only
    pub compression_level: i32,

    /// Metadata stored in the header
    pub metadata: FileMetadata,

    /// Buffer size for file I/O
    pub buffer_size: usize,
}

impl Default for PrtWriterOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            compression_level: 3,
            metadata: FileMetadata::default(),
            buffer_size: 256 * 1024, // 256KB
        }
    }
}

enum Payload {
    Raw(BufWriter<File>),
    #[cfg(feature = "lz4-compression")]
    Lz4(lz4::Encoder<BufWriter<File>>),
    #[cfg(feature = "zstd-compression")]
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl Payload {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Payload::Raw(w) => w,
            #[cfg(feature = "lz4-compression")]
            Payload::Lz4(w) => w,
            #[cfg(feature = "zstd-compression")]
            Payload::Zstd(w) => w,
        }
    }

    fn finish(self) -> Result<BufWriter<File>> {
        match self {
            Payload::Raw(w) => Ok(w),
            #[cfg(feature = "lz4-compression")]
            Payload::Lz4(w) => {
                let (inner, result) = w.finish();
                result?;
                Ok(inner)
            }
            #[cfg(feature = "zstd-compression")]
            Payload::Zstd(w) => Ok(w.finish()?),
        }
    }
}

/// Writes records of one finalized schema to a file.
///
/// The record count may be declared up front or deferred; a deferred count
/// is stored in a trailer by [`PrtWriter::finish`]. A declared count that
/// does not match the number of records written is a consistency error.
pub struct PrtWriter {
    path: PathBuf,
    schema: Schema,
    declared: Option<u64>,
    written: u64,
    payload: Option<Payload>,
    scratch: Vec<u8>,
}

impl PrtWriter {
    /// Create (or truncate) `path` and write the header
    pub fn create(
        path: impl AsRef<Path>,
        schema: &Schema,
        count: Option<u64>,
        options: PrtWriterOptions,
    ) -> Result<Self> {
        if !schema.is_finalized() {
            return Err(Error::InvalidArgument(
                "files can only be written with a finalized schema".to_string(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::with_capacity(options.buffer_size, File::create(&path)?);
        FileHeader::write_to(&mut file, schema, count, options.compression, &options.metadata)?;

        let payload = match options.compression {
            Compression::None => Payload::Raw(file),
            #[cfg(feature = "lz4-compression")]
            Compression::Lz4 => Payload::Lz4(lz4::EncoderBuilder::new().build(file)?),
            #[cfg(feature = "zstd-compression")]
            Compression::Zstd => Payload::Zstd(zstd::stream::write::Encoder::new(file, options.compression_level)?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(Error::Unsupported(format!(
                    "{other:?} compression (enable the matching crate feature)"
                )))
            }
        };

        debug!(path = %path.display(), schema = %schema, count = ?count, "created particle file");
        Ok(Self {
            path,
            schema: schema.clone(),
            declared: count,
            written: 0,
            payload: Some(payload),
            scratch: Vec::new(),
        })
    }

    /// Number of records written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write one record in the writer's schema
    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != self.schema.record_size() {
            return Err(Error::InvalidArgument(format!(
                "record has {} bytes, layout needs {}",
                record.len(),
                self.schema.record_size()
            )));
        }
        self.write_records(record, 1)
    }

    fn write_records(&mut self, records: &[u8], count: usize) -> Result<()> {
        let payload = self
            .payload
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("writer already finished".to_string()))?;

        if cfg!(target_endian = "little") {
            payload.writer().write_all(records)?;
        } else {
            self.scratch.clear();
            self.scratch.extend_from_slice(records);
            swap_little_endian(&self.schema, &mut self.scratch);
            payload.writer().write_all(&self.scratch)?;
        }
        self.written += count as u64;
        Ok(())
    }

    /// Complete the payload and, for a deferred count, write the trailer.
    ///
    /// Fails with a consistency error when a declared count was not met.
    pub fn finish(&mut self) -> Result<u64> {
        let payload = self
            .payload
            .take()
            .ok_or_else(|| Error::InvalidOperation("writer already finished".to_string()))?;
        let mut file = payload.finish()?;

        match self.declared {
            Some(declared) if declared != self.written => {
                file.flush()?;
                return Err(Error::Consistency(format!(
                    "{} declares {declared} records but {} were written",
                    self.path.display(),
                    self.written
                )));
            }
            Some(_) => {}
            None => {
                file.write_all(&self.written.to_le_bytes())?;
                file.write_all(&TRAILER_MAGIC)?;
            }
        }
        file.flush()?;

        info!(path = %self.path.display(), records = self.written, "finished particle file");
        Ok(self.written)
    }
}

impl ParticleSink for PrtWriter {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn consume(&mut self, records: &[u8], count: usize) -> Result<()> {
        self.write_records(records, count)
    }

    fn flush(&mut self) -> Result<()> {
        self.finish().map(|_| ())
    }
}

/// Write every remaining record of `stream` to a new file at `path`
pub fn write_stream(
    path: impl AsRef<Path>,
    stream: &mut dyn ParticleStream,
    progress: &dyn ProgressSink,
    options: PrtWriterOptions,
) -> Result<u64> {
    let schema = stream.schema().clone();
    let mut writer = PrtWriter::create(path, &schema, stream.remaining(), options)?;
    drain(stream, &mut writer, progress, DEFAULT_BATCH_SIZE)
}
