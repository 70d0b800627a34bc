//! File-backed particle stream

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use partstream_core::stream::check_default_record;
use partstream_core::{Error, ParticleStream, Result, Schema, SchemaAdaptor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::header::{swap_little_endian, Compression, FileHeader, FileMetadata, TRAILER_LEN, TRAILER_MAGIC};
use crate::empty::EmptyStream;

/// How a file stream reacts to missing or corrupt data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadPolicy {
    /// Any problem is an error
    #[default]
    Strict,

    /// Problems are logged; the stream ends early or is replaced by an
    /// empty one
    Lenient,
}

/// Options for opening particle files
#[derive(Debug, Clone)]
pub struct PrtReaderOptions {
    /// Failure policy
    pub policy: LoadPolicy,

    /// Buffer size for file I/O
    pub buffer_size: usize,
}

impl Default for PrtReaderOptions {
    fn default() -> Self {
        Self {
            policy: LoadPolicy::Strict,
            buffer_size: 256 * 1024, // 256KB
        }
    }
}

/// Sequential reader over one particle file.
///
/// Not restartable: reopen the file to read it again.
pub struct PrtFileStream {
    path: PathBuf,
    header: FileHeader,
    reader: Box<dyn Read + Send>,
    policy: LoadPolicy,
    count: Option<u64>,
    requested: Schema,
    adaptor: SchemaAdaptor,
    default_record: Vec<u8>,
    raw: Vec<u8>,
    position: u64,
    finished: bool,
}

impl PrtFileStream {
    /// Open a file and parse its header
    pub fn open(path: impl AsRef<Path>, options: PrtReaderOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::open_inner(&path, &options).map_err(|e| match e {
            Error::Source { .. } => e,
            other => Error::unreadable(&path, other.to_string()),
        })
    }

    fn open_inner(path: &Path, options: &PrtReaderOptions) -> Result<Self> {
        let mut file = BufReader::with_capacity(options.buffer_size, File::open(path)?);
        let header = FileHeader::read_from(&mut file)?;
        let file_len = file.get_ref().metadata()?.len();

        let mut data_len = file_len.saturating_sub(header.header_len);
        let mut count = header.count;
        if count.is_none() {
            match read_trailer(&mut file, file_len) {
                Ok(stored) => {
                    count = Some(stored);
                    data_len = data_len.saturating_sub(TRAILER_LEN);
                }
                Err(e) if options.policy == LoadPolicy::Lenient => {
                    warn!(path = %path.display(), error = %e, "missing trailer, reading to end of file");
                }
                Err(e) => return Err(e),
            }
            file.seek(SeekFrom::Start(header.header_len))?;
        }

        let payload = file.take(data_len);
        let reader: Box<dyn Read + Send> = match header.compression {
            Compression::None => Box::new(payload),
            #[cfg(feature = "lz4-compression")]
            Compression::Lz4 => Box::new(lz4::Decoder::new(payload)?),
            #[cfg(feature = "zstd-compression")]
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(payload)?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(Error::Unsupported(format!(
                    "{other:?} compression (enable the matching crate feature)"
                )))
            }
        };

        debug!(
            path = %path.display(),
            schema = %header.schema,
            count = ?count,
            compression = ?header.compression,
            "opened particle file"
        );

        let native = header.schema.clone();
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            policy: options.policy,
            count,
            adaptor: SchemaAdaptor::identity(&native),
            default_record: native.default_record(),
            requested: native,
            raw: Vec::new(),
            header,
            position: 0,
            finished: false,
        })
    }

    /// Path of the file being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata stored in the file header
    pub fn metadata(&self) -> &FileMetadata {
        &self.header.metadata
    }

    /// Payload compression of the file
    pub fn compression(&self) -> Compression {
        self.header.compression
    }

    /// Read up to `wanted` stored records into `self.raw`, in native byte
    /// order, returning how many arrived
    fn read_raw(&mut self, wanted: usize) -> Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let wanted = match self.count {
            Some(count) => wanted.min(count.saturating_sub(self.position) as usize),
            None => wanted,
        };
        let size = self.header.schema.record_size();
        if size == 0 {
            // Nothing to read; only a known count can produce records
            let records = if self.count.is_some() { wanted } else { 0 };
            if records == 0 {
                self.finished = true;
            }
            return Ok(records);
        }

        self.raw.resize(wanted * size, 0);
        let mut filled = 0;
        let mut failure = None;
        while filled < self.raw.len() {
            match self.reader.read(&mut self.raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(format!("read failed after {} records: {e}", self.position));
                    break;
                }
            }
        }

        let records = filled / size;
        if failure.is_none() && records < wanted {
            if let Some(count) = self.count {
                failure = Some(format!(
                    "file ended after {} of {count} records",
                    self.position + records as u64
                ));
            } else if filled % size != 0 {
                failure = Some("file ends inside a record".to_string());
            }
        }
        if records < wanted {
            self.finished = true;
        }

        if let Some(message) = failure {
            match self.policy {
                LoadPolicy::Strict => return Err(Error::unreadable(&self.path, message)),
                LoadPolicy::Lenient => {
                    warn!(path = %self.path.display(), "{message}; ending stream early");
                    self.finished = true;
                }
            }
        }

        swap_little_endian(&self.header.schema, &mut self.raw[..records * size]);
        Ok(records)
    }
}

impl ParticleStream for PrtFileStream {
    fn name(&self) -> &str {
        "file"
    }

    fn schema(&self) -> &Schema {
        &self.requested
    }

    fn native_schema(&self) -> &Schema {
        &self.header.schema
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        if *requested == self.requested {
            return Ok(());
        }
        self.adaptor = SchemaAdaptor::new(requested, &self.header.schema)?;
        self.requested = requested.clone();
        self.default_record = requested.default_record();
        Ok(())
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        check_default_record(record, &self.requested)?;
        self.default_record.copy_from_slice(record);
        Ok(())
    }

    fn next(&mut self, record: &mut [u8]) -> Result<bool> {
        if self.read_raw(1)? == 0 {
            return Ok(false);
        }
        record.copy_from_slice(&self.default_record);
        self.adaptor.copy(record, &self.raw);
        self.position += 1;
        Ok(true)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let dest_size = self.requested.record_size();
        if dest_size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }

        let count = self.read_raw(buffer.len() / dest_size)?;
        self.adaptor.copy_batch(buffer, &self.raw, count, Some(&self.default_record));
        self.position += count as u64;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        self.count
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Open a file as a boxed stream, applying the load policy to open failures.
///
/// Under [`LoadPolicy::Lenient`] an unreadable file becomes an empty stream
/// with no channels and a warning is logged.
pub fn open_stream(path: impl AsRef<Path>, options: PrtReaderOptions) -> Result<Box<dyn ParticleStream>> {
    let path = path.as_ref();
    let policy = options.policy;
    match PrtFileStream::open(path, options) {
        Ok(stream) => Ok(Box::new(stream)),
        Err(e) if policy == LoadPolicy::Lenient => {
            warn!(path = %path.display(), error = %e, "substituting an empty stream");
            Ok(Box::new(EmptyStream::bare()))
        }
        Err(e) => Err(e),
    }
}

fn read_trailer<R: Read + Seek>(file: &mut R, file_len: u64) -> Result<u64> {
    if file_len < TRAILER_LEN {
        return Err(Error::Format("file too short for a trailer".to_string()));
    }
    file.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
    let mut trailer = [0u8; TRAILER_LEN as usize];
    file.read_exact(&mut trailer)?;
    if trailer[8..] != TRAILER_MAGIC {
        return Err(Error::Format("deferred record count has no trailer".to_string()));
    }
    let mut count = [0u8; 8];
    count.copy_from_slice(&trailer[..8]);
    Ok(u64::from_le_bytes(count))
}
