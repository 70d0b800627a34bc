//! File header layout for particle stream files
//!
//! All header fields are little-endian:
//!
//! | Field | Size |
//! |---|---|
//! | magic | 8 |
//! | header length, including magic | 4 |
//! | signature, NUL padded | 32 |
//! | version | 4 |
//! | record count, `-1` when stored in the trailer | 8 |
//! | compression code + 3 reserved bytes | 4 |
//! | channel count | 4 |
//! | per channel: name (32, NUL padded), type code, arity, offset | 44 |
//! | metadata length + bincode metadata | 4 + n |
//!
//! When the count is deferred the payload is followed by a trailer holding
//! the count (`u64`) and [`TRAILER_MAGIC`].

use std::collections::BTreeMap;
use std::io::{Read, Write};

use partstream_core::{DataType, Error, Result, Schema};
use serde::{Deserialize, Serialize};

/// Leading bytes of every particle stream file
pub const MAGIC: [u8; 8] = *b"\xC0PSF\r\n\x1A\n";

/// Human-readable signature stored after the header length
pub const SIGNATURE: &[u8] = b"Particle Stream Format";

/// Newest format version this crate reads and the one it writes
pub const VERSION: u32 = 1;

/// Closing bytes of the trailer written for deferred counts
pub const TRAILER_MAGIC: [u8; 8] = *b"PSFEND\0\0";

/// Size of the trailer in bytes
pub const TRAILER_LEN: u64 = 16;

const NAME_LEN: usize = 32;
const FIXED_LEN: usize = 8 + 4 + NAME_LEN + 4 + 8 + 4 + 4;
const UNKNOWN_COUNT: i64 = -1;

/// Record payload compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Raw records
    None,

    /// LZ4 frame format
    #[default]
    Lz4,

    /// Zstandard stream
    Zstd,
}

impl Compression {
    fn code(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Zstd),
            other => Err(Error::Format(format!("unknown compression code {other}"))),
        }
    }
}

/// Free-form information stored alongside the records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Frames per second of the sequence the file belongs to
    pub frame_rate: Option<f64>,

    /// Unit of length for positions (e.g. `"meters"`)
    pub length_unit: Option<String>,

    /// Additional key/value pairs
    pub properties: BTreeMap<String, String>,
}

/// Parsed file header
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    /// Layout of stored records
    pub schema: Schema,

    /// Number of records, if it was known when the header was written
    pub count: Option<u64>,

    /// Payload compression
    pub compression: Compression,

    /// File metadata
    pub metadata: FileMetadata,

    /// Total header size in bytes; the payload starts here
    pub header_len: u64,
}

impl FileHeader {
    /// Serialize the header, returning its length
    pub fn write_to<W: Write>(
        writer: &mut W,
        schema: &Schema,
        count: Option<u64>,
        compression: Compression,
        metadata: &FileMetadata,
    ) -> Result<u64> {
        let metadata_bytes = bincode::serialize(metadata)?;
        let header_len = FIXED_LEN + schema.len() * (NAME_LEN + 12) + 4 + metadata_bytes.len();

        let mut buf = Vec::with_capacity(header_len);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&to_u32(header_len)?.to_le_bytes());
        buf.extend_from_slice(&padded_name(SIGNATURE)?);
        buf.extend_from_slice(&VERSION.to_le_bytes());

        let count = match count {
            Some(count) => i64::try_from(count)
                .map_err(|_| Error::InvalidArgument(format!("record count {count} too large")))?,
            None => UNKNOWN_COUNT,
        };
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&[compression.code(), 0, 0, 0]);

        // Channel table
        buf.extend_from_slice(&to_u32(schema.len())?.to_le_bytes());
        for channel in schema.channels() {
            buf.extend_from_slice(&padded_name(channel.name().as_bytes())?);
            buf.extend_from_slice(&channel.data_type().code().to_le_bytes());
            buf.extend_from_slice(&to_u32(channel.arity())?.to_le_bytes());
            buf.extend_from_slice(&to_u32(channel.offset())?.to_le_bytes());
        }

        buf.extend_from_slice(&to_u32(metadata_bytes.len())?.to_le_bytes());
        buf.extend_from_slice(&metadata_bytes);
        debug_assert_eq!(buf.len(), header_len);

        writer.write_all(&buf)?;
        Ok(header_len as u64)
    }

    /// Parse a header from the start of a file
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut prefix = [0u8; 12];
        reader.read_exact(&mut prefix)?;
        if prefix[..8] != MAGIC {
            return Err(Error::Format("not a particle stream file (bad magic)".to_string()));
        }
        let header_len = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as usize;
        if header_len < FIXED_LEN + 4 {
            return Err(Error::Format(format!("header length {header_len} is too small")));
        }

        let mut body = vec![0u8; header_len - prefix.len()];
        reader.read_exact(&mut body)?;
        let mut cursor = Cursor::new(&body);

        let signature = cursor.take(NAME_LEN)?;
        if unpad(signature) != SIGNATURE {
            return Err(Error::Format("unrecognised file signature".to_string()));
        }
        let version = cursor.u32()?;
        if version == 0 || version > VERSION {
            return Err(Error::Unsupported(format!("file format version {version}")));
        }

        let count = match cursor.i64()? {
            UNKNOWN_COUNT => None,
            n if n < 0 => return Err(Error::Format(format!("negative record count {n}"))),
            n => Some(n as u64),
        };
        let compression = Compression::from_code(cursor.take(4)?[0])?;

        // Channel table
        let channel_count = cursor.u32()? as usize;
        let mut schema = Schema::default();
        for _ in 0..channel_count {
            let name = std::str::from_utf8(unpad(cursor.take(NAME_LEN)?))
                .map_err(|_| Error::Format("channel name is not UTF-8".to_string()))?
                .to_string();
            let code = cursor.u32()?;
            let data_type = DataType::from_code(code)
                .ok_or_else(|| Error::Format(format!("channel '{name}' has unknown type code {code}")))?;
            let arity = cursor.u32()? as usize;
            let offset = cursor.u32()? as usize;

            if offset != schema.record_size() {
                return Err(Error::Format(format!(
                    "channel '{name}' at offset {offset}, expected packed offset {}",
                    schema.record_size()
                )));
            }
            schema.define_channel(&name, arity, data_type)?;
        }
        schema.end_definition();

        let metadata_len = cursor.u32()? as usize;
        let metadata = bincode::deserialize(cursor.take(metadata_len)?)?;

        Ok(Self {
            schema,
            count,
            compression,
            metadata,
            header_len: header_len as u64,
        })
    }
}

/// Swap every element of `records` between native and little-endian order.
///
/// A no-op on little-endian targets.
pub(crate) fn swap_little_endian(schema: &Schema, records: &mut [u8]) {
    if cfg!(target_endian = "little") || schema.record_size() == 0 {
        return;
    }
    for record in records.chunks_exact_mut(schema.record_size()) {
        for channel in schema.channels() {
            let step = channel.data_type().size_bytes();
            for i in 0..channel.arity() {
                let start = channel.offset() + i * step;
                record[start..start + step].reverse();
            }
        }
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidArgument(format!("{value} does not fit the header")))
}

fn padded_name(name: &[u8]) -> Result<[u8; NAME_LEN]> {
    if name.len() >= NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "name '{}' longer than {} bytes",
            String::from_utf8_lossy(name),
            NAME_LEN - 1
        )));
    }
    let mut out = [0u8; NAME_LEN];
    out[..name.len()].copy_from_slice(name);
    Ok(out)
}

fn unpad(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Bounds-checked reader over the header body
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(Error::Format("header is truncated".to_string()));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}
