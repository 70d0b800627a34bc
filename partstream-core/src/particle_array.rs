//! Dense in-memory particle storage

use std::slice::{ChunksExact, ChunksExactMut};

use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::schema::Schema;
use crate::sink::{drain, ParticleSink};
use crate::stream::{ParticleStream, DEFAULT_BATCH_SIZE};

/// A contiguous array of records sharing one finalized schema
#[derive(Debug, Clone, Default)]
pub struct ParticleArray {
    /// Layout of every record
    schema: Schema,

    /// Packed record bytes
    data: Vec<u8>,

    /// Number of records; tracked separately for zero-sized layouts
    len: usize,
}

impl ParticleArray {
    /// Create an empty array for the given layout
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            data: Vec::new(),
            len: 0,
        }
    }

    /// Create an empty array with room for `capacity` records
    pub fn with_capacity(schema: Schema, capacity: usize) -> Self {
        let data = Vec::with_capacity(capacity * schema.record_size());
        Self { schema, data, len: 0 }
    }

    /// Materialize a stream in its requested layout
    pub fn from_stream(stream: &mut dyn ParticleStream, progress: &dyn ProgressSink) -> Result<Self> {
        let mut array = Self::new(stream.schema().clone());
        if let Some(count) = stream.remaining() {
            array.reserve(usize::try_from(count).unwrap_or(0));
        }
        array.extend_from_stream(stream, progress)?;
        Ok(array)
    }

    /// Get the record layout
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if there are no records
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserve space for `additional` records
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional * self.schema.record_size());
    }

    /// Append one record
    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != self.schema.record_size() {
            return Err(Error::InvalidArgument(format!(
                "record has {} bytes, layout needs {}",
                record.len(),
                self.schema.record_size()
            )));
        }
        self.data.extend_from_slice(record);
        self.len += 1;
        Ok(())
    }

    /// Get a record by index
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        let size = self.schema.record_size();
        (index < self.len).then(|| &self.data[index * size..(index + 1) * size])
    }

    /// Get a mutable record by index
    pub fn get_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let size = self.schema.record_size();
        (index < self.len).then(|| &mut self.data[index * size..(index + 1) * size])
    }

    /// Iterate over records
    pub fn iter(&self) -> ChunksExact<'_, u8> {
        self.data.chunks_exact(self.schema.record_size().max(1))
    }

    /// Iterate mutably over records
    pub fn iter_mut(&mut self) -> ChunksExactMut<'_, u8> {
        let size = self.schema.record_size().max(1);
        self.data.chunks_exact_mut(size)
    }

    /// Raw record bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Remove every record and switch to a new layout
    pub fn reset(&mut self, schema: Schema) {
        self.schema = schema;
        self.data.clear();
        self.len = 0;
    }

    /// Remove every record
    pub fn clear(&mut self) {
        self.data.clear();
        self.len = 0;
    }

    /// Append every remaining record of `stream`.
    ///
    /// The stream must already be negotiated to this array's layout.
    /// Cancellation is polled once per batch; on cancellation or error the
    /// array keeps whatever was appended so far.
    pub fn extend_from_stream(&mut self, stream: &mut dyn ParticleStream, progress: &dyn ProgressSink) -> Result<u64> {
        drain(stream, self, progress, DEFAULT_BATCH_SIZE)
    }
}

impl ParticleSink for ParticleArray {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn consume(&mut self, records: &[u8], count: usize) -> Result<()> {
        debug_assert_eq!(records.len(), count * self.schema.record_size());
        self.data.extend_from_slice(records);
        self.len += count;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
