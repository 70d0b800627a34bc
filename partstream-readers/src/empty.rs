//! A stream that yields nothing

use partstream_core::stream::check_default_record;
use partstream_core::{ParticleStream, Result, Schema};

/// Zero-record stream standing in for "no data"
#[derive(Debug, Clone)]
pub struct EmptyStream {
    native: Schema,
    requested: Schema,
}

impl EmptyStream {
    /// An empty stream that claims to produce the given channels
    pub fn new(native: Schema) -> Self {
        Self {
            requested: native.clone(),
            native,
        }
    }

    /// An empty stream with no channels
    pub fn bare() -> Self {
        Self::new(Schema::empty())
    }
}

impl ParticleStream for EmptyStream {
    fn name(&self) -> &str {
        "empty"
    }

    fn schema(&self) -> &Schema {
        &self.requested
    }

    fn native_schema(&self) -> &Schema {
        &self.native
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        self.requested = requested.clone();
        Ok(())
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        check_default_record(record, &self.requested)
    }

    fn next(&mut self, _record: &mut [u8]) -> Result<bool> {
        Ok(false)
    }

    fn next_batch(&mut self, _buffer: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn count(&self) -> Option<u64> {
        Some(0)
    }

    fn position(&self) -> u64 {
        0
    }
}
