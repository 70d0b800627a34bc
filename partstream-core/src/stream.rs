//! The pull-based particle stream abstraction

use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::Schema;

/// Default number of records moved per batch pull
pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// A stateful cursor over fixed-layout particle records.
///
/// Every stream has a *native* schema (the channels it can produce without
/// help) and a *requested* schema (the layout it writes into caller buffers).
/// Negotiation happens once, before the first pull, through
/// [`ParticleStream::set_schema`].
pub trait ParticleStream: Send {
    /// Short name used in log messages
    fn name(&self) -> &str;

    /// The currently requested layout
    fn schema(&self) -> &Schema;

    /// Channels this stream can produce
    fn native_schema(&self) -> &Schema;

    /// Choose the layout of records written by `next`/`next_batch`.
    ///
    /// Calling this again with an equal schema is a no-op. Accessors bound
    /// before the call are invalidated.
    fn set_schema(&mut self, requested: &Schema) -> Result<()>;

    /// Provide values, in the requested layout, for channels nothing in the
    /// chain writes
    fn set_default_record(&mut self, record: &[u8]) -> Result<()>;

    /// Fill one record; returns `false` once the stream is exhausted
    fn next(&mut self, record: &mut [u8]) -> Result<bool>;

    /// Fill as many whole records of `buffer` as possible and return how many
    /// were written.
    ///
    /// A result smaller than the buffer's capacity means the stream is
    /// exhausted. Records arrive in the same order repeated `next` calls
    /// would produce.
    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let size = self.schema().record_size();
        if size == 0 {
            return Err(Error::InvalidOperation(format!(
                "stream '{}' has zero-sized records and cannot be read in batches",
                self.name()
            )));
        }

        let mut filled = 0;
        for record in buffer.chunks_exact_mut(size) {
            if !self.next(record)? {
                break;
            }
            filled += 1;
        }
        Ok(filled)
    }

    /// Total number of records, when known up front
    fn count(&self) -> Option<u64>;

    /// Number of records emitted so far
    fn position(&self) -> u64;

    /// Records still to come, when known
    fn remaining(&self) -> Option<u64> {
        self.count().map(|count| count.saturating_sub(self.position()))
    }
}

impl<S: ParticleStream + ?Sized> ParticleStream for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn schema(&self) -> &Schema {
        (**self).schema()
    }

    fn native_schema(&self) -> &Schema {
        (**self).native_schema()
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        (**self).set_schema(requested)
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        (**self).set_default_record(record)
    }

    fn next(&mut self, record: &mut [u8]) -> Result<bool> {
        (**self).next(record)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        (**self).next_batch(buffer)
    }

    fn count(&self) -> Option<u64> {
        (**self).count()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn remaining(&self) -> Option<u64> {
        (**self).remaining()
    }
}

/// Negotiate `requested` on a fully assembled chain, failing fast.
///
/// Every requested channel must be native to the chain unless a default
/// record is supplied; otherwise `ChannelMissing` is returned before any
/// record is pulled.
pub fn negotiate<S: ParticleStream + ?Sized>(
    stream: &mut S,
    requested: &Schema,
    defaults: Option<&[u8]>,
) -> Result<()> {
    match defaults {
        Some(record) if record.len() != requested.record_size() => {
            return Err(Error::InvalidArgument(format!(
                "default record has {} bytes, layout needs {}",
                record.len(),
                requested.record_size()
            )));
        }
        Some(_) => {}
        None => {
            let native = stream.native_schema();
            if let Some(missing) = requested.channels().iter().find(|c| !native.has_channel(c.name())) {
                return Err(Error::ChannelMissing(format!(
                    "{} (not produced by '{}')",
                    missing.name(),
                    stream.name()
                )));
            }
        }
    }

    stream.set_schema(requested)?;
    if let Some(record) = defaults {
        stream.set_default_record(record)?;
    }
    debug!(stream = stream.name(), schema = %requested, "negotiated stream layout");
    Ok(())
}

/// Check that a default record matches a layout's size
pub fn check_default_record(record: &[u8], schema: &Schema) -> Result<()> {
    if record.len() == schema.record_size() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "default record has {} bytes, layout {} needs {}",
            record.len(),
            schema,
            schema.record_size()
        )))
    }
}
