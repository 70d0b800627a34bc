//! Sink trait for consuming particle records

use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::schema::Schema;
use crate::stream::ParticleStream;

/// A consumer of records in a fixed layout
pub trait ParticleSink {
    /// Layout of the records this sink accepts
    fn schema(&self) -> &Schema;

    /// Consume `count` contiguous records
    fn consume(&mut self, records: &[u8], count: usize) -> Result<()>;

    /// Flush any buffered records and finalize
    fn flush(&mut self) -> Result<()>;
}

/// Move every remaining record of `stream` into `sink`, returning the count.
///
/// Cancellation is polled before each batch of `batch_size` records.
pub fn drain<K: ParticleSink + ?Sized>(
    stream: &mut dyn ParticleStream,
    sink: &mut K,
    progress: &dyn ProgressSink,
    batch_size: usize,
) -> Result<u64> {
    if stream.schema() != sink.schema() {
        return Err(Error::SchemaMismatch(format!(
            "stream '{}' produces {} but the sink expects {}",
            stream.name(),
            stream.schema(),
            sink.schema()
        )));
    }

    let size = stream.schema().record_size();
    let total = stream.count();
    let mut done = 0u64;

    if size == 0 {
        loop {
            if done % batch_size as u64 == 0 {
                progress.check()?;
            }
            if !stream.next(&mut [])? {
                break;
            }
            sink.consume(&[], 1)?;
            done += 1;
        }
    } else {
        let batch_size = batch_size.max(1);
        let mut buffer = vec![0u8; batch_size * size];
        loop {
            progress.check()?;
            let count = stream.next_batch(&mut buffer)?;
            sink.consume(&buffer[..count * size], count)?;
            done += count as u64;
            progress.update(done, total);
            if count < batch_size {
                break;
            }
        }
    }

    sink.flush()?;
    Ok(done)
}
