//! Concurrent concatenation with bounded prefetch

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use partstream_core::stream::check_default_record;
use partstream_core::{Error, ParticleStream, Result, Schema, DEFAULT_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Configuration for parallel concatenation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConcatConfig {
    /// Maximum number of reader threads
    pub max_threads: usize,

    /// Batches buffered ahead of the consumer
    pub prefetch_batches: usize,

    /// Records per prefetched batch
    pub batch_size: usize,
}

impl Default for ParallelConcatConfig {
    fn default() -> Self {
        Self {
            max_threads: num_cpus::get(),
            prefetch_batches: 4,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

enum Message {
    Batch { records: Vec<u8>, count: usize },
    Failed(Error),
}

struct Running {
    receiver: Receiver<Message>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

/// Reads several streams at once on dedicated threads.
///
/// Every child's own record order is kept, but batches from different
/// children interleave in whatever order they finish. Use
/// `ConcatenatedStream` from the readers crate when the global order matters.
///
/// Reader threads start on the first pull; the layout and default record
/// must be set before that.
pub struct ParallelConcatStream {
    pending: Vec<Box<dyn ParticleStream>>,
    native: Schema,
    requested: Schema,
    default_record: Option<Vec<u8>>,
    count: Option<u64>,
    config: ParallelConcatConfig,
    running: Option<Running>,
    current: Vec<u8>,
    current_count: usize,
    cursor: usize,
    position: u64,
    finished: bool,
}

impl ParallelConcatStream {
    /// Concatenate `children` with the given prefetch configuration
    pub fn new(children: Vec<Box<dyn ParticleStream>>, config: ParallelConcatConfig) -> Self {
        let native = children
            .iter()
            .fold(Schema::empty(), |acc, child| acc.union(child.native_schema()));
        let count = children.iter().map(|child| child.count()).sum();
        Self {
            requested: native.clone(),
            native,
            pending: children,
            default_record: None,
            count,
            config,
            running: None,
            current: Vec::new(),
            current_count: 0,
            cursor: 0,
            position: 0,
            finished: false,
        }
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.running.is_some() || self.finished {
            return Ok(());
        }

        let children = std::mem::take(&mut self.pending);
        let (work_tx, work_rx) = channel::unbounded();
        let threads = self.config.max_threads.clamp(1, children.len().max(1));
        for child in children {
            // The receiver is alive, so this cannot fail
            let _ = work_tx.send(child);
        }
        drop(work_tx);

        let (batch_tx, batch_rx) = channel::bounded(self.config.prefetch_batches.max(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker = Worker {
                work: work_rx.clone(),
                batches: batch_tx.clone(),
                cancel: Arc::clone(&cancel),
                schema: self.requested.clone(),
                default_record: self.default_record.clone(),
                batch_size: self.config.batch_size.max(1),
            };
            let handle = thread::Builder::new()
                .name(format!("partstream-concat-{i}"))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        debug!(threads, prefetch = self.config.prefetch_batches, "started parallel concatenation");

        self.running = Some(Running {
            receiver: batch_rx,
            handles,
            cancel,
        });
        Ok(())
    }

    /// Make sure the current batch has unread records; `false` at the end
    fn refill(&mut self) -> Result<bool> {
        if self.cursor < self.current_count {
            return Ok(true);
        }
        self.ensure_started()?;

        loop {
            let message = match &self.running {
                Some(running) => running.receiver.recv(),
                None => return Ok(false),
            };
            match message {
                Ok(Message::Batch { records, count }) if count > 0 => {
                    self.current = records;
                    self.current_count = count;
                    self.cursor = 0;
                    return Ok(true);
                }
                Ok(Message::Batch { .. }) => {}
                Ok(Message::Failed(e)) => {
                    self.shutdown();
                    self.finished = true;
                    return Err(e);
                }
                // Every worker has hung up
                Err(_) => {
                    self.shutdown();
                    self.finished = true;
                    return Ok(false);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.store(true, Ordering::Release);
        drop(running.receiver);
        for handle in running.handles {
            if handle.join().is_err() {
                warn!("a concatenation reader thread panicked");
            }
        }
    }
}

impl ParticleStream for ParallelConcatStream {
    fn name(&self) -> &str {
        "parallel-concatenated"
    }

    fn schema(&self) -> &Schema {
        &self.requested
    }

    fn native_schema(&self) -> &Schema {
        &self.native
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        if *requested == self.requested {
            return Ok(());
        }
        if self.running.is_some() || self.position > 0 {
            return Err(Error::InvalidOperation(
                "cannot change the layout of a concatenation that has started reading".to_string(),
            ));
        }
        for child in &mut self.pending {
            child.set_schema(requested)?;
        }
        self.requested = requested.clone();
        self.default_record = None;
        Ok(())
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidOperation(
                "cannot change the default record of a concatenation that has started reading".to_string(),
            ));
        }
        check_default_record(record, &self.requested)?;
        for child in &mut self.pending {
            child.set_default_record(record)?;
        }
        self.default_record = Some(record.to_vec());
        Ok(())
    }

    fn next(&mut self, record: &mut [u8]) -> Result<bool> {
        if !self.refill()? {
            return Ok(false);
        }
        let size = self.requested.record_size();
        let start = self.cursor * size;
        record.copy_from_slice(&self.current[start..start + size]);
        self.cursor += 1;
        self.position += 1;
        Ok(true)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let size = self.requested.record_size();
        if size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }

        let capacity = buffer.len() / size;
        let mut filled = 0;
        while filled < capacity && self.refill()? {
            let take = (capacity - filled).min(self.current_count - self.cursor);
            let src = &self.current[self.cursor * size..(self.cursor + take) * size];
            buffer[filled * size..(filled + take) * size].copy_from_slice(src);
            self.cursor += take;
            filled += take;
        }
        self.position += filled as u64;
        Ok(filled)
    }

    fn count(&self) -> Option<u64> {
        self.count
    }

    fn position(&self) -> u64 {
        self.position
    }
}

impl Drop for ParallelConcatStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One reader thread: takes children from the shared queue until it is
/// empty, pushing their records as batches
struct Worker {
    work: Receiver<Box<dyn ParticleStream>>,
    batches: Sender<Message>,
    cancel: Arc<AtomicBool>,
    schema: Schema,
    default_record: Option<Vec<u8>>,
    batch_size: usize,
}

impl Worker {
    fn run(self) {
        while let Ok(mut child) = self.work.try_recv() {
            trace!(child = child.name(), "reading child stream");
            if let Err(e) = self.read_child(child.as_mut()) {
                if !matches!(e, Error::Cancelled) {
                    let _ = self.batches.send(Message::Failed(e));
                }
                return;
            }
        }
    }

    fn read_child(&self, child: &mut dyn ParticleStream) -> Result<()> {
        if child.schema() != &self.schema {
            child.set_schema(&self.schema)?;
            if let Some(record) = &self.default_record {
                child.set_default_record(record)?;
            }
        }

        let size = self.schema.record_size();
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }

            let (records, count) = if size == 0 {
                let mut count = 0;
                while count < self.batch_size && child.next(&mut [])? {
                    count += 1;
                }
                (Vec::new(), count)
            } else {
                let mut records = vec![0u8; self.batch_size * size];
                let count = child.next_batch(&mut records)?;
                records.truncate(count * size);
                (records, count)
            };

            let exhausted = count < self.batch_size;
            if count > 0 && self.batches.send(Message::Batch { records, count }).is_err() {
                // Consumer is gone
                return Err(Error::Cancelled);
            }
            if exhausted {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_core::{Channel, NullProgress, ParticleArray};
    use partstream_readers::{ArrayStream, ConcatenatedStream};
    use std::collections::BTreeMap;

    fn child(tag: u32, len: u32) -> Box<dyn ParticleStream> {
        let schema = Schema::new(vec![Channel::of::<[u32; 2]>("Tag")]).unwrap();
        let tag_accessor = schema.get_accessor::<[u32; 2]>("Tag").unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for i in 0..len {
            let mut record = schema.default_record();
            tag_accessor.set(&mut record, [tag, i]);
            array.push(&record).unwrap();
        }
        Box::new(ArrayStream::from_array(array))
    }

    fn small_batches() -> ParallelConcatConfig {
        ParallelConcatConfig {
            max_threads: 3,
            prefetch_batches: 2,
            batch_size: 7,
        }
    }

    fn read_tags(stream: &mut dyn ParticleStream) -> Vec<[u32; 2]> {
        let array = ParticleArray::from_stream(stream, &NullProgress).unwrap();
        let tag = array.schema().get_accessor::<[u32; 2]>("Tag").unwrap();
        array.iter().map(|r| tag.get(r)).collect()
    }

    #[test]
    fn test_same_records_as_sequential() {
        let lens = [40, 0, 13, 25];
        let children = || lens.iter().enumerate().map(|(t, &n)| child(t as u32, n)).collect::<Vec<_>>();

        let mut sequential = ConcatenatedStream::new(children());
        let mut parallel = ParallelConcatStream::new(children(), small_batches());
        assert_eq!(parallel.count(), Some(78));

        let mut expected = read_tags(&mut sequential);
        let mut actual = read_tags(&mut parallel);
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(actual, expected);
        assert_eq!(parallel.position(), 78);
    }

    #[test]
    fn test_each_child_keeps_its_order() {
        let children = (0..4).map(|t| child(t, 30)).collect();
        let mut stream = ParallelConcatStream::new(children, small_batches());

        let mut per_child: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for [tag, i] in read_tags(&mut stream) {
            per_child.entry(tag).or_default().push(i);
        }
        for sequence in per_child.values() {
            assert_eq!(*sequence, (0..30).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_schema_fixed_after_start() {
        let mut stream = ParallelConcatStream::new(vec![child(0, 20)], small_batches());
        let mut record = vec![0u8; stream.schema().record_size()];
        assert!(stream.next(&mut record).unwrap());

        let schema = stream.schema().clone();
        assert!(stream.set_schema(&schema).is_ok());
        let other = Schema::new(vec![Channel::of::<[u32; 2]>("Other")]).unwrap();
        assert!(stream.set_schema(&other).is_err());
    }

    #[test]
    fn test_drop_while_readers_blocked() {
        let children = (0..3).map(|t| child(t, 500)).collect();
        let mut stream = ParallelConcatStream::new(children, small_batches());
        let mut record = vec![0u8; stream.schema().record_size()];
        assert!(stream.next(&mut record).unwrap());
        drop(stream);
    }

    struct Failing;

    impl ParticleStream for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn schema(&self) -> &Schema {
            static EMPTY: std::sync::OnceLock<Schema> = std::sync::OnceLock::new();
            EMPTY.get_or_init(|| Schema::new(vec![Channel::of::<[u32; 2]>("Tag")]).unwrap())
        }
        fn native_schema(&self) -> &Schema {
            self.schema()
        }
        fn set_schema(&mut self, _requested: &Schema) -> Result<()> {
            Ok(())
        }
        fn set_default_record(&mut self, _record: &[u8]) -> Result<()> {
            Ok(())
        }
        fn next(&mut self, _record: &mut [u8]) -> Result<bool> {
            Err(Error::Format("corrupt".to_string()))
        }
        fn count(&self) -> Option<u64> {
            None
        }
        fn position(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_child_failure_propagates() {
        let mut stream = ParallelConcatStream::new(vec![child(0, 5), Box::new(Failing)], small_batches());
        assert_eq!(stream.count(), None);
        let err = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
