//! Sequential concatenation of several streams

use partstream_core::{Error, ParticleStream, Result, Schema};

/// Yields every record of each child in turn.
///
/// The native layout is the union of the children's; a child lacking a
/// requested channel fills it from the default record. Errors from a child
/// propagate unchanged, so each child's own failure policy applies.
pub struct ConcatenatedStream {
    children: Vec<Box<dyn ParticleStream>>,
    native: Schema,
    requested: Schema,
    current: usize,
    position: u64,
}

impl ConcatenatedStream {
    /// Concatenate `children` in order
    pub fn new(children: Vec<Box<dyn ParticleStream>>) -> Self {
        let native = children
            .iter()
            .fold(Schema::empty(), |acc, child| acc.union(child.native_schema()));
        Self {
            requested: native.clone(),
            native,
            children,
            current: 0,
            position: 0,
        }
    }

    /// Number of child streams
    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

impl ParticleStream for ConcatenatedStream {
    fn name(&self) -> &str {
        "concatenated"
    }

    fn schema(&self) -> &Schema {
        &self.requested
    }

    fn native_schema(&self) -> &Schema {
        &self.native
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        for child in &mut self.children {
            child.set_schema(requested)?;
        }
        self.requested = requested.clone();
        Ok(())
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.set_default_record(record)?;
        }
        Ok(())
    }

    fn next(&mut self, record: &mut [u8]) -> Result<bool> {
        while let Some(child) = self.children.get_mut(self.current) {
            if child.next(record)? {
                self.position += 1;
                return Ok(true);
            }
            self.current += 1;
        }
        Ok(false)
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
        while filled < capacity {
            let Some(child) = self.children.get_mut(self.current) else {
                break;
            };
            let wanted = capacity - filled;
            let count = child.next_batch(&mut buffer[filled * size..capacity * size])?;
            filled += count;
            if count < wanted {
                self.current += 1;
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }

    fn count(&self) -> Option<u64> {
        self.children.iter().map(|child| child.count()).sum()
    }

    fn position(&self) -> u64 {
        self.position
    }
}
