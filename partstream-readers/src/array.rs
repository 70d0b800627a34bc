//! Stream over a shared in-memory particle array

use std::sync::Arc;

use partstream_core::stream::check_default_record;
use partstream_core::{Error, ParticleArray, ParticleStream, Result, Schema, SchemaAdaptor};

/// Reads records from a [`ParticleArray`] shared read-only with other
/// readers.
///
/// Restarting means creating a new cursor with [`ArrayStream::restart`];
/// the array itself is never copied.
#[derive(Debug)]
pub struct ArrayStream {
    particles: Arc<ParticleArray>,
    requested: Schema,
    adaptor: SchemaAdaptor,
    default_record: Vec<u8>,
    cursor: usize,
}

impl ArrayStream {
    /// Create a stream over a shared array, requesting its native layout
    pub fn new(particles: Arc<ParticleArray>) -> Self {
        let native = particles.schema().clone();
        Self {
            adaptor: SchemaAdaptor::identity(&native),
            default_record: native.default_record(),
            requested: native,
            particles,
            cursor: 0,
        }
    }

    /// Create a stream that owns its array
    pub fn from_array(particles: ParticleArray) -> Self {
        Self::new(Arc::new(particles))
    }

    /// A fresh cursor over the same array, in the same requested layout
    #[must_use]
    pub fn restart(&self) -> Self {
        Self {
            particles: Arc::clone(&self.particles),
            requested: self.requested.clone(),
            adaptor: self.adaptor.clone(),
            default_record: self.default_record.clone(),
            cursor: 0,
        }
    }

    /// The underlying array
    pub fn particles(&self) -> &Arc<ParticleArray> {
        &self.particles
    }
}

impl ParticleStream for ArrayStream {
    fn name(&self) -> &str {
        "array"
    }

    fn schema(&self) -> &Schema {
        &self.requested
    }

    fn native_schema(&self) -> &Schema {
        self.particles.schema()
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        if *requested == self.requested {
            return Ok(());
        }
        self.adaptor = SchemaAdaptor::new(requested, self.particles.schema())?;
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
        let Some(src) = self.particles.get(self.cursor) else {
            return Ok(false);
        };
        if !self.adaptor.is_identity() {
            record.copy_from_slice(&self.default_record);
        }
        self.adaptor.copy(record, src);
        self.cursor += 1;
        Ok(true)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let dest_size = self.requested.record_size();
        if dest_size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }

        let capacity = buffer.len() / dest_size;
        let count = capacity.min(self.particles.len() - self.cursor);
        let src_size = self.particles.schema().record_size();
        let src = &self.particles.as_bytes()[self.cursor * src_size..(self.cursor + count) * src_size];
        self.adaptor.copy_batch(buffer, src, count, Some(&self.default_record));
        self.cursor += count;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        Some(self.particles.len() as u64)
    }

    fn position(&self) -> u64 {
        self.cursor as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use partstream_core::{Channel, DataType};

    fn sample_array() -> Arc<ParticleArray> {
        let schema = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<f32>("Density")]).unwrap();
        let position = schema.get_accessor::<Vec3>("Position").unwrap();
        let density = schema.get_accessor::<f32>("Density").unwrap();

        let mut array = ParticleArray::new(schema.clone());
        for i in 0..5 {
            let mut record = schema.default_record();
            position.set(&mut record, Vec3::splat(i as f32));
            density.set(&mut record, 1.0 + i as f32);
            array.push(&record).unwrap();
        }
        Arc::new(array)
    }

    #[test]
    fn test_adapts_to_requested_layout() {
        let mut stream = ArrayStream::new(sample_array());
        let requested = Schema::new(vec![
            Channel::new("Density", 1, DataType::Float64),
            Channel::of::<Vec3>("Color"),
        ])
        .unwrap();
        stream.set_schema(&requested).unwrap();

        let color = requested.get_accessor::<Vec3>("Color").unwrap();
        let mut default = requested.default_record();
        color.set(&mut default, Vec3::ONE);
        stream.set_default_record(&default).unwrap();

        let density = requested.get_accessor::<f64>("Density").unwrap();
        let mut record = requested.default_record();
        assert!(stream.next(&mut record).unwrap());
        assert_eq!(density.get(&record), 1.0);
        assert_eq!(color.get(&record), Vec3::ONE);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let particles = sample_array();
        let mut sequential = ArrayStream::new(Arc::clone(&particles));
        let mut batched = sequential.restart();
        let size = particles.schema().record_size();

        let mut expected = Vec::new();
        let mut record = vec![0u8; size];
        while sequential.next(&mut record).unwrap() {
            expected.extend_from_slice(&record);
        }

        let mut buffer = vec![0u8; 3 * size];
        let mut actual = Vec::new();
        loop {
            let count = batched.next_batch(&mut buffer).unwrap();
            actual.extend_from_slice(&buffer[..count * size]);
            if count < 3 {
                break;
            }
        }
        assert_eq!(actual, expected);
        assert_eq!(batched.remaining(), Some(0));
    }

    #[test]
    fn test_restart_is_independent() {
        let mut stream = ArrayStream::new(sample_array());
        let mut record = vec![0u8; stream.schema().record_size()];
        stream.next(&mut record).unwrap();
        let fresh = stream.restart();
        assert_eq!(stream.position(), 1);
        assert_eq!(fresh.position(), 0);
        assert_eq!(fresh.count(), Some(5));
    }
}
