//! Force one channel to a fixed value

use partstream_core::{Channel, ChannelValue, Error, Negotiated, ParticleStream, Result, Schema};

/// Overwrites one channel of every record with a constant, whatever the
/// delegate produced for it.
///
/// The delegate is never asked for the channel.
pub struct SetConstantStream<S> {
    delegate: S,
    channel: Channel,
    /// Value as `f64` elements, converted to the working type on negotiation
    elements: Vec<f64>,
    native: Schema,
    negotiated: Negotiated,
    /// Encoded value and its offset in the working layout
    encoded: Option<(usize, Vec<u8>)>,
    position: u64,
}

impl<S: ParticleStream> SetConstantStream<S> {
    /// Set `name` to `value` in every record
    pub fn new<T: ChannelValue>(delegate: S, name: &str, value: T) -> Result<Self> {
        let mut elements = vec![0.0; T::ARITY];
        value.to_elements(&mut elements);
        Self::from_elements(delegate, Channel::of::<T>(name), elements)
    }

    /// Set `channel` to the given element values, converted to whatever
    /// element type the consumer requests
    pub fn from_elements(delegate: S, channel: Channel, elements: Vec<f64>) -> Result<Self> {
        if elements.len() != channel.arity() {
            return Err(Error::InvalidArgument(format!(
                "constant for '{}' has {} elements, channel arity is {}",
                channel.name(),
                elements.len(),
                channel.arity()
            )));
        }
        let mut native = delegate.native_schema().without(&[channel.name()]);
        native.append_channel(Channel::new(channel.name(), channel.arity(), channel.data_type()))?;

        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[channel.name()])?,
            delegate,
            channel,
            elements,
            native: native.clone(),
            encoded: None,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let negotiated = Negotiated::new(requested, &Schema::empty(), &[self.channel.name()])?;
        self.delegate.set_schema(negotiated.upstream())?;

        self.encoded = match negotiated.working().channel(self.channel.name()) {
            Some(target) => {
                if target.arity() != self.channel.arity() {
                    return Err(Error::TypeMismatch {
                        channel: self.channel.name().to_string(),
                        expected: format!("arity {}", self.channel.arity()),
                        found: format!("arity {}", target.arity()),
                    });
                }
                let step = target.data_type().size_bytes();
                let mut bytes = vec![0u8; target.size_bytes()];
                for (i, value) in self.elements.iter().enumerate() {
                    target.data_type().write_f64(&mut bytes[i * step..], *value);
                }
                Some((target.offset(), bytes))
            }
            None => None,
        };
        self.negotiated = negotiated;
        Ok(())
    }

    fn apply(encoded: &Option<(usize, Vec<u8>)>, record: &mut [u8]) {
        if let Some((offset, bytes)) = encoded {
            record[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }
    }
}

impl<S: ParticleStream> ParticleStream for SetConstantStream<S> {
    fn name(&self) -> &str {
        "set-constant"
    }

    fn schema(&self) -> &Schema {
        self.negotiated.requested()
    }

    fn native_schema(&self) -> &Schema {
        &self.native
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        if requested == self.negotiated.requested() {
            return Ok(());
        }
        self.rebind(requested)
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        let upstream = self.negotiated.set_default_record(record)?;
        self.delegate.set_default_record(&upstream)
    }

    fn next(&mut self, record: &mut [u8]) -> Result<bool> {
        let encoded = &self.encoded;
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            Self::apply(encoded, working);
            Ok(true)
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let encoded = &self.encoded;
        let size = self.negotiated.working().record_size();
        let count = self.negotiated.map_batch(&mut self.delegate, buffer, |records, _| {
            if size > 0 {
                for record in records.chunks_exact_mut(size) {
                    Self::apply(encoded, record);
                }
            }
            Ok(())
        })?;
        self.position += count as u64;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        self.delegate.count()
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use partstream_core::{DataType, NullProgress, ParticleArray};
    use partstream_readers::ArrayStream;

    fn positions() -> ArrayStream {
        let schema = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<Vec3>("Color")]).unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for i in 0..4 {
            let mut record = schema.default_record();
            schema.get_accessor::<Vec3>("Position").unwrap().set(&mut record, Vec3::splat(i as f32));
            schema.get_accessor::<Vec3>("Color").unwrap().set(&mut record, Vec3::X);
            array.push(&record).unwrap();
        }
        ArrayStream::from_array(array)
    }

    #[test]
    fn test_overrides_upstream_value() {
        let mut stream = SetConstantStream::new(positions(), "Color", Vec3::new(0.5, 0.25, 1.0)).unwrap();
        let array = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap();
        let color = array.schema().get_accessor::<Vec3>("Color").unwrap();
        assert!(array.iter().all(|r| color.get(r) == Vec3::new(0.5, 0.25, 1.0)));
        assert_eq!(stream.count(), Some(4));
    }

    #[test]
    fn test_converts_to_requested_type() {
        let mut stream = SetConstantStream::new(positions(), "PartitionIndex", 3i32).unwrap();
        let requested = Schema::new(vec![Channel::new("PartitionIndex", 1, DataType::Float64)]).unwrap();
        stream.set_schema(&requested).unwrap();

        let mut record = requested.default_record();
        assert!(stream.next(&mut record).unwrap());
        assert_eq!(requested.get_accessor::<f64>("PartitionIndex").unwrap().get(&record), 3.0);
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let mut stream = SetConstantStream::new(positions(), "Color", Vec3::ONE).unwrap();
        let requested = Schema::new(vec![Channel::of::<f32>("Color")]).unwrap();
        assert!(matches!(stream.set_schema(&requested), Err(Error::TypeMismatch { .. })));
    }
}
