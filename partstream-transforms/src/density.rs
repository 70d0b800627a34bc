//! Scaling of a numeric channel, usually `Density`

use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use partstream_core::{
    channels, Channel, ConvertingAccessor, DataType, Error, Negotiated, ParticleStream, Result, Schema,
};

/// What a record's value is multiplied by
#[derive(Clone)]
pub enum DensityFactor {
    /// The same factor for every record
    Constant(f32),

    /// The value of another scalar channel
    Channel(String),

    /// A function of the record's position
    Function(Arc<dyn Fn(Vec3) -> f32 + Send + Sync>),
}

impl fmt::Debug for DensityFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DensityFactor::Constant(k) => f.debug_tuple("Constant").field(k).finish(),
            DensityFactor::Channel(name) => f.debug_tuple("Channel").field(name).finish(),
            DensityFactor::Function(_) => f.write_str("Function"),
        }
    }
}

#[derive(Clone, Copy)]
enum Source {
    Constant(f32),
    Channel(ConvertingAccessor<f32>),
    Position(ConvertingAccessor<Vec3>),
}

#[derive(Clone)]
struct Binding {
    target: ConvertingAccessor<f32>,
    source: Source,
    function: Option<Arc<dyn Fn(Vec3) -> f32 + Send + Sync>>,
}

impl Binding {
    fn apply(&self, record: &mut [u8]) {
        let factor = match (self.source, &self.function) {
            (Source::Constant(k), _) => k,
            (Source::Channel(accessor), _) => accessor.get(record),
            (Source::Position(accessor), Some(f)) => f(accessor.get(record)),
            (Source::Position(_), None) => 1.0,
        };
        let value = self.target.get(record);
        self.target.set(record, value * factor);
    }
}

/// Multiplies one scalar channel by a [`DensityFactor`].
///
/// Records pass through untouched when the channel is not requested.
pub struct DensityScaleStream<S> {
    delegate: S,
    channel: String,
    factor: DensityFactor,
    negotiated: Negotiated,
    binding: Option<Binding>,
    position: u64,
}

impl<S: ParticleStream> DensityScaleStream<S> {
    /// Scale the `Density` channel
    pub fn new(delegate: S, factor: DensityFactor) -> Result<Self> {
        Self::for_channel(delegate, channels::DENSITY, factor)
    }

    /// Scale an arbitrary scalar channel
    pub fn for_channel(delegate: S, channel: &str, factor: DensityFactor) -> Result<Self> {
        if let DensityFactor::Channel(name) = &factor {
            let native = delegate.native_schema();
            let source = native
                .channel(name)
                .ok_or_else(|| Error::ChannelMissing(format!("{name} (scale factor for '{channel}')")))?;
            if source.arity() != 1 {
                return Err(Error::TypeMismatch {
                    channel: name.clone(),
                    expected: "a scalar".to_string(),
                    found: format!("arity {}", source.arity()),
                });
            }
        }

        let native = delegate.native_schema().clone();
        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            delegate,
            channel: channel.to_string(),
            factor,
            binding: None,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        if !requested.has_channel(&self.channel) {
            let negotiated = Negotiated::new(requested, &Schema::empty(), &[])?;
            self.delegate.set_schema(negotiated.upstream())?;
            self.negotiated = negotiated;
            self.binding = None;
            return Ok(());
        }

        let mut requirements = Schema::empty();
        match &self.factor {
            DensityFactor::Channel(name) if !requested.has_channel(name) => {
                let data_type = self
                    .delegate
                    .native_schema()
                    .channel(name)
                    .map_or(DataType::Float32, Channel::data_type);
                requirements.append_channel(Channel::new(name.as_str(), 1, data_type))?;
            }
            DensityFactor::Function(_) if !requested.has_channel(channels::POSITION) => {
                requirements.append_channel(Channel::of::<Vec3>(channels::POSITION))?;
            }
            _ => {}
        }

        let negotiated = Negotiated::new(requested, &requirements, &[])?;
        negotiated.check_delegate(&self.delegate)?;
        self.delegate.set_schema(negotiated.upstream())?;

        let working = negotiated.working();
        let (source, function) = match &self.factor {
            DensityFactor::Constant(k) => (Source::Constant(*k), None),
            DensityFactor::Channel(name) => (Source::Channel(working.get_converting_accessor(name, None)?), None),
            DensityFactor::Function(f) => (
                Source::Position(working.get_converting_accessor(channels::POSITION, None)?),
                Some(Arc::clone(f)),
            ),
        };
        self.binding = Some(Binding {
            target: working.get_converting_accessor(&self.channel, None)?,
            source,
            function,
        });
        self.negotiated = negotiated;
        Ok(())
    }
}

impl<S: ParticleStream> ParticleStream for DensityScaleStream<S> {
    fn name(&self) -> &str {
        "density-scale"
    }

    fn schema(&self) -> &Schema {
        self.negotiated.requested()
    }

    fn native_schema(&self) -> &Schema {
        self.delegate.native_schema()
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
        let binding = &self.binding;
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            if let Some(binding) = binding {
                binding.apply(working);
            }
            Ok(true)
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let binding = &self.binding;
        let size = self.negotiated.working().record_size();
        let count = self.negotiated.map_batch(&mut self.delegate, buffer, |records, _| {
            if let (Some(binding), true) = (binding, size > 0) {
                records.chunks_exact_mut(size).for_each(|record| binding.apply(record));
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
    use partstream_core::{NullProgress, ParticleArray};
    use partstream_readers::ArrayStream;
    use test_case::test_case;

    fn particles() -> ArrayStream {
        let schema = Schema::new(vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<f32>("Density"),
            Channel::of::<f32>("Age"),
        ])
        .unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for i in 1..=3 {
            let mut record = schema.default_record();
            schema.get_accessor::<Vec3>("Position").unwrap().set(&mut record, Vec3::new(i as f32, 0.0, 0.0));
            schema.get_accessor::<f32>("Density").unwrap().set(&mut record, 2.0);
            schema.get_accessor::<f32>("Age").unwrap().set(&mut record, i as f32 * 0.5);
            array.push(&record).unwrap();
        }
        ArrayStream::from_array(array)
    }

    fn densities(stream: &mut dyn ParticleStream) -> Vec<f32> {
        let requested = Schema::new(vec![Channel::of::<f32>("Density")]).unwrap();
        stream.set_schema(&requested).unwrap();
        let array = ParticleArray::from_stream(stream, &NullProgress).unwrap();
        array.iter().map(|r| f32::from_ne_bytes(r.try_into().unwrap())).collect()
    }

    #[test_case(DensityFactor::Constant(4.0), &[8.0, 8.0, 8.0] ; "constant")]
    #[test_case(DensityFactor::Channel("Age".to_string()), &[1.0, 2.0, 3.0] ; "channel")]
    #[test_case(DensityFactor::Function(Arc::new(|p: Vec3| 1.0 / p.x)), &[2.0, 1.0, 2.0 / 3.0] ; "function")]
    fn test_scale(factor: DensityFactor, expected: &[f32]) {
        let mut stream = DensityScaleStream::new(particles(), factor).unwrap();
        assert_eq!(densities(&mut stream), expected);
    }

    #[test]
    fn test_missing_factor_channel() {
        let result = DensityScaleStream::new(particles(), DensityFactor::Channel("Mass".to_string()));
        assert!(matches!(result, Err(Error::ChannelMissing(_))));
    }

    #[test]
    fn test_function_factor_needs_native_position() {
        let schema = Schema::new(vec![Channel::of::<f32>("Density")]).unwrap();
        let mut array = ParticleArray::new(schema.clone());
        array.push(&schema.default_record()).unwrap();

        let factor = DensityFactor::Function(Arc::new(|p: Vec3| p.x));
        let result = DensityScaleStream::new(ArrayStream::from_array(array), factor);
        assert!(matches!(result, Err(Error::ChannelMissing(_))));
    }

    #[test]
    fn test_unrequested_channel_is_untouched() {
        let mut stream = DensityScaleStream::new(particles(), DensityFactor::Constant(0.0)).unwrap();
        let requested = Schema::new(vec![Channel::of::<f32>("Age")]).unwrap();
        stream.set_schema(&requested).unwrap();
        assert!(stream.binding.is_none());
        assert_eq!(ParticleArray::from_stream(&mut stream, &NullProgress).unwrap().len(), 3);
    }
}
