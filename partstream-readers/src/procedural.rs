//! Procedurally generated particle sources

use glam::{UVec3, Vec3};
use partstream_core::stream::check_default_record;
use partstream_core::{channels, Accessor, Channel, ParticleStream, Result, Schema, SchemaAdaptor};

/// Produces records on demand in its own native layout
pub trait Generator: Send {
    /// Layout of generated records
    fn schema(&self) -> &Schema;

    /// Number of records, when known
    fn count(&self) -> Option<u64>;

    /// Write record `index`; returns `false` when generation is finished
    fn generate(&mut self, index: u64, record: &mut [u8]) -> bool;
}

/// Points on a regular grid with `Position`, `Density` and `ID`
#[derive(Debug, Clone)]
pub struct LatticeGenerator {
    schema: Schema,
    dims: UVec3,
    origin: Vec3,
    spacing: f32,
    position: Accessor<Vec3>,
    density: Accessor<f32>,
    id: Accessor<i64>,
}

impl LatticeGenerator {
    /// A grid of `dims` points starting at `origin`, `spacing` apart
    pub fn new(dims: UVec3, origin: Vec3, spacing: f32) -> Result<Self> {
        let schema = Schema::new(vec![
            Channel::of::<Vec3>(channels::POSITION),
            Channel::of::<f32>(channels::DENSITY),
            Channel::of::<i64>(channels::ID),
        ])?;
        Ok(Self {
            position: schema.get_accessor(channels::POSITION)?,
            density: schema.get_accessor(channels::DENSITY)?,
            id: schema.get_accessor(channels::ID)?,
            schema,
            dims,
            origin,
            spacing,
        })
    }

    fn total(&self) -> u64 {
        u64::from(self.dims.x) * u64::from(self.dims.y) * u64::from(self.dims.z)
    }
}

impl Generator for LatticeGenerator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn count(&self) -> Option<u64> {
        Some(self.total())
    }

    fn generate(&mut self, index: u64, record: &mut [u8]) -> bool {
        if index >= self.total() {
            return false;
        }
        let (nx, ny) = (u64::from(self.dims.x), u64::from(self.dims.y));
        let cell = Vec3::new((index % nx) as f32, ((index / nx) % ny) as f32, (index / (nx * ny)) as f32);
        self.position.set(record, self.origin + cell * self.spacing);
        self.density.set(record, 1.0);
        self.id.set(record, index as i64);
        true
    }
}

/// Generator driven by a closure
pub struct FnGenerator<F> {
    schema: Schema,
    count: Option<u64>,
    f: F,
}

impl<F> FnGenerator<F>
where
    F: FnMut(u64, &mut [u8]) -> bool + Send,
{
    /// Wrap `f`, which fills record `index` in `schema` layout
    pub fn new(schema: Schema, count: Option<u64>, f: F) -> Self {
        Self { schema, count, f }
    }
}

impl<F> Generator for FnGenerator<F>
where
    F: FnMut(u64, &mut [u8]) -> bool + Send,
{
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn count(&self) -> Option<u64> {
        self.count
    }

    fn generate(&mut self, index: u64, record: &mut [u8]) -> bool {
        if self.count.is_some_and(|count| index >= count) {
            return false;
        }
        (self.f)(index, record)
    }
}

/// Leaf stream pulling records from a [`Generator`]
pub struct ProceduralStream<G> {
    generator: G,
    requested: Schema,
    adaptor: SchemaAdaptor,
    default_record: Vec<u8>,
    native_record: Vec<u8>,
    position: u64,
    finished: bool,
}

impl<G: Generator> ProceduralStream<G> {
    /// Create a stream requesting the generator's native layout
    pub fn new(generator: G) -> Self {
        let native = generator.schema().clone();
        Self {
            adaptor: SchemaAdaptor::identity(&native),
            default_record: native.default_record(),
            native_record: native.default_record(),
            requested: native,
            generator,
            position: 0,
            finished: false,
        }
    }
}

impl<G: Generator> ParticleStream for ProceduralStream<G> {
    fn name(&self) -> &str {
        "procedural"
    }

    fn schema(&self) -> &Schema {
        &self.requested
    }

    fn native_schema(&self) -> &Schema {
        self.generator.schema()
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        if *requested == self.requested {
            return Ok(());
        }
        self.adaptor = SchemaAdaptor::new(requested, self.generator.schema())?;
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
        if self.finished {
            return Ok(false);
        }
        self.native_record.fill(0);
        if !self.generator.generate(self.position, &mut self.native_record) {
            self.finished = true;
            return Ok(false);
        }
        record.copy_from_slice(&self.default_record);
        self.adaptor.copy(record, &self.native_record);
        self.position += 1;
        Ok(true)
    }

    fn count(&self) -> Option<u64> {
        self.generator.count()
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_core::{NullProgress, ParticleArray};

    #[test]
    fn test_lattice_positions_and_ids() {
        let generator = LatticeGenerator::new(UVec3::new(2, 2, 2), Vec3::ZERO, 0.5).unwrap();
        let mut stream = ProceduralStream::new(generator);
        assert_eq!(stream.count(), Some(8));

        let array = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap();
        assert_eq!(array.len(), 8);

        let position = array.schema().get_accessor::<Vec3>("Position").unwrap();
        let id = array.schema().get_accessor::<i64>("ID").unwrap();
        let last = array.get(7).unwrap();
        assert_eq!(position.get(last), Vec3::splat(0.5));
        assert_eq!(id.get(last), 7);
    }

    #[test]
    fn test_fn_generator_stops_early() {
        let schema = Schema::new(vec![Channel::of::<u32>("ID")]).unwrap();
        let id = schema.get_accessor::<u32>("ID").unwrap();
        let generator = FnGenerator::new(schema, None, move |index, record| {
            if index == 3 {
                return false;
            }
            id.set(record, index as u32 * 10);
            true
        });

        let mut stream = ProceduralStream::new(generator);
        let mut record = [0u8; 4];
        let mut seen = Vec::new();
        while stream.next(&mut record).unwrap() {
            seen.push(u32::from_ne_bytes(record));
        }
        assert_eq!(seen, [0, 10, 20]);
        assert!(!stream.next(&mut record).unwrap());
    }
}
