//! Blending two sibling streams sampled at adjacent times

use partstream_core::{channels, Channel, ConvertingAccessor, DataType, Error, Negotiated, ParticleStream, Result, Schema};
use tracing::debug;

/// Extrapolation allowed past either sibling
const EXTRAPOLATION: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct Lerp {
    offset: usize,
    arity: usize,
    data_type: DataType,
}

#[derive(Debug, Clone, Default)]
struct Blend {
    lerps: Vec<Lerp>,
    id: Option<ConvertingAccessor<i64>>,
}

impl Blend {
    /// Blend `b` into `a`, both in the working layout
    fn apply(&self, a: &mut [u8], b: &[u8], factor: f64) -> Result<()> {
        if let Some(id) = self.id {
            let (left, right) = (id.get(a), id.get(b));
            if left != right {
                return Err(Error::Consistency(format!(
                    "interpolation siblings are out of step: ID {left} paired with ID {right}"
                )));
            }
        }
        for lerp in &self.lerps {
            let step = lerp.data_type.size_bytes();
            for i in 0..lerp.arity {
                let at = lerp.offset + i * step;
                let x = lerp.data_type.read_f64(&a[at..]);
                let y = lerp.data_type.read_f64(&b[at..]);
                lerp.data_type.write_f64(&mut a[at..], x + (y - x) * factor);
            }
        }
        Ok(())
    }
}

/// Linear blend of two streams holding the same particles at two times.
///
/// Both siblings must produce the same number of records in the same order.
/// When both carry an `ID` channel the pairing is checked record by record.
/// Floating point channels are blended; every other channel takes the first
/// sibling's value.
pub struct TimeInterpolateStream<A, B> {
    first: A,
    second: B,
    factor: f64,
    native: Schema,
    /// Negotiation with each sibling; both use the same layouts
    negotiated: (Negotiated, Negotiated),
    blend: Blend,
    /// Working records of the current pair
    buffers: (Vec<u8>, Vec<u8>),
    /// Batch reads: the second sibling's requested records and its working
    /// records, kept for the blend
    batch: (Vec<u8>, Vec<u8>),
    position: u64,
}

impl<A: ParticleStream, B: ParticleStream> TimeInterpolateStream<A, B> {
    /// Blend `first` toward `second` by `factor`, where `0` is `first` and `1`
    /// is `second`. Mild extrapolation is allowed, up to half a step.
    pub fn new(first: A, second: B, factor: f64) -> Result<Self> {
        if !(-EXTRAPOLATION..=1.0 + EXTRAPOLATION).contains(&factor) {
            return Err(Error::InvalidArgument(format!(
                "interpolation factor {factor} is outside [{}, {}]",
                -EXTRAPOLATION,
                1.0 + EXTRAPOLATION
            )));
        }
        if let (Some(a), Some(b)) = (first.count(), second.count()) {
            if a != b {
                return Err(Error::Consistency(format!(
                    "interpolation siblings '{}' and '{}' have {a} and {b} records",
                    first.name(),
                    second.name()
                )));
            }
        }

        let native = first.native_schema().intersection(second.native_schema());
        let empty = Negotiated::new(&native, &Schema::empty(), &[])?;
        let mut stream = Self {
            first,
            second,
            factor,
            native: native.clone(),
            negotiated: (empty.clone(), empty),
            blend: Blend::default(),
            buffers: (Vec::new(), Vec::new()),
            batch: (Vec::new(), Vec::new()),
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    /// Blend factor
    pub fn factor(&self) -> f64 {
        self.factor
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let by_id = self.first.native_schema().has_channel(channels::ID)
            && self.second.native_schema().has_channel(channels::ID);
        let mut requirements = Schema::empty();
        if by_id && !requested.has_channel(channels::ID) {
            requirements.append_channel(Channel::of::<i64>(channels::ID))?;
        }

        let first = Negotiated::new(requested, &requirements, &[])?;
        let second = Negotiated::new(requested, &requirements, &[])?;
        self.first.set_schema(first.upstream())?;
        self.second.set_schema(second.upstream())?;

        let working = first.working();
        self.blend = Blend {
            lerps: working
                .channels()
                .iter()
                .filter(|c| c.data_type().is_float())
                .map(|c| Lerp {
                    offset: c.offset(),
                    arity: c.arity(),
                    data_type: c.data_type(),
                })
                .collect(),
            id: if by_id {
                Some(working.get_converting_accessor::<i64>(channels::ID, None)?)
            } else {
                None
            },
        };
        debug!(
            blended = self.blend.lerps.len(),
            checked = by_id,
            factor = self.factor,
            "bound interpolation"
        );

        let size = working.record_size();
        self.buffers = (vec![0; size], vec![0; size]);
        self.negotiated = (first, second);
        Ok(())
    }

    fn early_end(&self, which: &str) -> Error {
        Error::Consistency(format!(
            "interpolation sibling '{which}' ended early after {} records",
            self.position
        ))
    }
}

impl<A: ParticleStream, B: ParticleStream> ParticleStream for TimeInterpolateStream<A, B> {
    fn name(&self) -> &str {
        "time-interpolate"
    }

    fn schema(&self) -> &Schema {
        self.negotiated.0.requested()
    }

    fn native_schema(&self) -> &Schema {
        &self.native
    }

    fn set_schema(&mut self, requested: &Schema) -> Result<()> {
        if requested == self.negotiated.0.requested() {
            return Ok(());
        }
        self.rebind(requested)
    }

    fn set_default_record(&mut self, record: &[u8]) -> Result<()> {
        let upstream = self.negotiated.0.set_default_record(record)?;
        self.first.set_default_record(&upstream)?;
        let upstream = self.negotiated.1.set_default_record(record)?;
        self.second.set_default_record(&upstream)
    }

    fn next(&mut self, record: &mut [u8]) -> Result<bool> {
        let (a, b) = (&mut self.buffers.0, &mut self.buffers.1);
        let has_first = self.negotiated.0.next_with(&mut self.first, a, |_| Ok(true))?;
        let has_second = self.negotiated.1.next_with(&mut self.second, b, |_| Ok(true))?;
        match (has_first, has_second) {
            (false, false) => return Ok(false),
            (true, false) => return Err(self.early_end(self.second.name())),
            (false, true) => return Err(self.early_end(self.first.name())),
            (true, true) => {}
        }

        self.blend.apply(a, b, self.factor)?;
        record.copy_from_slice(&a[..record.len()]);
        self.position += 1;
        Ok(true)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let size = self.negotiated.0.requested().record_size();
        if size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }
        let capacity = buffer.len() / size;

        // Second sibling first, keeping its working records for the blend
        let (scratch, second_records) = &mut self.batch;
        if scratch.len() < capacity * size {
            scratch.resize(capacity * size, 0);
        }
        second_records.clear();
        let second_count = self
            .negotiated
            .1
            .map_batch(&mut self.second, &mut scratch[..capacity * size], |records, _| {
                second_records.extend_from_slice(records);
                Ok(())
            })?;
        let second_records = &*second_records;

        let (blend, factor) = (&self.blend, self.factor);
        let working_size = self.buffers.0.len();
        let first_count = self.negotiated.0.map_batch(&mut self.first, buffer, |records, count| {
            if count != second_count {
                return Ok(());
            }
            for (a, b) in records
                .chunks_exact_mut(working_size)
                .zip(second_records.chunks_exact(working_size))
            {
                blend.apply(a, b, factor)?;
            }
            Ok(())
        })?;

        if first_count != second_count {
            let which = if first_count < second_count {
                self.first.name().to_string()
            } else {
                self.second.name().to_string()
            };
            return Err(self.early_end(&which));
        }
        self.position += first_count as u64;
        Ok(first_count)
    }

    fn count(&self) -> Option<u64> {
        self.first.count().or(self.second.count())
    }

    fn position(&self) -> u64 {
        self.position
    }
}
