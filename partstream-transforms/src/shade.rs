//! Per-record shading with pooled, per-worker evaluator contexts

use std::sync::Arc;

use partstream_core::{Channel, Negotiated, ParticleStream, Result, Schema};
use partstream_parallel::WorkerPool;
use tracing::debug;

/// A per-record evaluator, such as a material.
///
/// Binding happens once per negotiation. Evaluation state that is expensive
/// to build (lookup tables, sampler caches) lives in a [`Shader::Context`];
/// each worker thread builds its own context the first time it shades and
/// keeps it for later batches.
pub trait Shader: Send + Sync {
    /// Scratch state owned by one worker
    type Context: Send;

    /// Channels read while shading
    fn requirements(&self) -> Schema;

    /// Channels written while shading
    fn outputs(&self) -> Vec<Channel>;

    /// Bind accessors against the working layout, which holds every
    /// requirement and, when requested, the outputs
    fn bind(&mut self, working: &Schema) -> Result<()>;

    /// Build one worker's context
    fn create_context(&self) -> Result<Self::Context>;

    /// Shade one working record in place
    fn shade(&self, context: &mut Self::Context, record: &mut [u8]);
}

/// Runs a [`Shader`] over every record.
///
/// The batch path splits each batch into contiguous ranges across the worker
/// pool, so records come out in upstream order.
pub struct ShadeStream<S, H: Shader> {
    delegate: S,
    shader: H,
    pool: Arc<WorkerPool>,
    native: Schema,
    negotiated: Negotiated,
    contexts: Vec<Option<H::Context>>,
    position: u64,
}

impl<S: ParticleStream, H: Shader> ShadeStream<S, H> {
    /// Shade `delegate` with `shader`, using `pool` for batches
    pub fn new(delegate: S, shader: H, pool: Arc<WorkerPool>) -> Result<Self> {
        let outputs = shader.outputs();
        let names: Vec<&str> = outputs.iter().map(Channel::name).collect();
        let mut native = delegate.native_schema().without(&names);
        for channel in &outputs {
            native.append_channel(channel.clone())?;
        }

        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            contexts: (0..pool.slots()).map(|_| None).collect(),
            delegate,
            shader,
            pool,
            native: native.clone(),
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    /// The wrapped shader
    pub fn shader(&self) -> &H {
        &self.shader
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let reads = self.shader.requirements();
        let outputs = self.shader.outputs();
        // A channel both read and written must come from upstream
        let written: Vec<&str> = outputs
            .iter()
            .map(Channel::name)
            .filter(|name| !reads.has_channel(name))
            .collect();

        let negotiated = Negotiated::new(requested, &reads, &written)?;
        negotiated.check_delegate(&self.delegate)?;
        self.delegate.set_schema(negotiated.upstream())?;
        self.shader.bind(negotiated.working())?;
        debug!(
            working = %negotiated.working(),
            slots = self.contexts.len(),
            "bound shader"
        );

        self.contexts.iter_mut().for_each(|slot| *slot = None);
        self.negotiated = negotiated;
        Ok(())
    }
}

impl<S: ParticleStream, H: Shader> ParticleStream for ShadeStream<S, H> {
    fn name(&self) -> &str {
        "shade"
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
        let shader = &self.shader;
        let Some(slot) = self.contexts.first_mut() else {
            return Ok(false);
        };
        if slot.is_none() {
            *slot = Some(shader.create_context()?);
        }
        let Some(context) = slot.as_mut() else {
            return Ok(false);
        };

        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            shader.shade(context, working);
            Ok(true)
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let (shader, pool, contexts) = (&self.shader, &self.pool, &mut self.contexts);
        let size = self.negotiated.working().record_size();
        let count = self.negotiated.map_batch(&mut self.delegate, buffer, |records, count| {
            pool.for_each_range(
                records,
                size,
                count,
                contexts.as_mut_slice(),
                || shader.create_context(),
                |context, range, _| {
                    if size > 0 {
                        range.chunks_exact_mut(size).for_each(|record| shader.shade(context, record));
                    }
                    Ok(())
                },
            )
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
