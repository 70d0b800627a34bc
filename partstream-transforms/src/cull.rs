//! Spatial culling against volumes and surfaces

use std::sync::Arc;

use glam::Vec3;
use partstream_core::{channels, Channel, ConvertingAccessor, Negotiated, ParticleStream, Result, Schema};
use serde::{Deserialize, Serialize};

use crate::volume::CullingVolume;

fn position_requirements(requested: &Schema) -> Result<Schema> {
    let mut requirements = Schema::empty();
    if !requested.has_channel(channels::POSITION) {
        requirements.append_channel(Channel::of::<Vec3>(channels::POSITION))?;
    }
    Ok(requirements)
}

/// Drops particles inside a volume, or outside it when inverted.
///
/// Survivors keep their upstream values; nothing is renumbered.
pub struct VolumeCullStream<S> {
    delegate: S,
    volume: Arc<dyn CullingVolume>,
    invert: bool,
    negotiated: Negotiated,
    position_accessor: Option<ConvertingAccessor<Vec3>>,
    position: u64,
}

impl<S: ParticleStream> VolumeCullStream<S> {
    /// Cull `delegate` against `volume`; `invert` keeps only the inside
    pub fn new(delegate: S, volume: Arc<dyn CullingVolume>, invert: bool) -> Result<Self> {
        let native = delegate.native_schema().clone();
        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            delegate,
            volume,
            invert,
            position_accessor: None,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let negotiated = Negotiated::new(requested, &position_requirements(requested)?, &[])?;
        negotiated.check_delegate(&self.delegate)?;
        self.delegate.set_schema(negotiated.upstream())?;
        self.position_accessor = Some(negotiated.working().get_converting_accessor::<Vec3>(channels::POSITION, None)?);
        self.negotiated = negotiated;
        Ok(())
    }
}

impl<S: ParticleStream> ParticleStream for VolumeCullStream<S> {
    fn name(&self) -> &str {
        "volume-cull"
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
        let (volume, invert, accessor) = (&self.volume, self.invert, self.position_accessor);
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            Ok(accessor.map_or(true, |p| volume.contains(p.get(working)) == invert))
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let (volume, invert, accessor) = (&self.volume, self.invert, self.position_accessor);
        let count = self.negotiated.filter_batch(&mut self.delegate, buffer, |working| {
            Ok(accessor.map_or(true, |p| volume.contains(p.get(working)) == invert))
        })?;
        self.position += count as u64;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        None
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Parameters of surface culling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceCullOptions {
    /// Whether any particle is removed; off means only normals are written
    pub cull: bool,

    /// Depth below the surface past which inside particles are removed
    pub threshold: f32,

    /// Remove the shallow particles instead of the deep ones
    pub invert: bool,
}

impl Default for SurfaceCullOptions {
    fn default() -> Self {
        Self {
            cull: true,
            threshold: 0.0,
            invert: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SurfaceBinding {
    position: ConvertingAccessor<Vec3>,
    normal: Option<ConvertingAccessor<Vec3>>,
}

/// Culls by signed distance to a volume's surface and can write the nearest
/// surface normal into `CullingSurfaceNormal`.
///
/// A particle is culled when it lies inside the volume deeper than the
/// threshold. With `invert`, those are the only particles kept.
pub struct SurfaceCullStream<S> {
    delegate: S,
    volume: Arc<dyn CullingVolume>,
    options: SurfaceCullOptions,
    native: Schema,
    negotiated: Negotiated,
    binding: Option<SurfaceBinding>,
    position: u64,
}

impl<S: ParticleStream> SurfaceCullStream<S> {
    /// Cull `delegate` against the surface of `volume`
    pub fn new(delegate: S, volume: Arc<dyn CullingVolume>, options: SurfaceCullOptions) -> Result<Self> {
        let mut native = delegate.native_schema().without(&[channels::CULLING_SURFACE_NORMAL]);
        native.append_channel(Channel::of::<Vec3>(channels::CULLING_SURFACE_NORMAL))?;

        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[channels::CULLING_SURFACE_NORMAL])?,
            delegate,
            volume,
            options,
            native: native.clone(),
            binding: None,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let negotiated = Negotiated::new(
            requested,
            &position_requirements(requested)?,
            &[channels::CULLING_SURFACE_NORMAL],
        )?;
        negotiated.check_delegate(&self.delegate)?;
        self.delegate.set_schema(negotiated.upstream())?;

        let working = negotiated.working();
        let normal = if working.has_channel(channels::CULLING_SURFACE_NORMAL) {
            Some(working.get_converting_accessor::<Vec3>(channels::CULLING_SURFACE_NORMAL, None)?)
        } else {
            None
        };
        self.binding = Some(SurfaceBinding {
            position: working.get_converting_accessor::<Vec3>(channels::POSITION, None)?,
            normal,
        });
        self.negotiated = negotiated;
        Ok(())
    }
}

impl SurfaceCullOptions {
    fn keep(&self, binding: Option<SurfaceBinding>, volume: &dyn CullingVolume, record: &mut [u8]) -> bool {
        let Some(binding) = binding else {
            return true;
        };
        let (distance, normal) = volume.surface(binding.position.get(record));
        if let Some(accessor) = binding.normal {
            accessor.set(record, normal);
        }
        if !self.cull {
            return true;
        }
        let deep = distance < -self.threshold;
        deep == self.invert
    }
}

impl<S: ParticleStream> ParticleStream for SurfaceCullStream<S> {
    fn name(&self) -> &str {
        "surface-cull"
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
        let (options, binding, volume) = (self.options, self.binding, self.volume.as_ref());
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            Ok(options.keep(binding, volume, working))
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let (options, binding, volume) = (self.options, self.binding, self.volume.as_ref());
        let count = self.negotiated.filter_batch(&mut self.delegate, buffer, |working| {
            Ok(options.keep(binding, volume, working))
        })?;
        self.position += count as u64;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        if self.options.cull {
            None
        } else {
            self.delegate.count()
        }
    }

    fn position(&self) -> u64 {
        self.position
    }
}
