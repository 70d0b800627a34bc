//! Chain assembly for a particle file loader

use std::sync::Arc;

use glam::{Mat4, Vec3};
use partstream_cache::{Built, ConsumerKey, ObjectCache};
use partstream_core::{
    channels, negotiate, Aabb, Channel, Interval, ParticleArray, ParticleStream, ProgressSink, Result, Schema, Time,
};
use partstream_parallel::{PoolConfig, WorkerPool};
use partstream_readers::{ArrayStream, ConcatenatedStream, EmptyStream, FileSequence};
use partstream_transforms::{
    ApplyFunctionStream, Builtin, DensityFactor, DensityScaleStream, FractionalStream, SamplingPolicy,
    SetConstantStream, SurfaceCullStream, TransformStream, VolumeCullStream, VolumeSpec,
};
use tracing::{debug, error, warn};

use crate::context::RenderContext;
use crate::error::PipelineError;
use crate::frames::{open_frame, zero_velocity, FrameSample};
use crate::modifiers::apply_all;
use crate::settings::{LoadLimits, LoaderSettings, PropertyMap};

/// Layout of the particles handed to viewers
pub fn viewer_schema() -> Result<Schema> {
    Schema::new(vec![
        Channel::of::<Vec3>(channels::POSITION),
        Channel::of::<Vec3>(channels::VELOCITY),
        Channel::of::<Vec3>(channels::COLOR),
    ])
}

/// Builds decorator chains from one set of settings
struct Assembly<'a> {
    name: &'a str,
    settings: &'a LoaderSettings,
    pool: &'a Arc<WorkerPool>,
}

impl Assembly<'_> {
    /// Every file's frame for `t`, concatenated
    fn source(
        &self,
        context: &dyn RenderContext,
        t: Time,
        fallback: &Schema,
    ) -> Result<(Box<dyn ParticleStream>, FrameSample)> {
        let settings = self.settings;
        let sample = if settings.single_frame {
            FrameSample::still()
        } else {
            settings.timing(context.frame_rate()).sample(t, settings.range.as_ref())
        };

        if !settings.single_frame && sample.frame.is_none() {
            debug!(loader = self.name, t, "outside the frame range, loading nothing");
            return Ok((Box::new(EmptyStream::new(fallback.clone())), sample));
        }

        let interpolation = match sample.sibling {
            Some(sibling) if settings.interpolate => Some((sibling, sample.subframe.abs() as f32)),
            _ => None,
        };

        let mut streams = Vec::with_capacity(settings.files.len());
        for file in &settings.files {
            let sequence = FileSequence::parse(file)?;
            let frame = match sample.frame {
                Some(frame) => frame,
                None => sequence.frame().unwrap_or_default(),
            };
            streams.push(open_frame(&sequence, frame, interpolation, &settings.sequence, fallback)?);
        }

        let stream: Box<dyn ParticleStream> = match streams.len() {
            0 => Box::new(EmptyStream::new(fallback.clone())),
            1 => streams.remove(0),
            _ => Box::new(ConcatenatedStream::new(streams)),
        };
        Ok((stream, sample))
    }

    /// Sampling, velocity handling and object-space modifiers
    fn object_space(
        &self,
        stream: Box<dyn ParticleStream>,
        sample: &FrameSample,
        limits: &LoadLimits,
        fps: f64,
    ) -> Result<Box<dyn ParticleStream>> {
        let settings = self.settings;
        let native = stream.native_schema().clone();

        let mut sampling = limits.sampling();
        if sampling.policy == SamplingPolicy::ById && !native.has_channel(channels::ID) {
            warn!(loader = self.name, "no ID channel to sample by, sampling evenly instead");
            sampling.policy = SamplingPolicy::Evenly;
        }
        let mut stream: Box<dyn ParticleStream> = if sampling.is_identity() {
            stream
        } else {
            Box::new(FractionalStream::new(stream, sampling)?)
        };

        let has_velocity = native.has_channel(channels::VELOCITY);
        if has_velocity && settings.zeroes_velocity(sample.is_static()) {
            stream = zero_velocity(stream)?;
        }

        let offset = sample.time_offset(fps);
        if has_velocity && native.has_channel(channels::POSITION) && offset.abs() > 1e-4 && !settings.interpolate {
            let push = Builtin::AddVelocityToPosition { seconds: offset as f32 };
            stream = Box::new(ApplyFunctionStream::new(stream, push.spec())?);
        }

        let rate = sample.time_derivative;
        if has_velocity && sample.in_range && !sample.is_static() && (rate - 1.0).abs() > 1e-3 {
            let scale = Builtin::ScaleVector {
                channel: channels::VELOCITY.to_string(),
                factor: rate as f32,
            };
            stream = Box::new(ApplyFunctionStream::new(stream, scale.spec())?);
        }

        apply_all(&settings.object_modifiers, stream)
    }

    /// Object transform, world-space modifiers and culling
    fn world_space(
        &self,
        stream: Box<dyn ParticleStream>,
        context: &dyn RenderContext,
        t: Time,
    ) -> Result<(Box<dyn ParticleStream>, Interval)> {
        let settings = self.settings;
        let transform = context.transform(t);
        let derivative = context.transform_derivative(t);
        let mut stream: Box<dyn ParticleStream> = if transform == Mat4::IDENTITY && derivative == Mat4::ZERO {
            stream
        } else {
            Box::new(TransformStream::new(stream, transform, derivative)?)
        };

        stream = apply_all(&settings.modifiers, stream)?;

        let culling = &settings.culling;
        if culling.enabled && !culling.volumes.is_empty() {
            let volume = match culling.volumes.as_slice() {
                [single] => single.build(),
                members => VolumeSpec::Union {
                    members: members.to_vec(),
                }
                .build(),
            };
            stream = match culling.surface {
                Some(options) => Box::new(SurfaceCullStream::new(stream, volume, options)?),
                None => Box::new(VolumeCullStream::new(stream, volume, culling.invert)?),
            };
        }
        Ok((stream, context.transform_validity(t)))
    }

    /// The complete render chain, negotiated to `requested`
    fn render(&self, context: &dyn RenderContext, requested: &Schema) -> Result<Box<dyn ParticleStream>> {
        let t = context.time();
        let fps = context.frame_rate();
        let limits = self.settings.render;

        let (stream, sample) = self.source(context, t, requested)?;
        let stream = self.object_space(stream, &sample, &limits, fps)?;
        let (mut stream, _) = self.world_space(stream, context, t)?;

        let fraction = limits.fraction;
        if self.settings.density_compensation
            && fraction > 0.0
            && fraction < 1.0
            && stream.native_schema().has_channel(channels::DENSITY)
        {
            stream = Box::new(DensityScaleStream::new(stream, DensityFactor::Constant((1.0 / fraction) as f32))?);
        }

        if let Some(material) = context.material() {
            debug!(loader = self.name, material = material.name(), "shading particles");
            stream = material.apply(stream, Arc::clone(self.pool))?;
        }

        if requested.has_channel(channels::COLOR) && !stream.native_schema().has_channel(channels::COLOR) {
            stream = Box::new(SetConstantStream::new(stream, channels::COLOR, context.wire_color())?);
        }

        negotiate(stream.as_mut(), requested, None)?;
        debug!(loader = self.name, t, schema = %requested, count = ?stream.count(), "assembled render chain");
        Ok(stream)
    }

    /// Object-space particles for viewers, before any per-viewer work
    fn local(&self, context: &dyn RenderContext, t: Time) -> Result<Built> {
        let (stream, sample) = self.source(context, t, &viewer_schema()?)?;
        let stream = self.object_space(stream, &sample, &self.settings.viewport_limits(), context.frame_rate())?;
        Ok(Built::new(stream, sample.validity))
    }

    /// One viewer's particles, in [`viewer_schema`] layout
    fn viewer(&self, local: Arc<ParticleArray>, context: &dyn RenderContext, t: Time) -> Result<Built> {
        let (mut stream, validity) = self.world_space(Box::new(ArrayStream::new(local)), context, t)?;
        let native = stream.native_schema().clone();

        if native.has_channel(channels::VIEWPORT_COLOR) {
            let copy = Builtin::CopyVector {
                from: channels::VIEWPORT_COLOR.to_string(),
                to: channels::COLOR.to_string(),
            };
            stream = Box::new(ApplyFunctionStream::new(stream, copy.spec())?);
        } else if !native.has_channel(channels::COLOR) {
            stream = Box::new(SetConstantStream::new(stream, channels::COLOR, context.wire_color())?);
        }
        let clamp = Builtin::ClampColor {
            channel: channels::COLOR.to_string(),
        };
        stream = Box::new(ApplyFunctionStream::new(stream, clamp.spec())?);

        let fps = context.frame_rate();
        if native.has_channel(channels::VELOCITY) && fps > 0.0 {
            let per_frame = Builtin::ScaleVector {
                channel: channels::VELOCITY.to_string(),
                factor: (1.0 / fps) as f32,
            };
            stream = Box::new(ApplyFunctionStream::new(stream, per_frame.spec())?);
        }

        let layout = viewer_schema()?;
        negotiate(stream.as_mut(), &layout, Some(&layout.default_record()))?;
        Ok(Built::new(stream, validity))
    }
}

/// Loads particle file sequences for rendering and for viewers.
///
/// Each evaluation assembles a fresh chain from the current settings:
///
/// ```text
/// files -> sampling -> velocity handling -> object modifiers
///       -> transform -> world modifiers -> culling
///       -> density compensation -> material -> wire colour
/// ```
///
/// Viewers share one cached copy of the object-space particles and keep
/// their own world-space caches. Failures are logged, kept as the last
/// error and reported to the context; only the failing evaluation is
/// aborted.
pub struct ParticleLoader {
    name: String,
    settings: LoaderSettings,
    pool: Arc<WorkerPool>,
    cache: ObjectCache,
    last_error: Option<String>,
}

impl ParticleLoader {
    /// Create a loader with a default worker pool
    pub fn new(name: impl Into<String>, settings: LoaderSettings) -> Self {
        let name = name.into();
        Self {
            cache: ObjectCache::new(&name),
            name,
            settings,
            pool: Arc::new(WorkerPool::new(PoolConfig::default())),
            last_error: None,
        }
    }

    /// Create a loader from host settings
    pub fn from_properties(name: impl Into<String>, properties: &PropertyMap) -> std::result::Result<Self, PipelineError> {
        Ok(Self::new(name, LoaderSettings::from_properties(properties)?))
    }

    /// Share a worker pool for shading
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current settings
    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Replace the settings; cached particles are invalidated
    pub fn set_settings(&mut self, settings: LoaderSettings) {
        self.settings = settings;
        self.invalidate();
    }

    /// Message of the last failed evaluation, cleared by the next success
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The loader's caches
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Force every cached result to be rebuilt
    pub fn invalidate(&mut self) {
        debug!(loader = %self.name, "invalidating particle caches");
        self.cache.invalidate();
    }

    /// Register a viewer
    pub fn add_viewer(&mut self) -> ConsumerKey {
        self.cache.add_consumer()
    }

    /// Forget a viewer; the last one takes the shared particles with it
    pub fn remove_viewer(&mut self, key: &ConsumerKey) -> bool {
        self.cache.remove_consumer(key)
    }

    fn assembly(&self) -> Assembly<'_> {
        Assembly {
            name: &self.name,
            settings: &self.settings,
            pool: &self.pool,
        }
    }

    /// Assemble the render chain for the context's time, negotiated to
    /// `requested`. Fails before any record is read if a requested channel
    /// cannot be produced.
    pub fn render_stream(
        &mut self,
        context: &dyn RenderContext,
        requested: &Schema,
    ) -> std::result::Result<Box<dyn ParticleStream>, PipelineError> {
        let result = self.assembly().render(context, requested);
        self.settle(context, result)
    }

    /// Expected number of rendered particles: the files' count scaled by
    /// the render fraction and capped by the limit. `None` when the files do
    /// not know their count.
    pub fn estimated_render_count(&mut self, context: &dyn RenderContext) -> std::result::Result<Option<u64>, PipelineError> {
        let limits = self.settings.render;
        let result = self
            .assembly()
            .source(context, context.time(), &Schema::empty())
            .map(|(stream, _)| stream.count().map(|count| limits.estimate(count)));
        self.settle(context, result)
    }

    /// Particles for viewer `key` at the context's time, in
    /// [`viewer_schema`] layout. Velocities are in units per frame and
    /// colours are clamped to `[0, 1]`.
    pub fn viewport_particles(
        &mut self,
        key: &ConsumerKey,
        context: &dyn RenderContext,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<Arc<ParticleArray>, PipelineError> {
        let assembly = Assembly {
            name: &self.name,
            settings: &self.settings,
            pool: &self.pool,
        };
        let result = self.cache.query_consumer(
            key,
            context.time(),
            progress,
            |t| assembly.local(context, t),
            |local, t| assembly.viewer(local, context, t),
        );
        let particles = self.settle(context, result)?;
        context.report_bounds(self.viewport_bounds(key));
        Ok(particles)
    }

    /// World-space bounds of viewer `key`'s particles
    pub fn viewport_bounds(&self, key: &ConsumerKey) -> Aabb {
        self.cache.consumer(key).map_or(Aabb::EMPTY, |cache| cache.bounds())
    }

    fn settle<T>(&mut self, context: &dyn RenderContext, result: Result<T>) -> std::result::Result<T, PipelineError> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Ok(value)
            }
            Err(e) => {
                let failure = PipelineError::classify(e);
                if !failure.is_cancelled() {
                    error!(loader = %self.name, error = %failure, "particle evaluation failed");
                    self.last_error = Some(failure.to_string());
                    context.report_error(&failure);
                }
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SceneContext, ShaderMaterial};
    use crate::frames::{FrameRange, RangeMode};
    use crate::shaders::GradientShader;
    use partstream_cache::CacheState;
    use partstream_core::{CancelFlag, NullProgress};
    use partstream_readers::{write_stream, LoadPolicy, PrtWriterOptions};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use test_case::test_case;

    const FPS: f64 = 10.0;

    struct Particle {
        position: Vec3,
        velocity: Vec3,
        density: f32,
    }

    fn file_schema(color: bool) -> Schema {
        let mut channels = vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<Vec3>("Velocity"),
            Channel::of::<f32>("Density"),
        ];
        if color {
            channels.push(Channel::of::<Vec3>("PRTViewportColor"));
        }
        Schema::new(channels).unwrap()
    }

    fn write(path: &Path, particles: &[Particle], viewport_color: Option<Vec3>) {
        let schema = file_schema(viewport_color.is_some());
        let mut array = ParticleArray::new(schema.clone());
        for p in particles {
            let mut record = schema.default_record();
            schema.get_accessor::<Vec3>("Position").unwrap().set(&mut record, p.position);
            schema.get_accessor::<Vec3>("Velocity").unwrap().set(&mut record, p.velocity);
            schema.get_accessor::<f32>("Density").unwrap().set(&mut record, p.density);
            if let Some(color) = viewport_color {
                schema.get_accessor::<Vec3>("PRTViewportColor").unwrap().set(&mut record, color);
            }
            array.push(&record).unwrap();
        }
        write_stream(path, &mut ArrayStream::from_array(array), &NullProgress, PrtWriterOptions::default()).unwrap();
    }

    /// Frames 0..=3 of `n` particles at `x = 10 * frame + i`, moving at
    /// 100 units per second along x to match the 10 fps scene
    fn sequence(n: usize) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        for frame in 0..=3 {
            let particles: Vec<Particle> = (0..n)
                .map(|i| Particle {
                    position: Vec3::new(10.0 * frame as f32 + i as f32, 0.0, 0.0),
                    velocity: Vec3::new(100.0, 0.0, 0.0),
                    density: 1.0,
                })
                .collect();
            write(&dir.path().join(format!("cloud_{frame:04}.prt")), &particles, None);
        }
        let first = dir.path().join("cloud_0000.prt");
        (dir, first)
    }

    fn settings(file: &Path) -> LoaderSettings {
        let mut settings = LoaderSettings::default();
        settings.files = vec![file.to_path_buf()];
        settings.sequence.parallel = false;
        settings.viewport.fraction = 1.0;
        settings
    }

    fn loader(settings: LoaderSettings) -> ParticleLoader {
        ParticleLoader::new("loader", settings).with_pool(Arc::new(WorkerPool::sequential()))
    }

    fn context(frame: f64) -> SceneContext {
        SceneContext::new(frame / FPS).with_frame_rate(FPS)
    }

    fn position_schema() -> Schema {
        Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap()
    }

    fn render(loader: &mut ParticleLoader, context: &SceneContext, requested: &Schema) -> ParticleArray {
        let mut stream = loader.render_stream(context, requested).unwrap();
        ParticleArray::from_stream(stream.as_mut(), &NullProgress).unwrap()
    }

    fn xs(array: &ParticleArray) -> Vec<f32> {
        let position = array.schema().get_accessor::<Vec3>("Position").unwrap();
        array.iter().map(|r| position.get(r).x).collect()
    }

    #[test]
    fn test_render_whole_frame() {
        let (_dir, file) = sequence(3);
        let mut loader = loader(settings(&file));
        let out = render(&mut loader, &context(2.0), &position_schema());
        assert_eq!(xs(&out), [20.0, 21.0, 22.0]);
        assert!(loader.last_error().is_none());
    }

    #[test]
    fn test_subframe_push_by_velocity() {
        let (_dir, file) = sequence(1);
        let mut loader = loader(settings(&file));
        let out = render(&mut loader, &context(1.25), &position_schema());
        assert_eq!(out.len(), 1);
        assert!((xs(&out)[0] - 12.5).abs() < 1e-4);
    }

    #[test]
    fn test_interpolated_frames() {
        let (_dir, file) = sequence(1);
        let mut settings = settings(&file);
        settings.interpolate = true;
        let mut loader = loader(settings);
        let out = render(&mut loader, &context(1.75), &position_schema());
        assert!((xs(&out)[0] - 17.5).abs() < 1e-4);
    }

    #[test_case(RangeMode::Blank, 5.0, &[] ; "blank after")]
    #[test_case(RangeMode::Hold, 5.0, &[20.0] ; "hold after")]
    fn test_frame_range(after: RangeMode, frame: f64, expected: &[f32]) {
        let (_dir, file) = sequence(1);
        let mut settings = settings(&file);
        settings.range = Some(FrameRange {
            start: 1,
            end: 2,
            before: RangeMode::Blank,
            after,
        });
        let mut loader = loader(settings);
        let out = render(&mut loader, &context(frame), &position_schema());
        assert_eq!(xs(&out), expected);
    }

    #[test]
    fn test_single_frame_zeroes_velocity() {
        let (_dir, file) = sequence(2);
        let mut settings = settings(&file);
        settings.single_frame = true;
        let mut loader = loader(settings);
        let requested = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<Vec3>("Velocity")]).unwrap();
        let out = render(&mut loader, &context(2.6), &requested);

        assert_eq!(xs(&out), [0.0, 1.0]);
        let velocity = requested.get_accessor::<Vec3>("Velocity").unwrap();
        assert!(out.iter().all(|r| velocity.get(r) == Vec3::ZERO));
    }

    #[test]
    fn test_density_compensation() {
        let (_dir, file) = sequence(10);
        let mut settings = settings(&file);
        settings.render.fraction = 0.5;
        let mut loader = loader(settings);
        let requested = Schema::new(vec![Channel::of::<f32>("Density")]).unwrap();
        let out = render(&mut loader, &context(0.0), &requested);

        assert_eq!(out.len(), 5);
        let density = requested.get_accessor::<f32>("Density").unwrap();
        assert!(out.iter().all(|r| density.get(r) == 2.0));
    }

    #[test]
    fn test_sampling_by_id_without_ids_falls_back() {
        let (_dir, file) = sequence(10);
        let mut settings = settings(&file);
        settings.render.fraction = 0.3;
        settings.render.policy = SamplingPolicy::ById;
        let mut loader = loader(settings);
        let out = render(&mut loader, &context(0.0), &position_schema());
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_estimated_render_count() {
        let (_dir, file) = sequence(10);
        let mut settings = settings(&file);
        settings.render.fraction = 0.5;
        settings.render.limit = Some(4);
        let mut loader = loader(settings);
        assert_eq!(loader.estimated_render_count(&context(0.0)).unwrap(), Some(4));
    }

    #[test]
    fn test_wire_color_and_material() {
        let (_dir, file) = sequence(2);
        let requested = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<Vec3>("Color")]).unwrap();
        let color = requested.get_accessor::<Vec3>("Color").unwrap();

        let mut plain = loader(settings(&file));
        let wired = context(0.0).with_wire_color(Vec3::new(0.0, 0.0, 1.0));
        let out = render(&mut plain, &wired, &requested);
        assert!(out.iter().all(|r| color.get(r) == Vec3::Z));

        let gradient = GradientShader::new(Vec3::ZERO, Vec3::X, Vec3::ZERO, Vec3::ONE);
        let shaded = context(0.0).with_material(Arc::new(ShaderMaterial::new("gradient", gradient)));
        let out = render(&mut plain, &shaded, &requested);
        let colors: Vec<Vec3> = out.iter().map(|r| color.get(r)).collect();
        assert_eq!(colors, [Vec3::ZERO, Vec3::ONE]);
    }

    #[test]
    fn test_context_transform_applies() {
        let (_dir, file) = sequence(1);
        let mut loader = loader(settings(&file));
        let moved = context(0.0).with_transform(Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)));
        let out = render(&mut loader, &moved, &position_schema());
        let position = out.schema().get_accessor::<Vec3>("Position").unwrap();
        assert_eq!(position.get(out.get(0).unwrap()), Vec3::new(0.0, 5.0, 0.0));
    }

    #[test]
    fn test_missing_channel_fails_fast() {
        let (_dir, file) = sequence(1);
        let mut loader = loader(settings(&file));
        let context = context(0.0);
        let requested = Schema::new(vec![Channel::of::<f32>("Temperature")]).unwrap();
        let result = loader.render_stream(&context, &requested);
        assert!(matches!(result, Err(PipelineError::Schema(_))));
        assert_eq!(context.reported_errors().len(), 1);
    }

    #[test_case(LoadPolicy::Strict ; "strict")]
    #[test_case(LoadPolicy::Lenient ; "lenient")]
    fn test_missing_file(policy: LoadPolicy) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir.path().join("cloud_0000.prt"));
        settings.sequence.policy = policy;
        let mut loader = loader(settings);
        let context = context(0.0);

        match loader.render_stream(&context, &position_schema()) {
            Ok(mut stream) => {
                assert_eq!(policy, LoadPolicy::Lenient);
                let out = ParticleArray::from_stream(stream.as_mut(), &NullProgress).unwrap();
                assert!(out.is_empty());
            }
            Err(e) => {
                assert_eq!(policy, LoadPolicy::Strict);
                assert!(matches!(e, PipelineError::Source(_)));
                assert!(loader.last_error().is_some());
                assert_eq!(context.reported_errors().len(), 1);
            }
        }
    }

    #[test]
    fn test_viewers_share_local_particles() {
        let (_dir, file) = sequence(2);
        let mut loader = loader(settings(&file));
        let a = loader.add_viewer();
        let b = loader.add_viewer();
        let context = context(1.0).with_velocity(Vec3::new(0.0, 1.0, 0.0));

        let first = loader.viewport_particles(&a, &context, &NullProgress).unwrap();
        let second = loader.viewport_particles(&b, &context, &NullProgress).unwrap();
        assert_eq!(loader.cache().local().stats().populations, 1);
        assert_eq!(first.as_bytes(), second.as_bytes());

        let layout = viewer_schema().unwrap();
        assert_eq!(first.schema(), &layout);
        let velocity = layout.get_accessor::<Vec3>("Velocity").unwrap();
        let color = layout.get_accessor::<Vec3>("Color").unwrap();
        for record in first.iter() {
            // Particle and object motion, per frame at 10 fps
            assert!((velocity.get(record) - Vec3::new(10.0, 0.1, 0.0)).length() < 1e-4);
            assert_eq!(color.get(record), Vec3::splat(0.5));
        }

        let bounds = loader.viewport_bounds(&a);
        assert_eq!(bounds, Aabb::new(Vec3::new(10.0, 0.1, 0.0), Vec3::new(11.0, 0.1, 0.0)));
        assert_eq!(context.reported_bounds(), Some(bounds));
    }

    #[test]
    fn test_viewport_color_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cloud_0000.prt");
        let particle = Particle {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            density: 1.0,
        };
        write(&file, &[particle], Some(Vec3::new(2.0, -1.0, 0.5)));
        let mut loader = loader(settings(&file));
        let viewer = loader.add_viewer();

        let particles = loader.viewport_particles(&viewer, &context(0.0), &NullProgress).unwrap();
        let color = viewer_schema().unwrap().get_accessor::<Vec3>("Color").unwrap();
        assert_eq!(color.get(particles.get(0).unwrap()), Vec3::new(1.0, 0.0, 0.5));
    }

    #[test]
    fn test_viewport_invalidation_and_release() {
        let (_dir, file) = sequence(1);
        let mut loader = loader(settings(&file));
        let viewer = loader.add_viewer();
        let context = context(1.0);

        loader.viewport_particles(&viewer, &context, &NullProgress).unwrap();
        loader.viewport_particles(&viewer, &context, &NullProgress).unwrap();
        assert_eq!(loader.cache().local().stats().populations, 1);

        loader.invalidate();
        assert_eq!(loader.cache().consumer(&viewer).unwrap().state(), CacheState::Stale);
        loader.viewport_particles(&viewer, &context, &NullProgress).unwrap();
        assert_eq!(loader.cache().local().stats().populations, 2);

        // A new time outside the cached instant rebuilds
        loader.viewport_particles(&viewer, &context.at(0.2), &NullProgress).unwrap();
        assert_eq!(loader.cache().local().stats().populations, 3);

        assert!(loader.remove_viewer(&viewer));
        assert_eq!(loader.cache().local().state(), CacheState::Empty);
    }

    #[test]
    fn test_cancelled_viewport_keeps_cache() {
        let (_dir, file) = sequence(1);
        let mut loader = loader(settings(&file));
        let viewer = loader.add_viewer();
        let context = context(1.0);
        loader.viewport_particles(&viewer, &context, &NullProgress).unwrap();

        let flag = CancelFlag::new();
        flag.cancel();
        let result = loader.viewport_particles(&viewer, &context.at(0.3), &flag);
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(loader.last_error().is_none());
        assert!(context.reported_errors().is_empty());
        assert_eq!(loader.cache().local().state(), CacheState::Populated);
    }
}
