//! What the host supplies to an evaluation, and what it gets back

use std::fmt;
use std::sync::{Arc, Mutex};

use glam::{Mat4, Vec3, Vec4};
use partstream_core::{Aabb, Interval, ParticleStream, Result, Time};
use partstream_parallel::WorkerPool;
use partstream_transforms::{ShadeStream, Shader};

use crate::error::PipelineError;

/// Shading bound to a host object.
///
/// A material wraps the world-space chain in whatever shading it performs.
pub trait Material: Send + Sync {
    /// Name for log messages
    fn name(&self) -> &str;

    /// Wrap `stream` in this material's shading, batching on `pool`
    fn apply(&self, stream: Box<dyn ParticleStream>, pool: Arc<WorkerPool>) -> Result<Box<dyn ParticleStream>>;
}

/// A [`Material`] backed by one [`Shader`]
#[derive(Debug, Clone)]
pub struct ShaderMaterial<H> {
    name: String,
    shader: H,
}

impl<H> ShaderMaterial<H> {
    /// Name `shader` as a material
    pub fn new(name: impl Into<String>, shader: H) -> Self {
        Self {
            name: name.into(),
            shader,
        }
    }
}

impl<H: Shader + Clone + 'static> Material for ShaderMaterial<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, stream: Box<dyn ParticleStream>, pool: Arc<WorkerPool>) -> Result<Box<dyn ParticleStream>> {
        Ok(Box::new(ShadeStream::new(stream, self.shader.clone(), pool)?))
    }
}

/// The host scene, as seen by one loader evaluation.
///
/// Passed explicitly into every evaluation; nothing is looked up globally.
pub trait RenderContext: Send + Sync {
    /// The instant being evaluated
    fn time(&self) -> Time;

    /// Scene frames per second
    fn frame_rate(&self) -> f64 {
        30.0
    }

    /// Object-to-world transform at `t`
    fn transform(&self, t: Time) -> Mat4;

    /// Time derivative of [`RenderContext::transform`] at `t`, per second
    fn transform_derivative(&self, _t: Time) -> Mat4 {
        Mat4::ZERO
    }

    /// Interval over which the transform at `t` stays the same
    fn transform_validity(&self, _t: Time) -> Interval {
        Interval::FOREVER
    }

    /// Material bound to the object, if any
    fn material(&self) -> Option<Arc<dyn Material>> {
        None
    }

    /// Colour used when the particles carry none
    fn wire_color(&self) -> Vec3 {
        Vec3::splat(0.5)
    }

    /// Receive the world-space bounds of the last evaluation
    fn report_bounds(&self, _bounds: Aabb) {}

    /// Receive an evaluation failure
    fn report_error(&self, _error: &PipelineError) {}
}

#[derive(Debug, Default)]
struct Reported {
    bounds: Option<Aabb>,
    errors: Vec<String>,
}

/// A self-contained [`RenderContext`] for tools and tests: a fixed object
/// transform, optionally translating at constant velocity.
#[derive(Clone)]
pub struct SceneContext {
    time: Time,
    frame_rate: f64,
    transform: Mat4,
    velocity: Vec3,
    wire_color: Vec3,
    material: Option<Arc<dyn Material>>,
    reported: Arc<Mutex<Reported>>,
}

impl fmt::Debug for SceneContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneContext")
            .field("time", &self.time)
            .field("frame_rate", &self.frame_rate)
            .field("transform", &self.transform)
            .field("velocity", &self.velocity)
            .field("material", &self.material.as_ref().map(|m| m.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl SceneContext {
    /// Context at time `t` with an identity transform
    pub fn new(time: Time) -> Self {
        Self {
            time,
            frame_rate: 30.0,
            transform: Mat4::IDENTITY,
            velocity: Vec3::ZERO,
            wire_color: Vec3::splat(0.5),
            material: None,
            reported: Arc::default(),
        }
    }

    /// The same scene at another time; reports are shared
    pub fn at(&self, time: Time) -> Self {
        Self { time, ..self.clone() }
    }

    /// Set the frame rate
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = fps;
        self
    }

    /// Set the transform at time zero
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    /// Translate the object by `velocity` per second
    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    /// Set the wire colour
    pub fn with_wire_color(mut self, color: Vec3) -> Self {
        self.wire_color = color;
        self
    }

    /// Bind a material
    pub fn with_material(mut self, material: Arc<dyn Material>) -> Self {
        self.material = Some(material);
        self
    }

    /// Last bounds reported back
    pub fn reported_bounds(&self) -> Option<Aabb> {
        self.reported.lock().ok().and_then(|r| r.bounds)
    }

    /// Every error reported back, oldest first
    pub fn reported_errors(&self) -> Vec<String> {
        self.reported.lock().map(|r| r.errors.clone()).unwrap_or_default()
    }
}

impl RenderContext for SceneContext {
    fn time(&self) -> Time {
        self.time
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn transform(&self, t: Time) -> Mat4 {
        Mat4::from_translation(self.velocity * t as f32) * self.transform
    }

    fn transform_derivative(&self, _t: Time) -> Mat4 {
        Mat4::from_cols(Vec4::ZERO, Vec4::ZERO, Vec4::ZERO, self.velocity.extend(0.0))
    }

    fn transform_validity(&self, t: Time) -> Interval {
        if self.velocity == Vec3::ZERO {
            Interval::FOREVER
        } else {
            Interval::instant(t)
        }
    }

    fn material(&self) -> Option<Arc<dyn Material>> {
        self.material.clone()
    }

    fn wire_color(&self) -> Vec3 {
        self.wire_color
    }

    fn report_bounds(&self, bounds: Aabb) {
        if let Ok(mut reported) = self.reported.lock() {
            reported.bounds = Some(bounds);
        }
    }

    fn report_error(&self, error: &PipelineError) {
        if let Ok(mut reported) = self.reported.lock() {
            reported.errors.push(error.to_string());
        }
    }
}
