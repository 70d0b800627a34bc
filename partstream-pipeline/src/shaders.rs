//! Stock shaders usable as materials

use glam::Vec3;
use partstream_core::{channels, Channel, ConvertingAccessor, Result, Schema};
use partstream_transforms::Shader;
use serde::{Deserialize, Serialize};

/// Entries in a gradient lookup table
const GRADIENT_STEPS: usize = 256;

/// Colours particles by where their position falls between two points.
///
/// Each worker samples the gradient into its own lookup table once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientShader {
    /// Where the gradient starts
    pub start: Vec3,
    /// Where the gradient ends
    pub end: Vec3,
    /// Colour at `start` and before
    pub from: Vec3,
    /// Colour at `end` and after
    pub to: Vec3,
    #[serde(skip)]
    position: Option<ConvertingAccessor<Vec3>>,
    #[serde(skip)]
    color: Option<ConvertingAccessor<Vec3>>,
}

impl GradientShader {
    /// Blend from `from` at `start` to `to` at `end`
    pub fn new(start: Vec3, end: Vec3, from: Vec3, to: Vec3) -> Self {
        Self {
            start,
            end,
            from,
            to,
            position: None,
            color: None,
        }
    }

    /// Gradient parameter of `point`, in `[0, 1]`
    fn parameter(&self, point: Vec3) -> f32 {
        let axis = self.end - self.start;
        let length_squared = axis.length_squared();
        if length_squared <= f32::EPSILON {
            return 0.0;
        }
        ((point - self.start).dot(axis) / length_squared).clamp(0.0, 1.0)
    }
}

impl Shader for GradientShader {
    type Context = Vec<Vec3>;

    fn requirements(&self) -> Schema {
        Schema::new(vec![Channel::of::<Vec3>(channels::POSITION)]).unwrap_or_default()
    }

    fn outputs(&self) -> Vec<Channel> {
        vec![Channel::of::<Vec3>(channels::COLOR)]
    }

    fn bind(&mut self, working: &Schema) -> Result<()> {
        self.position = Some(working.get_converting_accessor(channels::POSITION, None)?);
        self.color = working
            .has_channel(channels::COLOR)
            .then(|| working.get_converting_accessor(channels::COLOR, None))
            .transpose()?;
        Ok(())
    }

    fn create_context(&self) -> Result<Vec<Vec3>> {
        let last = (GRADIENT_STEPS - 1) as f32;
        Ok((0..GRADIENT_STEPS)
            .map(|i| self.from.lerp(self.to, i as f32 / last))
            .collect())
    }

    fn shade(&self, table: &mut Vec<Vec3>, record: &mut [u8]) {
        let (Some(position), Some(color)) = (self.position, self.color) else {
            return;
        };
        let step = (self.parameter(position.get(record)) * (table.len() - 1) as f32).round() as usize;
        if let Some(value) = table.get(step) {
            color.set(record, *value);
        }
    }
}
