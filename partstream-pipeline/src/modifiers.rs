//! Modifier stack entries, as configured by the host

use partstream_core::{channels, Channel, DataType, Error, ParticleStream, Result};
use partstream_transforms::{
    ApplyFunctionStream, Builtin, DensityFactor, DensityScaleStream, SelectionCullStream, SelectionMode,
    SetConstantStream, SurfaceCullOptions, SurfaceCullStream, VolumeCullStream, VolumeSpec,
};
use serde::{Deserialize, Serialize};

fn density() -> String {
    channels::DENSITY.to_string()
}

fn float32() -> DataType {
    DataType::Float32
}

/// One entry of a modifier stack.
///
/// Entries are applied in list order, each wrapping the chain built so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modifier", rename_all = "snake_case")]
pub enum ModifierSpec {
    /// A built-in per-record function
    Function(Builtin),

    /// Force a channel to a constant
    SetConstant {
        /// Channel to set
        channel: String,
        /// Element type the channel is declared with
        #[serde(default = "float32")]
        data_type: DataType,
        /// One value per element
        value: Vec<f64>,
    },

    /// Multiply a scalar channel by a constant
    ScaleDensity {
        /// Channel to scale
        #[serde(default = "density")]
        channel: String,
        /// Multiplier
        factor: f32,
    },

    /// Multiply a scalar channel by another channel
    ScaleDensityByChannel {
        /// Channel to scale
        #[serde(default = "density")]
        channel: String,
        /// Channel holding the multiplier
        source: String,
    },

    /// Remove selected particles
    DeleteSelected {
        /// Hard or soft selection
        #[serde(default)]
        mode: SelectionMode,
        /// Clear the selection of the survivors
        #[serde(default)]
        reset_selection: bool,
        /// Seed for soft selection
        #[serde(default)]
        seed: u64,
    },

    /// Remove particles inside (or outside) a volume
    CullVolume {
        /// The volume
        volume: VolumeSpec,
        /// Keep the inside instead
        #[serde(default)]
        invert: bool,
    },

    /// Remove particles by depth below a volume's surface
    CullSurface {
        /// The volume
        volume: VolumeSpec,
        /// Threshold and flags
        #[serde(default)]
        options: SurfaceCullOptions,
    },
}

impl ModifierSpec {
    /// Wrap `stream` in the decorator this entry describes
    pub fn apply(&self, stream: Box<dyn ParticleStream>) -> Result<Box<dyn ParticleStream>> {
        Ok(match self {
            ModifierSpec::Function(builtin) => Box::new(ApplyFunctionStream::new(stream, builtin.spec())?),
            ModifierSpec::SetConstant {
                channel,
                data_type,
                value,
            } => {
                if value.is_empty() {
                    return Err(Error::InvalidArgument(format!("constant for '{channel}' has no value")));
                }
                let channel = Channel::new(channel.as_str(), value.len(), *data_type);
                Box::new(SetConstantStream::from_elements(stream, channel, value.clone())?)
            }
            ModifierSpec::ScaleDensity { channel, factor } => Box::new(DensityScaleStream::for_channel(
                stream,
                channel,
                DensityFactor::Constant(*factor),
            )?),
            ModifierSpec::ScaleDensityByChannel { channel, source } => Box::new(DensityScaleStream::for_channel(
                stream,
                channel,
                DensityFactor::Channel(source.clone()),
            )?),
            ModifierSpec::DeleteSelected {
                mode,
                reset_selection,
                seed,
            } => Box::new(SelectionCullStream::new(stream, *mode, *reset_selection)?.with_seed(*seed)),
            ModifierSpec::CullVolume { volume, invert } => {
                Box::new(VolumeCullStream::new(stream, volume.build(), *invert)?)
            }
            ModifierSpec::CullSurface { volume, options } => {
                Box::new(SurfaceCullStream::new(stream, volume.build(), *options)?)
            }
        })
    }
}

/// Apply every entry of `stack` in order
pub fn apply_all(stack: &[ModifierSpec], mut stream: Box<dyn ParticleStream>) -> Result<Box<dyn ParticleStream>> {
    for modifier in stack {
        stream = modifier.apply(stream)?;
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use partstream_core::{NullProgress, ParticleArray, Schema};
    use partstream_readers::ArrayStream;
    use serde_json::json;

    fn particles() -> Box<dyn ParticleStream> {
        let schema = Schema::new(vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<f32>("Density"),
            Channel::of::<f32>("Selection"),
        ])
        .unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for (x, selected) in [(0.0, 0.0), (1.0, 1.0), (2.0, 0.0)] {
            let mut record = schema.default_record();
            schema.get_accessor::<Vec3>("Position").unwrap().set(&mut record, Vec3::new(x, 0.0, 0.0));
            schema.get_accessor::<f32>("Density").unwrap().set(&mut record, 1.0);
            schema.get_accessor::<f32>("Selection").unwrap().set(&mut record, selected);
            array.push(&record).unwrap();
        }
        Box::new(ArrayStream::from_array(array))
    }

    #[test]
    fn test_parse_stack() {
        let stack: Vec<ModifierSpec> = serde_json::from_value(json!([
            {"modifier": "function", "function": "scale_vector", "channel": "Velocity", "factor": 2.0},
            {"modifier": "set_constant", "channel": "Color", "value": [1.0, 0.0, 0.0]},
            {"modifier": "scale_density", "factor": 0.5},
            {"modifier": "delete_selected"},
            {"modifier": "cull_volume", "volume": {"shape": "sphere", "center": [0, 0, 0], "radius": 1.0}}
        ]))
        .unwrap();

        assert_eq!(stack.len(), 5);
        assert_eq!(
            stack[0],
            ModifierSpec::Function(Builtin::ScaleVector {
                channel: "Velocity".to_string(),
                factor: 2.0
            })
        );
        assert!(matches!(&stack[2], ModifierSpec::ScaleDensity { channel, .. } if channel == "Density"));
        assert!(matches!(
            stack[3],
            ModifierSpec::DeleteSelected {
                mode: SelectionMode::Hard,
                reset_selection: false,
                seed: 0
            }
        ));
    }

    #[test]
    fn test_apply_stack_in_order() {
        let stack = vec![
            ModifierSpec::DeleteSelected {
                mode: SelectionMode::Hard,
                reset_selection: false,
                seed: 0,
            },
            ModifierSpec::ScaleDensity {
                channel: "Density".to_string(),
                factor: 3.0,
            },
            ModifierSpec::SetConstant {
                channel: "Color".to_string(),
                data_type: DataType::Float32,
                value: vec![0.0, 1.0, 0.0],
            },
        ];
        let mut chain = apply_all(&stack, particles()).unwrap();
        let requested = Schema::new(vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<f32>("Density"),
            Channel::of::<Vec3>("Color"),
        ])
        .unwrap();
        chain.set_schema(&requested).unwrap();
        let out = ParticleArray::from_stream(chain.as_mut(), &NullProgress).unwrap();

        let position = requested.get_accessor::<Vec3>("Position").unwrap();
        let density = requested.get_accessor::<f32>("Density").unwrap();
        let color = requested.get_accessor::<Vec3>("Color").unwrap();
        let xs: Vec<f32> = out.iter().map(|r| position.get(r).x).collect();
        assert_eq!(xs, [0.0, 2.0]);
        assert!(out.iter().all(|r| density.get(r) == 3.0 && color.get(r) == Vec3::Y));
    }

    #[test]
    fn test_empty_constant() {
        let modifier = ModifierSpec::SetConstant {
            channel: "Density".to_string(),
            data_type: DataType::Float32,
            value: vec![],
        };
        assert!(modifier.apply(particles()).is_err());
    }
}
