//! Host key/value settings and their typed form

use std::collections::BTreeMap;
use std::path::PathBuf;

use partstream_readers::LoadPolicy;
use partstream_transforms::{Sampling, SamplingPolicy, SurfaceCullOptions, VolumeSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::frames::{FrameRange, FrameTiming, SequenceOptions};
use crate::modifiers::ModifierSpec;

/// Settings as the host stores them: named JSON values
pub type PropertyMap = BTreeMap<String, Value>;

/// How many particles to load for one purpose
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadLimits {
    /// Fraction of the particles to keep, `0..=1`
    pub fraction: f64,

    /// Absolute cap on the number of particles
    pub limit: Option<u64>,

    /// Which particles are kept
    pub policy: SamplingPolicy,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self {
            fraction: 1.0,
            limit: None,
            policy: SamplingPolicy::Evenly,
        }
    }
}

impl LoadLimits {
    /// The sampling these limits describe
    pub fn sampling(&self) -> Sampling {
        Sampling {
            fraction: self.fraction,
            limit: self.limit,
            policy: self.policy,
            seed: 0,
        }
    }

    /// Expected number of particles out of `count`:
    /// `clamp(count * fraction, 0, limit)`
    pub fn estimate(&self, count: u64) -> u64 {
        let scaled = (count as f64 * self.fraction.clamp(0.0, 1.0)).floor() as u64;
        self.limit.map_or(scaled, |limit| scaled.min(limit))
    }
}

/// Culling applied to the world-space particles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CullingSettings {
    /// Whether culling runs at all
    pub enabled: bool,

    /// Volumes whose union is culled against
    pub volumes: Vec<VolumeSpec>,

    /// Keep the inside instead of removing it
    pub invert: bool,

    /// Cull by depth below the surface instead of by containment
    pub surface: Option<SurfaceCullOptions>,
}

/// Typed loader settings.
///
/// Built once per chain assembly from a [`PropertyMap`]; unknown keys are
/// ignored and missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// One member of each file sequence to load
    pub files: Vec<PathBuf>,

    /// Opening and failure policy for sequence files
    pub sequence: SequenceOptions,

    /// Frames added to the computed frame number
    pub frame_offset: i64,

    /// Sequence frames per scene frame
    pub playback_rate: f64,

    /// Load exactly the named files, whatever the time
    pub single_frame: bool,

    /// Blend neighbouring frames instead of pushing by velocity
    pub interpolate: bool,

    /// Keep velocities of a sequence that does not move
    pub keep_velocity: bool,

    /// Restrict loading to a frame range
    pub range: Option<FrameRange>,

    /// Limits for rendering
    pub render: LoadLimits,

    /// Limits for viewports, on top of the render fraction
    pub viewport: LoadLimits,

    /// Scale density by `1 / fraction` when loading a fraction
    pub density_compensation: bool,

    /// Modifiers applied before the object transform
    pub object_modifiers: Vec<ModifierSpec>,

    /// Modifiers applied after the object transform
    pub modifiers: Vec<ModifierSpec>,

    /// World-space culling
    pub culling: CullingSettings,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            sequence: SequenceOptions::default(),
            frame_offset: 0,
            playback_rate: 1.0,
            single_frame: false,
            interpolate: false,
            keep_velocity: false,
            range: None,
            render: LoadLimits::default(),
            viewport: LoadLimits {
                fraction: 0.1,
                ..LoadLimits::default()
            },
            density_compensation: true,
            object_modifiers: Vec::new(),
            modifiers: Vec::new(),
            culling: CullingSettings::default(),
        }
    }
}

impl LoaderSettings {
    /// Convert host settings
    pub fn from_properties(properties: &PropertyMap) -> Result<Self, PipelineError> {
        let object = properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// These settings as host key/value pairs
    pub fn to_properties(&self) -> Result<PropertyMap, PipelineError> {
        match serde_json::to_value(self)? {
            Value::Object(object) => Ok(object.into_iter().collect()),
            _ => Ok(PropertyMap::new()),
        }
    }

    /// Frame mapping for a scene running at `fps`
    pub fn timing(&self, fps: f64) -> FrameTiming {
        FrameTiming {
            fps,
            rate: self.playback_rate,
            offset: self.frame_offset,
        }
    }

    /// Limits for viewports: the viewport fraction of the render fraction
    pub fn viewport_limits(&self) -> LoadLimits {
        LoadLimits {
            fraction: self.viewport.fraction * self.render.fraction,
            ..self.viewport
        }
    }

    /// Whether missing files are skipped instead of failing
    pub fn is_lenient(&self) -> bool {
        self.sequence.policy == LoadPolicy::Lenient
    }

    /// Whether velocities are forced to zero, given whether the loaded
    /// frames are moving
    pub(crate) fn zeroes_velocity(&self, is_static: bool) -> bool {
        !self.keep_velocity && (self.single_frame || self.range.is_some_and(|r| r.is_single()) || is_static)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::RangeMode;
    use serde_json::json;
    use test_case::test_case;

    fn properties(value: Value) -> PropertyMap {
        match value {
            Value::Object(object) => object.into_iter().collect(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_defaults_from_empty_map() {
        let settings = LoaderSettings::from_properties(&PropertyMap::new()).unwrap();
        assert_eq!(settings, LoaderSettings::default());
        assert_eq!(settings.viewport.fraction, 0.1);
        assert!(settings.density_compensation);
    }

    #[test]
    fn test_from_properties() {
        let settings = LoaderSettings::from_properties(&properties(json!({
            "files": ["/data/cloud_0000.prt"],
            "sequence": {"policy": "lenient", "parallel": false},
            "frame_offset": -3,
            "interpolate": true,
            "range": {"start": 0, "end": 10, "after": "blank"},
            "render": {"fraction": 0.5, "limit": 1000, "policy": "by_id"},
            "modifiers": [{"modifier": "scale_density", "factor": 2.0}],
            "culling": {"enabled": true, "volumes": [{"shape": "sphere", "center": [0, 0, 0], "radius": 2.0}]},
            "unrelated": "ignored"
        })))
        .unwrap();

        assert!(settings.is_lenient());
        assert!(!settings.sequence.parallel);
        assert_eq!(settings.frame_offset, -3);
        assert_eq!(
            settings.range,
            Some(FrameRange {
                start: 0,
                end: 10,
                before: RangeMode::Hold,
                after: RangeMode::Blank
            })
        );
        assert_eq!(settings.render.policy, SamplingPolicy::ById);
        assert_eq!(settings.render.limit, Some(1000));
        assert_eq!(settings.modifiers.len(), 1);
        assert_eq!(settings.culling.volumes.len(), 1);
    }

    #[test]
    fn test_bad_value_is_a_settings_error() {
        let result = LoaderSettings::from_properties(&properties(json!({"playback_rate": "fast"})));
        assert!(matches!(result, Err(PipelineError::Settings(_))));
    }

    #[test]
    fn test_properties_round_trip() {
        let mut settings = LoaderSettings::default();
        settings.render.limit = Some(5);
        settings.single_frame = true;
        let back = LoaderSettings::from_properties(&settings.to_properties().unwrap()).unwrap();
        assert_eq!(back, settings);
    }

    #[test_case(1000, 0.5, None, 500 ; "fraction")]
    #[test_case(1000, 0.5, Some(100), 100 ; "limit")]
    #[test_case(1000, 0.0, None, 0 ; "nothing")]
    #[test_case(10, 2.0, None, 10 ; "fraction above one")]
    fn test_estimate(count: u64, fraction: f64, limit: Option<u64>, expected: u64) {
        let limits = LoadLimits {
            fraction,
            limit,
            policy: SamplingPolicy::Evenly,
        };
        assert_eq!(limits.estimate(count), expected);
    }

    #[test]
    fn test_viewport_fraction_scales_render_fraction() {
        let mut settings = LoaderSettings::default();
        settings.render.fraction = 0.5;
        settings.viewport.fraction = 0.2;
        assert!((settings.viewport_limits().fraction - 0.1).abs() < 1e-12);
    }
}
