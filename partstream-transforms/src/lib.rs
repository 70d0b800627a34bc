//! Decorator streams for particle pipelines
//!
//! Every decorator owns exactly one delegate (interpolation owns two
//! siblings), declares the channels it reads and writes, and takes part in
//! schema negotiation through [`partstream_core::Negotiated`]. Stacking them
//! builds a chain that is pulled from the outermost decorator:
//!
//! ```text
//! file -> transform -> fractional -> volume-cull -> shade -> consumer
//! ```

#![warn(missing_docs)]

pub mod constant;
pub mod cull;
pub mod density;
pub mod fractional;
pub mod function;
pub mod hash;
pub mod interpolate;
pub mod selection;
pub mod shade;
pub mod transform;
pub mod volume;

pub use constant::SetConstantStream;
pub use cull::{SurfaceCullOptions, SurfaceCullStream, VolumeCullStream};
pub use density::{DensityFactor, DensityScaleStream};
pub use fractional::{FractionalStream, Sampling, SamplingPolicy};
pub use function::{ApplyFunctionStream, Builtin, FunctionSpec, Kernel};
pub use interpolate::TimeInterpolateStream;
pub use selection::{SelectionCullStream, SelectionMode};
pub use shade::{ShadeStream, Shader};
pub use transform::TransformStream;
pub use volume::{BoxVolume, CullingVolume, HalfSpace, Sphere, VolumeSpec, VolumeUnion};

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};
    use partstream_core::{negotiate, Channel, NullProgress, ParticleArray, ParticleStream, Schema};
    use partstream_readers::ArrayStream;

    fn array(positions: &[Vec3]) -> ArrayStream {
        let schema = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<f32>("Density")]).unwrap();
        let position = schema.get_accessor::<Vec3>("Position").unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for p in positions {
            let mut record = schema.default_record();
            position.set(&mut record, *p);
            array.push(&record).unwrap();
        }
        ArrayStream::from_array(array)
    }

    #[test]
    fn test_constant_color_on_first_record() {
        let source = array(&[Vec3::new(1.0, 2.0, 3.0), Vec3::splat(4.0), Vec3::splat(5.0)]);
        let colored = SetConstantStream::new(source, "Color", Vec3::ONE).unwrap();
        let mut chain = FractionalStream::new(colored, Sampling::first_n(1)).unwrap();

        let requested = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<Vec3>("Color")]).unwrap();
        negotiate(&mut chain, &requested, None).unwrap();
        let out = ParticleArray::from_stream(&mut chain, &NullProgress).unwrap();

        assert_eq!(out.len(), 1);
        let record = out.get(0).unwrap();
        assert_eq!(requested.get_accessor::<Vec3>("Color").unwrap().get(record), Vec3::ONE);
        assert_eq!(
            requested.get_accessor::<Vec3>("Position").unwrap().get(record),
            Vec3::new(1.0, 2.0, 3.0)
        );
    }

    #[test]
    fn test_interpolated_siblings() {
        let a = array(&[Vec3::ZERO]);
        let b = array(&[Vec3::new(10.0, 0.0, 0.0)]);
        let mut chain = TimeInterpolateStream::new(a, b, 0.3).unwrap();

        let requested = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        negotiate(&mut chain, &requested, None).unwrap();
        let mut record = requested.default_record();
        assert!(chain.next(&mut record).unwrap());

        let position = requested.get_accessor::<Vec3>("Position").unwrap().get(&record);
        assert!((position - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-6);
        assert!(!chain.next(&mut record).unwrap());
    }

    #[test]
    fn test_missing_channel_fails_before_pull() {
        let mut chain = TransformStream::fixed(array(&[Vec3::ZERO]), Mat4::IDENTITY).unwrap();
        let requested = Schema::new(vec![Channel::of::<Vec3>("Velocity")]).unwrap();
        assert!(negotiate(&mut chain, &requested, None).is_err());
        assert_eq!(chain.position(), 0);
    }

    #[test]
    fn test_negotiation_is_idempotent() {
        let positions: Vec<Vec3> = (0..50).map(|i| Vec3::splat(i as f32)).collect();
        let requested = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        let run = |twice: bool| {
            let moved = TransformStream::fixed(array(&positions), Mat4::from_translation(Vec3::Y)).unwrap();
            let mut chain = FractionalStream::new(moved, Sampling::evenly(0.3)).unwrap();
            chain.set_schema(&requested).unwrap();
            if twice {
                chain.set_schema(&requested).unwrap();
            }
            ParticleArray::from_stream(&mut chain, &NullProgress).unwrap().as_bytes().to_vec()
        };
        assert_eq!(run(false), run(true));
    }
}
