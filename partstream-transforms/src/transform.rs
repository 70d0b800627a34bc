//! Affine transformation of spatial channels

use glam::{Mat3, Mat4, Vec3, Vec4};
use partstream_core::{channels, Channel, ConvertingAccessor, Error, Negotiated, ParticleStream, Result, Schema};

/// Channels transformed as directions (no translation)
const VECTOR_CHANNELS: [&str; 3] = [channels::VELOCITY, channels::ACCELERATION, channels::TANGENT];

/// Channels transformed as surface normals
const NORMAL_CHANNELS: [&str; 1] = [channels::NORMAL];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Point,
    Vector,
    Normal,
}

#[derive(Debug, Clone)]
struct Binding {
    kind: Kind,
    accessor: ConvertingAccessor<Vec3>,
    is_velocity: bool,
}

/// Applies an affine map to `Position`, direction channels (`Velocity`,
/// `Acceleration`, `Tangent`) and `Normal`.
///
/// `derivative` is the time derivative of the map, per second. When it is
/// non-zero, velocity picks up `derivative * position` so particles move
/// with an animated transform.
pub struct TransformStream<S> {
    delegate: S,
    transform: Mat4,
    derivative: Mat4,
    normal_matrix: Mat3,
    negotiated: Negotiated,
    bindings: Vec<Binding>,
    /// Position as read from upstream, for the velocity term
    source_position: Option<ConvertingAccessor<Vec3>>,
    position: u64,
}

/// Inverse transpose of `linear` up to a positive scale, or zero when the
/// map flattens space and normals are undefined.
///
/// Uses the cofactor matrix so tiny uniform scales keep their normals.
fn normal_matrix(linear: Mat3) -> Mat3 {
    let (a, b, c) = (linear.x_axis, linear.y_axis, linear.z_axis);
    let det = linear.determinant();
    if det.abs() <= f32::EPSILON * a.length() * b.length() * c.length() {
        return Mat3::ZERO;
    }
    Mat3::from_cols(b.cross(c), c.cross(a), a.cross(b)) * det.signum()
}

impl<S: ParticleStream> TransformStream<S> {
    /// Transform records of `delegate` by `transform`, animated with
    /// `derivative`
    pub fn new(delegate: S, transform: Mat4, derivative: Mat4) -> Result<Self> {
        if !transform.is_finite() || !derivative.is_finite() {
            return Err(Error::InvalidArgument("transform is not finite".to_string()));
        }
        let native = delegate.native_schema().clone();
        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            delegate,
            transform,
            derivative,
            normal_matrix: normal_matrix(Mat3::from_mat4(transform)),
            bindings: Vec::new(),
            source_position: None,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    /// A stream that only applies a static transform
    pub fn fixed(delegate: S, transform: Mat4) -> Result<Self> {
        Self::new(delegate, transform, Mat4::ZERO)
    }

    fn animated(&self) -> bool {
        self.derivative != Mat4::ZERO
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let needs_position = self.animated() && requested.has_channel(channels::VELOCITY);
        let mut requirements = Schema::empty();
        if needs_position && !requested.has_channel(channels::POSITION) {
            requirements.append_channel(Channel::of::<Vec3>(channels::POSITION))?;
        }

        let negotiated = Negotiated::new(requested, &requirements, &[])?;
        negotiated.check_delegate(&self.delegate)?;
        self.delegate.set_schema(negotiated.upstream())?;

        let working = negotiated.working();
        let mut bindings = Vec::new();
        let kinds = std::iter::once((channels::POSITION, Kind::Point))
            .chain(VECTOR_CHANNELS.iter().map(|&name| (name, Kind::Vector)))
            .chain(NORMAL_CHANNELS.iter().map(|&name| (name, Kind::Normal)));
        for (name, kind) in kinds {
            if working.has_channel(name) {
                bindings.push(Binding {
                    kind,
                    accessor: working.get_converting_accessor::<Vec3>(name, None)?,
                    is_velocity: name == channels::VELOCITY,
                });
            }
        }
        // Velocity reads the untransformed position, so it goes first
        bindings.sort_by_key(|b| !b.is_velocity);

        self.source_position = if needs_position {
            Some(working.get_converting_accessor::<Vec3>(channels::POSITION, None)?)
        } else {
            None
        };
        self.bindings = bindings;
        self.negotiated = negotiated;
        Ok(())
    }
}

/// Per-record work, detached from the stream so batch closures can borrow it
/// alongside the negotiation state
struct Kernel<'a> {
    transform: Mat4,
    derivative: Mat4,
    normal_matrix: Mat3,
    bindings: &'a [Binding],
    source_position: Option<ConvertingAccessor<Vec3>>,
}

impl Kernel<'_> {
    fn apply(&self, record: &mut [u8]) {
        for binding in self.bindings {
            let value = binding.accessor.get(record);
            let mut result = match binding.kind {
                Kind::Point => self.transform.transform_point3(value),
                Kind::Vector => self.transform.transform_vector3(value),
                Kind::Normal => (self.normal_matrix * value).normalize_or_zero(),
            };
            if binding.is_velocity {
                if let Some(position) = &self.source_position {
                    let p = position.get(record);
                    result += (self.derivative * Vec4::new(p.x, p.y, p.z, 1.0)).truncate();
                }
            }
            binding.accessor.set(record, result);
        }
    }
}

impl<S: ParticleStream> ParticleStream for TransformStream<S> {
    fn name(&self) -> &str {
        "transform"
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
        let kernel = Kernel {
            transform: self.transform,
            derivative: self.derivative,
            normal_matrix: self.normal_matrix,
            bindings: &self.bindings,
            source_position: self.source_position,
        };
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            kernel.apply(working);
            Ok(true)
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let kernel = Kernel {
            transform: self.transform,
            derivative: self.derivative,
            normal_matrix: self.normal_matrix,
            bindings: &self.bindings,
            source_position: self.source_position,
        };
        let size = self.negotiated.working().record_size();
        let count = self.negotiated.map_batch(&mut self.delegate, buffer, |records, _| {
            if size > 0 {
                records.chunks_exact_mut(size).for_each(|record| kernel.apply(record));
            }
            Ok(())
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
