//! Pure functions over named channels, wired once at negotiation

use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use partstream_core::{
    channels, Channel, ConvertingAccessor, DataType, Error, Negotiated, ParticleStream, Result, Schema,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The supported function shapes.
///
/// Functions must be total over their inputs: they are called once per
/// record and cannot fail.
#[derive(Clone)]
pub enum Kernel {
    /// `f32 -> f32`
    Scalar(Arc<dyn Fn(f32) -> f32 + Send + Sync>),
    /// `(f32, f32) -> f32`
    ScalarPair(Arc<dyn Fn(f32, f32) -> f32 + Send + Sync>),
    /// `vec3 -> vec3`
    Vector(Arc<dyn Fn(Vec3) -> Vec3 + Send + Sync>),
    /// `(vec3, vec3) -> vec3`
    VectorPair(Arc<dyn Fn(Vec3, Vec3) -> Vec3 + Send + Sync>),
    /// `(vec3, f32) -> vec3`
    VectorScalar(Arc<dyn Fn(Vec3, f32) -> Vec3 + Send + Sync>),
    /// `vec3 -> f32`
    VectorToScalar(Arc<dyn Fn(Vec3) -> f32 + Send + Sync>),
}

impl Kernel {
    /// Arity of each input channel, in order
    pub fn input_arities(&self) -> &'static [usize] {
        match self {
            Kernel::Scalar(_) => &[1],
            Kernel::ScalarPair(_) => &[1, 1],
            Kernel::Vector(_) | Kernel::VectorToScalar(_) => &[3],
            Kernel::VectorPair(_) => &[3, 3],
            Kernel::VectorScalar(_) => &[3, 1],
        }
    }

    /// Arity of the output channel
    pub fn output_arity(&self) -> usize {
        match self {
            Kernel::Scalar(_) | Kernel::ScalarPair(_) | Kernel::VectorToScalar(_) => 1,
            Kernel::Vector(_) | Kernel::VectorPair(_) | Kernel::VectorScalar(_) => 3,
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            Kernel::Scalar(_) => "scalar",
            Kernel::ScalarPair(_) => "scalar-pair",
            Kernel::Vector(_) => "vector",
            Kernel::VectorPair(_) => "vector-pair",
            Kernel::VectorScalar(_) => "vector-scalar",
            Kernel::VectorToScalar(_) => "vector-to-scalar",
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kernel::{}", self.shape())
    }
}

/// A function applied to named input channels, writing one output channel
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    /// Input channel names, one per kernel argument
    pub inputs: Vec<String>,
    /// Output channel name; may also be an input
    pub output: String,
    /// The function itself
    pub kernel: Kernel,
}

impl FunctionSpec {
    /// Describe `kernel` applied to `inputs`, writing `output`
    pub fn new(inputs: &[&str], output: &str, kernel: Kernel) -> Self {
        Self {
            inputs: inputs.iter().map(ToString::to_string).collect(),
            output: output.to_string(),
            kernel,
        }
    }

    fn reads_output(&self) -> bool {
        self.inputs.iter().any(|i| *i == self.output)
    }

    /// Check the wiring against the channels available upstream
    fn validate(&self, available: &Schema) -> Result<()> {
        let arities = self.kernel.input_arities();
        if arities.len() != self.inputs.len() {
            return Err(Error::InvalidArgument(format!(
                "{:?} takes {} inputs, {} given for '{}'",
                self.kernel,
                arities.len(),
                self.inputs.len(),
                self.output
            )));
        }
        for (name, arity) in self.inputs.iter().zip(arities) {
            let channel = available
                .channel(name)
                .ok_or_else(|| Error::ChannelMissing(format!("{name} (input of function writing '{}')", self.output)))?;
            check_arity(channel, *arity)?;
        }
        Ok(())
    }
}

fn check_arity(channel: &Channel, arity: usize) -> Result<()> {
    if channel.arity() == arity {
        Ok(())
    } else {
        Err(Error::TypeMismatch {
            channel: channel.name().to_string(),
            expected: format!("arity {arity}"),
            found: format!("arity {}", channel.arity()),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Scalar(ConvertingAccessor<f32>),
    Vector(ConvertingAccessor<Vec3>),
}

impl Slot {
    fn bind(working: &Schema, name: &str, arity: usize) -> Result<Self> {
        if arity == 1 {
            Ok(Slot::Scalar(working.get_converting_accessor(name, None)?))
        } else {
            Ok(Slot::Vector(working.get_converting_accessor(name, None)?))
        }
    }

    fn scalar(self, record: &[u8]) -> f32 {
        match self {
            Slot::Scalar(a) => a.get(record),
            Slot::Vector(a) => a.get(record).x,
        }
    }

    fn vector(self, record: &[u8]) -> Vec3 {
        match self {
            Slot::Scalar(a) => Vec3::splat(a.get(record)),
            Slot::Vector(a) => a.get(record),
        }
    }
}

#[derive(Debug, Clone)]
struct Bound {
    kernel: Kernel,
    inputs: Vec<Slot>,
    output: Slot,
}

impl Bound {
    fn apply(&self, record: &mut [u8]) {
        let arg = |i: usize| self.inputs[i];
        match (&self.kernel, self.output) {
            (Kernel::Scalar(f), Slot::Scalar(out)) => out.set(record, f(arg(0).scalar(record))),
            (Kernel::ScalarPair(f), Slot::Scalar(out)) => {
                out.set(record, f(arg(0).scalar(record), arg(1).scalar(record)));
            }
            (Kernel::VectorToScalar(f), Slot::Scalar(out)) => out.set(record, f(arg(0).vector(record))),
            (Kernel::Vector(f), Slot::Vector(out)) => out.set(record, f(arg(0).vector(record))),
            (Kernel::VectorPair(f), Slot::Vector(out)) => {
                out.set(record, f(arg(0).vector(record), arg(1).vector(record)));
            }
            (Kernel::VectorScalar(f), Slot::Vector(out)) => {
                out.set(record, f(arg(0).vector(record), arg(1).scalar(record)));
            }
            // Arity is checked at binding, so the shapes always agree
            _ => {}
        }
    }
}

/// Applies a [`FunctionSpec`] to every record.
///
/// Inputs and output are checked against the delegate's channels when the
/// stream is built and again at every `set_schema`, so a miswired function
/// fails before the first pull. When the output is not requested the
/// function is skipped entirely.
pub struct ApplyFunctionStream<S> {
    delegate: S,
    function: FunctionSpec,
    native: Schema,
    negotiated: Negotiated,
    bound: Option<Bound>,
    position: u64,
}

impl<S: ParticleStream> ApplyFunctionStream<S> {
    /// Apply `function` to the records of `delegate`
    pub fn new(delegate: S, function: FunctionSpec) -> Result<Self> {
        function.validate(delegate.native_schema())?;

        let upstream_native = delegate.native_schema();
        let output_channel = match upstream_native.channel(&function.output) {
            Some(existing) => {
                check_arity(existing, function.kernel.output_arity())?;
                Channel::new(existing.name(), existing.arity(), existing.data_type())
            }
            None => Channel::new(&function.output, function.kernel.output_arity(), DataType::Float32),
        };
        let mut native = upstream_native.without(&[function.output.as_str()]);
        native.append_channel(output_channel)?;

        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            delegate,
            function,
            native: native.clone(),
            bound: None,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let function = &self.function;
        if !requested.has_channel(&function.output) {
            let negotiated = Negotiated::new(requested, &Schema::empty(), &[])?;
            self.delegate.set_schema(negotiated.upstream())?;
            self.negotiated = negotiated;
            self.bound = None;
            return Ok(());
        }

        let available = self.delegate.native_schema();
        function.validate(available)?;
        let mut requirements = Schema::empty();
        for name in &function.inputs {
            if !requested.has_channel(name) && !requirements.has_channel(name) {
                if let Some(channel) = available.channel(name) {
                    requirements.append_channel(Channel::new(name.as_str(), channel.arity(), channel.data_type()))?;
                }
            }
        }
        let outputs: &[&str] = if function.reads_output() {
            &[]
        } else {
            &[function.output.as_str()]
        };

        let negotiated = Negotiated::new(requested, &requirements, outputs)?;
        self.delegate.set_schema(negotiated.upstream())?;

        let working = negotiated.working();
        if let Some(out) = working.channel(&function.output) {
            check_arity(out, function.kernel.output_arity())?;
        }
        let inputs = function
            .inputs
            .iter()
            .zip(function.kernel.input_arities())
            .map(|(name, arity)| Slot::bind(working, name, *arity))
            .collect::<Result<Vec<_>>>()?;
        let output = Slot::bind(working, &function.output, function.kernel.output_arity())?;
        debug!(output = %function.output, kernel = ?function.kernel, "bound function");

        self.bound = Some(Bound {
            kernel: function.kernel.clone(),
            inputs,
            output,
        });
        self.negotiated = negotiated;
        Ok(())
    }
}

impl<S: ParticleStream> ParticleStream for ApplyFunctionStream<S> {
    fn name(&self) -> &str {
        "apply-function"
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
        let bound = &self.bound;
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            if let Some(bound) = bound {
                bound.apply(working);
            }
            Ok(true)
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let bound = &self.bound;
        let size = self.negotiated.working().record_size();
        let count = self.negotiated.map_batch(&mut self.delegate, buffer, |records, _| {
            if let (Some(bound), true) = (bound, size > 0) {
                records.chunks_exact_mut(size).for_each(|record| bound.apply(record));
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

fn default_color() -> String {
    channels::COLOR.to_string()
}

/// Built-in functions, as named in settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum Builtin {
    /// `Position += Velocity * seconds`
    AddVelocityToPosition {
        /// Time step in seconds
        seconds: f32,
    },

    /// Multiply a vector channel by a constant
    ScaleVector {
        /// Channel to scale in place
        channel: String,
        /// Multiplier
        factor: f32,
    },

    /// Multiply a scalar channel by a constant
    ScaleScalar {
        /// Channel to scale in place
        channel: String,
        /// Multiplier
        factor: f32,
    },

    /// Copy one vector channel into another
    CopyVector {
        /// Source channel
        from: String,
        /// Destination channel
        to: String,
    },

    /// Clamp each component of a colour channel to `[0, 1]`
    ClampColor {
        /// Channel to clamp in place
        #[serde(default = "default_color")]
        channel: String,
    },

    /// Length of a vector channel, into a scalar channel
    VectorLength {
        /// Vector channel
        from: String,
        /// Scalar output channel
        to: String,
    },

    /// `numerator / denominator`, zero where the denominator is zero
    SafeDivide {
        /// Dividend channel
        numerator: String,
        /// Divisor channel
        denominator: String,
        /// Output channel
        output: String,
    },
}

impl Builtin {
    /// The function this built-in stands for
    pub fn spec(&self) -> FunctionSpec {
        match self {
            Builtin::AddVelocityToPosition { seconds } => {
                let dt = *seconds;
                FunctionSpec::new(
                    &[channels::POSITION, channels::VELOCITY],
                    channels::POSITION,
                    Kernel::VectorPair(Arc::new(move |p, v| p + v * dt)),
                )
            }
            Builtin::ScaleVector { channel, factor } => {
                let k = *factor;
                FunctionSpec::new(&[channel.as_str()], channel, Kernel::Vector(Arc::new(move |v| v * k)))
            }
            Builtin::ScaleScalar { channel, factor } => {
                let k = *factor;
                FunctionSpec::new(&[channel.as_str()], channel, Kernel::Scalar(Arc::new(move |x| x * k)))
            }
            Builtin::CopyVector { from, to } => FunctionSpec::new(&[from.as_str()], to, Kernel::Vector(Arc::new(|v| v))),
            Builtin::ClampColor { channel } => FunctionSpec::new(
                &[channel.as_str()],
                channel,
                Kernel::Vector(Arc::new(|c: Vec3| c.clamp(Vec3::ZERO, Vec3::ONE))),
            ),
            Builtin::VectorLength { from, to } => {
                FunctionSpec::new(&[from.as_str()], to, Kernel::VectorToScalar(Arc::new(Vec3::length)))
            }
            Builtin::SafeDivide {
                numerator,
                denominator,
                output,
            } => FunctionSpec::new(
                &[numerator.as_str(), denominator.as_str()],
                output,
                Kernel::ScalarPair(Arc::new(|n, d| if d == 0.0 { 0.0 } else { n / d })),
            ),
        }
    }
}
