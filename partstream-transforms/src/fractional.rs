//! Count reduction by percentage and absolute limit

use partstream_core::{channels, Channel, ConvertingAccessor, Error, Negotiated, ParticleStream, Result, Schema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hash::unit_hash;

/// Which records survive sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Deterministic stride thinning spread over the whole stream
    #[default]
    Evenly,

    /// A prefix of the stream
    FirstN,

    /// A subset keyed on the `ID` channel, stable from frame to frame
    ById,
}

/// Parameters of a fractional stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    /// Fraction of records to keep, `0..=1`
    pub fraction: f64,

    /// Absolute cap on kept records
    pub limit: Option<u64>,

    /// Selection policy
    pub policy: SamplingPolicy,

    /// Seed for [`SamplingPolicy::ById`]
    pub seed: u64,
}

impl Sampling {
    /// Keep `fraction` of the records, spread evenly
    pub fn evenly(fraction: f64) -> Self {
        Self {
            fraction,
            limit: None,
            policy: SamplingPolicy::Evenly,
            seed: 0,
        }
    }

    /// Keep at most `limit` records from the front
    pub fn first_n(limit: u64) -> Self {
        Self {
            fraction: 1.0,
            limit: Some(limit),
            policy: SamplingPolicy::FirstN,
            seed: 0,
        }
    }

    /// Cap the number of kept records
    #[must_use]
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Use a different selection policy
    #[must_use]
    pub fn with_policy(mut self, policy: SamplingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Check if nothing can survive
    pub fn is_empty(&self) -> bool {
        self.fraction <= 0.0 || self.limit == Some(0)
    }

    /// Check if everything survives
    pub fn is_identity(&self) -> bool {
        self.fraction >= 1.0 && self.limit.is_none()
    }
}

/// Decides, in stream order, whether the next upstream record is kept
#[derive(Debug, Clone)]
enum Selector {
    /// Keep nothing
    Nothing,
    /// Keep everything
    Everything,
    /// Keep `target` of `total`, evenly spread
    Stride { total: u64, target: u64 },
    /// Keep each record with probability `fraction`, evenly spread
    Accumulate { fraction: f64 },
    /// Keep the first `target`
    Prefix { target: u64 },
    /// Keep records whose hashed ID falls below `fraction`
    ById {
        id: ConvertingAccessor<i64>,
        fraction: f64,
        seed: u64,
    },
}

/// Reduces the record count by a fraction and/or an absolute limit.
///
/// Selection is deterministic: the same input always yields the same subset
/// in the same order. Surviving records are not renumbered.
pub struct FractionalStream<S> {
    delegate: S,
    sampling: Sampling,
    negotiated: Negotiated,
    selector: Selector,
    /// Upstream records seen
    seen: u64,
    /// Records emitted
    kept: u64,
    /// Records that will be emitted, when known
    target: Option<u64>,
}

impl<S: ParticleStream> FractionalStream<S> {
    /// Sample `delegate` with the given parameters.
    ///
    /// [`SamplingPolicy::ById`] needs an `ID` channel in the delegate's
    /// native schema; its absence is a `ChannelMissing` error.
    pub fn new(delegate: S, sampling: Sampling) -> Result<Self> {
        if sampling.fraction.is_nan() {
            return Err(Error::InvalidArgument("sampling fraction is NaN".to_string()));
        }
        if sampling.policy == SamplingPolicy::ById && !delegate.native_schema().has_channel(channels::ID) {
            return Err(Error::ChannelMissing(format!(
                "{} (sampling by id over '{}')",
                channels::ID,
                delegate.name()
            )));
        }

        let native = delegate.native_schema().clone();
        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            delegate,
            sampling,
            selector: Selector::Everything,
            seen: 0,
            kept: 0,
            target: None,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    /// Sampling parameters
    pub fn sampling(&self) -> &Sampling {
        &self.sampling
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let by_id = self.sampling.policy == SamplingPolicy::ById && !self.sampling.is_empty();
        let mut requirements = Schema::empty();
        if by_id && !requested.has_channel(channels::ID) {
            requirements.append_channel(Channel::of::<i64>(channels::ID))?;
        }
        let negotiated = Negotiated::new(requested, &requirements, &[])?;
        negotiated.check_delegate(&self.delegate)?;
        self.delegate.set_schema(negotiated.upstream())?;

        let total = self.delegate.remaining();
        let fraction = self.sampling.fraction.clamp(0.0, 1.0);
        let limit = self.sampling.limit;

        self.selector = if self.sampling.is_empty() {
            Selector::Nothing
        } else if self.sampling.is_identity() {
            Selector::Everything
        } else {
            match (self.sampling.policy, total) {
                (SamplingPolicy::ById, _) => Selector::ById {
                    id: negotiated.working().get_converting_accessor::<i64>(channels::ID, None)?,
                    fraction,
                    seed: self.sampling.seed,
                },
                (SamplingPolicy::Evenly | SamplingPolicy::FirstN, Some(total)) => {
                    let mut target = (total as f64 * fraction).floor() as u64;
                    if let Some(limit) = limit {
                        target = target.min(limit);
                    }
                    if self.sampling.policy == SamplingPolicy::FirstN {
                        Selector::Prefix { target }
                    } else {
                        Selector::Stride { total, target }
                    }
                }
                // Unknown count: spread the fraction, cap with the limit
                (SamplingPolicy::Evenly | SamplingPolicy::FirstN, None) if fraction < 1.0 => {
                    Selector::Accumulate { fraction }
                }
                (SamplingPolicy::Evenly | SamplingPolicy::FirstN, None) => Selector::Everything,
            }
        };

        self.target = match (&self.selector, total) {
            (Selector::Nothing, _) => Some(0),
            (Selector::Stride { target, .. } | Selector::Prefix { target }, _) => Some(*target),
            (Selector::Everything, Some(total)) => Some(limit.map_or(total, |limit| total.min(limit))),
            _ => None,
        };
        debug!(selector = ?self.selector, target = ?self.target, "bound fractional stream");

        self.negotiated = negotiated;
        self.seen = 0;
        self.kept = 0;
        Ok(())
    }

    fn exhausted(&self) -> bool {
        matches!(self.selector, Selector::Nothing)
            || self.sampling.limit.is_some_and(|limit| self.kept >= limit)
            || self.target.is_some_and(|target| self.kept >= target)
    }
}

impl Selector {
    /// Decide on upstream record number `index`
    fn keep(&self, index: u64, record: &[u8]) -> bool {
        match self {
            Selector::Nothing => false,
            Selector::Everything => true,
            Selector::Stride { total, target } => {
                // Bresenham: exactly `target` of `total`, evenly spaced
                let t = u128::from(*target);
                let n = u128::from(*total);
                let i = u128::from(index);
                (i + 1) * t / n > i * t / n
            }
            Selector::Accumulate { fraction } => {
                ((index + 1) as f64 * fraction).floor() > (index as f64 * fraction).floor()
            }
            Selector::Prefix { target } => index < *target,
            Selector::ById { id, fraction, seed } => unit_hash(id.get(record) as u64, *seed) < *fraction,
        }
    }
}

impl<S: ParticleStream> ParticleStream for FractionalStream<S> {
    fn name(&self) -> &str {
        "fractional"
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
        if self.exhausted() {
            return Ok(false);
        }
        let selector = &self.selector;
        let seen = &mut self.seen;
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            let keep = selector.keep(*seen, working);
            *seen += 1;
            Ok(keep)
        })?;
        self.kept += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if self.exhausted() {
            return Ok(0);
        }
        let size = self.negotiated.requested().record_size();
        if size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }

        // Never hand out more than the remaining allowance
        let mut capacity = buffer.len() / size;
        if let Some(limit) = self.sampling.limit {
            capacity = capacity.min(limit.saturating_sub(self.kept) as usize);
        }
        let selector = &self.selector;
        let seen = &mut self.seen;
        let count = self
            .negotiated
            .filter_batch(&mut self.delegate, &mut buffer[..capacity * size], |working| {
                let keep = selector.keep(*seen, working);
                *seen += 1;
                Ok(keep)
            })?;
        self.kept += count as u64;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        self.target
    }

    fn position(&self) -> u64 {
        self.kept
    }
}
