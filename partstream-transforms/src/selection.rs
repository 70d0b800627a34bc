//! Culling keyed on the per-particle selection weight

use partstream_core::{channels, Channel, ConvertingAccessor, Negotiated, ParticleStream, Result, Schema};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hash::unit_hash;

/// How the selection weight decides removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Remove particles whose weight exceeds one half
    #[default]
    Hard,

    /// Remove each particle with probability equal to its weight, decided by
    /// a stable hash of its identity
    Soft,
}

#[derive(Debug, Clone, Copy)]
enum Key {
    Id(ConvertingAccessor<i64>),
    Ordinal,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    selection: ConvertingAccessor<f32>,
    key: Key,
    reset: bool,
}

impl Binding {
    fn keep(&self, mode: SelectionMode, seed: u64, ordinal: u64, record: &mut [u8]) -> bool {
        let weight = self.selection.get(record);
        let keep = match mode {
            SelectionMode::Hard => weight <= 0.5,
            SelectionMode::Soft => {
                let key = match self.key {
                    Key::Id(id) => id.get(record) as u64,
                    Key::Ordinal => ordinal,
                };
                unit_hash(key, seed) >= f64::from(weight)
            }
        };
        if keep && self.reset {
            self.selection.set(record, 0.0);
        }
        keep
    }
}

/// Removes selected particles.
///
/// Soft mode needs a stable `ID` channel so the same particles go from frame
/// to frame. Without one it keys on stream order, which flickers when the
/// particle count changes.
pub struct SelectionCullStream<S> {
    delegate: S,
    mode: SelectionMode,
    reset_selection: bool,
    seed: u64,
    negotiated: Negotiated,
    binding: Option<Binding>,
    /// Upstream records seen
    seen: u64,
    position: u64,
}

impl<S: ParticleStream> SelectionCullStream<S> {
    /// Cull `delegate` by its `Selection` channel. With `reset_selection`,
    /// survivors leave with a zero weight.
    pub fn new(delegate: S, mode: SelectionMode, reset_selection: bool) -> Result<Self> {
        let native = delegate.native_schema();
        if mode == SelectionMode::Soft && native.has_channel(channels::SELECTION) && !native.has_channel(channels::ID) {
            warn!(
                stream = delegate.name(),
                "soft selection without an ID channel; falling back to stream order, which may flicker"
            );
        }

        let native = native.clone();
        let mut stream = Self {
            negotiated: Negotiated::new(&native, &Schema::empty(), &[])?,
            delegate,
            mode,
            reset_selection,
            seed: 0,
            binding: None,
            seen: 0,
            position: 0,
        };
        stream.rebind(&native)?;
        Ok(stream)
    }

    /// Use a different seed for soft selection
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn rebind(&mut self, requested: &Schema) -> Result<()> {
        let native = self.delegate.native_schema();
        if !native.has_channel(channels::SELECTION) {
            debug!(stream = self.delegate.name(), "no selection channel, nothing to cull");
            let negotiated = Negotiated::new(requested, &Schema::empty(), &[])?;
            self.delegate.set_schema(negotiated.upstream())?;
            self.binding = None;
            self.negotiated = negotiated;
            return Ok(());
        }
        let use_id = self.mode == SelectionMode::Soft && native.has_channel(channels::ID);

        let mut requirements = Schema::empty();
        if !requested.has_channel(channels::SELECTION) {
            requirements.append_channel(Channel::of::<f32>(channels::SELECTION))?;
        }
        if use_id && !requested.has_channel(channels::ID) {
            requirements.append_channel(Channel::of::<i64>(channels::ID))?;
        }
        let negotiated = Negotiated::new(requested, &requirements, &[])?;
        self.delegate.set_schema(negotiated.upstream())?;

        let working = negotiated.working();
        let key = if use_id {
            Key::Id(working.get_converting_accessor::<i64>(channels::ID, None)?)
        } else {
            Key::Ordinal
        };
        self.binding = Some(Binding {
            selection: working.get_converting_accessor::<f32>(channels::SELECTION, None)?,
            key,
            reset: self.reset_selection && requested.has_channel(channels::SELECTION),
        });
        self.negotiated = negotiated;
        self.seen = 0;
        Ok(())
    }
}

impl<S: ParticleStream> ParticleStream for SelectionCullStream<S> {
    fn name(&self) -> &str {
        "selection-cull"
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
        let (binding, mode, seed, seen) = (self.binding, self.mode, self.seed, &mut self.seen);
        let found = self.negotiated.next_with(&mut self.delegate, record, |working| {
            let ordinal = *seen;
            *seen += 1;
            Ok(binding.map_or(true, |b| b.keep(mode, seed, ordinal, working)))
        })?;
        self.position += u64::from(found);
        Ok(found)
    }

    fn next_batch(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let (binding, mode, seed, seen) = (self.binding, self.mode, self.seed, &mut self.seen);
        let count = self.negotiated.filter_batch(&mut self.delegate, buffer, |working| {
            let ordinal = *seen;
            *seen += 1;
            Ok(binding.map_or(true, |b| b.keep(mode, seed, ordinal, working)))
        })?;
        self.position += count as u64;
        Ok(count)
    }

    fn count(&self) -> Option<u64> {
        if self.binding.is_some() {
            None
        } else {
            self.delegate.count()
        }
    }

    fn position(&self) -> u64 {
        self.position
    }
}
