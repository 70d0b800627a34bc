//! A materialized particle array valid over a time interval

use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use partstream_core::{channels, Aabb, Interval, ParticleArray, ParticleStream, ProgressSink, Result, Time};
use serde::Serialize;
use tracing::{debug, warn};

/// Lifecycle of a [`ParticleCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    /// Never populated, or released
    Empty,

    /// Holds particles valid over a known interval
    Populated,

    /// Holds particles that must be rebuilt before use
    Stale,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheState::Empty => write!(f, "empty"),
            CacheState::Populated => write!(f, "populated"),
            CacheState::Stale => write!(f, "stale"),
        }
    }
}

/// A freshly assembled chain and how long its output stays correct
pub struct Built {
    /// Negotiated chain to drain
    pub stream: Box<dyn ParticleStream>,

    /// Conservative validity of everything the chain depends on
    pub validity: Interval,
}

impl Built {
    /// Pair a stream with its validity
    pub fn new(stream: Box<dyn ParticleStream>, validity: Interval) -> Self {
        Self { stream, validity }
    }
}

/// Counters for instrumentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Queries answered from the stored particles
    pub hits: u64,
    /// Queries that had to rebuild
    pub misses: u64,
    /// Successful populations
    pub populations: u64,
    /// Failed or cancelled populations
    pub failures: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    particles: Arc<ParticleArray>,
    validity: Interval,
    bounds: Aabb,
}

/// Runs a chain once and keeps the result for as long as it stays valid.
///
/// The stored array is shared read-only through [`Arc`]; only the thread that
/// triggers population mutates the cache. A failed population never leaves a
/// partial result behind, and a cancelled one leaves the cache exactly as it
/// was.
#[derive(Debug, Clone)]
pub struct ParticleCache {
    name: String,
    state: CacheState,
    entry: Option<Entry>,
    /// Bumped by every successful population
    generation: u64,
    stats: CacheStats,
}

impl ParticleCache {
    /// Create an empty cache; `name` only appears in log messages
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CacheState::Empty,
            entry: None,
            generation: 0,
            stats: CacheStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Number of successful populations so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Instrumentation counters
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Stored particles, when populated
    pub fn particles(&self) -> Option<&Arc<ParticleArray>> {
        match (self.state, &self.entry) {
            (CacheState::Populated, Some(entry)) => Some(&entry.particles),
            _ => None,
        }
    }

    /// Validity of the stored particles, or [`Interval::NEVER`]
    pub fn validity(&self) -> Interval {
        match (self.state, &self.entry) {
            (CacheState::Populated, Some(entry)) => entry.validity,
            _ => Interval::NEVER,
        }
    }

    /// Bounds of the stored positions, empty when nothing is stored
    pub fn bounds(&self) -> Aabb {
        match (self.state, &self.entry) {
            (CacheState::Populated, Some(entry)) => entry.bounds,
            _ => Aabb::EMPTY,
        }
    }

    /// Check if a query at `time` would be answered without rebuilding
    pub fn is_valid_at(&self, time: Time) -> bool {
        self.state == CacheState::Populated && self.validity().contains(time)
    }

    /// Run `build` for `time` and store its output.
    ///
    /// On success the cache is populated with the chain's validity, widened
    /// to at least the instant `time`. On cancellation the previous state is
    /// kept; on any other failure a populated cache becomes stale.
    pub fn populate<F>(&mut self, time: Time, progress: &dyn ProgressSink, build: F) -> Result<Arc<ParticleArray>>
    where
        F: FnOnce(Time) -> Result<Built>,
    {
        match Self::materialize(time, progress, build) {
            Ok(entry) => {
                let particles = Arc::clone(&entry.particles);
                self.generation += 1;
                self.stats.populations += 1;
                debug!(
                    cache = %self.name,
                    records = particles.len(),
                    start = entry.validity.start,
                    end = entry.validity.end,
                    generation = self.generation,
                    "populated particle cache"
                );
                self.entry = Some(entry);
                self.state = CacheState::Populated;
                Ok(particles)
            }
            Err(e) if e.is_cancelled() => {
                self.stats.failures += 1;
                debug!(cache = %self.name, state = %self.state, "population cancelled");
                Err(e)
            }
            Err(e) => {
                self.stats.failures += 1;
                if self.state == CacheState::Populated {
                    self.state = CacheState::Stale;
                }
                warn!(cache = %self.name, error = %e, "population failed");
                Err(e)
            }
        }
    }

    fn materialize<F>(time: Time, progress: &dyn ProgressSink, build: F) -> Result<Entry>
    where
        F: FnOnce(Time) -> Result<Built>,
    {
        progress.check()?;
        let Built { mut stream, validity } = build(time)?;
        let particles = ParticleArray::from_stream(stream.as_mut(), progress)?;
        let bounds = position_bounds(&particles)?;
        Ok(Entry {
            particles: Arc::new(particles),
            validity: validity.or_instant(time),
            bounds,
        })
    }

    /// Particles valid at `time`, rebuilding only when the stored interval
    /// does not cover it
    pub fn query<F>(&mut self, time: Time, progress: &dyn ProgressSink, build: F) -> Result<Arc<ParticleArray>>
    where
        F: FnOnce(Time) -> Result<Built>,
    {
        if self.is_valid_at(time) {
            if let Some(entry) = &self.entry {
                self.stats.hits += 1;
                debug!(cache = %self.name, time, "particle cache hit");
                return Ok(Arc::clone(&entry.particles));
            }
        }
        self.stats.misses += 1;
        debug!(cache = %self.name, time, state = %self.state, "particle cache miss");
        self.populate(time, progress, build)
    }

    /// Force the next query to rebuild
    pub fn invalidate(&mut self) {
        if self.state == CacheState::Populated {
            debug!(cache = %self.name, "invalidated particle cache");
            self.state = CacheState::Stale;
        }
    }

    /// Drop the stored particles
    pub fn release(&mut self) {
        self.entry = None;
        self.state = CacheState::Empty;
    }
}

/// Bounds of the `Position` channel, empty when there is none
fn position_bounds(particles: &ParticleArray) -> Result<Aabb> {
    if !particles.schema().has_channel(channels::POSITION) {
        return Ok(Aabb::EMPTY);
    }
    let position = particles.schema().get_converting_accessor::<Vec3>(channels::POSITION, None)?;
    let mut bounds = Aabb::EMPTY;
    for record in particles.iter() {
        bounds.include(position.get(record));
    }
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_core::{CancelFlag, Channel, Error, NullProgress, Schema};
    use partstream_readers::ArrayStream;
    use std::cell::Cell;
    use test_case::test_case;

    fn points(xs: &[f32]) -> ParticleArray {
        let schema = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        let position = schema.get_accessor::<Vec3>("Position").unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for x in xs {
            let mut record = schema.default_record();
            position.set(&mut record, Vec3::new(*x, 0.0, 0.0));
            array.push(&record).unwrap();
        }
        array
    }

    /// A chain builder that counts how often it is called
    fn counting<'a>(calls: &'a Cell<u32>, validity: Interval) -> impl FnOnce(Time) -> Result<Built> + 'a {
        move |_| {
            calls.set(calls.get() + 1);
            Ok(Built::new(Box::new(ArrayStream::from_array(points(&[1.0, -2.0]))), validity))
        }
    }

    #[test_case(1.0 ; "start")]
    #[test_case(1.5 ; "inside")]
    #[test_case(2.0 ; "end")]
    fn test_query_inside_interval_is_a_hit(t: Time) {
        let calls = Cell::new(0);
        let mut cache = ParticleCache::new("test");
        cache.populate(1.0, &NullProgress, counting(&calls, Interval::new(1.0, 2.0))).unwrap();

        cache.query(t, &NullProgress, counting(&calls, Interval::new(1.0, 2.0))).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test_case(0.5 ; "before")]
    #[test_case(2.5 ; "after")]
    fn test_query_outside_interval_rebuilds_once(t: Time) {
        let calls = Cell::new(0);
        let mut cache = ParticleCache::new("test");
        cache.populate(1.0, &NullProgress, counting(&calls, Interval::new(1.0, 2.0))).unwrap();

        cache.query(t, &NullProgress, counting(&calls, Interval::instant(t))).unwrap();
        assert_eq!(calls.get(), 2);
        cache.query(t, &NullProgress, counting(&calls, Interval::instant(t))).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let calls = Cell::new(0);
        let mut cache = ParticleCache::new("test");
        cache.query(0.0, &NullProgress, counting(&calls, Interval::FOREVER)).unwrap();
        cache.invalidate();
        assert_eq!(cache.state(), CacheState::Stale);
        assert!(cache.particles().is_none());

        cache.query(0.0, &NullProgress, counting(&calls, Interval::FOREVER)).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.state(), CacheState::Populated);
    }

    #[test]
    fn test_bounds_and_empty_validity() {
        let calls = Cell::new(0);
        let mut cache = ParticleCache::new("test");
        cache.populate(3.0, &NullProgress, counting(&calls, Interval::NEVER)).unwrap();
        assert_eq!(cache.validity(), Interval::instant(3.0));
        assert_eq!(cache.bounds(), Aabb::new(Vec3::new(-2.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_cancellation_keeps_previous_state() {
        let calls = Cell::new(0);
        let mut cache = ParticleCache::new("test");
        cache.populate(0.0, &NullProgress, counting(&calls, Interval::new(0.0, 1.0))).unwrap();

        let flag = CancelFlag::new();
        flag.cancel();
        let result = cache.query(5.0, &flag, counting(&calls, Interval::instant(5.0)));
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(cache.state(), CacheState::Populated);
        assert_eq!(cache.validity(), Interval::new(0.0, 1.0));
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn test_failure_is_never_half_populated() {
        let mut cache = ParticleCache::new("test");
        let result = cache.populate(0.0, &NullProgress, |_| Err(Error::unreadable("missing.prt", "not found")));
        assert!(result.is_err());
        assert_eq!(cache.state(), CacheState::Empty);

        cache
            .populate(0.0, &NullProgress, |_| {
                Ok(Built::new(Box::new(ArrayStream::from_array(points(&[0.0]))), Interval::FOREVER))
            })
            .unwrap();
        let result = cache.populate(0.0, &NullProgress, |_| Err(Error::Format("bad header".to_string())));
        assert!(result.is_err());
        assert_eq!(cache.state(), CacheState::Stale);
        assert_eq!(cache.stats().failures, 2);
    }
}
