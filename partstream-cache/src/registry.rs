//! Per-object cache with derived per-consumer caches

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use partstream_core::{Error, ParticleArray, ProgressSink, Result, Time};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Built, CacheState, ParticleCache};

/// Opaque handle identifying one consumer of an object's particles, such as
/// a viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerKey(Uuid);

impl ConsumerKey {
    /// A fresh, unique key
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Derived {
    cache: ParticleCache,
    /// Local generation this cache was built from
    source_generation: Option<u64>,
}

/// The caches of one particle object.
///
/// A single *local* cache holds the object's particles before any
/// consumer-specific processing. Each registered consumer owns a *derived*
/// cache built from the local particles. Invalidating the local cache
/// invalidates every derived cache, and a derived cache built from an older
/// local population is rebuilt before its next use.
#[derive(Debug)]
pub struct ObjectCache {
    local: ParticleCache,
    consumers: HashMap<ConsumerKey, Derived>,
}

impl ObjectCache {
    /// Create an object cache with no consumers; `name` is used in logs
    pub fn new(name: &str) -> Self {
        Self {
            local: ParticleCache::new(format!("{name}/local")),
            consumers: HashMap::new(),
        }
    }

    /// The local cache
    pub fn local(&self) -> &ParticleCache {
        &self.local
    }

    /// The derived cache of `key`, if registered
    pub fn consumer(&self, key: &ConsumerKey) -> Option<&ParticleCache> {
        self.consumers.get(key).map(|d| &d.cache)
    }

    /// Number of registered consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Register a new consumer and return its key
    pub fn add_consumer(&mut self) -> ConsumerKey {
        let key = ConsumerKey::new();
        self.consumers.insert(
            key,
            Derived {
                cache: ParticleCache::new(format!("consumer/{key}")),
                source_generation: None,
            },
        );
        debug!(consumer = %key, consumers = self.consumers.len(), "registered cache consumer");
        key
    }

    /// Forget a consumer. Removing the last one also releases the local
    /// particles. Returns whether the key was registered.
    pub fn remove_consumer(&mut self, key: &ConsumerKey) -> bool {
        let removed = self.consumers.remove(key).is_some();
        if removed && self.consumers.is_empty() {
            debug!("last cache consumer removed, releasing local particles");
            self.local.release();
        }
        removed
    }

    /// Invalidate the local cache and, through it, every derived cache
    pub fn invalidate(&mut self) {
        self.local.invalidate();
        for derived in self.consumers.values_mut() {
            derived.cache.invalidate();
        }
    }

    /// Invalidate only one consumer's derived cache
    pub fn invalidate_consumer(&mut self, key: &ConsumerKey) {
        if let Some(derived) = self.consumers.get_mut(key) {
            derived.cache.invalidate();
        }
    }

    /// Local particles valid at `time`
    pub fn query_local<F>(&mut self, time: Time, progress: &dyn ProgressSink, build: F) -> Result<Arc<ParticleArray>>
    where
        F: FnOnce(Time) -> Result<Built>,
    {
        self.local.query(time, progress, build)
    }

    /// Particles of consumer `key` valid at `time`.
    ///
    /// The local cache is brought up to date with `build` first; `derive`
    /// then turns the local particles into the consumer's chain. The derived
    /// validity is clipped to the local validity.
    pub fn query_consumer<F, D>(
        &mut self,
        key: &ConsumerKey,
        time: Time,
        progress: &dyn ProgressSink,
        build: F,
        derive: D,
    ) -> Result<Arc<ParticleArray>>
    where
        F: FnOnce(Time) -> Result<Built>,
        D: FnOnce(Arc<ParticleArray>, Time) -> Result<Built>,
    {
        let Self { local, consumers } = self;
        let derived = consumers
            .get_mut(key)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown cache consumer {key}")))?;

        let local_particles = local.query(time, progress, build)?;
        let local_validity = local.validity();
        if derived.source_generation != Some(local.generation()) {
            derived.cache.invalidate();
        }

        let generation = local.generation();
        let particles = derived.cache.query(time, progress, |t| {
            let mut built = derive(local_particles, t)?;
            built.validity = built.validity.intersect(&local_validity);
            Ok(built)
        })?;
        if derived.cache.state() == CacheState::Populated {
            derived.source_generation = Some(generation);
        }
        Ok(particles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use partstream_core::{Channel, Interval, NullProgress, Schema};
    use partstream_readers::ArrayStream;
    use std::cell::Cell;

    fn local_build(calls: &Cell<u32>, validity: Interval) -> impl FnOnce(Time) -> Result<Built> + '_ {
        move |_| {
            calls.set(calls.get() + 1);
            let schema = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
            let mut array = ParticleArray::new(schema.clone());
            array.push(&schema.default_record()).unwrap();
            Ok(Built::new(Box::new(ArrayStream::from_array(array)), validity))
        }
    }

    fn derive(calls: &Cell<u32>) -> impl FnOnce(Arc<ParticleArray>, Time) -> Result<Built> + '_ {
        move |local, _| {
            calls.set(calls.get() + 1);
            Ok(Built::new(Box::new(ArrayStream::new(local)), Interval::FOREVER))
        }
    }

    #[test]
    fn test_consumers_share_local_particles() {
        let (local_calls, derived_calls) = (Cell::new(0), Cell::new(0));
        let mut object = ObjectCache::new("loader");
        let a = object.add_consumer();
        let b = object.add_consumer();

        for key in [a, b, a, b] {
            object
                .query_consumer(&key, 0.0, &NullProgress, local_build(&local_calls, Interval::new(0.0, 1.0)), derive(&derived_calls))
                .unwrap();
        }
        assert_eq!(local_calls.get(), 1);
        assert_eq!(derived_calls.get(), 2);
        assert_eq!(object.consumer(&a).unwrap().validity(), Interval::new(0.0, 1.0));
    }

    #[test]
    fn test_invalidating_local_cascades() {
        let (local_calls, derived_calls) = (Cell::new(0), Cell::new(0));
        let mut object = ObjectCache::new("loader");
        let a = object.add_consumer();
        let b = object.add_consumer();
        for key in [a, b] {
            object
                .query_consumer(&key, 0.0, &NullProgress, local_build(&local_calls, Interval::FOREVER), derive(&derived_calls))
                .unwrap();
        }

        object.invalidate();
        assert_eq!(object.consumer(&a).unwrap().state(), CacheState::Stale);
        assert_eq!(object.consumer(&b).unwrap().state(), CacheState::Stale);

        object
            .query_consumer(&b, 0.0, &NullProgress, local_build(&local_calls, Interval::FOREVER), derive(&derived_calls))
            .unwrap();
        assert_eq!((local_calls.get(), derived_calls.get()), (2, 3));
    }

    #[test]
    fn test_local_rebuild_outdates_other_consumers() {
        let (local_calls, derived_calls) = (Cell::new(0), Cell::new(0));
        let mut object = ObjectCache::new("loader");
        let a = object.add_consumer();
        let b = object.add_consumer();
        for key in [a, b] {
            object
                .query_consumer(&key, 0.0, &NullProgress, local_build(&local_calls, Interval::FOREVER), derive(&derived_calls))
                .unwrap();
        }

        // The local particles are rebuilt on a's behalf
        object.local.invalidate();
        object
            .query_consumer(&a, 0.0, &NullProgress, local_build(&local_calls, Interval::FOREVER), derive(&derived_calls))
            .unwrap();
        object
            .query_consumer(&b, 0.0, &NullProgress, local_build(&local_calls, Interval::FOREVER), derive(&derived_calls))
            .unwrap();
        assert_eq!((local_calls.get(), derived_calls.get()), (2, 4));
    }

    #[test]
    fn test_removing_last_consumer_releases_local() {
        let calls = Cell::new(0);
        let mut object = ObjectCache::new("loader");
        let a = object.add_consumer();
        object
            .query_consumer(&a, 0.0, &NullProgress, local_build(&calls, Interval::FOREVER), derive(&calls))
            .unwrap();
        assert_eq!(object.local().state(), CacheState::Populated);

        assert!(object.remove_consumer(&a));
        assert!(!object.remove_consumer(&a));
        assert_eq!(object.local().state(), CacheState::Empty);
    }

    #[test]
    fn test_unknown_consumer() {
        let calls = Cell::new(0);
        let mut object = ObjectCache::new("loader");
        let result = object.query_consumer(
            &ConsumerKey::new(),
            0.0,
            &NullProgress,
            local_build(&calls, Interval::FOREVER),
            derive(&calls),
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 0);
    }
}
