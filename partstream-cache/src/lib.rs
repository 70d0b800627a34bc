//! Validity-interval particle caches
//!
//! A [`ParticleCache`] drains a decorator chain once into a dense array and
//! answers later queries from it for as long as the query time stays inside
//! the chain's validity interval. An [`ObjectCache`] pairs one local cache
//! per particle object with per-consumer caches derived from it, keyed by
//! [`ConsumerKey`] handles.

#![warn(missing_docs)]

pub mod cache;
pub mod registry;

pub use cache::{Built, CacheState, CacheStats, ParticleCache};
pub use registry::{ConsumerKey, ObjectCache};
