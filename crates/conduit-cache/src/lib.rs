//! Multi-tier response cache consulted before any agent is invoked.
//!
//! # Main types
//!
//! - [`SemanticCache`] — Exact-key tier plus a similarity tier over recent entries.
//! - [`CacheRequest`] — Scope and text identifying a cacheable request.
//! - [`TtlPolicy`] — Chooses an entry's lifetime from the wording of its request.
//! - [`Features`] — Hashed bag-of-words and keyword set used for similarity scoring.

/// Cache tiers, entries and statistics.
pub mod cache;
/// Text normalization and similarity features.
pub mod features;
/// Adaptive expiry.
pub mod ttl;

pub use cache::{
    CacheConfig, CacheEntry, CacheHit, CacheRequest, CacheStats, HitTier, SemanticCache,
    VOLATILE_TAG,
};
pub use features::{Features, SimilarityWeights};
pub use ttl::{Freshness, TtlPolicy};
