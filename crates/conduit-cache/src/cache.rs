use crate::features::{normalize, Features, SimilarityWeights};
use crate::ttl::{Freshness, TtlPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Tag added automatically to entries whose request mentions a moving time window.
pub const VOLATILE_TAG: &str = "volatile";

/// Cache sizing, matching and expiry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is stored.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Entries kept in the exact-key tier.
    #[serde(default = "default_exact_capacity")]
    pub exact_capacity: usize,
    /// Recent entries scanned by the similarity tier.
    #[serde(default = "default_similarity_capacity")]
    pub similarity_capacity: usize,
    /// Minimum score in `[0, 1]` for a similarity hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Weights of the similarity signals.
    #[serde(default)]
    pub weights: SimilarityWeights,
    /// TTL per freshness class.
    #[serde(default)]
    pub ttl: TtlPolicy,
}

fn default_enabled() -> bool {
    true
}
fn default_exact_capacity() -> usize {
    1_000
}
fn default_similarity_capacity() -> usize {
    256
}
fn default_similarity_threshold() -> f32 {
    0.85
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            exact_capacity: default_exact_capacity(),
            similarity_capacity: default_similarity_capacity(),
            similarity_threshold: default_similarity_threshold(),
            weights: SimilarityWeights::default(),
            ttl: TtlPolicy::default(),
        }
    }
}

/// A lookup or store key: a namespace plus free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    /// Namespace; requests in different scopes never match.
    pub scope: String,
    /// Free text the key and features are built from.
    pub text: String,
    /// Whether the similarity tier may answer this request.
    pub allow_similar: bool,
    /// Whether the key is built from the normalized text or the text as given.
    pub normalize_key: bool,
}

impl CacheRequest {
    /// A request that may be answered by either tier.
    pub fn new(scope: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            text: text.into(),
            allow_similar: true,
            normalize_key: true,
        }
    }

    /// Exact tier only, keyed on the text byte for byte. For canonical
    /// machine input such as serialized JSON, where case is significant.
    pub fn verbatim(scope: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            normalize_key: false,
            ..Self::new(scope, text).exact_only()
        }
    }

    /// Restrict this request to the exact tier.
    pub fn exact_only(mut self) -> Self {
        self.allow_similar = false;
        self
    }

    /// sha256 over the scope and the (normalized, unless verbatim) text.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.scope.as_bytes());
        hasher.update([u8::from(self.normalize_key)]);
        if self.normalize_key {
            hasher.update(normalize(&self.text).as_bytes());
        } else {
            hasher.update(self.text.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Exact-tier key.
    pub key: String,
    /// Namespace of the request that stored it.
    pub scope: String,
    /// Request text as stored.
    pub text: String,
    /// Cached response.
    pub payload: Value,
    /// When it was stored.
    pub created_at: DateTime<Utc>,
    /// Lifetime from `created_at`.
    pub ttl: Duration,
    /// Freshness class that chose the TTL.
    pub freshness: Freshness,
    /// Tags used by invalidation.
    pub tags: BTreeSet<String>,
    features: Features,
    stored_at: Instant,
}

impl CacheEntry {
    /// Whether the TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitTier {
    /// Matching key.
    Exact,
    /// Similarity score at or above the threshold.
    Similar,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Tier that answered.
    pub tier: HitTier,
    /// 1.0 for exact hits.
    pub score: f32,
    /// The matched entry.
    pub entry: Arc<CacheEntry>,
}

impl CacheHit {
    /// The cached response.
    pub fn payload(&self) -> &Value {
        &self.entry.payload
    }
}

/// Counters for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Distinct live entries across both tiers.
    pub entries: usize,
    /// Lookups answered by the exact tier.
    pub exact_hits: u64,
    /// Lookups answered by the similarity tier.
    pub similar_hits: u64,
    /// Lookups answered by neither.
    pub misses: u64,
    /// Entries stored.
    pub stores: u64,
    /// Capacity evictions, counted per tier.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries dropped by tag invalidation.
    pub invalidations: u64,
}

struct Slot {
    entry: Arc<CacheEntry>,
    last_used: u64,
}

/// Capacity-bounded map with least-recently-used eviction.
struct LruTier {
    slots: HashMap<String, Slot>,
    capacity: usize,
    clock: u64,
}

impl LruTier {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = self.tick();
        self.slots.get_mut(key).map(|slot| {
            slot.last_used = now;
            slot.entry.clone()
        })
    }

    fn touch(&mut self, key: &str) {
        let now = self.tick();
        if let Some(slot) = self.slots.get_mut(key) {
            slot.last_used = now;
        }
    }

    /// Insert or replace; returns how many entries were evicted.
    fn insert(&mut self, entry: Arc<CacheEntry>) -> u64 {
        let now = self.tick();
        let mut evicted = 0;
        if !self.slots.contains_key(&entry.key) {
            while self.slots.len() >= self.capacity {
                let Some(oldest) = self
                    .slots
                    .iter()
                    .min_by_key(|(_, s)| s.last_used)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                self.slots.remove(&oldest);
                evicted += 1;
            }
        }
        self.slots.insert(
            entry.key.clone(),
            Slot {
                entry,
                last_used: now,
            },
        );
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    fn remove_where(&mut self, pred: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| pred(&s.entry))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.slots.remove(key);
        }
        doomed
    }

    fn entries(&self) -> impl Iterator<Item = &Arc<CacheEntry>> {
        self.slots.values().map(|s| &s.entry)
    }
}

struct CacheInner {
    exact: LruTier,
    similar: LruTier,
    stats: CacheStats,
}

impl CacheInner {
    fn len(&self) -> usize {
        let mut keys: BTreeSet<&str> = self.exact.slots.keys().map(String::as_str).collect();
        keys.extend(self.similar.slots.keys().map(String::as_str));
        keys.len()
    }

    fn drop_key(&mut self, key: &str) {
        self.exact.remove(key);
        self.similar.remove(key);
    }
}

/// Two-tier response cache shared by every workflow.
///
/// The exact tier answers requests whose normalized text hashes to a stored
/// key. The similarity tier scans a bounded pool of recent entries in the
/// same scope and answers when the best score reaches the threshold.
pub struct SemanticCache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
}

impl SemanticCache {
    /// An empty cache.
    pub fn new(config: CacheConfig) -> Self {
        let inner = CacheInner {
            exact: LruTier::new(config.exact_capacity),
            similar: LruTier::new(config.similarity_capacity),
            stats: CacheStats::default(),
        };
        Self {
            config,
            inner: RwLock::new(inner),
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Exact tier first, then similarity. Expired entries found on the way are dropped.
    pub async fn lookup(&self, request: &CacheRequest) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }
        let key = request.key();
        let mut inner = self.inner.write().await;

        if let Some(entry) = inner.exact.get(&key) {
            if entry.is_expired() {
                inner.drop_key(&key);
                inner.stats.expirations += 1;
            } else {
                inner.similar.touch(&key);
                inner.stats.exact_hits += 1;
                debug!(scope = %request.scope, key = %&key[..12], "Cache hit (exact)");
                return Some(CacheHit {
                    tier: HitTier::Exact,
                    score: 1.0,
                    entry,
                });
            }
        }

        if request.allow_similar {
            let probe = Features::extract(&request.text);
            let mut expired = Vec::new();
            let mut best: Option<(f32, Arc<CacheEntry>)> = None;
            for entry in inner.similar.entries() {
                if entry.scope != request.scope {
                    continue;
                }
                if entry.is_expired() {
                    expired.push(entry.key.clone());
                    continue;
                }
                let score = probe.similarity(&entry.features, &self.config.weights);
                if score >= self.config.similarity_threshold
                    && best.as_ref().map_or(true, |(s, _)| score > *s)
                {
                    best = Some((score, entry.clone()));
                }
            }
            for key in &expired {
                inner.drop_key(key);
            }
            inner.stats.expirations += expired.len() as u64;

            if let Some((score, entry)) = best {
                inner.similar.touch(&entry.key);
                inner.stats.similar_hits += 1;
                debug!(scope = %request.scope, score, matched = %entry.text, "Cache hit (similar)");
                return Some(CacheHit {
                    tier: HitTier::Similar,
                    score,
                    entry,
                });
            }
        }

        inner.stats.misses += 1;
        None
    }

    /// Store `payload` for `request`, replacing any entry with the same key.
    ///
    /// TTL follows the wording of the request; volatile requests are tagged
    /// [`VOLATILE_TAG`]. Returns the entry key.
    pub async fn store(&self, request: &CacheRequest, payload: Value, tags: &[&str]) -> String {
        let key = request.key();
        if !self.config.enabled {
            return key;
        }

        let freshness = self.config.ttl.classify(&request.text);
        let mut tag_set: BTreeSet<String> = tags.iter().map(|t| (*t).to_string()).collect();
        if freshness == Freshness::Volatile {
            tag_set.insert(VOLATILE_TAG.to_string());
        }
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            scope: request.scope.clone(),
            text: request.text.clone(),
            payload,
            created_at: Utc::now(),
            ttl: self.config.ttl.ttl_for(freshness),
            freshness,
            tags: tag_set,
            features: Features::extract(&request.text),
            stored_at: Instant::now(),
        });

        let mut inner = self.inner.write().await;
        let mut evicted = inner.exact.insert(entry.clone());
        if request.allow_similar {
            evicted += inner.similar.insert(entry.clone());
        } else {
            inner.similar.remove(&key);
        }
        inner.stats.stores += 1;
        inner.stats.evictions += evicted;
        debug!(
            scope = %request.scope,
            freshness = %freshness,
            ttl_secs = entry.ttl.as_secs(),
            evicted,
            "Cached response"
        );
        key
    }

    /// Remove every entry carrying `tag`, expired or not. Returns the number removed.
    pub async fn invalidate(&self, tag: &str) -> usize {
        let mut inner = self.inner.write().await;
        let mut removed: BTreeSet<String> = inner
            .exact
            .remove_where(|e| e.tags.contains(tag))
            .into_iter()
            .collect();
        removed.extend(inner.similar.remove_where(|e| e.tags.contains(tag)));
        inner.stats.invalidations += removed.len() as u64;
        info!(tag, removed = removed.len(), "Cache invalidated by tag");
        removed.len()
    }

    /// Drop every expired entry now. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let mut removed: BTreeSet<String> = inner
            .exact
            .remove_where(CacheEntry::is_expired)
            .into_iter()
            .collect();
        removed.extend(inner.similar.remove_where(CacheEntry::is_expired));
        inner.stats.expirations += removed.len() as u64;
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Purged expired cache entries");
        }
        removed.len()
    }

    /// Counters plus the current entry count.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            entries: inner.len(),
            ..inner.stats.clone()
        }
    }

    /// Distinct entries across both tiers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no entry is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry. Counters are kept.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.exact = LruTier::new(self.config.exact_capacity);
        inner.similar = LruTier::new(self.config.similarity_capacity);
    }
}

impl Default for SemanticCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
