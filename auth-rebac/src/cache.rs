//! Two-level cache for check results.
//!
//! L1 is process-local and tags every entry with the zone revision it was
//! computed at, so entries go stale as soon as the zone advances. L2 is an
//! optional shared store behind [`CacheStore`]; its keys embed a per-zone
//! generation that `invalidate_zone` rotates. Backend failures are logged and
//! treated as misses, and a circuit breaker stops hammering a failing store.

use crate::{config::CacheConfig, error::RebacError, models::Entity};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod redis;

/// Shared key/value store used as the L2 cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RebacError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RebacError>;

    async fn delete(&self, key: &str) -> Result<(), RebacError>;
}

/// Identity of a cached check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckKey {
    pub zone_id: String,
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
}

impl CheckKey {
    pub fn new(zone_id: &str, subject: &Entity, permission: &str, object: &Entity) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            subject: subject.clone(),
            permission: permission.to_string(),
            object: object.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct L1Entry {
    allowed: bool,
    revision: u64,
    inserted_at: Instant,
}

/// Where a lookup was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    L1(bool),
    L2(bool),
    Miss,
    /// Cache disabled.
    Bypassed,
}

impl CacheLookup {
    pub fn value(&self) -> Option<bool> {
        match self {
            CacheLookup::L1(allowed) | CacheLookup::L2(allowed) => Some(*allowed),
            CacheLookup::Miss | CacheLookup::Bypassed => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CacheLookup::L1(_) => "l1_hit",
            CacheLookup::L2(_) => "l2_hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Bypassed => "bypassed",
        }
    }
}

/// A lookup result plus the L2 key a miss should be filled under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRead {
    pub lookup: CacheLookup,
    /// Resolved against the zone generation current at lookup time, so a
    /// result computed before a rotation never lands in the new generation.
    l2_key: Option<String>,
}

impl CacheRead {
    fn answered(lookup: CacheLookup) -> Self {
        Self { lookup, l2_key: None }
    }

    pub fn l2_key(&self) -> Option<&str> {
        self.l2_key.as_deref()
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Opens after `failure_threshold` consecutive failures and stays open for
/// the cooldown. The first call after the cooldown is let through as a trial.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = self.failure_threshold.saturating_sub(1);
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.failure_threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "cache circuit breaker opened"
            );
        }
    }

    /// Open immediately for `duration`, regardless of the failure count.
    pub fn trip_for(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.consecutive_failures = self.failure_threshold;
        state.open_until = Some(Instant::now() + duration);
        warn!(duration_secs = duration.as_secs(), "cache circuit breaker tripped");
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .open_until
            .is_some_and(|until| Instant::now() < until)
    }
}

/// Check-result cache used by the engine.
pub struct CacheLayer {
    config: CacheConfig,
    l1: DashMap<CheckKey, L1Entry>,
    l2: Option<Arc<dyn CacheStore>>,
    breaker: CircuitBreaker,
    /// Bumped when namespace definitions change.
    schema_epoch: AtomicU64,
}

impl CacheLayer {
    pub fn new(config: CacheConfig) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.cooldown());
        Self {
            config,
            l1: DashMap::new(),
            l2: None,
            breaker,
            schema_epoch: AtomicU64::new(0),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.l2 = Some(store);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    /// L1-only lookup for a result computed at `revision`.
    pub fn check_cached(&self, key: &CheckKey, revision: u64) -> Option<bool> {
        if !self.config.enabled {
            return None;
        }
        let entry = *self.l1.get(key)?;
        if entry.revision != revision || entry.inserted_at.elapsed() > self.config.l1_ttl() {
            self.l1.remove(key);
            return None;
        }
        Some(entry.allowed)
    }

    /// L1, then L2. Backend errors count as misses.
    pub async fn get(&self, key: &CheckKey, revision: u64) -> CacheRead {
        if !self.config.enabled {
            return CacheRead::answered(CacheLookup::Bypassed);
        }
        if let Some(allowed) = self.check_cached(key, revision) {
            return CacheRead::answered(CacheLookup::L1(allowed));
        }
        let Some(store) = self.l2.as_ref() else {
            return CacheRead::answered(CacheLookup::Miss);
        };
        if !self.breaker.allow_request() {
            return CacheRead::answered(CacheLookup::Miss);
        }

        let l2_key = match self.l2_key(store.as_ref(), key, revision).await {
            Ok(l2_key) => l2_key,
            Err(e) => {
                self.record_l2_failure("read generation", &e);
                return CacheRead::answered(CacheLookup::Miss);
            }
        };
        let lookup = match store.get(&l2_key).await {
            Ok(Some(value)) => {
                self.breaker.record_success();
                match value.as_str() {
                    "1" | "0" => {
                        let allowed = value == "1";
                        self.insert_l1(key.clone(), revision, allowed);
                        return CacheRead::answered(CacheLookup::L2(allowed));
                    }
                    other => {
                        warn!(key = %l2_key, value = other, "ignoring malformed L2 cache entry");
                        CacheLookup::Miss
                    }
                }
            }
            Ok(None) => {
                self.breaker.record_success();
                CacheLookup::Miss
            }
            Err(e) => {
                self.record_l2_failure("get", &e);
                return CacheRead::answered(CacheLookup::Miss);
            }
        };
        CacheRead {
            lookup,
            l2_key: Some(l2_key),
        }
    }

    /// Store a result computed at `revision`. L2 is written only under the
    /// key resolved by the lookup that preceded the computation.
    pub async fn set(&self, key: &CheckKey, revision: u64, allowed: bool, l2_key: Option<&str>) {
        if !self.config.enabled {
            return;
        }
        self.insert_l1(key.clone(), revision, allowed);

        let (Some(store), Some(l2_key)) = (self.l2.as_ref(), l2_key) else {
            return;
        };
        if !self.breaker.allow_request() {
            return;
        }
        match store
            .set(l2_key, if allowed { "1" } else { "0" }, self.config.l2_ttl())
            .await
        {
            Ok(()) => self.breaker.record_success(),
            Err(e) => self.record_l2_failure("set", &e),
        }
    }

    /// Drop every cached result for `zone_id` in both levels.
    pub async fn invalidate_zone(&self, zone_id: &str) {
        self.l1.retain(|key, _| key.zone_id != zone_id);
        debug!(zone_id, "invalidated L1 zone entries");
        self.rotate_generation(zone_id).await;
    }

    /// Drop cached results about `object` in `zone_id`. L2 entries cannot be
    /// enumerated, so the zone generation is rotated there instead.
    pub async fn invalidate_object(&self, zone_id: &str, object: &Entity) {
        self.l1
            .retain(|key, _| !(key.zone_id == zone_id && key.object == *object));
        debug!(zone_id, %object, "invalidated L1 object entries");
        self.rotate_generation(zone_id).await;
    }

    /// Forget every result after a namespace (re)registration.
    pub fn invalidate_all(&self) {
        self.l1.clear();
        let epoch = self.schema_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "cache cleared for namespace change");
    }

    async fn rotate_generation(&self, zone_id: &str) {
        let Some(store) = self.l2.as_ref() else {
            return;
        };
        let generation = Uuid::new_v4().to_string();
        // Outlive every entry written under the previous generation.
        let ttl = self.config.l2_ttl().saturating_mul(2);
        match store.set(&self.generation_key(zone_id), &generation, ttl).await {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                // Entries under the old generation may survive; skip L2 until they expire.
                warn!(zone_id, error = %e, "L2 invalidation failed, bypassing L2");
                self.breaker
                    .trip_for(self.config.cooldown().max(self.config.l2_ttl()));
            }
        }
    }

    fn insert_l1(&self, key: CheckKey, revision: u64, allowed: bool) {
        if self.l1.len() >= self.config.l1_capacity && !self.l1.contains_key(&key) {
            let ttl = self.config.l1_ttl();
            self.l1.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
            if self.l1.len() >= self.config.l1_capacity {
                self.l1.clear();
                debug!(capacity = self.config.l1_capacity, "L1 cache full, cleared");
            }
        }
        self.l1.insert(
            key,
            L1Entry {
                allowed,
                revision,
                inserted_at: Instant::now(),
            },
        );
    }

    fn generation_key(&self, zone_id: &str) -> String {
        format!("{}:zone-gen:{}", self.config.key_prefix, zone_id)
    }

    async fn l2_key(&self, store: &dyn CacheStore, key: &CheckKey, revision: u64) -> Result<String, RebacError> {
        let generation = store
            .get(&self.generation_key(&key.zone_id))
            .await?
            .unwrap_or_else(|| "0".to_string());
        Ok(format!(
            "{}:check:{}:{}:{}:{}:{}:{}:{}",
            self.config.key_prefix,
            key.zone_id,
            generation,
            self.schema_epoch.load(Ordering::SeqCst),
            revision,
            key.subject,
            key.permission,
            key.object
        ))
    }

    fn record_l2_failure(&self, operation: &str, error: &RebacError) {
        warn!(operation, error = %error, "L2 cache failure, treating as miss");
        self.breaker.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(zone: &str, object: &str) -> CheckKey {
        CheckKey::new(zone, &Entity::user("alice"), "read", &Entity::file(object))
    }

    fn config() -> CacheConfig {
        CacheConfig {
            failure_threshold: 2,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_l1_hit_requires_matching_revision() {
        let cache = CacheLayer::new(config());
        let k = key("acme", "/doc");

        cache.set(&k, 3, true, None).await;
        assert_eq!(cache.check_cached(&k, 3), Some(true));
        assert_eq!(cache.get(&k, 3).await.lookup, CacheLookup::L1(true));
        assert_eq!(cache.check_cached(&k, 4), None);
        assert_eq!(cache.l1_len(), 0);
    }

    #[tokio::test]
    async fn test_invalidation_scopes() {
        let cache = CacheLayer::new(config());
        cache.set(&key("acme", "/a"), 1, true, None).await;
        cache.set(&key("acme", "/b"), 1, true, None).await;
        cache.set(&key("other", "/a"), 1, true, None).await;

        cache.invalidate_object("acme", &Entity::file("/a")).await;
        assert_eq!(cache.check_cached(&key("acme", "/a"), 1), None);
        assert_eq!(cache.check_cached(&key("acme", "/b"), 1), Some(true));

        cache.invalidate_zone("acme").await;
        assert_eq!(cache.check_cached(&key("acme", "/b"), 1), None);
        assert_eq!(cache.check_cached(&key("other", "/a"), 1), Some(true));

        cache.invalidate_all();
        assert_eq!(cache.l1_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_bypasses() {
        let cache = CacheLayer::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let k = key("acme", "/doc");
        cache.set(&k, 1, true, None).await;
        assert_eq!(cache.get(&k, 1).await.lookup, CacheLookup::Bypassed);
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let cache = CacheLayer::new(CacheConfig {
            l1_capacity: 2,
            ..CacheConfig::default()
        });
        for i in 0..5 {
            cache.set(&key("acme", &format!("/{}", i)), 1, false, None).await;
        }
        assert!(cache.l1_len() <= 2);
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let mut store = MockCacheStore::new();
        store
            .expect_get()
            .withf(|key: &str| key == "rebac:zone-gen:acme")
            .returning(|_| Ok(Some("g1".to_string())));
        store
            .expect_get()
            .withf(|key: &str| key == "rebac:check:acme:g1:0:7:user:alice:read:file:/doc")
            .times(1)
            .returning(|_| Ok(Some("1".to_string())));

        let cache = CacheLayer::new(config()).with_store(Arc::new(store));
        let k = key("acme", "/doc");
        assert_eq!(cache.get(&k, 7).await.lookup, CacheLookup::L2(true));
        assert_eq!(cache.get(&k, 7).await.lookup, CacheLookup::L1(true));
    }

    #[tokio::test]
    async fn test_failing_store_degrades_to_miss_and_opens_breaker() {
        let mut store = MockCacheStore::new();
        store
            .expect_get()
            .times(2)
            .returning(|_| Err(RebacError::CacheError("connection refused".to_string())));

        let cache = CacheLayer::new(config()).with_store(Arc::new(store));
        let k = key("acme", "/doc");

        assert_eq!(cache.get(&k, 1).await.lookup, CacheLookup::Miss);
        assert_eq!(cache.get(&k, 1).await.lookup, CacheLookup::Miss);
        assert!(cache.breaker().is_open());
        // Breaker open: the store is not consulted again.
        let read = cache.get(&k, 1).await;
        assert_eq!(read.lookup, CacheLookup::Miss);
        assert_eq!(read.l2_key(), None);
    }

    #[tokio::test]
    async fn test_miss_is_filled_under_generation_seen_at_lookup() {
        let mut store = MockCacheStore::new();
        let mut generation_reads = 0;
        store
            .expect_get()
            .withf(|key: &str| key == "rebac:zone-gen:acme")
            .returning(move |_| {
                generation_reads += 1;
                Ok(Some(if generation_reads == 1 { "g1" } else { "g2" }.to_string()))
            });
        store
            .expect_get()
            .withf(|key: &str| key.starts_with("rebac:check:"))
            .returning(|_| Ok(None));
        store
            .expect_set()
            .withf(|key: &str, _: &str, _: &Duration| key == "rebac:zone-gen:acme")
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_set()
            .withf(|key: &str, value: &str, _: &Duration| {
                key == "rebac:check:acme:g1:0:7:user:alice:read:file:/doc" && value == "0"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let cache = CacheLayer::new(config()).with_store(Arc::new(store));
        let k = key("acme", "/doc");
        let read = cache.get(&k, 7).await;
        assert_eq!(read.lookup, CacheLookup::Miss);

        // The zone rotates while the result is being computed.
        cache.invalidate_zone("acme").await;
        cache.set(&k, 7, false, read.l2_key()).await;
    }

    #[tokio::test]
    async fn test_failed_invalidation_trips_breaker() {
        let mut store = MockCacheStore::new();
        store
            .expect_set()
            .returning(|_, _, _| Err(RebacError::CacheError("timeout".to_string())));

        let cache = CacheLayer::new(config()).with_store(Arc::new(store));
        cache.invalidate_zone("acme").await;
        assert!(cache.breaker().is_open());
    }

    #[test]
    fn test_breaker_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow_request());
        // A failed trial call reopens immediately.
        breaker.record_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow_request());
        breaker.record_success();
        assert!(!breaker.is_open());
    }
}
