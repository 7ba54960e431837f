//! Single-flight, fail-safe, eager-refresh cache.
//!
//! Each key owns a [`Slot`]: the committed entry (swapped as a whole `Arc`)
//! and at most one in-flight factory call. Callers that find no usable entry
//! join the in-flight call instead of starting their own.
//!
//! Per key the cache moves between these states:
//! - Empty: no entry; callers block on the single-flight factory.
//! - Fresh: served directly; past the eager threshold one background
//!   refresh is started per entry.
//! - StaleFailSafe: expired but inside the fail-safe window; callers wait at
//!   most the soft timeout for a (throttled) refresh, then get the stale value.
//! - Refreshing: a factory call is in flight for the key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use skycast_core::CacheConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;
use crate::error::{ForecastError, TimeoutStage};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Timing policy for [`ResilientCache::get_or_compute`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub fail_safe_enabled: bool,
    pub fail_safe_max_age: Duration,
    pub fail_safe_throttle: Duration,
    /// How long a caller holding a stale value waits for its refresh; zero means not at all.
    pub factory_soft_timeout: Duration,
    /// Ceiling for any factory call; zero means none.
    pub factory_hard_timeout: Duration,
    /// Fraction of `ttl` after which an eager refresh starts; outside (0, 1) disables it.
    pub eager_refresh_threshold: f64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            fail_safe_enabled: config.enable_fail_safe,
            fail_safe_max_age: config.fail_safe_max_age(),
            fail_safe_throttle: config.fail_safe_throttle(),
            factory_soft_timeout: config.factory_soft_timeout(),
            factory_hard_timeout: config.factory_hard_timeout(),
            eager_refresh_threshold: config.eager_refresh_threshold,
        }
    }

    fn hard_timeout(&self) -> Option<Duration> {
        (!self.factory_hard_timeout.is_zero()).then_some(self.factory_hard_timeout)
    }

    fn eager_refresh_after(&self) -> Option<Duration> {
        let threshold = self.eager_refresh_threshold;
        if self.ttl.is_zero() || threshold <= 0.0 || threshold >= 1.0 {
            return None;
        }
        Some(self.ttl.mul_f64(threshold))
    }

    /// Whether a committed value could ever be served again.
    fn stores_entries(&self) -> bool {
        !self.ttl.is_zero() || (self.fail_safe_enabled && !self.fail_safe_max_age.is_zero())
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub factory_calls: u64,
    pub refresh_failures: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    factory_calls: AtomicU64,
    refresh_failures: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    fail_safe_expires_at: Instant,
    eager_refresh_at: Option<Instant>,
    /// Claimed by the one caller allowed to start this entry's eager refresh
    refreshing: AtomicBool,
}

impl<V> CacheEntry<V> {
    fn new(value: V, policy: &CachePolicy, now: Instant) -> Self {
        let expires_at = now + policy.ttl;
        let fail_safe_expires_at = if policy.fail_safe_enabled {
            now + policy.fail_safe_max_age.max(policy.ttl)
        } else {
            expires_at
        };
        Self {
            value,
            expires_at,
            fail_safe_expires_at,
            eager_refresh_at: policy.eager_refresh_after().map(|d| now + d),
            refreshing: AtomicBool::new(false),
        }
    }

    fn eager_refresh_due(&self, now: Instant) -> bool {
        self.eager_refresh_at.is_some_and(|at| now >= at)
    }

    fn claim_refresh(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

type FlightResult<V> = Option<Result<V, ForecastError>>;

/// One in-flight factory call shared by every caller of the key.
struct Flight<V> {
    id: u64,
    rx: watch::Receiver<FlightResult<V>>,
    scope: CancellationToken,
    waiters: AtomicUsize,
    /// Detached flights keep running when their last waiter leaves.
    detached: AtomicBool,
}

struct Slot<V> {
    entry: RwLock<Option<Arc<CacheEntry<V>>>>,
    flight: Mutex<Option<Arc<Flight<V>>>>,
    last_refresh_attempt: Mutex<Option<Instant>>,
    last_access: AtomicU64,
}

impl<V> Slot<V> {
    fn new(tick: u64) -> Self {
        Self {
            entry: RwLock::new(None),
            flight: Mutex::new(None),
            last_refresh_attempt: Mutex::new(None),
            last_access: AtomicU64::new(tick),
        }
    }

    fn is_idle(&self) -> bool {
        self.flight.lock().is_none()
    }
}

/// Releases a caller's interest in a flight; the last waiter of an attached
/// flight cancels it.
struct WaiterGuard<V> {
    slot: Arc<Slot<V>>,
    flight: Arc<Flight<V>>,
}

impl<V> Drop for WaiterGuard<V> {
    fn drop(&mut self) {
        let _lock = self.slot.flight.lock();
        let remaining = self.flight.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && !self.flight.detached.load(Ordering::Acquire) {
            tracing::debug!("Last waiter left flight {}, cancelling it", self.flight.id);
            self.flight.scope.cancel();
        }
    }
}

pub struct ResilientCache<V> {
    slots: Mutex<HashMap<String, Arc<Slot<V>>>>,
    max_entries: usize,
    tick: AtomicU64,
    next_flight_id: AtomicU64,
    counters: Arc<Counters>,
}

impl<V> Default for ResilientCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl<V> ResilientCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            tick: AtomicU64::new(0),
            next_flight_id: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Return the cached value for `key`, computing it with `factory` when needed.
    ///
    /// `deadline` bounds how long this caller waits; it never bounds a
    /// background refresh, which only answers to the policy's hard timeout.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        factory: F,
        policy: &CachePolicy,
        deadline: &Deadline,
    ) -> Result<V, ForecastError>
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ForecastError>> + Send + 'static,
    {
        let slot = self.slot(key);
        let now = Instant::now();
        let snapshot = slot.entry.read().clone();

        if let Some(entry) = &snapshot {
            if now < entry.expires_at {
                Counters::bump(&self.counters.hits);
                if entry.eager_refresh_due(now) && entry.claim_refresh() {
                    tracing::debug!("Eager refresh triggered for {}", key);
                    self.start_background(key, &slot, factory, policy);
                }
                return Ok(entry.value.clone());
            }

            if policy.fail_safe_enabled && now < entry.fail_safe_expires_at {
                Counters::bump(&self.counters.stale_hits);
                return self
                    .serve_stale(key, &slot, entry, factory, policy, deadline)
                    .await;
            }
        }

        Counters::bump(&self.counters.misses);
        self.compute_cold(key, &slot, factory, policy, deadline)
            .await
    }

    /// Expired entry inside the fail-safe window.
    ///
    /// Anything short of the caller cancelling yields a value: the refreshed
    /// one if it lands within the soft timeout, the stale one otherwise.
    async fn serve_stale<F, Fut>(
        &self,
        key: &str,
        slot: &Arc<Slot<V>>,
        entry: &Arc<CacheEntry<V>>,
        factory: F,
        policy: &CachePolicy,
        deadline: &Deadline,
    ) -> Result<V, ForecastError>
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ForecastError>> + Send + 'static,
    {
        let flight = {
            let mut current = slot.flight.lock();
            match current.as_ref() {
                Some(flight) if !flight.scope.is_cancelled() => {
                    flight.waiters.fetch_add(1, Ordering::AcqRel);
                    Some(Arc::clone(flight))
                }
                _ => {
                    let now = Instant::now();
                    let mut last_attempt = slot.last_refresh_attempt.lock();
                    let throttled = (*last_attempt)
                        .is_some_and(|at| now.saturating_duration_since(at) < policy.fail_safe_throttle);
                    if throttled {
                        None
                    } else {
                        *last_attempt = Some(now);
                        let flight = self.launch(key, slot, factory, policy, true);
                        flight.waiters.fetch_add(1, Ordering::AcqRel);
                        *current = Some(Arc::clone(&flight));
                        Some(flight)
                    }
                }
            }
        };

        let Some(flight) = flight else {
            tracing::debug!("Refresh for {} throttled, serving stale value", key);
            return Ok(entry.value.clone());
        };
        let guard = WaiterGuard {
            slot: Arc::clone(slot),
            flight,
        };

        if policy.factory_soft_timeout.is_zero() {
            guard.flight.detached.store(true, Ordering::Release);
            return Ok(entry.value.clone());
        }

        let soft = deadline.tighten(policy.factory_soft_timeout);
        match Self::wait(&guard.flight, &soft).await {
            Ok(value) => Ok(value),
            Err(ForecastError::Cancelled) if deadline.is_cancelled() => {
                tracing::debug!("Caller cancelled while refreshing {}", key);
                Err(ForecastError::Cancelled)
            }
            Err(e) => {
                guard.flight.detached.store(true, Ordering::Release);
                tracing::info!("Serving stale value for {} ({})", key, e);
                Ok(entry.value.clone())
            }
        }
    }

    /// No usable entry: block on the single-flight factory call.
    async fn compute_cold<F, Fut>(
        &self,
        key: &str,
        slot: &Arc<Slot<V>>,
        factory: F,
        policy: &CachePolicy,
        deadline: &Deadline,
    ) -> Result<V, ForecastError>
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ForecastError>> + Send + 'static,
    {
        let flight = {
            let mut current = slot.flight.lock();

            // A flight may have committed between our snapshot and the lock.
            if let Some(entry) = slot.entry.read().as_ref() {
                if Instant::now() < entry.expires_at {
                    return Ok(entry.value.clone());
                }
            }

            match current.as_ref() {
                Some(flight) if !flight.scope.is_cancelled() => {
                    tracing::debug!("Joining in-flight computation for {}", key);
                    flight.waiters.fetch_add(1, Ordering::AcqRel);
                    Arc::clone(flight)
                }
                _ => {
                    let flight = self.launch(key, slot, factory, policy, false);
                    flight.waiters.fetch_add(1, Ordering::AcqRel);
                    *current = Some(Arc::clone(&flight));
                    flight
                }
            }
        };
        let guard = WaiterGuard {
            slot: Arc::clone(slot),
            flight,
        };

        let result = Self::wait(&guard.flight, deadline).await;
        drop(guard);

        result.map_err(|err| {
            let caller_side = matches!(
                err,
                ForecastError::Cancelled | ForecastError::Timeout(TimeoutStage::Request)
            );
            if !caller_side {
                self.evict_failed(key, slot);
            }
            to_caller_error(err)
        })
    }

    fn start_background<F, Fut>(&self, key: &str, slot: &Arc<Slot<V>>, factory: F, policy: &CachePolicy)
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ForecastError>> + Send + 'static,
    {
        let mut current = slot.flight.lock();
        if current.as_ref().is_some_and(|f| !f.scope.is_cancelled()) {
            tracing::debug!("Refresh for {} already in flight", key);
            return;
        }
        let flight = self.launch(key, slot, factory, policy, true);
        *current = Some(flight);
    }

    /// Spawn the factory on its own task; the caller installs the returned flight.
    fn launch<F, Fut>(
        &self,
        key: &str,
        slot: &Arc<Slot<V>>,
        factory: F,
        policy: &CachePolicy,
        detached: bool,
    ) -> Arc<Flight<V>>
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ForecastError>> + Send + 'static,
    {
        let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let scope = CancellationToken::new();
        let flight = Arc::new(Flight {
            id,
            rx,
            scope: scope.clone(),
            waiters: AtomicUsize::new(0),
            detached: AtomicBool::new(detached),
        });

        Counters::bump(&self.counters.factory_calls);
        tracing::debug!(
            "Starting {} factory call {} for {}",
            if detached { "background" } else { "blocking" },
            id,
            key
        );

        let key = key.to_string();
        let slot = Arc::clone(slot);
        let policy = *policy;
        let counters = Arc::clone(&self.counters);
        let detached_flag = Arc::clone(&flight);

        tokio::spawn(async move {
            let factory_deadline = Deadline::detached(policy.hard_timeout()).with_token(scope);
            let result = factory_deadline
                .guard(
                    factory(factory_deadline.clone()),
                    ForecastError::Timeout(TimeoutStage::Factory),
                    ForecastError::Cancelled,
                )
                .await;

            match &result {
                Ok(value) if policy.stores_entries() => {
                    let entry = CacheEntry::new(value.clone(), &policy, Instant::now());
                    *slot.entry.write() = Some(Arc::new(entry));
                    tracing::debug!("Committed fresh entry for {}", key);
                }
                Ok(_) => {}
                Err(e) => {
                    Counters::bump(&counters.refresh_failures);
                    if detached_flag.detached.load(Ordering::Acquire) {
                        tracing::warn!("Background refresh for {} failed: {}", key, e);
                    } else {
                        tracing::debug!("Factory for {} failed: {}", key, e);
                    }
                }
            }

            {
                let mut current = slot.flight.lock();
                if current.as_ref().is_some_and(|f| f.id == id) {
                    *current = None;
                }
            }
            tx.send_replace(Some(result));
        });

        flight
    }

    async fn wait(flight: &Flight<V>, deadline: &Deadline) -> Result<V, ForecastError> {
        let mut rx = flight.rx.clone();
        deadline
            .guard(
                async move {
                    match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => (*outcome).clone().unwrap_or_else(|| {
                            Err(ForecastError::upstream("cache", "flight finished without a result"))
                        }),
                        Err(_) => Err(ForecastError::upstream(
                            "cache",
                            "factory task ended without a result",
                        )),
                    }
                },
                ForecastError::Timeout(TimeoutStage::Request),
                ForecastError::Cancelled,
            )
            .await
    }

    fn slot(&self, key: &str) -> Arc<Slot<V>> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get(key) {
            slot.last_access.store(tick, Ordering::Relaxed);
            return Arc::clone(slot);
        }

        if slots.len() >= self.max_entries {
            self.evict_lru(&mut slots);
        }

        let slot = Arc::new(Slot::new(tick));
        slots.insert(key.to_string(), Arc::clone(&slot));
        slot
    }

    /// Drop the least recently accessed idle key. Linear scan, only on insert at capacity.
    fn evict_lru(&self, slots: &mut HashMap<String, Arc<Slot<V>>>) {
        let victim = slots
            .iter()
            .filter(|(_, slot)| slot.is_idle())
            .min_by_key(|(_, slot)| slot.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            tracing::debug!("Evicting least recently used key {}", key);
            slots.remove(&key);
            Counters::bump(&self.counters.evictions);
        }
    }

    /// A cold computation failed: drop anything left for the key.
    fn evict_failed(&self, key: &str, slot: &Arc<Slot<V>>) {
        let mut slots = self.slots.lock();
        let same_slot = slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot));
        if !same_slot || !slot.is_idle() {
            return;
        }

        let expired = match slot.entry.read().as_ref() {
            None => true,
            Some(entry) => Instant::now() >= entry.fail_safe_expires_at,
        };
        if expired {
            slots.remove(key);
            Counters::bump(&self.counters.evictions);
        }
    }

    /// Remove `key` regardless of state.
    pub fn remove(&self, key: &str) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    /// Drop idle keys whose fail-safe window has passed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| {
            if !slot.is_idle() {
                return true;
            }
            slot.entry
                .read()
                .as_ref()
                .is_some_and(|entry| now < entry.fail_safe_expires_at)
        });
        let purged = before - slots.len();
        if purged > 0 {
            tracing::debug!("Purged {} expired cache keys", purged);
            self.counters
                .evictions
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            factory_calls: c.factory_calls.load(Ordering::Relaxed),
            refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Shape a failed blocking computation for the caller.
///
/// Terminal errors, cancellation and timeouts keep their kind; provider-side
/// failures become `UpstreamUnavailable`.
fn to_caller_error(err: ForecastError) -> ForecastError {
    match err {
        ForecastError::CityNotFound { .. }
        | ForecastError::InvalidRequest(_)
        | ForecastError::Cancelled
        | ForecastError::UpstreamUnavailable(_)
        | ForecastError::Timeout(_) => err,
        other => ForecastError::UpstreamUnavailable(Box::new(other)),
    }
}
