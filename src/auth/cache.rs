//! Permission cache with two-tier expiry and single-flight revalidation
//!
//! Every authority answer is cached under its [`PermissionKey`] with two
//! deadlines measured from the moment the fetch started:
//!
//! - `soft_expires_at = fetched_at + expiration_interval`: until then the
//!   entry is **Fresh** and served without touching the authority.
//! - `hard_forget_at = fetched_at + forgetting_interval`: until then a
//!   **Stale** entry is still served immediately while one background
//!   refresh is scheduled. Past it the entry is logically absent and the
//!   next lookup fetches synchronously.
//!
//! The forgetting interval bounds how long a revoked grant can stay
//! effective, no matter how long the authority is unreachable.
//!
//! Each entry holds the authority's [`PermissionTree`] for its prefix, so an
//! entry also answers every path below that prefix, deeper grants and
//! revocations included.
//!
//! # Concurrency
//!
//! Entries live in a [`DashMap`]; reads and replacements are atomic per key
//! and never suspend. Authority calls are tracked in a second map of shared
//! futures so that at most one call per key is in flight: concurrent misses
//! and stale-triggered refreshes for the same key all await the same call.
//! Each call runs on its own spawned task, so it completes and fills the
//! cache even if every caller waiting on it is cancelled.
//!
//! # Failures
//!
//! Invalidations that overlap a running fetch keep its answer out of the
//! cache; fetches for keys outside the invalidated scope are stored as usual.
//!
//! Authority failures are never cached. A failed synchronous fetch is
//! returned to every waiter. A failed background refresh is logged and the
//! entry stays Stale; another refresh may start after `refresh_retry_backoff`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::path::NormalizedPath;
use super::types::{
    AccessLevel, AuthorityVerdict, AuthorizationDecision, CacheState, PermissionKey, PermissionTree, Principal,
};
use crate::error::AppError;
use crate::observability::metrics::{record_authority_request, record_cache_lookup, update_cache_entries};
use crate::services::authority::{AuthorityError, PermissionAuthorityClient};

type FetchResult = Result<Arc<PermissionTree>, AuthorityError>;
type InFlight = Shared<BoxFuture<'static, FetchResult>>;

/// Configuration for the permission cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Soft TTL: entries older than this are served but refreshed
    pub expiration_interval: Duration,
    /// Hard TTL: entries older than this are never served
    pub forgetting_interval: Duration,
    /// Upper bound on a single authority call
    pub authority_timeout: Duration,
    /// Minimum wait before retrying a failed background refresh
    pub refresh_retry_backoff: Duration,
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
    /// Interval for the background sweeper
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration_interval: Duration::from_secs(60),
            forgetting_interval: Duration::from_secs(600),
            authority_timeout: Duration::from_secs(5),
            refresh_retry_backoff: Duration::from_secs(5),
            max_entries: 100_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.forgetting_interval < self.expiration_interval {
            return Err(AppError::Config(format!(
                "permission forgetting interval ({}s) must not be shorter than the expiration interval ({}s)",
                self.forgetting_interval.as_secs(),
                self.expiration_interval.as_secs()
            )));
        }
        if self.authority_timeout.is_zero() {
            return Err(AppError::Config("authority timeout must be greater than zero".to_string()));
        }
        if self.max_entries == 0 {
            return Err(AppError::Config("cache max_entries must be greater than zero".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(AppError::Config("cache sweep interval must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    /// Authority calls started by the cache, fetches and refreshes
    pub authority_calls: u64,
    pub authority_failures: u64,
    /// Lookups that joined an authority call already in flight
    pub coalesced: u64,
    pub refreshes_started: u64,
    /// Entries dropped after their hard ceiling
    pub expired: u64,
    /// Entries dropped for capacity
    pub evictions: u64,
    pub invalidated: u64,
    pub entries: u64,
    pub in_flight: u64,
    /// Hit rate as percentage (0.0 - 100.0)
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn calculate_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    authority_calls: AtomicU64,
    authority_failures: AtomicU64,
    coalesced: AtomicU64,
    refreshes_started: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
    invalidated: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Recent invalidations by generation, so a fetch can tell whether one
/// that landed while it ran covers its key
#[derive(Debug, Default)]
struct InvalidationLog {
    recent: VecDeque<(u64, Invalidation)>,
    /// Generations at or below this were dropped from `recent`
    floor: u64,
}

impl InvalidationLog {
    fn record(&mut self, generation: u64, scope: Invalidation) {
        if self.recent.len() == INVALIDATION_LOG_CAPACITY {
            if let Some((dropped, _)) = self.recent.pop_front() {
                self.floor = dropped;
            }
        }
        self.recent.push_back((generation, scope));
    }

    /// Whether an invalidation after `since` covers `key`. Conservative
    /// once the relevant records have been dropped.
    fn covers_since(&self, since: u64, key: &PermissionKey) -> bool {
        if since < self.floor {
            return true;
        }
        self.recent
            .iter()
            .any(|(generation, scope)| *generation > since && scope.matches(key))
    }

    fn clear(&mut self, floor: u64) {
        self.recent.clear();
        self.floor = floor;
    }
}

/// Scope of an explicit invalidation, e.g. an external revocation notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every entry for one principal
    Principal(Principal),
    /// Every entry at this prefix or below, for all principals
    Prefix(NormalizedPath),
    /// Entries for one principal at this prefix or below
    PrincipalPrefix(Principal, NormalizedPath),
    All,
}

impl Invalidation {
    fn matches(&self, key: &PermissionKey) -> bool {
        match self {
            Invalidation::Principal(principal) => &key.principal == principal,
            Invalidation::Prefix(path) => key.prefix.starts_with(path),
            Invalidation::PrincipalPrefix(principal, path) => {
                &key.principal == principal && key.prefix.starts_with(path)
            }
            Invalidation::All => true,
        }
    }
}

/// Invalidations kept for fetches still in flight
const INVALIDATION_LOG_CAPACITY: usize = 256;

/// A cached or freshly fetched answer, as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDecision {
    /// Key whose entry answered; its prefix is the path or an ancestor of it
    pub key: PermissionKey,
    pub verdict: AuthorityVerdict,
    /// Deepest node of the entry's tree on the way to the requested path
    pub matched_prefix: NormalizedPath,
    pub state: CacheState,
}

impl CachedDecision {
    pub fn decide(&self, required: AccessLevel) -> AuthorizationDecision {
        self.verdict.decide(&self.matched_prefix, required)
    }
}

/// Lifecycle state of a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    /// Stale with a refresh already in flight
    Refreshing,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tree: Arc<PermissionTree>,
    fetched_at: Instant,
    soft_expires_at: Instant,
    hard_forget_at: Instant,
    last_accessed: Instant,
    refreshing: bool,
    refresh_not_before: Option<Instant>,
}

impl CacheEntry {
    fn new(tree: Arc<PermissionTree>, fetched_at: Instant, config: &CacheConfig) -> Self {
        Self {
            tree,
            fetched_at,
            soft_expires_at: fetched_at + config.expiration_interval,
            hard_forget_at: fetched_at + config.forgetting_interval,
            last_accessed: fetched_at,
            refreshing: false,
            refresh_not_before: None,
        }
    }

    fn is_forgotten(&self, now: Instant) -> bool {
        now > self.hard_forget_at
    }

    fn state(&self, now: Instant) -> EntryState {
        if now <= self.soft_expires_at {
            EntryState::Fresh
        } else if self.refreshing {
            EntryState::Refreshing
        } else {
            EntryState::Stale
        }
    }

    fn refresh_due(&self, now: Instant) -> bool {
        !self.refreshing && self.refresh_not_before.is_none_or(|not_before| now >= not_before)
    }
}

struct CacheInner {
    config: CacheConfig,
    authority: Arc<dyn PermissionAuthorityClient>,
    clock: Arc<dyn Clock>,
    entries: DashMap<PermissionKey, CacheEntry>,
    in_flight: DashMap<PermissionKey, InFlight>,
    /// Bumped by every invalidation
    generation: AtomicU64,
    invalidations: Mutex<InvalidationLog>,
    counters: Counters,
}

/// Shared permission cache in front of a [`PermissionAuthorityClient`]
///
/// Cheap to clone; all clones share the same entries.
#[derive(Clone)]
pub struct PermissionCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl PermissionCache {
    pub fn new(config: CacheConfig, authority: Arc<dyn PermissionAuthorityClient>) -> Result<Self, AppError> {
        Self::with_clock(config, authority, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        authority: Arc<dyn PermissionAuthorityClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        debug!(
            expiration_s = config.expiration_interval.as_secs(),
            forgetting_s = config.forgetting_interval.as_secs(),
            authority_timeout_ms = config.authority_timeout.as_millis(),
            max_entries = config.max_entries,
            "Creating permission cache"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                authority,
                clock,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                generation: AtomicU64::new(0),
                invalidations: Mutex::new(InvalidationLog::default()),
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Answer for `path` from entries cached at `prefix`, never suspending
    ///
    /// `prefix` is `path` itself or one of its ancestors. Keys for
    /// `(principal, prefix)` are consulted from `Manage` down to `Read` and the
    /// first live entry answers, resolving `path` through its tree. Serving a
    /// Stale entry schedules its background refresh.
    pub fn peek(&self, principal: &Principal, prefix: &NormalizedPath, path: &NormalizedPath) -> Option<CachedDecision> {
        let now = self.inner.clock.now();

        for key_level in AccessLevel::ALL.into_iter().rev() {
            let key = PermissionKey::new(principal, prefix, key_level);
            let Some((decision, refresh)) = self.read_entry(&key, path, now) else {
                continue;
            };

            if refresh {
                self.spawn_refresh(key);
            }
            match decision.state {
                CacheState::Stale => bump(&self.inner.counters.stale_hits, 1),
                _ => bump(&self.inner.counters.fresh_hits, 1),
            }
            record_cache_lookup(decision.state);
            return Some(decision);
        }
        None
    }

    /// Resolve a key through the cache, fetching from the authority on a miss
    ///
    /// Fresh and Stale entries answer immediately. Otherwise the caller joins
    /// the single in-flight authority call for the key, starting it if needed.
    pub async fn lookup(
        &self,
        principal: &Principal,
        prefix: &NormalizedPath,
        required: AccessLevel,
    ) -> Result<CachedDecision, AuthorityError> {
        if let Some(hit) = self.peek(principal, prefix, prefix) {
            return Ok(hit);
        }

        bump(&self.inner.counters.misses, 1);
        record_cache_lookup(CacheState::Miss);

        let key = PermissionKey::new(principal, prefix, required);
        let tree = self.join_or_fetch(&key).await?;

        Ok(CachedDecision {
            key,
            verdict: tree.verdict,
            matched_prefix: prefix.clone(),
            state: CacheState::Miss,
        })
    }

    /// Drop cached entries in `scope`; returns how many were removed
    pub fn invalidate(&self, scope: Invalidation) -> usize {
        {
            let mut log = self.inner.invalidations.lock().unwrap_or_else(|e| e.into_inner());
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if self.inner.in_flight.is_empty() {
                log.clear(generation - 1);
            }
            log.record(generation, scope.clone());
        }

        let mut removed = 0usize;
        self.inner.entries.retain(|key, _| {
            let hit = scope.matches(key);
            if hit {
                removed += 1;
            }
            !hit
        });

        bump(&self.inner.counters.invalidated, removed as u64);
        update_cache_entries(self.inner.entries.len());
        info!(scope = ?scope, removed = removed, "Invalidated cached permissions");
        removed
    }

    /// Remove hard-expired entries, then evict down to capacity
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let mut expired = 0usize;
        self.inner.entries.retain(|_, entry| {
            let keep = !entry.is_forgotten(now);
            if !keep {
                expired += 1;
            }
            keep
        });
        bump(&self.inner.counters.expired, expired as u64);

        let evicted = self.enforce_capacity();
        update_cache_entries(self.inner.entries.len());
        expired + evicted
    }

    /// Periodically sweep until the cache is dropped
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(cache) = upgrade(&weak) else {
                    debug!("Permission cache dropped, stopping sweeper");
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed = removed, remaining = cache.len(), "Swept permission cache");
                }
            }
        })
    }

    /// Apply invalidations from an external revocation feed until it closes
    pub fn spawn_invalidation_listener(&self, mut receiver: mpsc::Receiver<Invalidation>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(scope) = receiver.recv().await {
                let Some(cache) = upgrade(&weak) else {
                    break;
                };
                cache.invalidate(scope);
            }
            debug!("Invalidation listener stopped");
        })
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let fresh_hits = c.fresh_hits.load(Ordering::Relaxed);
        let stale_hits = c.stale_hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);

        CacheStats {
            fresh_hits,
            stale_hits,
            misses,
            authority_calls: c.authority_calls.load(Ordering::Relaxed),
            authority_failures: c.authority_failures.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            refreshes_started: c.refreshes_started.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            invalidated: c.invalidated.load(Ordering::Relaxed),
            entries: self.inner.entries.len() as u64,
            in_flight: self.inner.in_flight.len() as u64,
            hit_rate: CacheStats::calculate_hit_rate(fresh_hits + stale_hits, misses),
        }
    }

    /// Lifecycle state of the entry stored under exactly `key`
    pub fn entry_state(&self, key: &PermissionKey) -> Option<EntryState> {
        let now = self.inner.clock.now();
        let entry = self.inner.entries.get(key)?;
        if entry.is_forgotten(now) {
            return None;
        }
        Some(entry.state(now))
    }

    /// Read one key for `path`, returning the decision and whether a refresh
    /// should start. Claims the refresh by setting the flag under the shard lock.
    fn read_entry(&self, key: &PermissionKey, path: &NormalizedPath, now: Instant) -> Option<(CachedDecision, bool)> {
        let mut entry = self.inner.entries.get_mut(key)?;

        if entry.is_forgotten(now) {
            drop(entry);
            self.forget(key, now);
            return None;
        }
        let (verdict, matched_prefix) = entry.tree.resolve(&key.prefix, path)?;

        entry.last_accessed = now;
        let (state, refresh) = match entry.state(now) {
            EntryState::Fresh => (CacheState::Fresh, false),
            EntryState::Refreshing => (CacheState::Stale, false),
            EntryState::Stale => {
                let due = entry.refresh_due(now);
                if due {
                    entry.refreshing = true;
                }
                (CacheState::Stale, due)
            }
        };

        let decision = CachedDecision {
            key: key.clone(),
            verdict,
            matched_prefix,
            state,
        };
        Some((decision, refresh))
    }

    fn forget(&self, key: &PermissionKey, now: Instant) {
        if self
            .inner
            .entries
            .remove_if(key, |_, entry| entry.is_forgotten(now))
            .is_some()
        {
            bump(&self.inner.counters.expired, 1);
            debug!(key = %key, "Forgot permission entry past its hard ceiling");
        }
    }

    /// Join the in-flight authority call for `key`, or start one
    fn join_or_fetch(&self, key: &PermissionKey) -> InFlight {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                bump(&self.inner.counters.coalesced, 1);
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                // A call may have completed between the caller's miss and now
                let now = self.inner.clock.now();
                if let Some(entry) = self.inner.entries.get(key) {
                    if entry.state(now) == EntryState::Fresh {
                        return futures::future::ready(Ok(entry.tree.clone())).boxed().shared();
                    }
                }

                let flight = self.clone().fetch(key.clone()).boxed().shared();
                slot.insert(flight.clone());
                self.drive(flight.clone());
                flight
            }
        }
    }

    /// Start a background refresh unless a call for `key` is already in flight
    fn spawn_refresh(&self, key: PermissionKey) {
        match self.inner.in_flight.entry(key.clone()) {
            // The running call refreshes the entry when it lands
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                bump(&self.inner.counters.refreshes_started, 1);
                debug!(key = %key, "Scheduling background permission refresh");
                let flight = self.clone().fetch(key.clone()).boxed().shared();
                slot.insert(flight.clone());

                if !self.drive(flight) {
                    warn!(key = %key, "No async runtime available, skipping background permission refresh");
                    self.inner.in_flight.remove(&key);
                    if let Some(mut entry) = self.inner.entries.get_mut(&key) {
                        entry.refreshing = false;
                    }
                }
            }
        }
    }

    /// Run a fetch on its own task so it completes regardless of its waiters
    fn drive(&self, flight: InFlight) -> bool {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(flight);
                true
            }
            Err(_) => false,
        }
    }

    /// One authority call: store the answer, or record the failure on the
    /// existing entry so the next refresh waits out the backoff
    async fn fetch(self, key: PermissionKey) -> FetchResult {
        let inner = &self.inner;
        let generation = inner.generation.load(Ordering::SeqCst);
        let fetched_at = inner.clock.now();
        let started = Instant::now();
        let timeout = inner.config.authority_timeout;
        bump(&inner.counters.authority_calls, 1);

        let result = match tokio::time::timeout(
            timeout,
            inner.authority.check(&key.principal, &key.prefix, key.level, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AuthorityError::Timeout),
        };
        record_authority_request(&result, started.elapsed());
        let result = result.map(Arc::new);

        match &result {
            Ok(tree) => {
                let previous = inner
                    .entries
                    .insert(key.clone(), CacheEntry::new(tree.clone(), fetched_at, &inner.config));

                if self.invalidated_since(generation, &key) {
                    inner.entries.remove_if(&key, |_, entry| entry.fetched_at == fetched_at);
                    debug!(key = %key, "Permissions invalidated during fetch, answer not cached");
                } else {
                    if let Some(previous) = previous {
                        if previous.tree != *tree {
                            info!(
                                key = %key,
                                previous = ?previous.tree.verdict,
                                current = ?tree.verdict,
                                "Cached permission changed on refresh"
                            );
                        }
                    }
                    self.enforce_capacity();
                }
            }
            Err(error) => {
                bump(&inner.counters.authority_failures, 1);
                let retry_at = inner.clock.now() + inner.config.refresh_retry_backoff;
                if let Some(mut entry) = inner.entries.get_mut(&key) {
                    entry.refreshing = false;
                    entry.refresh_not_before = Some(retry_at);
                }
                warn!(key = %key, error = %error, "Permission authority call failed");
            }
        }

        inner.in_flight.remove(&key);
        update_cache_entries(inner.entries.len());
        result
    }

    /// Whether an invalidation covering `key` landed after `generation`
    fn invalidated_since(&self, generation: u64, key: &PermissionKey) -> bool {
        if self.inner.generation.load(Ordering::SeqCst) == generation {
            return false;
        }
        let log = self.inner.invalidations.lock().unwrap_or_else(|e| e.into_inner());
        log.covers_since(generation, key)
    }

    /// Evict least recently accessed entries beyond `max_entries`
    fn enforce_capacity(&self) -> usize {
        let max_entries = self.inner.config.max_entries;
        let len = self.inner.entries.len();
        if len <= max_entries {
            return 0;
        }

        let mut by_age: Vec<(PermissionKey, Instant)> = self
            .inner
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_accessed))
            .collect();
        by_age.sort_by_key(|(_, last_accessed)| *last_accessed);

        let mut evicted = 0usize;
        for (key, _) in by_age.into_iter().take(len - max_entries) {
            if self.inner.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        bump(&self.inner.counters.evictions, evicted as u64);
        debug!(evicted = evicted, max_entries = max_entries, "Evicted permission entries over capacity");
        evicted
    }
}

fn upgrade(weak: &Weak<CacheInner>) -> Option<PermissionCache> {
    weak.upgrade().map(|inner| PermissionCache { inner })
}
