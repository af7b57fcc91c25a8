//! Shared key/value cache abstraction.
//!
//! The operations mirror a Redis subset so a networked backend can be swapped
//! in behind [`SharedCache`]. Every read-modify-write is a single call so a
//! backend can make it atomic per key.

use crate::error::CacheError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Key/value store shared by detectors.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// `GET`
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `SETEX`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// `SET NX PX`: store only when the key is absent. Returns true if the
    /// value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// `DEL`
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// `GETDEL`: read and remove in one step.
    async fn take(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `INCR`, setting `ttl` when the key is created.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, CacheError>;

    /// `SADD`; returns true if the member was new. `ttl` is applied when the
    /// set is created.
    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>)
        -> Result<bool, CacheError>;

    /// `SISMEMBER`
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// `SCARD`
    async fn scard(&self, key: &str) -> Result<u64, CacheError>;

    /// Append `timestamp_ms` to a sliding window, drop entries older than
    /// `timestamp_ms - window`, refresh the key's TTL to `window`, and return
    /// the retained timestamps in ascending order.
    async fn record_in_window(
        &self,
        key: &str,
        timestamp_ms: i64,
        window: Duration,
    ) -> Result<Vec<i64>, CacheError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
enum Slot {
    Text(String),
    Counter(u64),
    Set(HashSet<String>),
    Window(VecDeque<i64>),
}

#[derive(Debug)]
struct Stored {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Stored {
    fn new(slot: Slot, ttl: Option<Duration>) -> Self {
        Self {
            slot,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`SharedCache`] backed by a [`DashMap`].
///
/// Each operation holds the key's shard lock for its whole read-modify-write,
/// so updates to one key are atomic. Expired entries are dropped lazily and
/// swept every 1024 operations.
pub struct InMemorySharedCache {
    entries: DashMap<String, Stored>,
    op_counter: AtomicU64,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            op_counter: AtomicU64::new(0),
        }
    }

    /// Number of stored keys, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self) {
        let count = self.op_counter.fetch_add(1, Ordering::Relaxed);
        if count % 1024 == 0 {
            let now = Instant::now();
            self.entries.retain(|_, e| !e.is_expired(now));
        }
    }

    /// Get a live entry for mutation, replacing it when expired or absent.
    fn live_entry(
        &self,
        key: &str,
        init: impl FnOnce() -> Stored,
    ) -> RefMut<'_, String, Stored> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(init());
                }
                occupied.into_ref()
            }
            MapEntry::Vacant(vacant) => vacant.insert(init()),
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::WrongType(key.to_string())
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.maybe_sweep();
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.slot {
                Slot::Text(s) => Some(s.clone()),
                Slot::Counter(n) => Some(n.to_string()),
                _ => return Err(wrong_type(key)),
            },
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.maybe_sweep();
        self.entries.insert(
            key.to_string(),
            Stored::new(Slot::Text(value.to_string()), Some(ttl)),
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.maybe_sweep();
        let now = Instant::now();
        let stored = || Stored::new(Slot::Text(value.to_string()), Some(ttl));
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(false);
                }
                occupied.insert(stored());
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(stored());
            }
        }
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        match self.entries.remove(key) {
            Some((_, entry)) if !entry.is_expired(now) => match entry.slot {
                Slot::Text(s) => Ok(Some(s)),
                Slot::Counter(n) => Ok(Some(n.to_string())),
                _ => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        self.maybe_sweep();
        let mut entry = self.live_entry(key, || Stored::new(Slot::Counter(0), Some(ttl)));
        let next = match &entry.slot {
            Slot::Counter(n) => n + 1,
            Slot::Text(s) => s.trim().parse::<u64>().map_err(|_| wrong_type(key))? + 1,
            _ => return Err(wrong_type(key)),
        };
        entry.slot = Slot::Counter(next);
        Ok(next)
    }

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.maybe_sweep();
        let mut entry = self.live_entry(key, || Stored::new(Slot::Set(HashSet::new()), ttl));
        match &mut entry.slot {
            Slot::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.slot {
                Slot::Set(members) => Ok(members.contains(member)),
                _ => Err(wrong_type(key)),
            },
            _ => Ok(false),
        }
    }

    async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.slot {
                Slot::Set(members) => Ok(members.len() as u64),
                _ => Err(wrong_type(key)),
            },
            _ => Ok(0),
        }
    }

    async fn record_in_window(
        &self,
        key: &str,
        timestamp_ms: i64,
        window: Duration,
    ) -> Result<Vec<i64>, CacheError> {
        self.maybe_sweep();
        let mut entry = self.live_entry(key, || {
            Stored::new(Slot::Window(VecDeque::new()), Some(window))
        });
        entry.expires_at = Some(Instant::now() + window);
        match &mut entry.slot {
            Slot::Window(times) => {
                let pos = times.partition_point(|t| *t <= timestamp_ms);
                times.insert(pos, timestamp_ms);
                let cutoff = timestamp_ms - window.as_millis() as i64;
                while times.front().is_some_and(|t| *t < cutoff) {
                    times.pop_front();
                }
                Ok(times.iter().copied().collect())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Calls a primary backend with a timeout and degrades to an in-process
/// cache when it errors or stalls.
///
/// A failed call opens a breaker for `cooldown`. While it is open every
/// operation goes straight to the local cache, so a hung backend costs at
/// most one timeout per cooldown rather than one per operation.
pub struct ResilientCache {
    primary: Arc<dyn SharedCache>,
    fallback: InMemorySharedCache,
    timeout: Duration,
    cooldown: Duration,
    epoch: Instant,
    /// Millis since `epoch` until which the primary is skipped; 0 when closed
    open_until_ms: AtomicU64,
    fallbacks: AtomicU64,
}

macro_rules! with_fallback {
    ($self:ident, $op:ident ( $($arg:expr),* )) => {{
        if $self.is_open() {
            $self.fallbacks.fetch_add(1, Ordering::Relaxed);
            return $self.fallback.$op($($arg),*).await;
        }
        match tokio::time::timeout($self.timeout, $self.primary.$op($($arg),*)).await {
            Ok(Ok(value)) => {
                $self.reset();
                Ok(value)
            }
            Ok(Err(e)) => {
                $self.fallbacks.fetch_add(1, Ordering::Relaxed);
                if $self.trip() {
                    warn!(
                        backend = $self.primary.name(),
                        operation = stringify!($op),
                        error = %e,
                        cooldown_ms = $self.cooldown.as_millis() as u64,
                        "Shared cache error, using local cache"
                    );
                }
                $self.fallback.$op($($arg),*).await
            }
            Err(_) => {
                $self.fallbacks.fetch_add(1, Ordering::Relaxed);
                if $self.trip() {
                    warn!(
                        backend = $self.primary.name(),
                        operation = stringify!($op),
                        timeout_ms = $self.timeout.as_millis() as u64,
                        cooldown_ms = $self.cooldown.as_millis() as u64,
                        "Shared cache timed out, using local cache"
                    );
                }
                $self.fallback.$op($($arg),*).await
            }
        }
    }};
}

impl ResilientCache {
    pub fn new(primary: Arc<dyn SharedCache>, timeout: Duration, cooldown: Duration) -> Self {
        Self {
            primary,
            fallback: InMemorySharedCache::new(),
            timeout,
            cooldown,
            epoch: Instant::now(),
            open_until_ms: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Number of operations served by the local fallback.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// True while the primary is being skipped after a failure.
    pub fn is_open(&self) -> bool {
        let until = self.open_until_ms.load(Ordering::Acquire);
        until != 0 && self.now_ms() < until
    }

    fn now_ms(&self) -> u64 {
        // Offset by one so a breaker opened at the epoch is never 0.
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Open the breaker. Returns true if it was closed before.
    fn trip(&self) -> bool {
        let until = self.now_ms() + self.cooldown.as_millis() as u64;
        let previous = self.open_until_ms.swap(until, Ordering::AcqRel);
        previous == 0
    }

    fn reset(&self) {
        if self.open_until_ms.swap(0, Ordering::AcqRel) != 0 {
            info!(backend = self.primary.name(), "Shared cache reachable again");
        }
    }
}

#[async_trait]
impl SharedCache for ResilientCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        with_fallback!(self, get(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        with_fallback!(self, set_ex(key, value, ttl))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        with_fallback!(self, set_nx_ex(key, value, ttl))
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        with_fallback!(self, del(key))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
        with_fallback!(self, take(key))
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        with_fallback!(self, incr_with_expiry(key, ttl))
    }

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        with_fallback!(self, sadd(key, member, ttl))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        with_fallback!(self, sismember(key, member))
    }

    async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        with_fallback!(self, scard(key))
    }

    async fn record_in_window(
        &self,
        key: &str,
        timestamp_ms: i64,
        window: Duration,
    ) -> Result<Vec<i64>, CacheError> {
        with_fallback!(self, record_in_window(key, timestamp_ms, window))
    }

    fn name(&self) -> &'static str {
        "resilient"
    }
}
