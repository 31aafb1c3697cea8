//! Ephemeral scratch cache, one entry per (work item, worker).
//!
//! Entries are append-only logs of opaque fragments with a sliding TTL:
//! every `put` pushes `expires_at` out to `now + ttl`. Nothing here is ever
//! persisted. Every removal, whether an eviction, an expiry or a
//! reassignment, is reported on the event log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, SystemClock, to_chrono};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog};
use crate::model::{AgentId, WorkItemId};
use crate::telemetry::metrics;

/// Cache key derived from a work item and the worker holding it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(work_item_id: &WorkItemId, worker_id: &AgentId) -> Self {
        Self(format!("{work_item_id}::{worker_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub appended_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub scope_key: ScopeKey,
    pub body: Vec<Fragment>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Force-evicted by the coordinator.
    Evicted,
    /// TTL ran out.
    Expired,
    /// The work item moved to a different worker.
    Reassigned,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Evicted => write!(f, "evicted"),
            RemovalReason::Expired => write!(f, "expired"),
            RemovalReason::Reassigned => write!(f, "reassigned"),
        }
    }
}

/// Record of one entry leaving the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    pub scope_key: ScopeKey,
    pub reason: RemovalReason,
    pub fragments: usize,
}

/// TTL-bound in-memory scratch storage.
pub struct CacheStore {
    entries: RwLock<HashMap<ScopeKey, CacheEntry>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    events: EventLog,
}

impl CacheStore {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: to_chrono(ttl),
            clock: Arc::new(SystemClock),
            events: EventLog::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Append a fragment, creating the entry if needed. Returns the new expiry.
    pub fn put(&self, key: &ScopeKey, data: serde_json::Value) -> DateTime<Utc> {
        let now = self.clock.now();
        let fragment = Fragment {
            appended_at: now,
            data,
        };
        self.upsert(key, now, Some(fragment), None);
        now + self.ttl
    }

    /// Create the entry if it does not exist and refresh its expiry.
    pub fn open(&self, key: &ScopeKey) -> DateTime<Utc> {
        let now = self.clock.now();
        self.upsert(key, now, None, None);
        now + self.ttl
    }

    /// `put` on behalf of a worker handle; `None` once the handle is closed.
    fn put_scoped(
        &self,
        key: &ScopeKey,
        data: serde_json::Value,
        closed: &AtomicBool,
    ) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let fragment = Fragment {
            appended_at: now,
            data,
        };
        self.upsert(key, now, Some(fragment), Some(closed))
            .then(|| now + self.ttl)
    }

    /// Returns false, writing nothing, if `closed` is set. The flag is read
    /// under the write lock so a release cannot interleave with the insert.
    fn upsert(
        &self,
        key: &ScopeKey,
        now: DateTime<Utc>,
        fragment: Option<Fragment>,
        closed: Option<&AtomicBool>,
    ) -> bool {
        let expires_at = now + self.ttl;
        let stale = {
            let mut entries = self.entries.write();
            if closed.is_some_and(|c| c.load(Ordering::Acquire)) {
                return false;
            }
            let expired = entries.get(key).is_some_and(|e| e.is_expired(now));
            let stale = if expired { entries.remove(key) } else { None };
            let entry = entries.entry(key.clone()).or_insert_with(|| CacheEntry {
                scope_key: key.clone(),
                body: Vec::new(),
                created_at: now,
                expires_at,
            });
            entry.body.extend(fragment);
            entry.expires_at = expires_at;
            stale
        };
        if let Some(stale) = stale {
            self.report(&stale, RemovalReason::Expired);
        }
        true
    }

    /// Read an entry. Expired entries are gone even if no sweep has run yet.
    pub fn get(&self, key: &ScopeKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
                Some(_) => {}
            }
        }
        // Expired: take the write lock and drop it, unless a put slipped in.
        let stale = {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get(key).filter(|e| !e.is_expired(now)) {
                return Some(entry.clone());
            }
            entries.remove(key)
        };
        if let Some(stale) = stale {
            self.report(&stale, RemovalReason::Expired);
        }
        None
    }

    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry regardless of expiry. Evicting an unknown key is a no-op.
    pub fn evict(&self, key: &ScopeKey) -> Option<Removal> {
        self.remove(key, RemovalReason::Evicted)
    }

    pub(crate) fn remove(&self, key: &ScopeKey, reason: RemovalReason) -> Option<Removal> {
        let removed = self.entries.write().remove(key)?;
        Some(self.report(&removed, reason))
    }

    /// Drop every entry whose `expires_at` has passed.
    pub fn sweep(&self) -> Vec<Removal> {
        let now = self.clock.now();
        let expired: Vec<CacheEntry> = {
            let mut entries = self.entries.write();
            let keys: Vec<ScopeKey> = entries
                .values()
                .filter(|e| e.is_expired(now))
                .map(|e| e.scope_key.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        expired
            .iter()
            .map(|entry| self.report(entry, RemovalReason::Expired))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn report(&self, entry: &CacheEntry, reason: RemovalReason) -> Removal {
        debug!(
            scope_key = %entry.scope_key,
            %reason,
            fragments = entry.body.len(),
            "cache entry removed"
        );
        self.events.record(EventKind::CacheEntryRemoved {
            scope_key: entry.scope_key.to_string(),
            reason: reason.to_string(),
        });
        metrics::cache_removals().add(1, &[KeyValue::new("reason", reason.to_string())]);
        Removal {
            scope_key: entry.scope_key.clone(),
            reason,
            fragments: entry.body.len(),
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("ttl", &self.ttl)
            .field("entries", &self.len())
            .finish()
    }
}

/// A worker's view of its own cache entry. Cannot evict.
///
/// The coordinator closes the handle when the attempt it was issued for is
/// over; later writes fail with [`Error::ScopeClosed`] instead of bringing
/// the entry back.
#[derive(Debug, Clone)]
pub struct ScopedCache {
    store: Arc<CacheStore>,
    key: ScopeKey,
    closed: Arc<AtomicBool>,
}

impl ScopedCache {
    pub(crate) fn new(store: Arc<CacheStore>, key: ScopeKey) -> Self {
        Self {
            store,
            key,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn append(&self, data: serde_json::Value) -> Result<DateTime<Utc>> {
        self.store
            .put_scoped(&self.key, data, &self.closed)
            .ok_or_else(|| Error::ScopeClosed(self.key.to_string()))
    }

    /// A closed handle reads nothing.
    pub fn read(&self) -> Option<CacheEntry> {
        if self.is_closed() {
            return None;
        }
        self.store.get(&self.key)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop this handle from writing; the entry itself stays.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Close the handle, then drop its entry.
    pub(crate) fn release(&self, reason: RemovalReason) -> Option<Removal> {
        self.close();
        self.store.remove(&self.key, reason)
    }
}
