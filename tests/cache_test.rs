//! Integration tests for the scratch cache.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use handoff_rs::cache::{CacheStore, RemovalReason, ScopeKey};
use handoff_rs::clock::ManualClock;
use handoff_rs::event::{EventKind, EventLog};
use handoff_rs::model::{AgentId, WorkItemId};
use serde_json::json;
use std::time::Duration;

fn store(ttl_secs: u64) -> (CacheStore, Arc<ManualClock>, EventLog) {
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let events = EventLog::default();
    let cache = CacheStore::new(Duration::from_secs(ttl_secs))
        .with_clock(clock.clone())
        .with_events(events.clone());
    (cache, clock, events)
}

fn key(item: &str, worker: &str) -> ScopeKey {
    ScopeKey::new(&WorkItemId::new(item), &AgentId::new(worker))
}

#[test]
fn scope_key_joins_item_and_worker() {
    assert_eq!(key("W1", "alice").as_str(), "W1::alice");
}

#[test]
fn put_appends_and_slides_expiry() {
    let (cache, clock, _) = store(60);
    let k = key("W1", "alice");

    let first = cache.put(&k, json!({"step": 1}));
    clock.advance(ChronoDuration::seconds(30));
    let second = cache.put(&k, json!({"step": 2}));

    assert_eq!(second - first, ChronoDuration::seconds(30));
    let entry = cache.get(&k).unwrap();
    assert_eq!(entry.body.len(), 2);
    assert_eq!(entry.body[1].data, json!({"step": 2}));
    assert_eq!(entry.expires_at, second);
}

#[test]
fn expired_entry_is_not_found_before_any_sweep() {
    let (cache, clock, events) = store(60);
    let k = key("W1", "alice");
    cache.put(&k, json!("scratch"));

    clock.advance(ChronoDuration::seconds(61));
    assert!(cache.get(&k).is_none());
    assert!(cache.is_empty());

    let removals: Vec<_> = events
        .since(0)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::CacheEntryRemoved { scope_key, reason } => Some((scope_key, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(removals, vec![("W1::alice".to_string(), "expired".to_string())]);
}

#[test]
fn put_on_expired_entry_starts_fresh() {
    let (cache, clock, _) = store(60);
    let k = key("W1", "alice");
    cache.put(&k, json!("old"));

    clock.advance(ChronoDuration::seconds(120));
    cache.put(&k, json!("new"));

    let entry = cache.get(&k).unwrap();
    assert_eq!(entry.body.len(), 1);
    assert_eq!(entry.body[0].data, json!("new"));
}

#[test]
fn sweep_removes_only_expired_entries() {
    let (cache, clock, _) = store(60);
    let stale = key("W1", "alice");
    let fresh = key("W2", "bob");
    cache.put(&stale, json!(1));
    clock.advance(ChronoDuration::seconds(45));
    cache.put(&fresh, json!(2));
    clock.advance(ChronoDuration::seconds(30));

    let removed = cache.sweep();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].scope_key, stale);
    assert_eq!(removed[0].reason, RemovalReason::Expired);
    assert!(cache.contains(&fresh));
}

#[test]
fn nothing_survives_past_its_ttl_after_a_sweep() {
    let (cache, clock, _) = store(10);
    for n in 0..20 {
        cache.put(&key(&format!("W{n}"), "w"), json!(n));
        clock.advance(ChronoDuration::seconds(1));
    }
    clock.advance(ChronoDuration::seconds(10));
    cache.sweep();
    assert!(cache.is_empty());
}

#[test]
fn evict_is_idempotent() {
    let (cache, _, events) = store(60);
    let k = key("W1", "alice");
    cache.put(&k, json!("x"));

    let removal = cache.evict(&k).unwrap();
    assert_eq!(removal.reason, RemovalReason::Evicted);
    assert_eq!(removal.fragments, 1);
    assert!(cache.evict(&k).is_none());
    assert!(cache.evict(&key("never", "seen")).is_none());
    assert_eq!(events.since(0).len(), 1);
}

#[test]
fn open_creates_an_empty_entry() {
    let (cache, _, _) = store(60);
    let k = key("W1", "alice");
    cache.open(&k);
    let entry = cache.get(&k).unwrap();
    assert!(entry.body.is_empty());
    assert_eq!(entry.expires_at - entry.created_at, cache.ttl());
}

#[test]
fn default_ttl_is_two_hours() {
    assert_eq!(CacheStore::DEFAULT_TTL, Duration::from_secs(7200));
}
