//! In-process fact backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::FactBackend;
use super::resolver::ConflictResolver;
use crate::error::Result;
use crate::model::{ArchivedWrite, DurableFact, FactWrite, PurgeReport, WriteReceipt};

#[derive(Debug, Default)]
struct KeyHistory {
    /// Last version issued. Survives purges.
    last_version: u64,
    versions: BTreeMap<u64, DurableFact>,
    archive: Vec<ArchivedWrite>,
}

/// Keeps every key's history behind one lock; resolution happens inside it.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    keys: Mutex<HashMap<String, KeyHistory>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_locked(
        &self,
        write: FactWrite,
        resolver: &ConflictResolver,
        now: DateTime<Utc>,
    ) -> WriteReceipt {
        let mut keys = self.keys.lock();
        let history = keys.entry(write.key.clone()).or_default();
        let version = history.last_version + 1;
        let current = history.versions.values().next_back();
        let resolved = resolver.resolve(current, write, version, now);

        history.last_version = version;
        history.versions.insert(version, resolved.head.clone());
        if let Some(archived) = resolved.archived.clone() {
            history.archive.push(archived);
        }
        resolved.receipt()
    }

    fn purge_locked(&self, cutoff: DateTime<Utc>) -> PurgeReport {
        let mut report = PurgeReport::default();
        let mut keys = self.keys.lock();
        for history in keys.values_mut() {
            let before = history.versions.len();
            history.versions.retain(|_, fact| fact.written_at >= cutoff);
            report.facts_removed += (before - history.versions.len()) as u64;

            let before = history.archive.len();
            history.archive.retain(|a| a.written_at >= cutoff);
            report.archived_removed += (before - history.archive.len()) as u64;
        }
        report
    }
}

#[async_trait]
impl FactBackend for MemoryBackend {
    async fn apply(
        &self,
        write: FactWrite,
        resolver: &ConflictResolver,
        now: DateTime<Utc>,
    ) -> Result<WriteReceipt> {
        Ok(self.apply_locked(write, resolver, now))
    }

    async fn head(&self, key: &str) -> Result<Option<DurableFact>> {
        Ok(self
            .keys
            .lock()
            .get(key)
            .and_then(|h| h.versions.values().next_back().cloned()))
    }

    async fn version(&self, key: &str, version: u64) -> Result<Option<DurableFact>> {
        Ok(self
            .keys
            .lock()
            .get(key)
            .and_then(|h| h.versions.get(&version).cloned()))
    }

    async fn archive(&self, key: &str) -> Result<Vec<ArchivedWrite>> {
        Ok(self
            .keys
            .lock()
            .get(key)
            .map(|h| h.archive.clone())
            .unwrap_or_default())
    }

    async fn export(&self) -> Result<Vec<DurableFact>> {
        let keys = self.keys.lock();
        Ok(keys
            .values()
            .flat_map(|h| h.versions.values().cloned())
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        Ok(self.purge_locked(cutoff))
    }
}
