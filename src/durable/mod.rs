//! Long-term shared knowledge store.
//!
//! Facts are versioned per key. Every mutation goes through the
//! [`ConflictResolver`], so concurrent writers converge on the same head
//! regardless of arrival order. Old versions and archived losers are purged
//! by [`DurableStore::sweep_retention`] once they fall out of the retention
//! window.

pub mod memory;
pub mod resolver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, to_chrono};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog};
use crate::model::{
    ArchivedWrite, DurableFact, FactRef, FactWrite, NewFact, PurgeReport, WriteReceipt,
};
use crate::telemetry::metrics;

pub use memory::MemoryBackend;

/// Sub-second digits a `TIMESTAMPTZ` column keeps.
const STORED_SUBSEC_DIGITS: u16 = 6;
pub use resolver::{ConflictResolver, Resolved};

/// Storage for durable facts.
///
/// `apply` must read the current head, consume the next version and persist
/// the resolved rows as one atomic step per key.
#[async_trait]
pub trait FactBackend: Send + Sync {
    async fn apply(
        &self,
        write: FactWrite,
        resolver: &ConflictResolver,
        now: DateTime<Utc>,
    ) -> Result<WriteReceipt>;

    async fn head(&self, key: &str) -> Result<Option<DurableFact>>;

    async fn version(&self, key: &str, version: u64) -> Result<Option<DurableFact>>;

    async fn archive(&self, key: &str) -> Result<Vec<ArchivedWrite>>;

    /// Every retained version, in any order.
    async fn export(&self) -> Result<Vec<DurableFact>>;

    /// Delete versions and archive entries written before `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport>;
}

pub struct DurableStore {
    backend: Arc<dyn FactBackend>,
    resolver: ConflictResolver,
    clock: Arc<dyn Clock>,
    retention: Duration,
    events: EventLog,
}

impl DurableStore {
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    pub fn new(backend: Arc<dyn FactBackend>) -> Self {
        Self {
            backend,
            resolver: ConflictResolver,
            clock: Arc::new(SystemClock),
            retention: Self::DEFAULT_RETENTION,
            events: EventLog::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Resolve and persist one write.
    ///
    /// Timestamps are truncated to microseconds first, the precision Postgres
    /// keeps, so every backend resolves exactly the values it stores.
    pub async fn write(&self, fact: NewFact) -> Result<WriteReceipt> {
        let now = self.clock.now().trunc_subsecs(STORED_SUBSEC_DIGITS);
        let write = FactWrite {
            key: fact.key,
            value: fact.value,
            writer_id: fact.writer_id,
            written_at: fact
                .written_at
                .map_or(now, |at| at.trunc_subsecs(STORED_SUBSEC_DIGITS)),
        };
        let writer_id = write.writer_id.clone();
        let receipt = self.backend.apply(write, &self.resolver, now).await?;

        debug!(
            key = %receipt.key,
            version = receipt.version,
            writer_id = %writer_id,
            outcome = %receipt.outcome,
            "fact written"
        );
        metrics::fact_writes().add(1, &[KeyValue::new("outcome", receipt.outcome.to_string())]);
        self.events.record(EventKind::FactWritten {
            key: receipt.key.clone(),
            version: receipt.version,
            writer_id,
            outcome: receipt.outcome,
        });
        Ok(receipt)
    }

    /// Current value of `key`.
    pub async fn read(&self, key: &str) -> Result<DurableFact> {
        self.backend
            .head(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("fact {key}")))
    }

    pub async fn read_at(&self, key: &str, version: u64) -> Result<DurableFact> {
        self.backend
            .version(key, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("fact {key}@{version}")))
    }

    pub async fn resolve_ref(&self, fact_ref: &FactRef) -> Result<DurableFact> {
        self.read_at(&fact_ref.key, fact_ref.version).await
    }

    /// Writes that lost for `key`, oldest first.
    pub async fn archive(&self, key: &str) -> Result<Vec<ArchivedWrite>> {
        let mut archived = self.backend.archive(key).await?;
        archived.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.writer_id.cmp(&b.writer_id))
        });
        Ok(archived)
    }

    /// Every retained version, ordered by key then version.
    pub async fn export(&self) -> Result<Vec<DurableFact>> {
        let mut rows = self.backend.export().await?;
        rows.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(rows)
    }

    /// Purge everything written before `now - retention`.
    pub async fn sweep_retention(&self) -> Result<PurgeReport> {
        let cutoff = self.clock.now() - to_chrono(self.retention);
        let report = self.backend.purge_before(cutoff).await?;
        if report.facts_removed > 0 || report.archived_removed > 0 {
            info!(
                %cutoff,
                facts_removed = report.facts_removed,
                archived_removed = report.archived_removed,
                "retention sweep purged facts"
            );
            metrics::facts_purged().add(report.facts_removed, &[KeyValue::new("table", "facts")]);
            metrics::facts_purged()
                .add(report.archived_removed, &[KeyValue::new("table", "archive")]);
        }
        Ok(report)
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
