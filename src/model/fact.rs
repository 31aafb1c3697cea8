//! Durable fact types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::work::AgentId;

/// Pointer to one version of a durable fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactRef {
    pub key: String,
    pub version: u64,
}

impl FactRef {
    pub fn new(key: impl Into<String>, version: u64) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }
}

impl std::fmt::Display for FactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

/// One stored version of a fact. Also the flat export row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableFact {
    pub key: String,
    pub version: u64,
    pub value: serde_json::Value,
    pub writer_id: AgentId,
    pub written_at: DateTime<Utc>,
}

impl DurableFact {
    pub fn fact_ref(&self) -> FactRef {
        FactRef::new(self.key.clone(), self.version)
    }
}

/// Why a write ended up in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    /// Was current, then lost to a later write from another writer.
    Superseded,
    /// Lost to the incumbent on arrival.
    Rejected,
}

impl std::fmt::Display for ArchiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveReason::Superseded => write!(f, "superseded"),
            ArchiveReason::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ArchiveReason {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "superseded" => Ok(ArchiveReason::Superseded),
            "rejected" => Ok(ArchiveReason::Rejected),
            other => Err(crate::error::Error::Other(format!(
                "unknown archive reason: {other}"
            ))),
        }
    }
}

/// A losing write, kept keyed by `(key, version, writer_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedWrite {
    pub key: String,
    pub version: u64,
    pub writer_id: AgentId,
    pub value: serde_json::Value,
    pub written_at: DateTime<Utc>,
    pub reason: ArchiveReason,
    pub archived_at: DateTime<Utc>,
}

/// A write as submitted to a backend, with its timestamp fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactWrite {
    pub key: String,
    pub value: serde_json::Value,
    pub writer_id: AgentId,
    pub written_at: DateTime<Utc>,
}

/// Whether a write became the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Won,
    Lost,
}

impl std::fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOutcome::Won => write!(f, "won"),
            WriteOutcome::Lost => write!(f, "lost"),
        }
    }
}

/// What a write call produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub key: String,
    /// The version this call consumed. Strictly increasing per key.
    pub version: u64,
    pub outcome: WriteOutcome,
    /// Writer of the value now current at `version`.
    pub current_writer: AgentId,
}

impl WriteReceipt {
    pub fn fact_ref(&self) -> FactRef {
        FactRef::new(self.key.clone(), self.version)
    }
}

/// Builder for a durable write.
pub struct NewFact {
    pub(crate) key: String,
    pub(crate) value: serde_json::Value,
    pub(crate) writer_id: AgentId,
    pub(crate) written_at: Option<DateTime<Utc>>,
}

impl NewFact {
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        writer: impl Into<AgentId>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            writer_id: writer.into(),
            written_at: None,
        }
    }

    /// Pin the write timestamp instead of using the store's clock.
    pub fn written_at(mut self, at: DateTime<Utc>) -> Self {
        self.written_at = Some(at);
        self
    }
}

/// Counts from one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub facts_removed: u64,
    pub archived_removed: u64,
}
