//! Last-write-wins resolution for writes to one durable key.
//!
//! Later `written_at` wins. On an exact tie the lexicographically smaller
//! writer id wins, so the outcome never depends on arrival order. Every write
//! consumes a version; losers are archived rather than dropped.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::model::{
    AgentId, ArchiveReason, ArchivedWrite, DurableFact, FactWrite, WriteOutcome, WriteReceipt,
};

/// The rows a backend must persist for one resolved write.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// Current value at the newly consumed version.
    pub head: DurableFact,
    pub archived: Option<ArchivedWrite>,
    pub outcome: WriteOutcome,
}

impl Resolved {
    pub fn receipt(&self) -> WriteReceipt {
        WriteReceipt {
            key: self.head.key.clone(),
            version: self.head.version,
            outcome: self.outcome,
            current_writer: self.head.writer_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// `Greater` means `a` beats `b`.
    pub fn compare(
        a_at: DateTime<Utc>,
        a_writer: &AgentId,
        b_at: DateTime<Utc>,
        b_writer: &AgentId,
    ) -> Ordering {
        a_at.cmp(&b_at).then_with(|| b_writer.cmp(a_writer))
    }

    /// Resolve `write` against the current head, assigning it `version`.
    ///
    /// `version` must be greater than every version already issued for the key.
    pub fn resolve(
        &self,
        current: Option<&DurableFact>,
        write: FactWrite,
        version: u64,
        now: DateTime<Utc>,
    ) -> Resolved {
        let Some(current) = current else {
            return Resolved {
                head: into_fact(write, version),
                archived: None,
                outcome: WriteOutcome::Won,
            };
        };

        let wins = Self::compare(
            write.written_at,
            &write.writer_id,
            current.written_at,
            &current.writer_id,
        ) == Ordering::Greater;

        if wins {
            let archived = (current.writer_id != write.writer_id).then(|| ArchivedWrite {
                key: current.key.clone(),
                version: current.version,
                writer_id: current.writer_id.clone(),
                value: current.value.clone(),
                written_at: current.written_at,
                reason: ArchiveReason::Superseded,
                archived_at: now,
            });
            Resolved {
                head: into_fact(write, version),
                archived,
                outcome: WriteOutcome::Won,
            }
        } else {
            let head = DurableFact {
                version,
                ..current.clone()
            };
            let archived = ArchivedWrite {
                key: write.key,
                version,
                writer_id: write.writer_id,
                value: write.value,
                written_at: write.written_at,
                reason: ArchiveReason::Rejected,
                archived_at: now,
            };
            Resolved {
                head,
                archived: Some(archived),
                outcome: WriteOutcome::Lost,
            }
        }
    }
}

fn into_fact(write: FactWrite, version: u64) -> DurableFact {
    DurableFact {
        key: write.key,
        version,
        value: write.value,
        writer_id: write.writer_id,
        written_at: write.written_at,
    }
}
