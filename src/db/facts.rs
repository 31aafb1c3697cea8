//! Durable facts in Postgres.
//!
//! Writers to one key serialize on a `FOR UPDATE` lock of its `fact_keys`
//! row; resolution and all inserts happen in that transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::durable::{ConflictResolver, FactBackend};
use crate::error::{Error, Result};
use crate::model::{AgentId, ArchivedWrite, DurableFact, FactWrite, PurgeReport, WriteReceipt};

#[async_trait]
impl FactBackend for super::Db {
    async fn apply(
        &self,
        write: FactWrite,
        resolver: &ConflictResolver,
        now: DateTime<Utc>,
    ) -> Result<WriteReceipt> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("INSERT INTO fact_keys (key, last_version) VALUES ($1, 0) ON CONFLICT (key) DO NOTHING")
            .bind(&write.key)
            .execute(&mut *tx)
            .await?;

        let (last_version,): (i64,) =
            sqlx::query_as("SELECT last_version FROM fact_keys WHERE key = $1 FOR UPDATE")
                .bind(&write.key)
                .fetch_one(&mut *tx)
                .await?;

        let current: Option<FactRow> = sqlx::query_as(
            "SELECT key, version, value, writer_id, written_at
             FROM facts WHERE key = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(&write.key)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.map(FactRow::into_fact).transpose()?;

        let version = to_version(last_version)? + 1;
        let resolved = resolver.resolve(current.as_ref(), write, version, now);

        sqlx::query(
            "INSERT INTO facts (key, version, value, writer_id, written_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&resolved.head.key)
        .bind(version as i64)
        .bind(&resolved.head.value)
        .bind(resolved.head.writer_id.as_str())
        .bind(resolved.head.written_at)
        .execute(&mut *tx)
        .await?;

        if let Some(ref archived) = resolved.archived {
            sqlx::query(
                "INSERT INTO fact_archive (key, version, writer_id, value, written_at, reason, archived_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (key, version, writer_id) DO NOTHING",
            )
            .bind(&archived.key)
            .bind(archived.version as i64)
            .bind(archived.writer_id.as_str())
            .bind(&archived.value)
            .bind(archived.written_at)
            .bind(archived.reason.to_string())
            .bind(archived.archived_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE fact_keys SET last_version = $1 WHERE key = $2")
            .bind(version as i64)
            .bind(&resolved.head.key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(resolved.receipt())
    }

    async fn head(&self, key: &str) -> Result<Option<DurableFact>> {
        let row: Option<FactRow> = sqlx::query_as(
            "SELECT key, version, value, writer_id, written_at
             FROM facts WHERE key = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        row.map(FactRow::into_fact).transpose()
    }

    async fn version(&self, key: &str, version: u64) -> Result<Option<DurableFact>> {
        let row: Option<FactRow> = sqlx::query_as(
            "SELECT key, version, value, writer_id, written_at
             FROM facts WHERE key = $1 AND version = $2",
        )
        .bind(key)
        .bind(version as i64)
        .fetch_optional(self.pool())
        .await?;
        row.map(FactRow::into_fact).transpose()
    }

    async fn archive(&self, key: &str) -> Result<Vec<ArchivedWrite>> {
        let rows: Vec<ArchiveRow> = sqlx::query_as(
            "SELECT key, version, writer_id, value, written_at, reason, archived_at
             FROM fact_archive WHERE key = $1 ORDER BY version, writer_id",
        )
        .bind(key)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ArchiveRow::into_archived).collect()
    }

    async fn export(&self) -> Result<Vec<DurableFact>> {
        let rows: Vec<FactRow> = sqlx::query_as(
            "SELECT key, version, value, writer_id, written_at
             FROM facts ORDER BY key, version",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(FactRow::into_fact).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        let mut tx = self.pool().begin().await?;
        let facts_removed = sqlx::query("DELETE FROM facts WHERE written_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let archived_removed = sqlx::query("DELETE FROM fact_archive WHERE written_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(PurgeReport {
            facts_removed,
            archived_removed,
        })
    }
}

fn to_version(raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| Error::Other(format!("negative fact version {raw}")))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct FactRow {
    key: String,
    version: i64,
    value: serde_json::Value,
    writer_id: String,
    written_at: DateTime<Utc>,
}

impl FactRow {
    fn into_fact(self) -> Result<DurableFact> {
        Ok(DurableFact {
            key: self.key,
            version: to_version(self.version)?,
            value: self.value,
            writer_id: AgentId(self.writer_id),
            written_at: self.written_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArchiveRow {
    key: String,
    version: i64,
    writer_id: String,
    value: serde_json::Value,
    written_at: DateTime<Utc>,
    reason: String,
    archived_at: DateTime<Utc>,
}

impl ArchiveRow {
    fn into_archived(self) -> Result<ArchivedWrite> {
        Ok(ArchivedWrite {
            key: self.key,
            version: to_version(self.version)?,
            writer_id: AgentId(self.writer_id),
            value: self.value,
            written_at: self.written_at,
            reason: self.reason.parse()?,
            archived_at: self.archived_at,
        })
    }
}
