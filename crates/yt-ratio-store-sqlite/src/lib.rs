#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};
use yt_ratio_core::{
    ingest, rank, Bucket, IngestOutcome, KeyValueStore, RankingConfig, RankingError, RecordStore,
    VideoObservation,
};

const KV_MIGRATION_VERSION: i64 = 1;
const STATUS_CONTRACT_VERSION: &str = "store_status.v1";

const SCHEMA_KV_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_store (
  namespace TEXT PRIMARY KEY CHECK (length(namespace) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// SQLite-backed string store holding one ranking blob per namespace.
pub struct SqliteRatioStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub contract_version: String,
    pub namespace: String,
    pub present: bool,
    pub blob_bytes: usize,
    pub record_count: usize,
    pub ranked_count: usize,
    pub bucket_count: usize,
    pub updated_at: Option<String>,
}

impl SqliteRatioStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_KV_V1)
            .context("failed to apply kv_store schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![KV_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register kv_store schema migration")?;

        Ok(())
    }

    pub fn get_value(&self, namespace: &str) -> Result<Option<String>> {
        read_value(&self.conn, namespace)
    }

    pub fn set_value(&self, namespace: &str, value: &str) -> Result<()> {
        write_value(&self.conn, namespace, value)
    }

    /// Deletes the blob under `namespace`; returns whether one existed.
    pub fn remove_value(&self, namespace: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM kv_store WHERE namespace = ?1", params![namespace])
            .with_context(|| format!("failed to delete kv_store entry {namespace}"))?;
        Ok(affected > 0)
    }

    pub fn load_records(&self, namespace: &str) -> Result<RecordStore> {
        let raw = self.get_value(namespace)?;
        Ok(RecordStore::from_blob(raw.as_deref()))
    }

    /// Ingests one observation and rewrites the namespace blob.
    ///
    /// Load, ingest and persist share one `BEGIN IMMEDIATE` transaction, so
    /// concurrent writers on the same database queue behind the busy timeout
    /// instead of overwriting each other. A rejected observation rolls back
    /// without writing.
    pub fn observe(
        &mut self,
        namespace: &str,
        observation: Option<VideoObservation>,
        config: &RankingConfig,
    ) -> Result<Option<IngestOutcome>> {
        let Some(observation) = observation else {
            debug!(namespace, "no observation available; store untouched");
            return Ok(None);
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start ingest transaction")?;

        let raw = read_value(&tx, namespace)?;
        let store = RecordStore::from_blob(raw.as_deref());
        let outcome = ingest(observation, store, config)
            .with_context(|| format!("failed to ingest observation into {namespace}"))?;

        let blob = outcome
            .store
            .to_blob()
            .map_err(|err| anyhow!("failed to encode ranking store: {err}"))?;
        write_value(&tx, namespace, &blob)?;
        tx.commit().context("failed to commit ingest transaction")?;

        if !outcome.removed_ids.is_empty() {
            info!(
                namespace,
                removed = outcome.removed_ids.len(),
                "pruned records beyond bucket retention cap"
            );
        }

        Ok(Some(outcome))
    }

    pub fn rankings(&self, namespace: &str, config: &RankingConfig) -> Result<Vec<Bucket>> {
        let store = self.load_records(namespace)?;
        rank(&store, config).map_err(|err| anyhow!("failed to rank {namespace}: {err}"))
    }

    pub fn status(&self, namespace: &str, config: &RankingConfig) -> Result<StoreStatus> {
        let row = self
            .conn
            .query_row(
                "SELECT value, updated_at FROM kv_store WHERE namespace = ?1",
                params![namespace],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read kv_store entry {namespace}"))?;

        let (blob_bytes, updated_at, store) = match row {
            Some((value, updated_at)) => (
                value.len(),
                Some(updated_at),
                RecordStore::from_blob(Some(&value)),
            ),
            None => (0, None, RecordStore::new()),
        };

        let buckets =
            rank(&store, config).map_err(|err| anyhow!("failed to rank {namespace}: {err}"))?;

        Ok(StoreStatus {
            contract_version: STATUS_CONTRACT_VERSION.to_string(),
            namespace: namespace.to_string(),
            present: updated_at.is_some(),
            blob_bytes,
            record_count: store.len(),
            ranked_count: buckets.iter().map(|bucket| bucket.entries.len()).sum(),
            bucket_count: buckets.len(),
            updated_at,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl KeyValueStore for SqliteRatioStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, RankingError> {
        self.get_value(key)
            .map_err(|err| RankingError::Storage(format!("{err:#}")))
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), RankingError> {
        self.set_value(key, value)
            .map_err(|err| RankingError::Storage(format!("{err:#}")))
    }
}

fn read_value(conn: &Connection, namespace: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM kv_store WHERE namespace = ?1",
        params![namespace],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .with_context(|| format!("failed to read kv_store entry {namespace}"))
}

fn write_value(conn: &Connection, namespace: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv_store(namespace, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(namespace) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![namespace, value, now_rfc3339()?],
    )
    .with_context(|| format!("failed to write kv_store entry {namespace}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
