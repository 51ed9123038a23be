//! Memory Store
//!
//! Append-only log of pipeline runs with cosine-similarity lookup over the
//! embedding of each run's request text.
//!
//! Records are written with a single INSERT, so a record is either committed
//! whole or not at all. A trigger in the schema rejects every UPDATE. Records
//! are only ever removed by an explicit operator `prune` or `clear`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sdk::errors::EngineError;
use sdk::types::{MemoryRecord, RecordFilter, RecordId, ScoredRecord};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use crate::llm::{Embedder, GatewayError};

/// Errors raised by the memory store
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] GatewayError),
}

impl From<MemoryError> for EngineError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::InvalidArgument(msg) => EngineError::InvalidArgument(msg),
            MemoryError::Embedding(e) => e.into(),
            other => EngineError::Persistence(other.to_string()),
        }
    }
}

/// Durable, queryable history of pipeline runs
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append a record; it is visible to queries as soon as this returns
    async fn store(&self, record: &MemoryRecord) -> Result<RecordId, MemoryError>;

    /// Up to `k` records ranked by cosine similarity to `embedding`
    ///
    /// Ties are broken by newer timestamp first. Records whose embedding has a
    /// different dimension are never candidates.
    async fn query_similar_vector(
        &self,
        embedding: &[f32],
        k: usize,
        filter: RecordFilter,
    ) -> Result<Vec<ScoredRecord>, MemoryError>;

    /// Embed `text` through the gateway, then rank like `query_similar_vector`
    async fn query_similar(
        &self,
        text: &str,
        k: usize,
        filter: RecordFilter,
    ) -> Result<Vec<ScoredRecord>, MemoryError>;
}

/// Limits applied by an explicit prune
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    /// Keep only this many newest records
    pub max_records: Option<u64>,
    /// Drop records older than this many days
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_records.is_none() && self.max_age_days.is_none()
    }
}

/// Aggregate counts over the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total: i64,
    pub executed: i64,
    pub passed: i64,
    pub failed: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// SQLite-backed memory store
pub struct SqliteMemoryStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

const RECORD_COLUMNS: &str = "seq, id, request_id, request_text, embedding, artifact, \
     execution_result, verdict, failed_stage, created_at";

impl SqliteMemoryStore {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Most recent records, newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<MemoryRecord>, MemoryError> {
        let sql = format!(
            "SELECT {} FROM memory_records ORDER BY created_at DESC, seq DESC LIMIT ?",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_record).collect()
    }

    /// Look up a single record by id
    pub async fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let sql = format!("SELECT {} FROM memory_records WHERE id = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_record).transpose()
    }

    /// Totals by outcome
    pub async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(has_result), 0) AS executed,
                COALESCE(SUM(CASE WHEN passed = 1 THEN 1 ELSE 0 END), 0) AS passed,
                COALESCE(SUM(CASE WHEN passed = 0 THEN 1 ELSE 0 END), 0) AS failed,
                MIN(created_at) AS oldest,
                MAX(created_at) AS newest
            FROM memory_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MemoryStats {
            total: row.get("total"),
            executed: row.get("executed"),
            passed: row.get("passed"),
            failed: row.get("failed"),
            oldest: row
                .get::<Option<i64>, _>("oldest")
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            newest: row
                .get::<Option<i64>, _>("newest")
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }

    /// Apply `policy` and return the number of records removed
    pub async fn prune(&self, policy: &RetentionPolicy) -> Result<u64, MemoryError> {
        let mut removed = 0u64;

        if let Some(days) = policy.max_age_days {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            let result = sqlx::query("DELETE FROM memory_records WHERE created_at < ?")
                .bind(cutoff.timestamp_millis())
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected();
        }

        if let Some(max) = policy.max_records {
            let keep = i64::try_from(max).unwrap_or(i64::MAX);
            let result = sqlx::query(
                r#"
                DELETE FROM memory_records WHERE seq NOT IN (
                    SELECT seq FROM memory_records
                    ORDER BY created_at DESC, seq DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(keep)
            .execute(&self.pool)
            .await?;
            removed += result.rows_affected();
        }

        info!("Pruned {} memory records", removed);
        Ok(removed)
    }

    /// Remove every record
    pub async fn clear(&self) -> Result<u64, MemoryError> {
        let result = sqlx::query("DELETE FROM memory_records")
            .execute(&self.pool)
            .await?;

        info!("Cleared {} memory records", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn fetch_by_seq(&self, seq: i64) -> Result<MemoryRecord, MemoryError> {
        let sql = format!("SELECT {} FROM memory_records WHERE seq = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql).bind(seq).fetch_one(&self.pool).await?;
        decode_record(&row)
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn store(&self, record: &MemoryRecord) -> Result<RecordId, MemoryError> {
        if record.embedding.is_empty() {
            return Err(MemoryError::InvalidArgument(
                "record embedding must not be empty".to_string(),
            ));
        }

        let artifact = record.artifact.as_ref().map(to_json).transpose()?;
        let execution_result = record.execution_result.as_ref().map(to_json).transpose()?;
        let verdict = record.verdict.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO memory_records (
                id, request_id, request_text, embedding, embedding_dim,
                artifact, artifact_digest, execution_result, verdict, failed_stage,
                has_result, passed, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.request_id)
        .bind(&record.request_text)
        .bind(encode_embedding(&record.embedding))
        .bind(record.embedding.len() as i64)
        .bind(artifact)
        .bind(record.artifact_digest())
        .bind(execution_result)
        .bind(verdict)
        .bind(&record.failed_stage)
        .bind(record.execution_result.is_some())
        .bind(record.passed())
        .bind(record.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!("Stored memory record {}", record.id);
        Ok(record.id.clone())
    }

    async fn query_similar_vector(
        &self,
        embedding: &[f32],
        k: usize,
        filter: RecordFilter,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        if k == 0 {
            return Err(MemoryError::InvalidArgument(
                "k must be at least 1".to_string(),
            ));
        }
        if embedding.is_empty() {
            return Err(MemoryError::InvalidArgument(
                "query embedding must not be empty".to_string(),
            ));
        }

        let rows = match filter.has_execution_result {
            Some(wanted) => {
                sqlx::query(
                    "SELECT seq, embedding, created_at FROM memory_records \
                     WHERE embedding_dim = ? AND has_result = ?",
                )
                .bind(embedding.len() as i64)
                .bind(wanted)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT seq, embedding, created_at FROM memory_records \
                     WHERE embedding_dim = ?",
                )
                .bind(embedding.len() as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut candidates: Vec<(f64, i64, i64)> = rows
            .iter()
            .map(|row| {
                let stored = decode_embedding(&row.get::<Vec<u8>, _>("embedding"));
                let score = cosine_similarity(embedding, &stored);
                (score, row.get::<i64, _>("created_at"), row.get::<i64, _>("seq"))
            })
            .collect();

        candidates.sort_by(rank_order);
        candidates.truncate(k);

        let mut results = Vec::with_capacity(candidates.len());
        for (score, _, seq) in candidates {
            let record = self.fetch_by_seq(seq).await?;
            results.push(ScoredRecord { record, score });
        }

        debug!("Similarity query returned {} of k={} records", results.len(), k);
        Ok(results)
    }

    async fn query_similar(
        &self,
        text: &str,
        k: usize,
        filter: RecordFilter,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        if k == 0 {
            return Err(MemoryError::InvalidArgument(
                "k must be at least 1".to_string(),
            ));
        }

        let embedding = self.embedder.embed(text).await?;
        self.query_similar_vector(&embedding, k, filter).await
    }
}

/// Score descending, then newer timestamp, then later insertion
fn rank_order(a: &(f64, i64, i64), b: &(f64, i64, i64)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| b.2.cmp(&a.2))
}

/// Cosine similarity computed in f64; zero when either vector has no magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, MemoryError> {
    serde_json::to_string(value).map_err(|e| MemoryError::InvalidArgument(e.to_string()))
}

fn decode_record(row: &SqliteRow) -> Result<MemoryRecord, MemoryError> {
    let id: String = row.get("id");

    let corrupt = |reason: String| MemoryError::Corrupt {
        id: id.clone(),
        reason,
    };

    let artifact = row
        .get::<Option<String>, _>("artifact")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| corrupt(format!("artifact: {}", e)))?;
    let execution_result = row
        .get::<Option<String>, _>("execution_result")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| corrupt(format!("execution_result: {}", e)))?;
    let verdict = row
        .get::<Option<String>, _>("verdict")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| corrupt(format!("verdict: {}", e)))?;

    let created_at: i64 = row.get("created_at");
    let timestamp = Utc
        .timestamp_millis_opt(created_at)
        .single()
        .ok_or_else(|| corrupt(format!("timestamp {}", created_at)))?;

    Ok(MemoryRecord {
        id: id.clone(),
        request_id: row.get("request_id"),
        embedding: decode_embedding(&row.get::<Vec<u8>, _>("embedding")),
        request_text: row.get("request_text"),
        artifact,
        execution_result,
        verdict,
        failed_stage: row.get("failed_stage"),
        timestamp,
    })
}
