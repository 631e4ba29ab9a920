//! SQLite-backed storage for interaction records and quality scores

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::{InteractionRecord, QualityComponents, QualityScore};

/// Persistent store for records and their cached scores
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

type RecordRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

impl RecordStore {
    /// Open (or create) a store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;

        // WAL keeps the recorder's appends cheap
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                domain TEXT NOT NULL,
                context TEXT NOT NULL,
                tool_trace TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quality_scores (
                record_id TEXT PRIMARY KEY,
                overall REAL NOT NULL,
                user_satisfaction REAL NOT NULL,
                functional_correctness REAL NOT NULL,
                code_quality REAL NOT NULL,
                context_relevance REAL NOT NULL,
                efficiency REAL NOT NULL,
                confidence REAL NOT NULL,
                assessed_at TEXT NOT NULL,
                assessor_version INTEGER NOT NULL,
                FOREIGN KEY (record_id) REFERENCES interactions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_timestamp ON interactions(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_interactions_domain ON interactions(domain);
            CREATE INDEX IF NOT EXISTS idx_scores_overall ON quality_scores(overall DESC);
        "#,
        )?;

        Ok(())
    }

    /// Append a record. Records are immutable; duplicate ids are rejected.
    pub async fn insert_record(&self, record: &InteractionRecord) -> Result<()> {
        let conn = self.conn.lock().await;

        let context_json = serde_json::to_string(&record.context_snapshot)?;
        let trace_json = serde_json::to_string(&record.tool_trace)?;

        conn.execute(
            r#"INSERT INTO interactions
               (id, session_id, timestamp, input, output, domain, context, tool_trace)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                record.id,
                record.session_id,
                record.timestamp.to_rfc3339(),
                record.input,
                record.output,
                record.domain,
                context_json,
                trace_json,
            ],
        )
        .context("Failed to insert interaction record")?;

        Ok(())
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<InteractionRecord>> {
        let conn = self.conn.lock().await;
        let row: Option<RecordRow> = conn
            .query_row(
                "SELECT id, session_id, timestamp, input, output, domain, context, tool_trace
                 FROM interactions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;

        row.map(Self::row_to_record).transpose()
    }

    pub async fn record_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Persist a score, replacing any stale one from an older assessor
    pub async fn save_score(&self, record_id: &str, score: &QualityScore) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO quality_scores
               (record_id, overall, user_satisfaction, functional_correctness, code_quality,
                context_relevance, efficiency, confidence, assessed_at, assessor_version)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                record_id,
                score.overall,
                score.components.user_satisfaction,
                score.components.functional_correctness,
                score.components.code_quality,
                score.components.context_relevance,
                score.components.efficiency,
                score.confidence,
                score.assessed_at.to_rfc3339(),
                score.assessor_version,
            ],
        )
        .context("Failed to save quality score")?;
        Ok(())
    }

    /// Cached score for a record, honored only when the assessor version
    /// matches
    pub async fn cached_score(
        &self,
        record_id: &str,
        assessor_version: u32,
    ) -> Result<Option<QualityScore>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"SELECT overall, user_satisfaction, functional_correctness, code_quality,
                          context_relevance, efficiency, confidence, assessed_at, assessor_version
                   FROM quality_scores WHERE record_id = ?1 AND assessor_version = ?2"#,
                params![record_id, assessor_version],
                Self::map_score_row,
            )
            .optional()?;
        row.map(Self::row_to_score).transpose()
    }

    /// Scored records created after the given instant, oldest first
    pub async fn scored_records_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(InteractionRecord, QualityScore)>> {
        self.scored_query(
            "WHERE i.timestamp > ?1 ORDER BY i.timestamp ASC",
            rusqlite::params_from_iter([rusqlite::types::Value::Text(since.to_rfc3339())]),
        )
        .await
    }

    /// Qualifying candidate count since the given instant
    pub async fn qualifying_count_since(
        &self,
        since: DateTime<Utc>,
        min_overall: f64,
        min_confidence: f64,
    ) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM interactions i
               JOIN quality_scores q ON q.record_id = i.id
               WHERE i.timestamp > ?1 AND q.overall >= ?2 AND q.confidence >= ?3"#,
            params![since.to_rfc3339(), min_overall, min_confidence],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Scored records older than the given instant, best first. This is the
    /// fixed historical pool the validation suites draw from.
    pub async fn scored_records_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(InteractionRecord, QualityScore)>> {
        self.scored_query(
            "WHERE i.timestamp <= ?1 ORDER BY q.overall DESC LIMIT ?2",
            rusqlite::params_from_iter([
                rusqlite::types::Value::Text(before.to_rfc3339()),
                rusqlite::types::Value::Integer(limit as i64),
            ]),
        )
        .await
    }

    /// Highest-scored records for one domain, used as few-shot exemplars
    pub async fn top_scored_for_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<(InteractionRecord, QualityScore)>> {
        self.scored_query(
            "WHERE i.domain = ?1 ORDER BY q.overall DESC LIMIT ?2",
            rusqlite::params_from_iter([
                rusqlite::types::Value::Text(domain.to_string()),
                rusqlite::types::Value::Integer(limit as i64),
            ]),
        )
        .await
    }

    /// Overall values of the most recent assessments, oldest first
    pub async fn recent_scores(&self, window: usize) -> Result<Vec<f64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT q.overall FROM quality_scores q
               JOIN interactions i ON i.id = q.record_id
               ORDER BY i.timestamp DESC LIMIT ?1"#,
        )?;
        let mut values: Vec<f64> = stmt
            .query_map(params![window as i64], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        values.reverse();
        Ok(values)
    }

    /// Historical record counts per domain
    pub async fn domain_history_counts(&self) -> Result<HashMap<String, u64>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT domain, COUNT(*) FROM interactions GROUP BY domain")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (domain, count) = row?;
            counts.insert(domain, count as u64);
        }
        Ok(counts)
    }

    /// Substring search over inputs and outputs, newest first
    pub async fn search_records(&self, query: &str, limit: usize) -> Result<Vec<InteractionRecord>> {
        let conn = self.conn.lock().await;
        let pattern = format!("%{}%", query);
        let mut stmt = conn.prepare(
            r#"SELECT id, session_id, timestamp, input, output, domain, context, tool_trace
               FROM interactions
               WHERE input LIKE ?1 OR output LIKE ?1
               ORDER BY timestamp DESC LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![pattern, limit as i64], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Self::row_to_record(row?)?);
        }
        Ok(records)
    }

    async fn scored_query(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<(InteractionRecord, QualityScore)>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            r#"SELECT i.id, i.session_id, i.timestamp, i.input, i.output, i.domain,
                      i.context, i.tool_trace,
                      q.overall, q.user_satisfaction, q.functional_correctness, q.code_quality,
                      q.context_relevance, q.efficiency, q.confidence, q.assessed_at,
                      q.assessor_version
               FROM interactions i
               JOIN quality_scores q ON q.record_id = i.id
               {clause}"#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            let record: RecordRow = (
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            );
            let score: ScoreRow = (
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
                row.get(14)?,
                row.get(15)?,
                row.get(16)?,
            );
            Ok((record, score))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (record, score) = row?;
            results.push((Self::row_to_record(record)?, Self::row_to_score(score)?));
        }
        Ok(results)
    }

    fn map_score_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    }

    fn row_to_record(row: RecordRow) -> Result<InteractionRecord> {
        let (id, session_id, timestamp, input, output, domain, context, tool_trace) = row;
        Ok(InteractionRecord {
            id,
            session_id,
            timestamp: parse_timestamp(&timestamp)?,
            input,
            output,
            domain,
            context_snapshot: serde_json::from_str(&context)
                .context("Corrupt context snapshot in store")?,
            tool_trace: serde_json::from_str(&tool_trace)
                .context("Corrupt tool trace in store")?,
        })
    }

    fn row_to_score(row: ScoreRow) -> Result<QualityScore> {
        let (
            overall,
            user_satisfaction,
            functional_correctness,
            code_quality,
            context_relevance,
            efficiency,
            confidence,
            assessed_at,
            assessor_version,
        ) = row;
        Ok(QualityScore {
            overall,
            components: QualityComponents {
                user_satisfaction,
                functional_correctness,
                code_quality,
                context_relevance,
                efficiency,
            },
            confidence,
            assessed_at: parse_timestamp(&assessed_at)?,
            assessor_version: assessor_version as u32,
        })
    }
}

type ScoreRow = (f64, f64, f64, f64, f64, f64, f64, String, i64);

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in store: {s}"))?
        .with_timezone(&Utc))
}
