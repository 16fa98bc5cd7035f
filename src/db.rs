//! Database layer for the decision and feedback ledgers
//!
//! One SQLite file holds the decision ledger, the persisted vector index
//! (vectors plus their ordered correlation ids) and the feedback ledger.
//! Single file, zero network dependencies, works offline.

use crate::error::{EngineError, Result};
use crate::types::{Decision, FeedbackRecord, Horizon};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;

/// Open (or create) the database and apply the schema
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", 1)?;
    conn.execute_batch(SCHEMA)?;

    Ok(conn)
}

const SCHEMA: &str = r#"
-- Decisions: one row per finalized subject-period pair, append-only
CREATE TABLE IF NOT EXISTS decisions (
    correlation_id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    as_of TEXT NOT NULL,            -- YYYY-MM-DD
    verdict INTEGER NOT NULL,       -- 0 = reject, 1 = include
    rationale_text TEXT NOT NULL,
    created_at TEXT NOT NULL        -- RFC 3339
);

CREATE INDEX IF NOT EXISTS idx_decisions_subject ON decisions(subject_id);

-- Vector index: position N holds the Nth appended vector and its id
CREATE TABLE IF NOT EXISTS case_vectors (
    position INTEGER PRIMARY KEY,
    correlation_id TEXT NOT NULL UNIQUE REFERENCES decisions(correlation_id),
    vector BLOB NOT NULL            -- little-endian f32
);

CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Feedback: written once every horizon has resolved
CREATE TABLE IF NOT EXISTS feedback (
    correlation_id TEXT PRIMARY KEY REFERENCES decisions(correlation_id),
    summary_text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback_returns (
    correlation_id TEXT NOT NULL REFERENCES feedback(correlation_id),
    horizon TEXT NOT NULL,          -- e.g. 1w, 3m
    return_pct REAL NOT NULL,
    PRIMARY KEY (correlation_id, horizon)
);
"#;

const CACHE_SCHEMA: &str = r#"
-- Embedding cache: one vector per (gateway namespace, SHA-256 of text)
CREATE TABLE IF NOT EXISTS embedding_cache (
    namespace TEXT NOT NULL,
    text_key TEXT NOT NULL,
    vector BLOB NOT NULL,           -- little-endian f32
    PRIMARY KEY (namespace, text_key)
);
"#;

/// Open (or create) the embedding cache database
pub fn init_cache_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(conn)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, format!("bad date '{}': {}", s, e)))
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", s, e)))
}

const DECISION_COLUMNS: &str =
    "correlation_id, subject_id, as_of, verdict, rationale_text, created_at";

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let as_of: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    Ok(Decision {
        correlation_id: row.get(0)?,
        subject_id: row.get(1)?,
        as_of: parse_date(2, &as_of)?,
        verdict: row.get::<_, i64>(3)? != 0,
        rationale_text: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
    })
}

/// Record a decision
pub fn insert_decision(conn: &Connection, decision: &Decision) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO decisions (correlation_id, subject_id, as_of, verdict,
                               rationale_text, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            decision.correlation_id,
            decision.subject_id,
            decision.as_of.format("%Y-%m-%d").to_string(),
            decision.verdict as i32,
            decision.rationale_text,
            decision.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_decision(conn: &Connection, correlation_id: &str) -> Result<Option<Decision>> {
    let sql = format!(
        "SELECT {} FROM decisions WHERE correlation_id = ?1",
        DECISION_COLUMNS
    );
    let decision = conn
        .query_row(&sql, [correlation_id], decision_from_row)
        .optional()?;
    Ok(decision)
}

pub fn decision_exists(conn: &Connection, correlation_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM decisions WHERE correlation_id = ?1",
        [correlation_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn count_decisions(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Decisions that still lack a feedback row, oldest first
pub fn decisions_without_feedback(conn: &Connection) -> Result<Vec<Decision>> {
    let sql = format!(
        "SELECT {} FROM decisions d
         WHERE NOT EXISTS (SELECT 1 FROM feedback f WHERE f.correlation_id = d.correlation_id)
         ORDER BY d.as_of, d.correlation_id",
        DECISION_COLUMNS
            .split(", ")
            .map(|c| format!("d.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let decisions = stmt
        .query_map([], decision_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(decisions)
}

/// Every decision that has feedback, joined with it
pub fn decisions_with_feedback(conn: &Connection) -> Result<Vec<(Decision, FeedbackRecord)>> {
    let sql = format!(
        "SELECT {} FROM decisions d
         JOIN feedback f ON f.correlation_id = d.correlation_id
         ORDER BY d.as_of, d.correlation_id",
        DECISION_COLUMNS
            .split(", ")
            .map(|c| format!("d.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let decisions = stmt
        .query_map([], decision_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut joined = Vec::with_capacity(decisions.len());
    for decision in decisions {
        let feedback = get_feedback(conn, &decision.correlation_id)?.ok_or_else(|| {
            EngineError::InvalidRecord(format!(
                "feedback for {} vanished mid-query",
                decision.correlation_id
            ))
        })?;
        joined.push((decision, feedback));
    }
    Ok(joined)
}

// ============================================================================
// Vector index persistence
// ============================================================================

pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

pub fn insert_vector(
    conn: &Connection,
    position: usize,
    correlation_id: &str,
    vector: &[f32],
) -> Result<()> {
    conn.execute(
        "INSERT INTO case_vectors (position, correlation_id, vector) VALUES (?1, ?2, ?3)",
        params![position as i64, correlation_id, vector_to_blob(vector)],
    )?;
    Ok(())
}

/// A persisted index row: (position, correlation_id, vector)
pub type VectorRow = (usize, String, Vec<f32>);

/// Load all persisted vectors in position order
pub fn load_vectors(conn: &Connection) -> Result<Vec<VectorRow>> {
    let mut stmt =
        conn.prepare("SELECT position, correlation_id, vector FROM case_vectors ORDER BY position")?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut rows = Vec::with_capacity(raw.len());
    for (position, id, blob) in raw {
        let vector = blob_to_vector(&blob).ok_or_else(|| {
            EngineError::CorruptIndex(format!("vector blob for {} is {} bytes", id, blob.len()))
        })?;
        rows.push((position as usize, id, vector));
    }
    Ok(rows)
}

pub fn get_index_dimension(conn: &Connection) -> Result<Option<usize>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'dimension'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| EngineError::CorruptIndex(format!("stored dimension '{}'", v))),
        None => Ok(None),
    }
}

pub fn set_index_dimension(conn: &Connection, dimension: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO index_meta (key, value) VALUES ('dimension', ?1)",
        [dimension.to_string()],
    )?;
    Ok(())
}

pub fn get_cached_embedding(
    conn: &Connection,
    namespace: &str,
    text_key: &str,
) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT vector FROM embedding_cache WHERE namespace = ?1 AND text_key = ?2",
            [namespace, text_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob.and_then(|b| blob_to_vector(&b)))
}

pub fn put_cached_embedding(
    conn: &Connection,
    namespace: &str,
    text_key: &str,
    vector: &[f32],
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO embedding_cache (namespace, text_key, vector) VALUES (?1, ?2, ?3)",
        params![namespace, text_key, vector_to_blob(vector)],
    )?;
    Ok(())
}

// ============================================================================
// Feedback ledger
// ============================================================================

/// Write a feedback record and its per-horizon returns atomically
pub fn insert_feedback(conn: &Connection, record: &FeedbackRecord) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO feedback (correlation_id, summary_text, created_at) VALUES (?1, ?2, ?3)",
        params![
            record.correlation_id,
            record.summary_text,
            record.created_at.to_rfc3339()
        ],
    )?;
    for (horizon, pct) in &record.returns {
        tx.execute(
            "INSERT INTO feedback_returns (correlation_id, horizon, return_pct) VALUES (?1, ?2, ?3)",
            params![record.correlation_id, horizon.label(), pct],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn get_feedback(conn: &Connection, correlation_id: &str) -> Result<Option<FeedbackRecord>> {
    let head: Option<(String, String)> = conn
        .query_row(
            "SELECT summary_text, created_at FROM feedback WHERE correlation_id = ?1",
            [correlation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((summary_text, created_at)) = head else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT horizon, return_pct FROM feedback_returns WHERE correlation_id = ?1")?;
    let rows = stmt
        .query_map([correlation_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut returns = BTreeMap::new();
    for (label, pct) in rows {
        let horizon: Horizon = label.parse().map_err(EngineError::InvalidRecord)?;
        returns.insert(horizon, pct);
    }

    Ok(Some(FeedbackRecord {
        correlation_id: correlation_id.to_string(),
        returns,
        summary_text,
        created_at: parse_timestamp(1, &created_at)?,
    }))
}

pub fn count_feedback(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_test_db() -> (Connection, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let conn = init_db(&path).unwrap();
        (conn, dir)
    }

    fn sample_decision(subject: &str, day: u32) -> Decision {
        Decision::new(
            subject,
            NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            true,
            format!("Include {} on strong earnings", subject),
        )
    }

    #[test]
    fn test_init_db() {
        let (conn, _dir) = setup_test_db();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"decisions".to_string()));
        assert!(tables.contains(&"case_vectors".to_string()));
        assert!(tables.contains(&"feedback".to_string()));
        assert!(tables.contains(&"feedback_returns".to_string()));
        assert!(tables.contains(&"index_meta".to_string()));
    }

    #[test]
    fn test_insert_and_get_decision() {
        let (conn, _dir) = setup_test_db();
        let decision = sample_decision("005930", 28);

        insert_decision(&conn, &decision).unwrap();

        let loaded = get_decision(&conn, &decision.correlation_id).unwrap().unwrap();
        assert_eq!(loaded.subject_id, "005930");
        assert_eq!(loaded.as_of, decision.as_of);
        assert!(loaded.verdict);
        assert_eq!(loaded.rationale_text, decision.rationale_text);
        assert_eq!(loaded.created_at, decision.created_at);
        assert!(decision_exists(&conn, &decision.correlation_id).unwrap());
        assert!(get_decision(&conn, "missing@2025-01-01").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_decision_rejected() {
        let (conn, _dir) = setup_test_db();
        let decision = sample_decision("000660", 21);
        insert_decision(&conn, &decision).unwrap();
        assert!(insert_decision(&conn, &decision).is_err());
        assert_eq!(count_decisions(&conn).unwrap(), 1);
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)).unwrap(), v);
        assert!(blob_to_vector(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_vectors_load_in_position_order() {
        let (conn, _dir) = setup_test_db();
        let a = sample_decision("A", 1);
        let b = sample_decision("B", 2);
        insert_decision(&conn, &a).unwrap();
        insert_decision(&conn, &b).unwrap();
        insert_vector(&conn, 1, &b.correlation_id, &[0.0, 1.0]).unwrap();
        insert_vector(&conn, 0, &a.correlation_id, &[1.0, 0.0]).unwrap();

        let rows = load_vectors(&conn).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 0);
        assert_eq!(rows[0].1, a.correlation_id);
        assert_eq!(rows[1].2, vec![0.0, 1.0]);
    }

    #[test]
    fn test_vector_requires_decision() {
        let (conn, _dir) = setup_test_db();
        assert!(insert_vector(&conn, 0, "ghost@2025-01-01", &[1.0]).is_err());
    }

    #[test]
    fn test_embedding_cache_roundtrip() {
        let dir = tempdir().unwrap();
        let conn = init_cache_db(&dir.path().join("embeddings.db")).unwrap();
        assert_eq!(get_cached_embedding(&conn, "hash:8", "k").unwrap(), None);
        put_cached_embedding(&conn, "hash:8", "k", &[0.5, -0.5]).unwrap();
        assert_eq!(
            get_cached_embedding(&conn, "hash:8", "k").unwrap(),
            Some(vec![0.5, -0.5])
        );
        assert_eq!(get_cached_embedding(&conn, "hash:16", "k").unwrap(), None);
    }

    #[test]
    fn test_index_dimension() {
        let (conn, _dir) = setup_test_db();
        assert_eq!(get_index_dimension(&conn).unwrap(), None);
        set_index_dimension(&conn, 384).unwrap();
        assert_eq!(get_index_dimension(&conn).unwrap(), Some(384));
    }

    #[test]
    fn test_feedback_roundtrip_and_pending_list() {
        let (conn, _dir) = setup_test_db();
        let a = sample_decision("A", 3);
        let b = sample_decision("B", 4);
        insert_decision(&conn, &a).unwrap();
        insert_decision(&conn, &b).unwrap();

        let mut returns = BTreeMap::new();
        returns.insert(Horizon::ONE_WEEK, 2.5);
        returns.insert(Horizon::ONE_MONTH, -1.0);
        let record = FeedbackRecord {
            correlation_id: a.correlation_id.clone(),
            returns,
            summary_text: "Call held up over one week, faded over the month".into(),
            created_at: Utc::now(),
        };
        insert_feedback(&conn, &record).unwrap();

        let loaded = get_feedback(&conn, &a.correlation_id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(get_feedback(&conn, &b.correlation_id).unwrap().is_none());

        let pending = decisions_without_feedback(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id, b.correlation_id);

        let joined = decisions_with_feedback(&conn).unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].1.returns.len(), 2);
        assert_eq!(count_feedback(&conn).unwrap(), 1);
    }

    #[test]
    fn test_feedback_insert_is_atomic() {
        let (conn, _dir) = setup_test_db();
        let a = sample_decision("A", 5);
        insert_decision(&conn, &a).unwrap();

        let record = FeedbackRecord {
            correlation_id: a.correlation_id.clone(),
            returns: BTreeMap::from([(Horizon::ONE_WEEK, 1.0)]),
            summary_text: "ok".into(),
            created_at: Utc::now(),
        };
        insert_feedback(&conn, &record).unwrap();
        // Second insert fails on the primary key and leaves no extra rows
        assert!(insert_feedback(&conn, &record).is_err());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM feedback_returns", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
