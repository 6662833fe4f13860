//! Database connection management and the embedded schema.

use crate::error::Result;

use anyhow::Context as _;
use chrono::{DateTime, TimeZone as _, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Connect to (or create) the engine database and run the embedded schema.
///
/// WAL mode lets request handlers read while the recompute workers write.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create data directory: {}", parent.display())
            })?;
        }
    }

    let url = format!("sqlite:{}?mode=rwc", path.display());
    let options = SqliteConnectOptions::from_str(&url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Raw SQL rather than `sqlx::migrate!` so the schema ships inside the binary
/// with no migrations directory to deploy. Every statement is idempotent.
async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_V1)
        .execute(pool)
        .await
        .context("failed to apply schema")?;
    Ok(())
}

/// Timestamps are stored as epoch milliseconds so `ORDER BY` is numeric.
pub(crate) fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

/// Current time truncated to the stored precision, so values read back
/// compare equal to the values written.
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(to_millis(Utc::now()))
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

const SCHEMA_V1: &str = r#"
-- Subjects (root of all coordination data)
CREATE TABLE IF NOT EXISTS subjects (
    id TEXT PRIMARY KEY,
    date_of_birth TEXT,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    created_at INTEGER NOT NULL
);

-- Care-plan definitions: routine / skill / objective
CREATE TABLE IF NOT EXISTS definitions (
    id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    config TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (subject_id) REFERENCES subjects(id)
);
CREATE INDEX IF NOT EXISTS idx_definitions_subject ON definitions(subject_id, kind);

-- Observation log (append-only ground truth)
CREATE TABLE IF NOT EXISTS observations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    subject_id TEXT NOT NULL,
    domain TEXT NOT NULL,
    environment TEXT,
    reporter_id TEXT NOT NULL,
    reporter_role TEXT NOT NULL,
    observed_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    definition_id TEXT,
    supersedes TEXT,
    payload TEXT NOT NULL,
    UNIQUE (subject_id, domain, idempotency_key)
);
CREATE INDEX IF NOT EXISTS idx_observations_timeline
    ON observations(subject_id, domain, observed_at, seq);
CREATE INDEX IF NOT EXISTS idx_observations_definition
    ON observations(subject_id, definition_id, observed_at);

CREATE TRIGGER IF NOT EXISTS observations_no_update
BEFORE UPDATE ON observations
BEGIN
    SELECT RAISE(ABORT, 'observations are append-only');
END;

CREATE TRIGGER IF NOT EXISTS observations_no_delete
BEFORE DELETE ON observations
BEGIN
    SELECT RAISE(ABORT, 'observations are append-only');
END;

-- Derived: metric snapshots (definition_id '' = subject-wide)
CREATE TABLE IF NOT EXISTS metric_snapshots (
    subject_id TEXT NOT NULL,
    domain TEXT NOT NULL,
    definition_id TEXT NOT NULL DEFAULT '',
    metric TEXT NOT NULL,
    status TEXT NOT NULL,
    value REAL,
    sample_size INTEGER NOT NULL,
    first_seq INTEGER,
    last_seq INTEGER,
    computed_at INTEGER NOT NULL,
    PRIMARY KEY (subject_id, domain, definition_id, metric)
);

-- Derived: pattern reports per window
CREATE TABLE IF NOT EXISTS pattern_reports (
    subject_id TEXT NOT NULL,
    window_days INTEGER NOT NULL,
    report TEXT NOT NULL,
    computed_at INTEGER NOT NULL,
    PRIMARY KEY (subject_id, window_days)
);

-- Derived: milestone instances and goal state
CREATE TABLE IF NOT EXISTS milestones (
    subject_id TEXT NOT NULL,
    goal_id TEXT NOT NULL,
    milestone_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    description TEXT NOT NULL,
    level TEXT NOT NULL,
    target_date TEXT,
    achieved INTEGER NOT NULL DEFAULT 0,
    achieved_at INTEGER,
    evidence_observation_id TEXT,
    PRIMARY KEY (subject_id, goal_id, milestone_id)
);

CREATE TABLE IF NOT EXISTS goal_states (
    subject_id TEXT NOT NULL,
    goal_id TEXT NOT NULL,
    level TEXT NOT NULL,
    target_level TEXT NOT NULL,
    achieved_count INTEGER NOT NULL,
    milestone_count INTEGER NOT NULL,
    computed_at INTEGER NOT NULL,
    PRIMARY KEY (subject_id, goal_id)
);

-- Insights (appended, superseded, never deleted)
CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    insight_type TEXT NOT NULL,
    priority TEXT NOT NULL,
    confidence INTEGER NOT NULL,
    message TEXT NOT NULL,
    suggested_action TEXT NOT NULL,
    refs TEXT NOT NULL DEFAULT '[]',
    generated_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    superseded_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_insights_active ON insights(subject_id, rule_id, superseded_at);
CREATE INDEX IF NOT EXISTS idx_insights_type ON insights(subject_id, insight_type, generated_at);

-- Per-subject recompute bookkeeping (staleness is observable)
CREATE TABLE IF NOT EXISTS recompute_state (
    subject_id TEXT PRIMARY KEY,
    last_computed_at INTEGER,
    last_error TEXT,
    last_error_at INTEGER
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_schema_and_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("carecoord.db");

        let pool = connect(&path).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'observations'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn millis_roundtrip_keeps_precision() {
        let now = Utc.timestamp_millis_opt(1_760_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(now)), now);
    }
}
