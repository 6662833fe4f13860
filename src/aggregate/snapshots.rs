//! SnapshotStore: materialized metric snapshots and per-subject recompute
//! bookkeeping.

use crate::aggregate::{MetricSnapshot, MetricValue};
use crate::db::{from_millis, to_millis};
use crate::error::Result;
use crate::observation::Domain;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// When a subject's derived state was last refreshed, and the last failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeState {
    pub last_computed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace every snapshot of one `(subject, domain, definition)` scope in
    /// a single transaction, so readers never see a half-written scope.
    pub async fn replace_scope(
        &self,
        subject_id: &str,
        domain: Domain,
        definition_id: Option<&str>,
        snapshots: &[MetricSnapshot],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM metric_snapshots
             WHERE subject_id = ? AND domain = ? AND definition_id = ?",
        )
        .bind(subject_id)
        .bind(domain.as_str())
        .bind(definition_id.unwrap_or_default())
        .execute(&mut *tx)
        .await
        .context("failed to clear snapshot scope")?;

        for snapshot in snapshots {
            sqlx::query(
                "INSERT INTO metric_snapshots (subject_id, domain, definition_id, metric, status,
                     value, sample_size, first_seq, last_seq, computed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&snapshot.subject_id)
            .bind(snapshot.domain.as_str())
            .bind(snapshot.definition_id.as_deref().unwrap_or_default())
            .bind(&snapshot.metric)
            .bind(snapshot.value.status())
            .bind(snapshot.value.value())
            .bind(i64::from(snapshot.sample_size))
            .bind(snapshot.first_seq)
            .bind(snapshot.last_seq)
            .bind(to_millis(snapshot.computed_at))
            .execute(&mut *tx)
            .await
            .context("failed to insert metric snapshot")?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Snapshots for a subject, optionally narrowed to a domain and to those
    /// computed at or after `since`. Ordered by domain, definition, metric.
    pub async fn list(
        &self,
        subject_id: &str,
        domain: Option<Domain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT subject_id, domain, definition_id, metric, status, value, sample_size,
                    first_seq, last_seq, computed_at
             FROM metric_snapshots
             WHERE subject_id = ?
               AND (? IS NULL OR domain = ?)
               AND (? IS NULL OR computed_at >= ?)
             ORDER BY domain ASC, definition_id ASC, metric ASC",
        )
        .bind(subject_id)
        .bind(domain.map(|domain| domain.as_str()))
        .bind(domain.map(|domain| domain.as_str()))
        .bind(since.map(to_millis))
        .bind(since.map(to_millis))
        .fetch_all(&self.pool)
        .await
        .context("failed to list metric snapshots")?;

        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    /// Delete every snapshot for a subject, or only one definition's.
    pub async fn clear(&self, subject_id: &str, definition_id: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM metric_snapshots
             WHERE subject_id = ? AND (? IS NULL OR definition_id = ?)",
        )
        .bind(subject_id)
        .bind(definition_id)
        .bind(definition_id)
        .execute(&self.pool)
        .await
        .context("failed to clear metric snapshots")?;
        Ok(result.rows_affected())
    }

    pub async fn mark_computed(&self, subject_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO recompute_state (subject_id, last_computed_at) VALUES (?, ?)
             ON CONFLICT(subject_id) DO UPDATE SET last_computed_at = excluded.last_computed_at",
        )
        .bind(subject_id)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await
        .context("failed to record recompute success")?;
        Ok(())
    }

    pub async fn mark_failed(&self, subject_id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO recompute_state (subject_id, last_error, last_error_at) VALUES (?, ?, ?)
             ON CONFLICT(subject_id) DO UPDATE SET last_error = excluded.last_error,
                                                   last_error_at = excluded.last_error_at",
        )
        .bind(subject_id)
        .bind(error)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await
        .context("failed to record recompute failure")?;
        Ok(())
    }

    /// Subjects with an observation recorded after their last successful pass,
    /// or that were never computed at all.
    pub async fn stale_subjects(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT o.subject_id FROM observations o
             LEFT JOIN recompute_state r ON r.subject_id = o.subject_id
             GROUP BY o.subject_id
             HAVING MAX(r.last_computed_at) IS NULL
                 OR MAX(o.recorded_at) > MAX(r.last_computed_at)
             ORDER BY o.subject_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to find stale subjects")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Registered subjects with no successful pass since `cutoff`.
    pub async fn computed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT s.id FROM subjects s
             LEFT JOIN recompute_state r ON r.subject_id = s.id
             WHERE r.last_computed_at IS NULL OR r.last_computed_at < ?
             ORDER BY s.id",
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .context("failed to find subjects due for refresh")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn recompute_state(&self, subject_id: &str) -> Result<RecomputeState> {
        let row: Option<(Option<i64>, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT last_computed_at, last_error, last_error_at
             FROM recompute_state WHERE subject_id = ?",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read recompute state")?;

        Ok(row
            .map(|(computed, error, error_at)| RecomputeState {
                last_computed_at: computed.map(from_millis),
                last_error: error,
                last_error_at: error_at.map(from_millis),
            })
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    subject_id: String,
    domain: String,
    definition_id: String,
    metric: String,
    status: String,
    value: Option<f64>,
    sample_size: i64,
    first_seq: Option<i64>,
    last_seq: Option<i64>,
    computed_at: i64,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<MetricSnapshot> {
        let domain: Domain = self
            .domain
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid snapshot domain in database: {e}"))?;
        let value = match (self.status.as_str(), self.value) {
            ("ok", Some(value)) => MetricValue::Value { value },
            ("insufficient_data", _) => MetricValue::InsufficientData,
            (status, _) => {
                return Err(anyhow::anyhow!("invalid snapshot status in database: {status}").into());
            }
        };
        Ok(MetricSnapshot {
            subject_id: self.subject_id,
            domain,
            definition_id: Some(self.definition_id).filter(|id| !id.is_empty()),
            metric: self.metric,
            value,
            sample_size: u32::try_from(self.sample_size).unwrap_or_default(),
            first_seq: self.first_seq,
            last_seq: self.last_seq,
            computed_at: from_millis(self.computed_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone as _};

    async fn setup() -> (SnapshotStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("carecoord.db"))
            .await
            .unwrap();
        (SnapshotStore::new(pool), dir)
    }

    fn snapshot(metric: &str, value: MetricValue) -> MetricSnapshot {
        MetricSnapshot {
            subject_id: "s1".into(),
            domain: Domain::Behavior,
            definition_id: None,
            metric: metric.into(),
            value,
            sample_size: 7,
            first_seq: Some(3),
            last_seq: Some(12),
            computed_at: Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn replace_scope_overwrites_previous_snapshots() {
        let (store, _dir) = setup().await;

        store
            .replace_scope(
                "s1",
                Domain::Behavior,
                None,
                &[
                    snapshot("behavior_ratio", MetricValue::Value { value: 40.0 }),
                    snapshot("behavior_ratio:home", MetricValue::InsufficientData),
                ],
            )
            .await
            .unwrap();
        let replacement = snapshot("behavior_ratio", MetricValue::Value { value: 55.5 });
        store
            .replace_scope("s1", Domain::Behavior, None, std::slice::from_ref(&replacement))
            .await
            .unwrap();

        let listed = store.list("s1", Some(Domain::Behavior), None).await.unwrap();
        assert_eq!(listed, vec![replacement]);
    }

    #[tokio::test]
    async fn recompute_state_tracks_success_and_failure() {
        let (store, _dir) = setup().await;
        assert_eq!(
            store.recompute_state("s1").await.unwrap(),
            RecomputeState::default()
        );

        let at = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        store.mark_computed("s1", at).await.unwrap();
        store.mark_failed("s1", "disk full", at).await.unwrap();

        let state = store.recompute_state("s1").await.unwrap();
        assert_eq!(state.last_computed_at, Some(at));
        assert_eq!(state.last_error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn subjects_due_for_refresh() {
        let (store, _dir) = setup().await;
        for id in ["s1", "s2", "s3"] {
            sqlx::query("INSERT INTO subjects (id, created_at) VALUES (?, 0)")
                .bind(id)
                .execute(&store.pool)
                .await
                .unwrap();
        }

        let at = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        store.mark_computed("s1", at - Duration::hours(2)).await.unwrap();
        store.mark_computed("s2", at).await.unwrap();

        let due = store.computed_before(at - Duration::hours(1)).await.unwrap();
        assert_eq!(due, vec!["s1".to_string(), "s3".to_string()]);
    }
}
