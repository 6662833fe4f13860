//! PatternStore: one materialized report per (subject, window).

use crate::db::to_millis;
use crate::error::Result;
use crate::patterns::PatternReport;

use anyhow::Context as _;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct PatternStore {
    pool: SqlitePool,
}

impl PatternStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, report: &PatternReport) -> Result<()> {
        let json = serde_json::to_string(report).context("failed to serialize pattern report")?;
        sqlx::query(
            "INSERT INTO pattern_reports (subject_id, window_days, report, computed_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(subject_id, window_days) DO UPDATE SET
                 report = excluded.report,
                 computed_at = excluded.computed_at",
        )
        .bind(&report.subject_id)
        .bind(i64::from(report.window_days))
        .bind(&json)
        .bind(to_millis(report.computed_at))
        .execute(&self.pool)
        .await
        .context("failed to save pattern report")?;
        Ok(())
    }

    pub async fn load(&self, subject_id: &str, window_days: u32) -> Result<Option<PatternReport>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT report FROM pattern_reports WHERE subject_id = ? AND window_days = ?",
        )
        .bind(subject_id)
        .bind(i64::from(window_days))
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch pattern report")?;

        row.map(|(json,)| {
            serde_json::from_str(&json)
                .context("invalid pattern report in database")
                .map_err(Into::into)
        })
        .transpose()
    }

    pub async fn clear(&self, subject_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pattern_reports WHERE subject_id = ?")
            .bind(subject_id)
            .execute(&self.pool)
            .await
            .context("failed to clear pattern reports")?;
        Ok(())
    }
}

impl std::fmt::Debug for PatternStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternStore").finish_non_exhaustive()
    }
}
