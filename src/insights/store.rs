//! InsightStore: append-only insight history with supersession.

use crate::db::{from_millis, to_millis};
use crate::error::Result;
use crate::insights::rules::{Candidate, Rule};
use crate::insights::{Insight, InsightStatus, InsightType, rank};

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// What one evaluation cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub created: usize,
    pub kept: usize,
    pub superseded: usize,
}

#[derive(Clone)]
pub struct InsightStore {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "id, subject_id, rule_id, insight_type, priority, confidence, \
     message, suggested_action, refs, generated_at, expires_at, superseded_at";

impl InsightStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply one evaluation cycle for a subject, keyed by `(subject, rule)`:
    /// an unchanged live insight is kept and its expiry renewed, a changed or
    /// expired one is superseded by a new row, and a rule that stopped firing
    /// supersedes its live row. Nothing is deleted.
    pub async fn record_cycle(
        &self,
        subject_id: &str,
        results: &[(&'static Rule, Option<Candidate>)],
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        let mut tx = self.pool.begin().await?;

        for (rule, candidate) in results {
            let current = sqlx::query_as::<_, InsightRow>(&format!(
                "SELECT {SELECT_COLUMNS} FROM insights
                 WHERE subject_id = ? AND rule_id = ? AND superseded_at IS NULL
                 ORDER BY generated_at DESC LIMIT 1"
            ))
            .bind(subject_id)
            .bind(rule.id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to fetch live insight")?
            .map(InsightRow::into_insight)
            .transpose()?;

            if let (Some(current), Some(candidate)) = (&current, candidate) {
                if current.expires_at > now && same_content(current, candidate) {
                    // Still true as of this pass, so it stays live for another ttl.
                    sqlx::query("UPDATE insights SET expires_at = ? WHERE id = ?")
                        .bind(to_millis(now + ttl))
                        .bind(&current.id)
                        .execute(&mut *tx)
                        .await
                        .context("failed to renew insight")?;
                    summary.kept += 1;
                    continue;
                }
            }

            if let Some(current) = &current {
                sqlx::query("UPDATE insights SET superseded_at = ? WHERE id = ?")
                    .bind(to_millis(now))
                    .bind(&current.id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to supersede insight")?;
                summary.superseded += 1;
            }

            let Some(candidate) = candidate else {
                continue;
            };
            let refs = serde_json::to_string(&candidate.references)
                .context("failed to serialize insight references")?;
            sqlx::query(
                "INSERT INTO insights (id, subject_id, rule_id, insight_type, priority, confidence,
                     message, suggested_action, refs, generated_at, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(subject_id)
            .bind(rule.id)
            .bind(candidate.insight_type.as_str())
            .bind(candidate.priority.as_str())
            .bind(i64::from(candidate.confidence))
            .bind(&candidate.message)
            .bind(&candidate.suggested_action)
            .bind(&refs)
            .bind(to_millis(now))
            .bind(to_millis(now + ttl))
            .execute(&mut *tx)
            .await
            .context("failed to insert insight")?;
            summary.created += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Ranked insights for a subject. `Active` returns live, unexpired rows;
    /// `All` returns the full history.
    pub async fn list(
        &self,
        subject_id: &str,
        insight_type: Option<InsightType>,
        status: InsightStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<Insight>> {
        let rows = sqlx::query_as::<_, InsightRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM insights
             WHERE subject_id = ? AND (? IS NULL OR insight_type = ?)"
        ))
        .bind(subject_id)
        .bind(insight_type.map(|t| t.as_str()))
        .bind(insight_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("failed to list insights")?;

        let mut insights = rows
            .into_iter()
            .map(InsightRow::into_insight)
            .collect::<Result<Vec<_>>>()?;
        if status == InsightStatus::Active {
            insights.retain(|insight| insight.is_active(now));
        }
        rank(&mut insights);
        Ok(insights)
    }
}

impl std::fmt::Debug for InsightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightStore").finish_non_exhaustive()
    }
}

fn same_content(current: &Insight, candidate: &Candidate) -> bool {
    current.insight_type == candidate.insight_type
        && current.priority == candidate.priority
        && current.confidence == candidate.confidence
        && current.message == candidate.message
        && current.suggested_action == candidate.suggested_action
        && current.references == candidate.references
}

#[derive(sqlx::FromRow)]
struct InsightRow {
    id: String,
    subject_id: String,
    rule_id: String,
    insight_type: String,
    priority: String,
    confidence: i64,
    message: String,
    suggested_action: String,
    refs: String,
    generated_at: i64,
    expires_at: i64,
    superseded_at: Option<i64>,
}

impl InsightRow {
    fn into_insight(self) -> Result<Insight> {
        let insight_type = self
            .insight_type
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid insight type in database: {e}"))?;
        let priority = self
            .priority
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid priority in database: {e}"))?;
        let references: Vec<String> =
            serde_json::from_str(&self.refs).context("invalid insight refs in database")?;

        Ok(Insight {
            id: self.id,
            subject_id: self.subject_id,
            rule_id: self.rule_id,
            insight_type,
            priority,
            confidence: u8::try_from(self.confidence.clamp(0, 100)).unwrap_or_default(),
            message: self.message,
            suggested_action: self.suggested_action,
            references,
            generated_at: from_millis(self.generated_at),
            expires_at: from_millis(self.expires_at),
            superseded_at: self.superseded_at.map(from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{Priority, RULES};

    use chrono::TimeZone as _;

    use std::collections::BTreeSet;

    async fn setup() -> (InsightStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("carecoord.db"))
            .await
            .unwrap();
        (InsightStore::new(pool), dir)
    }

    fn candidate(confidence: u8) -> Candidate {
        Candidate {
            insight_type: InsightType::Quality,
            priority: Priority::Low,
            confidence,
            message: "Positive behavior rose from 55.0% to 72.0% over the last 30 days.".into(),
            suggested_action: "Keep going.".into(),
            references: vec!["metric:behavior_ratio".into()],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn reevaluation_supersedes_instead_of_duplicating() {
        let (store, _dir) = setup().await;
        let rule = &RULES[0];
        let ttl = Duration::hours(24);

        let first = store
            .record_cycle("s1", &[(rule, Some(candidate(84)))], now(), ttl)
            .await
            .unwrap();
        assert_eq!(first.created, 1);

        let unchanged = store
            .record_cycle("s1", &[(rule, Some(candidate(84)))], now() + Duration::hours(1), ttl)
            .await
            .unwrap();
        assert_eq!(unchanged.kept, 1);

        let changed = store
            .record_cycle("s1", &[(rule, Some(candidate(90)))], now() + Duration::hours(2), ttl)
            .await
            .unwrap();
        assert_eq!((changed.created, changed.superseded), (1, 1));

        let active = store
            .list("s1", None, InsightStatus::Active, now() + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].confidence, 90);

        let history = store
            .list("s1", Some(InsightType::Quality), InsightStatus::All, now())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn silent_rules_retire_their_insight_and_expiry_hides_it() {
        let (store, _dir) = setup().await;
        let rule = &RULES[0];
        let ttl = Duration::hours(24);

        store
            .record_cycle("s1", &[(rule, Some(candidate(84)))], now(), ttl)
            .await
            .unwrap();
        let expired = store
            .list("s1", None, InsightStatus::Active, now() + Duration::hours(25))
            .await
            .unwrap();
        assert!(expired.is_empty());

        let retired = store
            .record_cycle("s1", &[(rule, None)], now() + Duration::hours(1), ttl)
            .await
            .unwrap();
        assert_eq!(retired.superseded, 1);
        let active = store
            .list("s1", None, InsightStatus::Active, now() + Duration::hours(2))
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn kept_insights_stay_live_past_the_first_ttl() {
        let (store, _dir) = setup().await;
        let rule = &RULES[0];
        let ttl = Duration::hours(24);

        store
            .record_cycle("s1", &[(rule, Some(candidate(84)))], now(), ttl)
            .await
            .unwrap();
        store
            .record_cycle("s1", &[(rule, Some(candidate(84)))], now() + Duration::hours(20), ttl)
            .await
            .unwrap();

        let active = store
            .list("s1", None, InsightStatus::Active, now() + Duration::hours(30))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].generated_at, now());
        assert_eq!(active[0].expires_at, now() + Duration::hours(44));
    }

    #[tokio::test]
    async fn type_filter_returns_every_live_rule_of_that_type() {
        let (store, _dir) = setup().await;
        let ttl = Duration::hours(24);
        let improving = RULES.iter().find(|r| r.id == "behavior_improving").unwrap();
        let low_quality = RULES.iter().find(|r| r.id == "quality_of_life_low").unwrap();

        let mut quality_low = candidate(70);
        quality_low.message = "Quality of life averaged 4.0 over the last 90 days.".into();
        store
            .record_cycle(
                "s1",
                &[(improving, Some(candidate(84))), (low_quality, Some(quality_low))],
                now(),
                ttl,
            )
            .await
            .unwrap();

        let quality = store
            .list("s1", Some(InsightType::Quality), InsightStatus::Active, now())
            .await
            .unwrap();
        let rules: BTreeSet<&str> = quality.iter().map(|i| i.rule_id.as_str()).collect();
        assert_eq!(rules, BTreeSet::from(["behavior_improving", "quality_of_life_low"]));
    }
}
