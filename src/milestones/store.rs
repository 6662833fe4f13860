//! MilestoneStore: materialized milestone instances and goal state.

use crate::db::{from_millis, to_millis};
use crate::error::Result;
use crate::milestones::tracker::{GoalProgress, MilestoneState};
use crate::plan::Level;

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// Materialized position of one goal, as served to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalState {
    pub subject_id: String,
    pub goal_id: String,
    pub level: Level,
    pub target_level: Level,
    pub target_reached: bool,
    pub achieved_count: u32,
    pub milestone_count: u32,
    pub milestones: Vec<MilestoneState>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MilestoneStore {
    pool: SqlitePool,
}

impl MilestoneStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace the goal's milestone rows and state in one transaction.
    pub async fn save(
        &self,
        subject_id: &str,
        progress: &GoalProgress,
        computed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM milestones WHERE subject_id = ? AND goal_id = ?")
            .bind(subject_id)
            .bind(&progress.goal_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear milestones")?;

        for (position, milestone) in progress.milestones.iter().enumerate() {
            sqlx::query(
                "INSERT INTO milestones (subject_id, goal_id, milestone_id, position, description,
                     level, target_date, achieved, achieved_at, evidence_observation_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(subject_id)
            .bind(&progress.goal_id)
            .bind(&milestone.id)
            .bind(position as i64)
            .bind(&milestone.description)
            .bind(milestone.level.as_str())
            .bind(milestone.target_date.map(|date| date.to_string()))
            .bind(milestone.achieved)
            .bind(milestone.achieved_at.map(to_millis))
            .bind(&milestone.evidence_observation_id)
            .execute(&mut *tx)
            .await
            .context("failed to insert milestone")?;
        }

        sqlx::query(
            "INSERT INTO goal_states (subject_id, goal_id, level, target_level, achieved_count,
                 milestone_count, computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(subject_id, goal_id) DO UPDATE SET
                 level = excluded.level,
                 target_level = excluded.target_level,
                 achieved_count = excluded.achieved_count,
                 milestone_count = excluded.milestone_count,
                 computed_at = excluded.computed_at",
        )
        .bind(subject_id)
        .bind(&progress.goal_id)
        .bind(progress.level.as_str())
        .bind(progress.target_level.as_str())
        .bind(progress.achieved_count() as i64)
        .bind(progress.milestones.len() as i64)
        .bind(to_millis(computed_at))
        .execute(&mut *tx)
        .await
        .context("failed to upsert goal state")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn load(&self, subject_id: &str, goal_id: &str) -> Result<Option<GoalState>> {
        let state = sqlx::query_as::<_, GoalStateRow>(
            "SELECT level, target_level, achieved_count, milestone_count, computed_at
             FROM goal_states WHERE subject_id = ? AND goal_id = ?",
        )
        .bind(subject_id)
        .bind(goal_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch goal state")?;

        let Some(state) = state else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, MilestoneRow>(
            "SELECT milestone_id, description, level, target_date, achieved, achieved_at,
                    evidence_observation_id
             FROM milestones WHERE subject_id = ? AND goal_id = ?
             ORDER BY position ASC",
        )
        .bind(subject_id)
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list milestones")?;

        let milestones = rows
            .into_iter()
            .map(MilestoneRow::into_state)
            .collect::<Result<Vec<_>>>()?;
        let level = parse_level(&state.level)?;
        let target_level = parse_level(&state.target_level)?;

        Ok(Some(GoalState {
            subject_id: subject_id.to_string(),
            goal_id: goal_id.to_string(),
            level,
            target_level,
            target_reached: level >= target_level,
            achieved_count: u32::try_from(state.achieved_count).unwrap_or_default(),
            milestone_count: u32::try_from(state.milestone_count).unwrap_or_default(),
            milestones,
            computed_at: from_millis(state.computed_at),
        }))
    }

    /// Drop materialized state for a subject, or for one of its goals.
    pub async fn clear(&self, subject_id: &str, goal_id: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["milestones", "goal_states"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE subject_id = ? AND (? IS NULL OR goal_id = ?)"
            ))
            .bind(subject_id)
            .bind(goal_id)
            .bind(goal_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to clear {table}"))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for MilestoneStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilestoneStore").finish_non_exhaustive()
    }
}

fn parse_level(value: &str) -> Result<Level> {
    value
        .parse()
        .map_err(|e: String| anyhow::anyhow!("invalid level in database: {e}").into())
}

#[derive(sqlx::FromRow)]
struct GoalStateRow {
    level: String,
    target_level: String,
    achieved_count: i64,
    milestone_count: i64,
    computed_at: i64,
}

#[derive(sqlx::FromRow)]
struct MilestoneRow {
    milestone_id: String,
    description: String,
    level: String,
    target_date: Option<String>,
    achieved: bool,
    achieved_at: Option<i64>,
    evidence_observation_id: Option<String>,
}

impl MilestoneRow {
    fn into_state(self) -> Result<MilestoneState> {
        let target_date = self
            .target_date
            .map(|value| value.parse::<NaiveDate>())
            .transpose()
            .context("invalid milestone target_date in database")?;
        Ok(MilestoneState {
            id: self.milestone_id,
            description: self.description,
            level: parse_level(&self.level)?,
            target_date,
            achieved: self.achieved,
            achieved_at: self.achieved_at.map(from_millis),
            evidence_observation_id: self.evidence_observation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone as _;

    async fn setup() -> (MilestoneStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("carecoord.db"))
            .await
            .unwrap();
        (MilestoneStore::new(pool), dir)
    }

    fn progress() -> GoalProgress {
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 10, 0, 0).unwrap();
        GoalProgress {
            goal_id: "g1".into(),
            level: Level::Developing,
            target_level: Level::Proficient,
            target_reached: false,
            milestones: vec![
                MilestoneState {
                    id: "e1".into(),
                    description: "Puts on shirt".into(),
                    level: Level::Emerging,
                    target_date: NaiveDate::from_ymd_opt(2026, 4, 1),
                    achieved: true,
                    achieved_at: Some(at),
                    evidence_observation_id: Some("o1".into()),
                },
                MilestoneState {
                    id: "d1".into(),
                    description: "Buttons shirt".into(),
                    level: Level::Developing,
                    target_date: None,
                    achieved: false,
                    achieved_at: None,
                    evidence_observation_id: None,
                },
            ],
            rejected: Vec::new(),
        }
    }

    #[tokio::test]
    async fn save_and_load_goal_state() {
        let (store, _dir) = setup().await;
        let computed_at = Utc.with_ymd_and_hms(2026, 2, 4, 0, 0, 0).unwrap();

        store.save("s1", &progress(), computed_at).await.unwrap();
        store.save("s1", &progress(), computed_at).await.unwrap();

        let state = store.load("s1", "g1").await.unwrap().unwrap();
        assert_eq!(state.level, Level::Developing);
        assert_eq!(state.achieved_count, 1);
        assert_eq!(state.milestone_count, 2);
        assert_eq!(state.milestones, progress().milestones);

        store.clear("s1", Some("g1")).await.unwrap();
        assert!(store.load("s1", "g1").await.unwrap().is_none());
    }
}
