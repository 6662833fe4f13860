//! PlanStore: subjects and care-plan definitions.

use crate::db::{self, from_millis, to_millis};
use crate::error::{Error, Result};
use crate::plan::types::{
    Definition, DefinitionKind, GoalDefinition, Level, MilestoneInput, MilestoneSpec, NewGoal,
    NewRoutine, NewSubject, RoutineDefinition, Schedule, Subject, TimeWindow,
    default_target_date,
};

use anyhow::Context as _;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use std::collections::HashSet;

#[derive(Clone)]
pub struct PlanStore {
    pool: SqlitePool,
}

impl PlanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a subject, or update the date of birth / timezone of an
    /// existing one.
    pub async fn register_subject(&self, subject: &NewSubject) -> Result<Subject> {
        if subject.id.trim().is_empty() {
            return Err(Error::invalid("subject id must not be empty"));
        }
        if subject.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(Error::invalid(format!(
                "unknown timezone '{}'",
                subject.timezone
            )));
        }

        let now = to_millis(Utc::now());
        let date_of_birth = subject.date_of_birth.map(|date| date.to_string());
        sqlx::query(
            "INSERT INTO subjects (id, date_of_birth, timezone, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET date_of_birth = excluded.date_of_birth,
                                           timezone = excluded.timezone",
        )
        .bind(&subject.id)
        .bind(&date_of_birth)
        .bind(&subject.timezone)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to register subject")?;

        self.require_subject(&subject.id).await
    }

    pub async fn get_subject(&self, subject_id: &str) -> Result<Option<Subject>> {
        let row = sqlx::query_as::<_, SubjectRow>(
            "SELECT id, date_of_birth, timezone, created_at FROM subjects WHERE id = ?",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch subject")?;

        row.map(SubjectRow::into_subject).transpose()
    }

    pub async fn require_subject(&self, subject_id: &str) -> Result<Subject> {
        self.get_subject(subject_id)
            .await?
            .ok_or_else(|| Error::UnknownSubject(subject_id.to_string()))
    }

    /// Every subject id, for full rebuilds.
    pub async fn subject_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM subjects ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("failed to list subjects")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn create_routine(
        &self,
        subject_id: &str,
        routine: &NewRoutine,
    ) -> Result<RoutineDefinition> {
        self.require_subject(subject_id).await?;
        validate_name(&routine.name)?;
        validate_schedule(&routine.schedule)?;

        let now = db::now();
        let definition = RoutineDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            name: routine.name.trim().to_string(),
            category: routine.category.clone(),
            schedule: routine.schedule.clone(),
            window: routine.window,
            created_at: now,
            updated_at: now,
        };
        self.insert(&Definition::Routine(definition.clone())).await?;
        Ok(definition)
    }

    /// Create a skill or objective with its ordered milestones.
    pub async fn create_goal(
        &self,
        subject_id: &str,
        kind: DefinitionKind,
        goal: &NewGoal,
    ) -> Result<GoalDefinition> {
        if kind == DefinitionKind::Routine {
            return Err(Error::invalid("routines are not goals"));
        }
        let subject = self.require_subject(subject_id).await?;
        validate_name(&goal.name)?;

        if let Some(skill_id) = &goal.skill_id {
            if kind != DefinitionKind::Objective {
                return Err(Error::invalid("only objectives may reference a skill"));
            }
            match self.get_definition(skill_id).await? {
                Some(Definition::Skill(skill)) if skill.subject_id == subject_id => {}
                _ => {
                    return Err(Error::invalid(format!(
                        "skill '{skill_id}' does not exist for subject '{subject_id}'"
                    )));
                }
            }
        }

        let now = db::now();
        let attached_on = now.with_timezone(&subject.tz()).date_naive();
        let milestones =
            build_milestones(&goal.milestones, subject.age_on(attached_on), attached_on)?;

        let definition = GoalDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            kind,
            name: goal.name.trim().to_string(),
            category: goal.category.clone(),
            target_level: goal.target_level,
            skill_id: goal.skill_id.clone(),
            milestones,
            created_at: now,
            updated_at: now,
        };
        let wrapped = match kind {
            DefinitionKind::Skill => Definition::Skill(definition.clone()),
            _ => Definition::Objective(definition.clone()),
        };
        self.insert(&wrapped).await?;
        Ok(definition)
    }

    /// Persist an edited definition. Callers validate the edit first.
    pub async fn save(&self, definition: &Definition) -> Result<()> {
        let (name, category, config) = split_definition(definition)?;
        let result = sqlx::query(
            "UPDATE definitions SET name = ?, category = ?, config = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(name)
        .bind(category)
        .bind(&config)
        .bind(to_millis(Utc::now()))
        .bind(definition.id())
        .execute(&self.pool)
        .await
        .context("failed to update definition")?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("definition {}", definition.id())));
        }
        Ok(())
    }

    pub async fn get_definition(&self, definition_id: &str) -> Result<Option<Definition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            "SELECT id, subject_id, kind, name, category, config, created_at, updated_at
             FROM definitions WHERE id = ?",
        )
        .bind(definition_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch definition")?;

        row.map(DefinitionRow::into_definition).transpose()
    }

    pub async fn list_definitions(&self, subject_id: &str) -> Result<Vec<Definition>> {
        let rows = sqlx::query_as::<_, DefinitionRow>(
            "SELECT id, subject_id, kind, name, category, config, created_at, updated_at
             FROM definitions WHERE subject_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list definitions")?;

        rows.into_iter().map(DefinitionRow::into_definition).collect()
    }

    pub async fn routines(&self, subject_id: &str) -> Result<Vec<RoutineDefinition>> {
        Ok(self
            .list_definitions(subject_id)
            .await?
            .into_iter()
            .filter_map(|definition| match definition {
                Definition::Routine(routine) => Some(routine),
                _ => None,
            })
            .collect())
    }

    pub async fn goals(&self, subject_id: &str) -> Result<Vec<GoalDefinition>> {
        Ok(self
            .list_definitions(subject_id)
            .await?
            .into_iter()
            .filter_map(|definition| match definition {
                Definition::Skill(goal) | Definition::Objective(goal) => Some(goal),
                Definition::Routine(_) => None,
            })
            .collect())
    }

    async fn insert(&self, definition: &Definition) -> Result<()> {
        let (name, category, config) = split_definition(definition)?;
        let (created_at, updated_at) = match definition {
            Definition::Routine(routine) => (routine.created_at, routine.updated_at),
            Definition::Skill(goal) | Definition::Objective(goal) => {
                (goal.created_at, goal.updated_at)
            }
        };
        sqlx::query(
            "INSERT INTO definitions (id, subject_id, kind, name, category, config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(definition.id())
        .bind(definition.subject_id())
        .bind(definition.kind().as_str())
        .bind(name)
        .bind(category)
        .bind(&config)
        .bind(to_millis(created_at))
        .bind(to_millis(updated_at))
        .execute(&self.pool)
        .await
        .context("failed to insert definition")?;
        Ok(())
    }
}

impl std::fmt::Debug for PlanStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanStore").finish_non_exhaustive()
    }
}

/// Turn milestone inputs into specs: ids generated where missing, target
/// dates defaulted from the subject's age, ids unique within the goal.
pub(crate) fn build_milestones(
    inputs: &[MilestoneInput],
    age_years: Option<u32>,
    attached_on: NaiveDate,
) -> Result<Vec<MilestoneSpec>> {
    let mut seen = HashSet::new();
    let mut milestones = Vec::with_capacity(inputs.len());
    for input in inputs {
        if input.description.trim().is_empty() {
            return Err(Error::invalid("milestone description must not be empty"));
        }
        let id = input
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !seen.insert(id.clone()) {
            return Err(Error::invalid(format!("duplicate milestone id '{id}'")));
        }
        milestones.push(MilestoneSpec {
            id,
            description: input.description.trim().to_string(),
            level: input.level,
            target_date: Some(
                input
                    .target_date
                    .unwrap_or_else(|| default_target_date(age_years, attached_on, input.level)),
            ),
        });
    }
    Ok(milestones)
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid("name must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_schedule(schedule: &Schedule) -> Result<()> {
    if let Schedule::Weekly { days } = schedule {
        if days.is_empty() {
            return Err(Error::invalid("weekly schedule needs at least one day"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Kind-specific fields, stored as JSON in `definitions.config`.
#[derive(Serialize, Deserialize)]
struct RoutineConfig {
    schedule: Schedule,
    window: Option<TimeWindow>,
}

#[derive(Serialize, Deserialize)]
struct GoalConfig {
    target_level: Level,
    skill_id: Option<String>,
    milestones: Vec<MilestoneSpec>,
}

fn split_definition(definition: &Definition) -> Result<(&str, &str, String)> {
    let config = match definition {
        Definition::Routine(routine) => serde_json::to_string(&RoutineConfig {
            schedule: routine.schedule.clone(),
            window: routine.window,
        }),
        Definition::Skill(goal) | Definition::Objective(goal) => {
            serde_json::to_string(&GoalConfig {
                target_level: goal.target_level,
                skill_id: goal.skill_id.clone(),
                milestones: goal.milestones.clone(),
            })
        }
    }
    .context("failed to serialize definition config")?;

    let (name, category) = match definition {
        Definition::Routine(routine) => (routine.name.as_str(), routine.category.as_str()),
        Definition::Skill(goal) | Definition::Objective(goal) => {
            (goal.name.as_str(), goal.category.as_str())
        }
    };
    Ok((name, category, config))
}

#[derive(sqlx::FromRow)]
struct SubjectRow {
    id: String,
    date_of_birth: Option<String>,
    timezone: String,
    created_at: i64,
}

impl SubjectRow {
    fn into_subject(self) -> Result<Subject> {
        let date_of_birth = self
            .date_of_birth
            .map(|value| value.parse::<NaiveDate>())
            .transpose()
            .context("invalid date_of_birth in database")?;
        Ok(Subject {
            id: self.id,
            date_of_birth,
            timezone: self.timezone,
            created_at: from_millis(self.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: String,
    subject_id: String,
    kind: String,
    name: String,
    category: String,
    config: String,
    created_at: i64,
    updated_at: i64,
}

impl DefinitionRow {
    fn into_definition(self) -> Result<Definition> {
        let kind: DefinitionKind = self
            .kind
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid definition kind in database: {e}"))?;

        match kind {
            DefinitionKind::Routine => {
                let config: RoutineConfig = serde_json::from_str(&self.config)
                    .context("invalid routine config in database")?;
                Ok(Definition::Routine(RoutineDefinition {
                    id: self.id,
                    subject_id: self.subject_id,
                    name: self.name,
                    category: self.category,
                    schedule: config.schedule,
                    window: config.window,
                    created_at: from_millis(self.created_at),
                    updated_at: from_millis(self.updated_at),
                }))
            }
            DefinitionKind::Skill | DefinitionKind::Objective => {
                let config: GoalConfig = serde_json::from_str(&self.config)
                    .context("invalid goal config in database")?;
                let goal = GoalDefinition {
                    id: self.id,
                    subject_id: self.subject_id,
                    kind,
                    name: self.name,
                    category: self.category,
                    target_level: config.target_level,
                    skill_id: config.skill_id,
                    milestones: config.milestones,
                    created_at: from_millis(self.created_at),
                    updated_at: from_millis(self.updated_at),
                };
                Ok(if kind == DefinitionKind::Skill {
                    Definition::Skill(goal)
                } else {
                    Definition::Objective(goal)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (PlanStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("carecoord.db"))
            .await
            .unwrap();
        (PlanStore::new(pool), dir)
    }

    fn subject(id: &str) -> NewSubject {
        NewSubject {
            id: id.into(),
            date_of_birth: NaiveDate::from_ymd_opt(2019, 4, 2),
            timezone: "America/Chicago".into(),
        }
    }

    #[tokio::test]
    async fn register_subject_is_an_upsert() {
        let (store, _dir) = setup().await;

        store.register_subject(&subject("s1")).await.unwrap();
        let mut changed = subject("s1");
        changed.timezone = "Europe/Berlin".into();
        let updated = store.register_subject(&changed).await.unwrap();

        assert_eq!(updated.timezone, "Europe/Berlin");
        assert_eq!(store.subject_ids().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn register_subject_rejects_unknown_timezone() {
        let (store, _dir) = setup().await;
        let mut bad = subject("s1");
        bad.timezone = "Mars/Olympus".into();

        let error = store.register_subject(&bad).await.unwrap_err();
        assert!(matches!(error, Error::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn definitions_roundtrip_through_config_json() {
        let (store, _dir) = setup().await;
        store.register_subject(&subject("s1")).await.unwrap();

        let routine = store
            .create_routine(
                "s1",
                &NewRoutine {
                    name: "Morning routine".into(),
                    category: "daily_living".into(),
                    schedule: Schedule::Weekdays,
                    window: None,
                },
            )
            .await
            .unwrap();

        let goal = store
            .create_goal(
                "s1",
                DefinitionKind::Objective,
                &NewGoal {
                    name: "Independent dressing".into(),
                    category: "self_care".into(),
                    target_level: Level::Proficient,
                    skill_id: None,
                    milestones: vec![MilestoneInput {
                        id: Some("m1".into()),
                        description: "Puts on shirt".into(),
                        level: Level::Emerging,
                        target_date: None,
                    }],
                },
            )
            .await
            .unwrap();

        let listed = store.list_definitions("s1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.routines("s1").await.unwrap(), vec![routine]);

        let goals = store.goals("s1").await.unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].id, goal.id);
        assert_eq!(goals[0].kind, DefinitionKind::Objective);
        assert!(goals[0].milestones[0].target_date.is_some());
    }

    #[tokio::test]
    async fn definitions_require_a_registered_subject() {
        let (store, _dir) = setup().await;
        let error = store
            .create_routine(
                "ghost",
                &NewRoutine {
                    name: "Bedtime".into(),
                    category: "general".into(),
                    schedule: Schedule::Daily,
                    window: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UnknownSubject(_)));
    }

    #[test]
    fn duplicate_milestone_ids_are_rejected() {
        let inputs = vec![
            MilestoneInput {
                id: Some("m1".into()),
                description: "a".into(),
                level: Level::Emerging,
                target_date: None,
            },
            MilestoneInput {
                id: Some("m1".into()),
                description: "b".into(),
                level: Level::Developing,
                target_date: None,
            },
        ];
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(build_milestones(&inputs, None, today).is_err());
    }
}
