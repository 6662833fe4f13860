//! The engine: ingestion, care-plan edits, and background recomputation.
//!
//! Writes are validated and made durable synchronously. Everything derived
//! from them (metrics, goal state, patterns, insights) is recomputed in the
//! background under a per-subject slot, so readers may briefly see the
//! previous pass's results but never a half-written one.

mod recompute;
mod scheduler;

pub use recompute::spawn_recompute_loop;
pub use scheduler::Scope;

use crate::aggregate::SnapshotStore;
use crate::config::EngineConfig;
use crate::db;
use crate::error::{Error, Result};
use crate::insights::InsightStore;
use crate::milestones::{self, MilestoneStore};
use crate::observation::{
    AppendOutcome, NewObservation, Observation, ObservationPayload, ObservationStore,
    without_superseded,
};
use crate::patterns::PatternStore;
use crate::plan::{
    Definition, DefinitionKind, DefinitionUpdate, GoalDefinition, NewGoal, NewRoutine,
    NewSubject, PlanStore, RoutineDefinition, Subject,
};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use std::sync::Arc;

pub struct Engine {
    config: EngineConfig,
    plans: PlanStore,
    observations: ObservationStore,
    snapshots: SnapshotStore,
    patterns: PatternStore,
    milestones: MilestoneStore,
    insights: InsightStore,
    scheduler: scheduler::Scheduler,
}

impl Engine {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            plans: PlanStore::new(pool.clone()),
            observations: ObservationStore::new(pool.clone()),
            snapshots: SnapshotStore::new(pool.clone()),
            patterns: PatternStore::new(pool.clone()),
            milestones: MilestoneStore::new(pool.clone()),
            insights: InsightStore::new(pool),
            scheduler: scheduler::Scheduler::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    pub fn observations(&self) -> &ObservationStore {
        &self.observations
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn milestones(&self) -> &MilestoneStore {
        &self.milestones
    }

    pub fn insights(&self) -> &InsightStore {
        &self.insights
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Validate and append one observation.
    ///
    /// Validation errors come back synchronously. A retry with a known
    /// idempotency key returns the prior id. Recomputation is triggered by
    /// the accepted event and never affects the result.
    pub async fn ingest(&self, mut observation: NewObservation) -> Result<AppendOutcome> {
        observation.validate(Utc::now(), self.config.max_future_skew_secs)?;
        self.plans.require_subject(&observation.subject_id).await?;

        // A retry answers with the prior id even if the goal has moved on.
        if let Some(prior_id) = self.observations.find_duplicate(&observation).await? {
            return Ok(AppendOutcome::Duplicate { prior_id });
        }

        let mut goals: Vec<GoalDefinition> = Vec::new();
        if let Some(definition_id) = observation.payload.definition_id() {
            let definition = self.plans.get_definition(definition_id).await?;
            let expected_kind = match &observation.payload {
                ObservationPayload::Routine(_) => "routine",
                _ => "skill or objective",
            };
            let matches_kind = match (&observation.payload, &definition) {
                (ObservationPayload::Routine(_), Some(Definition::Routine(_))) => true,
                (ObservationPayload::Skill(_), Some(Definition::Skill(_)))
                | (ObservationPayload::Skill(_), Some(Definition::Objective(_))) => true,
                _ => false,
            };
            let same_subject = definition
                .as_ref()
                .is_some_and(|definition| definition.subject_id() == observation.subject_id);
            if !matches_kind || !same_subject {
                return Err(Error::invalid(format!(
                    "'{definition_id}' is not a {expected_kind} of subject '{}'",
                    observation.subject_id
                )));
            }

            if let Some(goal) = definition.as_ref().and_then(Definition::as_goal) {
                goals.push(goal.clone());
            }
        }

        // A skill correction also touches the goal of the row it replaces.
        let replaced = match &observation.supersedes {
            Some(target) => self
                .observations
                .get(target)
                .await?
                .filter(|prior| prior.subject_id == observation.subject_id),
            None => None,
        };
        if let Some(ObservationPayload::Skill(prior)) = replaced.as_ref().map(|p| &p.payload) {
            if !goals.iter().any(|goal| goal.id == prior.skill_id) {
                if let Some(goal) = self
                    .plans
                    .get_definition(&prior.skill_id)
                    .await?
                    .and_then(|definition| definition.as_goal().cloned())
                {
                    goals.push(goal);
                }
            }
        }

        if !goals.is_empty() {
            let candidate = pending(&observation);
            let replaced = replaced.as_ref().map(|prior| prior.id.as_str());
            for goal in &goals {
                let history = self.goal_history(goal, DateTime::<Utc>::MAX_UTC).await?;
                milestones::check_evidence(goal, &history, replaced, &candidate)?;
            }
        }

        self.observations.append(&observation).await
    }

    /// Non-superseded observations referencing a goal, up to `until`.
    async fn goal_history(
        &self,
        goal: &GoalDefinition,
        until: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let superseded = self
            .observations
            .superseded_ids(&goal.subject_id, until)
            .await?;
        let history = self
            .observations
            .for_definition(&goal.subject_id, &goal.id, until)
            .await?;
        Ok(without_superseded(history, &superseded))
    }

    // -----------------------------------------------------------------------
    // Care plan
    // -----------------------------------------------------------------------

    pub async fn register_subject(&self, subject: &NewSubject) -> Result<Subject> {
        let subject = self.plans.register_subject(subject).await?;
        tracing::info!(subject_id = %subject.id, timezone = %subject.timezone, "subject registered");
        Ok(subject)
    }

    pub async fn create_routine(
        self: &Arc<Self>,
        subject_id: &str,
        routine: &NewRoutine,
    ) -> Result<RoutineDefinition> {
        let routine = self.plans.create_routine(subject_id, routine).await?;
        tracing::info!(subject_id, routine_id = %routine.id, "routine created");
        self.schedule(subject_id, [Scope::Routine(routine.id.clone())]);
        Ok(routine)
    }

    /// Create a skill or objective. Its milestone instances and an initial
    /// goal state are materialized before this returns.
    pub async fn create_goal(
        self: &Arc<Self>,
        subject_id: &str,
        kind: DefinitionKind,
        goal: &NewGoal,
    ) -> Result<GoalDefinition> {
        let goal = self.plans.create_goal(subject_id, kind, goal).await?;
        let progress = milestones::replay(&goal, &[]);
        self.milestones.save(subject_id, &progress, db::now()).await?;

        tracing::info!(subject_id, goal_id = %goal.id, kind = %kind, "goal created");
        self.schedule(subject_id, [Scope::Goal(goal.id.clone())]);
        Ok(goal)
    }

    /// Apply an explicit edit to a definition.
    ///
    /// An edit that would move a goal back to a lower level (for example by
    /// adding an unachieved milestone to a level it already passed) is
    /// rejected so goal state stays monotonic.
    pub async fn update_definition(
        self: &Arc<Self>,
        definition_id: &str,
        update: &DefinitionUpdate,
    ) -> Result<Definition> {
        let current = self
            .plans
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("definition {definition_id}")))?;
        let subject = self.plans.require_subject(current.subject_id()).await?;

        let updated = match current {
            Definition::Routine(routine) => {
                Definition::Routine(apply_routine_update(routine, update)?)
            }
            Definition::Skill(goal) => {
                Definition::Skill(self.apply_goal_update(&subject, goal, update).await?)
            }
            Definition::Objective(goal) => {
                Definition::Objective(self.apply_goal_update(&subject, goal, update).await?)
            }
        };

        self.plans.save(&updated).await?;
        tracing::info!(
            subject_id = %subject.id,
            definition_id,
            kind = %updated.kind(),
            "definition updated"
        );

        let scope = match &updated {
            Definition::Routine(routine) => Scope::Routine(routine.id.clone()),
            Definition::Skill(goal) | Definition::Objective(goal) => Scope::Goal(goal.id.clone()),
        };
        self.schedule(&subject.id, [scope]);
        Ok(updated)
    }

    async fn apply_goal_update(
        &self,
        subject: &Subject,
        goal: GoalDefinition,
        update: &DefinitionUpdate,
    ) -> Result<GoalDefinition> {
        if update.schedule.is_some() || update.window.is_some() {
            return Err(Error::invalid("schedule and window only apply to routines"));
        }

        let mut edited = goal.clone();
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(Error::invalid("name must not be empty"));
            }
            edited.name = name.trim().to_string();
        }
        if let Some(category) = &update.category {
            edited.category = category.clone();
        }
        if let Some(target_level) = update.target_level {
            edited.target_level = target_level;
        }
        if let Some(inputs) = &update.milestones {
            // Keep existing target dates for milestones that are carried over.
            let inputs: Vec<_> = inputs
                .iter()
                .cloned()
                .map(|mut input| {
                    if input.target_date.is_none() {
                        input.target_date = input
                            .id
                            .as_deref()
                            .and_then(|id| goal.milestone(id))
                            .and_then(|existing| existing.target_date);
                    }
                    input
                })
                .collect();
            let today = db::now().with_timezone(&subject.tz()).date_naive();
            edited.milestones =
                crate::plan::build_milestones(&inputs, subject.age_on(today), today)?;
        }

        let history = self.goal_history(&goal, DateTime::<Utc>::MAX_UTC).await?;
        let before = milestones::replay(&goal, &history);
        let after = milestones::replay(&edited, &history);
        if after.level < before.level {
            return Err(Error::invalid(format!(
                "edit would move goal '{}' from {} back to {}; milestones may only be added at or above the current level",
                goal.id, before.level, after.level
            )));
        }

        edited.updated_at = db::now();
        Ok(edited)
    }
}

/// The not-yet-stored observation as replay sees it: after every stored row
/// that shares its timestamp.
fn pending(observation: &NewObservation) -> Observation {
    Observation {
        id: String::new(),
        seq: i64::MAX,
        subject_id: observation.subject_id.clone(),
        environment: observation.environment,
        reporter: observation.reporter.clone(),
        observed_at: observation.observed_at,
        recorded_at: db::now(),
        idempotency_key: observation.idempotency_key.clone(),
        supersedes: observation.supersedes.clone(),
        payload: observation.payload.clone(),
    }
}

fn apply_routine_update(
    mut routine: RoutineDefinition,
    update: &DefinitionUpdate,
) -> Result<RoutineDefinition> {
    if update.target_level.is_some() || update.milestones.is_some() {
        return Err(Error::invalid(
            "target level and milestones only apply to skills and objectives",
        ));
    }
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(Error::invalid("name must not be empty"));
        }
        routine.name = name.trim().to_string();
    }
    if let Some(category) = &update.category {
        routine.category = category.clone();
    }
    if let Some(schedule) = &update.schedule {
        crate::plan::validate_schedule(schedule)?;
        routine.schedule = schedule.clone();
    }
    if let Some(window) = update.window {
        routine.window = Some(window);
    }
    routine.updated_at = db::now();
    Ok(routine)
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
