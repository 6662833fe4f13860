//! Recompute passes, the background loop that triggers them, and rebuilds.

use crate::aggregate::{Window, metrics};
use crate::db;
use crate::engine::{Engine, Scope};
use crate::error::{Error, Result};
use crate::insights::{self, InsightInputs};
use crate::milestones::{self, GoalProgress};
use crate::observation::{Domain, ObservationAccepted, without_superseded};
use crate::patterns;
use crate::plan::{Definition, Subject};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Catch-up page size after the event bus lagged.
const CATCH_UP_BATCH: i64 = 500;

/// Slack added when waiting for a future-dated observation to fall inside a
/// pass's `as_of`.
const FUTURE_GRACE: std::time::Duration = std::time::Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Spawn the background loop that turns accepted observations into
/// recompute work, runs the pattern batch on a fixed interval, and refreshes
/// subjects whose last pass has aged past the refresh interval.
pub fn spawn_recompute_loop(engine: Arc<Engine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = run_recompute_loop(&engine).await {
            tracing::error!(%error, "recompute loop exited with error");
        }
    })
}

async fn run_recompute_loop(engine: &Arc<Engine>) -> Result<()> {
    let mut events = engine.observations.subscribe();
    let mut cursor = engine.observations.last_seq().await?;

    // Anything accepted after a subject's last successful pass (including
    // work lost to a crash mid-pass) is repaired by re-running.
    for subject_id in engine.snapshots.stale_subjects().await? {
        let scopes = engine.all_scopes(&subject_id).await?;
        engine.schedule(&subject_id, scopes);
    }

    let mut pattern_dirty: HashSet<String> = HashSet::new();
    let mut batch = tokio::time::interval(std::time::Duration::from_secs(
        engine.config.pattern_interval_secs.max(1),
    ));
    batch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut refresh = tokio::time::interval(std::time::Duration::from_secs(
        engine.config.refresh_interval_secs.max(1),
    ));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(cursor, "recompute loop started");

    loop {
        tokio::select! {
            _ = batch.tick() => {
                let count = pattern_dirty.len();
                for subject_id in pattern_dirty.drain() {
                    engine.schedule(&subject_id, [Scope::Patterns]);
                }
                if count > 0 {
                    tracing::debug!(count, "pattern batch scheduled");
                }
            }
            _ = refresh.tick() => {
                match refresh_aged(engine).await {
                    Ok(0) => {}
                    Ok(count) => tracing::debug!(count, "aged subjects scheduled for refresh"),
                    Err(error) => tracing::warn!(%error, "refresh sweep failed"),
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        cursor = cursor.max(event.seq);
                        handle_accepted(engine, &event, &mut pattern_dirty);
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        tracing::warn!(count, cursor, "recompute loop lagged behind event stream");
                        match catch_up(engine, cursor, &mut pattern_dirty).await {
                            Ok(seq) => cursor = seq,
                            Err(error) => tracing::warn!(%error, "failed to catch up after lag"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event channel closed, recompute loop exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_accepted(
    engine: &Arc<Engine>,
    event: &ObservationAccepted,
    pattern_dirty: &mut HashSet<String>,
) {
    let scope = match (event.domain, &event.definition_id) {
        (Domain::Routine, Some(definition_id)) => Scope::Routine(definition_id.clone()),
        (Domain::Skill, Some(definition_id)) => Scope::Goal(definition_id.clone()),
        (Domain::Behavior, _) => Scope::Behavior,
        (Domain::QualityOfLife, _) => Scope::QualityOfLife,
        (domain, None) => {
            tracing::warn!(seq = event.seq, %domain, "accepted observation without a definition");
            return;
        }
    };
    let feeds_patterns = matches!(event.domain, Domain::Behavior | Domain::Routine);
    if feeds_patterns {
        pattern_dirty.insert(event.subject_id.clone());
    }

    // A pass only sees observations up to its own start, so one dated
    // slightly ahead needs another pass once its timestamp has passed.
    if let Ok(delay) = (event.observed_at - Utc::now()).to_std() {
        let engine = Arc::clone(engine);
        let subject_id = event.subject_id.clone();
        let mut scopes = vec![scope.clone()];
        if feeds_patterns {
            scopes.push(Scope::Patterns);
        }
        tracing::debug!(
            seq = event.seq,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "future-dated observation, pass deferred"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay + FUTURE_GRACE).await;
            engine.schedule(&subject_id, scopes);
        });
    }

    engine.schedule(&event.subject_id, [scope]);
}

/// Schedule a full pass for every subject not computed within the refresh
/// interval. Returns how many were scheduled.
async fn refresh_aged(engine: &Arc<Engine>) -> Result<usize> {
    let interval = i64::try_from(engine.config.refresh_interval_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(interval)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let due = engine.snapshots.computed_before(cutoff).await?;
    for subject_id in &due {
        let scopes = engine.all_scopes(subject_id).await?;
        engine.schedule(subject_id, scopes);
    }
    Ok(due.len())
}

/// Re-read accepted observations after `cursor` from the log itself.
async fn catch_up(
    engine: &Arc<Engine>,
    mut cursor: i64,
    pattern_dirty: &mut HashSet<String>,
) -> Result<i64> {
    loop {
        let page = engine
            .observations
            .accepted_after(cursor, CATCH_UP_BATCH)
            .await?;
        let Some(last) = page.last() else {
            return Ok(cursor);
        };
        cursor = last.seq;
        for event in &page {
            handle_accepted(engine, event, pattern_dirty);
        }
    }
}

// ---------------------------------------------------------------------------
// Rebuild
// ---------------------------------------------------------------------------

impl Engine {
    /// Every scope a subject has, for a full pass.
    pub(crate) async fn all_scopes(&self, subject_id: &str) -> Result<Vec<Scope>> {
        let mut scopes = vec![Scope::Behavior, Scope::QualityOfLife, Scope::Patterns];
        for definition in self.plans.list_definitions(subject_id).await? {
            scopes.push(match definition {
                Definition::Routine(routine) => Scope::Routine(routine.id),
                Definition::Skill(goal) | Definition::Objective(goal) => Scope::Goal(goal.id),
            });
        }
        Ok(scopes)
    }

    /// Drop and recompute every derived row for a subject from the log, and
    /// wait for it to finish.
    pub async fn rebuild_subject(self: &Arc<Self>, subject_id: &str) -> Result<()> {
        self.plans.require_subject(subject_id).await?;
        let mut scopes = self.all_scopes(subject_id).await?;
        scopes.push(Scope::Clear(None));

        tracing::info!(subject_id, "rebuilding subject");
        self.schedule_and_wait(subject_id, scopes).await
    }

    /// Rebuild a single definition's derived rows. Returns its subject id.
    pub async fn rebuild_definition(self: &Arc<Self>, definition_id: &str) -> Result<String> {
        let definition = self
            .plans
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("definition {definition_id}")))?;
        let subject_id = definition.subject_id().to_string();
        let scope = match &definition {
            Definition::Routine(_) => Scope::Routine(definition_id.to_string()),
            _ => Scope::Goal(definition_id.to_string()),
        };

        tracing::info!(subject_id, definition_id, "rebuilding definition");
        self.schedule_and_wait(
            &subject_id,
            [Scope::Clear(Some(definition_id.to_string())), scope],
        )
        .await?;
        Ok(subject_id)
    }

    // -----------------------------------------------------------------------
    // One pass
    // -----------------------------------------------------------------------

    /// Recompute the given scopes, then re-evaluate insights. Every output is
    /// a pure function of the log up to `as_of`, so rerunning is safe.
    pub(crate) async fn recompute(&self, subject_id: &str, scopes: &BTreeSet<Scope>) -> Result<()> {
        let as_of = db::now();
        let subject = self.plans.require_subject(subject_id).await?;
        let superseded = self.observations.superseded_ids(subject_id, as_of).await?;

        for scope in scopes {
            match scope {
                Scope::Clear(definition_id) => {
                    self.snapshots
                        .clear(subject_id, definition_id.as_deref())
                        .await?;
                    self.milestones
                        .clear(subject_id, definition_id.as_deref())
                        .await?;
                    if definition_id.is_none() {
                        self.patterns.clear(subject_id).await?;
                    }
                }
                Scope::Routine(routine_id) => {
                    self.recompute_routine(&subject, routine_id, &superseded, as_of)
                        .await?;
                }
                Scope::Goal(goal_id) => {
                    self.recompute_goal(&subject, goal_id, &superseded, as_of)
                        .await?;
                }
                Scope::Behavior => {
                    let trailing =
                        Window::trailing(subject.tz(), as_of, self.config.trailing_window_days);
                    let since = trailing.preceding(subject.tz(), self.config.prior_window_days);
                    let observations = self
                        .observations
                        .list_between(subject_id, Some(Domain::Behavior), Some(since.start), Some(as_of))
                        .await?;
                    let observations = without_superseded(observations, &superseded);
                    let snapshots = metrics::behavior_snapshots(
                        subject_id,
                        &observations,
                        subject.tz(),
                        as_of,
                        &self.config,
                    );
                    self.snapshots
                        .replace_scope(subject_id, Domain::Behavior, None, &snapshots)
                        .await?;
                }
                Scope::QualityOfLife => {
                    let window = Window::trailing(
                        subject.tz(),
                        as_of,
                        self.config.quality_of_life_window_days,
                    );
                    let observations = self
                        .observations
                        .list_between(
                            subject_id,
                            Some(Domain::QualityOfLife),
                            Some(window.start),
                            Some(as_of),
                        )
                        .await?;
                    let observations = without_superseded(observations, &superseded);
                    let snapshots = metrics::quality_of_life_snapshots(
                        subject_id,
                        &observations,
                        subject.tz(),
                        as_of,
                        &self.config,
                    );
                    self.snapshots
                        .replace_scope(subject_id, Domain::QualityOfLife, None, &snapshots)
                        .await?;
                }
                Scope::Patterns => {
                    self.recompute_patterns(&subject, &superseded, as_of).await?;
                }
            }
        }

        let summary = self.evaluate_insights(&subject, as_of).await?;
        self.snapshots.mark_computed(subject_id, as_of).await?;

        tracing::debug!(
            subject_id,
            scopes = scopes.len(),
            insights_created = summary.created,
            insights_superseded = summary.superseded,
            "recompute pass finished"
        );
        Ok(())
    }

    async fn recompute_routine(
        &self,
        subject: &Subject,
        routine_id: &str,
        superseded: &HashSet<String>,
        as_of: DateTime<Utc>,
    ) -> Result<()> {
        let Some(Definition::Routine(routine)) = self.plans.get_definition(routine_id).await?
        else {
            // Definition gone or not a routine: nothing derived may remain.
            return self
                .snapshots
                .replace_scope(&subject.id, Domain::Routine, Some(routine_id), &[])
                .await;
        };

        let window = Window::trailing(subject.tz(), as_of, self.config.trailing_window_days);
        let observations = self
            .observations
            .list_between(&subject.id, Some(Domain::Routine), Some(window.start), Some(as_of))
            .await?;
        let observations = without_superseded(observations, superseded);
        let snapshots =
            metrics::routine_snapshots(&routine, &observations, subject.tz(), as_of, &self.config);
        self.snapshots
            .replace_scope(&subject.id, Domain::Routine, Some(routine_id), &snapshots)
            .await
    }

    async fn recompute_goal(
        &self,
        subject: &Subject,
        goal_id: &str,
        superseded: &HashSet<String>,
        as_of: DateTime<Utc>,
    ) -> Result<()> {
        let Some(goal) = self
            .plans
            .get_definition(goal_id)
            .await?
            .and_then(|definition| definition.as_goal().cloned())
        else {
            return self
                .snapshots
                .replace_scope(&subject.id, Domain::Skill, Some(goal_id), &[])
                .await;
        };

        let observations = self
            .observations
            .for_definition(&subject.id, goal_id, as_of)
            .await?;
        let observations = without_superseded(observations, superseded);

        let progress = milestones::replay(&goal, &observations);
        for rejected in &progress.rejected {
            tracing::warn!(
                subject_id = %subject.id,
                goal_id,
                observation_id = %rejected.observation_id,
                milestone_id = %rejected.milestone_id,
                "evidence ignored: milestone level not reached"
            );
        }
        self.milestones.save(&subject.id, &progress, as_of).await?;

        let snapshots = metrics::goal_snapshots(
            &goal,
            &observations,
            progress.achieved_count(),
            as_of,
            &self.config,
        );
        self.snapshots
            .replace_scope(&subject.id, Domain::Skill, Some(goal_id), &snapshots)
            .await
    }

    async fn recompute_patterns(
        &self,
        subject: &Subject,
        superseded: &HashSet<String>,
        as_of: DateTime<Utc>,
    ) -> Result<()> {
        let Some(longest) = self.config.pattern_windows_days.iter().copied().max() else {
            return Ok(());
        };
        let routines = self.plans.routines(&subject.id).await?;
        let window = Window::trailing(subject.tz(), as_of, longest);
        let observations = self
            .observations
            .list_between(&subject.id, None, Some(window.start), Some(as_of))
            .await?;
        let observations = without_superseded(observations, superseded);

        for &window_days in &self.config.pattern_windows_days {
            let report = patterns::build_report(
                &subject.id,
                window_days,
                &observations,
                &routines,
                subject.tz(),
                as_of,
                &self.config,
            );
            self.patterns.save(&report).await?;
        }
        Ok(())
    }

    async fn evaluate_insights(
        &self,
        subject: &Subject,
        as_of: DateTime<Utc>,
    ) -> Result<insights::CycleSummary> {
        let snapshots = self.snapshots.list(&subject.id, None, None).await?;
        let routines = self.plans.routines(&subject.id).await?;
        let patterns = self
            .patterns
            .load(&subject.id, self.config.default_pattern_window())
            .await?;

        let mut goals = Vec::new();
        for goal in self.plans.goals(&subject.id).await? {
            let Some(state) = self.milestones.load(&subject.id, &goal.id).await? else {
                continue;
            };
            let progress = GoalProgress {
                goal_id: state.goal_id,
                level: state.level,
                target_level: state.target_level,
                target_reached: state.target_reached,
                milestones: state.milestones,
                rejected: Vec::new(),
            };
            goals.push((goal, progress));
        }

        let inputs = InsightInputs {
            subject_id: &subject.id,
            tz: subject.tz(),
            as_of,
            snapshots: &snapshots,
            routines: &routines,
            goals: &goals,
            patterns: patterns.as_ref(),
            config: &self.config,
        };
        let results = insights::evaluate(&inputs);
        self.insights
            .record_cycle(
                &subject.id,
                &results,
                as_of,
                Duration::hours(self.config.insights.ttl_hours),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{BEHAVIOR_RATIO, MetricValue, QUALITY_OF_LIFE_SCORE, ROUTINE_CONSISTENCY};
    use crate::config::EngineConfig;
    use crate::engine::testing::*;
    use crate::insights::InsightStatus;
    use crate::observation::{
        Environment, NewObservation, ObservationPayload, QualityDimension, QualityOfLifePayload,
        RoutinePayload, RoutineStatus,
    };
    use crate::plan::{DefinitionKind, Level};

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - Duration::days(days) - Duration::minutes(1)
    }

    #[tokio::test]
    async fn rebuild_materializes_behavior_metrics() {
        let (engine, _dir) = engine().await;
        for i in 0..4 {
            engine
                .ingest(behavior(&format!("k{i}"), days_ago(i), i % 2 == 0))
                .await
                .unwrap();
        }

        engine.rebuild_subject("s1").await.unwrap();
        let snapshots = engine
            .snapshots()
            .list("s1", Some(Domain::Behavior), None)
            .await
            .unwrap();
        let ratio = snapshots.iter().find(|s| s.metric == BEHAVIOR_RATIO).unwrap();
        assert_eq!(ratio.value, MetricValue::InsufficientData);

        engine.ingest(behavior("k4", days_ago(4), true)).await.unwrap();
        engine.rebuild_subject("s1").await.unwrap();
        let snapshots = engine
            .snapshots()
            .list("s1", Some(Domain::Behavior), None)
            .await
            .unwrap();
        let ratio = snapshots.iter().find(|s| s.metric == BEHAVIOR_RATIO).unwrap();
        assert_eq!(ratio.value, MetricValue::Value { value: 60.0 });
        assert_eq!(ratio.sample_size, 5);

        let state = engine.snapshots().recompute_state("s1").await.unwrap();
        assert!(state.last_computed_at.is_some());
    }

    #[tokio::test]
    async fn superseded_observations_drop_out_of_metrics() {
        let (engine, _dir) = engine().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = engine
                .ingest(behavior(&format!("k{i}"), days_ago(i + 1), false))
                .await
                .unwrap();
            ids.push(outcome.id().to_string());
        }
        let mut correction = behavior("fix", days_ago(0), true);
        correction.supersedes = Some(ids[0].clone());
        engine.ingest(correction).await.unwrap();

        engine.rebuild_subject("s1").await.unwrap();
        let snapshots = engine
            .snapshots()
            .list("s1", Some(Domain::Behavior), None)
            .await
            .unwrap();
        let ratio = snapshots.iter().find(|s| s.metric == BEHAVIOR_RATIO).unwrap();
        assert_eq!(ratio.value, MetricValue::Value { value: 20.0 });
        assert_eq!(ratio.sample_size, 5);
    }

    #[tokio::test]
    async fn rebuild_is_deterministic_for_routines_and_goals() {
        let (engine, _dir) = engine().await;
        let routine = engine.create_routine("s1", &daily_routine()).await.unwrap();
        let goal = engine
            .create_goal("s1", DefinitionKind::Objective, &objective())
            .await
            .unwrap();

        for day in 1..=3 {
            engine
                .ingest(NewObservation {
                    subject_id: "s1".into(),
                    environment: Some(Environment::Home),
                    reporter: reporter(),
                    observed_at: days_ago(day),
                    idempotency_key: format!("r{day}"),
                    supersedes: None,
                    payload: ObservationPayload::Routine(RoutinePayload {
                        routine_id: routine.id.clone(),
                        status: RoutineStatus::Completed,
                        notes: None,
                    }),
                })
                .await
                .unwrap();
        }
        engine
            .ingest(evidence("e1", &goal.id, "e1", days_ago(2)))
            .await
            .unwrap();

        engine.rebuild_definition(&goal.id).await.unwrap();
        let state = engine.milestones().load("s1", &goal.id).await.unwrap().unwrap();
        assert_eq!(state.level, Level::Developing);

        engine.rebuild_subject("s1").await.unwrap();
        let first: Vec<_> = engine
            .snapshots()
            .list("s1", None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.metric, s.definition_id, s.value, s.sample_size, s.first_seq, s.last_seq))
            .collect();
        engine.rebuild_subject("s1").await.unwrap();
        let second: Vec<_> = engine
            .snapshots()
            .list("s1", None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.metric, s.definition_id, s.value, s.sample_size, s.first_seq, s.last_seq))
            .collect();
        assert_eq!(first, second);

        let consistency = first
            .iter()
            .find(|(metric, ..)| metric == ROUTINE_CONSISTENCY)
            .unwrap();
        assert_eq!(consistency.2, MetricValue::Value { value: 10.0 });
    }

    #[tokio::test]
    async fn insights_are_generated_at_the_end_of_a_pass() {
        let (engine, _dir) = engine().await;
        let routine = engine.create_routine("s1", &daily_routine()).await.unwrap();
        engine.rebuild_subject("s1").await.unwrap();

        let active = engine
            .insights()
            .list("s1", None, InsightStatus::Active, Utc::now())
            .await
            .unwrap();
        let slipping = active.iter().find(|i| i.rule_id == "routine_slipping").unwrap();
        assert!(slipping.references[0].ends_with(&routine.id));

        // A second identical pass keeps the same insight rather than adding one.
        engine.rebuild_subject("s1").await.unwrap();
        let history = engine
            .insights()
            .list("s1", None, InsightStatus::All, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            history.iter().filter(|i| i.rule_id == "routine_slipping").count(),
            1
        );
    }

    #[tokio::test]
    async fn loop_recomputes_after_ingestion() {
        let (engine, _dir) = engine().await;
        let handle = spawn_recompute_loop(Arc::clone(&engine));
        // Let the loop subscribe before ingesting.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        engine.ingest(behavior("k1", days_ago(1), true)).await.unwrap();

        let mut computed = false;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let state = engine.snapshots().recompute_state("s1").await.unwrap();
            if state.last_computed_at.is_some() && engine.recomputes_in_flight() == 0 {
                computed = true;
                break;
            }
        }
        handle.abort();
        assert!(computed);
    }

    #[tokio::test]
    async fn future_dated_observations_are_picked_up_once_due() {
        let (engine, _dir) = engine().await;
        let handle = spawn_recompute_loop(Arc::clone(&engine));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        engine
            .ingest(NewObservation {
                subject_id: "s1".into(),
                environment: Some(Environment::Home),
                reporter: reporter(),
                observed_at: Utc::now() + Duration::seconds(1),
                idempotency_key: "q1".into(),
                supersedes: None,
                payload: ObservationPayload::QualityOfLife(QualityOfLifePayload {
                    dimension: QualityDimension::Mental,
                    rating: 7,
                    notes: None,
                }),
            })
            .await
            .unwrap();

        let mut samples = 0;
        for _ in 0..150 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let snapshots = engine
                .snapshots()
                .list("s1", Some(Domain::QualityOfLife), None)
                .await
                .unwrap();
            if let Some(score) = snapshots.iter().find(|s| s.metric == QUALITY_OF_LIFE_SCORE) {
                samples = score.sample_size;
                if samples > 0 {
                    break;
                }
            }
        }
        handle.abort();
        assert!(samples > 0);
    }

    #[tokio::test]
    async fn aged_subjects_are_refreshed_without_new_observations() {
        let (engine, _dir) = engine_with(EngineConfig {
            refresh_interval_secs: 1,
            ..EngineConfig::default()
        })
        .await;
        engine.create_routine("s1", &daily_routine()).await.unwrap();
        engine.rebuild_subject("s1").await.unwrap();
        let aged = Utc::now() - Duration::hours(2);
        engine.snapshots().mark_computed("s1", aged).await.unwrap();

        let handle = spawn_recompute_loop(Arc::clone(&engine));
        let mut refreshed = false;
        for _ in 0..150 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let state = engine.snapshots().recompute_state("s1").await.unwrap();
            if state.last_computed_at.is_some_and(|at| at > aged + Duration::hours(1)) {
                refreshed = true;
                break;
            }
        }
        handle.abort();
        assert!(refreshed);

        let active = engine
            .insights()
            .list("s1", None, InsightStatus::Active, Utc::now())
            .await
            .unwrap();
        assert!(active.iter().any(|i| i.rule_id == "routine_slipping"));
    }
}
