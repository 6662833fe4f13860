//! Metric formulas. Pure: inputs in, snapshots out.

use crate::aggregate::{
    BEHAVIOR_INTENSITY, BEHAVIOR_INTENSITY_PRIOR, BEHAVIOR_RATIO, BEHAVIOR_RATIO_PRIOR,
    MetricSnapshot, MetricValue, QUALITY_OF_LIFE_SCORE, ROUTINE_CONSISTENCY, SKILL_PROGRESS,
    Window, environment_ratio_metric, round1,
};
use crate::config::EngineConfig;
use crate::observation::{
    Domain, Environment, Observation, ObservationPayload, QualityDimension, RoutineStatus,
};
use crate::plan::{GoalDefinition, Level, RoutineDefinition, Schedule};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use std::collections::{BTreeMap, BTreeSet};

/// A metric value plus the evidence behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Computed {
    pub value: MetricValue,
    pub sample_size: u32,
    pub seq_range: Option<(i64, i64)>,
}

impl Computed {
    fn insufficient(sample_size: u32, seq_range: Option<(i64, i64)>) -> Self {
        Self {
            value: MetricValue::InsufficientData,
            sample_size,
            seq_range,
        }
    }
}

fn seq_range<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> Option<(i64, i64)> {
    observations
        .into_iter()
        .fold(None, |range, observation| match range {
            None => Some((observation.seq, observation.seq)),
            Some((low, high)) => Some((low.min(observation.seq), high.max(observation.seq))),
        })
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Scheduled local days of `schedule` inside `window`.
pub fn scheduled_days(schedule: &Schedule, window: &Window, tz: Tz) -> BTreeSet<NaiveDate> {
    window
        .local_days(tz)
        .into_iter()
        .filter(|day| schedule.is_scheduled(*day))
        .collect()
}

/// Whether a routine observation counts as on-schedule: completed, on a
/// scheduled local day, and inside the routine's time window when it has one.
pub fn is_on_schedule(routine: &RoutineDefinition, observation: &Observation, tz: Tz) -> bool {
    let ObservationPayload::Routine(payload) = &observation.payload else {
        return false;
    };
    if payload.routine_id != routine.id || payload.status != RoutineStatus::Completed {
        return false;
    }
    let local = observation.observed_at.with_timezone(&tz);
    routine.schedule.is_scheduled(local.date_naive())
        && routine
            .window
            .is_none_or(|window| window.contains(local.time()))
}

/// Distinct scheduled days with an on-schedule observation, over expected
/// scheduled days in the trailing window, capped at 100.
pub fn routine_consistency(
    routine: &RoutineDefinition,
    observations: &[Observation],
    tz: Tz,
    as_of: DateTime<Utc>,
    window_days: u32,
) -> Computed {
    let window = Window::trailing(tz, as_of, window_days);
    let expected = scheduled_days(&routine.schedule, &window, tz);

    let contributing: Vec<&Observation> = observations
        .iter()
        .filter(|observation| window.contains(observation.observed_at))
        .filter(|observation| {
            matches!(&observation.payload,
                ObservationPayload::Routine(payload) if payload.routine_id == routine.id)
        })
        .collect();

    let on_schedule_days: BTreeSet<NaiveDate> = contributing
        .iter()
        .filter(|observation| is_on_schedule(routine, observation, tz))
        .map(|observation| observation.observed_at.with_timezone(&tz).date_naive())
        .filter(|day| expected.contains(day))
        .collect();

    let sample_size = count(contributing.len());
    let range = seq_range(contributing.iter().copied());
    if expected.is_empty() {
        return Computed::insufficient(sample_size, range);
    }

    let pct = on_schedule_days.len() as f64 / expected.len() as f64 * 100.0;
    Computed {
        value: MetricValue::Value {
            value: round1(pct.min(100.0)),
        },
        sample_size,
        seq_range: range,
    }
}

/// Weighted blend of the latest reported level and the fraction of
/// milestones achieved. With no milestones the level carries full weight.
pub fn skill_progress(
    goal: &GoalDefinition,
    observations: &[Observation],
    achieved: usize,
    config: &EngineConfig,
) -> Computed {
    let contributing: Vec<&Observation> = observations
        .iter()
        .filter(|observation| {
            matches!(&observation.payload,
                ObservationPayload::Skill(payload) if payload.skill_id == goal.id)
        })
        .collect();

    let latest_level: Option<Level> = contributing
        .iter()
        .filter_map(|observation| match &observation.payload {
            ObservationPayload::Skill(payload) => payload
                .level
                .map(|level| ((observation.observed_at, observation.seq), level)),
            _ => None,
        })
        .max_by_key(|(order, _)| *order)
        .map(|(_, level)| level);

    let sample_size = count(contributing.len());
    let range = seq_range(contributing.iter().copied());
    let Some(level) = latest_level else {
        return Computed::insufficient(sample_size, range);
    };

    let total = goal.milestones.len();
    let value = if total == 0 {
        level.score()
    } else {
        let fraction = achieved.min(total) as f64 / total as f64 * 100.0;
        config.skill_level_weight * level.score() + config.skill_milestone_weight * fraction
    };

    Computed {
        value: MetricValue::Value {
            value: round1(value),
        },
        sample_size,
        seq_range: range,
    }
}

/// Positive rate and mean intensity over the given behavior observations.
/// Both are `InsufficientData` below `min_samples`.
pub fn behavior_stats<'a>(
    observations: impl IntoIterator<Item = &'a Observation>,
    min_samples: u32,
) -> (Computed, Computed) {
    let behaviors: Vec<(&Observation, bool, u8)> = observations
        .into_iter()
        .filter_map(|observation| {
            observation
                .payload
                .as_behavior()
                .map(|behavior| (observation, behavior.positive, behavior.intensity))
        })
        .collect();

    let sample_size = count(behaviors.len());
    let range = seq_range(behaviors.iter().map(|(observation, ..)| *observation));
    if sample_size < min_samples || behaviors.is_empty() {
        let insufficient = Computed::insufficient(sample_size, range);
        return (insufficient, insufficient);
    }

    let positive = behaviors.iter().filter(|(_, positive, _)| *positive).count();
    let intensity_sum: u32 = behaviors
        .iter()
        .map(|(_, _, intensity)| u32::from(*intensity))
        .sum();

    let ratio = Computed {
        value: MetricValue::Value {
            value: round1(positive as f64 / behaviors.len() as f64 * 100.0),
        },
        sample_size,
        seq_range: range,
    };
    let intensity = Computed {
        value: MetricValue::Value {
            value: round1(f64::from(intensity_sum) / behaviors.len() as f64),
        },
        sample_size,
        seq_range: range,
    };
    (ratio, intensity)
}

/// Mean of the latest rating per dimension inside the window, one decimal.
pub fn quality_of_life_score(observations: &[Observation], window: &Window) -> Computed {
    let mut latest: BTreeMap<QualityDimension, &Observation> = BTreeMap::new();
    for observation in observations
        .iter()
        .filter(|observation| window.contains(observation.observed_at))
    {
        let ObservationPayload::QualityOfLife(payload) = &observation.payload else {
            continue;
        };
        let newer = latest.get(&payload.dimension).is_none_or(|current| {
            (observation.observed_at, observation.seq) > (current.observed_at, current.seq)
        });
        if newer {
            latest.insert(payload.dimension, observation);
        }
    }

    let sample_size = count(latest.len());
    let range = seq_range(latest.values().copied());
    if latest.is_empty() {
        return Computed::insufficient(0, None);
    }

    let sum: u32 = latest
        .values()
        .filter_map(|observation| match &observation.payload {
            ObservationPayload::QualityOfLife(payload) => Some(u32::from(payload.rating)),
            _ => None,
        })
        .sum();
    Computed {
        value: MetricValue::Value {
            value: round1(f64::from(sum) / latest.len() as f64),
        },
        sample_size,
        seq_range: range,
    }
}

// ---------------------------------------------------------------------------
// Snapshot passes, one per recompute scope
// ---------------------------------------------------------------------------

fn snapshot(
    subject_id: &str,
    domain: Domain,
    definition_id: Option<&str>,
    metric: impl Into<String>,
    computed: Computed,
    as_of: DateTime<Utc>,
) -> MetricSnapshot {
    MetricSnapshot {
        subject_id: subject_id.to_string(),
        domain,
        definition_id: definition_id.map(str::to_string),
        metric: metric.into(),
        value: computed.value,
        sample_size: computed.sample_size,
        first_seq: computed.seq_range.map(|(low, _)| low),
        last_seq: computed.seq_range.map(|(_, high)| high),
        computed_at: as_of,
    }
}

pub fn routine_snapshots(
    routine: &RoutineDefinition,
    observations: &[Observation],
    tz: Tz,
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> Vec<MetricSnapshot> {
    let computed = routine_consistency(
        routine,
        observations,
        tz,
        as_of,
        config.trailing_window_days,
    );
    vec![snapshot(
        &routine.subject_id,
        Domain::Routine,
        Some(&routine.id),
        ROUTINE_CONSISTENCY,
        computed,
        as_of,
    )]
}

pub fn goal_snapshots(
    goal: &GoalDefinition,
    observations: &[Observation],
    achieved: usize,
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> Vec<MetricSnapshot> {
    let computed = skill_progress(goal, observations, achieved, config);
    vec![snapshot(
        &goal.subject_id,
        Domain::Skill,
        Some(&goal.id),
        SKILL_PROGRESS,
        computed,
        as_of,
    )]
}

/// Trailing and prior behavior ratio and intensity, plus the trailing ratio
/// per environment that appears in the window.
pub fn behavior_snapshots(
    subject_id: &str,
    observations: &[Observation],
    tz: Tz,
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> Vec<MetricSnapshot> {
    let trailing = Window::trailing(tz, as_of, config.trailing_window_days);
    let prior = trailing.preceding(tz, config.prior_window_days);
    let min = config.min_behavior_samples;

    let in_window = |window: Window| {
        observations
            .iter()
            .filter(move |observation| window.contains(observation.observed_at))
    };

    let (ratio, intensity) = behavior_stats(in_window(trailing), min);
    let (ratio_prior, intensity_prior) = behavior_stats(in_window(prior), min);

    let mut snapshots = vec![
        snapshot(subject_id, Domain::Behavior, None, BEHAVIOR_RATIO, ratio, as_of),
        snapshot(subject_id, Domain::Behavior, None, BEHAVIOR_RATIO_PRIOR, ratio_prior, as_of),
        snapshot(subject_id, Domain::Behavior, None, BEHAVIOR_INTENSITY, intensity, as_of),
        snapshot(
            subject_id,
            Domain::Behavior,
            None,
            BEHAVIOR_INTENSITY_PRIOR,
            intensity_prior,
            as_of,
        ),
    ];

    for environment in Environment::ALL {
        let matching: Vec<&Observation> = in_window(trailing)
            .filter(|observation| observation.environment == Some(environment))
            .collect();
        if matching.is_empty() {
            continue;
        }
        let (ratio, _) = behavior_stats(matching, min);
        snapshots.push(snapshot(
            subject_id,
            Domain::Behavior,
            None,
            environment_ratio_metric(environment.as_str()),
            ratio,
            as_of,
        ));
    }
    snapshots
}

pub fn quality_of_life_snapshots(
    subject_id: &str,
    observations: &[Observation],
    tz: Tz,
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> Vec<MetricSnapshot> {
    let window = Window::trailing(tz, as_of, config.quality_of_life_window_days);
    let computed = quality_of_life_score(observations, &window);
    vec![snapshot(
        subject_id,
        Domain::QualityOfLife,
        None,
        QUALITY_OF_LIFE_SCORE,
        computed,
        as_of,
    )]
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::observation::{
        BehaviorPayload, Environment, Observation, ObservationPayload, Reporter, Role,
    };

    use chrono::{DateTime, Utc};

    pub(crate) fn observation(
        seq: i64,
        at: DateTime<Utc>,
        environment: Option<Environment>,
        payload: ObservationPayload,
    ) -> Observation {
        Observation {
            id: format!("o{seq}"),
            seq,
            subject_id: "s1".into(),
            environment,
            reporter: Reporter {
                id: "r1".into(),
                role: Role::Teacher,
            },
            observed_at: at,
            recorded_at: at,
            idempotency_key: format!("k{seq}"),
            supersedes: None,
            payload,
        }
    }

    pub(crate) fn behavior(
        seq: i64,
        at: DateTime<Utc>,
        positive: bool,
        intensity: u8,
        triggers: &[&str],
        interventions: &[&str],
    ) -> Observation {
        observation(
            seq,
            at,
            Some(Environment::School),
            ObservationPayload::Behavior(BehaviorPayload {
                behavior_type: "transition".into(),
                positive,
                intensity,
                duration_minutes: None,
                triggers: triggers.iter().map(|tag| tag.to_string()).collect(),
                interventions: interventions.iter().map(|tag| tag.to_string()).collect(),
                notes: None,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{behavior, observation};
    use super::*;
    use crate::observation::{QualityOfLifePayload, RoutinePayload, SkillPayload};
    use crate::plan::{DefinitionKind, MilestoneSpec, TimeWindow};

    use chrono::{Duration, NaiveTime, TimeZone as _};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 31, 22, 0, 0).unwrap()
    }

    fn routine() -> RoutineDefinition {
        RoutineDefinition {
            id: "r1".into(),
            subject_id: "s1".into(),
            name: "Morning routine".into(),
            category: "daily_living".into(),
            schedule: Schedule::Daily,
            window: Some(TimeWindow {
                start: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            }),
            created_at: as_of() - Duration::days(60),
            updated_at: as_of() - Duration::days(60),
        }
    }

    fn completed(seq: i64, at: DateTime<Utc>) -> Observation {
        observation(
            seq,
            at,
            Some(Environment::Home),
            ObservationPayload::Routine(RoutinePayload {
                routine_id: "r1".into(),
                status: RoutineStatus::Completed,
                notes: None,
            }),
        )
    }

    #[test]
    fn daily_routine_with_24_of_30_days_is_80_percent() {
        let first_day = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let observations: Vec<Observation> = (0..24)
            .map(|day| completed(day + 1, first_day + Duration::days(day)))
            .collect();

        let computed = routine_consistency(&routine(), &observations, Tz::UTC, as_of(), 30);
        assert_eq!(computed.value, MetricValue::Value { value: 80.0 });
        assert_eq!(computed.sample_size, 24);
        assert_eq!(computed.seq_range, Some((1, 24)));
    }

    #[test]
    fn repeated_reports_and_off_window_completions_do_not_inflate() {
        let morning = Utc.with_ymd_and_hms(2026, 3, 30, 8, 0, 0).unwrap();
        let observations = vec![
            completed(1, morning),
            completed(2, morning + Duration::minutes(5)),
            completed(3, morning + Duration::hours(6)),
        ];

        let computed = routine_consistency(&routine(), &observations, Tz::UTC, as_of(), 30);
        // One on-schedule day out of 30.
        assert_eq!(computed.value, MetricValue::Value { value: 3.3 });
    }

    #[test]
    fn behavior_ratio_needs_five_samples() {
        let start = as_of() - Duration::days(3);
        let mut observations: Vec<Observation> = (0..4)
            .map(|i| behavior(i + 1, start + Duration::hours(i), i % 2 == 0, 4, &[], &[]))
            .collect();

        let (ratio, _) = behavior_stats(&observations, 5);
        assert_eq!(ratio.value, MetricValue::InsufficientData);
        assert_eq!(ratio.sample_size, 4);

        observations.push(behavior(5, start + Duration::hours(5), true, 4, &[], &[]));
        let (ratio, intensity) = behavior_stats(&observations, 5);
        assert_eq!(ratio.value, MetricValue::Value { value: 60.0 });
        assert_eq!(intensity.value, MetricValue::Value { value: 4.0 });
    }

    #[test]
    fn behavior_snapshots_are_deterministic() {
        let config = EngineConfig::default();
        let observations: Vec<Observation> = (0..12)
            .map(|i| {
                behavior(
                    i + 1,
                    as_of() - Duration::days(i * 4),
                    i % 3 != 0,
                    (i % 10 + 1) as u8,
                    &["noise"],
                    &[],
                )
            })
            .collect();

        let first = behavior_snapshots("s1", &observations, Tz::UTC, as_of(), &config);
        let second = behavior_snapshots("s1", &observations, Tz::UTC, as_of(), &config);
        assert_eq!(first, second);
        assert!(first.iter().any(|s| s.metric == "behavior_ratio:school"));
    }

    #[test]
    fn skill_progress_blends_level_and_milestones() {
        let goal = GoalDefinition {
            id: "g1".into(),
            subject_id: "s1".into(),
            kind: DefinitionKind::Skill,
            name: "Requesting help".into(),
            category: "communication".into(),
            target_level: Level::Mastered,
            skill_id: None,
            milestones: (0..4)
                .map(|i| MilestoneSpec {
                    id: format!("m{i}"),
                    description: format!("step {i}"),
                    level: Level::Emerging,
                    target_date: None,
                })
                .collect(),
            created_at: as_of(),
            updated_at: as_of(),
        };
        let skill = |seq: i64, level: Level| {
            observation(
                seq,
                as_of() - Duration::days(10 - seq),
                Some(Environment::Therapy),
                ObservationPayload::Skill(SkillPayload {
                    skill_id: "g1".into(),
                    level: Some(level),
                    milestone_id: None,
                    evidence: None,
                }),
            )
        };
        let observations = vec![skill(1, Level::Emerging), skill(2, Level::Developing)];

        let computed = skill_progress(&goal, &observations, 2, &EngineConfig::default());
        // 0.6 * 50 + 0.4 * 50
        assert_eq!(computed.value, MetricValue::Value { value: 50.0 });

        let computed = skill_progress(&goal, &[], 2, &EngineConfig::default());
        assert_eq!(computed.value, MetricValue::InsufficientData);
    }

    #[test]
    fn quality_of_life_uses_latest_rating_per_dimension() {
        let rating = |seq: i64, dimension: QualityDimension, rating: u8| {
            observation(
                seq,
                as_of() - Duration::days(20 - seq),
                Some(Environment::Home),
                ObservationPayload::QualityOfLife(QualityOfLifePayload {
                    dimension,
                    rating,
                    notes: None,
                }),
            )
        };
        let observations = vec![
            rating(1, QualityDimension::Social, 2),
            rating(2, QualityDimension::Social, 7),
            rating(3, QualityDimension::Physical, 8),
        ];

        let window = Window::trailing(Tz::UTC, as_of(), 90);
        let computed = quality_of_life_score(&observations, &window);
        assert_eq!(computed.value, MetricValue::Value { value: 7.5 });
        assert_eq!(computed.sample_size, 2);
        assert_eq!(computed.seq_range, Some((2, 3)));
    }
}
