//! Time-of-day bucketing of behavior and routine outcomes.

use crate::aggregate::metrics::is_on_schedule;
use crate::observation::{Observation, ObservationPayload};
use crate::plan::RoutineDefinition;

use chrono::{DateTime, NaiveTime, Timelike as _, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStat {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub samples: u32,
    pub positive: u32,
    pub positive_rate: f64,
    pub last_seen: DateTime<Utc>,
}

impl BucketStat {
    /// Exact rate comparison by cross-multiplication.
    fn cmp_rate(&self, other: &Self) -> Ordering {
        (u64::from(self.positive) * u64::from(other.samples))
            .cmp(&(u64::from(other.positive) * u64::from(self.samples)))
    }

    fn is_best(&self) -> bool {
        self.positive * 2 >= self.samples
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeBuckets {
    pub best: Vec<BucketStat>,
    pub challenging: Vec<BucketStat>,
    /// Positive rate over every classified observation in the window.
    pub overall_rate: Option<f64>,
    pub samples: u32,
}

/// Positive outcome of one observation, if it has one: behavior
/// `positive`, routine on-schedule. Routine observations for unknown
/// routines are ignored.
fn outcome(observation: &Observation, routines: &[RoutineDefinition], tz: Tz) -> Option<bool> {
    match &observation.payload {
        ObservationPayload::Behavior(behavior) => Some(behavior.positive),
        ObservationPayload::Routine(payload) => routines
            .iter()
            .find(|routine| routine.id == payload.routine_id)
            .map(|routine| is_on_schedule(routine, observation, tz)),
        _ => None,
    }
}

pub(crate) fn rate(positive: u32, samples: u32) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    (f64::from(positive) / f64::from(samples) * 1000.0).round() / 1000.0
}

/// Group observations into fixed local-time buckets and rank them.
///
/// Buckets with fewer than `min_samples` are not ranked. Ties on rate go to
/// the bucket with more samples, then the more recent one, then the earlier
/// bucket.
pub fn analyze(
    observations: &[Observation],
    routines: &[RoutineDefinition],
    tz: Tz,
    bucket_minutes: u32,
    min_samples: u32,
    top: usize,
) -> TimeBuckets {
    let bucket_minutes = bucket_minutes.clamp(1, 1440);
    let mut buckets: BTreeMap<u32, (u32, u32, DateTime<Utc>)> = BTreeMap::new();
    let mut total = 0u32;
    let mut total_positive = 0u32;

    for observation in observations {
        let Some(positive) = outcome(observation, routines, tz) else {
            continue;
        };
        let local = observation.observed_at.with_timezone(&tz);
        let index = (local.hour() * 60 + local.minute()) / bucket_minutes;

        let entry = buckets
            .entry(index)
            .or_insert((0, 0, observation.observed_at));
        entry.0 += 1;
        entry.1 += u32::from(positive);
        entry.2 = entry.2.max(observation.observed_at);

        total += 1;
        total_positive += u32::from(positive);
    }

    let (mut best, mut challenging): (Vec<BucketStat>, Vec<BucketStat>) = buckets
        .into_iter()
        .filter(|(_, (samples, ..))| *samples >= min_samples.max(1))
        .map(|(index, (samples, positive, last_seen))| BucketStat {
            start: minute_of_day(index * bucket_minutes),
            end: minute_of_day((index + 1) * bucket_minutes),
            samples,
            positive,
            positive_rate: rate(positive, samples),
            last_seen,
        })
        .partition(BucketStat::is_best);

    let tie_break = |a: &BucketStat, b: &BucketStat| {
        b.samples
            .cmp(&a.samples)
            .then(b.last_seen.cmp(&a.last_seen))
            .then(a.start.cmp(&b.start))
    };
    best.sort_by(|a, b| b.cmp_rate(a).then_with(|| tie_break(a, b)));
    challenging.sort_by(|a, b| a.cmp_rate(b).then_with(|| tie_break(a, b)));
    best.truncate(top);
    challenging.truncate(top);

    TimeBuckets {
        best,
        challenging,
        overall_rate: (total > 0).then(|| rate(total_positive, total)),
        samples: total,
    }
}

fn minute_of_day(minute: u32) -> NaiveTime {
    let minute = minute % 1440;
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0).unwrap_or(NaiveTime::MIN)
}
