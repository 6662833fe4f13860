//! Rolling metrics derived from the observation log.
//!
//! Every function in [`metrics`] is pure over `(observations, definitions,
//! as_of)`, so recomputing the same inputs yields identical snapshots. The
//! [`SnapshotStore`] only persists what they return.

pub mod metrics;
mod snapshots;

pub use snapshots::{RecomputeState, SnapshotStore};

use crate::observation::Domain;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone as _, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const ROUTINE_CONSISTENCY: &str = "routine_consistency";
pub const SKILL_PROGRESS: &str = "skill_progress";
pub const BEHAVIOR_RATIO: &str = "behavior_ratio";
pub const BEHAVIOR_RATIO_PRIOR: &str = "behavior_ratio_prior";
pub const BEHAVIOR_INTENSITY: &str = "behavior_intensity";
pub const BEHAVIOR_INTENSITY_PRIOR: &str = "behavior_intensity_prior";
pub const QUALITY_OF_LIFE_SCORE: &str = "quality_of_life_score";

/// Per-environment behavior ratio, e.g. `behavior_ratio:school`.
pub fn environment_ratio_metric(environment: &str) -> String {
    format!("{BEHAVIOR_RATIO}:{environment}")
}

/// A metric either has a value or is explicitly below its sample threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricValue {
    #[serde(rename = "ok")]
    Value { value: f64 },
    InsufficientData,
}

impl MetricValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Value { value } => Some(*value),
            MetricValue::InsufficientData => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            MetricValue::Value { .. } => "ok",
            MetricValue::InsufficientData => "insufficient_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub subject_id: String,
    pub domain: Domain,
    /// `None` for subject-wide metrics.
    pub definition_id: Option<String>,
    pub metric: String,
    #[serde(flatten)]
    pub value: MetricValue,
    pub sample_size: u32,
    /// Contributing observation range, by store sequence.
    pub first_seq: Option<i64>,
    pub last_seq: Option<i64>,
    pub computed_at: DateTime<Utc>,
}

/// Half-open on neither side: `start <= t <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// The `days` local calendar days ending on `as_of`'s local day, cut off
    /// at `as_of` itself.
    pub fn trailing(tz: Tz, as_of: DateTime<Utc>, days: u32) -> Self {
        let today = as_of.with_timezone(&tz).date_naive();
        let first_day = today - Duration::days(i64::from(days.max(1)) - 1);
        Self {
            start: local_midnight(tz, first_day),
            end: as_of,
        }
    }

    /// The `days` local days immediately before this window, excluding its
    /// start instant.
    pub fn preceding(&self, tz: Tz, days: u32) -> Self {
        let first_local = self.start.with_timezone(&tz).date_naive();
        let start = local_midnight(tz, first_local - Duration::days(i64::from(days.max(1))));
        Self {
            start,
            end: self.start - Duration::milliseconds(1),
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Local calendar days covered, oldest first.
    pub fn local_days(&self, tz: Tz) -> Vec<NaiveDate> {
        let first = self.start.with_timezone(&tz).date_naive();
        let last = self.end.with_timezone(&tz).date_naive();
        first.iter_days().take_while(|day| *day <= last).collect()
    }
}

fn local_midnight(tz: Tz, day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the first representable instant
        // is within the hour after it.
        None => Utc.from_utc_datetime(&naive),
    }
}

/// One decimal place, the precision every percentage and score is published at.
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_window_spans_local_days() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let as_of = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        let window = Window::trailing(tz, as_of, 30);

        assert_eq!(window.local_days(tz).len(), 30);
        assert_eq!(
            window.start.with_timezone(&tz).date_naive(),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );

        let prior = window.preceding(tz, 30);
        assert_eq!(prior.local_days(tz).len(), 30);
        assert!(!prior.contains(window.start));
    }

    #[test]
    fn metric_value_serializes_status() {
        let value = serde_json::to_value(MetricValue::Value { value: 80.0 }).unwrap();
        assert_eq!(value["status"], "ok");
        let value = serde_json::to_value(MetricValue::InsufficientData).unwrap();
        assert_eq!(value["status"], "insufficient_data");
    }
}
