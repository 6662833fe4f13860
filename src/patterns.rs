//! Pattern and trigger analysis over behavior and routine observations.
//!
//! Reports are computed in batches (see the engine's pattern interval) and
//! materialized per configured window, because this is the most expensive
//! pass over the log.

mod store;
pub mod time_buckets;
pub mod triggers;

pub use store::PatternStore;
pub use time_buckets::{BucketStat, TimeBuckets};
pub use triggers::{InterventionStat, TriggerAnalysis, TriggerStat};

use crate::aggregate::Window;
use crate::config::EngineConfig;
use crate::observation::{Domain, Observation};
use crate::plan::RoutineDefinition;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    pub subject_id: String,
    pub window_days: u32,
    pub computed_at: DateTime<Utc>,
    /// Behavior and routine observations inside the window.
    pub sample_size: u32,
    pub overall_positive_rate: Option<f64>,
    pub best_times: Vec<BucketStat>,
    pub challenging_times: Vec<BucketStat>,
    pub triggers: Vec<TriggerStat>,
    pub trigger_counts: BTreeMap<String, u32>,
    pub interventions: Vec<InterventionStat>,
}

/// Build the report for one window. `observations` must already exclude
/// superseded rows; anything outside the window or not behavior/routine is
/// ignored.
pub fn build_report(
    subject_id: &str,
    window_days: u32,
    observations: &[Observation],
    routines: &[RoutineDefinition],
    tz: Tz,
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> PatternReport {
    let window = Window::trailing(tz, as_of, window_days);
    let in_window: Vec<Observation> = observations
        .iter()
        .filter(|observation| window.contains(observation.observed_at))
        .filter(|observation| matches!(observation.domain(), Domain::Behavior | Domain::Routine))
        .cloned()
        .collect();

    let buckets = time_buckets::analyze(
        &in_window,
        routines,
        tz,
        config.bucket_minutes,
        config.min_bucket_samples,
        config.top_buckets,
    );
    let triggers = triggers::analyze(&in_window, config.min_trigger_occurrences);

    PatternReport {
        subject_id: subject_id.to_string(),
        window_days,
        computed_at: as_of,
        sample_size: u32::try_from(in_window.len()).unwrap_or(u32::MAX),
        overall_positive_rate: buckets.overall_rate,
        best_times: buckets.best,
        challenging_times: buckets.challenging,
        triggers: triggers.ranked,
        trigger_counts: triggers.counts,
        interventions: triggers.interventions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::metrics::testing::behavior;

    use chrono::{Duration, TimeZone as _};

    #[test]
    fn report_only_covers_its_window() {
        let as_of = Utc.with_ymd_and_hms(2026, 6, 30, 20, 0, 0).unwrap();
        let observations: Vec<Observation> = (0..10)
            .map(|i| {
                behavior(
                    i + 1,
                    as_of - Duration::days(i * 10),
                    i % 2 == 0,
                    5,
                    &["noise"],
                    &[],
                )
            })
            .collect();
        let config = EngineConfig::default();

        let short = build_report("s1", 30, &observations, &[], Tz::UTC, as_of, &config);
        let long = build_report("s1", 90, &observations, &[], Tz::UTC, as_of, &config);

        assert_eq!(short.sample_size, 3);
        assert_eq!(long.sample_size, 9);
        assert_eq!(long.trigger_counts.get("noise"), Some(&9));
        assert_eq!(
            build_report("s1", 90, &observations, &[], Tz::UTC, as_of, &config),
            long
        );
    }
}
