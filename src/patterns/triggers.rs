//! Trigger correlation and intervention effectiveness.

use crate::aggregate::round1;
use crate::observation::{BehaviorPayload, Observation};
use crate::patterns::time_buckets::rate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerStat {
    pub trigger: String,
    pub occurrences: u32,
    pub mean_intensity: f64,
    /// Occurrences with any intervention present.
    pub with_intervention: u32,
    /// Of those, occurrences whose next same-trigger occurrence was less intense.
    pub improved: u32,
    /// `improved / with_intervention`; `None` when no intervention was tried.
    pub effectiveness: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionStat {
    pub intervention: String,
    pub uses: u32,
    pub improved: u32,
    pub effectiveness: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerAnalysis {
    /// Triggers with enough occurrences, ranked.
    pub ranked: Vec<TriggerStat>,
    /// Raw occurrence count for every trigger, ranked or not.
    pub counts: BTreeMap<String, u32>,
    pub interventions: Vec<InterventionStat>,
}

fn effectiveness(improved: u32, denominator: u32) -> Option<f64> {
    (denominator > 0).then(|| rate(improved, denominator))
}

/// Analyze behavior observations. Non-behavior observations are ignored.
///
/// Ranked by mean intensity (descending), then occurrences, then most recent
/// occurrence, then tag.
pub fn analyze(observations: &[Observation], min_occurrences: u32) -> TriggerAnalysis {
    let mut behaviors: Vec<(&Observation, &BehaviorPayload)> = observations
        .iter()
        .filter_map(|observation| {
            observation
                .payload
                .as_behavior()
                .map(|behavior| (observation, behavior))
        })
        .collect();
    behaviors.sort_by_key(|(observation, _)| (observation.observed_at, observation.seq));

    // Per-trigger occurrence timeline, in order.
    let mut timelines: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, (_, behavior)) in behaviors.iter().enumerate() {
        for trigger in &behavior.triggers {
            timelines.entry(trigger.as_str()).or_default().push(index);
        }
    }

    let mut counts = BTreeMap::new();
    let mut ranked = Vec::new();
    for (trigger, timeline) in &timelines {
        let occurrences = u32::try_from(timeline.len()).unwrap_or(u32::MAX);
        counts.insert(trigger.to_string(), occurrences);
        if occurrences < min_occurrences {
            continue;
        }

        let intensity_sum: u32 = timeline
            .iter()
            .map(|&index| u32::from(behaviors[index].1.intensity))
            .sum();
        let mut with_intervention = 0;
        let mut improved = 0;
        for (position, &index) in timeline.iter().enumerate() {
            let current = behaviors[index].1;
            if current.interventions.is_empty() {
                continue;
            }
            with_intervention += 1;
            let next = timeline.get(position + 1).map(|&next| behaviors[next].1);
            if next.is_some_and(|next| next.intensity < current.intensity) {
                improved += 1;
            }
        }
        let last_seen = timeline
            .last()
            .map(|&index| behaviors[index].0.observed_at)
            .unwrap_or_default();

        ranked.push(TriggerStat {
            trigger: trigger.to_string(),
            occurrences,
            mean_intensity: round1(f64::from(intensity_sum) / f64::from(occurrences)),
            with_intervention,
            improved,
            effectiveness: effectiveness(improved, with_intervention),
            last_seen,
        });
    }

    ranked.sort_by(|a, b| {
        b.mean_intensity
            .total_cmp(&a.mean_intensity)
            .then(b.occurrences.cmp(&a.occurrences))
            .then(b.last_seen.cmp(&a.last_seen))
            .then_with(|| a.trigger.cmp(&b.trigger))
    });

    TriggerAnalysis {
        ranked,
        counts,
        interventions: interventions(&behaviors),
    }
}

/// For every use of an intervention on a triggered observation: did the next
/// observation sharing one of its triggers come in less intense?
fn interventions(behaviors: &[(&Observation, &BehaviorPayload)]) -> Vec<InterventionStat> {
    let mut tallies: BTreeMap<&str, (u32, u32)> = BTreeMap::new();

    for (index, (_, current)) in behaviors.iter().enumerate() {
        if current.triggers.is_empty() {
            continue;
        }
        let next = behaviors[index + 1..].iter().find(|(_, candidate)| {
            candidate
                .triggers
                .iter()
                .any(|trigger| current.triggers.contains(trigger))
        });
        let improved = next.is_some_and(|(_, next)| next.intensity < current.intensity);

        for intervention in &current.interventions {
            let tally = tallies.entry(intervention.as_str()).or_default();
            tally.0 += 1;
            tally.1 += u32::from(improved);
        }
    }

    tallies
        .into_iter()
        .map(|(intervention, (uses, improved))| InterventionStat {
            intervention: intervention.to_string(),
            uses,
            improved,
            effectiveness: effectiveness(improved, uses),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::metrics::testing::behavior;

    use chrono::{Duration, TimeZone as _};

    fn at(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + Duration::days(day)
    }

    const TRANSITION: &str = "transition-to-new-activity";

    #[test]
    fn effectiveness_counts_only_occurrences_with_an_intervention() {
        let observations = vec![
            behavior(1, at(0), false, 8, &[TRANSITION], &["visual-timer"]),
            behavior(2, at(1), false, 6, &[TRANSITION], &["visual-timer"]),
            behavior(3, at(2), false, 5, &[TRANSITION], &["first-then-board"]),
            behavior(4, at(3), false, 4, &[TRANSITION], &[]),
            behavior(5, at(4), false, 7, &[TRANSITION], &[]),
        ];

        let analysis = analyze(&observations, 3);
        let stat = &analysis.ranked[0];
        assert_eq!(stat.occurrences, 5);
        assert_eq!(stat.with_intervention, 3);
        assert_eq!(stat.improved, 3);
        assert_eq!(stat.effectiveness, Some(1.0));
        assert_eq!(stat.mean_intensity, 6.0);

        let timer = analysis
            .interventions
            .iter()
            .find(|i| i.intervention == "visual-timer")
            .unwrap();
        assert_eq!((timer.uses, timer.improved), (2, 2));
    }

    #[test]
    fn rare_triggers_stay_in_raw_counts_only() {
        let observations = vec![
            behavior(1, at(0), false, 9, &["noise", TRANSITION], &[]),
            behavior(2, at(1), false, 3, &[TRANSITION], &[]),
            behavior(3, at(2), false, 3, &[TRANSITION], &[]),
        ];

        let analysis = analyze(&observations, 3);
        assert_eq!(analysis.ranked.len(), 1);
        assert_eq!(analysis.ranked[0].trigger, TRANSITION);
        assert_eq!(analysis.ranked[0].effectiveness, None);
        assert_eq!(analysis.counts.get("noise"), Some(&1));
    }

    #[test]
    fn ties_on_intensity_prefer_more_occurrences_then_recency() {
        let observations = vec![
            behavior(1, at(0), false, 5, &["hunger"], &[]),
            behavior(2, at(1), false, 5, &["hunger"], &[]),
            behavior(3, at(2), false, 5, &["hunger"], &[]),
            behavior(4, at(3), false, 5, &["crowds", "hunger"], &[]),
            behavior(5, at(4), false, 5, &["crowds"], &[]),
            behavior(6, at(5), false, 5, &["crowds"], &[]),
            behavior(7, at(6), false, 5, &["noise"], &[]),
            behavior(8, at(7), false, 5, &["noise"], &[]),
            behavior(9, at(8), false, 5, &["noise"], &[]),
        ];

        let analysis = analyze(&observations, 3);
        let order: Vec<&str> = analysis.ranked.iter().map(|t| t.trigger.as_str()).collect();
        assert_eq!(order, vec!["hunger", "noise", "crowds"]);
    }
}
