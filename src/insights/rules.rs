//! The rule catalogue.
//!
//! Each rule inspects already-materialized outputs and returns at most one
//! candidate per evaluation. Confidence formulas use integer arithmetic on
//! effect sizes quantized to the precision they are published at (tenths
//! for percentages and intensities, thousandths for rates), so a rerun over
//! the same inputs can never drift.

use crate::aggregate::metrics::scheduled_days;
use crate::aggregate::{
    BEHAVIOR_INTENSITY, BEHAVIOR_INTENSITY_PRIOR, BEHAVIOR_RATIO, BEHAVIOR_RATIO_PRIOR,
    MetricSnapshot, QUALITY_OF_LIFE_SCORE, ROUTINE_CONSISTENCY, Window,
};
use crate::config::EngineConfig;
use crate::insights::{InsightType, Priority};
use crate::milestones::GoalProgress;
use crate::patterns::PatternReport;
use crate::plan::{GoalDefinition, RoutineDefinition};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Everything a rule may look at for one subject.
#[derive(Debug, Clone, Copy)]
pub struct InsightInputs<'a> {
    pub subject_id: &'a str,
    pub tz: Tz,
    pub as_of: DateTime<Utc>,
    pub snapshots: &'a [MetricSnapshot],
    pub routines: &'a [RoutineDefinition],
    pub goals: &'a [(GoalDefinition, GoalProgress)],
    /// Report for the default pattern window, if one has been computed.
    pub patterns: Option<&'a PatternReport>,
    pub config: &'a EngineConfig,
}

impl InsightInputs<'_> {
    fn metric(&self, name: &str, definition_id: Option<&str>) -> Option<&MetricSnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.metric == name && s.definition_id.as_deref() == definition_id)
    }

    fn value(&self, name: &str) -> Option<(f64, u32)> {
        self.metric(name, None)
            .and_then(|s| s.value.value().map(|value| (value, s.sample_size)))
    }
}

/// What a rule wants to say this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub insight_type: InsightType,
    pub priority: Priority,
    pub confidence: u8,
    pub message: String,
    pub suggested_action: String,
    pub references: Vec<String>,
}

pub struct Rule {
    pub id: &'static str,
    pub insight_type: InsightType,
    pub evaluate: fn(&InsightInputs<'_>) -> Option<Candidate>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule").field("id", &self.id).finish()
    }
}

pub const RULES: &[Rule] = &[
    Rule {
        id: "behavior_improving",
        insight_type: InsightType::Quality,
        evaluate: behavior_improving,
    },
    Rule {
        id: "intensity_escalating",
        insight_type: InsightType::Risk,
        evaluate: intensity_escalating,
    },
    Rule {
        id: "routine_slipping",
        insight_type: InsightType::Efficiency,
        evaluate: routine_slipping,
    },
    Rule {
        id: "best_time_window",
        insight_type: InsightType::Efficiency,
        evaluate: best_time_window,
    },
    Rule {
        id: "effective_intervention",
        insight_type: InsightType::Resource,
        evaluate: effective_intervention,
    },
    Rule {
        id: "milestone_ready",
        insight_type: InsightType::Predictive,
        evaluate: milestone_ready,
    },
    Rule {
        id: "quality_of_life_low",
        insight_type: InsightType::Quality,
        evaluate: quality_of_life_low,
    },
];

/// Run the whole catalogue, in catalogue order.
pub fn evaluate(inputs: &InsightInputs<'_>) -> Vec<(&'static Rule, Option<Candidate>)> {
    RULES
        .iter()
        .map(|rule| (rule, (rule.evaluate)(inputs)))
        .collect()
}

fn tenths(value: f64) -> i64 {
    (value * 10.0).round() as i64
}

fn thousandths(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

fn cap(value: i64, max: i64) -> u8 {
    value.clamp(0, max.min(100)) as u8
}

fn behavior_improving(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let thresholds = &inputs.config.insights;
    let (now, samples) = inputs.value(BEHAVIOR_RATIO)?;
    let (prior, _) = inputs.value(BEHAVIOR_RATIO_PRIOR)?;

    let gain_tenths = tenths(now) - tenths(prior);
    if samples < thresholds.improvement_min_samples
        || gain_tenths < tenths(thresholds.improvement_threshold_pp)
    {
        return None;
    }

    Some(Candidate {
        insight_type: InsightType::Quality,
        priority: Priority::Low,
        confidence: cap(60 + i64::from(samples), 95),
        message: format!(
            "Positive behavior rose from {prior:.1}% to {now:.1}% over the last {} days.",
            inputs.config.trailing_window_days
        ),
        suggested_action:
            "Keep the current strategies in place and share what is working with every setting."
                .into(),
        references: vec![
            format!("metric:{BEHAVIOR_RATIO}"),
            format!("metric:{BEHAVIOR_RATIO_PRIOR}"),
        ],
    })
}

fn intensity_escalating(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let thresholds = &inputs.config.insights;
    let (now, samples) = inputs.value(BEHAVIOR_INTENSITY)?;
    let (prior, _) = inputs.value(BEHAVIOR_INTENSITY_PRIOR)?;

    let delta_tenths = tenths(now) - tenths(prior);
    if samples < inputs.config.min_behavior_samples
        || delta_tenths < tenths(thresholds.intensity_trend_delta)
    {
        return None;
    }

    let has_effective_intervention = inputs.patterns.is_some_and(|report| {
        report
            .triggers
            .iter()
            .any(|trigger| is_effective(trigger.improved, trigger.with_intervention, inputs))
    });
    let priority = if !has_effective_intervention || now >= thresholds.safety_intensity {
        Priority::High
    } else {
        Priority::Medium
    };

    let mut references = vec![
        format!("metric:{BEHAVIOR_INTENSITY}"),
        format!("metric:{BEHAVIOR_INTENSITY_PRIOR}"),
    ];
    if let Some(report) = inputs.patterns {
        references.push(format!("patterns:{}d", report.window_days));
    }

    Some(Candidate {
        insight_type: InsightType::Risk,
        priority,
        confidence: cap(50 + i64::from(samples) + 5 * delta_tenths / 10, 90),
        message: format!("Average behavior intensity rose from {prior:.1} to {now:.1} (1–10 scale)."),
        suggested_action: if has_effective_intervention {
            "Review the triggers driving the increase and apply the interventions that have worked."
                .into()
        } else {
            "Schedule a team review of the behavior plan; no current intervention is reducing intensity."
                .into()
        },
        references,
    })
}

fn routine_slipping(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let threshold_tenths = tenths(inputs.config.insights.low_consistency_pct);
    let window = Window::trailing(inputs.tz, inputs.as_of, inputs.config.trailing_window_days);

    let (routine, value) = inputs
        .routines
        .iter()
        .filter_map(|routine| {
            let snapshot = inputs.metric(ROUTINE_CONSISTENCY, Some(routine.id.as_str()))?;
            snapshot.value.value().map(|value| (routine, value))
        })
        .filter(|(_, value)| tenths(*value) < threshold_tenths)
        .min_by(|(a, a_value), (b, b_value)| {
            a_value.total_cmp(b_value).then_with(|| a.id.cmp(&b.id))
        })?;

    let expected = scheduled_days(&routine.schedule, &window, inputs.tz).len() as i64;
    let gap_tenths = threshold_tenths - tenths(value);

    Some(Candidate {
        insight_type: InsightType::Efficiency,
        priority: Priority::Medium,
        confidence: cap(40 + expected + gap_tenths / 20, 90),
        message: format!(
            "'{}' was completed on schedule {value:.1}% of the time over the last {} days.",
            routine.name, inputs.config.trailing_window_days
        ),
        suggested_action: format!(
            "Check whether the schedule for '{}' still fits the day, or add a visual reminder.",
            routine.name
        ),
        references: vec![format!("metric:{ROUTINE_CONSISTENCY}:{}", routine.id)],
    })
}

fn best_time_window(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let report = inputs.patterns?;
    let best = report.best_times.first()?;
    let overall = report.overall_positive_rate?;

    let margin_milli = thousandths(best.positive_rate) - thousandths(overall);
    if margin_milli < thousandths(inputs.config.insights.best_time_margin) {
        return None;
    }

    Some(Candidate {
        insight_type: InsightType::Efficiency,
        priority: Priority::Medium,
        confidence: cap(40 + i64::from(best.samples) + 50 * margin_milli / 1000, 85),
        message: format!(
            "Outcomes are best between {} and {}: {:.0}% positive versus {:.0}% overall.",
            best.start.format("%H:%M"),
            best.end.format("%H:%M"),
            best.positive_rate * 100.0,
            overall * 100.0
        ),
        suggested_action: "Schedule demanding activities and new skill practice in this window."
            .into(),
        references: vec![format!("patterns:{}d", report.window_days)],
    })
}

fn is_effective(improved: u32, denominator: u32, inputs: &InsightInputs<'_>) -> bool {
    denominator >= inputs.config.min_trigger_occurrences.max(1)
        && i64::from(improved) * 1000
            >= thousandths(inputs.config.insights.effective_intervention_rate)
                * i64::from(denominator)
}

fn effective_intervention(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let report = inputs.patterns?;
    let trigger = report
        .triggers
        .iter()
        .filter(|trigger| is_effective(trigger.improved, trigger.with_intervention, inputs))
        .max_by(|a, b| {
            (u64::from(a.improved) * u64::from(b.with_intervention))
                .cmp(&(u64::from(b.improved) * u64::from(a.with_intervention)))
                .then(a.with_intervention.cmp(&b.with_intervention))
                .then_with(|| b.trigger.cmp(&a.trigger))
        })?;

    let denominator = i64::from(trigger.with_intervention);
    let rate_term = 20 * i64::from(trigger.improved) / denominator;
    Some(Candidate {
        insight_type: InsightType::Resource,
        priority: Priority::Medium,
        confidence: cap(50 + 5 * denominator + rate_term, 90),
        message: format!(
            "When '{}' comes up, the next episode was less intense {} of {} times after an intervention.",
            trigger.trigger, trigger.improved, trigger.with_intervention
        ),
        suggested_action: format!(
            "Share the interventions used for '{}' with every setting so they are applied consistently.",
            trigger.trigger
        ),
        references: vec![
            format!("patterns:{}d", report.window_days),
            format!("trigger:{}", trigger.trigger),
        ],
    })
}

fn milestone_ready(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let needed_milli = thousandths(inputs.config.insights.milestone_ready_fraction);

    let (goal, progress, achieved, total) = inputs
        .goals
        .iter()
        .filter(|(_, progress)| progress.level.next().is_some())
        .filter_map(|(goal, progress)| {
            let (achieved, total) = progress.current_level_counts();
            (total > 0 && achieved < total).then_some((goal, progress, achieved, total))
        })
        .filter(|(_, _, achieved, total)| (*achieved as i64) * 1000 >= needed_milli * (*total as i64))
        .max_by(|a, b| {
            (a.2 * b.3)
                .cmp(&(b.2 * a.3))
                .then_with(|| b.0.id.cmp(&a.0.id))
        })?;

    let achieved = achieved as i64;
    let total = total as i64;
    let next = progress.level.next()?;
    Some(Candidate {
        insight_type: InsightType::Predictive,
        priority: Priority::Low,
        confidence: cap(50 + 30 * achieved / total + achieved, 85),
        message: format!(
            "'{}' is close to {next}: {achieved} of {total} {} milestones achieved.",
            goal.name, progress.level
        ),
        suggested_action: format!(
            "Plan practice around the remaining {} milestone(s) for '{}'.",
            progress.level, goal.name
        ),
        references: vec![format!("goal:{}", goal.id)],
    })
}

fn quality_of_life_low(inputs: &InsightInputs<'_>) -> Option<Candidate> {
    let (score, dimensions) = inputs.value(QUALITY_OF_LIFE_SCORE)?;
    if tenths(score) >= tenths(inputs.config.insights.low_quality_of_life) {
        return None;
    }

    Some(Candidate {
        insight_type: InsightType::Quality,
        priority: Priority::Medium,
        confidence: cap(40 + 10 * i64::from(dimensions), 80),
        message: format!("Quality-of-life score is {score:.1} out of 10."),
        suggested_action:
            "Discuss the lowest-rated areas at the next care-team meeting.".into(),
        references: vec![format!("metric:{QUALITY_OF_LIFE_SCORE}")],
    })
}
