//! Rule-driven insights: a fixed catalogue of templates evaluated over
//! metric snapshots, pattern reports and goal state.
//!
//! Insights are advisory. Each carries a confidence that is a deterministic
//! integer function of sample size and effect size, so identical inputs
//! always produce identical insights.

pub mod rules;
mod store;

pub use rules::{Candidate, InsightInputs, RULES, Rule, evaluate};
pub use store::{CycleSummary, InsightStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Efficiency,
    Resource,
    Quality,
    Risk,
    Predictive,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Efficiency => "efficiency",
            InsightType::Resource => "resource",
            InsightType::Quality => "quality",
            InsightType::Risk => "risk",
            InsightType::Predictive => "predictive",
        }
    }
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "efficiency" => Ok(InsightType::Efficiency),
            "resource" => Ok(InsightType::Resource),
            "quality" => Ok(InsightType::Quality),
            "risk" => Ok(InsightType::Risk),
            "predictive" => Ok(InsightType::Predictive),
            other => Err(format!(
                "invalid insight type: '{other}', expected 'efficiency', 'resource', 'quality', 'risk', or 'predictive'"
            )),
        }
    }
}

/// Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("invalid priority: '{other}'")),
        }
    }
}

/// Whether a listing returns only live insights or the full history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    #[default]
    Active,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Insight {
    pub id: String,
    pub subject_id: String,
    pub rule_id: String,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub priority: Priority,
    /// 0–100.
    pub confidence: u8,
    pub message: String,
    pub suggested_action: String,
    pub references: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl Insight {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.superseded_at.is_none() && self.expires_at > now
    }
}

/// Priority desc, confidence desc, newest first, then id for stability.
pub fn rank(insights: &mut [Insight]) {
    insights.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.confidence.cmp(&a.confidence))
            .then(b.generated_at.cmp(&a.generated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}
