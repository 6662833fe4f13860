//! Observation records and their domain-specific payloads.

use crate::error::{Error, Result};
use crate::plan::Level;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Routine,
    Skill,
    Behavior,
    QualityOfLife,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Routine,
        Domain::Skill,
        Domain::Behavior,
        Domain::QualityOfLife,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Routine => "routine",
            Domain::Skill => "skill",
            Domain::Behavior => "behavior",
            Domain::QualityOfLife => "quality_of_life",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "routine" => Ok(Domain::Routine),
            "skill" => Ok(Domain::Skill),
            "behavior" => Ok(Domain::Behavior),
            "quality_of_life" => Ok(Domain::QualityOfLife),
            other => Err(format!(
                "invalid domain: '{other}', expected 'routine', 'skill', 'behavior', or 'quality_of_life'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Home,
    School,
    Community,
    Therapy,
}

impl Environment {
    pub const ALL: [Environment; 4] = [
        Environment::Home,
        Environment::School,
        Environment::Community,
        Environment::Therapy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Home => "home",
            Environment::School => "school",
            Environment::Community => "community",
            Environment::Therapy => "therapy",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "home" => Ok(Environment::Home),
            "school" => Ok(Environment::School),
            "community" => Ok(Environment::Community),
            "therapy" => Ok(Environment::Therapy),
            other => Err(format!("invalid environment: '{other}'")),
        }
    }
}

/// Role of whoever reported or requested something. Trusted as given; the
/// authentication layer decides who may act for which subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Teacher,
    Therapist,
    Caseworker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Teacher => "teacher",
            Role::Therapist => "therapist",
            Role::Caseworker => "caseworker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "parent" => Ok(Role::Parent),
            "teacher" => Ok(Role::Teacher),
            "therapist" => Ok(Role::Therapist),
            "caseworker" => Ok(Role::Caseworker),
            other => Err(format!(
                "invalid role: '{other}', expected 'parent', 'teacher', 'therapist', or 'caseworker'"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reporter {
    pub id: String,
    pub role: Role,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutinePayload {
    pub routine_id: String,
    pub status: RoutineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillPayload {
    /// A skill or objective definition id.
    pub skill_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
    /// Marks this observation as achievement evidence for a milestone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorPayload {
    pub behavior_type: String,
    pub positive: bool,
    pub intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub interventions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityDimension {
    Physical,
    Mental,
    Social,
    Independence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityOfLifePayload {
    pub dimension: QualityDimension,
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Domain-discriminated payload. The discriminant is the observation's
/// `domain`; the wire and storage forms keep the payload body separate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "domain", content = "payload", rename_all = "snake_case")]
pub enum ObservationPayload {
    Routine(RoutinePayload),
    Skill(SkillPayload),
    Behavior(BehaviorPayload),
    QualityOfLife(QualityOfLifePayload),
}

impl ObservationPayload {
    /// Discriminated schema check: parse `body` as the payload type `domain`
    /// demands. Shape errors come back as `InvalidPayload`.
    pub fn from_parts(domain: Domain, body: serde_json::Value) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(
            domain: Domain,
            body: serde_json::Value,
        ) -> Result<T> {
            serde_json::from_value(body)
                .map_err(|error| Error::invalid(format!("{domain} payload: {error}")))
        }

        Ok(match domain {
            Domain::Routine => Self::Routine(parse(domain, body)?),
            Domain::Skill => Self::Skill(parse(domain, body)?),
            Domain::Behavior => Self::Behavior(parse(domain, body)?),
            Domain::QualityOfLife => Self::QualityOfLife(parse(domain, body)?),
        })
    }

    pub fn domain(&self) -> Domain {
        match self {
            Self::Routine(_) => Domain::Routine,
            Self::Skill(_) => Domain::Skill,
            Self::Behavior(_) => Domain::Behavior,
            Self::QualityOfLife(_) => Domain::QualityOfLife,
        }
    }

    /// The definition this payload refers to, if any.
    pub fn definition_id(&self) -> Option<&str> {
        match self {
            Self::Routine(routine) => Some(&routine.routine_id),
            Self::Skill(skill) => Some(&skill.skill_id),
            Self::Behavior(_) | Self::QualityOfLife(_) => None,
        }
    }

    /// Payload body without the discriminant, as stored.
    pub fn body_json(&self) -> Result<String> {
        let json = match self {
            Self::Routine(payload) => serde_json::to_string(payload),
            Self::Skill(payload) => serde_json::to_string(payload),
            Self::Behavior(payload) => serde_json::to_string(payload),
            Self::QualityOfLife(payload) => serde_json::to_string(payload),
        };
        json.map_err(|error| Error::Other(error.into()))
    }

    /// Field-level checks that serde cannot express, plus tag normalisation.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        match self {
            Self::Routine(routine) => {
                require_non_empty("routine_id", &routine.routine_id)?;
            }
            Self::Skill(skill) => {
                require_non_empty("skill_id", &skill.skill_id)?;
                if skill.level.is_none() && skill.milestone_id.is_none() {
                    return Err(Error::invalid(
                        "skill payload needs a level, a milestone_id, or both",
                    ));
                }
                if let Some(milestone_id) = &skill.milestone_id {
                    require_non_empty("milestone_id", milestone_id)?;
                }
            }
            Self::Behavior(behavior) => {
                require_non_empty("behavior_type", &behavior.behavior_type)?;
                if !(1..=10).contains(&behavior.intensity) {
                    return Err(Error::invalid(format!(
                        "intensity must be between 1 and 10, got {}",
                        behavior.intensity
                    )));
                }
                behavior.triggers = normalize_tags(&behavior.triggers);
                behavior.interventions = normalize_tags(&behavior.interventions);
            }
            Self::QualityOfLife(quality) => {
                if !(1..=10).contains(&quality.rating) {
                    return Err(Error::invalid(format!(
                        "rating must be between 1 and 10, got {}",
                        quality.rating
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn as_behavior(&self) -> Option<&BehaviorPayload> {
        match self {
            Self::Behavior(behavior) => Some(behavior),
            _ => None,
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Trim, lowercase, drop empties and duplicates; keeps first-seen order.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tags.iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An observation as submitted, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub subject_id: String,
    pub environment: Option<Environment>,
    pub reporter: Reporter,
    pub observed_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub supersedes: Option<String>,
    pub payload: ObservationPayload,
}

impl NewObservation {
    pub fn domain(&self) -> Domain {
        self.payload.domain()
    }

    /// Shape validation that needs no storage lookups.
    pub fn validate(&mut self, now: DateTime<Utc>, max_future_skew_secs: i64) -> Result<()> {
        require_non_empty("subject_id", &self.subject_id)?;
        require_non_empty("idempotency_key", &self.idempotency_key)?;
        require_non_empty("reporter.id", &self.reporter.id)?;

        if self.observed_at > now + chrono::Duration::seconds(max_future_skew_secs) {
            return Err(Error::invalid(format!(
                "timestamp {} is in the future",
                self.observed_at.to_rfc3339()
            )));
        }
        if self.domain() == Domain::Behavior && self.environment.is_none() {
            return Err(Error::invalid("behavior observations must carry an environment"));
        }
        if let Some(supersedes) = &self.supersedes {
            require_non_empty("supersedes", supersedes)?;
        }

        self.payload.validate_and_normalize()
    }
}

/// An accepted, immutable observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub id: String,
    /// Store-assigned, strictly increasing. Breaks timestamp ties.
    pub seq: i64,
    pub subject_id: String,
    pub environment: Option<Environment>,
    pub reporter: Reporter,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub supersedes: Option<String>,
    #[serde(flatten)]
    pub payload: ObservationPayload,
}

impl Observation {
    pub fn domain(&self) -> Domain {
        self.payload.domain()
    }
}

/// Result of an append. A duplicate is a successful, idempotent outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AppendOutcome {
    Accepted { id: String, seq: i64 },
    Duplicate { prior_id: String },
}

impl AppendOutcome {
    pub fn id(&self) -> &str {
        match self {
            AppendOutcome::Accepted { id, .. } => id,
            AppendOutcome::Duplicate { prior_id } => prior_id,
        }
    }
}

/// Published after an observation is durably stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationAccepted {
    pub observation_id: String,
    pub seq: i64,
    pub subject_id: String,
    pub domain: Domain,
    pub definition_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}
