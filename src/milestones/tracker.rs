//! Goal state machine, replayed from evidence observations.
//!
//! `emerging → developing → proficient → mastered`, terminal at mastered. A
//! goal leaves a level only when every milestone assigned to that level is
//! achieved. Replaying the same evidence always yields the same state.

use crate::error::{Error, Result};
use crate::observation::{Observation, ObservationPayload};
use crate::plan::{GoalDefinition, Level};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MilestoneState {
    pub id: String,
    pub description: String,
    pub level: Level,
    pub target_date: Option<NaiveDate>,
    pub achieved: bool,
    pub achieved_at: Option<DateTime<Utc>>,
    pub evidence_observation_id: Option<String>,
}

/// Evidence the replay refused because its milestone's level had not been
/// reached when it was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEvidence {
    pub observation_id: String,
    pub milestone_id: String,
    pub milestone_level: Level,
    pub goal_level: Level,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalProgress {
    pub goal_id: String,
    pub level: Level,
    pub target_level: Level,
    pub target_reached: bool,
    pub milestones: Vec<MilestoneState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEvidence>,
}

impl GoalProgress {
    pub fn achieved_count(&self) -> usize {
        self.milestones.iter().filter(|m| m.achieved).count()
    }

    /// Milestones assigned to the goal's current level: `(achieved, total)`.
    pub fn current_level_counts(&self) -> (usize, usize) {
        let at_level = self.milestones.iter().filter(|m| m.level == self.level);
        at_level.fold((0, 0), |(achieved, total), milestone| {
            (achieved + usize::from(milestone.achieved), total + 1)
        })
    }
}

/// Replay `observations` (already stripped of superseded rows) against the
/// goal definition. Only skill observations that reference this goal and
/// carry a `milestone_id` are evidence; the first evidence for a milestone
/// wins.
pub fn replay(goal: &GoalDefinition, observations: &[Observation]) -> GoalProgress {
    let mut milestones: Vec<MilestoneState> = goal
        .milestones
        .iter()
        .map(|spec| MilestoneState {
            id: spec.id.clone(),
            description: spec.description.clone(),
            level: spec.level,
            target_date: spec.target_date,
            achieved: false,
            achieved_at: None,
            evidence_observation_id: None,
        })
        .collect();

    let mut evidence: Vec<(&Observation, &str)> = observations
        .iter()
        .filter_map(|observation| match &observation.payload {
            ObservationPayload::Skill(payload) if payload.skill_id == goal.id => payload
                .milestone_id
                .as_deref()
                .map(|milestone_id| (observation, milestone_id)),
            _ => None,
        })
        .collect();
    evidence.sort_by_key(|(observation, _)| (observation.observed_at, observation.seq));

    let mut level = advance(Level::Emerging, &milestones);
    let mut rejected = Vec::new();

    for (observation, milestone_id) in evidence {
        let Some(milestone) = milestones.iter_mut().find(|m| m.id == milestone_id) else {
            continue;
        };
        if milestone.achieved {
            continue;
        }
        if milestone.level > level {
            rejected.push(RejectedEvidence {
                observation_id: observation.id.clone(),
                milestone_id: milestone.id.clone(),
                milestone_level: milestone.level,
                goal_level: level,
            });
            continue;
        }

        milestone.achieved = true;
        milestone.achieved_at = Some(observation.observed_at);
        milestone.evidence_observation_id = Some(observation.id.clone());
        level = advance(level, &milestones);
    }

    GoalProgress {
        goal_id: goal.id.clone(),
        level,
        target_level: goal.target_level,
        target_reached: level >= goal.target_level,
        milestones,
        rejected,
    }
}

/// Move up while every milestone of the current level is achieved. A goal
/// without milestones has nothing to evidence and stays where it is.
fn advance(mut level: Level, milestones: &[MilestoneState]) -> Level {
    if milestones.is_empty() {
        return level;
    }
    while let Some(next) = level.next() {
        let complete = milestones
            .iter()
            .filter(|m| m.level == level)
            .all(|m| m.achieved);
        if !complete {
            break;
        }
        level = next;
    }
    level
}

/// Ingestion-time check of one skill observation against a goal.
///
/// `history` is the goal's stored evidence without superseded rows;
/// `replaced` is the id of the row `candidate` corrects, if any. The
/// candidate is replayed at its own timestamp, so backdated evidence is
/// judged against the level the goal had at that moment. The result may not
/// lower the goal's level or un-achieve a milestone.
pub fn check_evidence(
    goal: &GoalDefinition,
    history: &[Observation],
    replaced: Option<&str>,
    candidate: &Observation,
) -> Result<()> {
    if let ObservationPayload::Skill(payload) = &candidate.payload {
        if let Some(milestone_id) = &payload.milestone_id {
            if payload.skill_id == goal.id && goal.milestone(milestone_id).is_none() {
                return Err(Error::invalid(format!(
                    "milestone '{milestone_id}' does not belong to goal '{}'",
                    goal.id
                )));
            }
        }
    }

    let before = replay(goal, history);
    let mut timeline: Vec<Observation> = history
        .iter()
        .filter(|observation| Some(observation.id.as_str()) != replaced)
        .cloned()
        .collect();
    timeline.push(candidate.clone());
    let after = replay(goal, &timeline);

    if let Some(rejected) = after
        .rejected
        .iter()
        .find(|rejected| rejected.observation_id == candidate.id)
    {
        return Err(Error::OutOfOrderEvidence {
            milestone_id: rejected.milestone_id.clone(),
            milestone_level: rejected.milestone_level,
            current_level: rejected.goal_level,
        });
    }

    let lost = before
        .milestones
        .iter()
        .zip(&after.milestones)
        .find(|(was, now)| was.achieved && !now.achieved);
    if after.level < before.level || lost.is_some() {
        let detail = match lost {
            Some((milestone, _)) => format!("milestone '{}' would lose its evidence", milestone.id),
            None => format!("level would drop from {} to {}", before.level, after.level),
        };
        return Err(Error::invalid(format!(
            "correction rejected for goal '{}': {detail}",
            goal.id
        )));
    }
    Ok(())
}
