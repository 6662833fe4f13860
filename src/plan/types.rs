//! Types for subjects and their care-plan definitions.

use chrono::{DateTime, Datelike as _, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// The supported individual. Root of all coordination data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub date_of_birth: Option<NaiveDate>,
    /// IANA zone name; defines "local time" for day windows and buckets.
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

impl Subject {
    /// Parsed timezone. Stored values are validated on write, so the UTC
    /// fallback only covers rows written by something else.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Whole years of age on `date`, if the date of birth is known.
    pub fn age_on(&self, date: NaiveDate) -> Option<u32> {
        let born = self.date_of_birth?;
        date.years_since(born)
    }
}

/// Ordered skill / goal levels. Also the milestone state machine's states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Emerging,
    Developing,
    Proficient,
    Mastered,
}

impl Level {
    pub const ALL: [Level; 4] = [
        Level::Emerging,
        Level::Developing,
        Level::Proficient,
        Level::Mastered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Emerging => "emerging",
            Level::Developing => "developing",
            Level::Proficient => "proficient",
            Level::Mastered => "mastered",
        }
    }

    /// Reported level mapped onto 0–100 for skill progress.
    pub fn score(&self) -> f64 {
        match self {
            Level::Emerging => 20.0,
            Level::Developing => 50.0,
            Level::Proficient => 80.0,
            Level::Mastered => 100.0,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Level::Emerging => 0,
            Level::Developing => 1,
            Level::Proficient => 2,
            Level::Mastered => 3,
        }
    }

    /// The following level, `None` at the terminal `Mastered`.
    pub fn next(&self) -> Option<Level> {
        Level::ALL.get(self.index() + 1).copied()
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "emerging" => Ok(Level::Emerging),
            "developing" => Ok(Level::Developing),
            "proficient" => Ok(Level::Proficient),
            "mastered" => Ok(Level::Mastered),
            other => Err(format!(
                "invalid level: '{other}', expected 'emerging', 'developing', 'proficient', or 'mastered'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Routine,
    Skill,
    Objective,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::Routine => "routine",
            DefinitionKind::Skill => "skill",
            DefinitionKind::Objective => "objective",
        }
    }
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DefinitionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "routine" => Ok(DefinitionKind::Routine),
            "skill" => Ok(DefinitionKind::Skill),
            "objective" => Ok(DefinitionKind::Objective),
            other => Err(format!("invalid definition kind: '{other}'")),
        }
    }
}

/// Which local days a routine is expected on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Daily,
    Weekdays,
    Weekly { days: Vec<Weekday> },
}

impl Schedule {
    pub fn is_scheduled(&self, day: NaiveDate) -> bool {
        match self {
            Schedule::Daily => true,
            Schedule::Weekdays => !matches!(day.weekday(), Weekday::Sat | Weekday::Sun),
            Schedule::Weekly { days } => days.contains(&day.weekday()),
        }
    }
}

/// Local time-of-day window. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineDefinition {
    pub id: String,
    pub subject_id: String,
    pub name: String,
    pub category: String,
    pub schedule: Schedule,
    pub window: Option<TimeWindow>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One ordered step toward a goal, assigned to the level it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub id: String,
    pub description: String,
    pub level: Level,
    pub target_date: Option<NaiveDate>,
}

/// A skill or an objective: both carry a target level and ordered milestones
/// and are tracked by the same state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalDefinition {
    pub id: String,
    pub subject_id: String,
    pub kind: DefinitionKind,
    pub name: String,
    pub category: String,
    pub target_level: Level,
    /// Objectives may name the skill they build on.
    pub skill_id: Option<String>,
    pub milestones: Vec<MilestoneSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GoalDefinition {
    pub fn milestone(&self, milestone_id: &str) -> Option<&MilestoneSpec> {
        self.milestones.iter().find(|m| m.id == milestone_id)
    }
}

/// Serialized untagged: goals carry their own `kind` field and routines are
/// recognisable by their `schedule`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Definition {
    Routine(RoutineDefinition),
    Skill(GoalDefinition),
    Objective(GoalDefinition),
}

impl Definition {
    pub fn id(&self) -> &str {
        match self {
            Definition::Routine(routine) => &routine.id,
            Definition::Skill(goal) | Definition::Objective(goal) => &goal.id,
        }
    }

    pub fn subject_id(&self) -> &str {
        match self {
            Definition::Routine(routine) => &routine.subject_id,
            Definition::Skill(goal) | Definition::Objective(goal) => &goal.subject_id,
        }
    }

    pub fn kind(&self) -> DefinitionKind {
        match self {
            Definition::Routine(_) => DefinitionKind::Routine,
            Definition::Skill(_) => DefinitionKind::Skill,
            Definition::Objective(_) => DefinitionKind::Objective,
        }
    }

    pub fn as_goal(&self) -> Option<&GoalDefinition> {
        match self {
            Definition::Routine(_) => None,
            Definition::Skill(goal) | Definition::Objective(goal) => Some(goal),
        }
    }
}

// ---------------------------------------------------------------------------
// Write-side inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubject {
    pub id: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRoutine {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub window: Option<TimeWindow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MilestoneInput {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub level: Level,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGoal {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_target_level")]
    pub target_level: Level,
    #[serde(default)]
    pub skill_id: Option<String>,
    #[serde(default)]
    pub milestones: Vec<MilestoneInput>,
}

/// Explicit edit of an existing definition. Absent fields are unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefinitionUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    #[serde(default)]
    pub target_level: Option<Level>,
    #[serde(default)]
    pub milestones: Option<Vec<MilestoneInput>>,
}

fn default_category() -> String {
    "general".into()
}

fn default_target_level() -> Level {
    Level::Mastered
}

/// Default target date for a milestone without one: younger subjects get a
/// longer horizon per level.
pub fn default_target_date(
    age_years: Option<u32>,
    attached_on: NaiveDate,
    level: Level,
) -> NaiveDate {
    let weeks_per_level: i64 = match age_years {
        Some(age) if age < 6 => 16,
        Some(age) if age < 12 => 12,
        Some(_) => 8,
        None => 12,
    };
    attached_on + Duration::weeks(weeks_per_level * (level.index() as i64 + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_and_terminal_at_mastered() {
        assert!(Level::Emerging < Level::Developing);
        assert!(Level::Proficient < Level::Mastered);
        assert_eq!(Level::Emerging.next(), Some(Level::Developing));
        assert_eq!(Level::Mastered.next(), None);
        assert_eq!("proficient".parse::<Level>().unwrap(), Level::Proficient);
        assert!("expert".parse::<Level>().is_err());
    }

    #[test]
    fn level_scores_follow_the_published_scale() {
        let scores: Vec<f64> = Level::ALL.iter().map(Level::score).collect();
        assert_eq!(scores, vec![20.0, 50.0, 80.0, 100.0]);
    }

    #[test]
    fn schedules_select_days() {
        let monday = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let saturday = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();

        assert!(Schedule::Daily.is_scheduled(saturday));
        assert!(Schedule::Weekdays.is_scheduled(monday));
        assert!(!Schedule::Weekdays.is_scheduled(saturday));

        let weekly = Schedule::Weekly {
            days: vec![Weekday::Sat],
        };
        assert!(weekly.is_scheduled(saturday));
        assert!(!weekly.is_scheduled(monday));
    }

    #[test]
    fn time_window_wraps_midnight() {
        let window = TimeWindow {
            start: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        };
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn schedule_serializes_with_kind_tag() {
        let json = serde_json::json!({"kind": "weekly", "days": ["Mon", "Wed"]});
        let schedule: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(
            schedule,
            Schedule::Weekly {
                days: vec![Weekday::Mon, Weekday::Wed]
            }
        );
    }

    #[test]
    fn younger_subjects_get_longer_default_horizons() {
        let attached = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let young = default_target_date(Some(4), attached, Level::Developing);
        let older = default_target_date(Some(14), attached, Level::Developing);
        assert_eq!(young, attached + Duration::weeks(32));
        assert_eq!(older, attached + Duration::weeks(16));
        assert!(young > older);
    }

    #[test]
    fn age_is_counted_in_whole_years() {
        let subject = Subject {
            id: "s1".into(),
            date_of_birth: NaiveDate::from_ymd_opt(2018, 6, 15),
            timezone: "UTC".into(),
            created_at: Utc::now(),
        };
        assert_eq!(
            subject.age_on(NaiveDate::from_ymd_opt(2026, 6, 14).unwrap()),
            Some(7)
        );
        assert_eq!(
            subject.age_on(NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()),
            Some(8)
        );
    }
}
