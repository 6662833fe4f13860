//! Milestone and goal tracking for skills and objectives.

mod store;
pub mod tracker;

pub use store::{GoalState, MilestoneStore};
pub use tracker::{GoalProgress, MilestoneState, check_evidence, replay};
