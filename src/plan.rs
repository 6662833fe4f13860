//! Subjects and their care-plan definitions (routines, skills, objectives).
//!
//! Definitions are mutable configuration edited only through explicit
//! operations; nothing here is inferred from observations.

mod store;
mod types;

pub use store::PlanStore;
pub(crate) use store::{build_milestones, validate_schedule};
pub use types::*;
