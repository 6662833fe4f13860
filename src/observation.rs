//! Observation log: typed, immutable, reporter-attributed facts about a
//! subject. The ground truth every derived value is replayed from.
//!
//! Corrections never mutate a row. A correction is a new observation whose
//! `supersedes` names the row it replaces; derived computations drop every
//! superseded row.

mod store;
mod types;

pub use store::ObservationStore;
pub use types::*;

use std::collections::HashSet;

/// Drop observations named by a correction.
pub fn without_superseded(
    observations: Vec<Observation>,
    superseded: &HashSet<String>,
) -> Vec<Observation> {
    if superseded.is_empty() {
        return observations;
    }
    observations
        .into_iter()
        .filter(|observation| !superseded.contains(&observation.id))
        .collect()
}
