//! Cross-domain observation and care-coordination analytics engine.
//!
//! Observations about a supported individual flow into an append-only log;
//! metrics, behavior patterns, milestone progress and advisory insights are
//! derived from it in the background and served read-only over HTTP.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod engine;
pub mod error;
pub mod insights;
pub mod milestones;
pub mod observation;
pub mod patterns;
pub mod plan;

pub use error::{Error, Result};
