//! HTTP façade: the write path into the engine and read-only views over
//! materialized results.

mod admin;
mod definitions;
mod error;
mod observations;
mod query;
mod server;
mod state;

pub use server::{router, serve};
pub use state::{ApiState, Caller};
