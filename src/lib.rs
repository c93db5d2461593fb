#[macro_use]
extern crate tracing;

mod conditions;
pub mod context;
pub mod engine;
pub mod probe_job;
pub mod readiness;
pub mod reconcile;
pub mod resources;
pub mod store;
