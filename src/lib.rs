//! Batch prompt test execution and validation.
//!
//! A run pairs one prompt template with an ordered set of contexts. Every
//! context is sent to a completion backend under a shared concurrency limit,
//! each result lands in an append-only run log, and the responses can then be
//! graded by hand or by a judge model.

pub mod auth;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod inference;
pub mod judge;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod runner;
pub mod stats;
pub mod store;
pub mod validation;
pub mod ws;

pub use config::Config;
pub use context::ContextFormat;
pub use engine::{Engine, NewRun};
pub use error::{CallError, EngineError};
pub use model::{ContextSet, InferenceStatus, Item, Run, RunStatus, Validation, Verdict};
pub use registry::ProgressEvent;
pub use stats::StatsSnapshot;
