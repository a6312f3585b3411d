//! waggle-orchestrator
//!
//! The scheduling core of Waggle: a pool of long-lived, independently
//! addressable positions consume typed tasks from per-position queues,
//! execute them through an opaque [`Executor`], and forward results to other
//! positions via pattern-matched output routes.
//!
//! # Main types
//!
//! - [`Orchestrator`] — the scheduler: event-driven dispatch, bounded
//!   concurrency, timeout cancellation, route forwarding.
//! - [`PositionManager`] — CRUD and task-queue operations over the store.
//! - [`Executor`] — the external collaborator that runs a task's logic.
//! - [`OrchestratorConfig`] — concurrency bound, timeout, data directory.

/// Runtime configuration.
pub mod config;
/// The scheduler.
pub mod engine;
/// The opaque execution boundary.
pub mod executor;
/// Position CRUD and task-queue operations.
pub mod manager;
/// Built-in role templates.
pub mod templates;

pub use config::OrchestratorConfig;
pub use engine::{Orchestrator, OrchestratorStatus, PositionSnapshot};
pub use executor::{ExecutionReport, Executor};
pub use manager::{PositionManager, RouteBehavior, RouteCondition, RouteTransform};
pub use templates::{default_templates, install_default_templates};
