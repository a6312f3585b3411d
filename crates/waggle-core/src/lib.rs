//! waggle-core
//!
//! Shared types, the error taxonomy, and the concurrency primitives for the
//! Waggle position orchestration engine.
//!
//! # Main types
//!
//! - [`Position`] — a durable, addressable worker slot owning a task queue
//!   and routing rules.
//! - [`Task`] — a unit of routed work with payload, priority, and terminal
//!   status.
//! - [`Event`] — an immutable, append-only fact about the system.
//! - [`Semaphore`] — counting concurrency limiter with FIFO direct handoff.
//! - [`CancelToken`] — cancellation signal for in-flight executions.

/// Cancellation primitive for in-flight executions.
pub mod cancel;
/// Error taxonomy shared across the workspace.
pub mod error;
/// FIFO counting semaphore.
pub mod semaphore;
/// Domain types (positions, tasks, routes, events, templates).
pub mod types;

pub use cancel::CancelToken;
pub use error::{WaggleError, WaggleResult};
pub use semaphore::{Permit, Semaphore};
pub use types::{
    event_types, route_pattern_matches, Event, EventFilter, OutputRoute, Position,
    PositionStatus, RoleTemplate, Task, TaskPriority, TaskSpec, TaskStatus,
};
