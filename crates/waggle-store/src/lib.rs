//! waggle-store
//!
//! Durable persistence for the Waggle orchestration engine: position and
//! role-template records (one JSON document each), the append-only daily
//! event log, and the publish/subscribe event bus layered on top of it.
//!
//! # Main types
//!
//! - [`PositionStore`] / [`FilePositionStore`] — record persistence.
//! - [`EventLog`] — append-only daily JSONL segments with filtered replay.
//! - [`EventBus`] — durable pub/sub with exact-type and wildcard handlers.

/// Publish/subscribe bus over the durable log.
pub mod event_bus;
/// Append-only daily event segments.
pub mod event_log;
/// Position and template record persistence.
pub mod position_store;

pub use event_bus::{EventBus, HandlerId};
pub use event_log::EventLog;
pub use position_store::{validate_key, FilePositionStore, PositionStore};
