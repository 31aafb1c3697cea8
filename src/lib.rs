//! # handoff-rs
//!
//! Coordination core for autonomous workers handing work to one another.
//!
//! Provides a delegation coordinator (bounded attempts, exponential backoff,
//! validation, escalation), a TTL-bound per-task scratch cache, and a
//! versioned durable fact store with last-write-wins conflict resolution,
//! in memory or on Postgres, plus OpenTelemetry observability.

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod durable;
pub mod error;
pub mod escalation;
pub mod event;
pub mod model;
pub mod sweeper;
pub mod telemetry;
pub mod validation;
