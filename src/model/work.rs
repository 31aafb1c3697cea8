//! Work items and the delegation lifecycle.
//!
//! A work item is a unit of delegated work. Its identity is chosen by the
//! requester; the coordinator tracks it end-to-end with a [`DelegationRecord`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::fact::FactRef;
use crate::model::validation::ValidationReport;
use crate::validation::Check;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Caller-assigned work item identifier. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub String);

impl WorkItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of an actor: a requester, a worker, or a durable-store writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of delegated work. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,

    /// Who asked for the work.
    pub requester_id: AgentId,

    /// Opaque to the coordinator; interpreted by the worker.
    pub payload: serde_json::Value,

    /// Automatic dispatches allowed before escalation.
    pub max_attempts: u32,

    /// Per-attempt deadline, measured from dispatch.
    pub timeout: Duration,

    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Submitted or waiting out a retry backoff; not yet with a worker.
    Pending,
    /// Handed to a worker, not yet acknowledged.
    Dispatched,
    /// Worker acknowledged; waiting for completion, failure or deadline.
    AwaitingSignal,
    /// Result produced; checks running.
    Validating,
    /// Result accepted. Terminal.
    Completed,
    /// Automatic progress halted until an operator resumes.
    Escalated,
    /// Cancelled by request. Terminal.
    Cancelled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        if to == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Pending, Escalated)        // nothing could be dispatched
                | (Dispatched, AwaitingSignal)
                | (Dispatched, Validating)    // completed without an explicit ack
                | (Dispatched, Pending)       // retry
                | (Dispatched, Escalated)
                | (AwaitingSignal, Validating)
                | (AwaitingSignal, Pending)
                | (AwaitingSignal, Escalated)
                | (Validating, Completed)
                | (Validating, Pending)       // revise after failed checks
                | (Validating, Escalated)
                | (Escalated, Dispatched) // operator resume
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Cancelled)
    }

    /// Terminal, or halted waiting for a human.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == State::Escalated
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Dispatched => "dispatched",
            State::AwaitingSignal => "awaiting_signal",
            State::Validating => "validating",
            State::Completed => "completed",
            State::Escalated => "escalated",
            State::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "dispatched" => Ok(State::Dispatched),
            "awaiting_signal" => Ok(State::AwaitingSignal),
            "validating" => Ok(State::Validating),
            "completed" => Ok(State::Completed),
            "escalated" => Ok(State::Escalated),
            "cancelled" => Ok(State::Cancelled),
            other => Err(Error::Other(format!("unknown state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Delegation Record
// ---------------------------------------------------------------------------

/// The coordinator's view of one work item's lifecycle.
///
/// Workers never mutate this; they emit signals that the coordinator applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub work_item_id: WorkItemId,
    pub state: State,

    /// Number of dispatches so far. Never decreases.
    pub attempt: u32,
    pub max_attempts: u32,

    /// Worker holding the current (or most recent) attempt.
    pub worker_id: Option<AgentId>,

    /// When the current attempt times out.
    pub deadline: Option<DateTime<Utc>>,

    /// When the next dispatch is due, while a backoff is pending.
    pub retry_at: Option<DateTime<Utc>>,

    pub last_update: DateTime<Utc>,

    /// Result pointer, set when a worker signals completion.
    pub result_ref: Option<FactRef>,

    pub last_failure: Option<String>,

    /// Reports from the most recent validation run. Sent back to the worker
    /// on a revision dispatch.
    pub feedback: Vec<ValidationReport>,

    pub escalations: u32,

    /// The scratch cache entry has been evicted and the removal observed.
    pub cache_released: bool,
}

impl DelegationRecord {
    pub fn new(work_item_id: WorkItemId, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            work_item_id,
            state: State::Pending,
            attempt: 0,
            max_attempts,
            worker_id: None,
            deadline: None,
            retry_at: None,
            last_update: now,
            result_ref: None,
            last_failure: None,
            feedback: Vec::new(),
            escalations: 0,
            cache_released: false,
        }
    }

    /// Move to `to`, validating the transition. Returns the previous state.
    pub fn transition(&mut self, to: State, now: DateTime<Utc>) -> Result<State> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        self.state = to;
        self.last_update = now;
        Ok(from)
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state,
            attempt: self.attempt,
            last_update: self.last_update,
        }
    }
}

/// Compact answer to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    pub attempt: u32,
    pub last_update: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting work. The coordinator's public entry point.
pub struct NewWorkItem {
    pub(crate) id: WorkItemId,
    pub(crate) requester_id: AgentId,
    pub(crate) payload: serde_json::Value,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) checks: Vec<Arc<dyn Check>>,
}

impl NewWorkItem {
    pub fn new(id: impl Into<WorkItemId>, requester: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            requester_id: requester.into(),
            payload: serde_json::Value::Null,
            max_attempts: None,
            timeout: None,
            checks: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a validation check. Checks run in the order they are added.
    pub fn check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn checks(mut self, checks: impl IntoIterator<Item = Arc<dyn Check>>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn id(&self) -> &WorkItemId {
        &self.id
    }
}
