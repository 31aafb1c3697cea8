//! Structured events emitted by the coordinator and the stores.
//!
//! Consumers subscribe to the stream to build dashboards, alerting or audit
//! logs. A worker's own progress goes into its scratch cache instead.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::model::{AgentId, State, WorkItemId, WriteOutcome};

/// A structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkSubmitted {
        id: WorkItemId,
        requester_id: AgentId,
        max_attempts: u32,
    },
    WorkDispatched {
        id: WorkItemId,
        worker_id: AgentId,
        attempt: u32,
    },
    WorkFailed {
        id: WorkItemId,
        attempt: u32,
        reason: String,
    },
    RetryScheduled {
        id: WorkItemId,
        next_attempt: u32,
        delay_ms: u64,
    },
    ValidationFinished {
        id: WorkItemId,
        attempt: u32,
        accepted: bool,
        failed_checks: Vec<String>,
    },
    WorkEscalated {
        id: WorkItemId,
        attempt: u32,
        reason: String,
    },
    WorkResumed {
        id: WorkItemId,
        attempt: u32,
    },
    WorkCompleted {
        id: WorkItemId,
        attempt: u32,
    },
    WorkCancelled {
        id: WorkItemId,
        reason: String,
    },
    StateTransition {
        id: WorkItemId,
        from: State,
        to: State,
    },
    CacheEntryRemoved {
        scope_key: String,
        reason: String,
    },
    FactWritten {
        key: String,
        version: u64,
        writer_id: AgentId,
        outcome: WriteOutcome,
    },
}

struct LogInner {
    next_seq: u64,
    retained: VecDeque<Event>,
    clock: Arc<dyn Clock>,
}

/// Sequenced, bounded, broadcast event log. Cheap to clone.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<LogInner>>,
    capacity: usize,
    tx: broadcast::Sender<Event>,
}

impl EventLog {
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Keep at most `capacity` events for [`EventLog::since`] queries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                next_seq: 1,
                retained: VecDeque::with_capacity(capacity.min(1024)),
                clock: Arc::new(SystemClock),
            })),
            capacity,
            tx,
        }
    }

    /// Stamp events from `clock`. Applies to every clone of this log.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.inner.lock().clock = clock;
        self
    }

    /// Record an event and return it with its sequence number.
    pub fn record(&self, kind: EventKind) -> Event {
        let mut inner = self.inner.lock();
        let event = Event {
            seq: inner.next_seq,
            timestamp: inner.clock.now(),
            kind,
        };
        inner.next_seq += 1;
        if inner.retained.len() == self.capacity {
            inner.retained.pop_front();
        }
        inner.retained.push_back(event.clone());
        // Send under the lock so subscribers see seq order.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Retained events with `seq > since_seq`, oldest first.
    pub fn since(&self, since_seq: u64) -> Vec<Event> {
        self.inner
            .lock()
            .retained
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    /// Live stream of events recorded after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
