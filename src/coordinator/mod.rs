//! Delegation coordinator.
//!
//! Accepts work items, hands attempts to workers through a [`Dispatcher`],
//! and drives each item through its lifecycle:
//!
//! ```text
//! Pending -> Dispatched -> AwaitingSignal -> Validating -> Completed
//!    ^          |              |                |
//!    +----------+--------------+----------------+   (retry after backoff)
//!                                               \-> Escalated -> (resume) -> Dispatched
//! any non-terminal state -> Cancelled
//! ```
//!
//! Transient failures and rejected results are retried locally; only
//! escalations and caller errors reach the outside.

pub mod backoff;
pub mod dispatch;
mod driver;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::KeyValue;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::durable::DurableStore;
use crate::error::{Error, Result};
use crate::escalation::EscalationChannel;
use crate::event::{EventKind, EventLog};
use crate::model::{
    AgentId, DelegationRecord, FactRef, NewWorkItem, State, Status, WorkItem, WorkItemId,
};
use crate::telemetry::metrics;
use crate::telemetry::work::start_delegation_span;
use crate::validation::ValidationGate;

pub use backoff::BackoffPolicy;
pub use dispatch::{Assignment, ChannelDispatcher, Dispatcher};
use driver::{Driver, Envelope, Signal};

/// Result of submitting work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// New work item accepted and its first attempt started.
    Created(Status),
    /// Same id and payload already submitted; nothing changed.
    Existing(Status),
}

impl SubmitResult {
    pub fn status(&self) -> &Status {
        match self {
            SubmitResult::Created(s) | SubmitResult::Existing(s) => s,
        }
    }

    /// HTTP-style code: 201 for a new item, 200 for a replay.
    pub fn status_code(&self) -> u16 {
        match self {
            SubmitResult::Created(_) => 201,
            SubmitResult::Existing(_) => 200,
        }
    }
}

/// Services every driver task uses.
pub(crate) struct Shared {
    pub(crate) config: CoordinatorConfig,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventLog,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) durable: Arc<DurableStore>,
    pub(crate) gate: ValidationGate,
    pub(crate) escalation: Arc<EscalationChannel>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) shutdown: CancellationToken,
}

struct Handle {
    item: Arc<WorkItem>,
    signals: mpsc::UnboundedSender<Envelope>,
    record: watch::Receiver<DelegationRecord>,
    cancel: CancellationToken,
}

struct Inner {
    shared: Arc<Shared>,
    items: RwLock<HashMap<WorkItemId, Handle>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Drivers hold `Shared`, not `Inner`; stop them once no caller can
        // signal anymore.
        self.shared.shutdown.cancel();
    }
}

/// Cheap to clone; all clones drive the same set of work items.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

pub struct CoordinatorBuilder {
    dispatcher: Arc<dyn Dispatcher>,
    config: CoordinatorConfig,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventLog>,
    cache: Option<Arc<CacheStore>>,
    durable: Option<Arc<DurableStore>>,
    escalation: Option<Arc<EscalationChannel>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn durable(mut self, durable: Arc<DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn escalation(mut self, escalation: Arc<EscalationChannel>) -> Self {
        self.escalation = Some(escalation);
        self
    }

    /// Stores not supplied are created in memory from the config, sharing the
    /// clock and event log.
    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default().with_clock(Arc::clone(&clock));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(
                CacheStore::new(self.config.cache_ttl())
                    .with_clock(Arc::clone(&clock))
                    .with_events(events.clone()),
            )
        });
        let durable = self.durable.unwrap_or_else(|| {
            Arc::new(
                DurableStore::in_memory()
                    .with_clock(Arc::clone(&clock))
                    .with_retention(self.config.retention())
                    .with_events(events.clone()),
            )
        });
        let escalation = self.escalation.unwrap_or_else(|| {
            Arc::new(EscalationChannel::new().with_clock(Arc::clone(&clock)))
        });

        let shared = Shared {
            backoff: BackoffPolicy::new(self.config.backoff_base(), self.config.backoff_cap()),
            config: self.config,
            clock,
            events,
            cache,
            gate: ValidationGate::new(Arc::clone(&durable)),
            durable,
            escalation,
            dispatcher: self.dispatcher,
            shutdown: CancellationToken::new(),
        };
        Ok(Coordinator {
            inner: Arc::new(Inner {
                shared: Arc::new(shared),
                items: RwLock::new(HashMap::new()),
            }),
        })
    }
}

impl Coordinator {
    pub fn builder(dispatcher: Arc<dyn Dispatcher>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            dispatcher,
            config: CoordinatorConfig::default(),
            clock: None,
            events: None,
            cache: None,
            durable: None,
            escalation: None,
        }
    }

    /// Accept a work item and start its first attempt.
    ///
    /// Resubmitting an id with the same payload is a no-op that reports the
    /// current status; a different payload is a [`Error::Conflict`].
    pub async fn submit(&self, new: NewWorkItem) -> Result<SubmitResult> {
        let shared = &self.inner.shared;
        let mut items = self.inner.items.write();

        if let Some(existing) = items.get(&new.id) {
            if existing.item.payload != new.payload {
                metrics::work_submitted().add(1, &[KeyValue::new("result", "conflict")]);
                return Err(Error::Conflict(format!(
                    "work item {} already submitted with a different payload",
                    new.id
                )));
            }
            metrics::work_submitted().add(1, &[KeyValue::new("result", "existing")]);
            return Ok(SubmitResult::Existing(existing.record.borrow().status()));
        }

        let now = shared.clock.now();
        let max_attempts = new.max_attempts.unwrap_or(shared.config.max_attempts);
        if max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        let timeout = new
            .timeout
            .unwrap_or_else(|| shared.config.attempt_timeout());
        if timeout.is_zero() || timeout > CoordinatorConfig::MAX_ATTEMPT_TIMEOUT {
            return Err(Error::Config(format!(
                "timeout for {} must be positive and at most {:?}",
                new.id,
                CoordinatorConfig::MAX_ATTEMPT_TIMEOUT
            )));
        }
        let item = Arc::new(WorkItem {
            id: new.id.clone(),
            requester_id: new.requester_id,
            payload: new.payload,
            max_attempts,
            timeout,
            created_at: now,
        });
        let record = DelegationRecord::new(item.id.clone(), max_attempts, now);
        let status = record.status();

        let (record_tx, record_rx) = watch::channel(record.clone());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let cancel = shared.shutdown.child_token();
        let span = start_delegation_span(&item.id, item.requester_id.as_str());

        shared.events.record(EventKind::WorkSubmitted {
            id: item.id.clone(),
            requester_id: item.requester_id.clone(),
            max_attempts,
        });
        metrics::work_submitted().add(1, &[KeyValue::new("result", "created")]);
        span.in_scope(|| info!(work_item_id = %item.id, max_attempts, "work submitted"));

        let driver = Driver::new(
            Arc::clone(shared),
            Arc::clone(&item),
            new.checks,
            record,
            record_tx,
            signal_rx,
            signal_tx.clone(),
            cancel.clone(),
            span.clone(),
        );
        items.insert(
            item.id.clone(),
            Handle {
                item,
                signals: signal_tx,
                record: record_rx,
                cancel,
            },
        );
        drop(items);
        tokio::spawn(driver.run().instrument(span));

        Ok(SubmitResult::Created(status))
    }

    pub fn status(&self, id: &WorkItemId) -> Result<Status> {
        self.with_handle(id, |h| h.record.borrow().status())
    }

    pub fn record(&self, id: &WorkItemId) -> Result<DelegationRecord> {
        self.with_handle(id, |h| h.record.borrow().clone())
    }

    pub fn work_item(&self, id: &WorkItemId) -> Result<Arc<WorkItem>> {
        self.with_handle(id, |h| Arc::clone(&h.item))
    }

    /// Every record, ordered by work item id.
    pub fn records(&self) -> Vec<DelegationRecord> {
        let mut records: Vec<DelegationRecord> = self
            .inner
            .items
            .read()
            .values()
            .map(|h| h.record.borrow().clone())
            .collect();
        records.sort_by(|a, b| a.work_item_id.cmp(&b.work_item_id));
        records
    }

    /// Live view of one item's record.
    pub fn subscribe(&self, id: &WorkItemId) -> Result<watch::Receiver<DelegationRecord>> {
        self.with_handle(id, |h| h.record.clone())
    }

    /// Wait until the item completes, is cancelled, or escalates.
    pub async fn wait_until_settled(&self, id: &WorkItemId) -> Result<DelegationRecord> {
        let mut rx = self.subscribe(id)?;
        if let Ok(record) = rx.wait_for(|r| r.state.is_settled()).await {
            return Ok(record.clone());
        }
        // Driver gone; the last published record is final.
        let last = rx.borrow().clone();
        Ok(last)
    }

    // -- worker signals -----------------------------------------------------

    pub fn acknowledge(&self, id: &WorkItemId, worker_id: &AgentId) -> Result<()> {
        let record = self.record(id)?;
        if record.worker_id.as_ref() != Some(worker_id) {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: record.state,
                reason: format!("{worker_id} does not hold the current attempt"),
            });
        }
        self.worker_signal(
            id,
            &record,
            Signal::Acknowledged {
                worker_id: worker_id.clone(),
            },
        )
    }

    /// Report a result already written to the durable store.
    pub fn signal_complete(&self, id: &WorkItemId, result_ref: FactRef) -> Result<()> {
        let record = self.record(id)?;
        self.worker_signal(id, &record, Signal::Completed { result_ref })
    }

    pub fn signal_failure(&self, id: &WorkItemId, reason: impl Into<String>) -> Result<()> {
        let record = self.record(id)?;
        self.worker_signal(
            id,
            &record,
            Signal::Failed {
                reason: reason.into(),
            },
        )
    }

    fn worker_signal(&self, id: &WorkItemId, record: &DelegationRecord, signal: Signal) -> Result<()> {
        if !matches!(record.state, State::Dispatched | State::AwaitingSignal) {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: record.state,
                reason: "no attempt is in flight".to_string(),
            });
        }
        self.send(id, Envelope::for_attempt(record.attempt, signal))
    }

    // -- operator signals ---------------------------------------------------

    /// Cancel a work item. The worker's cancellation token fires immediately.
    pub fn cancel(&self, id: &WorkItemId, reason: impl Into<String>) -> Result<()> {
        let state = self.status(id)?.state;
        if state.is_terminal() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state,
                reason: "already finished".to_string(),
            });
        }
        self.with_handle(id, |h| h.cancel.cancel())?;
        self.send(
            id,
            Envelope::operator(Signal::Cancel {
                reason: reason.into(),
            }),
        )
    }

    /// Re-dispatch an escalated item with a fresh attempt budget.
    ///
    /// The item's blocking notification must have been acknowledged.
    pub fn resume(&self, id: &WorkItemId, guidance: Option<String>) -> Result<()> {
        let state = self.status(id)?.state;
        if state != State::Escalated {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state,
                reason: "only escalated work can be resumed".to_string(),
            });
        }
        if self.inner.shared.escalation.outstanding(id).is_some() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state,
                reason: "blocking notification not acknowledged".to_string(),
            });
        }
        self.send(id, Envelope::operator(Signal::Resume { guidance }))
    }

    /// Drop a finished item's record and escalation bookkeeping.
    ///
    /// Only completed or cancelled items can be forgotten. Afterwards the id
    /// is unknown: a resubmission is accepted as new work rather than
    /// replayed, whatever its payload.
    pub fn forget(&self, id: &WorkItemId) -> Result<DelegationRecord> {
        let mut items = self.inner.items.write();
        let record = items
            .get(id)
            .map(|h| h.record.borrow().clone())
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))?;
        if !record.state.is_terminal() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: record.state,
                reason: "only finished work can be forgotten".to_string(),
            });
        }
        items.remove(id);
        drop(items);
        self.inner.shared.escalation.forget(id);
        debug!(work_item_id = %id, state = %record.state, "work item forgotten");
        Ok(record)
    }

    /// Stop every driver task. Records keep their last published state.
    pub fn shutdown(&self) {
        self.inner.shared.shutdown.cancel();
    }

    // -- accessors ----------------------------------------------------------

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.shared.cache
    }

    pub fn durable(&self) -> &Arc<DurableStore> {
        &self.inner.shared.durable
    }

    pub fn escalation(&self) -> &Arc<EscalationChannel> {
        &self.inner.shared.escalation
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.shared.events
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.shared.config
    }

    fn with_handle<T>(&self, id: &WorkItemId, f: impl FnOnce(&Handle) -> T) -> Result<T> {
        self.inner
            .items
            .read()
            .get(id)
            .map(f)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    fn send(&self, id: &WorkItemId, envelope: Envelope) -> Result<()> {
        let sender = self.with_handle(id, |h| h.signals.clone())?;
        sender
            .send(envelope)
            .map_err(|_| Error::Dispatch(format!("driver for {id} has stopped")))
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("items", &self.inner.items.read().len())
            .field("config", &self.inner.shared.config)
            .finish_non_exhaustive()
    }
}
