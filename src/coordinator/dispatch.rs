//! Handing attempts to workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::driver::{Envelope, Signal};
use crate::cache::ScopedCache;
use crate::error::{Error, Result};
use crate::model::{AgentId, FactRef, ValidationReport, WorkItem};

/// Routes attempts to workers.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Pick the worker for `attempt`. An error means nobody can take it.
    fn assign(&self, item: &WorkItem, attempt: u32) -> Result<AgentId>;

    /// Hand the assignment over. An error counts as a failed attempt.
    async fn deliver(&self, assignment: Assignment) -> Result<()>;
}

/// One attempt as seen by the worker that holds it.
///
/// Signals sent through an assignment carry its attempt number, so a worker
/// that lost its attempt to a timeout cannot affect the next one.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub work_item: Arc<WorkItem>,
    pub worker_id: AgentId,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    /// Reports from the validation run that rejected the previous attempt.
    pub feedback: Vec<ValidationReport>,
    /// Operator guidance given on resume.
    pub guidance: Option<String>,
    pub cache: ScopedCache,
    /// Cancelled when this attempt is abandoned or the item is cancelled.
    pub cancellation: CancellationToken,
    signals: mpsc::UnboundedSender<Envelope>,
}

impl Assignment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        work_item: Arc<WorkItem>,
        worker_id: AgentId,
        attempt: u32,
        deadline: DateTime<Utc>,
        feedback: Vec<ValidationReport>,
        guidance: Option<String>,
        cache: ScopedCache,
        cancellation: CancellationToken,
        signals: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            work_item,
            worker_id,
            attempt,
            deadline,
            feedback,
            guidance,
            cache,
            cancellation,
            signals,
        }
    }

    pub fn acknowledge(&self) -> Result<()> {
        self.send(Signal::Acknowledged {
            worker_id: self.worker_id.clone(),
        })
    }

    /// Report the result, already written to the durable store.
    pub fn complete(&self, result_ref: FactRef) -> Result<()> {
        self.send(Signal::Completed { result_ref })
    }

    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.send(Signal::Failed {
            reason: reason.into(),
        })
    }

    fn send(&self, signal: Signal) -> Result<()> {
        self.signals
            .send(Envelope::for_attempt(self.attempt, signal))
            .map_err(|_| {
                Error::Dispatch(format!(
                    "work item {} no longer accepts signals",
                    self.work_item.id
                ))
            })
    }
}

/// Round-robin over a fixed worker list, delivering into one channel.
pub struct ChannelDispatcher {
    workers: Vec<AgentId>,
    next: AtomicUsize,
    tx: mpsc::UnboundedSender<Assignment>,
}

impl ChannelDispatcher {
    pub fn new<I>(workers: I) -> (Self, mpsc::UnboundedReceiver<Assignment>)
    where
        I: IntoIterator,
        I::Item: Into<AgentId>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            workers: workers.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
            tx,
        };
        (dispatcher, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    fn assign(&self, item: &WorkItem, _attempt: u32) -> Result<AgentId> {
        if self.workers.is_empty() {
            return Err(Error::Dispatch(format!("no workers available for {}", item.id)));
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Ok(self.workers[slot].clone())
    }

    async fn deliver(&self, assignment: Assignment) -> Result<()> {
        self.tx
            .send(assignment)
            .map_err(|_| Error::Dispatch("worker channel closed".to_string()))
    }
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
