//! Outbound notifications to humans or supervising agents.
//!
//! Info and warning notifications are fire-and-forget. A blocking
//! notification stays outstanding until it is acknowledged, and the
//! coordinator refuses to resume the work item before that.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{FactRef, WorkItemId};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    /// Requires acknowledgement before the work item can move again.
    Blocking,
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationLevel::Info => write!(f, "info"),
            NotificationLevel::Warning => write!(f, "warning"),
            NotificationLevel::Blocking => write!(f, "blocking"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub work_item_id: WorkItemId,
    pub level: NotificationLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: Option<u32>,
    pub last_failure: Option<String>,
    pub result_ref: Option<FactRef>,
}

impl Notification {
    pub fn new(
        work_item_id: WorkItemId,
        level: NotificationLevel,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_item_id,
            level,
            message: message.into(),
            timestamp,
            attempt: None,
            last_failure: None,
            result_ref: None,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn last_failure(mut self, failure: Option<String>) -> Self {
        self.last_failure = failure;
        self
    }

    pub fn result_ref(mut self, result_ref: Option<FactRef>) -> Self {
        self.result_ref = result_ref;
        self
    }
}

/// Transport for notifications (ticketing, chat, pager...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, n: &Notification) -> Result<()> {
        match n.level {
            NotificationLevel::Info => info!(
                work_item_id = %n.work_item_id,
                level = %n.level,
                "{}", n.message
            ),
            NotificationLevel::Warning | NotificationLevel::Blocking => warn!(
                work_item_id = %n.work_item_id,
                level = %n.level,
                attempt = ?n.attempt,
                last_failure = ?n.last_failure,
                "{}", n.message
            ),
        }
        Ok(())
    }
}

/// Forwards notifications to an mpsc receiver.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| Error::Other("notification receiver dropped".to_string()))
    }
}

#[derive(Default)]
struct Ledger {
    outstanding: HashMap<WorkItemId, Notification>,
    /// Most recent notifications, oldest first, at most `history_capacity`.
    history: VecDeque<Notification>,
    blocking_sent: HashMap<WorkItemId, usize>,
}

pub struct EscalationChannel {
    sinks: Vec<Arc<dyn NotificationSink>>,
    ledger: Mutex<Ledger>,
    history_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl EscalationChannel {
    pub const DEFAULT_HISTORY_CAPACITY: usize = 4096;

    /// A channel with no sinks; notifications are only recorded.
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            ledger: Mutex::new(Ledger::default()),
            history_capacity: Self::DEFAULT_HISTORY_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }

    /// Keep at most `capacity` notifications for [`EscalationChannel::history`].
    /// Outstanding blocking notifications are kept regardless.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn notify(
        &self,
        work_item_id: &WorkItemId,
        level: NotificationLevel,
        message: impl Into<String>,
    ) -> Notification {
        let notification =
            Notification::new(work_item_id.clone(), level, message, self.clock.now());
        self.send(notification).await
    }

    /// Record and deliver a notification. Sink failures are logged only.
    pub async fn send(&self, notification: Notification) -> Notification {
        {
            let mut ledger = self.ledger.lock();
            if notification.level == NotificationLevel::Blocking {
                ledger
                    .outstanding
                    .insert(notification.work_item_id.clone(), notification.clone());
                *ledger
                    .blocking_sent
                    .entry(notification.work_item_id.clone())
                    .or_default() += 1;
            }
            if ledger.history.len() >= self.history_capacity {
                ledger.history.pop_front();
            }
            ledger.history.push_back(notification.clone());
        }
        metrics::notifications().add(1, &[KeyValue::new("level", notification.level.to_string())]);

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&notification).await {
                warn!(
                    sink = sink.name(),
                    work_item_id = %notification.work_item_id,
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
        notification
    }

    /// Clear the outstanding blocking notification for a work item.
    pub fn acknowledge(&self, work_item_id: &WorkItemId) -> Result<Notification> {
        let acknowledged = self
            .ledger
            .lock()
            .outstanding
            .remove(work_item_id)
            .ok_or_else(|| {
                Error::NotFound(format!("outstanding blocking notification for {work_item_id}"))
            })?;
        info!(%work_item_id, notification_id = %acknowledged.id, "escalation acknowledged");
        Ok(acknowledged)
    }

    /// Drop an outstanding blocking notification that no longer needs an
    /// answer, e.g. because the work item was cancelled.
    pub fn dismiss(&self, work_item_id: &WorkItemId) -> Option<Notification> {
        let dismissed = self.ledger.lock().outstanding.remove(work_item_id);
        if let Some(n) = &dismissed {
            debug!(%work_item_id, notification_id = %n.id, "blocking notification dismissed");
        }
        dismissed
    }

    /// Drop everything tracked for a work item except retained history.
    pub fn forget(&self, work_item_id: &WorkItemId) {
        let mut ledger = self.ledger.lock();
        ledger.outstanding.remove(work_item_id);
        ledger.blocking_sent.remove(work_item_id);
    }

    pub fn outstanding(&self, work_item_id: &WorkItemId) -> Option<Notification> {
        self.ledger.lock().outstanding.get(work_item_id).cloned()
    }

    pub fn history(&self) -> Vec<Notification> {
        self.ledger.lock().history.iter().cloned().collect()
    }

    pub fn history_for(&self, work_item_id: &WorkItemId) -> Vec<Notification> {
        self.ledger
            .lock()
            .history
            .iter()
            .filter(|n| &n.work_item_id == work_item_id)
            .cloned()
            .collect()
    }

    /// Blocking notifications sent for a work item since it was submitted.
    pub fn blocking_count(&self, work_item_id: &WorkItemId) -> usize {
        self.ledger
            .lock()
            .blocking_sent
            .get(work_item_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for EscalationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EscalationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("EscalationChannel")
            .field("sinks", &names)
            .finish_non_exhaustive()
    }
}
