//! Per-work-item driver task.
//!
//! Each submitted item gets one task that owns its [`DelegationRecord`] and
//! publishes every change through a `watch` channel. The task sleeps in a
//! `select!` over its signal channel and a single timer (attempt deadline or
//! retry backoff), so an idle item costs nothing.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, warn};

use super::Shared;
use super::dispatch::Assignment;
use crate::cache::{RemovalReason, ScopeKey, ScopedCache};
use crate::clock::to_chrono;
use crate::escalation::{Notification, NotificationLevel};
use crate::event::EventKind;
use crate::model::{AgentId, DelegationRecord, FactRef, State, WorkItem};
use crate::telemetry::metrics;
use crate::telemetry::work::record_state_transition;
use crate::validation::Check;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Signal {
    Acknowledged { worker_id: AgentId },
    Completed { result_ref: FactRef },
    Failed { reason: String },
    Cancel { reason: String },
    Resume { guidance: Option<String> },
}

/// A signal plus the attempt it was sent for. Operator signals carry none.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Envelope {
    pub(crate) attempt: Option<u32>,
    pub(crate) signal: Signal,
}

impl Envelope {
    pub(crate) fn for_attempt(attempt: u32, signal: Signal) -> Self {
        Self {
            attempt: Some(attempt),
            signal,
        }
    }

    pub(crate) fn operator(signal: Signal) -> Self {
        Self {
            attempt: None,
            signal,
        }
    }

    fn is_current(&self, attempt: u32) -> bool {
        self.attempt.is_none_or(|a| a == attempt)
    }
}

/// What to do with signals found queued when an attempt deadline fires.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExpiryPick {
    Complete(FactRef),
    Cancel(String),
    Fail(String),
    Timeout,
}

/// Completion beats cancellation beats an explicit failure beats the
/// timeout itself. Signals for other attempts are ignored.
pub(crate) fn pick_over_expiry(attempt: u32, queued: &[Envelope]) -> ExpiryPick {
    let current = || queued.iter().filter(|e| e.is_current(attempt));
    if let Some(result_ref) = current().find_map(|e| match &e.signal {
        Signal::Completed { result_ref } => Some(result_ref.clone()),
        _ => None,
    }) {
        return ExpiryPick::Complete(result_ref);
    }
    if let Some(reason) = current().find_map(|e| match &e.signal {
        Signal::Cancel { reason } => Some(reason.clone()),
        _ => None,
    }) {
        return ExpiryPick::Cancel(reason);
    }
    if let Some(reason) = current().find_map(|e| match &e.signal {
        Signal::Failed { reason } => Some(reason.clone()),
        _ => None,
    }) {
        return ExpiryPick::Fail(reason);
    }
    ExpiryPick::Timeout
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    item: Arc<WorkItem>,
    checks: Vec<Arc<dyn Check>>,
    record: DelegationRecord,
    tx: watch::Sender<DelegationRecord>,
    signals: mpsc::UnboundedReceiver<Envelope>,
    /// Cloned into each assignment so workers can signal.
    signal_tx: mpsc::UnboundedSender<Envelope>,
    item_token: CancellationToken,
    attempt_token: Option<CancellationToken>,
    /// Cache handle issued with the current attempt.
    scope: Option<ScopedCache>,
    /// `attempt` at the last operator resume; the budget counts from here.
    budget_floor: u32,
    guidance: Option<String>,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
    span: Span,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<Shared>,
        item: Arc<WorkItem>,
        checks: Vec<Arc<dyn Check>>,
        record: DelegationRecord,
        tx: watch::Sender<DelegationRecord>,
        signals: mpsc::UnboundedReceiver<Envelope>,
        signal_tx: mpsc::UnboundedSender<Envelope>,
        item_token: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            shared,
            item,
            checks,
            record,
            tx,
            signals,
            signal_tx,
            item_token,
            attempt_token: None,
            scope: None,
            budget_floor: 0,
            guidance: None,
            deadline: None,
            retry_at: None,
            span,
        }
    }

    pub(crate) async fn run(mut self) {
        self.dispatch().await;

        while !self.record.state.is_terminal() {
            let wake = match self.record.state {
                State::Pending => self.retry_at,
                State::Dispatched | State::AwaitingSignal => self.deadline,
                _ => None,
            };
            let timer_armed = wake.is_some();
            let wake_at = wake.unwrap_or_else(Instant::now);

            // The driver holds a sender itself, so `recv` never yields `None`.
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => {
                    debug!(work_item_id = %self.item.id, "coordinator shut down, driver exiting");
                    break;
                }
                Some(envelope) = self.signals.recv() => self.on_signal(envelope).await,
                _ = sleep_until(wake_at), if timer_armed => self.on_timer().await,
            }
        }
    }

    // -- signals ------------------------------------------------------------

    async fn on_signal(&mut self, envelope: Envelope) {
        if !envelope.is_current(self.record.attempt) {
            debug!(
                work_item_id = %self.item.id,
                signal_attempt = ?envelope.attempt,
                attempt = self.record.attempt,
                "dropping signal from superseded attempt"
            );
            return;
        }
        let state = self.record.state;
        match envelope.signal {
            Signal::Acknowledged { worker_id } => {
                if state == State::Dispatched && self.record.worker_id.as_ref() == Some(&worker_id)
                {
                    self.set_state(State::AwaitingSignal);
                }
            }
            Signal::Completed { result_ref } => {
                if matches!(state, State::Dispatched | State::AwaitingSignal) {
                    self.on_completed(result_ref).await;
                } else {
                    debug!(work_item_id = %self.item.id, %state, "ignoring completion");
                }
            }
            Signal::Failed { reason } => {
                if matches!(state, State::Dispatched | State::AwaitingSignal) {
                    self.fail_attempt(reason).await;
                } else {
                    debug!(work_item_id = %self.item.id, %state, "ignoring failure signal");
                }
            }
            Signal::Cancel { reason } => self.cancel(reason).await,
            Signal::Resume { guidance } => self.resume(guidance).await,
        }
    }

    async fn on_timer(&mut self) {
        match self.record.state {
            State::Pending => {
                self.retry_at = None;
                self.dispatch().await;
            }
            State::Dispatched | State::AwaitingSignal => {
                let mut queued = Vec::new();
                while let Ok(envelope) = self.signals.try_recv() {
                    queued.push(envelope);
                }
                match pick_over_expiry(self.record.attempt, &queued) {
                    ExpiryPick::Complete(result_ref) => self.on_completed(result_ref).await,
                    ExpiryPick::Cancel(reason) => self.cancel(reason).await,
                    ExpiryPick::Fail(reason) => self.fail_attempt(reason).await,
                    ExpiryPick::Timeout => {
                        let reason = format!(
                            "attempt {} timed out after {:?}",
                            self.record.attempt, self.item.timeout
                        );
                        self.fail_attempt(reason).await;
                    }
                }
                // Operator signals that lost the race still apply.
                for envelope in queued {
                    if matches!(envelope.signal, Signal::Cancel { .. } | Signal::Resume { .. })
                        && !self.record.state.is_terminal()
                    {
                        self.on_signal(envelope).await;
                    }
                }
            }
            _ => {}
        }
    }

    // -- transitions --------------------------------------------------------

    async fn dispatch(&mut self) {
        let attempt = self.record.attempt + 1;
        let worker_id = match self.shared.dispatcher.assign(&self.item, attempt) {
            Ok(worker_id) => worker_id,
            Err(e) => {
                let reason = format!("no worker for attempt {attempt}: {e}");
                self.record.last_failure = Some(reason.clone());
                self.escalate(reason, "no_worker").await;
                return;
            }
        };

        let now = self.shared.clock.now();
        self.record.attempt = attempt;
        self.record.retry_at = None;
        self.record.deadline = Some(now + to_chrono(self.item.timeout));
        self.deadline = Some(instant_after(self.item.timeout));
        self.retry_at = None;

        let key = ScopeKey::new(&self.item.id, &worker_id);
        if let Some(previous) = self.scope.take() {
            if previous.key() == &key {
                previous.close();
            } else {
                previous.release(RemovalReason::Reassigned);
            }
        }
        self.shared.cache.open(&key);
        let scope = ScopedCache::new(Arc::clone(&self.shared.cache), key);
        self.scope = Some(scope.clone());
        self.record.worker_id = Some(worker_id.clone());
        self.set_state(State::Dispatched);

        let token = self.item_token.child_token();
        self.attempt_token = Some(token.clone());
        self.shared.events.record(EventKind::WorkDispatched {
            id: self.item.id.clone(),
            worker_id: worker_id.clone(),
            attempt,
        });
        info!(work_item_id = %self.item.id, %worker_id, attempt, "work dispatched");

        let assignment = Assignment::new(
            Arc::clone(&self.item),
            worker_id,
            attempt,
            now + to_chrono(self.item.timeout),
            self.record.feedback.clone(),
            self.guidance.clone(),
            scope,
            token,
            self.signal_tx.clone(),
        );
        if let Err(e) = self.shared.dispatcher.deliver(assignment).await {
            self.fail_attempt(format!("delivery failed: {e}")).await;
        }
    }

    async fn on_completed(&mut self, result_ref: FactRef) {
        self.deadline = None;
        self.record.deadline = None;
        self.record.result_ref = Some(result_ref.clone());
        self.set_state(State::Validating);

        let attempt = self.record.attempt;
        let verdict = match self
            .shared
            .gate
            .validate(&result_ref, &self.item, attempt, &self.checks)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                self.fail_attempt(format!("validation could not run: {e}"))
                    .await;
                return;
            }
        };

        self.shared.events.record(EventKind::ValidationFinished {
            id: self.item.id.clone(),
            attempt,
            accepted: verdict.accepted(),
            failed_checks: verdict.failures().map(|r| r.check_name.clone()).collect(),
        });
        self.record.feedback = verdict.reports.clone();

        if verdict.accepted() {
            self.complete().await;
        } else if verdict.irrecoverable() {
            let reason = format!("critical check failed: {}", verdict.summary());
            self.record.last_failure = Some(reason.clone());
            self.escalate(reason, "critical_check").await;
        } else {
            self.fail_attempt(format!("validation failed: {}", verdict.summary()))
                .await;
        }
    }

    async fn fail_attempt(&mut self, reason: String) {
        let attempt = self.record.attempt;
        warn!(work_item_id = %self.item.id, attempt, %reason, "attempt failed");
        self.shared.events.record(EventKind::WorkFailed {
            id: self.item.id.clone(),
            attempt,
            reason: reason.clone(),
        });
        self.record.last_failure = Some(reason.clone());
        self.deadline = None;
        self.record.deadline = None;
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
        }

        if attempt.saturating_sub(self.budget_floor) >= self.record.max_attempts {
            let reason = format!("{attempt} attempts failed; last: {reason}");
            self.escalate(reason, "attempts_exhausted").await;
            return;
        }

        let next_attempt = attempt + 1;
        let delay = self.shared.backoff.delay_for(next_attempt);
        self.retry_at = Some(instant_after(delay));
        self.record.retry_at = Some(self.shared.clock.now() + to_chrono(delay));
        self.set_state(State::Pending);

        self.shared.events.record(EventKind::RetryScheduled {
            id: self.item.id.clone(),
            next_attempt,
            delay_ms: duration_ms(delay),
        });
        metrics::retry_backoff_ms().record(delay.as_secs_f64() * 1000.0, &[]);
        self.notify(
            NotificationLevel::Warning,
            format!(
                "attempt {attempt} of {} failed: {reason}; retrying in {} ms",
                self.record.max_attempts,
                duration_ms(delay)
            ),
        )
        .await;
    }

    async fn complete(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.release(RemovalReason::Evicted);
        }
        self.record.cache_released = true;
        self.set_state(State::Completed);
        self.shared.events.record(EventKind::WorkCompleted {
            id: self.item.id.clone(),
            attempt: self.record.attempt,
        });
        self.notify(
            NotificationLevel::Info,
            format!("completed on attempt {}", self.record.attempt),
        )
        .await;
    }

    /// Halt automatic progress and raise exactly one blocking notification.
    async fn escalate(&mut self, reason: String, cause: &'static str) {
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
        }
        self.deadline = None;
        self.retry_at = None;
        self.record.deadline = None;
        self.record.retry_at = None;
        self.record.escalations += 1;
        if self.record.state != State::Escalated {
            self.set_state(State::Escalated);
        } else {
            self.publish();
        }

        error!(
            work_item_id = %self.item.id,
            attempt = self.record.attempt,
            cause,
            %reason,
            "work escalated"
        );
        self.shared.events.record(EventKind::WorkEscalated {
            id: self.item.id.clone(),
            attempt: self.record.attempt,
            reason: reason.clone(),
        });
        metrics::escalations().add(1, &[KeyValue::new("cause", cause)]);

        let notification = Notification::new(
            self.item.id.clone(),
            NotificationLevel::Blocking,
            reason,
            self.shared.clock.now(),
        )
        .attempt(self.record.attempt)
        .last_failure(self.record.last_failure.clone())
        .result_ref(self.record.result_ref.clone());
        self.shared.escalation.send(notification).await;
    }

    async fn resume(&mut self, guidance: Option<String>) {
        if self.record.state != State::Escalated {
            debug!(work_item_id = %self.item.id, state = %self.record.state, "ignoring resume");
            return;
        }
        if self.shared.escalation.outstanding(&self.item.id).is_some() {
            warn!(work_item_id = %self.item.id, "resume before acknowledgement ignored");
            return;
        }
        info!(work_item_id = %self.item.id, attempt = self.record.attempt, "resuming");
        self.shared.events.record(EventKind::WorkResumed {
            id: self.item.id.clone(),
            attempt: self.record.attempt,
        });
        self.budget_floor = self.record.attempt;
        self.guidance = guidance;
        self.dispatch().await;
    }

    async fn cancel(&mut self, reason: String) {
        if self.record.state.is_terminal() {
            return;
        }
        self.item_token.cancel();
        self.attempt_token = None;
        self.deadline = None;
        self.retry_at = None;
        self.record.deadline = None;
        self.record.retry_at = None;
        if let Some(scope) = self.scope.take() {
            scope.release(RemovalReason::Evicted);
        }
        // Nobody needs to answer an escalation for work that no longer exists.
        self.shared.escalation.dismiss(&self.item.id);
        self.record.cache_released = true;
        self.record.last_failure = Some(format!("cancelled: {reason}"));
        self.set_state(State::Cancelled);
        self.shared.events.record(EventKind::WorkCancelled {
            id: self.item.id.clone(),
            reason: reason.clone(),
        });
        self.notify(NotificationLevel::Info, format!("cancelled: {reason}"))
            .await;
    }

    // -- plumbing -----------------------------------------------------------

    fn set_state(&mut self, to: State) {
        let now = self.shared.clock.now();
        match self.record.transition(to, now) {
            Ok(from) => {
                record_state_transition(&self.span, from, to);
                metrics::work_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", from.to_string()),
                        KeyValue::new("to", to.to_string()),
                    ],
                );
                self.shared.events.record(EventKind::StateTransition {
                    id: self.item.id.clone(),
                    from,
                    to,
                });
            }
            Err(e) => error!(work_item_id = %self.item.id, error = %e, "rejected transition"),
        }
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.record.clone());
    }

    async fn notify(&self, level: NotificationLevel, message: String) {
        let notification =
            Notification::new(self.item.id.clone(), level, message, self.shared.clock.now())
                .attempt(self.record.attempt);
        self.shared.escalation.send(notification).await;
    }
}

/// `now + d`, saturating about thirty years out instead of overflowing.
fn instant_after(d: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    let now = Instant::now();
    now.checked_add(d)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(attempt: u32) -> Envelope {
        Envelope::for_attempt(
            attempt,
            Signal::Completed {
                result_ref: FactRef::new("out", 1),
            },
        )
    }

    fn failed(attempt: u32) -> Envelope {
        Envelope::for_attempt(
            attempt,
            Signal::Failed {
                reason: "boom".to_string(),
            },
        )
    }

    #[test]
    fn nothing_queued_is_a_timeout() {
        assert_eq!(pick_over_expiry(1, &[]), ExpiryPick::Timeout);
    }

    #[test]
    fn completion_beats_the_deadline() {
        let queued = [failed(2), completed(2)];
        assert_eq!(
            pick_over_expiry(2, &queued),
            ExpiryPick::Complete(FactRef::new("out", 1))
        );
    }

    #[test]
    fn stale_completion_does_not_count() {
        assert_eq!(pick_over_expiry(3, &[completed(2)]), ExpiryPick::Timeout);
    }

    #[test]
    fn operator_cancel_beats_failure() {
        let queued = [
            failed(1),
            Envelope::operator(Signal::Cancel {
                reason: "stop".to_string(),
            }),
        ];
        assert_eq!(
            pick_over_expiry(1, &queued),
            ExpiryPick::Cancel("stop".to_string())
        );
    }

    #[test]
    fn explicit_failure_keeps_its_reason() {
        assert_eq!(
            pick_over_expiry(1, &[failed(1)]),
            ExpiryPick::Fail("boom".to_string())
        );
    }
}
