//! Integration tests for the delegation coordinator.
//!
//! Timer-dependent tests run with tokio's clock paused, so backoffs and
//! deadlines elapse instantly while `Instant` still measures them.

use std::sync::Arc;
use std::time::Duration;

use handoff_rs::cache::ScopeKey;
use handoff_rs::config::CoordinatorConfig;
use handoff_rs::coordinator::{Assignment, ChannelDispatcher, Coordinator, SubmitResult};
use handoff_rs::error::Error;
use handoff_rs::escalation::NotificationLevel;
use handoff_rs::event::EventKind;
use handoff_rs::model::*;
use handoff_rs::validation::RequiredFields;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

fn config(max_attempts: u32, backoff_base_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        max_attempts,
        backoff_base_ms,
        backoff_cap_ms: 60_000,
        ..Default::default()
    }
}

fn coordinator(
    config: CoordinatorConfig,
    workers: &[&str],
) -> (Coordinator, UnboundedReceiver<Assignment>) {
    let (dispatcher, assignments) = ChannelDispatcher::new(workers.iter().copied());
    let coordinator = Coordinator::builder(Arc::new(dispatcher))
        .config(config)
        .build()
        .unwrap();
    (coordinator, assignments)
}

async fn write_result(
    coordinator: &Coordinator,
    assignment: &Assignment,
    value: serde_json::Value,
) -> FactRef {
    coordinator
        .durable()
        .write(NewFact::new(
            format!("result/{}/{}", assignment.work_item.id, assignment.attempt),
            value,
            assignment.worker_id.clone(),
        ))
        .await
        .unwrap()
        .fact_ref()
}

fn blocking(coordinator: &Coordinator, id: &WorkItemId) -> usize {
    coordinator.escalation().blocking_count(id)
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn completed_work_evicts_its_cache_entry() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");

    let submitted = coordinator
        .submit(NewWorkItem::new("W1", "requester").payload(json!({"task": "summarize"})))
        .await
        .unwrap();
    assert_eq!(submitted.status_code(), 201);

    let assignment = assignments.recv().await.unwrap();
    assert_eq!(assignment.attempt, 1);
    assert_eq!(assignment.worker_id, AgentId::new("alice"));
    assert_eq!(assignment.work_item.payload, json!({"task": "summarize"}));

    assignment.acknowledge().unwrap();
    assignment.cache.append(json!({"progress": 50})).unwrap();
    assert_eq!(assignment.cache.read().unwrap().body.len(), 1);

    let result_ref = write_result(&coordinator, &assignment, json!({"summary": "ok"})).await;
    assignment.complete(result_ref.clone()).unwrap();

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Completed);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.result_ref, Some(result_ref));
    assert!(record.cache_released);
    assert!(coordinator.cache().get(assignment.cache.key()).is_none());
    assert!(coordinator.cache().is_empty());
    assert_eq!(blocking(&coordinator, &id), 0);

    let evicted = coordinator.events().since(0).into_iter().any(|e| {
        matches!(
            e.kind,
            EventKind::CacheEntryRemoved { ref scope_key, ref reason }
                if scope_key == "W1::alice" && reason == "evicted"
        )
    });
    assert!(evicted);
}

#[tokio::test(start_paused = true)]
async fn completion_without_acknowledgement_is_accepted() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    let assignment = assignments.recv().await.unwrap();
    let result_ref = write_result(&coordinator, &assignment, json!({})).await;
    coordinator.signal_complete(&id, result_ref).unwrap();

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Completed);
}

// ---------------------------------------------------------------------------
// Retry, backoff, escalation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn three_failures_escalate_with_backoff_between_attempts() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    let mut dispatched_at = Vec::new();
    for expected in 1..=3 {
        let assignment = assignments.recv().await.unwrap();
        assert_eq!(assignment.attempt, expected);
        dispatched_at.push(Instant::now());
        assignment.fail(format!("failure {expected}")).unwrap();
    }

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Escalated);
    assert_eq!(record.attempt, 3);
    assert_eq!(record.escalations, 1);

    assert!(dispatched_at[1] - dispatched_at[0] >= Duration::from_millis(200));
    assert!(dispatched_at[2] - dispatched_at[1] >= Duration::from_millis(400));

    assert_eq!(blocking(&coordinator, &id), 1);
    let notice = coordinator.escalation().outstanding(&id).unwrap();
    assert_eq!(notice.attempt, Some(3));
    assert!(notice.last_failure.unwrap().contains("failure 3"));

    let warnings = coordinator
        .escalation()
        .history_for(&id)
        .into_iter()
        .filter(|n| n.level == NotificationLevel::Warning)
        .count();
    assert_eq!(warnings, 2);

    // Automatic retries have stopped.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(assignments.try_recv().is_err());
    assert_eq!(coordinator.status(&id).unwrap().attempt, 3);
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_counts_as_a_failure() {
    let (coordinator, mut assignments) = coordinator(config(2, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(NewWorkItem::new("W1", "r").timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let first = assignments.recv().await.unwrap();
    first.acknowledge().unwrap();
    let second = assignments.recv().await.unwrap();
    assert_eq!(second.attempt, 2);
    assert!(first.cancellation.is_cancelled());

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Escalated);
    assert!(record.last_failure.unwrap().contains("timed out"));
    assert_eq!(blocking(&coordinator, &id), 1);
}

#[tokio::test(start_paused = true)]
async fn signals_from_a_superseded_attempt_are_dropped() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice", "bob"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(NewWorkItem::new("W1", "r").timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let late = assignments.recv().await.unwrap();
    let current = assignments.recv().await.unwrap();
    assert_eq!(current.attempt, 2);
    assert_eq!(current.worker_id, AgentId::new("bob"));

    let stale_ref = write_result(&coordinator, &late, json!({"from": "alice"})).await;
    late.complete(stale_ref).unwrap();
    let fresh_ref = write_result(&coordinator, &current, json!({"from": "bob"})).await;
    current.complete(fresh_ref.clone()).unwrap();

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Completed);
    assert_eq!(record.attempt, 2);
    assert_eq!(record.result_ref, Some(fresh_ref));

    // The first worker's scratch entry went away when the item moved to bob.
    // Its handle is closed, so it cannot recreate the entry either.
    assert!(matches!(
        late.cache.append(json!("late progress")),
        Err(Error::ScopeClosed(_))
    ));
    assert!(!coordinator.cache().contains(late.cache.key()));

    let reassigned = coordinator.events().since(0).into_iter().any(|e| {
        matches!(
            e.kind,
            EventKind::CacheEntryRemoved { ref scope_key, ref reason }
                if scope_key == "W1::alice" && reason == "reassigned"
        )
    });
    assert!(reassigned);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rejected_result_is_sent_back_with_feedback() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(NewWorkItem::new("W1", "r").check(Arc::new(RequiredFields::new(["title"]))))
        .await
        .unwrap();

    let first = assignments.recv().await.unwrap();
    assert!(first.feedback.is_empty());
    let draft = write_result(&coordinator, &first, json!({"body": "draft"})).await;
    first.complete(draft).unwrap();

    let second = assignments.recv().await.unwrap();
    assert_eq!(second.attempt, 2);
    assert_eq!(second.feedback.len(), 1);
    assert!(!second.feedback[0].passed);
    assert_eq!(second.feedback[0].detail, "missing title");

    let revised = write_result(&coordinator, &second, json!({"title": "Final"})).await;
    second.complete(revised).unwrap();

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Completed);
    assert_eq!(record.attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_critical_check_escalates_immediately() {
    let (coordinator, mut assignments) = coordinator(config(5, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(
            NewWorkItem::new("W1", "r").check(Arc::new(
                RequiredFields::new(["license"]).severity(Severity::Critical),
            )),
        )
        .await
        .unwrap();

    let assignment = assignments.recv().await.unwrap();
    let result_ref = write_result(&coordinator, &assignment, json!({})).await;
    assignment.complete(result_ref.clone()).unwrap();

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Escalated);
    assert_eq!(record.attempt, 1);

    let notice = coordinator.escalation().outstanding(&id).unwrap();
    assert_eq!(notice.result_ref, Some(result_ref));
    assert!(notice.message.contains("critical"));
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn resume_requires_acknowledgement_and_opens_a_fresh_budget() {
    let (coordinator, mut assignments) = coordinator(config(1, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    assignments.recv().await.unwrap().fail("broken input").unwrap();
    assert_eq!(
        coordinator.wait_until_settled(&id).await.unwrap().state,
        State::Escalated
    );

    let err = coordinator.resume(&id, None).unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    coordinator.escalation().acknowledge(&id).unwrap();
    coordinator
        .resume(&id, Some("input fixed upstream".to_string()))
        .unwrap();

    let resumed = assignments.recv().await.unwrap();
    assert_eq!(resumed.attempt, 2);
    assert_eq!(resumed.guidance.as_deref(), Some("input fixed upstream"));

    // Budget is one attempt again: a single failure escalates.
    resumed.fail("still broken").unwrap();
    let mut rx = coordinator.subscribe(&id).unwrap();
    rx.wait_for(|r| r.escalations == 2).await.unwrap();
    assert_eq!(blocking(&coordinator, &id), 2);
    assert_eq!(coordinator.status(&id).unwrap().state, State::Escalated);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_the_worker_and_cleans_up() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    let assignment = assignments.recv().await.unwrap();
    assignment.acknowledge().unwrap();
    assignment.cache.append(json!("scratch")).unwrap();

    coordinator.cancel(&id, "requester withdrew").unwrap();
    assert!(assignment.cancellation.is_cancelled());

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Cancelled);
    assert!(record.cache_released);
    assert!(coordinator.cache().is_empty());

    let err = coordinator.cancel(&id, "again").unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn escalated_work_can_be_cancelled() {
    let (coordinator, mut assignments) = coordinator(config(1, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();
    assignments.recv().await.unwrap().fail("nope").unwrap();
    coordinator.wait_until_settled(&id).await.unwrap();

    coordinator.cancel(&id, "abandoned").unwrap();
    let mut rx = coordinator.subscribe(&id).unwrap();
    let record = rx
        .wait_for(|r| r.state == State::Cancelled)
        .await
        .unwrap()
        .clone();
    assert!(record.state.is_terminal());
    // The escalation no longer waits on anyone.
    assert!(coordinator.escalation().outstanding(&id).is_none());
    assert_eq!(blocking(&coordinator, &id), 1);
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn resubmission_is_idempotent_and_payload_changes_conflict() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let new = || NewWorkItem::new("W1", "r").payload(json!({"v": 1}));

    assert!(matches!(
        coordinator.submit(new()).await.unwrap(),
        SubmitResult::Created(_)
    ));
    let replay = coordinator.submit(new()).await.unwrap();
    assert!(matches!(replay, SubmitResult::Existing(_)));
    assert_eq!(replay.status_code(), 200);

    let err = coordinator
        .submit(NewWorkItem::new("W1", "r").payload(json!({"v": 2})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(err.status_code(), Some(409));

    // Only one dispatch happened.
    assignments.recv().await.unwrap();
    tokio::task::yield_now().await;
    assert!(assignments.try_recv().is_err());
    assert_eq!(coordinator.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_items_are_not_found() {
    let (coordinator, _assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("ghost");
    assert!(matches!(coordinator.status(&id), Err(Error::NotFound(_))));
    assert!(matches!(
        coordinator.signal_failure(&id, "x"),
        Err(Error::NotFound(_))
    ));
    assert_eq!(
        coordinator.status(&id).unwrap_err().status_code(),
        Some(404)
    );
}

#[tokio::test(start_paused = true)]
async fn no_workers_escalates_without_dispatching() {
    let (coordinator, _assignments) = coordinator(config(3, 100), &[]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Escalated);
    assert_eq!(record.attempt, 0);
    assert_eq!(blocking(&coordinator, &id), 1);
}

#[tokio::test(start_paused = true)]
async fn status_tracks_the_live_record() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    let assignment = assignments.recv().await.unwrap();
    let mut rx = coordinator.subscribe(&id).unwrap();
    rx.wait_for(|r| r.state == State::Dispatched).await.unwrap();

    coordinator.acknowledge(&id, &AgentId::new("alice")).unwrap();
    rx.wait_for(|r| r.state == State::AwaitingSignal).await.unwrap();

    let status = coordinator.status(&id).unwrap();
    assert_eq!(status.state, State::AwaitingSignal);
    assert_eq!(status.attempt, 1);
    assert_eq!(assignment.attempt, status.attempt);

    let err = coordinator
        .acknowledge(&id, &AgentId::new("mallory"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

// ---------------------------------------------------------------------------
// Cache scope lifetime
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn late_writes_cannot_revive_a_released_cache_entry() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let cancelled = WorkItemId::new("W1");
    let completed = WorkItemId::new("W2");
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();
    let first = assignments.recv().await.unwrap();
    coordinator.submit(NewWorkItem::new("W2", "r")).await.unwrap();
    let second = assignments.recv().await.unwrap();

    first.cache.append(json!("working")).unwrap();
    coordinator.cancel(&cancelled, "withdrawn").unwrap();
    coordinator.wait_until_settled(&cancelled).await.unwrap();

    let result_ref = write_result(&coordinator, &second, json!({})).await;
    second.complete(result_ref).unwrap();
    coordinator.wait_until_settled(&completed).await.unwrap();

    // A worker that has not noticed yet keeps checkpointing.
    for assignment in [&first, &second] {
        assert!(assignment.cache.is_closed());
        let err = assignment.cache.append(json!("late")).unwrap_err();
        assert!(matches!(err, Error::ScopeClosed(_)));
        assert_eq!(err.status_code(), Some(410));
        assert!(assignment.cache.read().is_none());
    }
    coordinator.cache().sweep();
    assert!(coordinator.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn each_attempt_gets_its_own_cache_handle() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    coordinator.submit(NewWorkItem::new("W1", "r")).await.unwrap();

    let first = assignments.recv().await.unwrap();
    first.cache.append(json!("attempt one")).unwrap();
    first.fail("flaky").unwrap();

    let second = assignments.recv().await.unwrap();
    assert_eq!(second.cache.key(), first.cache.key());
    assert!(first.cache.append(json!("stale")).is_err());
    second.cache.append(json!("attempt two")).unwrap();

    // Same worker, so the scratch entry carries over.
    let entry = second.cache.read().unwrap();
    let notes: Vec<_> = entry.body.iter().map(|f| f.data.clone()).collect();
    assert_eq!(notes, vec![json!("attempt one"), json!("attempt two")]);
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn oversized_timeouts_are_rejected_at_submit() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);

    let err = coordinator
        .submit(NewWorkItem::new("W1", "r").timeout(Duration::from_secs(u64::MAX)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(matches!(
        coordinator.status(&WorkItemId::new("W1")),
        Err(Error::NotFound(_))
    ));

    // The longest allowed timeout still dispatches normally.
    let id = WorkItemId::new("W2");
    coordinator
        .submit(NewWorkItem::new("W2", "r").timeout(CoordinatorConfig::MAX_ATTEMPT_TIMEOUT))
        .await
        .unwrap();
    let assignment = assignments.recv().await.unwrap();
    assert_eq!(assignment.attempt, 1);
    assert_eq!(coordinator.status(&id).unwrap().state, State::Dispatched);
}

#[tokio::test(start_paused = true)]
async fn completion_racing_the_deadline_wins() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(NewWorkItem::new("W1", "r").timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let assignment = assignments.recv().await.unwrap();
    let result_ref = write_result(&coordinator, &assignment, json!({"done": true})).await;
    // Queue the completion and move past the deadline before the driver runs.
    assignment.complete(result_ref.clone()).unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Completed);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.result_ref, Some(result_ref));
    assert!(record.last_failure.is_none());
    assert!(assignments.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn cancel_queued_with_an_expired_deadline_still_applies() {
    let (coordinator, mut assignments) = coordinator(config(3, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(NewWorkItem::new("W1", "r").timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let assignment = assignments.recv().await.unwrap();
    assignment.fail("gave up").unwrap();
    coordinator.cancel(&id, "operator stop").unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    let record = coordinator.wait_until_settled(&id).await.unwrap();
    assert_eq!(record.state, State::Cancelled);
    assert_eq!(record.attempt, 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(assignments.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Several items in flight
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_items_settle_independently() {
    let (coordinator, mut assignments) = coordinator(config(2, 100), &["alice", "bob", "carol"]);

    // W1 always fails, W2 succeeds at once, W3 succeeds on its second try.
    let pool = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while let Some(assignment) = assignments.recv().await {
                let id = assignment.work_item.id.as_str().to_string();
                assignment.acknowledge().unwrap();
                assignment
                    .cache
                    .append(json!({"item": id, "attempt": assignment.attempt}))
                    .unwrap();
                let succeed = match id.as_str() {
                    "W1" => false,
                    "W2" => true,
                    _ => assignment.attempt >= 2,
                };
                if succeed {
                    let result_ref =
                        write_result(&coordinator, &assignment, json!({"item": id})).await;
                    assignment.complete(result_ref).unwrap();
                } else {
                    assignment
                        .fail(format!("{id} attempt {} failed", assignment.attempt))
                        .unwrap();
                }
            }
        })
    };

    for id in ["W1", "W2", "W3"] {
        coordinator
            .submit(NewWorkItem::new(id, "planner").payload(json!({"task": id})))
            .await
            .unwrap();
    }
    let w1 = coordinator.wait_until_settled(&WorkItemId::new("W1")).await.unwrap();
    let w2 = coordinator.wait_until_settled(&WorkItemId::new("W2")).await.unwrap();
    let w3 = coordinator.wait_until_settled(&WorkItemId::new("W3")).await.unwrap();

    assert_eq!((w1.state, w1.attempt), (State::Escalated, 2));
    assert!(w1.last_failure.unwrap().contains("W1 attempt 2"));
    assert_eq!((w2.state, w2.attempt), (State::Completed, 1));
    assert_eq!((w3.state, w3.attempt), (State::Completed, 2));
    assert_eq!(w2.result_ref, Some(FactRef::new("result/W2/1", 1)));
    assert_eq!(w3.result_ref, Some(FactRef::new("result/W3/2", 1)));

    assert_eq!(blocking(&coordinator, &WorkItemId::new("W1")), 1);
    assert_eq!(blocking(&coordinator, &WorkItemId::new("W2")), 0);
    assert_eq!(blocking(&coordinator, &WorkItemId::new("W3")), 0);

    // Only the escalated item keeps scratch state, and only its own.
    assert!(w2.cache_released && w3.cache_released);
    assert!(!w1.cache_released);
    assert_eq!(coordinator.cache().len(), 1);
    let key = ScopeKey::new(&w1.work_item_id, w1.worker_id.as_ref().unwrap());
    let entry = coordinator.cache().get(&key).unwrap();
    assert!(entry.body.iter().all(|f| f.data["item"] == "W1"));

    pool.abort();
}

// ---------------------------------------------------------------------------
// Forgetting finished work
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn forgotten_items_free_their_id() {
    let (coordinator, mut assignments) = coordinator(config(1, 100), &["alice"]);
    let id = WorkItemId::new("W1");
    coordinator
        .submit(NewWorkItem::new("W1", "r").payload(json!({"v": 1})))
        .await
        .unwrap();

    let err = coordinator.forget(&id).unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    assignments.recv().await.unwrap().fail("broken").unwrap();
    coordinator.wait_until_settled(&id).await.unwrap();
    assert!(coordinator.forget(&id).is_err(), "escalated work is not finished");

    coordinator.cancel(&id, "dropping it").unwrap();
    let mut rx = coordinator.subscribe(&id).unwrap();
    rx.wait_for(|r| r.state == State::Cancelled).await.unwrap();

    let last = coordinator.forget(&id).unwrap();
    assert_eq!(last.state, State::Cancelled);
    assert!(matches!(coordinator.status(&id), Err(Error::NotFound(_))));
    assert!(coordinator.records().is_empty());
    assert_eq!(blocking(&coordinator, &id), 0);

    // The id is free again, even with a different payload.
    let resubmitted = coordinator
        .submit(NewWorkItem::new("W1", "r").payload(json!({"v": 2})))
        .await
        .unwrap();
    assert_eq!(resubmitted.status_code(), 201);
    let again = assignments.recv().await.unwrap();
    assert_eq!(again.attempt, 1);
}
