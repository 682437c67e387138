//! Behavioral checks every `JobStore` implementation must pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use queuectl_core::{FailureDecision, JobId, JobState, NewJob};

use super::store::{JobStore, JobStoreError};

const LEASE: Duration = Duration::from_secs(30);

pub(crate) async fn run_all<S, F, Fut>(make: F)
where
    S: JobStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    enqueue_creates_pending_job(&make().await).await;
    enqueue_validates_input(&make().await).await;
    claim_is_fifo_and_sets_lease(&make().await).await;
    success_completes_with_output(&make().await).await;
    completed_job_is_terminal(&make().await).await;
    failures_retry_then_dead(&make().await).await;
    retry_dead_revives_only_dead_jobs(&make().await).await;
    wrong_state_is_invalid_transition(&make().await).await;
    list_and_counts(&make().await).await;
    lease_renewal_requires_owner(&make().await).await;
    expired_leases_are_reclaimed(&make().await).await;
    only_lease_holder_reports_result(&make().await).await;
    stale_holder_cannot_report_after_reclaim(&make().await).await;
}

async fn enqueue_creates_pending_job<S: JobStore>(store: &S) {
    let id = store.enqueue(NewJob::new("echo hi")).await.unwrap();
    let job = store.get(&id).await.unwrap().unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.command, "echo hi");
    assert!(job.lease_owner.is_none());
    assert_eq!(store.get_state(&id).await.unwrap(), JobState::Pending);

    let explicit = store
        .enqueue(NewJob::new("true").with_id("custom-1").with_max_retries(0))
        .await
        .unwrap();
    assert_eq!(explicit, JobId::from("custom-1"));
    assert_eq!(store.get(&explicit).await.unwrap().unwrap().max_retries, 0);
}

async fn enqueue_validates_input<S: JobStore>(store: &S) {
    assert!(matches!(
        store.enqueue(NewJob::new("  ")).await,
        Err(JobStoreError::Validation(_))
    ));
    assert!(matches!(
        store.enqueue(NewJob::new("true").with_id("")).await,
        Err(JobStoreError::Validation(_))
    ));

    store.enqueue(NewJob::new("true").with_id("dup")).await.unwrap();
    assert!(matches!(
        store.enqueue(NewJob::new("false").with_id("dup")).await,
        Err(JobStoreError::AlreadyExists(id)) if id.as_str() == "dup"
    ));
    assert_eq!(store.list(None).await.unwrap().len(), 1);
    assert!(matches!(
        store.get_state(&JobId::from("missing")).await,
        Err(JobStoreError::NotFound(_))
    ));
}

async fn claim_is_fifo_and_sets_lease<S: JobStore>(store: &S) {
    assert!(store.claim("w1", LEASE).await.unwrap().is_none());

    for id in ["b-first", "a-second", "c-third"] {
        store.enqueue(NewJob::new("true").with_id(id)).await.unwrap();
    }

    let before = Utc::now();
    let first = store.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(first.id.as_str(), "b-first");
    assert_eq!(first.state, JobState::Processing);
    assert_eq!(first.lease_owner.as_deref(), Some("w1"));
    assert!(first.lease_expires_at.unwrap() >= before + chrono::Duration::seconds(29));

    let second = store.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(second.id.as_str(), "a-second");
    let third = store.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(third.id.as_str(), "c-third");
    assert!(store.claim("w1", LEASE).await.unwrap().is_none());
}

async fn success_completes_with_output<S: JobStore>(store: &S) {
    let id = store.enqueue(NewJob::new("exit 0")).await.unwrap();
    store.claim("w1", LEASE).await.unwrap().unwrap();
    store.mark_completed(&id, "w1", String::new()).await.unwrap();

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.output.as_deref(), Some(""));
    assert!(job.lease_owner.is_none());
    assert!(job.lease_expires_at.is_none());
}

async fn completed_job_is_terminal<S: JobStore>(store: &S) {
    let id = store.enqueue(NewJob::new("echo done")).await.unwrap();
    store.claim("w1", LEASE).await.unwrap().unwrap();
    store.mark_completed(&id, "w1", "done\n".into()).await.unwrap();
    let snapshot = store.get(&id).await.unwrap().unwrap();

    assert!(store.claim("w1", LEASE).await.unwrap().is_none());
    assert!(store.mark_completed(&id, "w1", "again".into()).await.is_err());
    assert!(store.mark_failed(&id, "w1", "late".into()).await.is_err());
    assert!(store.requeue(&id).await.is_err());
    assert!(store.retry_dead(&id).await.is_err());
    assert!(store.renew_lease(&id, "w1", LEASE).await.is_err());
    store
        .reclaim_expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(store.get(&id).await.unwrap().unwrap(), snapshot);
}

async fn failures_retry_then_dead<S: JobStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("exit 1").with_max_retries(2))
        .await
        .unwrap();

    for expected in 1..=2 {
        store.claim("w1", LEASE).await.unwrap().unwrap();
        let outcome = store
            .mark_failed(&id, "w1", format!("exit {expected}"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, FailureDecision::Retry);
        assert_eq!(outcome.attempts, expected);
        assert_eq!(store.get_state(&id).await.unwrap(), JobState::Failed);

        // not claimable until requeued
        assert!(store.claim("w1", LEASE).await.unwrap().is_none());
        store.requeue(&id).await.unwrap();
    }

    store.claim("w1", LEASE).await.unwrap().unwrap();
    let outcome = store.mark_failed(&id, "w1", "exit 3".into()).await.unwrap();
    assert_eq!(outcome.decision, FailureDecision::Dead);
    assert_eq!(outcome.attempts, 3);

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("exit 3"));
    assert!(store.claim("w1", LEASE).await.unwrap().is_none());
}

async fn retry_dead_revives_only_dead_jobs<S: JobStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("exit 1").with_max_retries(0))
        .await
        .unwrap();
    store.claim("w1", LEASE).await.unwrap().unwrap();
    store.mark_failed(&id, "w1", "boom".into()).await.unwrap();
    assert_eq!(store.get_state(&id).await.unwrap(), JobState::Dead);

    store.retry_dead(&id).await.unwrap();
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());

    // pending again, so no longer in the DLQ
    assert!(matches!(
        store.retry_dead(&id).await,
        Err(JobStoreError::NotFound(_))
    ));
    assert!(matches!(
        store.retry_dead(&JobId::from("nonexistent-id")).await,
        Err(JobStoreError::NotFound(_))
    ));

    let claimed = store.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

async fn wrong_state_is_invalid_transition<S: JobStore>(store: &S) {
    let id = store.enqueue(NewJob::new("true")).await.unwrap();

    assert!(matches!(
        store.mark_completed(&id, "w1", "x".into()).await,
        Err(JobStoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        store.mark_failed(&id, "w1", "x".into()).await,
        Err(JobStoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        store.requeue(&id).await,
        Err(JobStoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        store.mark_completed(&JobId::from("ghost"), "w1", "x".into()).await,
        Err(JobStoreError::NotFound(_))
    ));
    assert_eq!(store.get_state(&id).await.unwrap(), JobState::Pending);
}

async fn list_and_counts<S: JobStore>(store: &S) {
    for id in ["j1", "j2", "j3", "j4"] {
        store.enqueue(NewJob::new("true").with_id(id).with_max_retries(0)).await.unwrap();
    }
    let done = store.claim("w", LEASE).await.unwrap().unwrap();
    store.mark_completed(&done.id, "w", String::new()).await.unwrap();
    let dead = store.claim("w", LEASE).await.unwrap().unwrap();
    store.mark_failed(&dead.id, "w", "boom".into()).await.unwrap();
    store.claim("w", LEASE).await.unwrap().unwrap();

    let all: Vec<String> = store
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id.to_string())
        .collect();
    assert_eq!(all, ["j1", "j2", "j3", "j4"]);

    let dlq = store.list(Some(JobState::Dead)).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id.as_str(), "j2");

    let stats = store.counts().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.total(), 4);
}

async fn lease_renewal_requires_owner<S: JobStore>(store: &S) {
    let id = store.enqueue(NewJob::new("sleep 10")).await.unwrap();
    let claimed = store.claim("w1", Duration::from_secs(5)).await.unwrap().unwrap();

    assert!(matches!(
        store.renew_lease(&id, "w2", LEASE).await,
        Err(JobStoreError::LeaseLost(_))
    ));

    store.renew_lease(&id, "w1", LEASE).await.unwrap();
    let renewed = store.get(&id).await.unwrap().unwrap();
    assert!(renewed.lease_expires_at > claimed.lease_expires_at);
    assert_eq!(renewed.lease_owner.as_deref(), Some("w1"));
}

async fn expired_leases_are_reclaimed<S: JobStore>(store: &S) {
    let short = store.enqueue(NewJob::new("sleep 1").with_id("short")).await.unwrap();
    let long = store.enqueue(NewJob::new("sleep 1").with_id("long")).await.unwrap();
    store.claim("w1", Duration::from_secs(1)).await.unwrap().unwrap();
    store.claim("w2", Duration::from_secs(3600)).await.unwrap().unwrap();

    assert!(store.reclaim_expired(Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::seconds(10);
    let reclaimed = store.reclaim_expired(later).await.unwrap();
    assert_eq!(reclaimed, vec![short.clone()]);

    let job = store.get(&short).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.lease_owner.is_none());
    assert!(job.last_error.unwrap().contains("w1"));

    // the stale holder can no longer report a result
    assert!(matches!(
        store.mark_completed(&short, "w1", "late".into()).await,
        Err(JobStoreError::InvalidTransition(_))
    ));
    assert_eq!(store.get_state(&long).await.unwrap(), JobState::Processing);

    let again = store.claim("w3", LEASE).await.unwrap().unwrap();
    assert_eq!(again.id, short);
}

async fn only_lease_holder_reports_result<S: JobStore>(store: &S) {
    let id = store.enqueue(NewJob::new("true")).await.unwrap();
    store.claim("w1", LEASE).await.unwrap().unwrap();

    assert!(matches!(
        store.mark_completed(&id, "w2", "x".into()).await,
        Err(JobStoreError::LeaseLost(_))
    ));
    assert!(matches!(
        store.mark_failed(&id, "w2", "x".into()).await,
        Err(JobStoreError::LeaseLost(_))
    ));
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.lease_owner.as_deref(), Some("w1"));

    store.mark_completed(&id, "w1", "ok".into()).await.unwrap();
}

async fn stale_holder_cannot_report_after_reclaim<S: JobStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("exit 1").with_max_retries(0))
        .await
        .unwrap();
    store.claim("worker-a", Duration::from_secs(1)).await.unwrap().unwrap();

    let later = Utc::now() + chrono::Duration::seconds(5);
    assert_eq!(store.reclaim_expired(later).await.unwrap(), vec![id.clone()]);
    let taken = store.claim("worker-b", LEASE).await.unwrap().unwrap();
    assert_eq!(taken.id, id);

    // worker-a finishes late; neither outcome may land on worker-b's claim
    assert!(matches!(
        store.mark_failed(&id, "worker-a", "stale failure".into()).await,
        Err(JobStoreError::LeaseLost(_))
    ));
    assert!(matches!(
        store.mark_completed(&id, "worker-a", "stale output".into()).await,
        Err(JobStoreError::LeaseLost(_))
    ));
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.lease_owner.as_deref(), Some("worker-b"));

    store.mark_completed(&id, "worker-b", "fresh".into()).await.unwrap();
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.output.as_deref(), Some("fresh"));
}

/// Many concurrent claimers, one pending job: exactly one wins.
pub(crate) async fn concurrent_claims_are_exclusive<S: JobStore + 'static>(store: Arc<S>) {
    store.enqueue(NewJob::new("true").with_id("only")).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        tasks.spawn(async move { store.claim(&format!("w{n}"), LEASE).await });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.counts().await.unwrap().processing, 1);
}

const WORKERS: usize = 3;

/// One step of a randomly generated job history.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Op {
    Claim(usize),
    Complete(usize),
    Fail(usize),
    Requeue,
    RetryDead,
    ExpireLeases,
}

pub(crate) fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..WORKERS).prop_map(Op::Claim),
        (0..WORKERS).prop_map(Op::Complete),
        (0..WORKERS).prop_map(Op::Fail),
        Just(Op::Requeue),
        Just(Op::RetryDead),
        Just(Op::ExpireLeases),
    ]
}

fn worker_name(n: usize) -> String {
    format!("w{n}")
}

/// Drive one job through `ops` from several workers. Only the worker that
/// claimed most recently (and was not reclaimed since) may report a result,
/// and the retry budget is never overrun.
pub(crate) async fn random_operations_keep_single_holder<S: JobStore>(
    store: &S,
    max_retries: u32,
    ops: &[Op],
) {
    let id = store
        .enqueue(NewJob::new("true").with_max_retries(max_retries))
        .await
        .unwrap();
    let mut holder: Option<usize> = None;

    for op in ops {
        let before = store.get(&id).await.unwrap().unwrap();
        match *op {
            Op::Claim(w) => {
                let claimed = store.claim(&worker_name(w), LEASE).await.unwrap();
                assert_eq!(claimed.is_some(), before.state == JobState::Pending, "{op:?}");
                if claimed.is_some() {
                    holder = Some(w);
                }
            }
            Op::Complete(w) => {
                let result = store.mark_completed(&id, &worker_name(w), String::new()).await;
                assert_eq!(result.is_ok(), holder == Some(w), "{op:?} in {}", before.state);
                if result.is_ok() {
                    holder = None;
                }
            }
            Op::Fail(w) => {
                let result = store.mark_failed(&id, &worker_name(w), "boom".into()).await;
                assert_eq!(result.is_ok(), holder == Some(w), "{op:?} in {}", before.state);
                if let Ok(outcome) = result {
                    holder = None;
                    assert_eq!(outcome.attempts, before.attempts + 1);
                    assert_eq!(
                        outcome.decision == FailureDecision::Dead,
                        outcome.attempts > max_retries
                    );
                }
            }
            Op::Requeue => {
                let result = store.requeue(&id).await;
                assert_eq!(result.is_ok(), before.state == JobState::Failed);
            }
            Op::RetryDead => {
                let result = store.retry_dead(&id).await;
                assert_eq!(result.is_ok(), before.state == JobState::Dead);
            }
            Op::ExpireLeases => {
                let later = Utc::now() + chrono::Duration::hours(1);
                let reclaimed = store.reclaim_expired(later).await.unwrap();
                assert_eq!(reclaimed.is_empty(), holder.is_none());
                holder = None;
            }
        }

        let after = store.get(&id).await.unwrap().unwrap();
        assert_eq!(after.state == JobState::Processing, holder.is_some());
        assert_eq!(after.lease_owner, holder.map(worker_name));
        assert!(after.attempts <= max_retries + 1);
    }
}
