//! Durable job queue behavior: claim protocol, requeue-in-place, stalled
//! job recovery, retry accounting.

mod common;

use common::*;

use langorch::common::time::now_ms;
use langorch::queue::RunJob;

#[tokio::test]
async fn enqueue_claim_done_round_trip() {
    let h = harness().await;
    let job = RunJob::enqueue(&h.kernel.pool, "run-1", 0, 3).await.unwrap();
    assert_eq!(job.status, "queued");

    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 5)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].run_id, "run-1");
    assert_eq!(claimed[0].status, "running");
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].locked_by.as_deref(), Some("w1"));

    RunJob::mark_done(&h.kernel.pool, &claimed[0].job_id)
        .await
        .unwrap();
    let done = RunJob::find_by_run(&h.kernel.pool, "run-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, "done");
    assert_eq!(done.run_id, "run-1");
}

#[tokio::test]
async fn second_claimer_gets_nothing() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-race", 0, 3).await.unwrap();

    let first = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 5)
        .await
        .unwrap();
    let second = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w2", 5)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

#[tokio::test]
async fn unique_run_id_rejects_duplicate_enqueue() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-dup", 0, 3).await.unwrap();
    assert!(RunJob::enqueue(&h.kernel.pool, "run-dup", 0, 3).await.is_err());
}

#[tokio::test]
async fn requeue_reuses_the_existing_row() {
    let h = harness().await;
    let original = RunJob::enqueue(&h.kernel.pool, "run-rq", 0, 3).await.unwrap();
    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let requeued = RunJob::requeue(&h.kernel.pool, "run-rq", 10, 3).await.unwrap();
    assert_eq!(requeued.job_id, original.job_id);
    assert_eq!(requeued.status, "queued");
    assert_eq!(requeued.priority, 10);
    assert_eq!(requeued.attempts, 0);
    assert!(requeued.locked_by.is_none());
}

#[tokio::test]
async fn requeue_without_prior_job_inserts() {
    let h = harness().await;
    let job = RunJob::requeue(&h.kernel.pool, "run-fresh", 5, 3).await.unwrap();
    assert_eq!(job.status, "queued");
    assert_eq!(job.priority, 5);
}

#[tokio::test]
async fn higher_priority_claims_first() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-low", 0, 3).await.unwrap();
    RunJob::enqueue(&h.kernel.pool, "run-high", 10, 3).await.unwrap();

    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].run_id, "run-high");
}

#[tokio::test]
async fn future_available_at_is_not_claimable() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-later", 0, 3).await.unwrap();
    sqlx::query("UPDATE run_jobs SET available_at = $1 WHERE run_id = $2")
        .bind(now_ms() + 60_000)
        .bind("run-later")
        .execute(&h.kernel.pool)
        .await
        .unwrap();

    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 5)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn stalled_job_with_attempts_left_goes_back_to_retrying() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-stall", 0, 3).await.unwrap();
    RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 1)
        .await
        .unwrap();
    // Simulate a crashed worker: the lock expired while still running
    sqlx::query("UPDATE run_jobs SET locked_until = $1 WHERE run_id = $2")
        .bind(now_ms() - 1000)
        .bind("run-stall")
        .execute(&h.kernel.pool)
        .await
        .unwrap();

    let reclaimed = RunJob::reclaim_stalled(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);
    let job = RunJob::find_by_run(&h.kernel.pool, "run-stall")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "retrying");
    assert!(job.locked_by.is_none());
    assert!(job.available_at > now_ms() - 1000);
}

#[tokio::test]
async fn stalled_job_out_of_attempts_fails_permanently() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-dead", 0, 2).await.unwrap();
    sqlx::query(
        "UPDATE run_jobs SET status = 'running', attempts = 2, locked_until = $1 \
         WHERE run_id = $2",
    )
    .bind(now_ms() - 1000)
    .bind("run-dead")
    .execute(&h.kernel.pool)
    .await
    .unwrap();

    RunJob::reclaim_stalled(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap();
    let job = RunJob::find_by_run(&h.kernel.pool, "run-dead")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "failed");
    assert!(job.error_message.as_deref().unwrap_or("").contains("max_attempts"));
}

#[tokio::test]
async fn heartbeat_extends_the_lease() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-hb", 0, 3).await.unwrap();
    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 1)
        .await
        .unwrap();
    let before = claimed[0].locked_until.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    RunJob::heartbeat(&h.kernel.pool, &h.kernel.settings, &claimed[0].job_id)
        .await
        .unwrap();
    let after = RunJob::find(&h.kernel.pool, &claimed[0].job_id)
        .await
        .unwrap()
        .unwrap()
        .locked_until
        .unwrap();
    assert!(after >= before);
}

#[tokio::test]
async fn failure_with_attempts_left_schedules_retry() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-retry", 0, 3).await.unwrap();
    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 1)
        .await
        .unwrap();

    let status = RunJob::mark_failure(
        &h.kernel.pool,
        &h.kernel.settings,
        &claimed[0],
        "agent unreachable",
    )
    .await
    .unwrap();
    assert_eq!(status, "retrying");
    let job = RunJob::find_by_run(&h.kernel.pool, "run-retry")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "retrying");
    assert_eq!(job.error_message.as_deref(), Some("agent unreachable"));
}

#[tokio::test]
async fn failure_on_last_attempt_is_permanent() {
    let h = harness().await;
    RunJob::enqueue(&h.kernel.pool, "run-final", 0, 1).await.unwrap();
    let claimed = RunJob::claim(&h.kernel.pool, &h.kernel.settings, "w1", 1)
        .await
        .unwrap();

    let status = RunJob::mark_failure(&h.kernel.pool, &h.kernel.settings, &claimed[0], "boom")
        .await
        .unwrap();
    assert_eq!(status, "failed");
}
