//! Leader lease lifecycle: acquire, contend, steal after expiry.

mod common;

use common::*;

use langorch::common::time::now_ms;
use langorch::leader::LeaderElection;

#[tokio::test]
async fn first_instance_acquires_second_stands_by() {
    let h = harness().await;
    let a = LeaderElection::new("scheduler");
    let b = LeaderElection::new("scheduler");

    assert!(a
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());
    assert!(!b
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());

    // A keeps renewing its own row
    assert!(a
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());
}

#[tokio::test]
async fn standby_steals_an_expired_lease() {
    let h = harness().await;
    let a = LeaderElection::new("scheduler");
    let b = LeaderElection::new("scheduler");

    assert!(a
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());

    // The previous leader dies: expire its lease
    sqlx::query("UPDATE scheduler_leader_leases SET expires_at = $1 WHERE name = $2")
        .bind(now_ms() - 1000)
        .bind("scheduler")
        .execute(&h.kernel.pool)
        .await
        .unwrap();

    assert!(b
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());
    // A's renew path no longer matches; its insert conflicts
    assert!(!a
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());
}

#[tokio::test]
async fn distinct_roles_have_independent_leases() {
    let h = harness().await;
    let scheduler = LeaderElection::new("scheduler");
    let retention = LeaderElection::new("retention");

    assert!(scheduler
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());
    assert!(retention
        .try_acquire_or_renew(&h.kernel.pool, &h.kernel.settings)
        .await
        .unwrap());
}

#[tokio::test]
async fn leader_ids_are_unique_per_instance() {
    let a = LeaderElection::new("scheduler");
    let b = LeaderElection::new("scheduler");
    assert_ne!(a.leader_id(), b.leader_id());
}
