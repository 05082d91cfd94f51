//! Dispatch resilience: agent circuit breakers, resource leases, affinity.

mod common;

use common::*;
use serde_json::json;

use langorch::common::time::now_ms;
use langorch::db::{AgentInstance, ResourceLease, RunEvent};
use langorch::dispatch::{dispatch_to_agent, find_capable_agent, StepContext};
use langorch::services::execute_run;

fn ctx<'a>(run_id: &'a str) -> StepContext<'a> {
    StepContext {
        run_id,
        node_id: "work",
        step_id: "fetch",
        channel: Some("web"),
    }
}

#[tokio::test]
async fn consecutive_failures_open_the_agent_circuit() {
    let h = harness().await;
    let agent_id = h.register_agent("web", r#"["*"]"#, None, 4).await;
    h.transport.fail_times(10);

    for _ in 0..h.kernel.settings.circuit_open_threshold {
        let target = find_capable_agent(&h.kernel, "web", "open_page", "r1")
            .await
            .unwrap()
            .expect("agent resolvable");
        let result =
            dispatch_to_agent(&h.kernel, &target, &ctx("r1"), "open_page", json!({}), None).await;
        assert!(result.is_err());
    }

    let agent = AgentInstance::find(&h.kernel.pool, &agent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        agent.consecutive_failures,
        h.kernel.settings.circuit_open_threshold
    );
    assert!(agent.circuit_open_at.is_some());

    // While the circuit is open the agent is skipped during resolution
    let resolved = find_capable_agent(&h.kernel, "web", "open_page", "r1")
        .await
        .unwrap();
    assert!(resolved.is_none());
}

#[tokio::test]
async fn threshold_minus_one_does_not_open() {
    let h = harness().await;
    let agent_id = h.register_agent("web", r#"["*"]"#, None, 4).await;
    h.transport
        .fail_times(h.kernel.settings.circuit_open_threshold as usize - 1);

    for _ in 0..h.kernel.settings.circuit_open_threshold - 1 {
        let target = find_capable_agent(&h.kernel, "web", "open_page", "r1")
            .await
            .unwrap()
            .unwrap();
        let _ =
            dispatch_to_agent(&h.kernel, &target, &ctx("r1"), "open_page", json!({}), None).await;
    }
    let agent = AgentInstance::find(&h.kernel.pool, &agent_id)
        .await
        .unwrap()
        .unwrap();
    assert!(agent.circuit_open_at.is_none());

    // A success resets the counter
    let target = find_capable_agent(&h.kernel, "web", "open_page", "r1")
        .await
        .unwrap()
        .unwrap();
    dispatch_to_agent(&h.kernel, &target, &ctx("r1"), "open_page", json!({}), None)
        .await
        .unwrap();
    let agent = AgentInstance::find(&h.kernel.pool, &agent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.consecutive_failures, 0);
}

#[tokio::test]
async fn expired_circuit_window_readmits_the_agent() {
    let h = harness().await;
    let agent_id = h.register_agent("web", r#"["*"]"#, None, 4).await;
    let reset_ms = h.kernel.settings.circuit_reset.as_millis() as i64;
    sqlx::query(
        "UPDATE agent_instances SET circuit_open_at = $1, consecutive_failures = 5 \
         WHERE agent_id = $2",
    )
    .bind(now_ms() - reset_ms - 1000)
    .bind(&agent_id)
    .execute(&h.kernel.pool)
    .await
    .unwrap();

    let resolved = find_capable_agent(&h.kernel, "web", "open_page", "r1")
        .await
        .unwrap();
    assert!(resolved.is_some());

    // The next successful dispatch clears the counter and the open marker
    let target = resolved.unwrap();
    dispatch_to_agent(&h.kernel, &target, &ctx("r1"), "open_page", json!({}), None)
        .await
        .unwrap();
    let agent = AgentInstance::find(&h.kernel.pool, &agent_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.consecutive_failures, 0);
    assert!(agent.circuit_open_at.is_none());
}

#[tokio::test]
async fn saturated_pool_emits_event_and_fails_busy() {
    let h = harness().await;
    h.register_agent("web", r#"["*"]"#, Some("browser-pool"), 1)
        .await;

    // Procedure and run exist so the pool_saturated event has a home
    let step = json!({"step_id": "fetch", "action": "open_page"});
    h.import_procedure(&single_step_ckp("busy", step)).await;
    let (run, _) = h.start_run("busy", "1.0.0", None).await;

    // Take the only lease slot
    let held = ResourceLease::try_acquire(
        &h.kernel.pool,
        h.kernel.settings.dialect,
        "browser-pool",
        1,
        "other-run",
        "n",
        "s",
        60_000,
    )
    .await
    .unwrap()
    .expect("first lease acquired");

    let target = find_capable_agent(&h.kernel, "web", "open_page", &run.run_id)
        .await
        .unwrap()
        .unwrap();
    let result = dispatch_to_agent(
        &h.kernel,
        &target,
        &StepContext {
            run_id: &run.run_id,
            node_id: "work",
            step_id: "fetch",
            channel: Some("web"),
        },
        "open_page",
        json!({}),
        None,
    )
    .await;
    assert!(matches!(result, Err(langorch::EngineError::ResourceBusy(_))));
    assert!(h
        .event_types(&run.run_id)
        .await
        .contains(&"pool_saturated".to_string()));
    assert_eq!(h.transport.dispatch_count(), 0);

    // Releasing frees the slot
    ResourceLease::release(&h.kernel.pool, &held.lease_id)
        .await
        .unwrap();
    let retry = dispatch_to_agent(
        &h.kernel,
        &target,
        &StepContext {
            run_id: &run.run_id,
            node_id: "work",
            step_id: "fetch",
            channel: Some("web"),
        },
        "open_page",
        json!({}),
        None,
    )
    .await;
    assert!(retry.is_ok());
}

#[tokio::test]
async fn lease_is_released_after_dispatch() {
    let h = harness().await;
    h.register_agent("web", r#"["*"]"#, Some("slot"), 1).await;
    let target = find_capable_agent(&h.kernel, "web", "open_page", "r1")
        .await
        .unwrap()
        .unwrap();

    dispatch_to_agent(&h.kernel, &target, &ctx("r1"), "open_page", json!({}), None)
        .await
        .unwrap();
    assert_eq!(
        ResourceLease::count_active(&h.kernel.pool, "slot")
            .await
            .unwrap(),
        0
    );

    // Released on the failure path too
    h.transport.fail_times(1);
    let _ = dispatch_to_agent(&h.kernel, &target, &ctx("r1"), "open_page", json!({}), None).await;
    assert_eq!(
        ResourceLease::count_active(&h.kernel.pool, "slot")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn expired_leases_are_reclaimed_on_acquire() {
    let h = harness().await;
    let dialect = h.kernel.settings.dialect;
    let lease = ResourceLease::try_acquire(&h.kernel.pool, dialect, "bucket", 1, "r1", "n", "s", 10)
        .await
        .unwrap()
        .expect("acquired");
    // TTL of 10ms elapses
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let second =
        ResourceLease::try_acquire(&h.kernel.pool, dialect, "bucket", 1, "r2", "n", "s", 60_000)
            .await
            .unwrap();
    assert!(second.is_some());
    assert_ne!(second.unwrap().lease_id, lease.lease_id);
}

#[tokio::test]
async fn run_sticks_to_the_first_successful_agent() {
    let h = harness().await;
    let first = h.register_agent("web", r#"["*"]"#, None, 4).await;
    let second = h.register_agent("web", r#"["*"]"#, None, 4).await;

    let target = find_capable_agent(&h.kernel, "web", "open_page", "r-aff")
        .await
        .unwrap()
        .unwrap();
    let chosen = target.agent.as_ref().unwrap().agent_id.clone();
    dispatch_to_agent(
        &h.kernel,
        &target,
        &ctx("r-aff"),
        "open_page",
        json!({}),
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        h.kernel.affinity.preferred("r-aff", "web").await.as_deref(),
        Some(chosen.as_str())
    );
    // Later resolutions for the same run prefer the pinned agent
    for _ in 0..3 {
        let resolved = find_capable_agent(&h.kernel, "web", "open_page", "r-aff")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.agent.unwrap().agent_id, chosen);
    }
    // A different run is free to pick either agent
    let other = find_capable_agent(&h.kernel, "web", "open_page", "r-other")
        .await
        .unwrap()
        .unwrap();
    let other_id = other.agent.unwrap().agent_id;
    assert!(other_id == first || other_id == second);
}

#[tokio::test]
async fn mcp_circuit_opens_and_short_circuits() {
    let h = harness().await;
    for _ in 0..h.kernel.settings.circuit_open_threshold {
        h.transport
            .push(langorch::kernel::ScriptedOutcome::Error("mcp down".into()));
        let result = langorch::dispatch::dispatch_to_mcp(
            &h.kernel,
            "http://mcp.local",
            "search",
            &json!({}),
            None,
        )
        .await;
        assert!(result.is_err());
    }
    // Circuit is open: the call fails without reaching the transport
    let before = h.transport.mcp_call_count();
    let result = langorch::dispatch::dispatch_to_mcp(
        &h.kernel,
        "http://mcp.local",
        "search",
        &json!({}),
        None,
    )
    .await;
    assert!(matches!(result, Err(langorch::EngineError::CircuitOpen(_))));
    assert_eq!(h.transport.mcp_call_count(), before);
}

#[tokio::test]
async fn explicit_mcp_binding_runs_through_a_procedure() {
    let h = harness().await;
    h.transport.push(langorch::kernel::ScriptedOutcome::Success(
        json!({"rows": [1, 2, 3]}),
    ));
    let step = json!({
        "step_id": "query", "action": "search",
        "executor": {"kind": "mcp_tool", "ref": "http://mcp.local"},
        "output_variable": "rows"
    });
    let mut ckp = single_step_ckp("mcp_flow", step);
    ckp["workflow_graph"]["nodes"]["work"]["agent"] = json!(null);
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("mcp_flow", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
    assert_eq!(h.transport.mcp_call_count(), 1);
}
