//! Orchestrator process: worker loop, leader election, and the
//! leader-gated singleton loops.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use langorch::db;
use langorch::kernel::{GatewayLlm, HttpAgentTransport, MockLlm};
use langorch::leader::{LeaderElection, LEASE_NAME};
use langorch::services;
use langorch::worker::Worker;
use langorch::{OrchestratorKernel, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        dialect = settings.dialect.as_str(),
        concurrency = settings.worker_concurrency,
        "starting orchestrator"
    );

    let pool = db::connect(&settings).await?;
    db::init_schema(&pool).await?;

    // LLM backend: the gateway client when credentials exist, otherwise a
    // local stub so procedures without llm_action nodes still run.
    let llm: Arc<dyn langorch::kernel::LlmBackend> = match llm_client::LlmClient::from_env() {
        Ok(client) => Arc::new(GatewayLlm::new(client)),
        Err(_) => {
            info!("no LLM credentials configured; llm_action nodes will use a stub backend");
            Arc::new(MockLlm::new("{}"))
        }
    };
    let transport = Arc::new(HttpAgentTransport::new());
    let kernel = Arc::new(OrchestratorKernel::new(pool, settings, llm, transport));

    let shutdown = CancellationToken::new();
    let leader = LeaderElection::new(LEASE_NAME);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        leader.clone().run(
            kernel.pool.clone(),
            kernel.settings.clone(),
            shutdown.clone(),
        ),
    ));
    tasks.push(tokio::spawn(
        Worker::new(kernel.clone()).run(shutdown.clone()),
    ));
    tasks.push(tokio::spawn(services::scheduler::run_scheduler_loop(
        kernel.clone(),
        leader.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(services::approvals::expiry_loop(
        kernel.clone(),
        leader.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(services::retention::run_retention_loop(
        kernel.clone(),
        leader.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(services::telemetry::run_metrics_push_loop(
        kernel.clone(),
        shutdown.clone(),
    )));

    // Sync trigger registrations once at boot; the scheduler loop keeps
    // them reconciled afterwards.
    match services::triggers::sync_triggers_from_procedures(&kernel).await {
        Ok(count) => info!(count, "synced trigger registrations"),
        Err(e) => tracing::warn!(error = %e, "trigger sync failed at boot"),
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("orchestrator stopped");
    Ok(())
}
