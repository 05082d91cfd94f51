//! Shared test harness: in-memory SQLite kernel with mock LLM and agent
//! transports.

// Each test binary uses a different subset of the harness
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use langorch::db::run::NewRun;
use langorch::db::procedure::NewProcedure;
use langorch::db::{self, Procedure, Run, RunEvent};
use langorch::kernel::{MockAgentTransport, MockLlm};
use langorch::queue::RunJob;
use langorch::{OrchestratorKernel, Settings};

pub struct TestHarness {
    pub kernel: Arc<OrchestratorKernel>,
    pub llm: Arc<MockLlm>,
    pub transport: Arc<MockAgentTransport>,
}

pub async fn harness() -> TestHarness {
    let settings = Settings::for_tests();
    let pool = db::connect(&settings).await.expect("connect test pool");
    db::init_schema(&pool).await.expect("bootstrap schema");

    let llm = Arc::new(MockLlm::new("ok"));
    let transport = Arc::new(MockAgentTransport::new());
    let kernel = Arc::new(OrchestratorKernel::new(
        pool,
        settings,
        llm.clone(),
        transport.clone(),
    ));
    TestHarness {
        kernel,
        llm,
        transport,
    }
}

impl TestHarness {
    /// Import a CKP document as an active procedure.
    pub async fn import_procedure(&self, ckp: &Value) -> Procedure {
        let procedure_id = ckp["procedure_id"].as_str().expect("procedure_id");
        let version = ckp["version"].as_str().expect("version");
        let trigger_json = ckp.get("trigger").map(|t| t.to_string());
        Procedure::import(
            &self.kernel.pool,
            NewProcedure {
                procedure_id,
                version,
                status: "active",
                effective_date: None,
                name: procedure_id,
                ckp_json: &ckp.to_string(),
                trigger_config_json: trigger_json.as_deref(),
                project_id: None,
            },
        )
        .await
        .expect("import procedure")
    }

    /// Create a run (with its queued job) for a procedure version.
    pub async fn start_run(
        &self,
        procedure_id: &str,
        version: &str,
        input_vars: Option<Value>,
    ) -> (Run, RunJob) {
        let run = Run::create(
            &self.kernel.pool,
            NewRun {
                procedure_id,
                procedure_version: version,
                input_vars: input_vars.as_ref(),
                trigger_type: Some("manual"),
                triggered_by: Some("tests"),
                parent_run_id: None,
                project_id: None,
            },
        )
        .await
        .expect("create run");
        let job = RunJob::enqueue(
            &self.kernel.pool,
            &run.run_id,
            0,
            self.kernel.settings.worker_max_attempts,
        )
        .await
        .expect("enqueue job");
        (run, job)
    }

    pub async fn run_status(&self, run_id: &str) -> String {
        Run::find(&self.kernel.pool, run_id)
            .await
            .expect("find run")
            .expect("run exists")
            .status
    }

    pub async fn event_types(&self, run_id: &str) -> Vec<String> {
        RunEvent::list_for_run(&self.kernel.pool, run_id)
            .await
            .expect("list events")
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// Register an online agent and return its id.
    pub async fn register_agent(
        &self,
        channel: &str,
        capabilities: &str,
        resource_key: Option<&str>,
        concurrency_limit: i64,
    ) -> String {
        langorch::db::AgentInstance::register(
            &self.kernel.pool,
            &format!("{channel}-agent"),
            channel,
            &format!("http://{channel}.agents.local:7001"),
            capabilities,
            concurrency_limit,
            resource_key,
            None,
        )
        .await
        .expect("register agent")
        .agent_id
    }
}

/// Two-node procedure: one sequence step, then terminate.
pub fn single_step_ckp(procedure_id: &str, step: Value) -> Value {
    json!({
        "procedure_id": procedure_id,
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "work",
            "nodes": {
                "work": {
                    "type": "sequence",
                    "agent": "web",
                    "next_node": "done",
                    "steps": [step]
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    })
}
