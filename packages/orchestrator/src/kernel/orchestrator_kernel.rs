// OrchestratorKernel - core infrastructure with all dependencies
//
// Holds the pool, settings, metrics, cancellation registry, affinity cache,
// circuit breakers, and the LLM/agent trait objects. Everything long-lived
// is constructed once at startup and passed by reference; no globals.

use std::sync::Arc;

use sqlx::AnyPool;

use super::affinity::AgentAffinity;
use super::traits::{AgentTransport, LlmBackend};
use crate::config::Settings;
use crate::dispatch::circuit::CircuitBreaker;
use crate::metrics::MetricsCollector;
use crate::runtime::cancel::CancellationRegistry;

pub struct OrchestratorKernel {
    pub pool: AnyPool,
    pub settings: Settings,
    pub metrics: MetricsCollector,
    pub cancellations: CancellationRegistry,
    pub affinity: AgentAffinity,
    /// Circuit state for LLM endpoints.
    pub llm_circuit: CircuitBreaker,
    /// Circuit state for MCP endpoints.
    pub mcp_circuit: CircuitBreaker,
    pub llm: Arc<dyn LlmBackend>,
    pub transport: Arc<dyn AgentTransport>,
    /// Client for alert webhooks and the Pushgateway.
    pub http: reqwest::Client,
}

impl OrchestratorKernel {
    pub fn new(
        pool: AnyPool,
        settings: Settings,
        llm: Arc<dyn LlmBackend>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let llm_circuit =
            CircuitBreaker::new(settings.circuit_open_threshold, settings.circuit_reset);
        let mcp_circuit =
            CircuitBreaker::new(settings.circuit_open_threshold, settings.circuit_reset);
        Self {
            pool,
            settings,
            metrics: MetricsCollector::new(),
            cancellations: CancellationRegistry::new(),
            affinity: AgentAffinity::new(),
            llm_circuit,
            mcp_circuit,
            llm,
            transport,
            http: reqwest::Client::new(),
        }
    }
}
