// Kernel - core infrastructure with dependency injection
//
// The OrchestratorKernel holds all process dependencies (database, LLM and
// agent transports, metrics, circuit and cancellation state) and provides
// access via traits for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not node semantics.

pub mod affinity;
pub mod llm;
pub mod orchestrator_kernel;
pub mod testing;
pub mod traits;
pub mod transport;

pub use affinity::AgentAffinity;
pub use llm::GatewayLlm;
pub use orchestrator_kernel::OrchestratorKernel;
pub use testing::{MockAgentTransport, MockLlm, ScriptedOutcome};
pub use traits::*;
pub use transport::HttpAgentTransport;
