// Dispatch layer: executor resolution, agent HTTP calls with leases and
// circuit bookkeeping, MCP tool calls.

pub mod agent;
pub mod circuit;
pub mod mcp;
pub mod registry;

pub use agent::{dispatch_to_agent, StepContext};
pub use circuit::CircuitBreaker;
pub use mcp::dispatch_to_mcp;
pub use registry::{find_capable_agent, resolve_executor, AgentTarget, ResolvedExecutor};
