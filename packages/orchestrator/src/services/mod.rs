// Services: the run orchestrator plus the approval, trigger, scheduler,
// retention, and telemetry loops.

pub mod approvals;
pub mod execution;
pub mod retention;
pub mod scheduler;
pub mod telemetry;
pub mod triggers;

pub use execution::execute_run;
