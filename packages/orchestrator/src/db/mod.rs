// Persistence layer: pool bootstrap plus FromRow models with their queries.
//
// All SQL is hand-written with `$N` placeholders in strict first-use order,
// which binds identically on PostgreSQL and SQLite through the Any driver.
// Timestamps are UTC epoch milliseconds; JSON columns are serialized TEXT.

pub mod agent;
pub mod approval;
pub mod pool;
pub mod procedure;
pub mod run;
pub mod step;
pub mod trigger;

pub use agent::{AgentInstance, ResourceLease};
pub use approval::Approval;
pub use pool::{connect, init_schema};
pub use procedure::Procedure;
pub use run::{Artifact, Run, RunEvent};
pub use step::StepIdempotency;
pub use trigger::{TriggerDedupeRecord, TriggerRegistration};
