//! LangOrch execution substrate.
//!
//! Durable, HA-aware orchestration of CKP procedures: a compiler from CKP
//! JSON to a typed graph IR, a graph executor with per-node-type semantics,
//! a dialect-aware durable job queue, DB-backed leader election, and the
//! dispatch plumbing (agents, MCP tools, LLM endpoints) with circuit
//! breakers and resource leases.
//!
//! # Architecture
//!
//! ```text
//! trigger / API            worker loop (N slots)
//!      │                        │ claim (SKIP LOCKED / optimistic)
//!      ▼                        ▼
//!  runs + run_jobs ──────► execute_run
//!                               │ compile CKP → IR → validate → bind
//!                               ▼
//!                          GraphWalker ──► node executors
//!                               │              │ dispatch: internal /
//!                               │              │ agent HTTP / MCP / LLM
//!                               ▼              ▼
//!                         run_events      step_idempotency, artifacts
//! ```

pub mod common;
pub mod compiler;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod services;
pub mod template;
pub mod worker;

pub use config::{DbDialect, Settings};
pub use error::{EngineError, EngineResult};
pub use kernel::OrchestratorKernel;
