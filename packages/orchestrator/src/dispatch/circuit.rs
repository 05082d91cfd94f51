//! Per-endpoint in-process circuit breaker.
//!
//! Used for LLM and MCP endpoints; agent circuits live on the registry rows
//! instead so every worker process sees them. A success before the threshold
//! resets the counter; an open circuit auto-resets after the reset window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default, Clone)]
struct EndpointState {
    consecutive_failures: i64,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: i64,
    reset_window: Duration,
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: i64, reset_window: Duration) -> Self {
        Self {
            threshold,
            reset_window,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Fail fast when the endpoint's circuit is open. An elapsed reset
    /// window closes the circuit and clears the counter.
    pub fn check(&self, endpoint: &str) -> EngineResult<()> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        let state = endpoints.entry(endpoint.to_string()).or_default();
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() >= self.reset_window {
                state.opened_at = None;
                state.consecutive_failures = 0;
            } else {
                return Err(EngineError::CircuitOpen(endpoint.to_string()));
            }
        }
        Ok(())
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = endpoints.get_mut(endpoint) {
            state.consecutive_failures = 0;
            state.opened_at = None;
        }
    }

    /// Record a failure; returns true when this failure opened the circuit.
    pub fn record_failure(&self, endpoint: &str) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        let state = endpoints.entry(endpoint.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    pub fn is_open(&self, endpoint: &str) -> bool {
        self.check(endpoint).is_err()
    }

    #[cfg(test)]
    fn force_open_at(&self, endpoint: &str, opened_at: Instant) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        let state = endpoints.entry(endpoint.to_string()).or_default();
        state.opened_at = Some(opened_at);
    }
}
