//! Trigger registration, webhook verification and dedupe, and firing.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::compiler::ir::TriggerConfig;
use crate::db::{Procedure, Run, TriggerDedupeRecord, TriggerRegistration};
use crate::db::run::NewRun;
use crate::db::trigger::TriggerSpec;
use crate::error::{EngineError, EngineResult};
use crate::kernel::OrchestratorKernel;
use crate::queue::RunJob;

/// Register (or refresh) the trigger for a procedure version from its
/// parsed CKP trigger block.
pub async fn register_trigger(
    kernel: &Arc<OrchestratorKernel>,
    procedure_id: &str,
    version: &str,
    trigger: &TriggerConfig,
) -> EngineResult<TriggerRegistration> {
    TriggerRegistration::upsert(
        &kernel.pool,
        procedure_id,
        version,
        TriggerSpec {
            trigger_type: &trigger.trigger_type,
            schedule: trigger.schedule.as_deref(),
            webhook_secret: trigger.webhook_secret.as_deref(),
            event_source: trigger.event_source.as_deref(),
            dedupe_window_seconds: trigger.dedupe_window_seconds,
            max_concurrent_runs: trigger.max_concurrent_runs,
            enabled: true,
        },
    )
    .await
}

/// Reconcile procedure trigger configs into registrations. Returns the
/// number of registrations created or refreshed.
pub async fn sync_triggers_from_procedures(
    kernel: &Arc<OrchestratorKernel>,
) -> EngineResult<usize> {
    let procedures = Procedure::list_with_triggers(&kernel.pool).await?;
    let mut synced = 0usize;
    for proc in procedures {
        let Some(raw) = &proc.trigger_config_json else {
            continue;
        };
        let trigger: TriggerConfig = match serde_json::from_str(raw) {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!(
                    procedure_id = %proc.procedure_id,
                    version = %proc.version,
                    error = %e,
                    "skipping unparseable trigger config"
                );
                continue;
            }
        };
        if trigger.trigger_type == "manual" {
            continue;
        }
        register_trigger(kernel, &proc.procedure_id, &proc.version, &trigger).await?;
        synced += 1;
    }
    Ok(synced)
}

/// Create a run for a trigger firing and enqueue its job. Enforces the
/// registration's `max_concurrent_runs`.
pub async fn fire_trigger(
    kernel: &Arc<OrchestratorKernel>,
    procedure_id: &str,
    version: &str,
    trigger_type: &str,
    triggered_by: &str,
    input_vars: Option<&Value>,
) -> EngineResult<Run> {
    let registration = TriggerRegistration::find(&kernel.pool, procedure_id, version).await?;
    if let Some(max_concurrent) = registration.as_ref().and_then(|r| r.max_concurrent_runs) {
        let active = Run::count_active(&kernel.pool, procedure_id, version).await?;
        if active >= max_concurrent {
            return Err(EngineError::Other(format!(
                "max_concurrent_runs ({max_concurrent}) reached for \
                 {procedure_id} v{version}; trigger dropped"
            )));
        }
    }

    let project_id = Procedure::find(&kernel.pool, procedure_id, version)
        .await?
        .and_then(|p| p.project_id);

    let run = Run::create(
        &kernel.pool,
        NewRun {
            procedure_id,
            procedure_version: version,
            input_vars,
            trigger_type: Some(trigger_type),
            triggered_by: Some(triggered_by),
            parent_run_id: None,
            project_id: project_id.as_deref(),
        },
    )
    .await?;
    RunJob::enqueue(
        &kernel.pool,
        &run.run_id,
        0,
        kernel.settings.worker_max_attempts,
    )
    .await?;
    info!(
        run_id = %run.run_id,
        procedure_id,
        version,
        trigger_type,
        "trigger fired"
    );
    Ok(run)
}

// ── Webhook verification and dedupe ─────────────────────────────

pub fn compute_payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Verify a webhook signature header of the form `sha256=<hex>`, where the
/// digest is `sha256(secret || body)` and the secret is read from the
/// environment variable named by the registration. An unset secret allows
/// all (dev mode); comparison is constant-time via digest equality.
pub fn verify_webhook_signature(
    body: &[u8],
    header_signature: Option<&str>,
    secret_env_var: &str,
) -> bool {
    let secret = std::env::var(secret_env_var).unwrap_or_default();
    if secret.is_empty() {
        warn!(
            secret_env_var,
            "no webhook secret configured; skipping signature check"
        );
        return true;
    }
    let Some(header_signature) = header_signature else {
        return false;
    };
    let signature = header_signature
        .strip_prefix("sha256=")
        .unwrap_or(header_signature);

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    let expected = hex::encode(hasher.finalize());

    // Compare digests of both sides so the comparison cost is independent
    // of where the strings differ
    Sha256::digest(signature.as_bytes()) == Sha256::digest(expected.as_bytes())
}

pub struct WebhookOutcome {
    pub run_id: String,
    pub deduplicated: bool,
}

/// Handle a webhook delivery: verify the signature, dedupe the payload
/// within the registration window, and fire the trigger.
pub async fn handle_webhook(
    kernel: &Arc<OrchestratorKernel>,
    procedure_id: &str,
    version: &str,
    body: &[u8],
    signature_header: Option<&str>,
    input_vars: Option<&Value>,
) -> EngineResult<WebhookOutcome> {
    let registration = TriggerRegistration::find(&kernel.pool, procedure_id, version)
        .await?
        .ok_or_else(|| {
            EngineError::Other(format!(
                "no trigger registration for {procedure_id} v{version}"
            ))
        })?;
    if !registration.is_enabled() || registration.trigger_type != "webhook" {
        return Err(EngineError::Other(format!(
            "trigger for {procedure_id} v{version} is not an enabled webhook"
        )));
    }

    if let Some(secret_env) = registration.webhook_secret.as_deref() {
        if !verify_webhook_signature(body, signature_header, secret_env) {
            return Err(EngineError::Other("webhook signature mismatch".into()));
        }
    }

    let payload_hash = compute_payload_hash(body);
    if let Some(existing_run_id) = TriggerDedupeRecord::find_within_window(
        &kernel.pool,
        procedure_id,
        &payload_hash,
        registration.dedupe_window_seconds,
    )
    .await?
    {
        info!(
            procedure_id,
            run_id = %existing_run_id,
            "duplicate webhook payload within dedupe window"
        );
        return Ok(WebhookOutcome {
            run_id: existing_run_id,
            deduplicated: true,
        });
    }

    let run = fire_trigger(
        kernel,
        procedure_id,
        version,
        "webhook",
        "webhook",
        input_vars,
    )
    .await?;
    TriggerDedupeRecord::record(&kernel.pool, procedure_id, &payload_hash, &run.run_id).await?;
    Ok(WebhookOutcome {
        run_id: run.run_id,
        deduplicated: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_sha256_hex() {
        let hash = compute_payload_hash(b"hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn signature_verifies_with_secret() {
        std::env::set_var("TEST_WEBHOOK_SECRET_A", "s3cret");
        let body = b"payload";
        let mut hasher = Sha256::new();
        hasher.update(b"s3cret");
        hasher.update(body);
        let signature = format!("sha256={}", hex::encode(hasher.finalize()));
        assert!(verify_webhook_signature(
            body,
            Some(&signature),
            "TEST_WEBHOOK_SECRET_A"
        ));
        assert!(!verify_webhook_signature(
            body,
            Some("sha256=deadbeef"),
            "TEST_WEBHOOK_SECRET_A"
        ));
        assert!(!verify_webhook_signature(body, None, "TEST_WEBHOOK_SECRET_A"));
    }

    #[test]
    fn missing_secret_allows_all() {
        assert!(verify_webhook_signature(
            b"anything",
            None,
            "TEST_WEBHOOK_SECRET_UNSET"
        ));
    }
}
