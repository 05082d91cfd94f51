//! Procedure store. Procedures are immutable `(procedure_id, version)` pairs
//! created via import and never mutated afterwards.

use sqlx::{AnyPool, FromRow};

use crate::common::time::now_ms;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, FromRow)]
pub struct Procedure {
    pub procedure_id: String,
    pub version: String,
    pub status: String,
    pub effective_date: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub ckp_json: String,
    pub trigger_config_json: Option<String>,
    pub provenance_json: Option<String>,
    pub retrieval_metadata_json: Option<String>,
    pub project_id: Option<String>,
    pub created_at: i64,
}

const PROCEDURE_COLUMNS: &str = "procedure_id, version, status, effective_date, name, \
     description, ckp_json, trigger_config_json, provenance_json, retrieval_metadata_json, \
     project_id, created_at";

pub struct NewProcedure<'a> {
    pub procedure_id: &'a str,
    pub version: &'a str,
    pub status: &'a str,
    pub effective_date: Option<&'a str>,
    pub name: &'a str,
    pub ckp_json: &'a str,
    pub trigger_config_json: Option<&'a str>,
    pub project_id: Option<&'a str>,
}

impl Procedure {
    pub async fn import(pool: &AnyPool, new: NewProcedure<'_>) -> EngineResult<Procedure> {
        sqlx::query(
            "INSERT INTO procedures (procedure_id, version, status, effective_date, name, \
             ckp_json, trigger_config_json, project_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(new.procedure_id)
        .bind(new.version)
        .bind(new.status)
        .bind(new.effective_date)
        .bind(new.name)
        .bind(new.ckp_json)
        .bind(new.trigger_config_json)
        .bind(new.project_id)
        .bind(now_ms())
        .execute(pool)
        .await?;
        Self::find(pool, new.procedure_id, new.version)
            .await?
            .ok_or_else(|| EngineError::Other("procedure vanished after import".into()))
    }

    pub async fn find(
        pool: &AnyPool,
        procedure_id: &str,
        version: &str,
    ) -> EngineResult<Option<Procedure>> {
        let proc = sqlx::query_as::<_, Procedure>(&format!(
            "SELECT {PROCEDURE_COLUMNS} FROM procedures \
             WHERE procedure_id = $1 AND version = $2"
        ))
        .bind(procedure_id)
        .bind(version)
        .fetch_optional(pool)
        .await?;
        Ok(proc)
    }

    /// Latest version by creation order when no version is pinned
    /// (subflow nodes may omit the child version).
    pub async fn find_latest(
        pool: &AnyPool,
        procedure_id: &str,
    ) -> EngineResult<Option<Procedure>> {
        let proc = sqlx::query_as::<_, Procedure>(&format!(
            "SELECT {PROCEDURE_COLUMNS} FROM procedures \
             WHERE procedure_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(procedure_id)
        .fetch_optional(pool)
        .await?;
        Ok(proc)
    }

    /// All procedures that carry a trigger config, for registration sync.
    pub async fn list_with_triggers(pool: &AnyPool) -> EngineResult<Vec<Procedure>> {
        let procs = sqlx::query_as::<_, Procedure>(&format!(
            "SELECT {PROCEDURE_COLUMNS} FROM procedures \
             WHERE trigger_config_json IS NOT NULL"
        ))
        .fetch_all(pool)
        .await?;
        Ok(procs)
    }
}
