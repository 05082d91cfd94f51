//! CKP JSON -> IR parser.
//!
//! Unknown fields are ignored; missing required fields surface as compile
//! errors carrying the node id they were found under. Structural problems
//! (dangling edges, unreachable nodes) are the validator's job.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::ir::{
    GlobalConfig, IrNode, JsonMap, NodeKind, ProcedureIr, SlaConfig, TelemetryConfig,
    TriggerConfig,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default, Deserialize)]
struct CkpDocument {
    #[serde(default)]
    procedure_id: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    global_config: GlobalConfig,
    #[serde(default)]
    variables_schema: JsonMap,
    #[serde(default)]
    workflow_graph: CkpGraph,
    #[serde(default)]
    trigger: Option<TriggerConfig>,
    #[serde(default)]
    provenance: Option<Value>,
    #[serde(default)]
    retrieval_metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CkpGraph {
    #[serde(default)]
    start_node: String,
    #[serde(default)]
    nodes: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeCommon {
    #[serde(default)]
    next_node: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    checkpoint: bool,
    #[serde(default)]
    sla: Option<SlaConfig>,
    #[serde(default)]
    telemetry: TelemetryConfig,
}

/// Parse a CKP document into the typed IR.
pub fn parse_ckp(ckp: &Value) -> EngineResult<ProcedureIr> {
    if !ckp.is_object() {
        return Err(EngineError::Compile("CKP root must be a JSON object".into()));
    }
    let doc: CkpDocument = serde_json::from_value(ckp.clone())
        .map_err(|e| EngineError::Compile(format!("invalid CKP document: {e}")))?;

    let mut nodes: HashMap<String, IrNode> = HashMap::with_capacity(doc.workflow_graph.nodes.len());
    for (node_id, node_value) in &doc.workflow_graph.nodes {
        let node = parse_node(node_id, node_value)?;
        nodes.insert(node_id.clone(), node);
    }

    Ok(ProcedureIr {
        procedure_id: doc.procedure_id,
        version: doc.version,
        start_node_id: doc.workflow_graph.start_node,
        nodes,
        variables_schema: doc.variables_schema,
        global_config: doc.global_config,
        trigger: doc.trigger,
        provenance: doc.provenance,
        retrieval_metadata: doc.retrieval_metadata,
    })
}

fn parse_node(node_id: &str, value: &Value) -> EngineResult<IrNode> {
    if !value.is_object() {
        return Err(EngineError::Compile(format!(
            "node '{node_id}': must be a JSON object"
        )));
    }
    let node_type = value.get("type").and_then(|t| t.as_str()).ok_or_else(|| {
        EngineError::Compile(format!("node '{node_id}': missing 'type' discriminator"))
    })?;

    let kind: NodeKind = serde_json::from_value(value.clone()).map_err(|e| {
        EngineError::Compile(format!("node '{node_id}' (type '{node_type}'): {e}"))
    })?;
    let common: NodeCommon = serde_json::from_value(value.clone())
        .map_err(|e| EngineError::Compile(format!("node '{node_id}': {e}")))?;

    Ok(IrNode {
        node_id: node_id.to_string(),
        kind,
        next_node_id: common.next_node,
        agent: common.agent,
        checkpoint: common.checkpoint,
        sla: common.sla,
        telemetry: common.telemetry,
    })
}

/// Serialize the IR back into its CKP JSON form.
///
/// `parse_ckp(&to_ckp_value(&ir))` yields an IR equal to `ir` for any IR that
/// came out of `parse_ckp` before executor binding.
pub fn to_ckp_value(ir: &ProcedureIr) -> Value {
    let mut nodes = Map::new();
    for (node_id, node) in &ir.nodes {
        nodes.insert(node_id.clone(), node_to_value(node));
    }

    let mut root = Map::new();
    root.insert(
        "procedure_id".to_string(),
        Value::String(ir.procedure_id.clone()),
    );
    root.insert("version".to_string(), Value::String(ir.version.clone()));
    let global_config = serde_json::to_value(&ir.global_config).unwrap_or_default();
    if global_config
        .as_object()
        .map(|m| !m.is_empty())
        .unwrap_or(false)
    {
        root.insert("global_config".to_string(), global_config);
    }
    if !ir.variables_schema.is_empty() {
        root.insert(
            "variables_schema".to_string(),
            Value::Object(ir.variables_schema.clone()),
        );
    }
    let mut graph = Map::new();
    graph.insert(
        "start_node".to_string(),
        Value::String(ir.start_node_id.clone()),
    );
    graph.insert("nodes".to_string(), Value::Object(nodes));
    root.insert("workflow_graph".to_string(), Value::Object(graph));
    if let Some(trigger) = &ir.trigger {
        root.insert(
            "trigger".to_string(),
            serde_json::to_value(trigger).unwrap_or_default(),
        );
    }
    if let Some(provenance) = &ir.provenance {
        root.insert("provenance".to_string(), provenance.clone());
    }
    if let Some(metadata) = &ir.retrieval_metadata {
        root.insert("retrieval_metadata".to_string(), metadata.clone());
    }
    Value::Object(root)
}

fn node_to_value(node: &IrNode) -> Value {
    let mut map = match serde_json::to_value(&node.kind) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Some(next) = &node.next_node_id {
        map.insert("next_node".to_string(), Value::String(next.clone()));
    }
    if let Some(agent) = &node.agent {
        map.insert("agent".to_string(), Value::String(agent.clone()));
    }
    if node.checkpoint {
        map.insert("checkpoint".to_string(), Value::Bool(true));
    }
    if let Some(sla) = &node.sla {
        map.insert(
            "sla".to_string(),
            serde_json::to_value(sla).unwrap_or_default(),
        );
    }
    let telemetry = serde_json::to_value(&node.telemetry).unwrap_or_default();
    if telemetry
        .as_object()
        .map(|m| !m.is_empty())
        .unwrap_or(false)
    {
        map.insert("telemetry".to_string(), telemetry);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_ckp() -> Value {
        json!({
            "procedure_id": "books_monitor",
            "version": "1.0.0",
            "variables_schema": {"query": "rust"},
            "global_config": {"retry_policy": {"max_retries": 2}},
            "workflow_graph": {
                "start_node": "fetch",
                "nodes": {
                    "fetch": {
                        "type": "sequence",
                        "agent": "web",
                        "next_node": "route",
                        "steps": [
                            {"step_id": "s1", "action": "open_page",
                             "params": {"url": "https://example.com/{{query}}"},
                             "output_variable": "page"}
                        ]
                    },
                    "route": {
                        "type": "logic",
                        "rules": [
                            {"condition_expr": "{{page}} is_not_empty", "next_node": "done"}
                        ],
                        "default_next_node": "done"
                    },
                    "done": {"type": "terminate", "status": "success"}
                }
            },
            "trigger": {"type": "manual"}
        })
    }

    #[test]
    fn parses_sample_procedure() {
        let ir = parse_ckp(&sample_ckp()).unwrap();
        assert_eq!(ir.procedure_id, "books_monitor");
        assert_eq!(ir.start_node_id, "fetch");
        assert_eq!(ir.nodes.len(), 3);
        let fetch = &ir.nodes["fetch"];
        assert_eq!(fetch.agent.as_deref(), Some("web"));
        assert_eq!(fetch.next_node_id.as_deref(), Some("route"));
        match &fetch.kind {
            NodeKind::Sequence(seq) => {
                assert_eq!(seq.steps.len(), 1);
                assert_eq!(seq.steps[0].action, "open_page");
            }
            other => panic!("expected sequence, got {}", other.type_name()),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut ckp = sample_ckp();
        ckp["workflow_graph"]["nodes"]["done"]["mystery_field"] = json!(42);
        ckp["color"] = json!("green");
        assert!(parse_ckp(&ckp).is_ok());
    }

    #[test]
    fn missing_step_action_reports_node_path() {
        let mut ckp = sample_ckp();
        ckp["workflow_graph"]["nodes"]["fetch"]["steps"] = json!([{"step_id": "s1"}]);
        let err = parse_ckp(&ckp).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("fetch"), "got: {message}");
        assert!(message.contains("action"), "got: {message}");
    }

    #[test]
    fn unknown_node_type_is_a_compile_error() {
        let mut ckp = sample_ckp();
        ckp["workflow_graph"]["nodes"]["weird"] = json!({"type": "quantum"});
        let err = parse_ckp(&ckp).unwrap_err();
        assert!(err.to_string().contains("weird"));
    }

    #[test]
    fn missing_type_is_a_compile_error() {
        let mut ckp = sample_ckp();
        ckp["workflow_graph"]["nodes"]["weird"] = json!({"steps": []});
        let err = parse_ckp(&ckp).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn ir_round_trips_through_ckp_json() {
        let ir = parse_ckp(&sample_ckp()).unwrap();
        let serialized = to_ckp_value(&ir);
        let reparsed = parse_ckp(&serialized).unwrap();
        assert_eq!(ir, reparsed);
    }
}
