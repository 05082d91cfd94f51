//! Built-in internal actions (no agent required).
//!
//! Params arrive template-rendered. Actions mutate the variable map directly
//! where that is their purpose (`set_variable`, checkpoints) and return the
//! step result value.

use serde_json::{json, Map, Value};
use tracing::info;

use crate::common::id::new_id;
use crate::common::time::now_ms;
use crate::error::{EngineError, EngineResult};
use crate::template::render_str;

pub async fn execute_internal_action(
    action: &str,
    params: &Value,
    vars: &mut Map<String, Value>,
) -> EngineResult<Value> {
    match action {
        "wait" => {
            let duration_ms = params
                .get("duration_ms")
                .or_else(|| params.get("wait_ms"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
                .max(0);
            tokio::time::sleep(std::time::Duration::from_millis(duration_ms as u64)).await;
            Ok(json!({"waited_ms": duration_ms}))
        }
        "log" => {
            let message = params
                .get("message")
                .or_else(|| params.get("value"))
                .map(value_text)
                .unwrap_or_default();
            let level = params
                .get("level")
                .and_then(|v| v.as_str())
                .unwrap_or("INFO")
                .to_uppercase();
            match level.as_str() {
                "DEBUG" => tracing::debug!("[CKP] {message}"),
                "WARN" | "WARNING" => tracing::warn!("[CKP] {message}"),
                "ERROR" => tracing::error!("[CKP] {message}"),
                _ => info!("[CKP] {message}"),
            }
            Ok(Value::Null)
        }
        "set_variable" => {
            let variable = params
                .get("variable")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            if !variable.is_empty() {
                vars.insert(variable, value.clone());
            }
            Ok(value)
        }
        "calculate" => calculate(params),
        "format_data" => {
            let template = params
                .get("template")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            Ok(Value::String(render_str(template, vars)))
        }
        "parse_json" => {
            let raw = params.get("value").map(value_text).unwrap_or_default();
            serde_json::from_str(&raw)
                .map_err(|e| EngineError::Other(format!("parse_json failed: {e}")))
        }
        "parse_csv" => Ok(parse_csv(
            &params.get("value").map(value_text).unwrap_or_default(),
        )),
        "generate_id" => Ok(Value::String(new_id())),
        "get_timestamp" => Ok(Value::String(crate::common::time::ms_to_rfc3339(now_ms()))),
        "set_checkpoint" => {
            let name = params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("checkpoint")
                .to_string();
            let snapshot = json!({"name": name, "ts": now_ms()});
            let checkpoints = vars
                .entry("__checkpoints".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(map) = checkpoints.as_object_mut() {
                map.insert(name.clone(), snapshot.clone());
            }
            Ok(snapshot)
        }
        "restore_checkpoint" => {
            let name = params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("checkpoint");
            Ok(vars
                .get("__checkpoints")
                .and_then(|c| c.get(name))
                .cloned()
                .unwrap_or(Value::Null))
        }
        "screenshot" => {
            info!("[CKP] screenshot requested");
            Ok(json!({"screenshot": "placeholder"}))
        }
        // Unknown action: return params as-is for connector-style handling
        _ => Ok(json!({"action": action, "params": params})),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_of(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn calculate(params: &Value) -> EngineResult<Value> {
    let op = params
        .get("op")
        .or_else(|| params.get("operation"))
        .and_then(|v| v.as_str())
        .unwrap_or("add");
    let a = number_of(params.get("a").or_else(|| params.get("left")));
    let b = number_of(params.get("b").or_else(|| params.get("right")));
    let result = match op {
        "add" | "+" => a + b,
        "subtract" | "-" => a - b,
        "multiply" | "*" => a * b,
        "divide" | "/" => {
            if b == 0.0 {
                return Err(EngineError::Other("calculate: division by zero".into()));
            }
            a / b
        }
        other => {
            return Err(EngineError::Other(format!(
                "calculate: unknown op '{other}'"
            )))
        }
    };
    // Keep integers integral when both inputs were
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Ok(Value::from(result as i64))
    } else {
        Ok(Value::from(result))
    }
}

fn parse_csv(raw: &str) -> Value {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Value::Array(Vec::new());
    };
    let headers: Vec<&str> = header_line.split(',').map(str::trim).collect();
    let rows: Vec<Value> = lines
        .map(|line| {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            let mut row = Map::new();
            for (i, header) in headers.iter().enumerate() {
                row.insert(
                    header.to_string(),
                    Value::String(cells.get(i).unwrap_or(&"").to_string()),
                );
            }
            Value::Object(row)
        })
        .collect();
    Value::Array(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Map<String, Value> {
        Map::new()
    }

    #[tokio::test]
    async fn set_variable_writes_vars() {
        let mut vars = vars();
        let result = execute_internal_action(
            "set_variable",
            &json!({"variable": "x", "value": 42}),
            &mut vars,
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(vars["x"], 42);
    }

    #[tokio::test]
    async fn calculate_basic_ops() {
        let mut vars = vars();
        let sum = execute_internal_action("calculate", &json!({"op": "add", "a": 2, "b": 3}), &mut vars)
            .await
            .unwrap();
        assert_eq!(sum, 5);
        let quotient = execute_internal_action(
            "calculate",
            &json!({"op": "divide", "a": 7, "b": 2}),
            &mut vars,
        )
        .await
        .unwrap();
        assert_eq!(quotient, 3.5);
    }

    #[tokio::test]
    async fn calculate_divide_by_zero_fails() {
        let mut vars = vars();
        let err = execute_internal_action(
            "calculate",
            &json!({"op": "divide", "a": 1, "b": 0}),
            &mut vars,
        )
        .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn parse_json_round_trips() {
        let mut vars = vars();
        let parsed = execute_internal_action(
            "parse_json",
            &json!({"value": "{\"k\": [1, 2]}"}),
            &mut vars,
        )
        .await
        .unwrap();
        assert_eq!(parsed["k"][1], 2);
    }

    #[tokio::test]
    async fn parse_csv_uses_headers() {
        let mut vars = vars();
        let parsed = execute_internal_action(
            "parse_csv",
            &json!({"value": "title,author\nDune,Herbert\nHyperion,Simmons"}),
            &mut vars,
        )
        .await
        .unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["title"], "Dune");
        assert_eq!(parsed[1]["author"], "Simmons");
    }

    #[tokio::test]
    async fn checkpoints_set_and_restore() {
        let mut vars = vars();
        execute_internal_action("set_checkpoint", &json!({"name": "cp1"}), &mut vars)
            .await
            .unwrap();
        let restored =
            execute_internal_action("restore_checkpoint", &json!({"name": "cp1"}), &mut vars)
                .await
                .unwrap();
        assert_eq!(restored["name"], "cp1");
    }

    #[tokio::test]
    async fn unknown_action_passes_through() {
        let mut vars = vars();
        let result =
            execute_internal_action("mystery", &json!({"x": 1}), &mut vars)
                .await
                .unwrap();
        assert_eq!(result["action"], "mystery");
        assert_eq!(result["params"]["x"], 1);
    }

    #[tokio::test]
    async fn format_data_renders_template() {
        let mut vars = vars();
        vars.insert("name".into(), json!("ada"));
        let result = execute_internal_action(
            "format_data",
            &json!({"template": "hi {{name}}"}),
            &mut vars,
        )
        .await
        .unwrap();
        assert_eq!(result, "hi ada");
    }
}
