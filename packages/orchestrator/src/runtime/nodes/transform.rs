//! Transform node: list operations over a source variable.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::compiler::ir::{IrNode, TransformPayload};
use crate::runtime::state::RunState;
use crate::runtime::walker::GraphWalker;
use crate::template::{evaluate_condition, lookup_path, render_str};

impl GraphWalker {
    pub(crate) fn execute_transform(
        &self,
        node: &IrNode,
        transform: &TransformPayload,
        mut state: RunState,
    ) -> RunState {
        for t in &transform.transformations {
            let source = state
                .vars
                .get(&t.source_variable)
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            let result = apply_transform(&t.op_type, &source, &t.expression, &t.params, &state.vars);
            state.vars.insert(t.output_variable.clone(), result);
        }
        state.next_node_id = transform.next_node_id.clone();
        state.current_node_id = node.node_id.clone();
        state
    }
}

fn items_of(source: &Value) -> Vec<Value> {
    source.as_array().cloned().unwrap_or_default()
}

fn with_item(vars: &Map<String, Value>, item: &Value) -> Map<String, Value> {
    let mut ctx = vars.clone();
    ctx.insert("item".to_string(), item.clone());
    ctx
}

pub(crate) fn apply_transform(
    op_type: &str,
    source: &Value,
    expression: &str,
    params: &Value,
    vars: &Map<String, Value>,
) -> Value {
    match op_type.to_lowercase().as_str() {
        "filter" => {
            let kept: Vec<Value> = items_of(source)
                .into_iter()
                .filter(|item| {
                    let ctx = with_item(vars, item);
                    let rendered = render_str(expression, &ctx);
                    evaluate_condition(&rendered, &ctx)
                })
                .collect();
            Value::Array(kept)
        }
        "map" => {
            let mapped: Vec<Value> = items_of(source)
                .into_iter()
                .map(|item| {
                    if expression.contains("{{") {
                        let ctx = with_item(vars, &item);
                        if expression.trim() == "{{item}}" {
                            item
                        } else {
                            Value::String(render_str(expression, &ctx))
                        }
                    } else if expression == "item" || expression.is_empty() {
                        item
                    } else if let Some(field) = item.as_object().and_then(|o| o.get(expression)) {
                        field.clone()
                    } else if expression.contains('.') {
                        let ctx = with_item(vars, &item);
                        lookup_path(&ctx, &format!("item.{expression}")).unwrap_or(item)
                    } else {
                        item
                    }
                })
                .collect();
            Value::Array(mapped)
        }
        "aggregate" => aggregate(source, expression, params),
        "sort" => {
            let key = params
                .get("key")
                .and_then(|v| v.as_str())
                .map(String::from)
                .or_else(|| (!expression.is_empty()).then(|| expression.to_string()));
            let descending = params
                .get("descending")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let mut items = items_of(source);
            items.sort_by(|a, b| {
                let left = sort_key(a, key.as_deref());
                let right = sort_key(b, key.as_deref());
                let ordering = compare_values(&left, &right);
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Value::Array(items)
        }
        "unique" => {
            let mut seen: HashSet<String> = HashSet::new();
            let unique: Vec<Value> = items_of(source)
                .into_iter()
                .filter(|item| seen.insert(canonical_json(item)))
                .collect();
            Value::Array(unique)
        }
        _ => source.clone(),
    }
}

fn aggregate(source: &Value, expression: &str, params: &Value) -> Value {
    let items = items_of(source);
    let op = params
        .get("op")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| {
            if expression.is_empty() {
                "count".to_string()
            } else {
                expression.to_string()
            }
        })
        .to_lowercase();
    let field = params.get("field").and_then(|v| v.as_str());

    let field_value = |item: &Value| -> Option<Value> {
        match field {
            Some(field) => item.as_object().and_then(|o| o.get(field)).cloned(),
            None => Some(item.clone()),
        }
    };
    let numeric = |item: &Value| -> f64 {
        field_value(item)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    };

    match op.as_str() {
        "count" => Value::from(items.len() as u64),
        "sum" => {
            let sum: f64 = items.iter().map(numeric).sum();
            if sum.fract() == 0.0 {
                Value::from(sum as i64)
            } else {
                Value::from(sum)
            }
        }
        "min" | "max" => {
            let mut values: Vec<Value> = items.iter().filter_map(field_value).collect();
            values.retain(|v| !v.is_null());
            if values.is_empty() {
                return Value::Null;
            }
            values.sort_by(compare_values);
            if op == "min" {
                values.remove(0)
            } else {
                values.pop().unwrap_or(Value::Null)
            }
        }
        _ => Value::Array(items),
    }
}

fn sort_key(item: &Value, key: Option<&str>) -> Value {
    match key {
        Some(key) => item
            .as_object()
            .and_then(|o| o.get(key))
            .cloned()
            .unwrap_or(Value::Null),
        None => item.clone(),
    }
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => {
            let l = match left {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let r = match right {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            l.cmp(&r)
        }
    }
}

/// JSON canonical form (object keys sorted recursively) for dedupe.
pub(crate) fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn filter_keeps_matching_items() {
        let source = json!([{"n": 1}, {"n": 5}, {"n": 9}]);
        let result = apply_transform("filter", &source, "{{item.n}} > 3", &json!({}), &vars());
        assert_eq!(result.as_array().unwrap().len(), 2);
    }

    #[test]
    fn map_extracts_field() {
        let source = json!([{"title": "Dune"}, {"title": "Hyperion"}]);
        let result = apply_transform("map", &source, "title", &json!({}), &vars());
        assert_eq!(result, json!(["Dune", "Hyperion"]));
    }

    #[test]
    fn map_renders_template_expression() {
        let source = json!([{"title": "Dune"}]);
        let result = apply_transform("map", &source, "book: {{item.title}}", &json!({}), &vars());
        assert_eq!(result, json!(["book: Dune"]));
    }

    #[test]
    fn aggregate_count_sum_min_max() {
        let source = json!([{"p": 3}, {"p": 1}, {"p": 7}]);
        assert_eq!(
            apply_transform("aggregate", &source, "count", &json!({}), &vars()),
            json!(3)
        );
        assert_eq!(
            apply_transform("aggregate", &source, "sum", &json!({"field": "p"}), &vars()),
            json!(11)
        );
        assert_eq!(
            apply_transform("aggregate", &source, "min", &json!({"field": "p"}), &vars()),
            json!(1)
        );
        assert_eq!(
            apply_transform("aggregate", &source, "max", &json!({"field": "p"}), &vars()),
            json!(7)
        );
    }

    #[test]
    fn sort_by_key_descending() {
        let source = json!([{"p": 3}, {"p": 1}, {"p": 7}]);
        let result = apply_transform("sort", &source, "", &json!({"key": "p", "descending": true}), &vars());
        assert_eq!(result, json!([{"p": 7}, {"p": 3}, {"p": 1}]));
    }

    #[test]
    fn sort_plain_values() {
        let source = json!([3, 1, 2]);
        let result = apply_transform("sort", &source, "", &json!({}), &vars());
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn unique_dedupes_by_canonical_form() {
        let source = json!([{"a": 1, "b": 2}, {"b": 2, "a": 1}, {"a": 3}]);
        let result = apply_transform("unique", &source, "", &json!({}), &vars());
        assert_eq!(result.as_array().unwrap().len(), 2);
    }

    #[test]
    fn unknown_op_passes_source_through() {
        let source = json!([1, 2]);
        assert_eq!(
            apply_transform("mystery", &source, "", &json!({}), &vars()),
            source
        );
    }
}
