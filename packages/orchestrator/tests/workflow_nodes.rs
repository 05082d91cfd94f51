//! Node-type semantics through full runs: logic, loop, parallel, transform,
//! verification, processing, llm_action, subflow.

mod common;

use common::*;
use serde_json::json;

use langorch::db::Run;
use langorch::services::execute_run;

async fn output_vars(h: &TestHarness, run_id: &str) -> serde_json::Value {
    serde_json::from_str(
        Run::find(&h.kernel.pool, run_id)
            .await
            .unwrap()
            .unwrap()
            .output_vars_json
            .as_deref()
            .unwrap_or("{}"),
    )
    .unwrap()
}

#[tokio::test]
async fn logic_routes_on_rendered_conditions() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "router",
        "version": "1.0.0",
        "variables_schema": {"count": 0},
        "workflow_graph": {
            "start_node": "route",
            "nodes": {
                "route": {
                    "type": "logic",
                    "rules": [
                        {"condition_expr": "{{count}} > 3", "next_node": "big"},
                        {"condition_expr": "{{count}} > 0", "next_node": "small"}
                    ],
                    "default_next_node": "none"
                },
                "big": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "bucket", "value": "big"}}
                ]},
                "small": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "bucket", "value": "small"}}
                ]},
                "none": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "bucket", "value": "none"}}
                ]},
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;

    for (count, expected) in [(5, "big"), (2, "small"), (0, "none")] {
        let (run, _) = h
            .start_run("router", "1.0.0", Some(json!({"count": count})))
            .await;
        execute_run(&h.kernel, &run.run_id).await.unwrap();
        assert_eq!(h.run_status(&run.run_id).await, "completed");
        assert_eq!(output_vars(&h, &run.run_id).await["bucket"], expected);
    }
}

#[tokio::test]
async fn loop_iterates_the_collection_and_exits() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "looper",
        "version": "1.0.0",
        "variables_schema": {"titles": []},
        "workflow_graph": {
            "start_node": "each",
            "nodes": {
                "each": {
                    "type": "loop",
                    "iterator_var": "titles",
                    "iterator_variable": "title",
                    "index_variable": "i",
                    "body_node": "handle",
                    "next_node": "done"
                },
                "handle": {
                    "type": "sequence",
                    "next_node": "each",
                    "steps": [
                        {"step_id": "note", "action": "format_data",
                         "params": {"template": "{{i}}:{{title}}"},
                         "output_variable": "last_seen"}
                    ]
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h
        .start_run("looper", "1.0.0", Some(json!({"titles": ["dune", "hyperion"]})))
        .await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
    let outputs = output_vars(&h, &run.run_id).await;
    assert_eq!(outputs["last_seen"], "1:hyperion");

    // The body ran fresh once per item (iteration-scoped idempotency)
    let starts = h
        .event_types(&run.run_id)
        .await
        .into_iter()
        .filter(|e| e == "step_started")
        .count();
    assert_eq!(starts, 2);
}

#[tokio::test]
async fn parallel_merges_branch_deltas() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "fanout",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "fork",
            "nodes": {
                "fork": {
                    "type": "parallel",
                    "branches": [
                        {"branch_id": "left", "start_node": "set_left"},
                        {"branch_id": "right", "start_node": "set_right"}
                    ],
                    "next_node": "done",
                    "wait_strategy": "all",
                    "branch_failure": "continue"
                },
                "set_left": {"type": "processing", "operations": [
                    {"action": "set_variable", "params": {"variable": "left_val", "value": 1}}
                ]},
                "set_right": {"type": "processing", "operations": [
                    {"action": "set_variable", "params": {"variable": "right_val", "value": 2}}
                ]},
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("fanout", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
    let outputs = output_vars(&h, &run.run_id).await;
    assert_eq!(outputs["left_val"], 1);
    assert_eq!(outputs["right_val"], 2);
    assert!(outputs["parallel_results"]["branches"]["left"].is_object());
    assert!(outputs["parallel_results"]["branches"]["right"].is_object());
}

#[tokio::test]
async fn parallel_any_completes_despite_a_failing_branch() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "fanout_any",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "fork",
            "nodes": {
                "fork": {
                    "type": "parallel",
                    "branches": [
                        {"branch_id": "bad", "start_node": "explode"},
                        {"branch_id": "good", "start_node": "set_ok"}
                    ],
                    "next_node": "done",
                    "wait_strategy": "any",
                    "branch_failure": "continue"
                },
                "explode": {
                    "type": "verification",
                    "checks": [{"condition": "false", "on_fail": "fail_workflow",
                                "message": "always fails"}]
                },
                "set_ok": {"type": "processing", "operations": [
                    {"action": "set_variable", "params": {"variable": "ok", "value": true}}
                ]},
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("fanout_any", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
}

#[tokio::test]
async fn parallel_fail_fast_fails_the_run() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "fanout_strict",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "fork",
            "nodes": {
                "fork": {
                    "type": "parallel",
                    "branches": [
                        {"branch_id": "bad", "start_node": "explode"},
                        {"branch_id": "good", "start_node": "set_ok"}
                    ],
                    "next_node": "done",
                    "wait_strategy": "all",
                    "branch_failure": "fail"
                },
                "explode": {
                    "type": "verification",
                    "checks": [{"condition": "false", "on_fail": "fail_workflow",
                                "message": "always fails"}]
                },
                "set_ok": {"type": "processing", "operations": [
                    {"action": "set_variable", "params": {"variable": "ok", "value": true}}
                ]},
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("fanout_strict", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "failed");
}

#[tokio::test]
async fn transform_pipeline_filters_maps_and_aggregates() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "shaper",
        "version": "1.0.0",
        "variables_schema": {"books": []},
        "workflow_graph": {
            "start_node": "shape",
            "nodes": {
                "shape": {
                    "type": "transform",
                    "next_node": "done",
                    "transformations": [
                        {"type": "filter", "source_variable": "books",
                         "output_variable": "cheap",
                         "expression": "{{item.price}} < 20"},
                        {"type": "map", "source_variable": "cheap",
                         "output_variable": "cheap_titles", "expression": "title"},
                        {"type": "aggregate", "source_variable": "cheap",
                         "output_variable": "cheap_count", "expression": "count"},
                        {"type": "sort", "source_variable": "books",
                         "output_variable": "by_price",
                         "params": {"key": "price"}},
                        {"type": "unique", "source_variable": "cheap_titles",
                         "output_variable": "unique_titles"}
                    ]
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let books = json!([
        {"title": "Dune", "price": 15},
        {"title": "Hyperion", "price": 25},
        {"title": "Dune", "price": 12}
    ]);
    let (run, _) = h
        .start_run("shaper", "1.0.0", Some(json!({"books": books})))
        .await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
    let outputs = output_vars(&h, &run.run_id).await;
    assert_eq!(outputs["cheap_count"], 2);
    assert_eq!(outputs["cheap_titles"], json!(["Dune", "Dune"]));
    assert_eq!(outputs["unique_titles"], json!(["Dune"]));
    assert_eq!(outputs["by_price"][0]["price"], 12);
}

#[tokio::test]
async fn verification_failure_fails_the_workflow() {
    let h = harness().await;
    let ckp = json!({
        "procedure_id": "checked",
        "version": "1.0.0",
        "variables_schema": {"count": 0},
        "workflow_graph": {
            "start_node": "verify",
            "nodes": {
                "verify": {
                    "type": "verification",
                    "next_node": "done",
                    "checks": [
                        {"id": "has_items", "condition": "{{count}} > 0",
                         "on_fail": "fail_workflow", "message": "no items found"}
                    ]
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;

    let (failing, _) = h
        .start_run("checked", "1.0.0", Some(json!({"count": 0})))
        .await;
    execute_run(&h.kernel, &failing.run_id).await.unwrap();
    assert_eq!(h.run_status(&failing.run_id).await, "failed");
    let reloaded = Run::find(&h.kernel.pool, &failing.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.error_message.as_deref(), Some("no items found"));

    let (passing, _) = h
        .start_run("checked", "1.0.0", Some(json!({"count": 3})))
        .await;
    execute_run(&h.kernel, &passing.run_id).await.unwrap();
    assert_eq!(h.run_status(&passing.run_id).await, "completed");
}

#[tokio::test]
async fn llm_action_accumulates_tokens_and_maps_outputs() {
    let h = harness().await;
    h.llm.push_text(r#"{"summary": "two books found"}"#, 120, 30);

    let ckp = json!({
        "procedure_id": "summarize",
        "version": "1.0.0",
        "variables_schema": {"query": "books"},
        "workflow_graph": {
            "start_node": "ask",
            "nodes": {
                "ask": {
                    "type": "llm_action",
                    "model": "gpt-4o",
                    "prompt": "Summarize results for {{query}}",
                    "json_mode": true,
                    "outputs": {"summary": "json:summary", "raw_text": "text"},
                    "next_node": "done"
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("summarize", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");

    let reloaded = Run::find(&h.kernel.pool, &run.run_id).await.unwrap().unwrap();
    assert_eq!(reloaded.total_prompt_tokens, 120);
    assert_eq!(reloaded.total_completion_tokens, 30);
    assert!(reloaded.estimated_cost_usd > 0.0);
    assert!(h
        .event_types(&run.run_id)
        .await
        .contains(&"llm_usage".to_string()));

    let outputs = output_vars(&h, &run.run_id).await;
    assert_eq!(outputs["summary"], "two books found");
    assert_eq!(outputs["raw_text"], r#"{"summary": "two books found"}"#);
}

#[tokio::test]
async fn orchestration_mode_routes_on_next_node() {
    let h = harness().await;
    h.llm.push_text(r#"{"_next_node": "path_b"}"#, 10, 5);

    let ckp = json!({
        "procedure_id": "delegator",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "decide",
            "nodes": {
                "decide": {
                    "type": "llm_action",
                    "model": "gpt-4o",
                    "prompt": "Pick a path",
                    "orchestration_mode": true,
                    "branches": ["path_a", "path_b"]
                },
                "path_a": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "path", "value": "a"}}
                ]},
                "path_b": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "path", "value": "b"}}
                ]},
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("delegator", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(output_vars(&h, &run.run_id).await["path"], "b");
}

#[tokio::test]
async fn orchestration_mode_falls_back_to_first_branch() {
    let h = harness().await;
    h.llm.push_text("not json at all", 10, 5);

    let ckp = json!({
        "procedure_id": "delegator_fallback",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "decide",
            "nodes": {
                "decide": {
                    "type": "llm_action",
                    "model": "gpt-4o",
                    "prompt": "Pick a path",
                    "orchestration_mode": true,
                    "branches": ["path_a", "path_b"]
                },
                "path_a": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "path", "value": "a"}}
                ]},
                "path_b": {"type": "processing", "next_node": "done", "operations": [
                    {"action": "set_variable", "params": {"variable": "path", "value": "b"}}
                ]},
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&ckp).await;
    let (run, _) = h.start_run("delegator_fallback", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(output_vars(&h, &run.run_id).await["path"], "a");
}

#[tokio::test]
async fn subflow_maps_inputs_and_outputs() {
    let h = harness().await;
    let child = json!({
        "procedure_id": "child_counter",
        "version": "1.0.0",
        "variables_schema": {"items": []},
        "workflow_graph": {
            "start_node": "count",
            "nodes": {
                "count": {
                    "type": "transform",
                    "next_node": "finish",
                    "transformations": [
                        {"type": "aggregate", "source_variable": "items",
                         "output_variable": "item_count", "expression": "count"}
                    ]
                },
                "finish": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&child).await;

    let parent = json!({
        "procedure_id": "parent_flow",
        "version": "1.0.0",
        "variables_schema": {"book_titles": []},
        "workflow_graph": {
            "start_node": "delegate",
            "nodes": {
                "delegate": {
                    "type": "subflow",
                    "procedure_id": "child_counter",
                    "version": "1.0.0",
                    "input_mapping": {"items": "book_titles"},
                    "output_mapping": {"total": "item_count"},
                    "next_node": "done"
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&parent).await;
    let (run, _) = h
        .start_run(
            "parent_flow",
            "1.0.0",
            Some(json!({"book_titles": ["a", "b", "c"]})),
        )
        .await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
    assert_eq!(output_vars(&h, &run.run_id).await["total"], 3);
    let events = h.event_types(&run.run_id).await;
    assert!(events.contains(&"subflow_started".to_string()));
    assert!(events.contains(&"subflow_completed".to_string()));
}

#[tokio::test]
async fn repeated_subflow_invocations_do_not_share_idempotency() {
    let h = harness().await;
    let child = json!({
        "procedure_id": "child_stamper",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "emit",
            "nodes": {
                "emit": {
                    "type": "sequence",
                    "next_node": "finish",
                    "steps": [{"step_id": "mark", "action": "generate_id",
                               "output_variable": "child_token"}]
                },
                "finish": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&child).await;

    // The same child is invoked once per loop iteration
    let parent = json!({
        "procedure_id": "parent_repeats",
        "version": "1.0.0",
        "variables_schema": {"rounds": []},
        "workflow_graph": {
            "start_node": "each",
            "nodes": {
                "each": {
                    "type": "loop",
                    "iterator_var": "rounds",
                    "iterator_variable": "round",
                    "body_node": "call_child",
                    "next_node": "done"
                },
                "call_child": {
                    "type": "subflow",
                    "procedure_id": "child_stamper",
                    "version": "1.0.0",
                    "output_mapping": {"token": "child_token"},
                    "next_node": "each"
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&parent).await;
    let (run, _) = h
        .start_run("parent_repeats", "1.0.0", Some(json!({"rounds": [1, 2]})))
        .await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");

    // The child step executed fresh on every invocation instead of
    // replaying the first invocation's cached result
    let events = langorch::db::RunEvent::list_for_run(&h.kernel.pool, &run.run_id)
        .await
        .unwrap();
    let child_starts = events
        .iter()
        .filter(|e| e.event_type == "step_started" && e.step_id.as_deref() == Some("mark"))
        .count();
    assert_eq!(child_starts, 2);
    assert_eq!(
        h.kernel.metrics.counter(
            "step_execution_total",
            &[("node_id", "emit"), ("status", "cached")]
        ),
        0
    );
    assert_eq!(
        h.kernel.metrics.counter(
            "step_execution_total",
            &[("node_id", "emit"), ("status", "completed")]
        ),
        2
    );
}

#[tokio::test]
async fn failing_subflow_propagates_by_default() {
    let h = harness().await;
    let child = json!({
        "procedure_id": "child_fails",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "check",
            "nodes": {
                "check": {
                    "type": "verification",
                    "checks": [{"condition": "false", "message": "child broke"}]
                }
            }
        }
    });
    h.import_procedure(&child).await;

    let parent = json!({
        "procedure_id": "parent_strict",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "delegate",
            "nodes": {
                "delegate": {
                    "type": "subflow",
                    "procedure_id": "child_fails",
                    "version": "1.0.0",
                    "next_node": "done"
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&parent).await;
    let (run, _) = h.start_run("parent_strict", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "failed");
}

#[tokio::test]
async fn failing_subflow_with_continue_proceeds() {
    let h = harness().await;
    let child = json!({
        "procedure_id": "child_fails_soft",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "check",
            "nodes": {
                "check": {
                    "type": "verification",
                    "checks": [{"condition": "false", "message": "child broke"}]
                }
            }
        }
    });
    h.import_procedure(&child).await;

    let parent = json!({
        "procedure_id": "parent_soft",
        "version": "1.0.0",
        "workflow_graph": {
            "start_node": "delegate",
            "nodes": {
                "delegate": {
                    "type": "subflow",
                    "procedure_id": "child_fails_soft",
                    "version": "1.0.0",
                    "on_failure": "continue",
                    "next_node": "done"
                },
                "done": {"type": "terminate", "status": "success"}
            }
        }
    });
    h.import_procedure(&parent).await;
    let (run, _) = h.start_run("parent_soft", "1.0.0", None).await;

    execute_run(&h.kernel, &run.run_id).await.unwrap();
    assert_eq!(h.run_status(&run.run_id).await, "completed");
}
