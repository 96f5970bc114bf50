use super::*;
use crate::config::{PollConfig, RetryConfig};
use crate::error::DefinitionError;
use crate::queue::Queue;
use crate::store::schema::{step_key, STEP_STATES_TABLE};
use crate::types::{StepStatus, TaskId, TaskStatus};
use crate::workflow::StepSpec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn test_config(max_attempts: u32) -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_attempts,
            base_delay_secs: 0,
            max_delay_secs: 0,
        },
        poll: PollConfig {
            max_poll_ms: 20,
            poll_interval_ms: 5,
            visibility_timeout_secs: 30,
        },
        task_timeout_secs: 30,
    }
}

fn engine() -> FlowEngine {
    FlowEngine::new(RedbStore::in_memory().unwrap(), test_config(3))
}

/// Claim and execute tasks until the run leaves `running`
async fn drive<F>(engine: &FlowEngine, run_id: &RunId, mut handler: F) -> Run
where
    F: FnMut(&ClaimedTask) -> std::result::Result<Value, String>,
{
    let run = engine.store().get_run(run_id).unwrap().unwrap();
    let queue = run.workflow_slug.0.clone();
    for _ in 0..1_000 {
        let run = engine.store().get_run(run_id).unwrap().unwrap();
        if run.status.is_terminal() {
            return run;
        }
        for task in engine.start_tasks(&queue, 10).await.unwrap() {
            match handler(&task) {
                Ok(output) => {
                    engine.complete_task(&task.id, output).unwrap();
                }
                Err(error) => {
                    engine.fail_task(&task.id, &error).unwrap();
                }
            }
        }
    }
    panic!("run {} did not finish", run_id);
}

#[tokio::test]
async fn test_linear_chain_passes_outputs_forward() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("chain")
        .step(StepSpec::new("double", "double"))
        .step(StepSpec::new("add_ten", "add_ten").depends_on(["double"]))
        .step(StepSpec::new("stringify", "stringify").depends_on(["add_ten"]));
    let run_id = engine.run_definition(workflow, json!({"x": 1})).unwrap();

    let run = drive(&engine, &run_id, |task| {
        let input = &task.input;
        match task.id.step_slug.as_str() {
            "double" => Ok(json!(input["run"]["x"].as_i64().unwrap() * 2)),
            "add_ten" => Ok(json!(input["double"].as_i64().unwrap() + 10)),
            "stringify" => Ok(json!(input["add_ten"].to_string())),
            other => Err(format!("unexpected step {}", other)),
        }
    })
    .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("12")));
    assert_eq!(run.remaining_steps, 0);
    assert!(run.completed_at.is_some());

    // Every message was archived along the way
    assert!(engine.queue().pending("chain").unwrap().is_empty());
    assert_eq!(engine.queue().archived("chain").unwrap().len(), 3);
}

#[tokio::test]
async fn test_diamond_with_map_step() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("diamond")
        .step(StepSpec::new("fetch", "fetch"))
        .step(StepSpec::map("double", "double", 3).depends_on(["fetch"]))
        .step(StepSpec::new("count", "count").depends_on(["fetch"]))
        .step(StepSpec::new("join", "join").depends_on(["double", "count"]));
    let run_id = engine.run_definition(workflow, json!({"n": 3})).unwrap();

    let mut seen_order = Vec::new();
    let run = drive(&engine, &run_id, |task| {
        seen_order.push(task.id.step_slug.0.clone());
        match task.id.step_slug.as_str() {
            "fetch" => Ok(json!([1, 2, 3])),
            "double" => {
                assert_eq!(task.input["task_index"], json!(task.id.task_index));
                Ok(json!(task.input["item"].as_i64().unwrap() * 2))
            }
            "count" => Ok(json!(task.input["fetch"].as_array().unwrap().len())),
            "join" => {
                assert_eq!(task.input["run"], json!({"n": 3}));
                let sum: i64 = task.input["double"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .filter_map(Value::as_i64)
                    .sum();
                Ok(json!({"sum": sum, "count": task.input["count"]}))
            }
            other => Err(format!("unexpected step {}", other)),
        }
    })
    .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({"sum": 12, "count": 3})));
    assert_eq!(seen_order.first().map(String::as_str), Some("fetch"));
    assert_eq!(seen_order.last().map(String::as_str), Some("join"));
    assert_eq!(seen_order.len(), 6);

    let snapshot = engine.get_run(&run_id).unwrap().unwrap();
    assert_eq!(snapshot.step("double").unwrap().output, Some(json!([2, 4, 6])));
    assert_eq!(snapshot.tasks_for("double").len(), 3);
    assert!(snapshot
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed && s.remaining_tasks == 0));

    // join only started after both of its dependencies completed
    let join_started = snapshot.step("join").unwrap().started_at.unwrap();
    for dep in ["double", "count"] {
        assert!(snapshot.step(dep).unwrap().completed_at.unwrap() <= join_started);
    }
}

#[tokio::test]
async fn test_dependents_are_not_claimable_before_dependencies_finish() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("gated")
        .step(StepSpec::new("a", "noop"))
        .step(StepSpec::new("b", "noop").depends_on(["a"]));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let first = engine.start_tasks("gated", 10).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id.step_slug.as_str(), "a");

    // Nothing else is visible while `a` is running
    assert!(engine.start_tasks("gated", 10).await.unwrap().is_empty());
    let snapshot = engine.get_run(&run_id).unwrap().unwrap();
    assert_eq!(snapshot.step("b").unwrap().status, StepStatus::Pending);
    assert!(snapshot.tasks_for("b").is_empty());

    let outcome = engine.complete_task(&first[0].id, json!("done")).unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::StepCompleted {
            step: StepSlug::new("a"),
            activated: vec![StepSlug::new("b")],
        }
    );

    let second = engine.start_tasks("gated", 10).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].input, json!({"run": {}, "a": "done"}));
    assert_eq!(
        engine.complete_task(&second[0].id, json!(null)).unwrap(),
        CompletionOutcome::RunCompleted
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_execute_each_task_once() {
    let engine = FlowEngine::new(RedbStore::in_memory().unwrap(), test_config(3));
    let workflow = WorkflowDefinition::new("fanout").step(StepSpec::map("work", "count", 100));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let executions: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut workers = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let executions = executions.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let run = engine.store().get_run(&run_id).unwrap().unwrap();
                if run.status.is_terminal() {
                    return;
                }
                for task in engine.start_tasks("fanout", 5).await.unwrap() {
                    *executions
                        .lock()
                        .unwrap()
                        .entry(task.id.task_index)
                        .or_default() += 1;
                    tokio::task::yield_now().await;
                    engine
                        .complete_task(&task.id, json!(task.id.task_index))
                        .unwrap();
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 100);
    assert!(executions.values().all(|count| *count == 1));

    let snapshot = engine.get_run(&run_id).unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    let expected: Vec<Value> = (0..100).map(|i| json!(i)).collect();
    assert_eq!(snapshot.run.output, Some(Value::Array(expected)));
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed && t.attempts_count == 1));
}

#[tokio::test]
async fn test_failing_task_is_retried_up_to_max_attempts() {
    let engine = FlowEngine::new(RedbStore::in_memory().unwrap(), test_config(3));
    let workflow = WorkflowDefinition::new("flaky").step(StepSpec::new("boom", "boom"));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let mut claims = 0;
    let run = drive(&engine, &run_id, |task| {
        claims += 1;
        assert_eq!(task.attempt, claims);
        Err("always broken".to_string())
    })
    .await;

    assert_eq!(claims, 3);
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("always broken"));

    let snapshot = engine.get_run(&run_id).unwrap().unwrap();
    let task = &snapshot.tasks[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts_count, 3);
    assert_eq!(snapshot.step("boom").unwrap().status, StepStatus::Failed);
    assert!(engine.queue().pending("flaky").unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_reuses_message_and_then_succeeds() {
    let engine = engine();
    let workflow =
        WorkflowDefinition::new("recover").step(StepSpec::new("once", "once").max_attempts(5));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("recover", 1).await.unwrap();
    let message_id = claimed[0].message_id;
    let outcome = engine.fail_task(&claimed[0].id, "transient").unwrap();
    assert_eq!(
        outcome,
        FailureOutcome::Retrying {
            attempt: 1,
            delay: Duration::ZERO
        }
    );

    let task = engine.store().get_task(&claimed[0].id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.error.as_deref(), Some("transient"));

    let retried = engine.start_tasks("recover", 1).await.unwrap();
    assert_eq!(retried[0].message_id, message_id);
    assert_eq!(retried[0].attempt, 2);
    assert_eq!(
        engine.complete_task(&retried[0].id, json!("ok")).unwrap(),
        CompletionOutcome::RunCompleted
    );
    assert_eq!(
        engine.get_run(&run_id).unwrap().unwrap().run.output,
        Some(json!("ok"))
    );
}

#[tokio::test]
async fn test_retry_sends_fresh_message_when_original_is_gone() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("lost").step(StepSpec::new("a", "noop"));
    engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("lost", 1).await.unwrap();
    let old_message = claimed[0].message_id;
    assert!(engine.queue().delete("lost", old_message).await.unwrap());

    assert_eq!(
        engine.fail_task(&claimed[0].id, "transient").unwrap(),
        FailureOutcome::Retrying {
            attempt: 1,
            delay: Duration::ZERO
        }
    );
    let task = engine.store().get_task(&claimed[0].id).unwrap().unwrap();
    let new_message = task.queue_message_id.unwrap();
    assert_ne!(new_message, old_message);

    let retried = engine.start_tasks("lost", 1).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].message_id, new_message);
    assert_eq!(retried[0].attempt, 2);
}

#[tokio::test]
async fn test_retry_backoff_hides_task_until_delay_elapses() {
    let mut config = test_config(3);
    config.retry.base_delay_secs = 5;
    config.retry.max_delay_secs = 300;
    let engine = FlowEngine::new(RedbStore::in_memory().unwrap(), config);
    let workflow = WorkflowDefinition::new("backoff").step(StepSpec::new("a", "noop"));
    engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("backoff", 1).await.unwrap();
    let before = chrono::Utc::now();
    // 5s base doubled once for the one attempt used
    assert_eq!(
        engine.fail_task(&claimed[0].id, "transient").unwrap(),
        FailureOutcome::Retrying {
            attempt: 1,
            delay: Duration::from_secs(10)
        }
    );

    let pending = engine.queue().pending("backoff").unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].visible_at >= before + chrono::Duration::seconds(10));
    assert!(engine.start_tasks("backoff", 1).await.unwrap().is_empty());

    // Once the delay has passed the task is claimable again
    engine
        .queue()
        .set_vt("backoff", claimed[0].message_id, Duration::ZERO)
        .await
        .unwrap();
    let retried = engine.start_tasks("backoff", 1).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempt, 2);
}

#[tokio::test]
async fn test_redelivery_within_lease_is_hidden_until_lease_expires() {
    let engine = engine();
    let workflow =
        WorkflowDefinition::new("leased").step(StepSpec::new("a", "noop").timeout_secs(10));
    engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("leased", 1).await.unwrap();
    let started_at = engine
        .store()
        .get_task(&claimed[0].id)
        .unwrap()
        .unwrap()
        .started_at
        .unwrap();
    engine
        .queue()
        .set_vt("leased", claimed[0].message_id, Duration::ZERO)
        .await
        .unwrap();
    assert!(engine.start_tasks("leased", 1).await.unwrap().is_empty());

    // Hidden for the rest of the 10s lease plus 2s of grace
    let pending = engine.queue().pending("leased").unwrap();
    let expected = started_at + chrono::Duration::seconds(12);
    let drift = (pending[0].visible_at - expected).num_milliseconds().abs();
    assert!(drift < 500, "visible_at is {}ms off the lease end", drift);
}

#[tokio::test]
async fn test_oversized_step_timeout_is_rejected() {
    let engine = engine();
    let workflow =
        WorkflowDefinition::new("huge").step(StepSpec::new("a", "noop").timeout_secs(u64::MAX));

    let err = engine.run_definition(workflow, json!({})).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Definition(DefinitionError::InvalidOption { .. }))
    ));
    assert!(engine.list_runs(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_unbounded_default_timeout_does_not_overflow_lease() {
    let mut config = test_config(3);
    config.task_timeout_secs = u64::MAX;
    let engine = FlowEngine::new(RedbStore::in_memory().unwrap(), config);
    let workflow = WorkflowDefinition::new("forever").step(StepSpec::new("a", "noop"));
    engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("forever", 1).await.unwrap();
    assert_eq!(claimed[0].timeout, Duration::from_secs(u64::MAX));

    // Redelivery inside the lease re-hides the message far in the future
    engine
        .queue()
        .set_vt("forever", claimed[0].message_id, Duration::ZERO)
        .await
        .unwrap();
    assert!(engine.start_tasks("forever", 1).await.unwrap().is_empty());
    let pending = engine.queue().pending("forever").unwrap();
    assert!(pending[0].visible_at > chrono::Utc::now() + chrono::Duration::days(365));
}

#[tokio::test]
async fn test_failed_claim_does_not_drop_rest_of_batch() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("mixed").step(StepSpec::new("a", "noop"));
    let broken_run = engine.run_definition(workflow, json!(1)).unwrap();
    let healthy_run = engine.submit("mixed", json!(2)).unwrap();

    // Corrupt the first run's step state so its claim errors
    engine
        .store()
        .write(|scope| {
            scope.put_record(
                STEP_STATES_TABLE,
                &step_key(&broken_run, &StepSlug::new("a")),
                &json!("garbage"),
            )
        })
        .unwrap();

    let claimed = engine.start_tasks("mixed", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id.run_id, healthy_run);
}

#[tokio::test]
async fn test_redelivery_and_duplicate_reports_are_idempotent() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("dupes")
        .step(StepSpec::new("a", "noop"))
        .step(StepSpec::new("b", "noop").depends_on(["a"]));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("dupes", 1).await.unwrap();
    let task = &claimed[0];

    // Redeliver the same message while the task is within its lease
    engine
        .queue()
        .set_vt("dupes", task.message_id, Duration::ZERO)
        .await
        .unwrap();
    assert!(engine.start_tasks("dupes", 1).await.unwrap().is_empty());
    let stored = engine.store().get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.attempts_count, 1);

    assert!(matches!(
        engine.complete_task(&task.id, json!(1)).unwrap(),
        CompletionOutcome::StepCompleted { .. }
    ));
    assert_eq!(
        engine.complete_task(&task.id, json!(2)).unwrap(),
        CompletionOutcome::Ignored
    );
    assert_eq!(
        engine.fail_task(&task.id, "late failure").unwrap(),
        FailureOutcome::Ignored
    );

    // Activating an already started step is a no-op
    assert!(engine
        .start_ready_steps(&run_id, &[StepSlug::new("a"), StepSlug::new("b")])
        .unwrap()
        .is_empty());

    let snapshot = engine.get_run(&run_id).unwrap().unwrap();
    assert_eq!(snapshot.tasks.len(), 2);
    assert_eq!(snapshot.step("a").unwrap().output, Some(json!(1)));
    assert_eq!(snapshot.run.remaining_steps, 1);
}

#[tokio::test]
async fn test_message_for_finished_task_is_archived() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("stale").step(StepSpec::new("a", "noop"));
    engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("stale", 1).await.unwrap();
    let message_id = claimed[0].message_id;

    // Simulate a worker that finished the task but whose archive was lost
    engine
        .store()
        .write(|scope| {
            let mut task = scope.task(&claimed[0].id)?.unwrap();
            task.status = TaskStatus::Completed;
            scope.put_task(&task)
        })
        .unwrap();
    engine
        .queue()
        .set_vt("stale", message_id, Duration::ZERO)
        .await
        .unwrap();

    assert!(engine.start_tasks("stale", 1).await.unwrap().is_empty());
    assert!(engine.queue().pending("stale").unwrap().is_empty());
}

#[tokio::test]
async fn test_undecodable_message_is_archived() {
    let engine = engine();
    engine
        .register_workflow(WorkflowDefinition::new("junk").step(StepSpec::new("a", "noop")))
        .unwrap();
    let message_id = engine
        .queue()
        .send("junk", json!({"not": "a task"}), Duration::ZERO)
        .await
        .unwrap();

    let message = engine
        .queue()
        .read_with_poll(
            "junk",
            crate::queue::ReadOptions {
                visibility_timeout: Duration::from_secs(30),
                max_messages: 1,
                max_poll: Duration::ZERO,
                poll_interval: Duration::from_millis(5),
            },
        )
        .await
        .unwrap()
        .remove(0);
    assert!(matches!(
        engine.claim_message("junk", &message).unwrap(),
        ClaimOutcome::Discarded(_)
    ));
    let archived = engine.queue().archived("junk").unwrap();
    assert_eq!(archived[0].message.msg_id, message_id);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let engine = engine();
    let workflow =
        WorkflowDefinition::new("crashy").step(StepSpec::new("a", "noop").timeout_secs(10));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let first = engine.start_tasks("crashy", 1).await.unwrap();
    assert_eq!(first[0].timeout, Duration::from_secs(10));

    // The first worker died: backdate the claim past its timeout and let the
    // message reappear
    engine
        .store()
        .write(|scope| {
            let mut task = scope.task(&first[0].id)?.unwrap();
            task.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(11));
            scope.put_task(&task)
        })
        .unwrap();
    engine
        .queue()
        .set_vt("crashy", first[0].message_id, Duration::ZERO)
        .await
        .unwrap();

    let second = engine.start_tasks("crashy", 1).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].attempt, 2);

    engine.complete_task(&second[0].id, json!("late")).unwrap();
    assert_eq!(
        engine.store().get_run(&run_id).unwrap().unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn test_expired_lease_without_attempts_fails_run() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("doomed")
        .step(StepSpec::new("a", "noop").timeout_secs(10).max_attempts(1));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let first = engine.start_tasks("doomed", 1).await.unwrap();
    engine
        .store()
        .write(|scope| {
            let mut task = scope.task(&first[0].id)?.unwrap();
            task.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(60));
            scope.put_task(&task)
        })
        .unwrap();
    engine
        .queue()
        .set_vt("doomed", first[0].message_id, Duration::ZERO)
        .await
        .unwrap();

    assert!(engine.start_tasks("doomed", 1).await.unwrap().is_empty());
    let run = engine.store().get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("timed out"));

    // The original worker reporting in late changes nothing
    assert_eq!(
        engine.complete_task(&first[0].id, json!(1)).unwrap(),
        CompletionOutcome::Ignored
    );
}

#[tokio::test]
async fn test_cyclic_workflow_is_rejected_without_side_effects() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("loop")
        .step(StepSpec::new("a", "noop").depends_on(["b"]))
        .step(StepSpec::new("b", "noop").depends_on(["a"]));

    let err = engine.run_definition(workflow, json!({})).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Definition(DefinitionError::Cycle))
    ));
    assert!(engine.list_runs(None).unwrap().is_empty());
    assert!(engine.workflow("loop").unwrap().is_none());
}

#[tokio::test]
async fn test_submit_unknown_workflow() {
    let engine = engine();
    let err = engine.submit("missing", json!({})).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn test_reregistration_is_idempotent_but_conflicts_are_rejected() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("wf").step(StepSpec::new("a", "noop"));

    assert!(engine.register_workflow(workflow.clone()).unwrap());
    assert!(!engine.register_workflow(workflow).unwrap());

    let changed = WorkflowDefinition::new("wf").step(StepSpec::new("a", "identity"));
    let err = engine.register_workflow(changed).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::WorkflowConflict(_))
    ));
    assert_eq!(engine.list_workflows().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_stops_dispatch_and_discards_output() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("cancel")
        .step(StepSpec::map("a", "noop", 2))
        .step(StepSpec::new("b", "noop").depends_on(["a"]));
    let run_id = engine.run_definition(workflow, json!({})).unwrap();

    let claimed = engine.start_tasks("cancel", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    assert!(engine.cancel_run(&run_id).unwrap());
    assert!(!engine.cancel_run(&run_id).unwrap());

    // The unclaimed sibling is dropped instead of dispatched
    assert!(engine.start_tasks("cancel", 10).await.unwrap().is_empty());
    assert_eq!(
        engine.complete_task(&claimed[0].id, json!("late")).unwrap(),
        CompletionOutcome::Discarded
    );

    let snapshot = engine.get_run(&run_id).unwrap().unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Cancelled);
    assert_eq!(snapshot.step("a").unwrap().remaining_tasks, 2);
    assert_eq!(snapshot.step("b").unwrap().status, StepStatus::Pending);
    let finished = snapshot.tasks_for("a")[claimed[0].id.task_index as usize];
    assert_eq!(finished.status, TaskStatus::Completed);
    assert!(finished.output.is_none());
    assert!(engine.queue().pending("cancel").unwrap().is_empty());
}

#[tokio::test]
async fn test_root_map_step_fans_out_over_run_input() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("letters").step(StepSpec::map("upper", "upper", 3));
    let run_id = engine
        .run_definition(workflow, json!(["a", "b"]))
        .unwrap();

    let run = drive(&engine, &run_id, |task| {
        Ok(match task.input["item"].as_str() {
            Some(s) => json!(s.to_uppercase()),
            None => Value::Null,
        })
    })
    .await;

    // Third task has no matching element and gets a null item
    assert_eq!(run.output, Some(json!(["A", "B", null])));
}

#[tokio::test]
async fn test_task_input_is_persisted_on_claim() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("inputs").step(StepSpec::new("a", "noop"));
    engine.run_definition(workflow, json!({"k": "v"})).unwrap();

    let claimed = engine.start_tasks("inputs", 1).await.unwrap();
    let task = engine.store().get_task(&claimed[0].id).unwrap().unwrap();
    assert_eq!(task.input, Some(json!({"run": {"k": "v"}})));
    assert_eq!(task.status, TaskStatus::Started);
    assert!(task.started_at.is_some());

    let missing = TaskId::new(RunId::new(), StepSlug::new("a"), 0);
    let err = engine.complete_task(&missing, json!(null)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::TaskNotFound(_))
    ));
}
