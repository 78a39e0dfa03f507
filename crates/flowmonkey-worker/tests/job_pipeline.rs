//! Engine ↔ runner integration
//!
//! A stateful step parks its execution on a deterministically-keyed job;
//! a runner claims and executes the job; a later engine tick surfaces the
//! job's terminal state as the step outcome.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowmonkey_core::{
    ContextMap, ExecutionStatus, HandlerDescriptor, HandlerParams, JobStatus, StepHandler,
    StepOutcome,
};
use flowmonkey_engine::{
    CreateOptions, Engine, EngineStores, HandlerRegistry, RunOptions,
};
use flowmonkey_worker::{JobRunner, RunnerConfig};

struct ImportBatch;

#[async_trait]
impl StepHandler for ImportBatch {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new("import-batch")
            .with_description("imports rows in checkpointed batches")
            .stateful()
    }

    async fn execute(&self, params: HandlerParams) -> StepOutcome {
        let rows = params.input["rows"].as_u64().unwrap_or(0);

        if let Some(checkpoint) = params.checkpoint.as_ref() {
            checkpoint.save(json!({"imported": rows})).await.ok();
        }

        StepOutcome::success(json!({"imported": rows}))
    }
}

struct FailingImport;

#[async_trait]
impl StepHandler for FailingImport {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new("failing-import").stateful()
    }

    async fn execute(&self, _params: HandlerParams) -> StepOutcome {
        StepOutcome::failure("SOURCE_UNREACHABLE", "import source is unreachable")
    }
}

fn ctx(value: Value) -> ContextMap {
    value.as_object().cloned().unwrap_or_default()
}

struct Fixture {
    engine: Engine,
    runner: JobRunner,
}

/// The engine and the runner each register their own handlers, the way
/// separate processes sharing one store would
fn fixture() -> Fixture {
    let stores = EngineStores::in_memory();

    let engine = Engine::new(stores.clone());
    engine.register_handler(Arc::new(ImportBatch)).unwrap();
    engine.register_handler(Arc::new(FailingImport)).unwrap();

    let runner_handlers = Arc::new(HandlerRegistry::new());
    runner_handlers.register(Arc::new(ImportBatch)).unwrap();
    runner_handlers.register(Arc::new(FailingImport)).unwrap();

    let runner = JobRunner::new(
        stores.jobs.clone(),
        stores.executions.clone(),
        stores.context.clone(),
        runner_handlers,
        RunnerConfig::default().with_runner_id("runner-1"),
    );

    Fixture { engine, runner }
}

async fn register_import_flow(engine: &Engine, step_type: &str, on_failure: Value) {
    engine
        .register_flow(
            serde_json::from_value(json!({
                "id": "import",
                "version": "1.0.0",
                "initialStepId": "import",
                "steps": {
                    "import": {
                        "id": "import",
                        "type": step_type,
                        "input": {"type": "full"},
                        "outputKey": "importResult",
                        "transitions": {"onSuccess": null, "onFailure": on_failure}
                    }
                }
            }))
            .unwrap(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn stateful_step_completes_through_a_runner() {
    let f = fixture();
    register_import_flow(&f.engine, "import-batch", Value::Null).await;

    let created = f
        .engine
        .create("import", ctx(json!({"rows": 250})), CreateOptions::default())
        .await
        .unwrap();
    let id = created.execution.id;

    // First tick enqueues the job and parks the execution
    let parked = f.engine.tick(id).await.unwrap();
    assert!(!parked.done);
    assert_eq!(parked.status, ExecutionStatus::Waiting);

    let execution = f.engine.get(id).await.unwrap().unwrap();
    let wait_reason = execution.wait_reason.clone().unwrap();
    assert!(wait_reason.starts_with("job:"));
    let job_id = wait_reason.strip_prefix("job:").unwrap().to_string();

    let job = f.engine.stores().jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.handler, "import-batch");

    // A runner picks the job up
    let stats = f.runner.poll_once().await.unwrap();
    assert_eq!(stats.executed, 1);

    let job = f.engine.stores().jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.checkpoint, Some(json!({"imported": 250})));

    // The next advance surfaces the job result as the step outcome
    let result = f
        .engine
        .run(
            id,
            RunOptions {
                simulate_time: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.done);
    assert_eq!(result.status, ExecutionStatus::Completed);

    let execution = f.engine.get(id).await.unwrap().unwrap();
    assert_eq!(execution.context["importResult"], json!({"imported": 250}));
}

#[tokio::test]
async fn failed_job_fails_the_execution() {
    let f = fixture();
    register_import_flow(&f.engine, "failing-import", Value::Null).await;

    let created = f
        .engine
        .create("import", ctx(json!({"rows": 1})), CreateOptions::default())
        .await
        .unwrap();
    let id = created.execution.id;

    f.engine.tick(id).await.unwrap();
    f.runner.poll_once().await.unwrap();

    let result = f
        .engine
        .run(
            id,
            RunOptions {
                simulate_time: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let execution = f.engine.get(id).await.unwrap().unwrap();
    assert_eq!(execution.error.unwrap().code, "SOURCE_UNREACHABLE");
}

#[tokio::test]
async fn repeated_ticks_coalesce_onto_one_job() {
    let f = fixture();
    register_import_flow(&f.engine, "import-batch", Value::Null).await;

    let created = f
        .engine
        .create("import", ctx(json!({"rows": 10})), CreateOptions::default())
        .await
        .unwrap();
    let id = created.execution.id;

    // Several ticks before any runner shows up: one job, not three
    f.engine.tick(id).await.unwrap();
    f.engine
        .run(
            id,
            RunOptions {
                simulate_time: true,
                max_steps: Some(3),
            },
        )
        .await
        .unwrap();

    let pending = f.engine.stores().jobs.list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);
}

#[tokio::test]
async fn cancelling_a_parked_execution_cancels_its_job() {
    let f = fixture();
    register_import_flow(&f.engine, "import-batch", Value::Null).await;

    let created = f
        .engine
        .create("import", ctx(json!({"rows": 10})), CreateOptions::default())
        .await
        .unwrap();
    let id = created.execution.id;

    f.engine.tick(id).await.unwrap();
    let execution = f.engine.get(id).await.unwrap().unwrap();
    let job_id = execution
        .wait_reason
        .unwrap()
        .strip_prefix("job:")
        .unwrap()
        .to_string();

    f.engine
        .cancel(id, flowmonkey_core::CancelSource::User, "abandoned")
        .await
        .unwrap();

    let job = f.engine.stores().jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    // The cancelled job is no longer claimable
    let stats = f.runner.poll_once().await.unwrap();
    assert_eq!(stats.executed, 0);
}
