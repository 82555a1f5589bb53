//! HTTP ingress for the tasker fabric: submission, status polling, the
//! internal resume surface, and the `process-next` trigger every worker
//! cascades into.

pub mod api;

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use aide::{
    axum::{ApiRouter, IntoApiResponse},
    openapi::{OpenApi, Tag},
    transform::TransformOpenApi,
};
use axum::{
    extract::{Json, Path},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Extension,
};
use common::prelude::tracing;
use dal::{
    new_client,
    web::{ApiError, ResultWithCode},
    AsEasyTransaction, FKey,
};
use models::{RunError, StackRun, TaskLock, TaskRun};
use stacker::{submit::SubmitError, trigger::PROCESS_SECRET_HEADER};

use crate::api::{
    ProcessReport, ResumeBlob, StepBlob, SubmitBlob, SubmittedBlob, TaskStatusBlob,
};

async fn index() -> String {
    "tasker".to_owned()
}

/// `Submit(taskName, input) → taskRunId`
async fn submit_task(
    Json(blob): Json<SubmitBlob>,
) -> Result<Json<SubmittedBlob>, (StatusCode, String)> {
    let task_run_id = stacker::submit::submit_task(&blob.task_name, blob.input)
        .await
        .map_err(|e| match e {
            SubmitError::UnknownTask(name) => (
                StatusCode::BAD_REQUEST,
                format!("Error handling request: no task is registered under the name {name:?}"),
            ),
            SubmitError::Storage(e) => {
                tracing::error!("submission could not be persisted: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error handling request: the submission could not be persisted".to_owned(),
                )
            }
        })?;

    Ok(Json(SubmittedBlob { task_run_id }))
}

/// `Status(taskRunId) → {status, result?, error?, waitingOn?}`
async fn task_status(
    Path(task_run_id): Path<FKey<TaskRun>>,
) -> Result<Json<TaskStatusBlob>, (StatusCode, String)> {
    let mut client = new_client().await.log_db_client_error()?;
    let mut transaction = client.easy_transaction().await.log_db_client_error()?;

    let run = task_run_id
        .get(&mut transaction)
        .await
        .log_error(StatusCode::NOT_FOUND, "no task run by that id", false)?;

    let mut blob = TaskStatusBlob::from(&*run);

    let lock = TaskLock::for_chain(&mut transaction, task_run_id)
        .await
        .log_server_error("couldn't inspect the chain lock", true)?;
    blob.lock_held_by = lock.map(|l| l.locked_by.clone());

    transaction.commit().await.log_db_client_error()?;

    Ok(Json(blob))
}

/// Every step of the run's chain, oldest first, results retained for
/// diagnostics.
async fn task_steps(
    Path(task_run_id): Path<FKey<TaskRun>>,
) -> Result<Json<Vec<StepBlob>>, (StatusCode, String)> {
    let mut client = new_client().await.log_db_client_error()?;
    let mut transaction = client.easy_transaction().await.log_db_client_error()?;

    // 404 for runs that never existed, empty list only for real runs with
    // no steps yet
    let _ = task_run_id
        .get(&mut transaction)
        .await
        .log_error(StatusCode::NOT_FOUND, "no task run by that id", false)?;

    let steps = StackRun::chain_members(&mut transaction, task_run_id)
        .await
        .log_server_error("couldn't list the run's steps", true)?;

    transaction.commit().await.log_db_client_error()?;

    Ok(Json(steps.iter().map(|s| StepBlob::from(&**s)).collect()))
}

/// `Resume(stackRunId, result)` — internal; applies an out-of-band
/// terminal outcome to a step and wakes its parent.
async fn resume_stack_run(
    headers: HeaderMap,
    Path(stack_run_id): Path<FKey<StackRun>>,
    Json(blob): Json<ResumeBlob>,
) -> Result<StatusCode, (StatusCode, String)> {
    check_secret(&headers)?;

    let outcome: Result<serde_json::Value, RunError> = match (blob.result, blob.error) {
        (Some(v), None) => Ok(v),
        (None, Some(e)) => Err(e),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Error handling request: a resume must carry exactly one of result or error"
                    .to_owned(),
            ))
        }
    };

    stacker::resume::resume_with_result(stack_run_id, outcome)
        .await
        .log_server_error("couldn't apply the resume", true)?;

    Ok(StatusCode::NO_CONTENT)
}

/// `ProcessNext()` — the self-trigger. Sweeps first, then drives at most
/// one ready step; the cascade keeps the queue draining from there.
async fn process_next(headers: HeaderMap) -> Result<Json<ProcessReport>, (StatusCode, String)> {
    check_secret(&headers)?;

    let report = stacker::sweeper::sweep()
        .await
        .log_server_error("sweeper pass failed", true)?;

    let processed_step = stacker::scheduler::process_next()
        .await
        .log_server_error("step processing failed", true)?;

    Ok(Json(ProcessReport {
        stale_locks_cleared: report.stale_locks_cleared,
        steps_timed_out: report.steps_timed_out,
        processed_step,
    }))
}

fn check_secret(headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let presented = headers
        .get(PROCESS_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    if presented == Some(config::settings().web.process_secret.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            "Error handling request: missing or invalid shared secret".to_owned(),
        ))
    }
}

async fn serve_api(Extension(api): Extension<Arc<OpenApi>>) -> impl IntoApiResponse {
    Json(api)
}

pub async fn entry() {
    let mut api = OpenApi::default();

    let app = ApiRouter::new()
        .route("/", get(index))
        .route("/api/v1/task", post(submit_task))
        .route("/api/v1/task/:id", get(task_status))
        .route("/api/v1/task/:id/steps", get(task_steps))
        .route("/api/v1/stack_run/:id/resume", post(resume_stack_run))
        .route("/api/v1/process-next", post(process_next))
        .route("/api/openapi.json", get(serve_api))
        .finish_api_with(&mut api, api_docs)
        .layer(Extension(Arc::new(api)));

    fn api_docs(api: TransformOpenApi) -> TransformOpenApi {
        api.title("Tasker API")
            .summary("Submission, status, and worker-trigger surface of the task fabric.")
            .tag(Tag {
                name: "Tasker".into(),
                description: Some("Durable task execution".into()),
                ..Default::default()
            })
            .default_response_with::<Json<ApiError>, _>(|res| {
                res.example(ApiError::trivial(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Default error, something has gone wrong".to_string(),
                ))
            })
    }

    let bind_addr = config::settings().web.bind_addr.clone();
    tracing::info!("Binding to {bind_addr}");
    let _res = axum::Server::bind(
        &SocketAddr::from_str(&bind_addr.to_string()).expect("Expected api address as a string."),
    )
    .serve(app.into_make_service())
    .await;
}
