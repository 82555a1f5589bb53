//! Wire shapes of the submission façade.
//!
//! Anything declared as a 'blob' is an API-friendly struct to be sent over
//! the wire, never stored; the persistent truth lives in the models crate.
//! Timestamps are rendered as ISO-8601 UTC strings.

use dal::FKey;
use models::{RunError, StackRun, StackRunStatus, TaskRun, TaskRunStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct SubmitBlob {
    /// Name the task registered itself under.
    pub task_name: String,
    /// Opaque JSON input handed to the task code.
    pub input: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct SubmittedBlob {
    pub task_run_id: FKey<TaskRun>,
}

/// What clients poll: the run's status plus whichever terminal field is
/// set. `waiting_on` names the step the run is suspended on, when any.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct TaskStatusBlob {
    pub task_run_id: FKey<TaskRun>,
    pub task_name: String,
    pub status: TaskRunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,
    pub waiting_on: Option<FKey<StackRun>>,
    /// Owner tag of the chain's live lock, when one is held. Completed
    /// runs always show `None` here.
    pub lock_held_by: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

impl From<&TaskRun> for TaskStatusBlob {
    fn from(run: &TaskRun) -> Self {
        Self {
            task_run_id: run.id,
            task_name: run.task_name.clone(),
            status: run.status,
            result: run.result.clone(),
            error: run.error.clone(),
            waiting_on: run.waiting_on_stack_run_id,
            lock_held_by: None,
            created_at: run.created_at.to_rfc3339(),
            started_at: run.started_at.map(|t| t.to_rfc3339()),
            ended_at: run.ended_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// One step of a chain, for diagnostics. Prior successful steps retain
/// their results here even after later steps fail.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct StepBlob {
    pub id: FKey<StackRun>,
    pub parent_stack_run_id: Option<FKey<StackRun>>,
    pub service_name: String,
    pub method_name: String,
    pub status: StackRunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,
    pub waiting_on: Option<FKey<StackRun>>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&StackRun> for StepBlob {
    fn from(step: &StackRun) -> Self {
        Self {
            id: step.id,
            parent_stack_run_id: step.parent_stack_run_id,
            service_name: step.service_name.clone(),
            method_name: step.method_name.clone(),
            status: step.status,
            result: step.result.clone(),
            error: step.error.clone(),
            waiting_on: step.waiting_on_stack_run_id,
            created_at: step.created_at.to_rfc3339(),
            updated_at: step.updated_at.to_rfc3339(),
        }
    }
}

/// Terminal outcome reported for a stack run through the internal resume
/// surface. Exactly one of `result` and `error` must be set.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct ResumeBlob {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RunError>,
}

/// What one `process-next` trigger accomplished.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct ProcessReport {
    pub stale_locks_cleared: u64,
    pub steps_timed_out: usize,
    pub processed_step: Option<FKey<StackRun>>,
}
