//! Classifies a ready step and drives it: code steps re-enter the sandbox,
//! external steps call their wrapped endpoint.
//!
//! Steps come in two variants sharing one outcome contract, so the
//! scheduler never cares which kind it just ran.

use common::prelude::{anyhow, serde_json, tracing};
use dal::{EasyTransaction, ExistingRow, FKey};
use models::{ErrorKind, RunError, StackRun};
use serde_json::Value;

use crate::{capture, context::VmState, sandbox};

#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(Value),
    /// The step itself suspended on a child (code steps via the sandbox,
    /// external endpoints via the distinguished suspension response).
    ChildSuspended(FKey<StackRun>),
    Failed(RunError),
}

/// Execute one step to its next boundary. The step must already be marked
/// `processing` and committed; a crash from here on is observable and
/// recoverable by the sweeper.
pub async fn dispatch(
    t: &mut EasyTransaction<'_>,
    step: &mut ExistingRow<StackRun>,
) -> Result<DispatchOutcome, anyhow::Error> {
    if step.is_code_step() {
        dispatch_code(t, step).await
    } else {
        dispatch_external(step).await
    }
}

/// Code steps carry `[task_name, input]` in their argument vector.
async fn dispatch_code(
    t: &mut EasyTransaction<'_>,
    step: &mut ExistingRow<StackRun>,
) -> Result<DispatchOutcome, anyhow::Error> {
    let step_key = step.id;

    let task_name = match step.args.get(0).and_then(Value::as_str) {
        Some(name) => name.to_owned(),
        None => {
            return Ok(DispatchOutcome::Failed(
                RunError::validation("code step args must begin with a task name")
                    .at_step(step_key),
            ))
        }
    };
    let input = step.args.get(1).cloned().unwrap_or(Value::Null);

    let vm_state: Option<VmState> = match step.vm_state.clone() {
        None => None,
        Some(raw) => match serde_json::from_value(raw) {
            Ok(vm) => Some(vm),
            Err(e) => {
                return Ok(DispatchOutcome::Failed(
                    RunError::new(
                        ErrorKind::Storage,
                        format!("persisted vm_state for step {step_key:?} is unreadable: {e}"),
                    )
                    .at_step(step_key),
                ))
            }
        },
    };

    let resume_payload: Option<Result<Value, RunError>> = match step.resume_payload.take() {
        None => None,
        Some(raw) => match serde_json::from_value(raw) {
            Ok(p) => Some(p),
            Err(e) => {
                return Ok(DispatchOutcome::Failed(
                    RunError::new(
                        ErrorKind::Storage,
                        format!("resume payload for step {step_key:?} is unreadable: {e}"),
                    )
                    .at_step(step_key),
                ))
            }
        },
    };

    let env = sandbox::ExecutionEnv {
        task_name,
        input,
        task_run_id: step.parent_task_run_id.into_id(),
        stack_run_id: step.id.into_id(),
        vm_state,
        resume_payload,
    };

    let outcome = tokio::task::spawn_blocking(move || sandbox::run(env))
        .await
        .map_err(|e| anyhow::Error::msg(format!("sandbox execution thread died: {e}")))?;

    match outcome {
        sandbox::Outcome::Completed(v) => Ok(DispatchOutcome::Completed(v)),
        sandbox::Outcome::Failed(e) => Ok(DispatchOutcome::Failed(e)),
        sandbox::Outcome::Suspended { point, vm_state } => {
            tracing::debug!("step {step_key:?} suspended on {point:?}");
            let child = capture::record_suspension(t, step, point, vm_state).await?;
            Ok(DispatchOutcome::ChildSuspended(child))
        }
    }
}

async fn dispatch_external(
    step: &mut ExistingRow<StackRun>,
) -> Result<DispatchOutcome, anyhow::Error> {
    let step_key = step.id;

    let outcome =
        services::invoke(&step.service_name, &step.method_name, &step.args).await;

    Ok(match outcome {
        services::EndpointOutcome::Completed(v) => DispatchOutcome::Completed(v),
        services::EndpointOutcome::Suspended(child) => {
            DispatchOutcome::ChildSuspended(FKey::from_id(child))
        }
        services::EndpointOutcome::Failed(e) => {
            // tag once, at the failure site; resumes further up the chain
            // keep pointing here
            let e = if e.stack_run_id.is_none() {
                e.at_step(step_key)
            } else {
                e
            };
            DispatchOutcome::Failed(e)
        }
    })
}
