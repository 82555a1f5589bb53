//! Wakes the exact parent a finished child was awaited by.
//!
//! Resumption is guarded: the parent must still be suspended and must be
//! waiting on precisely this child. Anything else is a silent no-op — the
//! child's outcome stays on its own row for inspection, and duplicated
//! triggers are harmless.

use common::prelude::{anyhow, serde_json, tracing};
use dal::{AsEasyTransaction, EasyTransaction, FKey};
use models::{RunError, StackRun, StackRunStatus, TaskLock, TaskRun};
use serde_json::Value;

use crate::trigger;

/// Apply a child's terminal outcome to its awaiting parent, if the guards
/// hold. Returns the parent step now staged `pending_resume`, or `None`
/// when there was nothing to wake.
pub async fn apply(
    t: &mut EasyTransaction<'_>,
    child: &StackRun,
    outcome: Result<Value, RunError>,
) -> Result<Option<FKey<StackRun>>, anyhow::Error> {
    let Some(parent_id) = child.parent_stack_run_id else {
        return Ok(None);
    };

    let mut parent = match parent_id.get(t).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                "child {:?} finished but its parent {parent_id:?} could not be loaded: {e}",
                child.id
            );
            return Ok(None);
        }
    };

    if parent.status != StackRunStatus::SuspendedWaitingChild {
        tracing::debug!(
            "parent {parent_id:?} is {}, not waiting; leaving it unchanged",
            parent.status
        );
        return Ok(None);
    }

    if parent.waiting_on_stack_run_id != Some(child.id) {
        tracing::debug!(
            "parent {parent_id:?} awaits {:?}, not {:?}; leaving it unchanged",
            parent.waiting_on_stack_run_id,
            child.id
        );
        return Ok(None);
    }

    parent.mark_pending_resume(serde_json::to_value(&outcome)?);
    parent.update(t).await?;

    if parent.is_chain_root() {
        let mut task_run = TaskRun::get_by_id(t, parent.parent_task_run_id).await?;
        if !task_run.status.is_terminal() {
            task_run.mark_running();
            task_run.update(t).await?;
        }
    }

    Ok(Some(parent.id))
}

/// Ingress path: an out-of-band collaborator reports the terminal outcome
/// of a stack run (asynchronous endpoints deliver results this way). The
/// step is completed or failed, its chain lock is dropped, and the parent
/// is woken through the normal guards.
pub async fn resume_with_result(
    stack_run_id: FKey<StackRun>,
    outcome: Result<Value, RunError>,
) -> Result<(), anyhow::Error> {
    let mut client = dal::new_client().await?;
    let mut t = client.easy_transaction().await?;

    let mut step = stack_run_id.get(&mut t).await?;

    if step.status.is_terminal() {
        // applying the same result twice must converge, not error
        tracing::debug!("resume for already-terminal step {stack_run_id:?} ignored");
        t.commit().await?;
        return Ok(());
    }

    match outcome.clone() {
        Ok(v) => step.complete(v),
        Err(e) => step.fail(e),
    }
    step.update(&mut t).await?;

    if step.is_chain_root() && step.is_code_step() {
        let mut task_run = TaskRun::get_by_id(&mut t, step.parent_task_run_id).await?;
        match outcome.clone() {
            Ok(v) => task_run.mark_completed(v),
            Err(e) => task_run.mark_failed(e),
        }
        task_run.update(&mut t).await?;
    }

    TaskLock::release(&mut t, step.parent_task_run_id).await?;

    apply(&mut t, &step, outcome).await?;

    t.commit().await?;

    trigger::fire_process_next();

    Ok(())
}
