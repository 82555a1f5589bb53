//! Picks the next ready step and drives it to its next boundary.
//!
//! One invocation processes one selected step (plus any parent it wakes
//! inline); the cascade trigger keeps invocations coming while work
//! remains. Multiple workers may run this concurrently against the same
//! store: per-chain locks plus the compare-and-set claim keep a chain on
//! exactly one worker at a time, while independent chains proceed in
//! parallel.

use std::time::Duration;

use common::prelude::{anyhow, once_cell::sync::Lazy, tokio, tracing};
use config::settings;
use dal::{AsEasyTransaction, ClientPair, EasyTransaction, ExistingRow, FKey};
use models::{StackRun, StackRunStatus, TaskLock, TaskRun};

use crate::{
    dispatch::{self, DispatchOutcome},
    resume, trigger,
};

static WORKER_TAG: Lazy<String> = Lazy::new(|| format!("worker-{}", uuid::Uuid::new_v4()));

/// Identity written into lock rows; diagnostic only.
pub fn worker_tag() -> &'static str {
    &WORKER_TAG
}

/// The slice of a parent step the selection and locking rules care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentView {
    pub status: StackRunStatus,
    pub waiting_on: Option<FKey<StackRun>>,
}

/// True when the candidate is the exact child its parent suspended on.
/// Such a candidate overrides sibling FIFO: holding it back behind older
/// unrelated pending siblings would head-of-line block the parent's
/// subtree.
pub fn awaited_by_parent(step: FKey<StackRun>, parent: Option<&ParentView>) -> bool {
    matches!(
        parent,
        Some(p) if p.status == StackRunStatus::SuspendedWaitingChild
            && p.waiting_on == Some(step)
    )
}

/// The chain-lock bypass: a candidate whose parent is suspended (awaiting
/// this child or a different one) or already completed runs under the
/// parent's implicit chain ownership. Without this, the child of a
/// suspended parent could never run and the chain would deadlock.
pub fn chain_lock_exempt(parent: Option<&ParentView>) -> bool {
    matches!(
        parent,
        Some(p) if p.status == StackRunStatus::Completed
            || p.status == StackRunStatus::SuspendedWaitingChild
    )
}

/// FIFO within a chain: a candidate with an older still-pending sibling is
/// not ready, unless it is the one step its parent explicitly awaits.
pub fn selection_ready(has_older_pending_sibling: bool, awaited: bool) -> bool {
    awaited || !has_older_pending_sibling
}

/// Select and run the next ready step. Returns the id of the step that was
/// driven, or `None` when nothing was ready (or every ready chain was
/// contended).
pub async fn process_next() -> Result<Option<FKey<StackRun>>, anyhow::Error> {
    let mut client = dal::new_client().await?;

    let candidates = {
        let mut t = client.easy_transaction().await?;
        let c = StackRun::schedulable(&mut t).await?;
        t.commit().await?;
        c
    };

    for candidate in candidates {
        let (ready, exempt) = {
            let mut t = client.easy_transaction().await?;
            let parent = parent_view(&mut t, &candidate).await?;
            let awaited = awaited_by_parent(candidate.id, parent.as_ref());
            let older = candidate.has_older_pending_sibling(&mut t).await?;
            t.commit().await?;

            (
                selection_ready(older, awaited),
                chain_lock_exempt(parent.as_ref()),
            )
        };

        if !ready {
            continue;
        }

        if !exempt && !acquire_chain_lock(&mut client, candidate.parent_task_run_id).await? {
            tracing::debug!(
                "chain {:?} is contended, deferring step {:?}",
                candidate.parent_task_run_id,
                candidate.id
            );
            continue;
        }

        let picked = candidate.id;

        let mut next = Some(candidate);
        while let Some(step) = next {
            next = execute_step(&mut client, step).await?;
        }

        return Ok(Some(picked));
    }

    Ok(None)
}

async fn parent_view(
    t: &mut EasyTransaction<'_>,
    step: &StackRun,
) -> Result<Option<ParentView>, anyhow::Error> {
    match step.parent_stack_run_id {
        None => Ok(None),
        Some(pid) => {
            let p = pid.get(t).await?;
            Ok(Some(ParentView {
                status: p.status,
                waiting_on: p.waiting_on_stack_run_id,
            }))
        }
    }
}

/// Bounded fail-fast acquisition: each attempt is its own committed
/// transaction so the lock row is visible to other workers immediately.
async fn acquire_chain_lock(
    client: &mut ClientPair,
    chain: FKey<TaskRun>,
) -> Result<bool, anyhow::Error> {
    let cfg = &settings().scheduler;

    for attempt in 1..=cfg.lock_retry_attempts {
        let mut t = client.easy_transaction().await?;
        let acquired = TaskLock::try_acquire(&mut t, chain, worker_tag()).await?;
        t.commit().await?;

        if acquired {
            return Ok(true);
        }

        if attempt < cfg.lock_retry_attempts {
            tokio::time::sleep(Duration::from_millis(
                cfg.lock_retry_delay_ms * attempt as u64,
            ))
            .await;
        }
    }

    Ok(false)
}

/// Drive one claimed step through dispatch and its outcome transition.
/// Returns a woken parent step when it can be continued inline under this
/// worker's chain ownership.
async fn execute_step(
    client: &mut ClientPair,
    mut step: ExistingRow<StackRun>,
) -> Result<Option<ExistingRow<StackRun>>, anyhow::Error> {
    // the processing mark must be committed before any outbound call so a
    // crash mid-call is observable
    {
        let mut t = client.easy_transaction().await?;

        step.mark_processing();
        let claimed = StackRun::claim_for_processing(&mut t, step.id, step.updated_at).await?;
        if !claimed {
            // another worker got the step between selection and here
            t.commit().await?;
            return Ok(None);
        }

        if step.is_chain_root() {
            let mut task_run = TaskRun::get_by_id(&mut t, step.parent_task_run_id).await?;
            if !task_run.status.is_terminal() {
                task_run.mark_running();
                task_run.update(&mut t).await?;
            }
        }

        t.commit().await?;
    }

    // storage failures from here propagate without releasing the chain
    // lock; the sweeper is the recovery path for both the row and the lock
    let mut t = client.easy_transaction().await?;
    let outcome = dispatch::dispatch(&mut t, &mut step).await?;

    let woken_parent = match outcome {
        DispatchOutcome::Completed(v) => {
            step.complete(v.clone());
            step.update(&mut t).await?;

            if step.is_chain_root() {
                let mut task_run = TaskRun::get_by_id(&mut t, step.parent_task_run_id).await?;
                task_run.mark_completed(v.clone());
                task_run.update(&mut t).await?;
            }

            TaskLock::release(&mut t, step.parent_task_run_id).await?;

            resume::apply(&mut t, &step, Ok(v)).await?
        }

        DispatchOutcome::Failed(e) => {
            tracing::warn!("step {:?} failed: {e}", step.id);

            step.fail(e.clone());
            step.update(&mut t).await?;

            if step.is_chain_root() {
                let mut task_run = TaskRun::get_by_id(&mut t, step.parent_task_run_id).await?;
                if !task_run.status.is_terminal() {
                    task_run.mark_failed(e.clone());
                    task_run.update(&mut t).await?;
                }
            }

            TaskLock::release(&mut t, step.parent_task_run_id).await?;

            resume::apply(&mut t, &step, Err(e)).await?
        }

        DispatchOutcome::ChildSuspended(child) => {
            // code steps were already persisted as waiting inside capture;
            // an external endpoint that suspended out-of-band is recorded
            // here
            if step.status != StackRunStatus::SuspendedWaitingChild {
                step.suspend_waiting(child, None);
                step.update(&mut t).await?;
            }

            // the suspending step did not terminate, so the chain lock is
            // retained by its lineage; the awaited child runs via bypass
            None
        }
    };

    t.commit().await?;

    trigger::fire_process_next();

    let Some(parent_id) = woken_parent else {
        return Ok(None);
    };

    continue_with_parent(client, parent_id).await
}

/// A child just woke its parent. Re-claim the chain for the parent and
/// hand it back for inline execution, or leave it for a later trigger if
/// the chain got claimed elsewhere in the meantime.
async fn continue_with_parent(
    client: &mut ClientPair,
    parent_id: FKey<StackRun>,
) -> Result<Option<ExistingRow<StackRun>>, anyhow::Error> {
    let mut t = client.easy_transaction().await?;
    let parent = parent_id.get(&mut t).await?;
    let pview = parent_view(&mut t, &parent).await?;
    t.commit().await?;

    if !parent.status.is_schedulable() {
        return Ok(None);
    }

    if chain_lock_exempt(pview.as_ref()) {
        return Ok(Some(parent));
    }

    if acquire_chain_lock(client, parent.parent_task_run_id).await? {
        return Ok(Some(parent));
    }

    // contended; the cascade already fired, so a later trigger resumes it
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn waiting_parent(on: FKey<StackRun>) -> ParentView {
        ParentView {
            status: StackRunStatus::SuspendedWaitingChild,
            waiting_on: Some(on),
        }
    }

    #[test]
    fn fifo_holds_unless_the_parent_awaits_the_candidate() {
        let step = FKey::new_id_dangling();

        // plain sibling order: an older pending sibling blocks
        assert!(!selection_ready(true, false));
        assert!(selection_ready(false, false));

        // the awaited child jumps the queue
        let awaited = awaited_by_parent(step, Some(&waiting_parent(step)));
        assert!(awaited);
        assert!(selection_ready(true, awaited));
    }

    #[test]
    fn a_sibling_the_parent_does_not_await_gets_no_override() {
        let step = FKey::new_id_dangling();
        let other = FKey::new_id_dangling();

        assert!(!awaited_by_parent(step, Some(&waiting_parent(other))));
        assert!(!awaited_by_parent(step, None));
        assert!(!awaited_by_parent(
            step,
            Some(&ParentView {
                status: StackRunStatus::Completed,
                waiting_on: None,
            })
        ));
    }

    #[test]
    fn bypass_covers_every_suspended_or_completed_parent() {
        let step = FKey::new_id_dangling();
        let other = FKey::new_id_dangling();

        // awaited child of a suspended parent
        assert!(chain_lock_exempt(Some(&waiting_parent(step))));
        // parent waiting on a *different* child still exempts
        assert!(chain_lock_exempt(Some(&waiting_parent(other))));
        // completed parent
        assert!(chain_lock_exempt(Some(&ParentView {
            status: StackRunStatus::Completed,
            waiting_on: None,
        })));
    }

    #[test]
    fn root_steps_and_running_parents_require_the_lock() {
        assert!(!chain_lock_exempt(None), "chain roots must take the lock");

        for status in [
            StackRunStatus::Pending,
            StackRunStatus::Processing,
            StackRunStatus::PendingResume,
            StackRunStatus::Failed,
        ] {
            assert!(
                !chain_lock_exempt(Some(&ParentView {
                    status,
                    waiting_on: None,
                })),
                "{status} parents must not exempt their children"
            );
        }
    }

    #[test]
    fn worker_tag_is_stable_within_the_process() {
        assert_eq!(worker_tag(), worker_tag());
        assert!(worker_tag().starts_with("worker-"));
    }
}
