//! Turns a sandbox suspension into durable state: a child step for the
//! awaited call, and the parent's waiting status.
//!
//! Write order matters and is load-bearing: the child row is inserted
//! before the parent is updated. A crash in between leaves an orphan child
//! a later scan can reconcile; the reverse order could leave a parent
//! pointing at a child that was never written, which nothing can repair.

use common::prelude::{anyhow, serde_json};
use dal::{EasyTransaction, ExistingRow, FKey, NewRow};
use models::{StackRun, TaskRun};

use crate::context::{SuspensionPoint, VmState};

/// Persist the suspension of `parent` on the call described by `point`.
/// Returns the id of the freshly-created child step.
pub async fn record_suspension(
    t: &mut EasyTransaction<'_>,
    parent: &mut ExistingRow<StackRun>,
    point: SuspensionPoint,
    vm_state: VmState,
) -> Result<FKey<StackRun>, anyhow::Error> {
    let child = StackRun::pending(
        parent.parent_task_run_id,
        Some(parent.id),
        point.service_name,
        point.method_name,
        point.args,
    );
    let child_id = NewRow::new(child).insert(t).await?;

    parent.suspend_waiting(child_id, Some(serde_json::to_value(vm_state)?));
    parent.update(t).await?;

    if parent.is_chain_root() {
        let mut task_run = TaskRun::get_by_id(t, parent.parent_task_run_id).await?;
        task_run.mark_suspended(child_id);
        task_run.update(t).await?;
    }

    Ok(child_id)
}
