//! One row per externally-visible step of a task's execution.
//!
//! Stack runs form a tree rooted at the chain's first step:
//! `parent_stack_run_id` is the tree edge, `parent_task_run_id` partitions
//! the forest into chains, and `waiting_on_stack_run_id` is the wait edge a
//! suspended step holds toward the child it awaits.

use chrono::{DateTime, Utc};
use common::prelude::anyhow;
use dal::{
    col, web::AnyWay, DBTable, EasyTransaction, ExistingRow, FKey, Order, Row, SqlAsJson,
    ToSqlObject, ID,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

use crate::{error::RunError, task_run::TaskRun};

/// Service name that marks a step as an invocation of the task sandbox
/// rather than a wrapped external endpoint.
pub const CODE_SERVICE: &str = "code";

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Hash,
    EnumString,
    Display,
    Eq,
    PartialEq,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StackRunStatus {
    Pending,
    Processing,
    SuspendedWaitingChild,
    PendingResume,
    Completed,
    Failed,
}

impl StackRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StackRunStatus::Completed | StackRunStatus::Failed)
    }

    /// Statuses the scheduler may pick up and execute.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self,
            StackRunStatus::Pending | StackRunStatus::PendingResume
        )
    }
}

#[derive(Debug, Clone)]
pub struct StackRun {
    pub id: FKey<StackRun>,

    /// The chain this step belongs to; unit of mutual exclusion.
    pub parent_task_run_id: FKey<TaskRun>,
    /// Direct caller step, None for the chain's root step.
    pub parent_stack_run_id: Option<FKey<StackRun>>,

    pub service_name: String,
    pub method_name: String,
    /// JSON argument vector, recorded verbatim from the suspension
    /// descriptor (or the submission, for root steps).
    pub args: Value,

    pub status: StackRunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,

    /// Serialized replay log of a suspended code step.
    pub vm_state: Option<Value>,
    pub waiting_on_stack_run_id: Option<FKey<StackRun>>,
    /// Terminal outcome of the awaited child, staged here while the step is
    /// `pending_resume`.
    pub resume_payload: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DBTable for StackRun {
    fn table_name() -> &'static str {
        "stack_runs"
    }

    fn id(&self) -> ID {
        self.id.into_id()
    }

    fn from_row(row: Row) -> Result<ExistingRow<Self>, anyhow::Error> {
        let status: String = row.try_get("status")?;

        Ok(ExistingRow::from_existing(Self {
            id: row.try_get("id")?,
            parent_task_run_id: row.try_get("parent_task_run_id")?,
            parent_stack_run_id: row.try_get("parent_stack_run_id")?,
            service_name: row.try_get("service_name")?,
            method_name: row.try_get("method_name")?,
            args: row.try_get("args")?,
            status: status
                .parse()
                .map_err(|e| anyhow::Error::msg(format!("bad stack_run status {status}: {e}")))?,
            result: row.try_get("result")?,
            error: row
                .try_get::<_, Option<SqlAsJson<RunError>>>("error")?
                .map(|v| v.extract()),
            vm_state: row.try_get("vm_state")?,
            waiting_on_stack_run_id: row.try_get("waiting_on_stack_run_id")?,
            resume_payload: row.try_get("resume_payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    fn to_rowlike(&self) -> Result<HashMap<&str, Box<dyn ToSqlObject>>, anyhow::Error> {
        Ok(vec![
            col("id", self.id),
            col("parent_task_run_id", self.parent_task_run_id),
            col("parent_stack_run_id", self.parent_stack_run_id),
            col("service_name", self.service_name.clone()),
            col("method_name", self.method_name.clone()),
            col("args", self.args.clone()),
            col("status", self.status.to_string()),
            col("result", self.result.clone()),
            col("error", self.error.clone().map(SqlAsJson::of)),
            col("vm_state", self.vm_state.clone()),
            col("waiting_on_stack_run_id", self.waiting_on_stack_run_id),
            col("resume_payload", self.resume_payload.clone()),
            col("created_at", self.created_at),
            col("updated_at", self.updated_at),
        ]
        .into_iter()
        .collect())
    }
}

impl StackRun {
    /// A fresh pending step. Root steps pass `parent_stack_run_id = None`.
    pub fn pending(
        parent_task_run_id: FKey<TaskRun>,
        parent_stack_run_id: Option<FKey<StackRun>>,
        service_name: String,
        method_name: String,
        args: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FKey::new_id_dangling(),
            parent_task_run_id,
            parent_stack_run_id,
            service_name,
            method_name,
            args,
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            waiting_on_stack_run_id: None,
            resume_payload: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_code_step(&self) -> bool {
        self.service_name == CODE_SERVICE
    }

    pub fn is_chain_root(&self) -> bool {
        self.parent_stack_run_id.is_none()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_processing(&mut self) {
        self.status = StackRunStatus::Processing;
        self.touch();
    }

    pub fn complete(&mut self, result: Value) {
        self.status = StackRunStatus::Completed;
        self.result = Some(result);
        self.waiting_on_stack_run_id = None;
        self.resume_payload = None;
        self.touch();
    }

    pub fn fail(&mut self, error: RunError) {
        self.status = StackRunStatus::Failed;
        self.error = Some(error);
        self.waiting_on_stack_run_id = None;
        self.resume_payload = None;
        self.touch();
    }

    pub fn suspend_waiting(&mut self, child: FKey<StackRun>, vm_state: Option<Value>) {
        self.status = StackRunStatus::SuspendedWaitingChild;
        self.waiting_on_stack_run_id = Some(child);
        if vm_state.is_some() {
            self.vm_state = vm_state;
        }
        self.touch();
    }

    /// Stage the awaited child's terminal outcome and make the step
    /// schedulable again. `vm_state` is intentionally left intact.
    pub fn mark_pending_resume(&mut self, payload: Value) {
        self.status = StackRunStatus::PendingResume;
        self.resume_payload = Some(payload);
        self.waiting_on_stack_run_id = None;
        self.touch();
    }

    /// Oldest-first listing of every step a worker may pick up.
    pub async fn schedulable(
        t: &mut EasyTransaction<'_>,
    ) -> Result<Vec<ExistingRow<StackRun>>, anyhow::Error> {
        StackRun::select()
            .where_field("status")
            .within([
                StackRunStatus::Pending.to_string(),
                StackRunStatus::PendingResume.to_string(),
            ])
            .order_by("created_at", Order::Ascending)
            .run(t)
            .await
    }

    /// True when some step of the same chain, created strictly earlier,
    /// is still pending. Such a candidate is not ready unless its parent
    /// explicitly awaits it.
    pub async fn has_older_pending_sibling(
        &self,
        t: &mut EasyTransaction<'_>,
    ) -> Result<bool, anyhow::Error> {
        let older = StackRun::select()
            .where_field("parent_task_run_id")
            .equals(self.parent_task_run_id)
            .where_field("status")
            .equals(StackRunStatus::Pending.to_string())
            .where_field("created_at")
            .earlier_than(self.created_at)
            .where_field("id")
            .not_equals(self.id)
            .limit(1)
            .run(t)
            .await?;

        Ok(!older.is_empty())
    }

    /// Every step of a chain, oldest first. Used by the diagnostics surface.
    pub async fn chain_members(
        t: &mut EasyTransaction<'_>,
        chain: FKey<TaskRun>,
    ) -> Result<Vec<ExistingRow<StackRun>>, anyhow::Error> {
        StackRun::select()
            .where_field("parent_task_run_id")
            .equals(chain)
            .order_by("created_at", Order::Ascending)
            .run(t)
            .await
    }

    /// Compare-and-set claim of a schedulable step: flips it to
    /// `processing` only if it is still `pending`/`pending_resume`.
    /// Returns false when another worker won the race.
    pub async fn claim_for_processing(
        t: &mut EasyTransaction<'_>,
        id: FKey<StackRun>,
        at: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let q = "UPDATE stack_runs
                 SET status = $2, updated_at = $3
                 WHERE id = $1 AND status = ANY($4);";

        let claimable = vec![
            StackRunStatus::Pending.to_string(),
            StackRunStatus::PendingResume.to_string(),
        ];

        let n = t
            .execute(
                q,
                &[
                    &id,
                    &StackRunStatus::Processing.to_string(),
                    &at,
                    &claimable,
                ],
            )
            .await
            .anyway()?;

        Ok(n == 1)
    }

    /// Steps that have sat in `processing` since before `cutoff`; the
    /// sweeper fails these with a synthetic timeout.
    pub async fn stuck_processing(
        t: &mut EasyTransaction<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExistingRow<StackRun>>, anyhow::Error> {
        StackRun::select()
            .where_field("status")
            .equals(StackRunStatus::Processing.to_string())
            .where_field("updated_at")
            .earlier_than(cutoff)
            .run(t)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step() -> StackRun {
        StackRun::pending(
            FKey::new_id_dangling(),
            None,
            "search".into(),
            "web/query".into(),
            serde_json::json!(["rust scheduler"]),
        )
    }

    #[test]
    fn schedulable_statuses_are_pending_and_pending_resume() {
        assert!(StackRunStatus::Pending.is_schedulable());
        assert!(StackRunStatus::PendingResume.is_schedulable());
        for s in [
            StackRunStatus::Processing,
            StackRunStatus::SuspendedWaitingChild,
            StackRunStatus::Completed,
            StackRunStatus::Failed,
        ] {
            assert!(!s.is_schedulable(), "{s} must not be schedulable");
        }
    }

    #[test]
    fn terminal_transitions_drop_wait_state() {
        let mut s = step();
        s.suspend_waiting(FKey::new_id_dangling(), Some(serde_json::json!({"log": []})));
        assert!(s.waiting_on_stack_run_id.is_some());

        s.complete(serde_json::json!(41));
        assert_eq!(s.status, StackRunStatus::Completed);
        assert!(s.waiting_on_stack_run_id.is_none());
        assert!(s.resume_payload.is_none());
    }

    #[test]
    fn pending_resume_keeps_vm_state_and_stages_payload() {
        let mut s = step();
        let vm = serde_json::json!({"log": [{"hash": 7, "outcome": {"Ok": 10}}]});
        s.suspend_waiting(FKey::new_id_dangling(), Some(vm.clone()));

        s.mark_pending_resume(serde_json::json!({"Ok": 20}));
        assert_eq!(s.status, StackRunStatus::PendingResume);
        assert_eq!(s.vm_state, Some(vm));
        assert!(s.resume_payload.is_some());
        assert!(s.waiting_on_stack_run_id.is_none());
        // invariant: pending_resume rows never carry a result
        assert!(s.result.is_none());
    }

    #[test]
    fn code_step_detection_uses_the_service_name() {
        let mut s = step();
        assert!(!s.is_code_step());
        s.service_name = CODE_SERVICE.to_string();
        assert!(s.is_code_step());
    }
}
