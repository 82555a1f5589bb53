//! One row per submitted workflow.

use chrono::{DateTime, Utc};
use common::prelude::anyhow;
use dal::{col, DBTable, EasyTransaction, ExistingRow, FKey, Row, SqlAsJson, ToSqlObject, ID};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

use crate::{error::RunError, stack_run::StackRun};

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
pub enum TaskRunStatus {
    Queued,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl TaskRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskRunStatus::Completed | TaskRunStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct TaskRun {
    pub id: FKey<TaskRun>,

    /// Registered name the submission named; resolved through the task
    /// registry on every (re-)execution.
    pub task_name: String,
    pub input: Value,

    pub status: TaskRunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,

    /// Set exactly while `status = suspended`; mirrors the root step's wait
    /// edge.
    pub waiting_on_stack_run_id: Option<FKey<StackRun>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
}

impl DBTable for TaskRun {
    fn table_name() -> &'static str {
        "task_runs"
    }

    fn id(&self) -> ID {
        self.id.into_id()
    }

    fn from_row(row: Row) -> Result<ExistingRow<Self>, anyhow::Error> {
        let status: String = row.try_get("status")?;

        Ok(ExistingRow::from_existing(Self {
            id: row.try_get("id")?,
            task_name: row.try_get("task_name")?,
            input: row.try_get("input")?,
            status: status
                .parse()
                .map_err(|e| anyhow::Error::msg(format!("bad task_run status {status}: {e}")))?,
            result: row.try_get("result")?,
            error: row
                .try_get::<_, Option<SqlAsJson<RunError>>>("error")?
                .map(|v| v.extract()),
            waiting_on_stack_run_id: row.try_get("waiting_on_stack_run_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            suspended_at: row.try_get("suspended_at")?,
        }))
    }

    fn to_rowlike(&self) -> Result<HashMap<&str, Box<dyn ToSqlObject>>, anyhow::Error> {
        Ok(vec![
            col("id", self.id),
            col("task_name", self.task_name.clone()),
            col("input", self.input.clone()),
            col("status", self.status.to_string()),
            col("result", self.result.clone()),
            col("error", self.error.clone().map(SqlAsJson::of)),
            col("waiting_on_stack_run_id", self.waiting_on_stack_run_id),
            col("created_at", self.created_at),
            col("updated_at", self.updated_at),
            col("started_at", self.started_at),
            col("ended_at", self.ended_at),
            col("suspended_at", self.suspended_at),
        ]
        .into_iter()
        .collect())
    }
}

impl TaskRun {
    /// Fresh submission, not yet picked up by any worker.
    pub fn queued(task_name: String, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: FKey::new_id_dangling(),
            task_name,
            input,
            status: TaskRunStatus::Queued,
            result: None,
            error: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            suspended_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_running(&mut self) {
        self.status = TaskRunStatus::Running;
        self.waiting_on_stack_run_id = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn mark_suspended(&mut self, waiting_on: FKey<StackRun>) {
        self.status = TaskRunStatus::Suspended;
        self.waiting_on_stack_run_id = Some(waiting_on);
        self.suspended_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_completed(&mut self, result: Value) {
        self.status = TaskRunStatus::Completed;
        self.result = Some(result);
        self.waiting_on_stack_run_id = None;
        self.ended_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self, error: RunError) {
        self.status = TaskRunStatus::Failed;
        self.error = Some(error);
        self.waiting_on_stack_run_id = None;
        self.ended_at = Some(Utc::now());
        self.touch();
    }

    pub async fn get_by_id(
        t: &mut EasyTransaction<'_>,
        id: FKey<TaskRun>,
    ) -> Result<ExistingRow<TaskRun>, anyhow::Error> {
        id.get(t).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn completion_clears_the_wait_edge() {
        let mut run = TaskRun::queued("demo".into(), serde_json::json!({}));
        run.mark_running();
        run.mark_suspended(FKey::new_id_dangling());
        assert!(run.waiting_on_stack_run_id.is_some());

        run.mark_completed(serde_json::json!(42));
        assert_eq!(run.status, TaskRunStatus::Completed);
        assert!(run.result.is_some());
        assert!(run.ended_at.is_some());
        assert!(
            run.waiting_on_stack_run_id.is_none(),
            "completed runs must not hold a wait edge"
        );
    }

    #[test]
    fn suspension_requires_a_wait_edge() {
        let mut run = TaskRun::queued("demo".into(), serde_json::json!(null));
        let child = FKey::new_id_dangling();
        run.mark_suspended(child);
        assert_eq!(run.status, TaskRunStatus::Suspended);
        assert_eq!(run.waiting_on_stack_run_id, Some(child));
        assert!(run.suspended_at.is_some());
    }

    #[test]
    fn started_at_is_set_once() {
        let mut run = TaskRun::queued("demo".into(), serde_json::json!(null));
        run.mark_running();
        let first = run.started_at;
        run.mark_suspended(FKey::new_id_dangling());
        run.mark_running();
        assert_eq!(run.started_at, first);
    }
}
