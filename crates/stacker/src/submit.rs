//! Entry point for new work: one task run plus its root code step.

use common::prelude::{anyhow, serde_json, thiserror, tracing};
use dal::{AsEasyTransaction, FKey, NewRow};
use models::{stack_run::CODE_SERVICE, StackRun, TaskRun};
use serde_json::{json, Value};

use crate::{task_trait, trigger};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("no task is registered under the name {0:?}")]
    UnknownTask(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Validate and enqueue a submission. The returned id is immediately
/// pollable through the status surface.
pub async fn submit_task(task_name: &str, input: Value) -> Result<FKey<TaskRun>, SubmitError> {
    if !task_trait::task_registered(task_name) {
        return Err(SubmitError::UnknownTask(task_name.to_owned()));
    }

    let mut client = dal::new_client().await.map_err(SubmitError::Storage)?;
    let mut t = client
        .easy_transaction()
        .await
        .map_err(SubmitError::Storage)?;

    let task_run = TaskRun::queued(task_name.to_owned(), input.clone());
    let task_run_id = NewRow::new(task_run).insert(&mut t).await?;

    let root = StackRun::pending(
        task_run_id,
        None,
        CODE_SERVICE.to_owned(),
        "run".to_owned(),
        json!([task_name, input]),
    );
    let root_id = NewRow::new(root).insert(&mut t).await?;

    t.commit().await.map_err(SubmitError::Storage)?;

    tracing::info!("submitted task {task_name} as run {task_run_id:?}, root step {root_id:?}");

    trigger::fire_process_next();

    Ok(task_run_id)
}
