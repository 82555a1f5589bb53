//! Per-chain mutual exclusion.
//!
//! A lock is one row keyed by the chain id; acquisition is a bare INSERT
//! that either lands or conflicts, so two workers can never both think they
//! own a chain. There is no heartbeat: a crashed owner's lock ages out and
//! the sweeper deletes it.

use chrono::{DateTime, Utc};
use common::prelude::anyhow;
use dal::{col, web::AnyWay, DBTable, EasyTransaction, ExistingRow, FKey, Row, ToSqlObject, ID};
use std::collections::HashMap;

use crate::task_run::TaskRun;

#[derive(Debug, Clone)]
pub struct TaskLock {
    pub task_run_id: FKey<TaskRun>,
    pub locked_at: DateTime<Utc>,
    /// Owner tag, diagnostic only; ownership is the row's existence.
    pub locked_by: String,
}

impl DBTable for TaskLock {
    fn table_name() -> &'static str {
        "task_locks"
    }

    fn pk_column() -> &'static str {
        "task_run_id"
    }

    fn id(&self) -> ID {
        self.task_run_id.into_id()
    }

    fn from_row(row: Row) -> Result<ExistingRow<Self>, anyhow::Error> {
        Ok(ExistingRow::from_existing(Self {
            task_run_id: row.try_get("task_run_id")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
        }))
    }

    fn to_rowlike(&self) -> Result<HashMap<&str, Box<dyn ToSqlObject>>, anyhow::Error> {
        Ok(vec![
            col("task_run_id", self.task_run_id),
            col("locked_at", self.locked_at),
            col("locked_by", self.locked_by.clone()),
        ]
        .into_iter()
        .collect())
    }
}

impl TaskLock {
    /// Single-shot acquisition attempt. Returns whether the lock landed;
    /// a conflict is a normal outcome, not an error.
    pub async fn try_acquire(
        t: &mut EasyTransaction<'_>,
        chain: FKey<TaskRun>,
        owner: &str,
    ) -> Result<bool, anyhow::Error> {
        let q = "INSERT INTO task_locks (task_run_id, locked_at, locked_by)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (task_run_id) DO NOTHING;";

        let inserted = t
            .execute(q, &[&chain, &Utc::now(), &owner.to_owned()])
            .await
            .anyway()?;

        Ok(inserted == 1)
    }

    /// Drop the chain's lock if one exists. Releasing an absent lock is a
    /// no-op so terminal transitions can call this unconditionally.
    pub async fn release(
        t: &mut EasyTransaction<'_>,
        chain: FKey<TaskRun>,
    ) -> Result<(), anyhow::Error> {
        let q = "DELETE FROM task_locks WHERE task_run_id = $1;";
        t.execute(q, &[&chain]).await.anyway()?;
        Ok(())
    }

    /// Delete locks acquired before `cutoff`; returns how many went away.
    pub async fn sweep_stale(
        t: &mut EasyTransaction<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, anyhow::Error> {
        let q = "DELETE FROM task_locks WHERE locked_at < $1;";
        let n = t.execute(q, &[&cutoff]).await.anyway()?;
        Ok(n)
    }

    /// The live lock for a chain, if any. Surfaced through the status
    /// diagnostics so operators can see who a stuck chain is waiting on.
    pub async fn for_chain(
        t: &mut EasyTransaction<'_>,
        chain: FKey<TaskRun>,
    ) -> Result<Option<ExistingRow<TaskLock>>, anyhow::Error> {
        let mut found = TaskLock::select()
            .where_field("task_run_id")
            .equals(chain)
            .run(t)
            .await?;

        Ok(found.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn the_chain_id_is_the_primary_key() {
        let chain: FKey<TaskRun> = FKey::new_id_dangling();
        let lock = TaskLock {
            task_run_id: chain,
            locked_at: Utc::now(),
            locked_by: "worker-test".into(),
        };

        // acquisition conflicts, release, and for_chain all key on this
        assert_eq!(TaskLock::pk_column(), "task_run_id");
        assert_eq!(lock.id(), chain.into_id());
    }

    #[test]
    fn rowlike_carries_exactly_the_lock_columns() {
        let lock = TaskLock {
            task_run_id: FKey::new_id_dangling(),
            locked_at: Utc::now(),
            locked_by: "worker-test".into(),
        };

        let row = lock.to_rowlike().expect("lock rows always serialize");
        let mut columns: Vec<&str> = row.keys().copied().collect();
        columns.sort_unstable();

        assert_eq!(columns, vec!["locked_at", "locked_by", "task_run_id"]);
    }
}
