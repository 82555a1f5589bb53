//! Reclaims what crashed workers leave behind. There are no heartbeats:
//! this pass runs on every external trigger, and it is the only recovery
//! mechanism in the system.

use chrono::{DateTime, Duration, Utc};
use common::prelude::{anyhow, tracing};
use config::{settings, SweeperConfig};
use dal::AsEasyTransaction;
use models::{RunError, StackRun, TaskLock, TaskRun};

use crate::{resume, trigger};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_locks_cleared: u64,
    pub steps_timed_out: usize,
}

/// Locks acquired before this instant are presumed abandoned.
pub fn lock_cutoff(now: DateTime<Utc>, cfg: &SweeperConfig) -> DateTime<Utc> {
    now - Duration::minutes(cfg.lock_stale_minutes)
}

/// Steps untouched in `processing` since before this instant are stuck.
pub fn step_cutoff(now: DateTime<Utc>, cfg: &SweeperConfig) -> DateTime<Utc> {
    now - Duration::minutes(cfg.step_stale_minutes)
}

/// One cheap recovery pass: delete stale chain locks, fail stuck steps
/// with a synthetic timeout, and wake their parents with the failure.
pub async fn sweep() -> Result<SweepReport, anyhow::Error> {
    let cfg = &settings().sweeper;
    let now = Utc::now();

    let mut client = dal::new_client().await?;
    let mut t = client.easy_transaction().await?;

    let stale_locks_cleared = TaskLock::sweep_stale(&mut t, lock_cutoff(now, cfg)).await?;

    let stuck = StackRun::stuck_processing(&mut t, step_cutoff(now, cfg)).await?;
    let steps_timed_out = stuck.len();

    for mut step in stuck {
        let err = RunError::timeout(format!(
            "step exceeded the {}-minute processing threshold and was reclaimed",
            cfg.step_stale_minutes
        ))
        .at_step(step.id);

        tracing::warn!("sweeper reclaims stuck step {:?}: {err}", step.id);

        step.fail(err.clone());
        step.update(&mut t).await?;

        TaskLock::release(&mut t, step.parent_task_run_id).await?;

        if step.is_chain_root() {
            let mut task_run = TaskRun::get_by_id(&mut t, step.parent_task_run_id).await?;
            if !task_run.status.is_terminal() {
                task_run.mark_failed(err.clone());
                task_run.update(&mut t).await?;
            }
        }

        resume::apply(&mut t, &step, Err(err)).await?;
    }

    t.commit().await?;

    if steps_timed_out > 0 || stale_locks_cleared > 0 {
        tracing::info!(
            "sweeper cleared {stale_locks_cleared} stale locks, timed out {steps_timed_out} steps"
        );
        // reclaimed chains may have runnable work again
        trigger::fire_process_next();
    }

    Ok(SweepReport {
        stale_locks_cleared,
        steps_timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cutoffs_use_the_configured_thresholds() {
        let cfg = SweeperConfig {
            lock_stale_minutes: 5,
            step_stale_minutes: 2,
        };
        let now = Utc::now();

        assert_eq!(now - lock_cutoff(now, &cfg), Duration::minutes(5));
        assert_eq!(now - step_cutoff(now, &cfg), Duration::minutes(2));
    }

    #[test]
    fn a_step_younger_than_the_cutoff_is_not_stuck() {
        let cfg = SweeperConfig {
            lock_stale_minutes: 5,
            step_stale_minutes: 2,
        };
        let now = Utc::now();
        let updated_at = now - Duration::seconds(30);

        assert!(
            updated_at > step_cutoff(now, &cfg),
            "a 30s-old processing step must survive the sweep"
        );
    }
}
