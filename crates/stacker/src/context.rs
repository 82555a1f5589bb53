//! The ambient environment handed to task code, and the replay log that
//! makes re-execution deterministic.
//!
//! A task never talks to the outside world directly: the single host
//! primitive is [`Context::call_host_tool`]. On first encounter a call
//! records what it wanted and unwinds the task with
//! [`TaskError::Suspend`]; on re-execution the same call consumes the
//! recorded result from the replay log instead. Task code is therefore
//! re-entered from the top on every resume and must be deterministic up to
//! its external calls.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use common::prelude::{parking_lot::Mutex, tracing};
use dal::ID;
use models::RunError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The external call a suspended task is waiting on: service name, method
/// path, and the JSON argument vector, recorded verbatim.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuspensionPoint {
    pub service_name: String,
    pub method_name: String,
    pub args: Value,
}

impl std::fmt::Debug for SuspensionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "await {}/{}({})",
            self.service_name, self.method_name, self.args
        )
    }
}

impl SuspensionPoint {
    /// Stable fingerprint of the call site, used to realign the replay log
    /// when a task is re-executed. `DefaultHasher::new()` is keyed with
    /// constants, so hashes survive process restarts.
    pub fn call_hash(&self) -> u64 {
        call_site_hash(&self.service_name, &self.method_name, &self.args)
    }
}

pub(crate) fn call_site_hash(service: &str, method: &str, args: &Value) -> u64 {
    let mut h = DefaultHasher::new();
    service.hash(&mut h);
    method.hash(&mut h);
    args.to_string().hash(&mut h);
    h.finish()
}

/// One consumed host call: the call-site fingerprint plus the terminal
/// outcome the out-of-band processing produced for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEntry {
    pub hash: u64,
    pub outcome: Result<Value, RunError>,
}

/// What a suspended code step persists in its `vm_state` column: the
/// ordered results of every prior host call, plus the fingerprint of the
/// call the step is currently suspended on (so the awaited child's result
/// can be appended under the right hash at resume time).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmState {
    pub log: Vec<CallEntry>,
    pub next_call_hash: Option<u64>,
}

pub enum TaskError {
    /// Unwind sentinel: the call at the current position has no recorded
    /// result yet, so the task must stop here and wait. Task code MUST
    /// propagate this with `?`; swallowing it breaks the task's contract.
    Suspend(SuspensionPoint),

    /// A replayed host call had failed; the task author may handle this
    /// or re-throw it with `?`.
    HostCall(RunError),

    /// Task returned a domain failure of its own.
    Reason(String),

    /// Task panicked during execution; the panic was caught by the sandbox
    /// and the message is contained within.
    Panic(String),

    /// The runtime itself misbehaved. Uses a static string so reporting
    /// can't allocate.
    Internal(&'static str),
}

impl std::fmt::Debug for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Suspend(p) => write!(f, "Suspend: {p:?}"),
            TaskError::HostCall(e) => write!(f, "HostCall: {e}"),
            TaskError::Reason(r) => write!(f, "Reason: {r}"),
            TaskError::Panic(p) => write!(f, "Panic: {p}"),
            TaskError::Internal(i) => write!(f, "Internal: {i}"),
        }
    }
}

impl TaskError {
    pub fn reason(s: impl Into<String>) -> Self {
        Self::Reason(s.into())
    }
}

#[derive(Debug)]
pub(crate) struct ContextInner {
    log: Vec<CallEntry>,
    cursor: usize,

    /// Set when a call found no recorded result; mirrors the value inside
    /// the raised `TaskError::Suspend`.
    pending: Option<SuspensionPoint>,

    uuid_counter: u64,

    task_run_id: ID,
    stack_run_id: ID,
}

/// Shared handle to the per-execution state. Cloning shares the log, which
/// is what lets the sandbox read it back out after the task unwound.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Mutex<ContextInner>>,
}

impl Context {
    pub(crate) fn within(task_run_id: ID, stack_run_id: ID, replay: Vec<CallEntry>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                log: replay,
                cursor: 0,
                pending: None,
                uuid_counter: 0,
                task_run_id,
                stack_run_id,
            })),
        }
    }

    /// Invoke the named external endpoint.
    ///
    /// This never performs the call itself. If a prior execution already
    /// obtained a result for this position it is returned immediately
    /// (failures replay as [`TaskError::HostCall`]); otherwise the request
    /// is recorded and the task unwinds with [`TaskError::Suspend`].
    pub fn call_host_tool(
        &self,
        service_name: &str,
        method_name: &str,
        args: Value,
    ) -> Result<Value, TaskError> {
        let hash = call_site_hash(service_name, method_name, &args);

        let mut inner = self.inner.lock();

        if let Some(entry) = inner.log.get(inner.cursor).cloned() {
            if entry.hash == hash {
                inner.cursor += 1;
                return entry.outcome.map_err(TaskError::HostCall);
            }

            // the task made a different call than last time, so the replay
            // log is misaligned with this execution; drop the stale tail
            // and fall through to a fresh suspension
            tracing::error!(
                "replay log misaligned for task run {}: recorded hash {} but call site hash {hash}, truncating",
                inner.task_run_id,
                entry.hash,
            );
            let cursor = inner.cursor;
            inner.log.truncate(cursor);
        }

        let point = SuspensionPoint {
            service_name: service_name.to_owned(),
            method_name: method_name.to_owned(),
            args,
        };

        inner.pending = Some(point.clone());

        Err(TaskError::Suspend(point))
    }

    /// Forward task output to the host log.
    pub fn log(&self, message: impl AsRef<str>) {
        let inner = self.inner.lock();
        tracing::info!(
            target: "task",
            task_run = %inner.task_run_id,
            stack_run = %inner.stack_run_id,
            "{}",
            message.as_ref()
        );
    }

    /// Deterministic identifier source: the nth id of a step is the same
    /// on every re-execution, derived from the step id rather than from
    /// process randomness.
    pub fn next_uuid(&self) -> uuid::Uuid {
        let mut inner = self.inner.lock();
        let n = inner.uuid_counter;
        inner.uuid_counter += 1;

        uuid::Uuid::new_v5(
            &inner.stack_run_id.as_uuid(),
            format!("host-id-{n}").as_bytes(),
        )
    }

    pub fn task_run_id(&self) -> ID {
        self.inner.lock().task_run_id
    }

    pub(crate) fn take_pending(&self) -> Option<SuspensionPoint> {
        self.inner.lock().pending.take()
    }

    pub(crate) fn replay_log(&self) -> Vec<CallEntry> {
        self.inner.lock().log.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx_with(replay: Vec<CallEntry>) -> Context {
        Context::within(ID::new(), ID::new(), replay)
    }

    fn entry_for(service: &str, method: &str, args: Value, outcome: Result<Value, RunError>) -> CallEntry {
        CallEntry {
            hash: call_site_hash(service, method, &args),
            outcome,
        }
    }

    #[test]
    fn first_call_suspends_with_the_descriptor() {
        let ctx = ctx_with(vec![]);

        let res = ctx.call_host_tool("search", "web/query", json!(["rust"]));
        match res {
            Err(TaskError::Suspend(p)) => {
                assert_eq!(p.service_name, "search");
                assert_eq!(p.method_name, "web/query");
                assert_eq!(p.args, json!(["rust"]));
            }
            other => panic!("expected suspension, got {other:?}"),
        }

        assert!(ctx.take_pending().is_some());
    }

    #[test]
    fn recorded_result_replays_instead_of_suspending() {
        let ctx = ctx_with(vec![entry_for(
            "search",
            "web/query",
            json!(["rust"]),
            Ok(json!(41)),
        )]);

        let v = ctx
            .call_host_tool("search", "web/query", json!(["rust"]))
            .expect("recorded call should replay");
        assert_eq!(v, json!(41));

        // the next, unrecorded call suspends normally
        assert!(matches!(
            ctx.call_host_tool("search", "web/next", json!([])),
            Err(TaskError::Suspend(_))
        ));
    }

    #[test]
    fn recorded_failure_replays_as_host_call_error() {
        let failure = RunError::external("endpoint said no");
        let ctx = ctx_with(vec![entry_for(
            "mail",
            "send",
            json!([]),
            Err(failure.clone()),
        )]);

        match ctx.call_host_tool("mail", "send", json!([])) {
            Err(TaskError::HostCall(e)) => assert_eq!(e, failure),
            other => panic!("expected replayed failure, got {other:?}"),
        }
    }

    #[test]
    fn misaligned_log_truncates_and_resuspends() {
        let ctx = ctx_with(vec![entry_for("a", "old/call", json!([1]), Ok(json!(1)))]);

        // the task now makes a different first call than it did before
        let res = ctx.call_host_tool("b", "new/call", json!([2]));
        assert!(matches!(res, Err(TaskError::Suspend(_))));
        assert!(
            ctx.replay_log().is_empty(),
            "stale entries past the divergence point must be dropped"
        );
    }

    #[test]
    fn uuids_are_stable_across_reexecution() {
        let tid = ID::new();
        let sid = ID::new();

        let first_run: Vec<_> = {
            let ctx = Context::within(tid, sid, vec![]);
            (0..3).map(|_| ctx.next_uuid()).collect()
        };
        let second_run: Vec<_> = {
            let ctx = Context::within(tid, sid, vec![]);
            (0..3).map(|_| ctx.next_uuid()).collect()
        };

        assert_eq!(first_run, second_run);

        let other_step = Context::within(tid, ID::new(), vec![]);
        assert_ne!(first_run[0], other_step.next_uuid());
    }

    proptest! {
        /// For any recorded prefix, replaying it through the context yields
        /// exactly the recorded values in order before the next suspension.
        #[test]
        fn replay_is_order_preserving(values in proptest::collection::vec(0i64..1000, 0..8)) {
            let entries: Vec<CallEntry> = values
                .iter()
                .enumerate()
                .map(|(i, v)| entry_for("svc", &format!("call/{i}"), json!([i]), Ok(json!(v))))
                .collect();

            let ctx = ctx_with(entries);

            for (i, v) in values.iter().enumerate() {
                let got = ctx
                    .call_host_tool("svc", &format!("call/{i}"), json!([i]))
                    .expect("recorded entry should replay");
                prop_assert_eq!(got, json!(v));
            }

            let next = ctx.call_host_tool("svc", "unrecorded", json!([]));
            prop_assert!(matches!(next, Err(TaskError::Suspend(_))));
        }
    }
}
