//! Executes task code in a restricted environment and classifies how the
//! execution ended.
//!
//! The sandbox performs no I/O of its own: host calls either replay from
//! the recorded log or unwind the task, and the caller decides what to do
//! with the resulting suspension descriptor. Panics in task code are
//! contained here and surface as ordinary step failures; retry policy
//! belongs to layers above.

use std::panic::{catch_unwind, AssertUnwindSafe};

use common::prelude::{serde_json, tracing};
use dal::{FKey, ID};
use models::RunError;
use serde_json::Value;

use crate::{
    context::{CallEntry, Context, SuspensionPoint, TaskError, VmState},
    task_trait,
};

/// Everything needed to (re-)enter one code step.
#[derive(Debug)]
pub struct ExecutionEnv {
    pub task_name: String,
    pub input: Value,
    pub task_run_id: ID,
    pub stack_run_id: ID,
    /// Replay state persisted by a prior suspension of this step.
    pub vm_state: Option<VmState>,
    /// Terminal outcome of the awaited child, if this entry is a resume.
    pub resume_payload: Option<Result<Value, RunError>>,
}

#[derive(Debug)]
pub enum Outcome {
    Completed(Value),
    /// The task needs `point` processed out-of-band before it can
    /// continue; `vm_state` is what must be persisted to re-drive it.
    Suspended {
        point: SuspensionPoint,
        vm_state: VmState,
    },
    Failed(RunError),
}

/// Run the named task to its next boundary: completion, suspension, or
/// failure. Synchronous on purpose; callers park it on a blocking thread.
pub fn run(env: ExecutionEnv) -> Outcome {
    let step = FKey::from_id(env.stack_run_id);

    let mut handle = match task_trait::instantiate(&env.task_name, env.input) {
        None => {
            return Outcome::Failed(
                RunError::validation(format!("no task registered under name {}", env.task_name))
                    .at_step(step),
            )
        }
        Some(Err(e)) => {
            return Outcome::Failed(
                RunError::validation(format!(
                    "input for task {} did not match its schema: {e}",
                    env.task_name
                ))
                .at_step(step),
            )
        }
        Some(Ok(handle)) => handle,
    };

    let mut vm = env.vm_state.unwrap_or_default();

    if let Some(payload) = env.resume_payload {
        match vm.next_call_hash.take() {
            Some(hash) => vm.log.push(CallEntry {
                hash,
                outcome: payload,
            }),
            None => {
                // a resume arrived for a step that wasn't suspended on a
                // call; the payload has nowhere to land, so re-execution
                // proceeds from the log alone
                tracing::warn!(
                    "step {} resumed with a payload but no awaited call hash",
                    env.stack_run_id
                );
            }
        }
    }

    let context = Context::within(env.task_run_id, env.stack_run_id, vm.log);

    let summary = handle.task_ref().summarize(env.stack_run_id);
    tracing::debug!("sandbox enters {summary}");

    let result = {
        let ctx = &context;
        catch_unwind(AssertUnwindSafe(|| handle.task().run(ctx)))
    };

    match result {
        Ok(Ok(value)) => Outcome::Completed(value),

        Ok(Err(TaskError::Suspend(point))) => {
            // drop the mirrored pending marker; the authoritative copy is
            // the descriptor that rode the unwind
            let _ = context.take_pending();

            let vm_state = VmState {
                log: context.replay_log(),
                next_call_hash: Some(point.call_hash()),
            };

            Outcome::Suspended { point, vm_state }
        }

        // a replayed failure the author chose not to handle keeps its
        // original classification and failing-step tag
        Ok(Err(TaskError::HostCall(e))) => Outcome::Failed(e),

        Ok(Err(TaskError::Reason(r))) => Outcome::Failed(RunError::task_code(r).at_step(step)),

        Ok(Err(TaskError::Panic(p))) => Outcome::Failed(RunError::task_code(p).at_step(step)),

        Ok(Err(TaskError::Internal(i))) => Outcome::Failed(
            RunError::task_code(format!("runtime error inside task execution: {i}")).at_step(step),
        ),

        Err(panic) => Outcome::Failed(
            RunError::task_code(format!("task panicked: {}", panic_message(&panic)))
                .at_step(step),
        ),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_owned(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Box<dyn Any>".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskError;
    use crate::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    crate::mark_task!(AddOne);
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct AddOne {
        amount: i64,
    }

    impl TaskCode for AddOne {
        fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
            let fetched = context.call_host_tool("x", "f", json!([self.amount]))?;
            let fetched = fetched.as_i64().ok_or(TaskError::reason("x/f returned a non-number"))?;

            Ok(json!(fetched + 1))
        }

        fn identifier() -> TaskIdentifier {
            TaskIdentifier::named("add one").versioned(1)
        }
    }

    crate::mark_task!(TwoSerialCalls);
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct TwoSerialCalls {}

    impl TaskCode for TwoSerialCalls {
        fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
            let a = context.call_host_tool("x", "f", json!([1]))?;
            let b = context.call_host_tool("x", "g", json!([a]))?;

            Ok(json!([a, b]))
        }

        fn identifier() -> TaskIdentifier {
            TaskIdentifier::named("two serial calls").versioned(1)
        }
    }

    crate::mark_task!(Panics);
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Panics {}

    impl TaskCode for Panics {
        fn run(&mut self, _context: &Context) -> Result<Value, TaskError> {
            panic!("task code fell over");
        }

        fn identifier() -> TaskIdentifier {
            TaskIdentifier::named("panics").versioned(1)
        }
    }

    crate::mark_task!(SubmitsSubTask);
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct SubmitsSubTask {}

    impl TaskCode for SubmitsSubTask {
        fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
            let nested = context.call_host_tool(
                "code",
                "execute",
                json!(["add one", { "amount": 4 }]),
            )?;

            Ok(nested)
        }

        fn identifier() -> TaskIdentifier {
            TaskIdentifier::named("submits sub task").versioned(1)
        }
    }

    fn env(name: &str, input: Value, vm: Option<VmState>, resume: Option<Result<Value, RunError>>) -> ExecutionEnv {
        ExecutionEnv {
            task_name: name.to_owned(),
            input,
            task_run_id: ID::new(),
            stack_run_id: ID::new(),
            vm_state: vm,
            resume_payload: resume,
        }
    }

    #[test]
    fn unknown_task_name_is_a_validation_failure() {
        match run(env("never registered", json!({}), None, None)) {
            Outcome::Failed(e) => assert_eq!(e.kind, models::ErrorKind::Validation),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn bad_input_is_a_validation_failure() {
        match run(env("add one", json!({"amount": "not a number"}), None, None)) {
            Outcome::Failed(e) => assert_eq!(e.kind, models::ErrorKind::Validation),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn first_execution_suspends_on_the_first_call() {
        match run(env("add one", json!({"amount": 1}), None, None)) {
            Outcome::Suspended { point, vm_state } => {
                assert_eq!(point.service_name, "x");
                assert_eq!(point.method_name, "f");
                assert_eq!(point.args, json!([1]));
                assert!(vm_state.log.is_empty());
                assert_eq!(vm_state.next_call_hash, Some(point.call_hash()));
            }
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[test]
    fn resume_payload_completes_a_single_call_task() {
        // first pass records the awaited call
        let vm = match run(env("add one", json!({"amount": 1}), None, None)) {
            Outcome::Suspended { vm_state, .. } => vm_state,
            other => panic!("expected suspension, got {other:?}"),
        };

        // the endpoint returned 41, so the task finishes with 42
        match run(env("add one", json!({"amount": 1}), Some(vm), Some(Ok(json!(41))))) {
            Outcome::Completed(v) => assert_eq!(v, json!(42)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn serial_calls_suspend_in_program_order() {
        let first = run(env("two serial calls", json!({}), None, None));
        let vm = match first {
            Outcome::Suspended { point, vm_state } => {
                assert_eq!((point.service_name.as_str(), point.method_name.as_str()), ("x", "f"));
                vm_state
            }
            other => panic!("expected suspension, got {other:?}"),
        };

        let second = run(env("two serial calls", json!({}), Some(vm), Some(Ok(json!(10)))));
        let vm = match second {
            Outcome::Suspended { point, vm_state } => {
                assert_eq!((point.service_name.as_str(), point.method_name.as_str()), ("x", "g"));
                assert_eq!(point.args, json!([10]));
                assert_eq!(vm_state.log.len(), 1);
                vm_state
            }
            other => panic!("expected second suspension, got {other:?}"),
        };

        let third = run(env("two serial calls", json!({}), Some(vm), Some(Ok(json!(20)))));
        match third {
            Outcome::Completed(v) => assert_eq!(v, json!([10, 20])),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn rethrown_external_failure_keeps_its_classification() {
        let vm = match run(env("two serial calls", json!({}), None, None)) {
            Outcome::Suspended { vm_state, .. } => vm_state,
            other => panic!("expected suspension, got {other:?}"),
        };

        let failing_step = dal::FKey::new_id_dangling();
        let failure = RunError::external("E").at_step(failing_step);

        match run(env("two serial calls", json!({}), Some(vm), Some(Err(failure)))) {
            Outcome::Failed(e) => {
                assert_eq!(e.kind, models::ErrorKind::External);
                assert_eq!(
                    e.stack_run_id,
                    Some(failing_step),
                    "the original failing step must stay attached"
                );
            }
            other => panic!("expected propagated failure, got {other:?}"),
        }
    }

    #[test]
    fn panics_become_task_code_failures() {
        match run(env("panics", json!({}), None, None)) {
            Outcome::Failed(e) => {
                assert_eq!(e.kind, models::ErrorKind::TaskCode);
                assert!(e.message.contains("fell over"), "panic message retained: {e}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn nested_task_submission_suspends_on_the_code_service() {
        match run(env("submits sub task", json!({}), None, None)) {
            Outcome::Suspended { point, .. } => {
                assert_eq!(point.service_name, "code");
                assert_eq!(point.method_name, "execute");
                assert_eq!(point.args[0], json!("add one"));
            }
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    /// Re-running with identical input and replay log is byte-identical in
    /// outcome: same completion value, or same next suspension descriptor.
    #[test]
    fn replay_is_deterministic() {
        let vm = match run(env("two serial calls", json!({}), None, None)) {
            Outcome::Suspended { vm_state, .. } => vm_state,
            other => panic!("expected suspension, got {other:?}"),
        };

        let a = run(env("two serial calls", json!({}), Some(vm.clone()), Some(Ok(json!(10)))));
        let b = run(env("two serial calls", json!({}), Some(vm), Some(Ok(json!(10)))));

        match (a, b) {
            (
                Outcome::Suspended { point: pa, vm_state: va },
                Outcome::Suspended { point: pb, vm_state: vb },
            ) => {
                assert_eq!(pa, pb);
                assert_eq!(va.next_call_hash, vb.next_call_hash);
                assert_eq!(va.log.len(), vb.log.len());
            }
            other => panic!("expected matching suspensions, got {other:?}"),
        }
    }
}
