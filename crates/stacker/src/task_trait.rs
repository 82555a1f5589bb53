//! The task-author surface: implement [`TaskCode`], tack a
//! `stacker::mark_task!` above the type, and the fabric can find the task
//! by name, persist it mid-flight, and re-enter it after every suspension.

use std::{any::type_name, collections::HashMap, panic::RefUnwindSafe, sync::OnceLock};

use common::prelude::serde_json;
use dal::ID;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Context, TaskError};

/// A unit of user-supplied workflow code.
///
/// Contract for implementors: the body must be deterministic up to its
/// external calls. It will be re-executed from the top on every resume;
/// [`Context::call_host_tool`] is the only durable side-effect seam, and
/// the suspension sentinel it raises must be propagated with `?`.
pub trait TaskCode:
    Send
    + Clone
    + Sized
    + std::fmt::Debug
    + Sync
    + Serialize
    + DeserializeOwned
    + TaskRegistered
    + 'static
    + RefUnwindSafe
{
    /// Called to run this task; returns the task's final value, a failure,
    /// or unwinds at the first unrecorded host call.
    fn run(&mut self, context: &Context) -> Result<Value, TaskError>;

    fn identifier() -> TaskIdentifier;

    /// Provided with the id of the wrapping step
    fn summarize(&self, id: ID) -> String {
        let task_ty_name = type_name::<Self>();
        format!("Task {task_ty_name} in step {id}")
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Serialize, Deserialize, Debug)]
pub struct TaskIdentifier {
    version: usize,
    name: String,
}

impl TaskIdentifier {
    pub fn versioned(self, version: usize) -> Self {
        Self { version, ..self }
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name: name.into(),
            version: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Object-safe shim over a concrete [`TaskCode`]; the registry hands these
/// out so the sandbox can run tasks it only knows by name.
pub(crate) trait DynTask: Send + Sync + std::fmt::Debug {
    fn run(&mut self, context: &Context) -> Result<Value, TaskError>;

    fn summarize(&self, id: ID) -> String;

    fn identifier(&self) -> TaskIdentifier;
}

#[derive(Debug)]
struct DynTaskShim<T: TaskCode> {
    v: T,
}

impl<T: TaskCode> DynTask for DynTaskShim<T> {
    fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
        self.v.run(context)
    }

    fn summarize(&self, id: ID) -> String {
        self.v.summarize(id)
    }

    fn identifier(&self) -> TaskIdentifier {
        T::identifier()
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    task: Box<dyn DynTask>,
}

impl TaskHandle {
    pub(crate) fn task(&mut self) -> &mut dyn DynTask {
        &mut *self.task
    }

    pub(crate) fn task_ref(&self) -> &dyn DynTask {
        &*self.task
    }
}

impl<T: TaskCode> From<T> for TaskHandle {
    fn from(value: T) -> Self {
        Self {
            task: Box::new(DynTaskShim { v: value }),
        }
    }
}

#[derive(Clone)]
pub struct TaskMarker {
    build_fn: fn(Value) -> Result<TaskHandle, serde_json::Error>,
    ident: fn() -> TaskIdentifier,
}

macro_reexport::collect!(TaskMarker);

/// A marker trait indicating you should tack on a
/// `stacker::mark_task!(<your task type>)` before your task
#[allow(clippy::missing_safety_doc)]
pub unsafe trait TaskRegistered {}

pub mod macro_reexport {
    pub use inventory::*;
}

pub const fn register_task<T: TaskCode>() -> TaskMarker {
    fn build<T: TaskCode>(input: Value) -> Result<TaskHandle, serde_json::Error> {
        let t: T = serde_json::from_value(input)?;
        Ok(TaskHandle {
            task: Box::new(DynTaskShim { v: t }),
        })
    }

    TaskMarker {
        build_fn: build::<T>,
        ident: T::identifier,
    }
}

#[macro_export]
macro_rules! mark_task {
    ($task:ty) => {
        $crate::task_trait::macro_reexport::submit! { $crate::task_trait::register_task::<$task>() }

        unsafe impl $crate::task_trait::TaskRegistered for $task {}
    };
}

static TASKS: OnceLock<HashMap<String, TaskMarker>> = OnceLock::new();

/// All tasks linked into this binary, keyed by identifier name.
pub fn collect_tasks() -> &'static HashMap<String, TaskMarker> {
    TASKS.get_or_init(|| {
        let mut c = HashMap::new();
        for m in inventory::iter::<TaskMarker> {
            let id = m.ident;
            c.insert(id().name().to_owned(), m.clone());
        }

        c
    })
}

pub fn task_registered(name: &str) -> bool {
    collect_tasks().contains_key(name)
}

/// Build a runnable instance of the named task from its JSON input.
/// `None` means the name is unknown; `Some(Err(_))` means the input didn't
/// deserialize into the task's type.
pub fn instantiate(name: &str, input: Value) -> Option<Result<TaskHandle, serde_json::Error>> {
    let marker = collect_tasks().get(name)?;
    Some((marker.build_fn)(input))
}
