//! The stack processor: everything between "a task was submitted" and "its
//! result landed on the task run".
//!
//! Task code runs inside [`sandbox`]; every external call it makes unwinds
//! back out as a suspension that [`capture`] turns into a durable child
//! step. [`scheduler`] drains pending steps one at a time per trigger,
//! honoring per-chain locks and FIFO ordering, [`dispatch`] classifies each
//! step as code or an external endpoint call, [`resume`] wakes the exact
//! awaiting parent when a child finishes, and [`sweeper`] reclaims whatever
//! crashed workers left behind.

pub mod capture;
pub mod context;
pub mod dispatch;
pub mod resume;
pub mod sandbox;
pub mod scheduler;
pub mod submit;
pub mod sweeper;
pub mod task_trait;
pub mod trigger;

pub mod prelude {
    pub use crate::context::{Context, SuspensionPoint, TaskError};
    pub use crate::task_trait::{TaskCode, TaskIdentifier};

    pub use serde::{Deserialize, Serialize};

    pub use serde_json::Value;
    pub use uuid::Uuid;
}
