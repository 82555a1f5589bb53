//! Structured error records attached to failed steps and task runs.

use dal::FKey;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::stack_run::StackRun;

/// Failure classification, stored verbatim on step and task-run rows and
/// surfaced through the status API. Lock contention is deliberately absent:
/// contention defers a candidate, it never fails one.
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
pub enum ErrorKind {
    /// Malformed submission or resume payload, rejected at ingress.
    #[strum(serialize = "validation")]
    Validation,
    /// Missing credential/URL or an unresolvable service name.
    #[strum(serialize = "configuration")]
    Configuration,
    /// Task code returned an error or panicked.
    #[serde(rename = "task_code_error")]
    #[strum(serialize = "task_code_error")]
    TaskCode,
    /// The endpoint responded with a structured failure.
    #[serde(rename = "external_error")]
    #[strum(serialize = "external_error")]
    External,
    /// Network failure or timeout talking to the endpoint.
    #[serde(rename = "transport_error")]
    #[strum(serialize = "transport_error")]
    Transport,
    /// The durable store itself failed mid-step.
    #[serde(rename = "storage_error")]
    #[strum(serialize = "storage_error")]
    Storage,
    /// Step sat in `processing` past the staleness threshold.
    #[strum(serialize = "timeout")]
    Timeout,
}

/// The record a failed step carries: what kind of failure, a message, any
/// structured details the endpoint returned, and which step failed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_run_id: Option<FKey<StackRun>>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            stack_run_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn task_code(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskCode, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::External, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Tags the error with the step it happened on. Later tags win: an
    /// error propagating up a chain keeps pointing at the step that
    /// originally failed only if callers tag once, at the failure site.
    pub fn at_step(mut self, step: FKey<StackRun>) -> Self {
        self.stack_run_id = Some(step);
        self
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kinds_use_the_documented_wire_names() {
        let pairs = [
            (ErrorKind::Validation, "validation"),
            (ErrorKind::Configuration, "configuration"),
            (ErrorKind::TaskCode, "task_code_error"),
            (ErrorKind::External, "external_error"),
            (ErrorKind::Transport, "transport_error"),
            (ErrorKind::Storage, "storage_error"),
            (ErrorKind::Timeout, "timeout"),
        ];

        for (kind, wire) in pairs {
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(wire));
            assert_eq!(kind.to_string(), wire);
        }
    }

    #[test]
    fn step_tag_and_details_survive_round_trip() {
        let step = FKey::new_id_dangling();
        let err = RunError::external("endpoint said no")
            .with_details(serde_json::json!({"code": 503}))
            .at_step(step);

        let back: RunError =
            serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(err, back);
        assert_eq!(back.stack_run_id, Some(step));
    }
}
