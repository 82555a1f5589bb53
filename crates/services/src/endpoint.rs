//! One wrapped HTTP endpoint and the outcome classification for its
//! responses.

use std::{str::FromStr, time::Duration};

use common::prelude::{once_cell::sync::Lazy, reqwest};
use config::{settings, ServiceConfig};
use dal::ID;
use models::RunError;
use serde_json::Value;

use crate::EndpointOutcome;

static HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

pub struct HttpEndpoint {
    name: String,
    base_url: String,
    token: Option<String>,
}

impl HttpEndpoint {
    pub fn from_config(name: &str, cfg: &ServiceConfig) -> Self {
        Self {
            name: name.to_owned(),
            base_url: cfg.url.trim_end_matches('/').to_owned(),
            token: cfg.token.clone(),
        }
    }

    /// POST the JSON argument vector at `{base_url}/{method_path}`. The
    /// call times out at the configured dispatch deadline and surfaces as
    /// a transport failure when it does.
    pub async fn invoke(&self, method_path: &str, args: &Value) -> EndpointOutcome {
        let url = format!("{}/{}", self.base_url, method_path.trim_start_matches('/'));

        let mut req = HTTP
            .post(&url)
            .timeout(Duration::from_secs(settings().dispatch.timeout_seconds))
            .json(args);

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Err(e) if e.is_timeout() => EndpointOutcome::Failed(RunError::transport(format!(
                "call to {} timed out", self.name
            ))),
            Err(e) => EndpointOutcome::Failed(RunError::transport(format!(
                "call to {} failed: {e}", self.name
            ))),
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.json::<Value>().await {
                    Err(e) => EndpointOutcome::Failed(RunError::transport(format!(
                        "{} returned an unreadable body: {e}",
                        self.name
                    ))),
                    Ok(body) => classify_response(&self.name, status, body),
                }
            }
        }
    }
}

/// Sort a JSON response into the dispatcher's outcome contract:
/// the distinguished suspension body, a success value, or a structured
/// error descriptor.
pub fn classify_response(service: &str, status: u16, body: Value) -> EndpointOutcome {
    if let Some(child) = suspension_marker(&body) {
        return EndpointOutcome::Suspended(child);
    }

    if (200..300).contains(&status) {
        return EndpointOutcome::Completed(body);
    }

    let message = body
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{service} responded with HTTP {status}"));

    EndpointOutcome::Failed(RunError::external(message).with_details(body))
}

/// The distinguished response shape by which an endpoint says "my own
/// processing suspended": `{"status": "suspended", "stack_run_id": ...}`.
fn suspension_marker(body: &Value) -> Option<ID> {
    if body.get("status").and_then(Value::as_str) != Some("suspended") {
        return None;
    }

    let raw = body.get("stack_run_id")?.as_str()?;

    ID::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn success_bodies_pass_through_unchanged() {
        let body = json!({"n": 41, "raw": [1, 2, 3]});
        match classify_response("x", 200, body.clone()) {
            EndpointOutcome::Completed(v) => assert_eq!(v, body),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn error_statuses_become_external_errors_with_details() {
        let body = json!({"error": "quota exhausted", "retry_after": 30});
        match classify_response("x", 429, body.clone()) {
            EndpointOutcome::Failed(e) => {
                assert_eq!(e.kind, ErrorKind::External);
                assert_eq!(e.message, "quota exhausted");
                assert_eq!(e.details, Some(body));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn error_without_message_reports_the_status() {
        match classify_response("mail", 500, json!({})) {
            EndpointOutcome::Failed(e) => {
                assert!(e.message.contains("500"), "got message {}", e.message)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn suspension_marker_is_recognized() {
        let child = ID::new();
        let body = json!({"status": "suspended", "stack_run_id": child.to_string()});

        match classify_response("code", 200, body) {
            EndpointOutcome::Suspended(id) => assert_eq!(id, child),
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[test]
    fn a_plain_status_field_is_not_a_suspension() {
        // endpoints legitimately return objects with a status key
        let body = json!({"status": "ok", "stack_run_id": "not even a uuid"});
        match classify_response("x", 200, body.clone()) {
            EndpointOutcome::Completed(v) => assert_eq!(v, body),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
