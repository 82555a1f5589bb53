//! Named callable endpoints, as the dispatcher sees them.
//!
//! The core records `(service_name, method_path, args)` verbatim and asks
//! this crate to perform the one outbound call a step represents. Which
//! URL a service name maps to, and which bearer token rides along, is
//! entirely configuration; nothing in here knows any endpoint's internal
//! shape.

pub mod endpoint;
pub mod shape;

use common::prelude::tracing;
use config::settings;
use dal::ID;
use models::RunError;
use serde_json::Value;

use crate::endpoint::HttpEndpoint;

/// How one outbound invocation ended, classified for the scheduler.
#[derive(Debug)]
pub enum EndpointOutcome {
    /// JSON success value, passed through byte-transparent (modulo the
    /// declarative list-shaping rules).
    Completed(Value),
    /// The endpoint's own processing suspended; it handed back the stack
    /// run to wait on.
    Suspended(ID),
    Failed(RunError),
}

/// Call the named service's method with the recorded args.
pub async fn invoke(service_name: &str, method_name: &str, args: &Value) -> EndpointOutcome {
    let Some(cfg) = settings().services.get(service_name) else {
        return EndpointOutcome::Failed(RunError::configuration(format!(
            "no endpoint is configured for service {service_name:?}"
        )));
    };

    let endpoint = HttpEndpoint::from_config(service_name, cfg);

    tracing::debug!("invoking {service_name}/{method_name}");
    let outcome = endpoint.invoke(method_name, args).await;

    match outcome {
        EndpointOutcome::Completed(v) => {
            EndpointOutcome::Completed(shape::apply(service_name, method_name, v))
        }
        other => other,
    }
}
