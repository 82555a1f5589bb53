//! The self-trigger cascade.
//!
//! After every step a worker fires one fire-and-forget request at a
//! worker's `process-next` endpoint, which keeps the queue draining
//! without any polling loop. Losing a trigger only degrades throughput:
//! the next inbound request of any kind sweeps and selects again.

use common::prelude::{once_cell::sync::Lazy, reqwest, tokio, tracing};
use config::settings;

/// Header carrying the shared secret on internal endpoints.
pub const PROCESS_SECRET_HEADER: &str = "x-tasker-secret";

static HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Best-effort, non-blocking "someone should process the next step".
pub fn fire_process_next() {
    let url = format!("{}/api/v1/process-next", settings().web.external_url);
    let secret = settings().web.process_secret.clone();

    tokio::spawn(async move {
        let res = HTTP
            .post(&url)
            .header(PROCESS_SECRET_HEADER, secret)
            .send()
            .await;

        if let Err(e) = res {
            tracing::debug!("cascade trigger to {url} didn't land: {e}");
        }
    });
}
