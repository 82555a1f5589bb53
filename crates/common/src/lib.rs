//! Shared dependency prelude for the tasker workspace.
//!
//! Member crates pull third-party crates through here so the whole
//! workspace agrees on versions and feature sets.

pub mod prelude {
    pub use aide;
    pub use anyhow;
    pub use axum;
    pub use chrono;
    pub use config;
    pub use hyper;
    pub use itertools;
    pub use once_cell;
    pub use parking_lot;
    pub use reqwest;
    pub use schemars;
    pub use serde_json;
    pub use thiserror;
    pub use tokio;
    pub use tokio_postgres;
    pub use tracing;

    pub use serde::{Deserialize, Serialize};
}
