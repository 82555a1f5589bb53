//! Web-facing helpers shared by the gateway: error-to-response adapters and
//! the wire shape of API errors.

use common::prelude::*;

use axum::http::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{backtrace::Backtrace, collections::HashMap};

pub trait ResultWithCode<V>: Sized {
    fn log_error<S>(
        self,
        code: StatusCode,
        outward_message: S,
        should_log: bool,
    ) -> Result<V, (StatusCode, String)>
    where
        S: Into<String>;

    fn log_server_error<S>(
        self,
        outward_message: S,
        should_log: bool,
    ) -> Result<V, (StatusCode, String)>
    where
        S: Into<String>,
    {
        self.log_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            outward_message,
            should_log,
        )
    }

    fn log_db_client_error(self) -> Result<V, (StatusCode, String)> {
        self.log_server_error(
            "the server was unable to establish a proper internal connection to the durable store",
            true,
        )
    }
}

impl<V> ResultWithCode<V> for Result<V, anyhow::Error> {
    fn log_error<S>(
        self,
        code: StatusCode,
        outward_message: S,
        should_log: bool,
    ) -> Result<V, (StatusCode, String)>
    where
        S: Into<String>,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => {
                let outward_message: String = outward_message.into();
                let outward_message = format!("Error handling request: {outward_message}");

                if should_log {
                    tracing::error!("Error occurred while handling a request: {e:?}");
                }

                Err((code, outward_message))
            }
        }
    }
}

impl<V> ResultWithCode<V> for Option<V> {
    fn log_error<S>(
        self,
        code: StatusCode,
        outward_message: S,
        should_log: bool,
    ) -> Result<V, (StatusCode, String)>
    where
        S: Into<String>,
    {
        match self {
            Some(v) => Ok(v),
            None => {
                let outward_message: String = outward_message.into();
                let outward_message = format!("Error handling request: {outward_message}");

                if should_log {
                    tracing::error!("Error occurred while handling a request: object did not exist");
                }

                Err((code, outward_message))
            }
        }
    }
}

pub trait AnyWay<T> {
    fn anyway(self) -> Result<T, anyhow::Error>;
}

impl<T, E> AnyWay<T> for Result<T, E>
where
    E: std::error::Error + Sync + Send + 'static,
{
    fn anyway(self) -> Result<T, anyhow::Error> {
        self.map_err(anyhow::Error::new)
    }
}

#[derive(Clone, Deserialize, Serialize, JsonSchema, Debug)]
pub struct ApiError {
    pub http_code: String,
    pub error_message: String,
    pub related_data: HashMap<String, Value>, // Value name and value
    pub trace: Option<String>,                // backtrace as a string
}

impl ApiError {
    pub fn new(
        code: StatusCode,
        msg: String,
        data: HashMap<String, Value>,
        trace: Option<Backtrace>,
    ) -> ApiError {
        ApiError {
            http_code: code.to_string(),
            error_message: msg,
            related_data: data,
            trace: trace.map(|bt| format!("{bt}")),
        }
    }

    pub fn trivial(code: StatusCode, msg: String) -> Self {
        Self::new(
            code,
            msg,
            Default::default(),
            Some(Backtrace::force_capture()),
        )
    }
}
