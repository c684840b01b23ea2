// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error kinds surfaced by the router layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt::Display;
use tracing::error;

/// A handler-facing error: a fixed public message and status, plus detail
/// that is safe to echo to the caller (it never contains payload contents).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: &'static str,
    pub detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str, detail: Option<String>) -> Self {
        ApiError {
            status,
            message,
            detail,
        }
    }

    /// Body read / decompression failure.
    pub fn post_body(err: impl Display) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "failed to read request body",
            Some(err.to_string()),
        )
    }

    /// Wire decode failure.
    pub fn json_failed(err: impl Display) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "failed to parse request body",
            Some(err.to_string()),
        )
    }

    /// Response encode failure.
    pub fn json_build_failed(err: impl Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to create response",
            Some(err.to_string()),
        )
    }

    /// Normalization failure (missing dataset, config lookup, env lookup).
    pub fn req_to_event(err: impl Display) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "failed to process event",
            Some(err.to_string()),
        )
    }

    pub fn auth_needed() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "api key is required", None)
    }

    pub fn invalid_api_key() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "api key is not accepted by this proxy",
            None,
        )
    }

    pub fn invalid_query_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid query token", None)
    }

    /// Downstream queue full; surfaced as 429.
    pub fn would_block(err: impl Display) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "event dropped: queue is full",
            Some(err.to_string()),
        )
    }

    /// Any other collector refusal.
    pub fn collector(err: impl Display) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "failed to hand event to the collector",
            Some(err.to_string()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.detail {
            Some(detail) => json!({"error": self.message, "detail": detail}),
            None => json!({"error": self.message}),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Fatal errors from server construction, startup, and shutdown. `stop()`
/// returns the first of these seen; later ones are logged.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to initialize zstd decoder pool: {0}")]
    DecoderInit(std::io::Error),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid grpc listen address {addr:?}: {source}")]
    GrpcAddr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("grpc transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    #[error("failed to build upstream http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("http server error: {0}")]
    Http(std::io::Error),

    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    #[error("server is not running")]
    NotRunning,
}

/// Errors from the environment auth probe. These are returned to the caller
/// and never cached.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("received 401 response for auth request from upstream - check your API key")]
    Unauthorized,

    #[error("received {0} response for auth request from upstream")]
    UpstreamStatus(u16),

    #[error("failed sending auth request to upstream: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to decode auth response from upstream")]
    Decode,
}

/// Logs a recovered panic payload and keeps the response body generic.
pub(crate) fn describe_panic(err: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn log_panic(err: &(dyn std::any::Any + Send)) {
    error!(panic = %describe_panic(err), "recovered panic in request handler");
}
