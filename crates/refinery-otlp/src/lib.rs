// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared OTLP translation helper for the refinery ingest router.
//!
//! Both transport front-ends (HTTP and gRPC) accept the OpenTelemetry
//! collector protocol for traces and logs. This crate turns the export
//! requests into dataset-keyed batches of flat attribute-map events that the
//! router's classifier understands, and extracts the request identity (API
//! key, dataset) from either HTTP headers or gRPC metadata.
//!
//! The translation is deliberately lossy in one direction only: every OTLP
//! record becomes exactly one event, nested attribute values survive as JSON
//! containers, and span/log identity fields are hex-encoded under the
//! well-known `trace.*` attribute names.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod common;
mod logs;
mod request;
mod traces;

pub use common::{Batch, OtlpEvent};
pub use logs::{translate_logs_request, unmarshal_logs_request};
pub use request::{
    api_key_from_headers, RequestInfo, API_KEY_HEADER, API_KEY_HEADER_SHORT, DATASET_HEADER,
};
pub use traces::{translate_trace_request, unmarshal_trace_request};

/// Errors produced while decoding or translating OTLP payloads.
#[derive(Debug, thiserror::Error)]
pub enum OtlpError {
    #[error("unsupported content type {0:?}")]
    InvalidContentType(String),

    #[error("failed to decode OTLP payload: {0}")]
    Decode(String),
}
