// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pluggable wire decoding, keyed by content type. Two binary-object
//! families are supported: msgpack for the SDKs that send it, JSON for
//! everything else (including absent or unrecognized content types, which
//! the wire contract treats as JSON).

use http::{header, HeaderMap};
use serde::de::DeserializeOwned;

pub const CONTENT_TYPE_MSGPACK: &str = "application/x-msgpack";
pub const CONTENT_TYPE_MSGPACK_ALT: &str = "application/msgpack";

/// The request content type, or empty when absent or unreadable.
pub fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// The request content coding, or empty when absent or unreadable.
pub fn content_encoding(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum UnmarshalError {
    #[error("invalid msgpack payload: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decodes a request body according to its content type. Targets are loose
/// maps (`serde_json::Value` leaves), so msgpack integers, floats, and
/// strings all land in the same attribute representation JSON does.
pub fn unmarshal<T: DeserializeOwned>(content_type: &str, body: &[u8]) -> Result<T, UnmarshalError> {
    match content_type {
        CONTENT_TYPE_MSGPACK | CONTENT_TYPE_MSGPACK_ALT => Ok(rmp_serde::from_slice(body)?),
        _ => Ok(serde_json::from_slice(body)?),
    }
}
