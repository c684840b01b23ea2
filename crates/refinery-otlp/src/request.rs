// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request identity extraction for both transport families.

use http::HeaderMap;
use tonic::metadata::MetadataMap;

/// Long-form API key header.
pub const API_KEY_HEADER: &str = "x-honeycomb-team";
/// Short-form API key header, consulted when the long form is absent.
pub const API_KEY_HEADER_SHORT: &str = "x-hny-team";
/// Dataset name header/metadata key for OTLP requests.
pub const DATASET_HEADER: &str = "x-honeycomb-dataset";

const CONTENT_TYPE: &str = "content-type";
const CONTENT_ENCODING: &str = "content-encoding";

/// Identity and framing information pulled off an inbound OTLP request.
///
/// The same shape is produced from HTTP headers and from gRPC metadata so the
/// translation and classification paths downstream are transport-agnostic.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub api_key: String,
    pub dataset: String,
    pub content_type: String,
    pub content_encoding: String,
}

impl RequestInfo {
    pub fn from_http_headers(headers: &HeaderMap) -> Self {
        RequestInfo {
            api_key: api_key_from_headers(headers),
            dataset: header_str(headers, DATASET_HEADER),
            content_type: header_str(headers, CONTENT_TYPE),
            content_encoding: header_str(headers, CONTENT_ENCODING),
        }
    }

    /// gRPC metadata lookup. Keys are normalized to lowercase by tonic, which
    /// gives us the case-insensitive match the wire contract requires.
    pub fn from_grpc_metadata(metadata: &MetadataMap) -> Self {
        let mut api_key = metadata_str(metadata, API_KEY_HEADER);
        if api_key.is_empty() {
            api_key = metadata_str(metadata, API_KEY_HEADER_SHORT);
        }
        RequestInfo {
            api_key,
            dataset: metadata_str(metadata, DATASET_HEADER),
            content_type: String::new(),
            content_encoding: String::new(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Returns the API key from the long header name, falling back to the short
/// one; empty string when neither is present.
pub fn api_key_from_headers(headers: &HeaderMap) -> String {
    let key = header_str(headers, API_KEY_HEADER);
    if key.is_empty() {
        return header_str(headers, API_KEY_HEADER_SHORT);
    }
    key
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn metadata_str(metadata: &MetadataMap, name: &str) -> String {
    metadata
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
