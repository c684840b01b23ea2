// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The canonical internal records flowing through the router, plus the wire
//! shapes for the batch endpoint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::timestamp::{from_epoch_f64, parse_event_time};

/// Sample rate header for the single-event endpoint.
pub const SAMPLE_RATE_HEADER: &str = "x-honeycomb-samplerate";
/// Event timestamp header for the single-event endpoint.
pub const TIMESTAMP_HEADER: &str = "x-honeycomb-event-time";
/// Token header gating the `/query` endpoint group.
pub const QUERY_TOKEN_HEADER: &str = "x-honeycomb-refinery-query";

/// Attribute marking a peer liveness probe; probes are dropped at ingest.
pub const PROBE_ATTRIBUTE: &str = "meta.refinery.probe";

/// Sample rate applied when the wire carries none (or an explicit zero).
pub const DEFAULT_SAMPLE_RATE: u32 = 1;

/// The canonical internal event record. Allocated per inbound record and
/// owned by the handler until handed to the collector or the upstream sink.
#[derive(Debug, Clone)]
pub struct Event {
    /// Correlation identifier assigned by the request logger middleware.
    pub request_id: Option<Uuid>,
    /// Upstream base URL this event should eventually be delivered to.
    pub api_host: String,
    pub api_key: String,
    pub dataset: String,
    /// Empty for legacy API keys.
    pub environment: String,
    /// Always >= 1 by the time the event leaves the normalizer.
    pub sample_rate: u32,
    /// `None` means "server time at ingest" under downstream policy.
    pub timestamp: Option<DateTime<Utc>>,
    pub data: HashMap<String, Value>,
}

/// An [`Event`] that participates in a trace.
#[derive(Debug, Clone)]
pub struct Span {
    pub event: Event,
    /// Non-empty by construction.
    pub trace_id: String,
    /// Synthesized from the trace id when the wire carries none.
    pub span_id: String,
    /// True iff none of the configured parent-id attribute names are present.
    pub is_root: bool,
}

/// One record of the wire-level batched envelope.
#[derive(Debug, Deserialize)]
pub struct BatchedEvent {
    #[serde(default)]
    pub time: Option<WireTime>,
    #[serde(default, rename = "samplerate")]
    pub sample_rate: i64,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

/// Batch record timestamps arrive as strings (all the header forms) or as a
/// bare numeric epoch, depending on the client SDK.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Text(String),
    Epoch(f64),
}

impl BatchedEvent {
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        match &self.time {
            Some(WireTime::Text(raw)) => parse_event_time(raw),
            Some(WireTime::Epoch(epoch)) => from_epoch_f64(*epoch),
            None => None,
        }
    }

    /// Zero on the wire means "use the default".
    pub fn sample_rate(&self) -> u32 {
        if self.sample_rate <= 0 {
            return DEFAULT_SAMPLE_RATE;
        }
        u32::try_from(self.sample_rate).unwrap_or(u32::MAX)
    }
}

/// Per-record status for the batch response, mirroring input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Auth lookup result from the upstream `/1/auth` probe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub api_key_access: HashMap<String, bool>,
    #[serde(default)]
    pub team: TeamInfo,
    #[serde(default)]
    pub environment: EnvironmentInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamInfo {
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentInfo {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

/// Legacy ("classic") API keys predate environment scoping: 32 hex chars.
pub fn is_legacy_api_key(key: &str) -> bool {
    key.len() == 32 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Synthesizes a span id from a trace id. Deterministic so that repeated
/// submissions of the same span hash identically for downstream dedup: the
/// first eight bytes of the trace id's SHA-256 digest, hex-encoded.
pub fn generate_span_id(trace_id: &str) -> String {
    let digest = Sha256::digest(trace_id.as_bytes());
    digest[..8].iter().fold(String::with_capacity(16), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}
