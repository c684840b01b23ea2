// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared pieces of the OTLP-to-event translation: attribute flattening,
//! identifier encoding, timestamps, and per-record sample rates.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use serde_json::Value;

use crate::RequestInfo;

/// Resource attribute that names the emitting service.
pub(crate) const SERVICE_NAME_KEY: &str = "service.name";
/// Dataset used when neither the request metadata nor the resource name one.
pub(crate) const UNKNOWN_DATASET: &str = "unknown_service";

const SAMPLE_RATE_KEYS: [&str; 2] = ["sampleRate", "SampleRate"];

/// One translated OTLP record: a flat attribute map plus the fields the
/// router's normalizer needs before classification.
#[derive(Debug, Clone)]
pub struct OtlpEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub sample_rate: u32,
    pub attributes: HashMap<String, Value>,
}

/// A group of translated records destined for a single dataset.
#[derive(Debug, Clone)]
pub struct Batch {
    pub dataset: String,
    pub events: Vec<OtlpEvent>,
}

/// Resolves the dataset for a resource: the request-supplied name wins, then
/// the `service.name` resource attribute, then the unknown-service bucket.
pub(crate) fn resolve_dataset(info: &RequestInfo, resource: Option<&Resource>) -> String {
    if !info.dataset.is_empty() {
        return info.dataset.clone();
    }
    let service_name = resource
        .map(|r| r.attributes.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|kv| kv.key == SERVICE_NAME_KEY)
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| match &v.value {
            Some(any_value::Value::StringValue(s)) => Some(s.trim().to_string()),
            _ => None,
        })
        .unwrap_or_default();
    if service_name.is_empty() || service_name.starts_with(UNKNOWN_DATASET) {
        UNKNOWN_DATASET.to_string()
    } else {
        service_name
    }
}

pub(crate) fn flatten_resource(resource: Option<&Resource>, out: &mut HashMap<String, Value>) {
    if let Some(resource) = resource {
        flatten_attributes(&resource.attributes, out);
    }
}

pub(crate) fn flatten_scope(scope: Option<&InstrumentationScope>, out: &mut HashMap<String, Value>) {
    if let Some(scope) = scope {
        if !scope.name.is_empty() {
            out.insert("library.name".to_string(), Value::String(scope.name.clone()));
        }
        if !scope.version.is_empty() {
            out.insert(
                "library.version".to_string(),
                Value::String(scope.version.clone()),
            );
        }
    }
}

pub(crate) fn flatten_attributes(attributes: &[KeyValue], out: &mut HashMap<String, Value>) {
    for kv in attributes {
        let value = kv
            .value
            .as_ref()
            .map(any_value_to_json)
            .unwrap_or(Value::Null);
        out.insert(kv.key.clone(), value);
    }
}

/// Converts an OTLP `AnyValue` into a JSON value, preserving containers.
/// Byte values are lossily stringified; there is no better flat encoding.
pub(crate) fn any_value_to_json(value: &AnyValue) -> Value {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => Value::String(s.clone()),
        Some(any_value::Value::BoolValue(b)) => Value::Bool(*b),
        Some(any_value::Value::IntValue(i)) => Value::from(*i),
        Some(any_value::Value::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map_or(Value::Null, Value::Number)
        }
        Some(any_value::Value::ArrayValue(arr)) => {
            Value::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(any_value::Value::KvlistValue(kvs)) => {
            let mut map = serde_json::Map::with_capacity(kvs.values.len());
            for kv in &kvs.values {
                let value = kv
                    .value
                    .as_ref()
                    .map(any_value_to_json)
                    .unwrap_or(Value::Null);
                map.insert(kv.key.clone(), value);
            }
            Value::Object(map)
        }
        Some(any_value::Value::BytesValue(bytes)) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        None => Value::Null,
    }
}

/// Hex-encodes an OTLP identifier; empty input yields the empty string.
pub(crate) fn hex_id(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            use std::fmt::Write;
            let _ = write!(out, "{b:02x}");
            out
        },
    )
}

/// Converts a unix-nanosecond timestamp to UTC; zero means "unset".
pub(crate) fn timestamp_from_nanos(nanos: u64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    let secs = (nanos / 1_000_000_000) as i64;
    let subsec = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, subsec).single()
}

/// Pulls the per-record sample rate out of the attribute map, removing the
/// attribute so it is not double-counted downstream. Absent or non-positive
/// rates collapse to the default of 1.
pub(crate) fn take_sample_rate(attributes: &mut HashMap<String, Value>) -> u32 {
    for key in SAMPLE_RATE_KEYS {
        if let Some(value) = attributes.remove(key) {
            return match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .filter(|r| *r > 0)
                    .map(|r| u32::try_from(r).unwrap_or(u32::MAX))
                    .unwrap_or(1),
                Value::String(s) => s.parse::<u32>().ok().filter(|r| *r > 0).unwrap_or(1),
                _ => 1,
            };
        }
    }
    1
}
