// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP logs export translation.

use std::collections::HashMap;

use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::logs::v1::LogRecord;
use prost::Message;
use serde_json::Value;

use crate::common::{
    any_value_to_json, flatten_attributes, flatten_resource, flatten_scope, hex_id,
    resolve_dataset, take_sample_rate, timestamp_from_nanos, Batch, OtlpEvent,
};
use crate::{OtlpError, RequestInfo};

/// Decodes the body of an OTLP/HTTP logs export request.
pub fn unmarshal_logs_request(
    content_type: &str,
    body: &[u8],
) -> Result<ExportLogsServiceRequest, OtlpError> {
    match content_type {
        "application/x-protobuf" | "application/protobuf" => {
            ExportLogsServiceRequest::decode(body).map_err(|e| OtlpError::Decode(e.to_string()))
        }
        "application/json" => {
            serde_json::from_slice(body).map_err(|e| OtlpError::Decode(e.to_string()))
        }
        other => Err(OtlpError::InvalidContentType(other.to_string())),
    }
}

/// Translates a logs export request into one batch per resource group.
///
/// Log records that carry a trace id participate in trace assembly just like
/// spans; records without one are forwarded upstream by the classifier.
pub fn translate_logs_request(
    request: &ExportLogsServiceRequest,
    info: &RequestInfo,
) -> Vec<Batch> {
    let mut batches = Vec::with_capacity(request.resource_logs.len());
    for resource_logs in &request.resource_logs {
        let resource = resource_logs.resource.as_ref();
        let dataset = resolve_dataset(info, resource);

        let mut resource_attrs = HashMap::new();
        flatten_resource(resource, &mut resource_attrs);

        let mut events = Vec::new();
        for scope_logs in &resource_logs.scope_logs {
            let mut scope_attrs = resource_attrs.clone();
            flatten_scope(scope_logs.scope.as_ref(), &mut scope_attrs);

            for record in &scope_logs.log_records {
                events.push(translate_log_record(record, &scope_attrs));
            }
        }

        batches.push(Batch { dataset, events });
    }
    batches
}

fn translate_log_record(record: &LogRecord, base: &HashMap<String, Value>) -> OtlpEvent {
    let mut attributes = base.clone();

    if !record.trace_id.is_empty() {
        attributes.insert(
            "trace.trace_id".to_string(),
            Value::String(hex_id(&record.trace_id)),
        );
    }
    if !record.span_id.is_empty() {
        attributes.insert(
            "trace.parent_id".to_string(),
            Value::String(hex_id(&record.span_id)),
        );
    }

    if let Some(body) = &record.body {
        attributes.insert("body".to_string(), any_value_to_json(body));
    }
    if !record.severity_text.is_empty() {
        attributes.insert(
            "severity".to_string(),
            Value::String(record.severity_text.clone()),
        );
    }
    if record.severity_number != 0 {
        attributes.insert("severity_code".to_string(), Value::from(record.severity_number));
    }
    attributes.insert(
        "meta.signal_type".to_string(),
        Value::String("log".to_string()),
    );

    flatten_attributes(&record.attributes, &mut attributes);
    let sample_rate = take_sample_rate(&mut attributes);

    let nanos = if record.time_unix_nano != 0 {
        record.time_unix_nano
    } else {
        record.observed_time_unix_nano
    };

    OtlpEvent {
        timestamp: timestamp_from_nanos(nanos),
        sample_rate,
        attributes,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
    use opentelemetry_proto::tonic::logs::v1::{ResourceLogs, ScopeLogs};
    use opentelemetry_proto::tonic::resource::v1::Resource;

    fn sample_request() -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: Some(Resource {
                    attributes: vec![KeyValue {
                        key: "service.name".to_string(),
                        value: Some(AnyValue {
                            value: Some(any_value::Value::StringValue("checkout".to_string())),
                        }),
                    }],
                    ..Resource::default()
                }),
                scope_logs: vec![ScopeLogs {
                    scope: None,
                    log_records: vec![LogRecord {
                        observed_time_unix_nano: 1_700_000_000_000_000_000,
                        severity_text: "ERROR".to_string(),
                        severity_number: 17,
                        body: Some(AnyValue {
                            value: Some(any_value::Value::StringValue(
                                "payment failed".to_string(),
                            )),
                        }),
                        trace_id: vec![0x0c; 16],
                        ..LogRecord::default()
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        }
    }

    #[test]
    fn translates_log_records() {
        let info = RequestInfo::default();
        let batches = translate_logs_request(&sample_request(), &info);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].dataset, "checkout");

        let event = &batches[0].events[0];
        assert_eq!(event.sample_rate, 1);
        assert_eq!(
            event.attributes["body"],
            Value::String("payment failed".to_string())
        );
        assert_eq!(event.attributes["severity"], Value::String("ERROR".into()));
        assert_eq!(
            event.attributes["trace.trace_id"],
            Value::String("0c".repeat(16))
        );
        assert_eq!(
            event.attributes["meta.signal_type"],
            Value::String("log".into())
        );
        // observed time is the fallback when the record time is unset
        assert_eq!(event.timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn unmarshal_decodes_protobuf_bytes() {
        let body = sample_request().encode_to_vec();
        let decoded = unmarshal_logs_request("application/protobuf", &body).unwrap();
        assert_eq!(decoded.resource_logs.len(), 1);
    }
}
