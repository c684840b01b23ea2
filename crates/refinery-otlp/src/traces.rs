// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP trace export translation.

use std::collections::HashMap;

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use opentelemetry_proto::tonic::trace::v1::Span;
use prost::Message;
use serde_json::Value;

use crate::common::{
    flatten_attributes, flatten_resource, flatten_scope, hex_id, resolve_dataset, take_sample_rate,
    timestamp_from_nanos, Batch, OtlpEvent,
};
use crate::{OtlpError, RequestInfo};

/// Decodes the body of an OTLP/HTTP trace export request. The gRPC front-end
/// skips this and hands the already-decoded message to
/// [`translate_trace_request`].
pub fn unmarshal_trace_request(
    content_type: &str,
    body: &[u8],
) -> Result<ExportTraceServiceRequest, OtlpError> {
    match content_type {
        "application/x-protobuf" | "application/protobuf" => {
            ExportTraceServiceRequest::decode(body).map_err(|e| OtlpError::Decode(e.to_string()))
        }
        "application/json" => {
            serde_json::from_slice(body).map_err(|e| OtlpError::Decode(e.to_string()))
        }
        other => Err(OtlpError::InvalidContentType(other.to_string())),
    }
}

/// Translates a trace export request into one batch per resource group.
pub fn translate_trace_request(
    request: &ExportTraceServiceRequest,
    info: &RequestInfo,
) -> Vec<Batch> {
    let mut batches = Vec::with_capacity(request.resource_spans.len());
    for resource_spans in &request.resource_spans {
        let resource = resource_spans.resource.as_ref();
        let dataset = resolve_dataset(info, resource);

        let mut resource_attrs = HashMap::new();
        flatten_resource(resource, &mut resource_attrs);

        let mut events = Vec::new();
        for scope_spans in &resource_spans.scope_spans {
            let mut scope_attrs = resource_attrs.clone();
            flatten_scope(scope_spans.scope.as_ref(), &mut scope_attrs);

            for span in &scope_spans.spans {
                events.push(translate_span(span, &scope_attrs));
            }
        }

        batches.push(Batch { dataset, events });
    }
    batches
}

fn translate_span(span: &Span, base: &HashMap<String, Value>) -> OtlpEvent {
    let mut attributes = base.clone();

    attributes.insert(
        "trace.trace_id".to_string(),
        Value::String(hex_id(&span.trace_id)),
    );
    attributes.insert(
        "trace.span_id".to_string(),
        Value::String(hex_id(&span.span_id)),
    );
    if !span.parent_span_id.is_empty() {
        attributes.insert(
            "trace.parent_id".to_string(),
            Value::String(hex_id(&span.parent_span_id)),
        );
    }

    attributes.insert("name".to_string(), Value::String(span.name.clone()));
    attributes.insert(
        "span.kind".to_string(),
        Value::String(span_kind_name(span.kind).to_string()),
    );
    attributes.insert(
        "meta.signal_type".to_string(),
        Value::String("trace".to_string()),
    );
    attributes.insert(
        "span.num_events".to_string(),
        Value::from(span.events.len()),
    );
    attributes.insert("span.num_links".to_string(), Value::from(span.links.len()));

    if span.end_time_unix_nano >= span.start_time_unix_nano {
        let duration_ms =
            (span.end_time_unix_nano - span.start_time_unix_nano) as f64 / 1_000_000.0;
        if let Some(n) = serde_json::Number::from_f64(duration_ms) {
            attributes.insert("duration_ms".to_string(), Value::Number(n));
        }
    }

    if let Some(status) = &span.status {
        attributes.insert("status_code".to_string(), Value::from(status.code));
        if status.code == StatusCode::Error as i32 {
            attributes.insert("error".to_string(), Value::Bool(true));
            if !status.message.is_empty() {
                attributes.insert(
                    "status_message".to_string(),
                    Value::String(status.message.clone()),
                );
            }
        }
    }

    flatten_attributes(&span.attributes, &mut attributes);
    let sample_rate = take_sample_rate(&mut attributes);

    OtlpEvent {
        timestamp: timestamp_from_nanos(span.start_time_unix_nano),
        sample_rate,
        attributes,
    }
}

fn span_kind_name(kind: i32) -> &'static str {
    match SpanKind::try_from(kind) {
        Ok(SpanKind::Internal) => "internal",
        Ok(SpanKind::Server) => "server",
        Ok(SpanKind::Client) => "client",
        Ok(SpanKind::Producer) => "producer",
        Ok(SpanKind::Consumer) => "consumer",
        _ => "unspecified",
    }
}
