// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request normalization and event classification.
//!
//! Everything that arrives over either transport funnels through
//! [`RouterState::process_event`]: probes are dropped, events without a
//! trace id go straight to the upstream sink, and spans go to the collector,
//! short-circuiting through its immediate-decision path under stress.

use std::collections::HashMap;

use http::HeaderMap;
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::collect::CollectorError;
use crate::error::ApiError;
use crate::payload::unmarshal;
use crate::server::RouterState;
use crate::timestamp::parse_event_time;
use crate::types::{
    generate_span_id, is_legacy_api_key, Event, Span, DEFAULT_SAMPLE_RATE, PROBE_ATTRIBUTE,
    SAMPLE_RATE_HEADER, TIMESTAMP_HEADER,
};
use refinery_otlp::{api_key_from_headers, Batch, RequestInfo};

pub(crate) const METRIC_PROXIED: &str = "incoming_router_proxied";
pub(crate) const METRIC_EVENT: &str = "incoming_router_event";
pub(crate) const METRIC_BATCH: &str = "incoming_router_batch";
pub(crate) const METRIC_NONSPAN: &str = "incoming_router_nonspan";
pub(crate) const METRIC_SPAN: &str = "incoming_router_span";
pub(crate) const METRIC_DROPPED: &str = "incoming_router_dropped";

pub(crate) const ROUTER_METRICS: [&str; 6] = [
    METRIC_PROXIED,
    METRIC_EVENT,
    METRIC_BATCH,
    METRIC_NONSPAN,
    METRIC_SPAN,
    METRIC_DROPPED,
];

impl RouterState {
    /// Resolves the environment for an API key. Legacy and empty keys have
    /// no environment and never touch the cache.
    pub(crate) async fn environment_name(&self, api_key: &str) -> Result<String, ApiError> {
        if api_key.is_empty() || is_legacy_api_key(api_key) {
            return Ok(String::new());
        }
        self.environment_cache
            .get(api_key)
            .await
            .map_err(ApiError::req_to_event)
    }

    /// Synthesizes the canonical event record from a decoded single-event
    /// request. The dataset arrives already URL-decoded by the route layer.
    pub(crate) async fn request_to_event(
        &self,
        request_id: Option<Uuid>,
        headers: &HeaderMap,
        dataset: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Event, ApiError> {
        let api_key = api_key_from_headers(headers);

        let sample_rate = headers
            .get(SAMPLE_RATE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|r| *r > 0)
            .unwrap_or(DEFAULT_SAMPLE_RATE);

        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_event_time);

        if dataset.is_empty() {
            return Err(ApiError::req_to_event("missing dataset name"));
        }

        let environment = self.environment_name(&api_key).await?;

        let data: HashMap<String, Value> =
            unmarshal(content_type, body).map_err(ApiError::req_to_event)?;

        Ok(Event {
            request_id,
            api_host: self.config.upstream_api(),
            api_key,
            dataset: dataset.to_string(),
            environment,
            sample_rate,
            timestamp,
            data,
        })
    }

    /// Classifies one normalized event and dispatches it.
    pub(crate) fn process_event(&self, event: Event) -> Result<(), CollectorError> {
        // peer probes verify liveness only; they must not count or forward
        if event.data.contains_key(PROBE_ATTRIBUTE) {
            debug!(request_id = ?event.request_id, "dropping probe");
            return Ok(());
        }

        let trace_id = first_string_value(&event.data, &self.config.trace_id_field_names())
            .filter(|id| !id.is_empty());
        let Some(trace_id) = trace_id else {
            self.metrics.increment(METRIC_NONSPAN);
            debug!(
                request_id = ?event.request_id,
                dataset = %event.dataset,
                "forwarding non-trace event upstream"
            );
            self.upstream.enqueue_event(event);
            return Ok(());
        };

        let span_id = first_string_value(&event.data, &self.config.span_id_field_names())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_span_id(&trace_id));

        let is_root = !self
            .config
            .parent_id_field_names()
            .iter()
            .any(|name| event.data.contains_key(name));

        let request_id = event.request_id;
        let span = Span {
            event,
            trace_id,
            span_id,
            is_root,
        };

        if self.collector.stressed() {
            // fast deterministic decision per trace instead of buffering
            if self.collector.process_span_immediately(&span)? {
                return Ok(());
            }
        }

        match self.collector.add_span(span) {
            Ok(()) => {
                self.metrics.increment(METRIC_SPAN);
                debug!(request_id = ?request_id, "accepted span for collection");
                Ok(())
            }
            Err(CollectorError::WouldBlock) => {
                self.metrics.increment(METRIC_DROPPED);
                debug!(request_id = ?request_id, "dropping span, collector queue full");
                Err(CollectorError::WouldBlock)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs translated OTLP batches through the classifier. Classification
    /// failures are logged per record and do not fail the export request.
    pub(crate) async fn process_otlp_batches(
        &self,
        request_id: Option<Uuid>,
        info: &RequestInfo,
        batches: Vec<Batch>,
    ) -> Result<(), ApiError> {
        let api_host = self.config.upstream_api();
        let environment = self.environment_name(&info.api_key).await?;

        for batch in batches {
            for record in batch.events {
                let event = Event {
                    request_id,
                    api_host: api_host.clone(),
                    api_key: info.api_key.clone(),
                    dataset: batch.dataset.clone(),
                    environment: environment.clone(),
                    sample_rate: record.sample_rate.max(DEFAULT_SAMPLE_RATE),
                    timestamp: record.timestamp,
                    data: record.attributes,
                };
                if let Err(err) = self.process_event(event) {
                    error!(request_id = ?request_id, error = %err, "error processing OTLP event");
                }
            }
        }
        Ok(())
    }
}

/// First candidate attribute whose value is a string, empty or not.
/// Non-string values for a candidate name do not satisfy the scan.
fn first_string_value(data: &HashMap<String, Value>, names: &[String]) -> Option<String> {
    for name in names {
        if let Some(Value::String(value)) = data.get(name) {
            return Some(value.clone());
        }
    }
    None
}
