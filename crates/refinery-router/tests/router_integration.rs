// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the HTTP front-end, driven over real sockets.

mod common;

use std::io::Write;
use std::sync::atomic::Ordering;

use common::{start_router, LEGACY_KEY};
use httpmock::prelude::*;
use refinery_router::config::StaticConfig;
use serde_json::{json, Value};

const BATCH_BODY: &str =
    r#"[{"time":"2024-01-02T03:04:05Z","samplerate":0,"data":{"trace.trace_id":"abc","name":"s"}}]"#;

#[tokio::test]
async fn batch_accepts_span_with_defaulted_sample_rate() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("Content-Type", "application/json")
        .body(BATCH_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!([{"status": 202}]));

    let added = harness.collector.added();
    assert_eq!(added.len(), 1);
    let span = &added[0];
    assert_eq!(span.trace_id, "abc");
    assert_eq!(span.event.sample_rate, 1, "explicit zero defaults to 1");
    assert_eq!(span.event.environment, "", "legacy keys have no environment");
    assert_eq!(span.event.dataset, "myds");
    assert!(span.is_root);
    assert_eq!(
        span.event.timestamp.unwrap().to_rfc3339(),
        "2024-01-02T03:04:05+00:00"
    );
    assert_eq!(harness.metrics.count("incoming_router_span"), 1);
    assert_eq!(harness.metrics.count("incoming_router_batch"), 1);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn batch_reports_would_block_per_record() {
    let mut harness = start_router(StaticConfig::default()).await;
    harness.collector.would_block.store(true, Ordering::SeqCst);

    let response = reqwest::Client::new()
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .body(BATCH_BODY)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body[0]["status"], 429);
    assert!(body[0]["error"].as_str().unwrap().contains("full"));
    assert_eq!(harness.metrics.count("incoming_router_dropped"), 1);
    assert_eq!(harness.metrics.count("incoming_router_span"), 0);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn batch_response_mirrors_input_order_and_length() {
    let mut harness = start_router(StaticConfig::default()).await;
    harness.collector.would_block.store(true, Ordering::SeqCst);

    // span records hit the refusing collector; the middle record has no
    // trace id and goes upstream instead
    let body = json!([
        {"data": {"trace.trace_id": "t1"}},
        {"data": {"name": "just-an-event"}},
        {"data": {"trace.trace_id": "t2"}},
    ]);

    let response = reqwest::Client::new()
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .json(&body)
        .send()
        .await
        .unwrap();

    let statuses: Vec<u64> = response.json::<Value>().await.unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_u64().unwrap())
        .collect();
    assert_eq!(statuses, vec![429, 202, 429]);
    assert_eq!(harness.upstream.enqueued().len(), 1);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn probe_events_are_dropped_silently() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .body(r#"{"meta.refinery.probe":true}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(harness.collector.added().is_empty());
    assert!(harness.upstream.enqueued().is_empty());
    assert_eq!(harness.metrics.count("incoming_router_span"), 0);
    assert_eq!(harness.metrics.count("incoming_router_nonspan"), 0);
    assert_eq!(harness.metrics.count("incoming_router_dropped"), 0);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn alive_reports_unhealthy_with_503() {
    let mut harness = start_router(StaticConfig::default()).await;
    harness.health.set_alive(false);

    let response = reqwest::get(harness.url("/alive")).await.unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"source": "refinery", "alive": "no"}));

    harness.health.set_alive(true);
    let response = reqwest::get(harness.url("/alive")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"source": "refinery", "alive": "yes"}));

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn ready_reports_unready_with_503() {
    let mut harness = start_router(StaticConfig::default()).await;
    harness.health.set_ready(false);

    let response = reqwest::get(harness.url("/ready")).await.unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"source": "refinery", "ready": "no"}));

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_cold_requests_share_one_auth_lookup() {
    let auth_server = MockServer::start_async().await;
    let auth_mock = auth_server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/1/auth")
                .header("x-honeycomb-team", "k2");
            then.status(200)
                .json_body(json!({"environment": {"name": "prod"}}));
        })
        .await;

    let config = StaticConfig {
        upstream_api: auth_server.base_url(),
        ..StaticConfig::default()
    };
    let mut harness = start_router(config).await;

    let client = reqwest::Client::new();
    let first = client
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", "k2")
        .body(r#"{"trace.trace_id":"t1"}"#)
        .send();
    let second = client
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", "k2")
        .body(r#"{"trace.trace_id":"t2"}"#)
        .send();

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().status(), 200);
    assert_eq!(second.unwrap().status(), 200);

    auth_mock.assert_hits_async(1).await;
    let added = harness.collector.added();
    assert_eq!(added.len(), 2);
    assert!(added.iter().all(|s| s.event.environment == "prod"));

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn auth_failures_surface_as_request_errors() {
    let auth_server = MockServer::start_async().await;
    auth_server
        .mock_async(|when, then| {
            when.method(GET).path("/1/auth");
            then.status(401);
        })
        .await;

    let config = StaticConfig {
        upstream_api: auth_server.base_url(),
        ..StaticConfig::default()
    };
    let mut harness = start_router(config).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", "not-a-legacy-key")
        .body(r#"{"trace.trace_id":"t"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert!(harness.collector.added().is_empty());

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_zstd_body_is_post_body_error_and_pool_recovers() {
    let mut harness = start_router(StaticConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("Content-Encoding", "zstd")
        .body(&b"this is not zstd at all"[..])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "failed to read request body");

    // the decoder went back to the pool; a valid frame decodes fine
    let compressed = zstd::encode_all(BATCH_BODY.as_bytes(), 3).unwrap();
    let response = client
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("Content-Encoding", "zstd")
        .body(compressed)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(harness.collector.added().len(), 1);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn gzip_and_msgpack_bodies_are_understood() {
    let mut harness = start_router(StaticConfig::default()).await;
    let client = reqwest::Client::new();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(BATCH_BODY.as_bytes()).unwrap();
    let gzipped = encoder.finish().unwrap();

    let response = client
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("Content-Encoding", "gzip")
        .body(gzipped)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(harness.collector.added().len(), 1);

    // one msgpack record with a trace id
    #[derive(serde::Serialize)]
    struct Record {
        data: std::collections::HashMap<String, String>,
    }
    let mut data = std::collections::HashMap::new();
    data.insert("trace.trace_id".to_string(), "mp-trace".to_string());
    let body = rmp_serde::to_vec_named(&vec![Record { data }]).unwrap();

    let response = client
        .post(harness.url("/1/batch/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("Content-Type", "application/x-msgpack")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let added = harness.collector.added();
    assert_eq!(added.len(), 2);
    assert_eq!(added[1].trace_id, "mp-trace");

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn event_endpoint_requires_an_api_key() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn configured_key_list_rejects_unknown_keys() {
    // the accepted key is legacy-format so no environment lookup fires
    let config = StaticConfig {
        accept_api_keys: vec![LEGACY_KEY.to_string()],
        ..StaticConfig::default()
    };
    let mut harness = start_router(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", "denied")
        .body(r#"{"trace.trace_id":"t"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(harness.url("/1/events/myds"))
        .header("X-Hny-Team", LEGACY_KEY)
        .body(r#"{"trace.trace_id":"t"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "short header name is honored");

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn event_honors_sample_rate_and_time_headers() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("X-Honeycomb-SampleRate", "5")
        .header("X-Honeycomb-Event-Time", "1700000000")
        .body(r#"{"trace.trace_id":"t","trace.parent_id":"p"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let added = harness.collector.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].event.sample_rate, 5);
    assert_eq!(added[0].event.timestamp.unwrap().timestamp(), 1_700_000_000);
    assert!(!added[0].is_root, "parent id present means not a root span");
    // span id was synthesized deterministically from the trace id
    assert_eq!(added[0].span_id.len(), 16);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn stressed_collector_short_circuits() {
    let mut harness = start_router(StaticConfig::default()).await;
    harness.collector.stressed.store(true, Ordering::SeqCst);
    harness
        .collector
        .process_immediately
        .store(true, Ordering::SeqCst);

    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .body(r#"{"trace.trace_id":"t"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(harness.collector.immediate_calls.load(Ordering::SeqCst), 1);
    assert!(
        harness.collector.added().is_empty(),
        "immediately-processed spans skip add_span"
    );

    // "not processed" falls through to the normal path
    harness
        .collector
        .process_immediately
        .store(false, Ordering::SeqCst);
    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .body(r#"{"trace.trace_id":"t2"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(harness.collector.added().len(), 1);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn nonspan_events_go_upstream_only() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/events/myds"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .body(r#"{"name":"no trace here"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(harness.collector.added().is_empty());
    assert_eq!(harness.upstream.enqueued().len(), 1);
    assert_eq!(harness.metrics.count("incoming_router_nonspan"), 1);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn version_endpoint_reports_startup_version() {
    let mut harness = start_router(StaticConfig::default()).await;

    let body: Value = reqwest::get(harness.url("/version"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"source": "refinery", "version": "test-version"}));

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn panic_recovery_returns_500_with_safe_body() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::get(harness.url("/panic")).await.unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "internal server error"}));

    // the server survives the panic
    let response = reqwest::get(harness.url("/version")).await.unwrap();
    assert_eq!(response.status(), 200);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn query_endpoints_are_token_gated() {
    let config = StaticConfig {
        query_auth_token: "secret".to_string(),
        ..StaticConfig::default()
    };
    let mut harness = start_router(config).await;
    let client = reqwest::Client::new();

    let response = client
        .get(harness.url("/query/trace/tid"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(harness.url("/query/trace/tid"))
        .header("X-Honeycomb-Refinery-Query", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"traceID": "tid"}));

    let response = client
        .get(harness.url("/query/rules/toml/myds"))
        .header("X-Honeycomb-Refinery-Query", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/toml"
    );
    assert!(response.text().await.unwrap().contains("SampleRate = 1"));

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn query_endpoints_stay_closed_without_a_configured_token() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .get(harness.url("/query/configmetadata"))
        .header("X-Honeycomb-Refinery-Query", "anything")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_paths_proxy_to_upstream() {
    let upstream = MockServer::start_async().await;
    let proxied = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/1/markers/myds");
            then.status(201).body("created");
        })
        .await;

    let config = StaticConfig {
        upstream_api: upstream.base_url(),
        ..StaticConfig::default()
    };
    let mut harness = start_router(config).await;

    let response = reqwest::Client::new()
        .post(harness.url("/1/markers/myds"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "created");
    proxied.assert_async().await;
    assert_eq!(harness.metrics.count("incoming_router_proxied"), 1);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn otlp_http_traces_flow_through_the_classifier() {
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use prost::Message;

    let mut harness = start_router(StaticConfig::default()).await;

    let request = ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: None,
            scope_spans: vec![ScopeSpans {
                scope: None,
                spans: vec![Span {
                    trace_id: vec![0xaa; 16],
                    span_id: vec![0xbb; 8],
                    name: "otlp-span".to_string(),
                    ..Span::default()
                }],
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }],
    };

    let response = reqwest::Client::new()
        .post(harness.url("/v1/traces"))
        .header("X-Honeycomb-Team", LEGACY_KEY)
        .header("X-Honeycomb-Dataset", "otlp-ds")
        .header("Content-Type", "application/x-protobuf")
        .body(request.encode_to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/x-protobuf"
    );

    let added = harness.collector.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].trace_id, "aa".repeat(16));
    assert_eq!(added[0].span_id, "bb".repeat(8));
    assert_eq!(added[0].event.dataset, "otlp-ds");

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn otlp_http_requires_an_api_key() {
    let mut harness = start_router(StaticConfig::default()).await;

    let response = reqwest::Client::new()
        .post(harness.url("/v1/traces"))
        .header("Content-Type", "application/x-protobuf")
        .body(Vec::new())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    harness.router.stop().await.unwrap();
}

#[tokio::test]
async fn stop_refuses_new_connections_and_closes_done_exactly_once() {
    let mut harness = start_router(StaticConfig::default()).await;
    let addr = harness.addr;
    let done = harness.router.done_token();
    assert!(!done.is_cancelled());

    harness.router.stop().await.unwrap();
    assert!(done.is_cancelled());

    let connect = tokio::net::TcpStream::connect(addr).await;
    assert!(connect.is_err(), "listener must be closed after stop");

    // a second stop is an error, not a second shutdown
    assert!(harness.router.stop().await.is_err());
}
