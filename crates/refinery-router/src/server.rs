// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP front-end and server lifecycle.
//!
//! The router owns two listening servers: the axum HTTP server built here,
//! and the tonic gRPC server in [`crate::grpc`]. Both are started into
//! background tasks and drained through a shared shutdown token; a separate
//! done token ends the gRPC health ticker last.
//!
//! Endpoints that do not belong to this proxy are reverse-proxied to the
//! upstream API unmodified, so a client can point its SDK at the router and
//! keep using upstream-only endpoints like marker creation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceResponse;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceResponse;
use prost::Message;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::{AuthClient, EnvironmentCache};
use crate::collect::{Collector, CollectorError};
use crate::config::Config;
use crate::decoder::{decode_body, DecoderPool, NUM_ZSTD_DECODERS};
use crate::error::{log_panic, ApiError, ServerError};
use crate::grpc;
use crate::health::HealthReporter;
use crate::metrics::Metrics;
use crate::processor::{METRIC_BATCH, METRIC_EVENT, METRIC_PROXIED, ROUTER_METRICS};
use crate::payload::{content_encoding, content_type};
use crate::transmit::Transmission;
use crate::types::{BatchResponse, BatchedEvent, Event, QUERY_TOKEN_HEADER};
use refinery_otlp::{
    api_key_from_headers, translate_logs_request, translate_trace_request,
    unmarshal_logs_request, unmarshal_trace_request, RequestInfo,
};

/// Client timeout for the reverse proxy and the auth probe.
const PROXY_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard deadline for draining in-flight HTTP handlers on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(60);

/// Transport-level cap on request bodies.
const MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Cap on a body after content decoding, guarding against small compressed
/// bodies that inflate enormously.
const MAX_DECODED_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Per-request correlation identifier, assigned by the request logger
/// middleware and propagated through request extensions.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Everything a handler needs, cloned per request. All collaborators are
/// injected at construction; the router holds no global state.
#[derive(Clone)]
pub struct RouterState {
    pub(crate) config: Arc<dyn Config>,
    pub(crate) health: Arc<dyn HealthReporter>,
    pub(crate) collector: Arc<dyn Collector>,
    pub(crate) upstream: Arc<dyn Transmission>,
    pub(crate) metrics: Arc<dyn Metrics>,
    pub(crate) environment_cache: Arc<EnvironmentCache<AuthClient>>,
    pub(crate) decoders: Arc<DecoderPool>,
    pub(crate) proxy_client: reqwest::Client,
    pub(crate) version: String,
}

/// The ingest router: accepts telemetry over HTTP and gRPC, classifies it,
/// and routes it to the collector or the upstream sink.
pub struct Router {
    state: RouterState,
    shutdown: CancellationToken,
    done: CancellationToken,
    http_addr: Option<SocketAddr>,
    grpc_addr: Option<SocketAddr>,
    http_task: Option<JoinHandle<std::io::Result<()>>>,
    grpc_task: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    ticker_task: Option<JoinHandle<()>>,
}

impl Router {
    /// Wires up the router. Decoder construction failures abort here, before
    /// anything listens.
    pub fn new(
        config: Arc<dyn Config>,
        health: Arc<dyn HealthReporter>,
        collector: Arc<dyn Collector>,
        upstream: Arc<dyn Transmission>,
        metrics: Arc<dyn Metrics>,
        version: impl Into<String>,
    ) -> Result<Self, ServerError> {
        let decoders = Arc::new(DecoderPool::new(NUM_ZSTD_DECODERS).map_err(ServerError::DecoderInit)?);

        let proxy_client = reqwest::Client::builder()
            .timeout(PROXY_CLIENT_TIMEOUT)
            .build()?;

        let environment_cache = Arc::new(EnvironmentCache::new(
            config.environment_cache_ttl(),
            AuthClient::new(proxy_client.clone(), config.upstream_api()),
        ));

        for name in ROUTER_METRICS {
            metrics.register(name, "counter");
        }

        Ok(Router {
            state: RouterState {
                config,
                health,
                collector,
                upstream,
                metrics,
                environment_cache,
                decoders,
                proxy_client,
                version: version.into(),
            },
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            http_addr: None,
            grpc_addr: None,
            http_task: None,
            grpc_task: None,
            ticker_task: None,
        })
    }

    /// Binds the listeners and starts serving in background tasks.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let listen_addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::Http)?;
        self.http_addr = Some(local_addr);
        info!(addr = %local_addr, "listening for HTTP traffic");

        let app = build_app(self.state.clone());
        let shutdown = self.shutdown.clone();
        self.http_task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }));

        let grpc_listen_addr = self.state.config.grpc_listen_addr();
        if self.state.config.grpc_enabled() && !grpc_listen_addr.is_empty() {
            let addr: SocketAddr =
                grpc_listen_addr
                    .parse()
                    .map_err(|source| ServerError::GrpcAddr {
                        addr: grpc_listen_addr.clone(),
                        source,
                    })?;
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: grpc_listen_addr.clone(),
                    source,
                })?;
            let local_addr = listener.local_addr().map_err(ServerError::Http)?;
            self.grpc_addr = Some(local_addr);
            info!(addr = %local_addr, "listening for gRPC traffic");

            let (grpc_task, ticker_task) = grpc::spawn(
                self.state.clone(),
                listener,
                self.shutdown.clone(),
                self.done.clone(),
            );
            self.grpc_task = Some(grpc_task);
            self.ticker_task = Some(ticker_task);
        }

        Ok(())
    }

    /// Stops accepting, drains in-flight handlers within the one-minute
    /// deadline, stops gRPC, then signals the done token and waits for the
    /// background tasks. The first fatal error is returned; later ones are
    /// logged.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let Some(http_task) = self.http_task.take() else {
            return Err(ServerError::NotRunning);
        };

        self.shutdown.cancel();

        let mut first_err: Option<ServerError> = None;
        match tokio::time::timeout(SHUTDOWN_DEADLINE, http_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => first_err = Some(ServerError::Http(err)),
            Ok(Err(join_err)) => {
                error!(error = %join_err, "http server task failed");
            }
            Err(_) => first_err = Some(ServerError::ShutdownTimeout),
        }

        if let Some(grpc_task) = self.grpc_task.take() {
            match grpc_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "grpc server shutdown error");
                    if first_err.is_none() {
                        first_err = Some(ServerError::GrpcTransport(err));
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "grpc server task failed");
                }
            }
        }

        self.done.cancel();
        if let Some(ticker) = self.ticker_task.take() {
            let _ = ticker.await;
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Actual bound HTTP address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Actual bound gRPC address, once started (and enabled).
    pub fn grpc_local_addr(&self) -> Option<SocketAddr> {
        self.grpc_addr
    }

    /// Internal done signal; observable so embedders can tie cleanup to it.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }
}

fn build_app(state: RouterState) -> AxumRouter {
    let query_routes = AxumRouter::new()
        .route("/trace/{trace_id}", get(debug_trace))
        .route("/rules/{format}/{dataset}", get(sampler_rules))
        .route("/allrules/{format}", get(all_sampler_rules))
        .route("/configmetadata", get(config_metadata))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            query_token_checker,
        ));

    let authed_routes = AxumRouter::new()
        .route("/events/{dataset}", post(event))
        .route("/batch/{dataset}", post(batch))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_checker,
        ));

    let otlp_routes = AxumRouter::new()
        .route("/traces", post(otlp_traces))
        .route("/traces/", post(otlp_traces))
        .route("/logs", post(otlp_logs))
        .route("/logs/", post(otlp_logs));

    AxumRouter::new()
        .route("/alive", get(alive))
        .route("/ready", get(ready))
        .route("/panic", get(deliberate_panic))
        .route("/version", get(version))
        .nest("/query", query_routes)
        .nest("/1", authed_routes)
        .nest("/v1", otlp_routes)
        .fallback(proxy)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(response_headers))
                .layer(middleware::from_fn(request_logger))
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES)),
        )
        .with_state(state)
}

// ─── middleware ───

/// Defaults the response content type; every endpoint in this layer speaks
/// JSON unless it explicitly says otherwise (the `/query` format switch).
async fn response_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/json"));
    response
}

/// Assigns the per-request correlation id and logs the request outcome.
async fn request_logger(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    debug!(
        request_id = %request_id.0,
        %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "handled request"
    );
    response
}

/// Converts a handler panic into a 500 with a body that leaks nothing.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    log_panic(err.as_ref());
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        json!({"error": "internal server error"}).to_string(),
    )
        .into_response()
}

async fn api_key_checker(
    State(state): State<RouterState>,
    request: Request,
    next: Next,
) -> Response {
    let api_key = api_key_from_headers(request.headers());
    if api_key.is_empty() {
        return ApiError::auth_needed().into_response();
    }
    if !state.config.is_api_key_valid(&api_key) {
        return ApiError::invalid_api_key().into_response();
    }
    next.run(request).await
}

async fn query_token_checker(
    State(state): State<RouterState>,
    request: Request,
    next: Next,
) -> Response {
    let required = state.config.query_auth_token();
    let provided = request
        .headers()
        .get(QUERY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    // an unset token keeps the query endpoints closed, never open
    if required.is_empty() || provided != required {
        return ApiError::invalid_query_token().into_response();
    }
    next.run(request).await
}

// ─── local endpoints ───

async fn alive(State(state): State<RouterState>) -> Response {
    debug!("answered /alive check");
    let alive = state.health.is_alive();
    let status = if alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({"source": "refinery", "alive": if alive { "yes" } else { "no" }});
    (status, Json(body)).into_response()
}

async fn ready(State(state): State<RouterState>) -> Response {
    debug!("answered /ready check");
    let ready = state.health.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({"source": "refinery", "ready": if ready { "yes" } else { "no" }});
    (status, Json(body)).into_response()
}

async fn version(State(state): State<RouterState>) -> Response {
    Json(json!({"source": "refinery", "version": state.version})).into_response()
}

/// Exists so the panic-recovery middleware stays honest.
async fn deliberate_panic() -> Response {
    panic!("panic? never!")
}

// ─── query endpoints ───

async fn debug_trace(Path(trace_id): Path<String>) -> Response {
    Json(json!({"traceID": trace_id})).into_response()
}

async fn sampler_rules(
    State(state): State<RouterState>,
    Path((format, dataset)): Path<(String, String)>,
) -> Response {
    match state.config.sampler_rules_for_dataset(&dataset) {
        Ok((rules, name)) => {
            let mut doc = serde_json::Map::new();
            doc.insert(name, rules);
            marshal_to_format(&Value::Object(doc), &format)
        }
        Err(err) => ApiError::req_to_event(err).into_response(),
    }
}

async fn all_sampler_rules(
    State(state): State<RouterState>,
    Path(format): Path<String>,
) -> Response {
    marshal_to_format(&state.config.all_sampler_rules(), &format)
}

async fn config_metadata(State(state): State<RouterState>) -> Response {
    match serde_json::to_value(state.config.config_metadata()) {
        Ok(value) => marshal_to_format(&value, "json"),
        Err(err) => ApiError::json_build_failed(err).into_response(),
    }
}

/// Serializes a query answer into the requested representation.
fn marshal_to_format(value: &Value, format: &str) -> Response {
    match format.to_ascii_lowercase().as_str() {
        "json" => match serde_json::to_vec(value) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            Err(err) => ApiError::json_build_failed(err).into_response(),
        },
        "toml" => match toml::to_string_pretty(value) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/toml")],
                body,
            )
                .into_response(),
            Err(err) => ApiError::json_build_failed(err).into_response(),
        },
        "yaml" => match serde_yaml::to_string(value) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/yaml")],
                body,
            )
                .into_response(),
            Err(err) => ApiError::json_build_failed(err).into_response(),
        },
        other => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid format {other:?}")})),
        )
            .into_response(),
    }
}

// ─── event ingestion ───

async fn event(
    State(state): State<RouterState>,
    Path(dataset): Path<String>,
    request: Request,
) -> Response {
    state.metrics.increment(METRIC_EVENT);
    let request_id = correlation_id(&request);
    let headers = request.headers().clone();
    let body = match read_body(request).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let body = match decode_body(
        &state.decoders,
        content_encoding(&headers),
        &body,
        MAX_DECODED_BODY_BYTES,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => return ApiError::post_body(err).into_response(),
    };

    let event = match state
        .request_to_event(request_id, &headers, &dataset, content_type(&headers), &body)
        .await
    {
        Ok(event) => event,
        Err(err) => return err.into_response(),
    };

    match state.process_event(event) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(CollectorError::WouldBlock) => {
            ApiError::would_block(CollectorError::WouldBlock).into_response()
        }
        Err(err) => ApiError::collector(err).into_response(),
    }
}

async fn batch(
    State(state): State<RouterState>,
    Path(dataset): Path<String>,
    request: Request,
) -> Response {
    state.metrics.increment(METRIC_BATCH);
    let request_id = correlation_id(&request);
    let headers = request.headers().clone();
    let body = match read_body(request).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let body = match decode_body(
        &state.decoders,
        content_encoding(&headers),
        &body,
        MAX_DECODED_BODY_BYTES,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => return ApiError::post_body(err).into_response(),
    };

    let records: Vec<BatchedEvent> =
        match crate::payload::unmarshal(content_type(&headers), &body) {
            Ok(records) => records,
            Err(err) => {
                debug!(request_id = ?request_id, error = %err, "error parsing batch body");
                return ApiError::json_failed(err).into_response();
            }
        };

    if dataset.is_empty() {
        return ApiError::req_to_event("missing dataset name").into_response();
    }

    let api_key = api_key_from_headers(&headers);
    let environment = match state.environment_name(&api_key).await {
        Ok(environment) => environment,
        Err(err) => return err.into_response(),
    };
    let api_host = state.config.upstream_api();

    let mut responses = Vec::with_capacity(records.len());
    for record in records {
        let event = Event {
            request_id,
            api_host: api_host.clone(),
            api_key: api_key.clone(),
            dataset: dataset.clone(),
            environment: environment.clone(),
            sample_rate: record.sample_rate(),
            timestamp: record.event_time(),
            data: record.data,
        };

        let response = match state.process_event(event) {
            Ok(()) => BatchResponse {
                status: StatusCode::ACCEPTED.as_u16(),
                error: None,
            },
            Err(err @ CollectorError::WouldBlock) => BatchResponse {
                status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                error: Some(err.to_string()),
            },
            Err(err) => BatchResponse {
                status: StatusCode::BAD_REQUEST.as_u16(),
                error: Some(err.to_string()),
            },
        };
        responses.push(response);
    }

    match serde_json::to_vec(&responses) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => ApiError::json_build_failed(err).into_response(),
    }
}

// ─── OTLP over HTTP ───

async fn otlp_traces(State(state): State<RouterState>, request: Request) -> Response {
    let request_id = correlation_id(&request);
    let info = RequestInfo::from_http_headers(request.headers());
    if !info.has_api_key() {
        return ApiError::auth_needed().into_response();
    }

    let body = match read_body(request).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let body = match decode_body(
        &state.decoders,
        &info.content_encoding,
        &body,
        MAX_DECODED_BODY_BYTES,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => return ApiError::post_body(err).into_response(),
    };

    let export = match unmarshal_trace_request(&info.content_type, &body) {
        Ok(export) => export,
        Err(err) => return ApiError::json_failed(err).into_response(),
    };

    let batches = translate_trace_request(&export, &info);
    if let Err(err) = state.process_otlp_batches(request_id, &info, batches).await {
        return err.into_response();
    }

    encode_otlp_response(&info.content_type, &ExportTraceServiceResponse::default())
}

async fn otlp_logs(State(state): State<RouterState>, request: Request) -> Response {
    let request_id = correlation_id(&request);
    let info = RequestInfo::from_http_headers(request.headers());
    if !info.has_api_key() {
        return ApiError::auth_needed().into_response();
    }

    let body = match read_body(request).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let body = match decode_body(
        &state.decoders,
        &info.content_encoding,
        &body,
        MAX_DECODED_BODY_BYTES,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => return ApiError::post_body(err).into_response(),
    };

    let export = match unmarshal_logs_request(&info.content_type, &body) {
        Ok(export) => export,
        Err(err) => return ApiError::json_failed(err).into_response(),
    };

    let batches = translate_logs_request(&export, &info);
    if let Err(err) = state.process_otlp_batches(request_id, &info, batches).await {
        return err.into_response();
    }

    encode_otlp_response(&info.content_type, &ExportLogsServiceResponse::default())
}

fn encode_otlp_response<T: Message + serde::Serialize>(content_type: &str, message: &T) -> Response {
    if content_type == "application/json" {
        return match serde_json::to_vec(message) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            Err(err) => ApiError::json_build_failed(err).into_response(),
        };
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-protobuf")],
        message.encode_to_vec(),
    )
        .into_response()
}

// ─── catch-all proxy ───

/// Streams any unrecognized request through to the upstream API.
async fn proxy(State(state): State<RouterState>, request: Request) -> Response {
    state.metrics.increment(METRIC_PROXIED);

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}{}",
        state.config.upstream_api().trim_end_matches('/'),
        path_and_query
    );

    let mut headers = parts.headers.clone();
    headers.remove(header::HOST);

    let result = state
        .proxy_client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    match result {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let response_headers = upstream_response.headers().clone();
            let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = response_headers;
            response
        }
        Err(err) => {
            error!(url = %url, error = %err, "failed to proxy request upstream");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "failed to proxy request upstream"})),
            )
                .into_response()
        }
    }
}

/// Correlation id assigned by the request logger, when the middleware ran.
fn correlation_id(request: &Request) -> Option<Uuid> {
    request.extensions().get::<RequestId>().map(|id| id.0)
}

/// Reads the full request body, translating transport-level failures (like
/// the body limit tripping) into the body-read error kind.
async fn read_body(request: Request) -> Result<Bytes, Response> {
    let body = request.into_body();
    axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|err| ApiError::post_body(err).into_response())
}
