// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! gRPC front-end: OTLP trace and logs services plus the standard health
//! service.
//!
//! The health service is driven by a background ticker that mirrors the
//! injected health reporter onto three service names: the empty string (the
//! conventional "whole server" name, ready AND alive), `"ready"`, and
//! `"alive"`. The health server suppresses no-change updates itself, so the
//! ticker just writes unconditionally.

use std::time::Duration;

use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tonic_health::server::HealthReporter as GrpcHealthReporter;
use tonic_health::ServingStatus;
use tracing::debug;

use crate::error::ApiError;
use crate::health::HealthReporter;
use crate::server::RouterState;
use refinery_otlp::{translate_logs_request, translate_trace_request, RequestInfo};

const HEALTH_TICK_PERIOD: Duration = Duration::from_secs(3);

const HEALTH_SERVICE_OVERALL: &str = "";
const HEALTH_SERVICE_READY: &str = "ready";
const HEALTH_SERVICE_ALIVE: &str = "alive";

pub(crate) struct OtlpTraceService {
    pub(crate) state: RouterState,
}

#[tonic::async_trait]
impl TraceService for OtlpTraceService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let info = RequestInfo::from_grpc_metadata(request.metadata());
        check_api_key(&self.state, &info)?;

        let batches = translate_trace_request(&request.into_inner(), &info);
        self.state
            .process_otlp_batches(None, &info, batches)
            .await
            .map_err(status_from_api_error)?;

        Ok(Response::new(ExportTraceServiceResponse::default()))
    }
}

pub(crate) struct OtlpLogsService {
    pub(crate) state: RouterState,
}

#[tonic::async_trait]
impl LogsService for OtlpLogsService {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let info = RequestInfo::from_grpc_metadata(request.metadata());
        check_api_key(&self.state, &info)?;

        let batches = translate_logs_request(&request.into_inner(), &info);
        self.state
            .process_otlp_batches(None, &info, batches)
            .await
            .map_err(status_from_api_error)?;

        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

/// Same gate the HTTP middleware applies: the key must be present and
/// accepted by the configuration.
fn check_api_key(state: &RouterState, info: &RequestInfo) -> Result<(), Status> {
    if !info.has_api_key() {
        return Err(Status::unauthenticated("missing API key"));
    }
    if !state.config.is_api_key_valid(&info.api_key) {
        return Err(Status::unauthenticated(
            "api key is not accepted by this proxy",
        ));
    }
    Ok(())
}

fn status_from_api_error(err: ApiError) -> Status {
    use axum::http::StatusCode;
    match err.status {
        StatusCode::UNAUTHORIZED => Status::unauthenticated(err.to_string()),
        StatusCode::TOO_MANY_REQUESTS => Status::resource_exhausted(err.to_string()),
        StatusCode::BAD_REQUEST => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Serves the gRPC front-end on an already-bound listener and starts the
/// health ticker. Both tasks stop via their respective tokens: `shutdown`
/// drains the server, `done` ends the ticker.
pub(crate) fn spawn(
    state: RouterState,
    listener: TcpListener,
    shutdown: CancellationToken,
    done: CancellationToken,
) -> (
    JoinHandle<Result<(), tonic::transport::Error>>,
    JoinHandle<()>,
) {
    let params = state.config.grpc_server_parameters();

    let (reporter, health_service) = tonic_health::server::health_reporter();
    let ticker = spawn_health_ticker(state.health.clone(), reporter, done);

    let trace_service = TraceServiceServer::new(OtlpTraceService {
        state: state.clone(),
    })
    .max_decoding_message_size(params.max_recv_msg_size)
    .max_encoding_message_size(params.max_send_msg_size)
    .accept_compressed(CompressionEncoding::Gzip)
    .send_compressed(CompressionEncoding::Gzip);

    let logs_service = LogsServiceServer::new(OtlpLogsService { state })
        .max_decoding_message_size(params.max_recv_msg_size)
        .max_encoding_message_size(params.max_send_msg_size)
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

    let server = tokio::spawn(async move {
        Server::builder()
            .http2_keepalive_interval(Some(params.keepalive_interval))
            .http2_keepalive_timeout(Some(params.keepalive_timeout))
            .add_service(health_service)
            .add_service(trace_service)
            .add_service(logs_service)
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    });

    (server, ticker)
}

fn spawn_health_ticker(
    health: std::sync::Arc<dyn HealthReporter>,
    reporter: GrpcHealthReporter,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("running grpc health monitor");
        let mut reporter = reporter;
        let mut ticker = tokio::time::interval(HEALTH_TICK_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let alive = health.is_alive();
                    let ready = health.is_ready();
                    set_status(&mut reporter, HEALTH_SERVICE_READY, ready).await;
                    set_status(&mut reporter, HEALTH_SERVICE_ALIVE, alive).await;
                    set_status(&mut reporter, HEALTH_SERVICE_OVERALL, ready && alive).await;
                }
                _ = done.cancelled() => {
                    debug!("stopping grpc health monitor");
                    return;
                }
            }
        }
    })
}

async fn set_status(reporter: &mut GrpcHealthReporter, service: &str, healthy: bool) {
    let status = if healthy {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    };
    reporter.set_service_status(service, status).await;
}
