// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Refinery ingest router
//!
//! The trace-ingestion router of the refinery sampling proxy. It sits
//! between instrumented applications (or peer proxies) and the upstream
//! observability API, accepting telemetry over HTTP and gRPC, normalizing
//! it into the internal event/span model, classifying each record, and
//! routing it to the right downstream:
//!
//! - peer liveness probes are dropped at the door
//! - events without a trace id go straight to the upstream sink
//! - spans go to the local collector for trace-level sampling decisions,
//!   short-circuiting through the collector's immediate path under stress
//!
//! Backpressure and authentication are applied at this boundary; sampling
//! outcomes, buffering, and upstream delivery belong to the injected
//! collaborators behind the [`collect`], [`transmit`], [`health`],
//! [`config`], and [`metrics`] contracts.
//!
//! ## Architecture
//!
//! - [`server`]: the axum HTTP front-end, middleware chain, and lifecycle
//! - [`grpc`]: the tonic OTLP services and the gRPC health mirror
//! - [`processor`]: request normalization and the classifier/dispatcher
//! - [`decoder`]: content codings and the pooled zstd contexts
//! - [`cache`]: the environment-name cache with single-flight lookups
//! - [`payload`]: wire decoding keyed by content type
//! - [`types`] / [`timestamp`]: the data model and timestamp forms

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cache;
pub mod collect;
pub mod config;
pub mod decoder;
pub mod error;
mod grpc;
pub mod health;
pub mod metrics;
pub mod payload;
mod processor;
pub mod server;
pub mod timestamp;
pub mod transmit;
pub mod types;

pub use collect::{Collector, CollectorError};
pub use config::{Config, StaticConfig};
pub use error::{ApiError, AuthError, ServerError};
pub use health::HealthReporter;
pub use metrics::{InMemoryMetrics, Metrics};
pub use server::{RequestId, Router};
pub use transmit::Transmission;
pub use types::{Event, Span};
