// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract with the trace collector, the downstream that buffers spans and
//! makes trace-level sampling decisions. The router never decides sampling
//! outcomes; it only routes spans in and reacts to backpressure.

use crate::types::Span;

/// Non-fatal refusals from the collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The span queue is full. Handlers translate this to 429.
    #[error("span queue is full")]
    WouldBlock,

    #[error("{0}")]
    Other(String),
}

pub trait Collector: Send + Sync {
    /// True while the collector is in stress relief mode and prefers the
    /// immediate-decision path over buffering.
    fn stressed(&self) -> bool;

    /// Fast deterministic decision for a span under stress. Returns true
    /// when the span was consumed; false means "process normally".
    fn process_span_immediately(&self, span: &Span) -> Result<bool, CollectorError>;

    /// Submits a span for collection into its trace.
    fn add_span(&self, span: Span) -> Result<(), CollectorError>;
}
