// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared mocks and harness for router integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use refinery_router::config::StaticConfig;
use refinery_router::health::StaticHealth;
use refinery_router::metrics::InMemoryMetrics;
use refinery_router::types::{Event, Span};
use refinery_router::{Collector, CollectorError, Router, Transmission};

/// Collector double with switchable stress and backpressure behavior.
#[derive(Default)]
pub struct MockCollector {
    pub stressed: AtomicBool,
    /// What `process_span_immediately` reports when stressed.
    pub process_immediately: AtomicBool,
    /// When set, `add_span` refuses with `WouldBlock`.
    pub would_block: AtomicBool,
    pub immediate_calls: AtomicUsize,
    added: Mutex<Vec<Span>>,
}

impl MockCollector {
    pub fn added(&self) -> Vec<Span> {
        self.added.lock().unwrap().clone()
    }
}

impl Collector for MockCollector {
    fn stressed(&self) -> bool {
        self.stressed.load(Ordering::SeqCst)
    }

    fn process_span_immediately(&self, _span: &Span) -> Result<bool, CollectorError> {
        self.immediate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.process_immediately.load(Ordering::SeqCst))
    }

    fn add_span(&self, span: Span) -> Result<(), CollectorError> {
        if self.would_block.load(Ordering::SeqCst) {
            return Err(CollectorError::WouldBlock);
        }
        self.added.lock().unwrap().push(span);
        Ok(())
    }
}

/// Upstream sink double; just records what was enqueued.
#[derive(Default)]
pub struct MockTransmission {
    events: Mutex<Vec<Event>>,
}

impl MockTransmission {
    pub fn enqueued(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Transmission for MockTransmission {
    fn enqueue_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// A started router plus handles to all its collaborator doubles.
pub struct TestRouter {
    pub router: Router,
    pub addr: std::net::SocketAddr,
    pub collector: Arc<MockCollector>,
    pub upstream: Arc<MockTransmission>,
    pub metrics: Arc<InMemoryMetrics>,
    pub health: Arc<StaticHealth>,
}

impl TestRouter {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Starts a router on an ephemeral port with mock collaborators.
pub async fn start_router(mut config: StaticConfig) -> TestRouter {
    config.listen_addr = "127.0.0.1:0".to_string();

    let collector = Arc::new(MockCollector::default());
    let upstream = Arc::new(MockTransmission::default());
    let metrics = Arc::new(InMemoryMetrics::new());
    let health = Arc::new(StaticHealth::default());

    let mut router = Router::new(
        Arc::new(config),
        health.clone(),
        collector.clone(),
        upstream.clone(),
        metrics.clone(),
        "test-version",
    )
    .expect("router construction");
    router.start().await.expect("router start");
    let addr = router.local_addr().expect("bound http address");

    TestRouter {
        router,
        addr,
        collector,
        upstream,
        metrics,
        health,
    }
}

/// A key in the legacy (classic) format: resolves to the empty environment
/// without touching the auth endpoint.
pub const LEGACY_KEY: &str = "c9945edf5d245834089a1bd6cc9ad01e";
