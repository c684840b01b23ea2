// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics contract for the router layer.
//!
//! The router only ever registers and increments counters; richer metric
//! kinds belong to the collaborators that own them. Increments are atomic so
//! no coordination is required between request tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub trait Metrics: Send + Sync {
    /// Declares a metric ahead of use. Idempotent.
    fn register(&self, name: &str, metric_type: &str);

    /// Increments a counter by one. Unregistered names are ignored.
    fn increment(&self, name: &str);
}

/// In-process counter registry backed by atomics.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; zero when unregistered. Mostly useful in
    /// tests asserting on classifier accounting.
    pub fn count(&self, name: &str) -> u64 {
        self.read_counters()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn read_counters(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<AtomicU64>>> {
        self.counters.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Metrics for InMemoryMetrics {
    fn register(&self, name: &str, _metric_type: &str) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
    }

    fn increment(&self, name: &str) {
        if let Some(counter) = self.read_counters().get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}
