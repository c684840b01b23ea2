// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Health reporting contract. The router mirrors these answers onto the
//! HTTP probe endpoints and the gRPC health service; it never computes
//! health itself.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait HealthReporter: Send + Sync {
    fn is_alive(&self) -> bool;
    fn is_ready(&self) -> bool;
}

/// Flag-based reporter for embedders that drive health state externally.
#[derive(Debug)]
pub struct StaticHealth {
    alive: AtomicBool,
    ready: AtomicBool,
}

impl StaticHealth {
    pub fn new(alive: bool, ready: bool) -> Self {
        StaticHealth {
            alive: AtomicBool::new(alive),
            ready: AtomicBool::new(ready),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

impl Default for StaticHealth {
    fn default() -> Self {
        StaticHealth::new(true, true)
    }
}

impl HealthReporter for StaticHealth {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}
