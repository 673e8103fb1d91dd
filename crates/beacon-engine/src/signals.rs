//! Live delivery signals feeding the adaptive backoff computation.
//!
//! Collects rolling provider latency/outcome windows plus host load gauges
//! and condenses them into an [`AdaptiveContext`] snapshot. The collector
//! is an explicit instance owned by the composition root, not a global.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use crate::backoff::AdaptiveContext;

/// Rolling window size for latency and outcome samples.
const WINDOW: usize = 256;

pub struct DeliverySignals {
    cpu_load: RwLock<f64>,
    memory_load: RwLock<f64>,
    latencies_ms: RwLock<VecDeque<u64>>,
    outcomes: RwLock<VecDeque<bool>>,
    counters: RwLock<HashMap<String, u64>>,
}

impl DeliverySignals {
    pub fn new() -> Self {
        Self {
            cpu_load: RwLock::new(0.0),
            memory_load: RwLock::new(0.0),
            latencies_ms: RwLock::new(VecDeque::with_capacity(WINDOW)),
            outcomes: RwLock::new(VecDeque::with_capacity(WINDOW)),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Update host load gauges; values are clamped to [0, 1].
    pub async fn set_system_load(&self, cpu: f64, memory: f64) {
        *self.cpu_load.write().await = cpu.clamp(0.0, 1.0);
        *self.memory_load.write().await = memory.clamp(0.0, 1.0);
    }

    /// Record the outcome of one provider send.
    pub async fn record_send(&self, latency_ms: u64, success: bool) {
        let mut latencies = self.latencies_ms.write().await;
        if latencies.len() >= WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency_ms);
        drop(latencies);

        let mut outcomes = self.outcomes.write().await;
        if outcomes.len() >= WINDOW {
            outcomes.pop_front();
        }
        outcomes.push_back(success);
    }

    pub async fn increment(&self, name: &str) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub async fn counters(&self) -> HashMap<String, u64> {
        self.counters.read().await.clone()
    }

    /// Mean provider latency over the rolling window.
    pub async fn mean_latency_ms(&self) -> u64 {
        let latencies = self.latencies_ms.read().await;
        if latencies.is_empty() {
            return 0;
        }
        let sum: u64 = latencies.iter().sum();
        sum / latencies.len() as u64
    }

    /// Failure fraction over the rolling window.
    pub async fn error_rate(&self) -> f64 {
        let outcomes = self.outcomes.read().await;
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / outcomes.len() as f64
    }

    /// Snapshot the current signals for the backoff engine.
    pub async fn adaptive_context(&self) -> AdaptiveContext {
        AdaptiveContext {
            cpu_load: *self.cpu_load.read().await,
            memory_load: *self.memory_load.read().await,
            network_latency_ms: self.mean_latency_ms().await,
            error_rate: self.error_rate().await,
        }
    }
}

impl Default for DeliverySignals {
    fn default() -> Self {
        Self::new()
    }
}
