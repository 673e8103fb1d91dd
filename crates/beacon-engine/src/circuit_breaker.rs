//! Per-channel circuit breakers.
//!
//! Each channel gets an independent Closed/Open/HalfOpen breaker keyed by
//! channel name. Callers `check()` before invoking a provider and record
//! the outcome afterwards; an open circuit fast-fails with a retry-after
//! hint instead of burning a provider call.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before a channel's circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing trial sends.
    pub reset_timeout_secs: u64,
    /// Trial sends allowed while half-open.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
            half_open_max_probes: 1,
        }
    }
}

impl BreakerConfig {
    fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Debug)]
struct BreakerCell {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_probes: u32,
}

impl BreakerCell {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            half_open_probes: 0,
        }
    }
}

/// Returned when a channel's circuit is open.
#[derive(Debug, Clone)]
pub struct CircuitOpen {
    pub channel: String,
    pub retry_after: Duration,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circuit open for channel {}, retry after {}s",
            self.channel,
            self.retry_after.as_secs()
        )
    }
}

impl std::error::Error for CircuitOpen {}

/// Breakers for every channel, keyed by channel name. Cells are created
/// lazily on first use.
pub struct ChannelBreakerBank {
    config: BreakerConfig,
    cells: Mutex<HashMap<String, BreakerCell>>,
}

impl ChannelBreakerBank {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a send on `channel` may proceed.
    pub fn check(&self, channel: &str) -> Result<(), CircuitOpen> {
        self.check_at(channel, Instant::now())
    }

    fn check_at(&self, channel: &str, now: Instant) -> Result<(), CircuitOpen> {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let cell = cells.entry(channel.to_string()).or_insert_with(BreakerCell::new);
        self.maybe_half_open(cell, now);

        match cell.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(self.open_error(channel, cell, now)),
            BreakerState::HalfOpen => {
                if cell.half_open_probes < self.config.half_open_max_probes {
                    cell.half_open_probes += 1;
                    Ok(())
                } else {
                    Err(self.open_error(channel, cell, now))
                }
            }
        }
    }

    pub fn record_success(&self, channel: &str) {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let cell = cells.entry(channel.to_string()).or_insert_with(BreakerCell::new);
        cell.state = BreakerState::Closed;
        cell.consecutive_failures = 0;
        cell.half_open_probes = 0;
    }

    pub fn record_failure(&self, channel: &str) {
        self.record_failure_at(channel, Instant::now());
    }

    fn record_failure_at(&self, channel: &str, now: Instant) {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let cell = cells.entry(channel.to_string()).or_insert_with(BreakerCell::new);
        cell.consecutive_failures += 1;
        cell.last_failure_at = Some(now);

        if cell.state == BreakerState::HalfOpen {
            // A failed trial re-opens immediately.
            cell.state = BreakerState::Open;
            cell.half_open_probes = 0;
        } else if cell.consecutive_failures >= self.config.failure_threshold {
            cell.state = BreakerState::Open;
        }
    }

    pub fn state(&self, channel: &str) -> BreakerState {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let cell = cells.entry(channel.to_string()).or_insert_with(BreakerCell::new);
        self.maybe_half_open(cell, Instant::now());
        cell.state
    }

    fn maybe_half_open(&self, cell: &mut BreakerCell, now: Instant) {
        if cell.state == BreakerState::Open {
            if let Some(last) = cell.last_failure_at {
                if now.duration_since(last) >= self.config.reset_timeout() {
                    cell.state = BreakerState::HalfOpen;
                    cell.half_open_probes = 0;
                }
            }
        }
    }

    fn open_error(&self, channel: &str, cell: &BreakerCell, now: Instant) -> CircuitOpen {
        let retry_after = cell
            .last_failure_at
            .map(|t| self.config.reset_timeout().saturating_sub(now.duration_since(t)))
            .unwrap_or_else(|| self.config.reset_timeout());
        CircuitOpen {
            channel: channel.to_string(),
            retry_after,
        }
    }
}

impl Default for ChannelBreakerBank {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
