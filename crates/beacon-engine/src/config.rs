//! Engine configuration.
//!
//! Routing tables (urgency → channels) are configuration data so a
//! deployment can reorder or extend them without code changes; the
//! escalation resilience order lives in [`EscalationConfig`] for the same
//! reason.

use serde::{Deserialize, Serialize};

use beacon_core::{ChannelKind, Urgency};

use crate::circuit_breaker::BreakerConfig;
use crate::escalation::EscalationConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Orchestrator-level bound on send attempts per channel.
    #[serde(default = "default_max_channel_attempts")]
    pub max_channel_attempts: u32,
}

fn default_max_channel_attempts() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            routing: RoutingConfig::default(),
            escalation: EscalationConfig::default(),
            breaker: BreakerConfig::default(),
            max_channel_attempts: default_max_channel_attempts(),
        }
    }
}

/// Static urgency → channel-list priority table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub critical: Vec<ChannelKind>,
    pub high: Vec<ChannelKind>,
    pub default: Vec<ChannelKind>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            critical: vec![ChannelKind::Push, ChannelKind::Sms, ChannelKind::Email],
            high: vec![ChannelKind::Push, ChannelKind::Email],
            default: vec![ChannelKind::Push],
        }
    }
}

impl RoutingConfig {
    pub fn channels_for(&self, urgency: Urgency) -> &[ChannelKind] {
        match urgency {
            Urgency::Critical => &self.critical,
            Urgency::High => &self.high,
            Urgency::Normal | Urgency::Low => &self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_defaults() {
        let routing = RoutingConfig::default();
        assert_eq!(
            routing.channels_for(Urgency::Critical),
            &[ChannelKind::Push, ChannelKind::Sms, ChannelKind::Email]
        );
        assert_eq!(
            routing.channels_for(Urgency::High),
            &[ChannelKind::Push, ChannelKind::Email]
        );
        assert_eq!(routing.channels_for(Urgency::Normal), &[ChannelKind::Push]);
        assert_eq!(routing.channels_for(Urgency::Low), &[ChannelKind::Push]);
    }

    #[test]
    fn engine_config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_channel_attempts, 3);
        assert_eq!(config.scheduler.tick_interval_ms, 500);
        assert_eq!(config.scheduler.max_concurrent_jobs, 20);
        assert_eq!(config.escalation.give_up_after_secs, 3_600);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn routing_overrides_deserialize() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "routing": {
                "critical": ["sms", "ussd"],
                "high": ["email"],
                "default": ["email"]
            }
        }))
        .unwrap();
        assert_eq!(
            config.routing.channels_for(Urgency::Critical),
            &[ChannelKind::Sms, ChannelKind::Ussd]
        );
    }
}
