//! Escalation decisions for critical notifications.
//!
//! Pure and synchronous: given the failure history and the recipient's
//! capabilities, decide whether to retry the current channel, switch to a
//! fresh one, fall back to an offline-capable relay, or give up. Only the
//! highest urgency tier gets any escalation machinery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use beacon_core::{ChannelKind, FailureReason, RecipientCapabilities, Urgency};

/// Tunables and the resilience-ordered channel table. Kept as data so a
/// deployment can reorder channels without code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Channels in descending order of expected reach.
    pub resilience_order: Vec<ChannelKind>,
    /// Give up once this much time has passed since the first attempt.
    pub give_up_after_secs: i64,
    /// Failures on the current channel tolerated before switching.
    pub same_channel_retry_limit: usize,
    /// Fixed delay for the transient same-channel retry.
    pub same_channel_retry_delay_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            resilience_order: vec![
                ChannelKind::Push,
                ChannelKind::Email,
                ChannelKind::Sms,
                ChannelKind::WhatsApp,
                ChannelKind::Telegram,
                ChannelKind::Ussd,
                ChannelKind::Mesh,
            ],
            give_up_after_secs: 3_600,
            same_channel_retry_limit: 2,
            same_channel_retry_delay_ms: 5_000,
        }
    }
}

/// One failure in the history handed to the decision function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFailure {
    pub channel: ChannelKind,
    pub at: DateTime<Utc>,
    pub reason: FailureReason,
}

#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub urgency: Urgency,
    pub current_channel: ChannelKind,
    pub failures: Vec<ChannelFailure>,
    pub capabilities: RecipientCapabilities,
    pub first_attempt_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EscalationDecision {
    RetrySameChannel { delay_ms: u64, reason: String },
    SwitchChannel { channel: ChannelKind, reason: String },
    EscalateOffline { channel: ChannelKind, reason: String },
    GiveUp { reason: String },
}

/// Whether the recipient's capabilities permit a channel at all.
pub fn channel_supported(channel: ChannelKind, caps: &RecipientCapabilities) -> bool {
    match channel {
        ChannelKind::Push => caps.smartphone && caps.internet,
        ChannelKind::Email | ChannelKind::Telegram => caps.internet,
        ChannelKind::Sms | ChannelKind::WhatsApp => caps.sim,
        ChannelKind::Ussd => caps.supports_ussd,
        ChannelKind::Mesh => caps.supports_mesh,
    }
}

/// Decide the next move after a failure. First matching rule wins.
pub fn decide(ctx: &EscalationContext, config: &EscalationConfig) -> EscalationDecision {
    if ctx.urgency != Urgency::Critical {
        return EscalationDecision::GiveUp {
            reason: "escalation is reserved for critical urgency".into(),
        };
    }

    let elapsed = ctx.now.signed_duration_since(ctx.first_attempt_at);
    if elapsed.num_seconds() > config.give_up_after_secs {
        return EscalationDecision::GiveUp {
            reason: "timeout exceeded".into(),
        };
    }

    let failures_on_current = ctx
        .failures
        .iter()
        .filter(|f| f.channel == ctx.current_channel)
        .count();
    if failures_on_current < config.same_channel_retry_limit {
        return EscalationDecision::RetrySameChannel {
            delay_ms: config.same_channel_retry_delay_ms,
            reason: format!(
                "{} failure(s) on {}, treating as transient",
                failures_on_current, ctx.current_channel
            ),
        };
    }

    next_channel(ctx, config)
}

/// Like [`decide`], but for failures the current channel can never recover
/// from (permanent or infrastructure): the same-channel retry step is
/// skipped and the scan for a replacement channel starts immediately.
pub fn decide_exhausted(ctx: &EscalationContext, config: &EscalationConfig) -> EscalationDecision {
    if ctx.urgency != Urgency::Critical {
        return EscalationDecision::GiveUp {
            reason: "escalation is reserved for critical urgency".into(),
        };
    }

    let elapsed = ctx.now.signed_duration_since(ctx.first_attempt_at);
    if elapsed.num_seconds() > config.give_up_after_secs {
        return EscalationDecision::GiveUp {
            reason: "timeout exceeded".into(),
        };
    }

    next_channel(ctx, config)
}

/// Scan the resilience order for a replacement channel, then the offline
/// relays (USSD preferred over mesh).
fn next_channel(ctx: &EscalationContext, config: &EscalationConfig) -> EscalationDecision {
    let attempted = |channel: ChannelKind| {
        channel == ctx.current_channel || ctx.failures.iter().any(|f| f.channel == channel)
    };

    for &channel in &config.resilience_order {
        if !attempted(channel) && channel_supported(channel, &ctx.capabilities) {
            return EscalationDecision::SwitchChannel {
                channel,
                reason: format!("{} exhausted, {channel} untried and supported", ctx.current_channel),
            };
        }
    }

    for channel in [ChannelKind::Ussd, ChannelKind::Mesh] {
        if channel_supported(channel, &ctx.capabilities) {
            return EscalationDecision::EscalateOffline {
                channel,
                reason: format!("all online channels exhausted, relaying via {channel}"),
            };
        }
    }

    EscalationDecision::GiveUp {
        reason: "no viable escalation path".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn failure(channel: ChannelKind, ago_secs: i64) -> ChannelFailure {
        ChannelFailure {
            channel,
            at: Utc::now() - Duration::seconds(ago_secs),
            reason: FailureReason::Timeout,
        }
    }

    fn critical_ctx(failures: Vec<ChannelFailure>) -> EscalationContext {
        EscalationContext {
            urgency: Urgency::Critical,
            current_channel: ChannelKind::Push,
            failures,
            capabilities: RecipientCapabilities::online_smartphone(),
            first_attempt_at: Utc::now() - Duration::seconds(60),
            now: Utc::now(),
        }
    }

    #[test]
    fn non_critical_always_gives_up() {
        for urgency in [Urgency::Low, Urgency::Normal, Urgency::High] {
            let ctx = EscalationContext {
                urgency,
                ..critical_ctx(vec![
                    failure(ChannelKind::Push, 30),
                    failure(ChannelKind::Push, 20),
                ])
            };
            assert!(
                matches!(decide(&ctx, &EscalationConfig::default()), EscalationDecision::GiveUp { .. }),
                "{urgency} should give up"
            );
        }
    }

    #[test]
    fn timeout_exceeded_gives_up() {
        let mut ctx = critical_ctx(vec![failure(ChannelKind::Push, 30)]);
        ctx.first_attempt_at = Utc::now() - Duration::seconds(3_700);
        let decision = decide(&ctx, &EscalationConfig::default());
        assert_eq!(
            decision,
            EscalationDecision::GiveUp {
                reason: "timeout exceeded".into()
            }
        );
    }

    #[test]
    fn few_failures_retry_same_channel_with_fixed_delay() {
        for failures in [vec![], vec![failure(ChannelKind::Push, 10)]] {
            let ctx = critical_ctx(failures);
            match decide(&ctx, &EscalationConfig::default()) {
                EscalationDecision::RetrySameChannel { delay_ms, .. } => {
                    assert_eq!(delay_ms, 5_000)
                }
                other => panic!("expected retry-same-channel, got {other:?}"),
            }
        }
    }

    #[test]
    fn repeated_failures_switch_to_next_supported_channel() {
        let ctx = critical_ctx(vec![
            failure(ChannelKind::Push, 30),
            failure(ChannelKind::Push, 20),
        ]);
        match decide(&ctx, &EscalationConfig::default()) {
            EscalationDecision::SwitchChannel { channel, .. } => {
                assert_eq!(channel, ChannelKind::Email)
            }
            other => panic!("expected switch-channel, got {other:?}"),
        }
    }

    #[test]
    fn switch_skips_unsupported_channels() {
        let mut ctx = critical_ctx(vec![
            failure(ChannelKind::Push, 30),
            failure(ChannelKind::Push, 20),
        ]);
        // SIM only: no internet means no email/telegram, no push.
        ctx.capabilities = RecipientCapabilities {
            smartphone: true,
            internet: false,
            sim: true,
            supports_ussd: false,
            supports_mesh: false,
        };
        match decide(&ctx, &EscalationConfig::default()) {
            EscalationDecision::SwitchChannel { channel, .. } => {
                assert_eq!(channel, ChannelKind::Sms)
            }
            other => panic!("expected switch to sms, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_channels_escalate_to_ussd_before_mesh() {
        let mut ctx = critical_ctx(vec![
            failure(ChannelKind::Push, 50),
            failure(ChannelKind::Push, 40),
            failure(ChannelKind::Email, 30),
            failure(ChannelKind::Sms, 20),
            failure(ChannelKind::WhatsApp, 15),
            failure(ChannelKind::Telegram, 10),
        ]);
        ctx.capabilities = RecipientCapabilities {
            smartphone: true,
            internet: true,
            sim: true,
            supports_ussd: true,
            supports_mesh: true,
        };
        match decide(&ctx, &EscalationConfig::default()) {
            EscalationDecision::EscalateOffline { channel, .. } => {
                assert_eq!(channel, ChannelKind::Ussd)
            }
            other => panic!("expected offline escalation, got {other:?}"),
        }
    }

    #[test]
    fn no_path_gives_up() {
        let mut ctx = critical_ctx(vec![
            failure(ChannelKind::Push, 30),
            failure(ChannelKind::Push, 20),
            failure(ChannelKind::Email, 10),
            failure(ChannelKind::Sms, 8),
            failure(ChannelKind::WhatsApp, 6),
            failure(ChannelKind::Telegram, 4),
        ]);
        ctx.capabilities = RecipientCapabilities {
            smartphone: true,
            internet: true,
            sim: true,
            supports_ussd: false,
            supports_mesh: false,
        };
        assert_eq!(
            decide(&ctx, &EscalationConfig::default()),
            EscalationDecision::GiveUp {
                reason: "no viable escalation path".into()
            }
        );
    }

    #[test]
    fn exhausted_variant_skips_same_channel_retry() {
        // One failure would normally mean retry-same-channel; a permanent
        // or infrastructure failure jumps straight to the channel scan.
        let ctx = critical_ctx(vec![failure(ChannelKind::Push, 10)]);
        match decide_exhausted(&ctx, &EscalationConfig::default()) {
            EscalationDecision::SwitchChannel { channel, .. } => {
                assert_eq!(channel, ChannelKind::Email)
            }
            other => panic!("expected switch-channel, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_variant_still_gates_on_urgency_and_timeout() {
        let mut ctx = critical_ctx(vec![failure(ChannelKind::Push, 10)]);
        ctx.urgency = Urgency::High;
        assert!(matches!(
            decide_exhausted(&ctx, &EscalationConfig::default()),
            EscalationDecision::GiveUp { .. }
        ));

        let mut ctx = critical_ctx(vec![failure(ChannelKind::Push, 10)]);
        ctx.first_attempt_at = Utc::now() - Duration::seconds(7_200);
        assert_eq!(
            decide_exhausted(&ctx, &EscalationConfig::default()),
            EscalationDecision::GiveUp {
                reason: "timeout exceeded".into()
            }
        );
    }

    #[test]
    fn capability_gating_table() {
        let none = RecipientCapabilities::default();
        for channel in ChannelKind::ALL {
            assert!(!channel_supported(channel, &none));
        }

        let online = RecipientCapabilities::online_smartphone();
        assert!(channel_supported(ChannelKind::Push, &online));
        assert!(channel_supported(ChannelKind::Email, &online));
        assert!(channel_supported(ChannelKind::Sms, &online));
        assert!(!channel_supported(ChannelKind::Ussd, &online));
        assert!(!channel_supported(ChannelKind::Mesh, &online));

        // Internet without a smartphone rules out push but not email.
        let desktop = RecipientCapabilities {
            internet: true,
            ..Default::default()
        };
        assert!(!channel_supported(ChannelKind::Push, &desktop));
        assert!(channel_supported(ChannelKind::Email, &desktop));
    }
}
