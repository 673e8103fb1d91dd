//! Adaptive retry/backoff computation with named policy profiles.
//!
//! Everything here is pure and synchronous: the functions compute delays
//! and never schedule anything. Live signals enter only through
//! [`AdaptiveContext`], supplied by the caller.

use serde::{Deserialize, Serialize};

use beacon_core::Urgency;

/// Symmetric jitter applied when `policy.jitter` is set: ±30%.
const JITTER_FRACTION: f64 = 0.3;
/// Delay floor applied to targets known to be offline (5 minutes).
const OFFLINE_FLOOR_MS: u64 = 300_000;

/// Immutable retry policy value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponent: f64,
    pub jitter: bool,
    pub adaptive: bool,
}

/// Outcome of a backoff computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this many milliseconds before the next attempt.
    Delay(u64),
    /// The attempt budget is exhausted; no further retry.
    Abandon,
}

/// Live system signals consumed by adaptive policies. Loads are in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdaptiveContext {
    pub cpu_load: f64,
    pub memory_load: f64,
    pub network_latency_ms: u64,
    pub error_rate: f64,
}

impl Backoff {
    pub fn is_abandon(&self) -> bool {
        matches!(self, Backoff::Abandon)
    }

    pub fn delay_ms(&self) -> Option<u64> {
        match self {
            Backoff::Delay(ms) => Some(*ms),
            Backoff::Abandon => None,
        }
    }
}

/// Compute the delay before retry number `attempt` (1-based).
///
/// `attempt == 0` yields zero delay (first try runs immediately);
/// `attempt > policy.max_attempts` yields [`Backoff::Abandon`].
pub fn compute_delay(
    attempt: u32,
    policy: &RetryPolicy,
    adaptive: Option<&AdaptiveContext>,
) -> Backoff {
    if attempt == 0 {
        return Backoff::Delay(0);
    }
    if attempt > policy.max_attempts {
        return Backoff::Abandon;
    }

    let mut delay = exponential_ms(attempt, policy) as f64;

    if policy.adaptive {
        if let Some(ctx) = adaptive {
            delay *= pressure_factor(ctx.cpu_load, ctx.memory_load);
            delay *= latency_factor(ctx.network_latency_ms);
            delay *= error_rate_factor(ctx.error_rate);
        }
    }

    if policy.jitter {
        delay *= jitter_factor();
    }

    Backoff::Delay(clamp_ms(delay, policy))
}

/// The same computation decomposed into its named factors, for
/// observability and debugging. Never schedules anything; the reported
/// `final_delay_ms` is the deterministic (pre-jitter) value.
pub fn explain(
    attempt: u32,
    policy: &RetryPolicy,
    adaptive: Option<&AdaptiveContext>,
) -> BackoffExplanation {
    if attempt == 0 || attempt > policy.max_attempts {
        return BackoffExplanation {
            attempt,
            abandoned: attempt > policy.max_attempts,
            exponential_ms: 0,
            pressure_factor: 1.0,
            latency_factor: 1.0,
            error_rate_factor: 1.0,
            jitter_range_ms: None,
            final_delay_ms: 0,
        };
    }

    let exponential = exponential_ms(attempt, policy);
    let (pressure, latency, error_rate) = match (policy.adaptive, adaptive) {
        (true, Some(ctx)) => (
            pressure_factor(ctx.cpu_load, ctx.memory_load),
            latency_factor(ctx.network_latency_ms),
            error_rate_factor(ctx.error_rate),
        ),
        _ => (1.0, 1.0, 1.0),
    };

    let deterministic = clamp_ms(exponential as f64 * pressure * latency * error_rate, policy);
    let jitter_range = policy.jitter.then(|| {
        let low = clamp_ms(deterministic as f64 * (1.0 - JITTER_FRACTION), policy);
        let high = clamp_ms(deterministic as f64 * (1.0 + JITTER_FRACTION), policy);
        (low, high)
    });

    BackoffExplanation {
        attempt,
        abandoned: false,
        exponential_ms: exponential,
        pressure_factor: pressure,
        latency_factor: latency,
        error_rate_factor: error_rate,
        jitter_range_ms: jitter_range,
        final_delay_ms: deterministic,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffExplanation {
    pub attempt: u32,
    pub abandoned: bool,
    pub exponential_ms: u64,
    pub pressure_factor: f64,
    pub latency_factor: f64,
    pub error_rate_factor: f64,
    pub jitter_range_ms: Option<(u64, u64)>,
    pub final_delay_ms: u64,
}

fn exponential_ms(attempt: u32, policy: &RetryPolicy) -> u64 {
    let raw = policy.base_delay_ms as f64 * policy.exponent.powi(attempt as i32 - 1);
    clamp_ms(raw, policy)
}

/// Combined CPU/memory pressure. Weighted so full pressure on both axes
/// roughly doubles the delay.
fn pressure_factor(cpu_load: f64, memory_load: f64) -> f64 {
    1.0 + 0.6 * cpu_load.clamp(0.0, 1.0) + 0.4 * memory_load.clamp(0.0, 1.0)
}

fn latency_factor(latency_ms: u64) -> f64 {
    match latency_ms {
        0..=200 => 1.0,
        201..=999 => 1.2,
        1000..=4999 => 1.5,
        _ => 2.2,
    }
}

fn error_rate_factor(error_rate: f64) -> f64 {
    if error_rate < 0.05 {
        1.0
    } else if error_rate < 0.15 {
        1.3
    } else if error_rate < 0.30 {
        1.8
    } else {
        2.5
    }
}

fn jitter_factor() -> f64 {
    use rand::Rng;
    rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION)
}

fn clamp_ms(delay: f64, policy: &RetryPolicy) -> u64 {
    delay.max(0.0).min(policy.max_delay_ms as f64).round() as u64
}

// ── Profiles ────────────────────────────────────────────────────────

/// A named retry policy bundle selected by business classification.
/// Profiles are static configuration; they are not mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackoffProfile {
    pub name: &'static str,
    pub policy: RetryPolicy,
}

/// Many fast attempts with short delays; for urgent user-facing flows.
pub fn profile_realtime_critical() -> BackoffProfile {
    BackoffProfile {
        name: "realtime-critical",
        policy: RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 300,
            max_delay_ms: 5_000,
            exponent: 1.5,
            jitter: true,
            adaptive: true,
        },
    }
}

pub fn profile_standard() -> BackoffProfile {
    BackoffProfile {
        name: "standard",
        policy: RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponent: 2.0,
            jitter: true,
            adaptive: true,
        },
    }
}

/// Patient retries over hours for recipients that drop off the network.
pub fn profile_offline_tolerant() -> BackoffProfile {
    BackoffProfile {
        name: "offline-tolerant",
        policy: RetryPolicy {
            max_attempts: 100,
            base_delay_ms: 120_000,
            max_delay_ms: 3_600_000,
            exponent: 1.2,
            jitter: true,
            adaptive: false,
        },
    }
}

/// Deterministic timing for stability-critical flows: jitter and
/// adaptivity disabled.
pub fn profile_financial_grade() -> BackoffProfile {
    BackoffProfile {
        name: "financial-grade",
        policy: RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            exponent: 2.0,
            jitter: false,
            adaptive: false,
        },
    }
}

pub fn profile_bulk() -> BackoffProfile {
    BackoffProfile {
        name: "bulk",
        policy: RetryPolicy {
            max_attempts: 8,
            base_delay_ms: 30_000,
            max_delay_ms: 1_800_000,
            exponent: 2.0,
            jitter: true,
            adaptive: true,
        },
    }
}

/// Select a profile from the business classification of a notification.
pub fn profile_for_classification(
    urgency: Urgency,
    intent: &str,
    known_offline: bool,
) -> BackoffProfile {
    if is_financial_intent(intent) {
        return profile_financial_grade();
    }
    if known_offline {
        return profile_offline_tolerant();
    }
    match urgency {
        Urgency::Critical => profile_realtime_critical(),
        Urgency::Low => profile_bulk(),
        Urgency::Normal | Urgency::High => profile_standard(),
    }
}

fn is_financial_intent(intent: &str) -> bool {
    let intent = intent.to_ascii_lowercase();
    ["payment", "transaction", "financial", "settlement"]
        .iter()
        .any(|kw| intent.contains(kw))
}

// ── Orchestration-level wrapper ─────────────────────────────────────

/// Inputs for the dispatch-level backoff computation.
#[derive(Debug, Clone)]
pub struct DispatchBackoffContext {
    pub attempt: u32,
    pub policy: RetryPolicy,
    pub adaptive: Option<AdaptiveContext>,
    /// Notification priority, 1–10; 5 is neutral.
    pub priority: u8,
    pub known_offline: bool,
    /// Caller-specified maximum acceptable delay (e.g. remaining SLA TTL).
    pub sla_max_delay_ms: Option<u64>,
}

/// Wraps [`compute_delay`] with three adjustments applied in order:
/// priority scaling, offline floor, SLA cap.
pub fn compute_backoff_delay(ctx: &DispatchBackoffContext) -> Backoff {
    let base = compute_delay(ctx.attempt, &ctx.policy, ctx.adaptive.as_ref());
    let Backoff::Delay(mut delay) = base else {
        return Backoff::Abandon;
    };

    let scale = (ctx.priority as f64 / 5.0).clamp(0.5, 2.0);
    delay = (delay as f64 * scale).round() as u64;

    if ctx.known_offline {
        delay = delay.max(OFFLINE_FLOOR_MS);
    }

    if let Some(cap) = ctx.sla_max_delay_ms {
        delay = delay.min(cap);
    }

    Backoff::Delay(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponent: 2.0,
            jitter: false,
            adaptive: false,
        }
    }

    #[test]
    fn first_retry_uses_base_delay() {
        assert_eq!(compute_delay(1, &plain_policy(), None), Backoff::Delay(1_000));
    }

    #[test]
    fn third_retry_doubles_twice() {
        assert_eq!(compute_delay(3, &plain_policy(), None), Backoff::Delay(4_000));
    }

    #[test]
    fn attempt_zero_is_immediate() {
        assert_eq!(compute_delay(0, &plain_policy(), None), Backoff::Delay(0));
    }

    #[test]
    fn over_budget_abandons_for_all_profiles() {
        for profile in [
            profile_realtime_critical(),
            profile_standard(),
            profile_offline_tolerant(),
            profile_financial_grade(),
            profile_bulk(),
        ] {
            let over = profile.policy.max_attempts + 1;
            assert!(
                compute_delay(over, &profile.policy, None).is_abandon(),
                "{} should abandon past {} attempts",
                profile.name,
                profile.policy.max_attempts
            );
        }
    }

    #[test]
    fn delay_clamps_to_max() {
        let policy = RetryPolicy {
            max_attempts: 20,
            ..plain_policy()
        };
        // 1000 * 2^14 is far past 60s.
        assert_eq!(compute_delay(15, &policy, None), Backoff::Delay(60_000));
    }

    #[test]
    fn adaptive_factors_multiply() {
        let policy = RetryPolicy {
            adaptive: true,
            ..plain_policy()
        };
        let ctx = AdaptiveContext {
            cpu_load: 1.0,
            memory_load: 1.0,
            network_latency_ms: 500,
            error_rate: 0.2,
        };
        // 1000 * 2.0 (pressure) * 1.2 (latency) * 1.8 (error rate) = 4320
        assert_eq!(compute_delay(1, &policy, Some(&ctx)), Backoff::Delay(4_320));
    }

    #[test]
    fn adaptive_without_context_is_plain() {
        let policy = RetryPolicy {
            adaptive: true,
            ..plain_policy()
        };
        assert_eq!(compute_delay(1, &policy, None), Backoff::Delay(1_000));
    }

    #[test]
    fn latency_factor_steps() {
        assert_eq!(latency_factor(200), 1.0);
        assert_eq!(latency_factor(201), 1.2);
        assert_eq!(latency_factor(999), 1.2);
        assert_eq!(latency_factor(1_000), 1.5);
        assert_eq!(latency_factor(4_999), 1.5);
        assert_eq!(latency_factor(5_000), 2.2);
    }

    #[test]
    fn error_rate_factor_steps() {
        assert_eq!(error_rate_factor(0.04), 1.0);
        assert_eq!(error_rate_factor(0.05), 1.3);
        assert_eq!(error_rate_factor(0.14), 1.3);
        assert_eq!(error_rate_factor(0.15), 1.8);
        assert_eq!(error_rate_factor(0.29), 1.8);
        assert_eq!(error_rate_factor(0.30), 2.5);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..plain_policy()
        };
        for _ in 0..100 {
            let Backoff::Delay(d) = compute_delay(1, &policy, None) else {
                panic!("expected a delay");
            };
            assert!((700..=1_300).contains(&d), "jittered delay {d} out of bounds");
        }
    }

    #[test]
    fn explain_decomposes_factors() {
        let policy = RetryPolicy {
            adaptive: true,
            jitter: true,
            ..plain_policy()
        };
        let ctx = AdaptiveContext {
            cpu_load: 0.5,
            memory_load: 0.5,
            network_latency_ms: 100,
            error_rate: 0.0,
        };
        let ex = explain(2, &policy, Some(&ctx));
        assert!(!ex.abandoned);
        assert_eq!(ex.exponential_ms, 2_000);
        assert!((ex.pressure_factor - 1.5).abs() < 1e-9);
        assert_eq!(ex.latency_factor, 1.0);
        assert_eq!(ex.error_rate_factor, 1.0);
        assert_eq!(ex.final_delay_ms, 3_000);
        let (low, high) = ex.jitter_range_ms.unwrap();
        assert_eq!(low, 2_100);
        assert_eq!(high, 3_900);
    }

    #[test]
    fn explain_marks_abandoned() {
        let ex = explain(6, &plain_policy(), None);
        assert!(ex.abandoned);
        assert_eq!(ex.final_delay_ms, 0);
    }

    #[test]
    fn classification_maps_to_profiles() {
        assert_eq!(
            profile_for_classification(Urgency::Critical, "alert", false).name,
            "realtime-critical"
        );
        assert_eq!(
            profile_for_classification(Urgency::Normal, "newsletter", false).name,
            "standard"
        );
        assert_eq!(
            profile_for_classification(Urgency::Low, "digest", false).name,
            "bulk"
        );
        assert_eq!(
            profile_for_classification(Urgency::Critical, "payment_failed", false).name,
            "financial-grade"
        );
        assert_eq!(
            profile_for_classification(Urgency::Normal, "reminder", true).name,
            "offline-tolerant"
        );
    }

    #[test]
    fn priority_scaling_clamps() {
        let base = DispatchBackoffContext {
            attempt: 1,
            policy: plain_policy(),
            adaptive: None,
            priority: 5,
            known_offline: false,
            sla_max_delay_ms: None,
        };
        assert_eq!(compute_backoff_delay(&base), Backoff::Delay(1_000));

        let low = DispatchBackoffContext { priority: 1, ..base.clone() };
        // 1/5 = 0.2 clamps to 0.5
        assert_eq!(compute_backoff_delay(&low), Backoff::Delay(500));

        let high = DispatchBackoffContext { priority: 10, ..base };
        assert_eq!(compute_backoff_delay(&high), Backoff::Delay(2_000));
    }

    #[test]
    fn offline_floor_applies() {
        let ctx = DispatchBackoffContext {
            attempt: 1,
            policy: plain_policy(),
            adaptive: None,
            priority: 5,
            known_offline: true,
            sla_max_delay_ms: None,
        };
        assert_eq!(compute_backoff_delay(&ctx), Backoff::Delay(300_000));
    }

    #[test]
    fn sla_cap_applies_last() {
        let ctx = DispatchBackoffContext {
            attempt: 1,
            policy: plain_policy(),
            adaptive: None,
            priority: 5,
            known_offline: true,
            sla_max_delay_ms: Some(10_000),
        };
        // Floor raises to 5 minutes, then the SLA cap pulls back down.
        assert_eq!(compute_backoff_delay(&ctx), Backoff::Delay(10_000));
    }

    #[test]
    fn wrapper_propagates_abandon() {
        let ctx = DispatchBackoffContext {
            attempt: 6,
            policy: plain_policy(),
            adaptive: None,
            priority: 5,
            known_offline: false,
            sla_max_delay_ms: None,
        };
        assert!(compute_backoff_delay(&ctx).is_abandon());
    }
}
