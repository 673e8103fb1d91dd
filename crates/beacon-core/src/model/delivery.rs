use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ChannelKind;

/// One channel's attempt series for one notification. The attempt log is
/// append-only: entries are immutable once written and the log never
/// shrinks. Delivery records are never physically deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: ChannelKind,
    pub destination: String,
    pub provider: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: Vec<DeliveryAttempt>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub receipt: Option<DeliveryReceipt>,
    pub sla: Option<DeliverySla>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    RetryScheduled,
    Delivered,
    Read,
    Failed,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Sending,
    Delivered,
    Failed,
    Cancelled,
    Expired,
}

/// One immutable try within a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// 1-based ordinal within the delivery.
    pub attempt: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_code: Option<FailureReason>,
    pub error_message: Option<String>,
    pub provider_trace: Option<ProviderTrace>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderTrace {
    pub provider_message_id: Option<String>,
    pub raw_response: Option<serde_json::Value>,
}

/// Delivery and read confirmations for a delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivered_at: Option<DateTime<Utc>>,
    pub confirmation_source: Option<String>,
    pub confirmation_payload: Option<serde_json::Value>,
    pub read_at: Option<DateTime<Utc>>,
    pub read_source: Option<String>,
    pub read_payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeliverySla {
    pub max_retries: Option<u32>,
    pub ttl_secs: Option<i64>,
}

/// Closed failure taxonomy for provider and infrastructure errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    // Transient: retryable under the active policy.
    NetworkError,
    Timeout,
    ProviderError,
    CircuitOpen,
    // Permanent: never retried.
    InvalidTarget,
    PayloadRejected,
    ConsentBlocked,
    // Capacity: currently retried like transients; see DESIGN.md.
    RateLimited,
    Throttled,
    // Infrastructure: fail fast, escalation trigger.
    NoProvider,
    NoChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
    Capacity,
    Infrastructure,
}

impl FailureReason {
    pub fn class(&self) -> FailureClass {
        match self {
            FailureReason::NetworkError
            | FailureReason::Timeout
            | FailureReason::ProviderError
            | FailureReason::CircuitOpen => FailureClass::Transient,
            FailureReason::InvalidTarget
            | FailureReason::PayloadRejected
            | FailureReason::ConsentBlocked => FailureClass::Permanent,
            FailureReason::RateLimited | FailureReason::Throttled => FailureClass::Capacity,
            FailureReason::NoProvider | FailureReason::NoChannel => FailureClass::Infrastructure,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == FailureClass::Permanent
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), FailureClass::Transient | FailureClass::Capacity)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NetworkError => "network_error",
            FailureReason::Timeout => "timeout",
            FailureReason::ProviderError => "provider_error",
            FailureReason::CircuitOpen => "circuit_open",
            FailureReason::InvalidTarget => "invalid_target",
            FailureReason::PayloadRejected => "payload_rejected",
            FailureReason::ConsentBlocked => "consent_blocked",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Throttled => "throttled",
            FailureReason::NoProvider => "no_provider",
            FailureReason::NoChannel => "no_channel",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Delivery {
    pub fn new(notification_id: Uuid, channel: ChannelKind, destination: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            notification_id,
            channel,
            destination: destination.into(),
            provider: None,
            status: DeliveryStatus::Pending,
            attempts: Vec::new(),
            last_attempt_at: None,
            receipt: None,
            sla: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_sla(mut self, sla: DeliverySla) -> Self {
        self.sla = Some(sla);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of failed send attempts recorded so far.
    pub fn failure_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Failed)
            .count()
    }

    /// The last failed attempt, if any.
    pub fn last_failure(&self) -> Option<&DeliveryAttempt> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.status == AttemptStatus::Failed)
    }
}

impl DeliveryStatus {
    /// Terminal for the purposes of blocking further send attempts.
    /// Delivered still permits the read-acknowledgment transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Read
                | DeliveryStatus::Failed
                | DeliveryStatus::Expired
                | DeliveryStatus::Cancelled
        )
    }

    /// Terminal without having reached the recipient.
    pub fn is_failure_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Failed | DeliveryStatus::Expired | DeliveryStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::RetryScheduled => "retry_scheduled",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Expired => "expired",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sending" => Ok(DeliveryStatus::Sending),
            "sent" => Ok(DeliveryStatus::Sent),
            "retry_scheduled" => Ok(DeliveryStatus::RetryScheduled),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            "expired" => Ok(DeliveryStatus::Expired),
            "cancelled" => Ok(DeliveryStatus::Cancelled),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        for status in [
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
            DeliveryStatus::Failed,
            DeliveryStatus::Expired,
            DeliveryStatus::Cancelled,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::RetryScheduled,
        ] {
            assert!(!status.is_terminal(), "{status} should not be terminal");
        }
    }

    #[test]
    fn failure_terminal_excludes_delivered() {
        assert!(DeliveryStatus::Failed.is_failure_terminal());
        assert!(DeliveryStatus::Expired.is_failure_terminal());
        assert!(DeliveryStatus::Cancelled.is_failure_terminal());
        assert!(!DeliveryStatus::Delivered.is_failure_terminal());
        assert!(!DeliveryStatus::Read.is_failure_terminal());
    }

    #[test]
    fn failure_reason_classes() {
        assert!(FailureReason::NetworkError.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(FailureReason::RateLimited.is_retryable());
        assert!(FailureReason::InvalidTarget.is_permanent());
        assert!(FailureReason::ConsentBlocked.is_permanent());
        assert!(!FailureReason::NoProvider.is_retryable());
        assert_eq!(FailureReason::NoProvider.class(), FailureClass::Infrastructure);
    }

    #[test]
    fn failure_count_only_counts_failed() {
        let mut d = Delivery::new(Uuid::now_v7(), ChannelKind::Push, "token");
        let now = Utc::now();
        d.attempts.push(DeliveryAttempt {
            attempt: 1,
            status: AttemptStatus::Failed,
            started_at: now,
            ended_at: Some(now),
            error_code: Some(FailureReason::Timeout),
            error_message: Some("timed out".into()),
            provider_trace: None,
        });
        d.attempts.push(DeliveryAttempt {
            attempt: 2,
            status: AttemptStatus::Delivered,
            started_at: now,
            ended_at: Some(now),
            error_code: None,
            error_message: None,
            provider_trace: None,
        });
        assert_eq!(d.failure_count(), 1);
        assert_eq!(
            d.last_failure().unwrap().error_code,
            Some(FailureReason::Timeout)
        );
    }

    #[test]
    fn delivery_status_roundtrips() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::RetryScheduled,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
            DeliveryStatus::Failed,
            DeliveryStatus::Expired,
            DeliveryStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            let back: DeliveryStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn failure_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(FailureReason::RateLimited).unwrap(),
            serde_json::json!("rate_limited")
        );
        assert_eq!(
            serde_json::to_value(FailureReason::NoProvider).unwrap(),
            serde_json::json!("no_provider")
        );
    }
}
