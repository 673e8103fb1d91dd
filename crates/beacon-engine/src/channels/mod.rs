//! Channel provider contract and the built-in provider adapters.
//!
//! A provider is the interface boundary to one transport vendor: it takes a
//! destination address and message content, performs one send, and reports
//! the outcome in the closed failure taxonomy. Vendor specifics stay behind
//! this trait.

pub mod email;
pub mod memory;
pub mod sms;
pub mod webhook_push;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_core::{BnResult, ChannelKind, FailureReason, MessageContent, Urgency};

/// Outcome of one provider send call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub status: ProviderStatus,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub failure_message: Option<String>,
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Accepted by the provider, delivery confirmation pending.
    Sent,
    /// Confirmed delivered to the recipient.
    Delivered,
    Failed,
}

/// Result of a channel health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub detail: Option<String>,
}

/// Per-send context handed to providers for tracing and vendor hints.
#[derive(Debug, Clone)]
pub struct SendContext {
    pub notification_id: Uuid,
    pub delivery_id: Uuid,
    pub attempt: u32,
    pub urgency: Urgency,
}

#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Unique provider name, e.g. "push-gateway" or "smtp".
    fn name(&self) -> &str;

    /// The transport this provider serves.
    fn kind(&self) -> ChannelKind;

    /// Perform one send. Classified failures are reported through the
    /// response; `Err` is reserved for unexpected transport faults and is
    /// converted into a failure attempt by the caller.
    async fn send(
        &self,
        destination: &str,
        content: &MessageContent,
        ctx: &SendContext,
    ) -> BnResult<ProviderResponse>;

    async fn health_check(&self) -> ChannelHealth {
        ChannelHealth::healthy(None)
    }

    /// Ask the vendor to cancel an in-flight message. Best effort; returns
    /// whether the vendor accepted the cancellation.
    async fn cancel(&self, _provider_message_id: &str) -> BnResult<bool> {
        Ok(false)
    }
}

impl ProviderResponse {
    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: ProviderStatus::Delivered,
            provider_message_id: Some(provider_message_id.into()),
            failure_reason: None,
            failure_message: None,
            raw_response: None,
        }
    }

    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: ProviderStatus::Sent,
            provider_message_id: Some(provider_message_id.into()),
            failure_reason: None,
            failure_message: None,
            raw_response: None,
        }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            status: ProviderStatus::Failed,
            provider_message_id: None,
            failure_reason: Some(reason),
            failure_message: Some(message.into()),
            raw_response: None,
        }
    }

    pub fn with_raw_response(mut self, raw: serde_json::Value) -> Self {
        self.raw_response = Some(raw);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ProviderStatus::Sent | ProviderStatus::Delivered)
    }
}

impl ChannelHealth {
    pub fn healthy(latency_ms: Option<u64>) -> Self {
        Self {
            healthy: true,
            latency_ms,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_constructors() {
        let ok = ProviderResponse::delivered("msg-1");
        assert!(ok.is_success());
        assert_eq!(ok.provider_message_id.as_deref(), Some("msg-1"));

        let sent = ProviderResponse::sent("msg-2");
        assert!(sent.is_success());

        let failed = ProviderResponse::failed(FailureReason::Timeout, "deadline exceeded");
        assert!(!failed.is_success());
        assert_eq!(failed.failure_reason, Some(FailureReason::Timeout));
        assert_eq!(failed.failure_message.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn health_constructors() {
        let h = ChannelHealth::healthy(Some(12));
        assert!(h.healthy);
        assert_eq!(h.latency_ms, Some(12));

        let u = ChannelHealth::unhealthy("connection refused");
        assert!(!u.healthy);
        assert_eq!(u.detail.as_deref(), Some("connection refused"));
    }
}
