//! Push provider that POSTs to a webhook-style push gateway.
//!
//! The gateway owns the vendor relationship (APNs/FCM/etc.); this adapter
//! speaks plain JSON to it and maps HTTP outcomes onto the failure
//! taxonomy.

use async_trait::async_trait;

use beacon_core::{BeaconError, BnResult, ChannelKind, FailureReason, MessageContent};

use super::{ChannelHealth, ChannelProvider, ProviderResponse, SendContext};

pub struct PushWebhookProvider {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl PushWebhookProvider {
    pub fn new(endpoint: impl Into<String>) -> BnResult<Self> {
        Ok(Self {
            name: "push-gateway".to_string(),
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .map_err(|e| BeaconError::Internal(e.to_string()))?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChannelProvider for PushWebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(
        &self,
        destination: &str,
        content: &MessageContent,
        ctx: &SendContext,
    ) -> BnResult<ProviderResponse> {
        if destination.is_empty() {
            return Ok(ProviderResponse::failed(
                FailureReason::InvalidTarget,
                "empty device token",
            ));
        }

        let payload = serde_json::json!({
            "device_token": destination,
            "title": content.title,
            "body": content.body,
            "notification_id": ctx.notification_id,
            "urgency": ctx.urgency.to_string(),
        });

        let result = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Ok(ProviderResponse::failed(FailureReason::Timeout, e.to_string()));
            }
            Err(e) => {
                return Ok(ProviderResponse::failed(
                    FailureReason::NetworkError,
                    e.to_string(),
                ));
            }
        };

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            let message_id = body
                .get("message_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Ok(ProviderResponse::delivered(message_id).with_raw_response(body));
        }

        let reason = match status.as_u16() {
            400 | 422 => FailureReason::PayloadRejected,
            404 | 410 => FailureReason::InvalidTarget,
            429 => FailureReason::RateLimited,
            _ => FailureReason::ProviderError,
        };
        Ok(
            ProviderResponse::failed(reason, format!("push gateway returned {status}"))
                .with_raw_response(body),
        )
    }

    async fn health_check(&self) -> ChannelHealth {
        let started = std::time::Instant::now();
        match self.client.get(format!("{}/health", self.endpoint)).send().await {
            Ok(resp) if resp.status().is_success() => {
                ChannelHealth::healthy(Some(started.elapsed().as_millis() as u64))
            }
            Ok(resp) => ChannelHealth::unhealthy(format!("health probe returned {}", resp.status())),
            Err(e) => ChannelHealth::unhealthy(e.to_string()),
        }
    }
}
