//! SMS provider speaking to an HTTP SMS gateway.
//!
//! Configuration keys:
//! - `base_url`: gateway base URL (required)
//! - `api_key`: bearer token for the gateway (required)
//! - `sender_id`: originating sender id shown to recipients (optional)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use beacon_core::{BeaconError, BnResult, ChannelKind, FailureReason, MessageContent};

use super::{ChannelHealth, ChannelProvider, ProviderResponse, SendContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub sender_id: Option<String>,
}

#[derive(Debug)]
pub struct SmsGatewayProvider {
    name: String,
    config: SmsGatewayConfig,
    client: reqwest::Client,
}

impl SmsGatewayProvider {
    pub fn new(config: SmsGatewayConfig) -> BnResult<Self> {
        if config.base_url.is_empty() {
            return Err(BeaconError::Config("SMS gateway requires 'base_url'".into()));
        }
        if config.api_key.is_empty() {
            return Err(BeaconError::Config("SMS gateway requires 'api_key'".into()));
        }
        Ok(Self {
            name: "sms-gateway".to_string(),
            config,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .map_err(|e| BeaconError::Internal(e.to_string()))?,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChannelProvider for SmsGatewayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(
        &self,
        destination: &str,
        content: &MessageContent,
        _ctx: &SendContext,
    ) -> BnResult<ProviderResponse> {
        if destination.is_empty() {
            return Ok(ProviderResponse::failed(
                FailureReason::InvalidTarget,
                "empty phone number",
            ));
        }

        // SMS has no separate title; prepend it when present.
        let text = match &content.title {
            Some(title) => format!("{title}: {}", content.body),
            None => content.body.clone(),
        };

        let mut payload = serde_json::json!({
            "to": destination,
            "text": text,
        });
        if let Some(ref sender) = self.config.sender_id {
            payload["from"] = serde_json::Value::String(sender.clone());
        }

        let result = self
            .client
            .post(self.api_url("messages"))
            .bearer_auth(&self.config.api_key)
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
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            // Gateways ack acceptance; carrier delivery is confirmed via
            // receipt callbacks, so report Sent here.
            return Ok(ProviderResponse::sent(message_id).with_raw_response(body));
        }

        let reason = match status.as_u16() {
            400 => FailureReason::PayloadRejected,
            404 | 422 => FailureReason::InvalidTarget,
            429 => FailureReason::RateLimited,
            503 => FailureReason::Throttled,
            _ => FailureReason::ProviderError,
        };
        Ok(
            ProviderResponse::failed(reason, format!("sms gateway returned {status}"))
                .with_raw_response(body),
        )
    }

    async fn health_check(&self) -> ChannelHealth {
        let started = std::time::Instant::now();
        match self
            .client
            .get(self.api_url("health"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                ChannelHealth::healthy(Some(started.elapsed().as_millis() as u64))
            }
            Ok(resp) => ChannelHealth::unhealthy(format!("health probe returned {}", resp.status())),
            Err(e) => ChannelHealth::unhealthy(e.to_string()),
        }
    }

    async fn cancel(&self, provider_message_id: &str) -> BnResult<bool> {
        let result = self
            .client
            .delete(self.api_url(&format!("messages/{provider_message_id}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await;
        match result {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Urgency;
    use uuid::Uuid;

    fn config(base_url: String) -> SmsGatewayConfig {
        SmsGatewayConfig {
            base_url,
            api_key: "test-key".into(),
            sender_id: Some("BEACON".into()),
        }
    }

    fn ctx() -> SendContext {
        SendContext {
            notification_id: Uuid::now_v7(),
            delivery_id: Uuid::now_v7(),
            attempt: 1,
            urgency: Urgency::Critical,
        }
    }

    #[test]
    fn missing_config_is_rejected() {
        let err = SmsGatewayProvider::new(SmsGatewayConfig {
            base_url: String::new(),
            api_key: "k".into(),
            sender_id: None,
        })
        .unwrap_err();
        assert!(matches!(err, BeaconError::Config(_)));

        let err = SmsGatewayProvider::new(SmsGatewayConfig {
            base_url: "http://gw".into(),
            api_key: String::new(),
            sender_id: None,
        })
        .unwrap_err();
        assert!(matches!(err, BeaconError::Config(_)));
    }

    #[tokio::test]
    async fn send_acked_as_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("authorization", "Bearer test-key")
            .with_status(202)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"sms-42"}"#)
            .create_async()
            .await;

        let provider = SmsGatewayProvider::new(config(server.url())).unwrap();
        let resp = provider
            .send("+15551234567", &MessageContent::new("code 1234"), &ctx())
            .await
            .unwrap();

        assert!(resp.is_success());
        assert_eq!(resp.provider_message_id.as_deref(), Some("sms-42"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn throttle_maps_to_throttled() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/messages")
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let provider = SmsGatewayProvider::new(config(server.url())).unwrap();
        let resp = provider
            .send("+15551234567", &MessageContent::new("hi"), &ctx())
            .await
            .unwrap();

        assert_eq!(resp.failure_reason, Some(FailureReason::Throttled));
    }

    #[tokio::test]
    async fn bad_number_maps_to_invalid_target() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/messages")
            .with_status(422)
            .with_body(r#"{"error":"invalid msisdn"}"#)
            .create_async()
            .await;

        let provider = SmsGatewayProvider::new(config(server.url())).unwrap();
        let resp = provider
            .send("not-a-number", &MessageContent::new("hi"), &ctx())
            .await
            .unwrap();

        assert_eq!(resp.failure_reason, Some(FailureReason::InvalidTarget));
    }

    #[tokio::test]
    async fn cancel_reports_gateway_acceptance() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/messages/sms-42")
            .with_status(200)
            .create_async()
            .await;

        let provider = SmsGatewayProvider::new(config(server.url())).unwrap();
        assert!(provider.cancel("sms-42").await.unwrap());
    }
}
