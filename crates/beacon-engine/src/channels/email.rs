//! Email provider. With SMTP configuration it sends real mail via
//! `lettre`; without it, sends are logged and captured, which keeps
//! development and tests offline.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use beacon_core::{BeaconError, BnResult, ChannelKind, FailureReason, MessageContent};

use super::{ChannelHealth, ChannelProvider, ProviderResponse, SendContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn default_smtp_port() -> u16 {
    587
}

pub struct EmailProvider {
    name: String,
    from_address: String,
    smtp: Option<SmtpConfig>,
    /// Captured sends when running without SMTP.
    captured: RwLock<Vec<(String, MessageContent)>>,
}

impl EmailProvider {
    /// Create a provider without SMTP configuration; sends are logged and
    /// captured instead of hitting the network.
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            name: "smtp".to_string(),
            from_address: from_address.into(),
            smtp: None,
            captured: RwLock::new(Vec::new()),
        }
    }

    pub fn with_smtp(from_address: impl Into<String>, smtp: SmtpConfig) -> Self {
        Self {
            name: "smtp".to_string(),
            from_address: from_address.into(),
            smtp: Some(smtp),
            captured: RwLock::new(Vec::new()),
        }
    }

    pub fn has_smtp(&self) -> bool {
        self.smtp.is_some()
    }

    /// Sends captured in log-only mode, for tests.
    pub async fn captured(&self) -> Vec<(String, MessageContent)> {
        self.captured.read().await.clone()
    }

    fn build_message(&self, destination: &str, content: &MessageContent) -> BnResult<Message> {
        let from: Mailbox = self
            .from_address
            .parse()
            .map_err(|e| BeaconError::Config(format!("bad from address: {e}")))?;
        let to: Mailbox = destination
            .parse()
            .map_err(|e| BeaconError::InvalidInput(format!("bad to address: {e}")))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(content.title.clone().unwrap_or_else(|| "Notification".into()))
            .body(content.body.clone())
            .map_err(|e| BeaconError::Internal(format!("build email: {e}")))
    }

    async fn send_smtp(
        &self,
        smtp: &SmtpConfig,
        destination: &str,
        content: &MessageContent,
    ) -> BnResult<ProviderResponse> {
        let message = match self.build_message(destination, content) {
            Ok(m) => m,
            Err(BeaconError::InvalidInput(msg)) => {
                return Ok(ProviderResponse::failed(FailureReason::InvalidTarget, msg));
            }
            Err(e) => return Err(e),
        };

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
            .map_err(|e| BeaconError::Config(format!("smtp relay: {e}")))?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
            .build();

        match transport.send(message).await {
            Ok(response) => {
                let id = response
                    .message()
                    .next()
                    .map(|line| line.to_string())
                    .unwrap_or_default();
                Ok(ProviderResponse::sent(id))
            }
            Err(e) if e.is_permanent() => Ok(ProviderResponse::failed(
                FailureReason::PayloadRejected,
                e.to_string(),
            )),
            Err(e) => Ok(ProviderResponse::failed(
                FailureReason::ProviderError,
                e.to_string(),
            )),
        }
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(
        &self,
        destination: &str,
        content: &MessageContent,
        _ctx: &SendContext,
    ) -> BnResult<ProviderResponse> {
        if destination.is_empty() || !destination.contains('@') {
            return Ok(ProviderResponse::failed(
                FailureReason::InvalidTarget,
                format!("not an email address: {destination:?}"),
            ));
        }

        match &self.smtp {
            Some(smtp) => self.send_smtp(smtp, destination, content).await,
            None => {
                tracing::info!(
                    to = %destination,
                    subject = content.title.as_deref().unwrap_or("Notification"),
                    "email send (log-only mode, no SMTP configured)"
                );
                self.captured
                    .write()
                    .await
                    .push((destination.to_string(), content.clone()));
                Ok(ProviderResponse::delivered(format!("log-{}", Uuid::now_v7())))
            }
        }
    }

    async fn health_check(&self) -> ChannelHealth {
        match &self.smtp {
            Some(smtp) => {
                let transport: AsyncSmtpTransport<Tokio1Executor> = match AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host) {
                    Ok(builder) => builder.port(smtp.port).build(),
                    Err(e) => return ChannelHealth::unhealthy(format!("smtp relay: {e}")),
                };
                match transport.test_connection().await {
                    Ok(true) => ChannelHealth::healthy(None),
                    Ok(false) => ChannelHealth::unhealthy("smtp connection test failed"),
                    Err(e) => ChannelHealth::unhealthy(e.to_string()),
                }
            }
            None => ChannelHealth::healthy(Some(0)),
        }
    }
}
