//! In-memory channel provider for tests and local development.
//!
//! Delivers instantly by default; failures can be scripted per call so
//! retry, fallback, and escalation paths are exercisable without a
//! network.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::RwLock;

use beacon_core::{BnResult, ChannelKind, FailureReason, MessageContent};

use super::{ChannelHealth, ChannelProvider, ProviderResponse, SendContext};

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub destination: String,
    pub content: MessageContent,
    pub attempt: u32,
}

pub struct MemoryProvider {
    name: String,
    kind: ChannelKind,
    sent: RwLock<Vec<RecordedSend>>,
    /// Scripted outcomes consumed front-first; empty means deliver.
    scripted_failures: RwLock<VecDeque<FailureReason>>,
    unhealthy: RwLock<Option<String>>,
}

impl MemoryProvider {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            name: format!("memory-{kind}"),
            kind,
            sent: RwLock::new(Vec::new()),
            scripted_failures: RwLock::new(VecDeque::new()),
            unhealthy: RwLock::new(None),
        }
    }

    /// Queue a failure for the next send call.
    pub async fn fail_next(&self, reason: FailureReason) {
        self.scripted_failures.write().await.push_back(reason);
    }

    /// Queue `n` consecutive failures.
    pub async fn fail_times(&self, reason: FailureReason, n: usize) {
        let mut script = self.scripted_failures.write().await;
        for _ in 0..n {
            script.push_back(reason);
        }
    }

    pub async fn set_unhealthy(&self, detail: impl Into<String>) {
        *self.unhealthy.write().await = Some(detail.into());
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }

    pub async fn sent(&self) -> Vec<RecordedSend> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        destination: &str,
        content: &MessageContent,
        ctx: &SendContext,
    ) -> BnResult<ProviderResponse> {
        self.sent.write().await.push(RecordedSend {
            destination: destination.to_string(),
            content: content.clone(),
            attempt: ctx.attempt,
        });

        if let Some(reason) = self.scripted_failures.write().await.pop_front() {
            return Ok(ProviderResponse::failed(reason, format!("scripted {reason}")));
        }

        Ok(ProviderResponse::delivered(format!(
            "mem-{}-{}",
            ctx.delivery_id,
            ctx.attempt
        )))
    }

    async fn health_check(&self) -> ChannelHealth {
        match self.unhealthy.read().await.clone() {
            Some(detail) => ChannelHealth::unhealthy(detail),
            None => ChannelHealth::healthy(Some(0)),
        }
    }

    async fn cancel(&self, _provider_message_id: &str) -> BnResult<bool> {
        Ok(true)
    }
}
