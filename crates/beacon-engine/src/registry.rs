//! Channel registry: the single source of truth for which delivery
//! channels exist, their priority order, and their enable/disable state.
//!
//! The registry holds no delivery state of its own; it resolves handlers
//! and, for the fallback path, walks them in order until one succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use beacon_core::{BeaconError, BnResult, ChannelKind, MessageContent, TargetDescriptor};

use crate::channels::{ChannelHealth, ChannelProvider, ProviderResponse, SendContext};
use beacon_core::FailureReason;

/// Registration metadata for one channel handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRegistration {
    pub name: String,
    /// Lower priority is tried first.
    pub priority: i32,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
    /// Monotonic insertion counter; breaks priority ties stably.
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub priority: i32,
    pub enabled: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            priority: 100,
            enabled: true,
        }
    }
}

struct RegisteredChannel {
    registration: ChannelRegistration,
    handler: Arc<dyn ChannelProvider>,
}

struct RegistryInner {
    channels: HashMap<String, RegisteredChannel>,
    next_seq: u64,
}

/// Outcome of a fallback delivery walk.
#[derive(Debug, Clone)]
pub struct FallbackResult {
    /// Channel that produced the returned response, if any was attempted.
    pub channel: Option<String>,
    pub response: ProviderResponse,
}

pub struct ChannelRegistry {
    inner: RwLock<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                channels: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Register a channel handler. Fails if the name is already taken; the
    /// existing registration stays active.
    pub async fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ChannelProvider>,
        options: RegisterOptions,
    ) -> BnResult<()> {
        let name = name.into();
        let mut inner = self.inner.write().await;
        if inner.channels.contains_key(&name) {
            return Err(BeaconError::DuplicateChannel(name));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.channels.insert(
            name.clone(),
            RegisteredChannel {
                registration: ChannelRegistration {
                    name: name.clone(),
                    priority: options.priority,
                    enabled: options.enabled,
                    registered_at: Utc::now(),
                    seq,
                },
                handler,
            },
        );
        tracing::info!(channel = %name, priority = options.priority, "channel registered");
        Ok(())
    }

    pub async fn enable(&self, name: &str) -> BnResult<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> BnResult<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> BnResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .channels
            .get_mut(name)
            .ok_or_else(|| BeaconError::UnknownChannel(name.to_string()))?;
        entry.registration.enabled = enabled;
        tracing::info!(channel = %name, enabled, "channel toggled");
        Ok(())
    }

    /// Registration metadata for one channel, enabled or not.
    pub async fn get(&self, name: &str) -> Option<ChannelRegistration> {
        let inner = self.inner.read().await;
        inner.channels.get(name).map(|c| c.registration.clone())
    }

    pub async fn list_all(&self) -> Vec<ChannelRegistration> {
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner
            .channels
            .values()
            .map(|c| c.registration.clone())
            .collect();
        all.sort_by_key(|r| (r.priority, r.seq));
        all
    }

    /// Enabled channels in ascending priority order; ties broken by
    /// registration order.
    pub async fn list_active(&self) -> Vec<ChannelRegistration> {
        let inner = self.inner.read().await;
        let mut active: Vec<_> = inner
            .channels
            .values()
            .filter(|c| c.registration.enabled)
            .map(|c| c.registration.clone())
            .collect();
        active.sort_by_key(|r| (r.priority, r.seq));
        active
    }

    /// Active preferred channels first (in registry priority order),
    /// followed by the remaining active channels.
    pub async fn resolve_order(&self, preferred: &[&str]) -> Vec<String> {
        let active = self.list_active().await;
        if preferred.is_empty() {
            return active.into_iter().map(|r| r.name).collect();
        }

        let mut ordered = Vec::with_capacity(active.len());
        for reg in active.iter().filter(|r| preferred.contains(&r.name.as_str())) {
            ordered.push(reg.name.clone());
        }
        for reg in active.iter().filter(|r| !preferred.contains(&r.name.as_str())) {
            ordered.push(reg.name.clone());
        }
        ordered
    }

    /// Live handler for a channel name, active registrations only.
    pub async fn resolve(&self, name: &str) -> Option<Arc<dyn ChannelProvider>> {
        let inner = self.inner.read().await;
        inner
            .channels
            .get(name)
            .filter(|c| c.registration.enabled)
            .map(|c| Arc::clone(&c.handler))
    }

    /// First active handler serving `kind`, in priority order.
    pub async fn resolve_for_kind(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelProvider>> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<_> = inner
            .channels
            .values()
            .filter(|c| c.registration.enabled && c.handler.kind() == kind)
            .collect();
        candidates.sort_by_key(|c| (c.registration.priority, c.registration.seq));
        candidates.first().map(|c| Arc::clone(&c.handler))
    }

    /// Walk channels in resolved order, stopping at the first successful
    /// send. Channels without a destination address for the target are
    /// skipped. On exhaustion the last observed failure is returned, or a
    /// generic failure if nothing was attempted.
    pub async fn deliver_with_fallback(
        &self,
        target: &TargetDescriptor,
        content: &MessageContent,
        ctx: &SendContext,
        preferred: &[&str],
    ) -> FallbackResult {
        let order = self.resolve_order(preferred).await;
        let mut last_failure: Option<FallbackResult> = None;

        for name in order {
            let Some(handler) = self.resolve(&name).await else {
                continue;
            };
            let Some(destination) = target.address_for(handler.kind()) else {
                continue;
            };

            match handler.send(destination, content, ctx).await {
                Ok(response) if response.is_success() => {
                    return FallbackResult {
                        channel: Some(name),
                        response,
                    };
                }
                Ok(response) => {
                    tracing::warn!(
                        channel = %name,
                        reason = ?response.failure_reason,
                        "fallback send failed, trying next channel"
                    );
                    last_failure = Some(FallbackResult {
                        channel: Some(name),
                        response,
                    });
                }
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "fallback send errored");
                    last_failure = Some(FallbackResult {
                        channel: Some(name),
                        response: ProviderResponse::failed(
                            FailureReason::ProviderError,
                            e.to_string(),
                        ),
                    });
                }
            }
        }

        last_failure.unwrap_or(FallbackResult {
            channel: None,
            response: ProviderResponse::failed(
                FailureReason::NoChannel,
                "no active channel could attempt delivery",
            ),
        })
    }

    /// Probe every registered channel, enabled or not. A probe that errors
    /// is recorded as unhealthy rather than propagating.
    pub async fn health_check_all(&self) -> HashMap<String, ChannelHealth> {
        let handlers: Vec<(String, Arc<dyn ChannelProvider>)> = {
            let inner = self.inner.read().await;
            inner
                .channels
                .iter()
                .map(|(name, c)| (name.clone(), Arc::clone(&c.handler)))
                .collect()
        };

        let mut results = HashMap::with_capacity(handlers.len());
        for (name, handler) in handlers {
            let health = handler.health_check().await;
            results.insert(name, health);
        }
        results
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
