//! The append-only delivery state machine.
//!
//! `DeliveryExecutor` drives one delivery through its attempt series:
//! append an attempt, invoke the live channel handler, record the outcome,
//! and either finish, schedule a retry, or (for critical notifications)
//! surface an escalation decision for the orchestrator to act on.
//!
//! Concurrency: `execute` calls against the same delivery id are mutually
//! excluded by a keyed async mutex, and every armed retry timer is guarded
//! by a per-delivery cancellation token so `cancel`/`expire` also stop
//! pending re-executions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use beacon_core::{
    AttemptStatus, BeaconError, BnResult, Delivery, DeliveryAttempt, DeliveryReceipt,
    DeliveryStatus, FailureReason, Notification, ProviderTrace, Urgency,
};

use crate::backoff::{compute_backoff_delay, profile_for_classification, Backoff, DispatchBackoffContext};
use crate::channels::{ProviderResponse, SendContext};
use crate::circuit_breaker::ChannelBreakerBank;
use crate::escalation::{self, ChannelFailure, EscalationConfig, EscalationContext, EscalationDecision};
use crate::registry::ChannelRegistry;
use crate::signals::DeliverySignals;
use crate::store::DeliveryStore;

/// Result of one `execute` call.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub delivery_id: Uuid,
    pub status: DeliveryStatus,
    /// Present when a critical notification failed and the escalation
    /// engine recommends a channel switch or an offline relay.
    pub escalation: Option<EscalationDecision>,
}

/// Drive `execute` through a concrete boxed future. Spawning `execute` from
/// inside `arm_retry` forms a recursive async cycle whose `Send` inference
/// cannot resolve within the impl's opaque-type defining scope; giving the
/// recursive edge an explicit `dyn Future + Send` return type here — in a
/// separate item — breaks that scope dependency without changing behavior.
fn boxed_execute(
    executor: Arc<DeliveryExecutor>,
    delivery_id: Uuid,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = BnResult<ExecutionReport>> + Send>> {
    Box::pin(async move { executor.execute(delivery_id).await })
}

pub struct DeliveryExecutor {
    store: Arc<DeliveryStore>,
    registry: Arc<ChannelRegistry>,
    signals: Arc<DeliverySignals>,
    breakers: Arc<ChannelBreakerBank>,
    escalation_config: EscalationConfig,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Handle to ourselves for spawning deferred retries.
    self_ref: Weak<DeliveryExecutor>,
}

impl DeliveryExecutor {
    pub fn new(
        store: Arc<DeliveryStore>,
        registry: Arc<ChannelRegistry>,
        signals: Arc<DeliverySignals>,
        breakers: Arc<ChannelBreakerBank>,
        escalation_config: EscalationConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            registry,
            signals,
            breakers,
            escalation_config,
            locks: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    async fn lock_for(&self, delivery_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(delivery_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    async fn token_for(&self, delivery_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancel_tokens.lock().await;
        tokens.entry(delivery_id).or_default().clone()
    }

    async fn drop_token(&self, delivery_id: Uuid) {
        let mut tokens = self.cancel_tokens.lock().await;
        if let Some(token) = tokens.remove(&delivery_id) {
            token.cancel();
        }
    }

    /// Run one send attempt for a delivery. No-op on terminal deliveries.
    pub async fn execute(&self, delivery_id: Uuid) -> BnResult<ExecutionReport> {
        let entry_lock = self.lock_for(delivery_id).await;
        let _guard = entry_lock.lock().await;

        let mut delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(BeaconError::DeliveryNotFound(delivery_id))?;

        if delivery.is_terminal() {
            return Ok(ExecutionReport {
                delivery_id,
                status: delivery.status,
                escalation: None,
            });
        }

        let notification = self
            .store
            .get_notification(delivery.notification_id)
            .await?
            .ok_or(BeaconError::NotificationNotFound(delivery.notification_id))?;

        // Open the attempt before touching the network so a crash leaves a
        // visible Sending entry in the audit log.
        let ordinal = delivery.attempts.len() as u32 + 1;
        let now = Utc::now();
        delivery.attempts.push(DeliveryAttempt {
            attempt: ordinal,
            status: AttemptStatus::Sending,
            started_at: now,
            ended_at: None,
            error_code: None,
            error_message: None,
            provider_trace: None,
        });
        delivery.status = DeliveryStatus::Sending;
        delivery.last_attempt_at = Some(now);
        self.store.save_delivery(&delivery).await?;

        let channel_name = delivery.channel.as_str();

        let Some(handler) = self.registry.resolve_for_kind(delivery.channel).await else {
            tracing::error!(
                delivery_id = %delivery_id,
                channel = %delivery.channel,
                "no provider registered for channel"
            );
            let message = format!("no provider registered for channel {channel_name}");
            return self
                .finish_failed_attempt(delivery, &notification, FailureReason::NoProvider, message, None)
                .await;
        };

        if let Err(open) = self.breakers.check(channel_name) {
            return self
                .finish_failed_attempt(
                    delivery,
                    &notification,
                    FailureReason::CircuitOpen,
                    open.to_string(),
                    None,
                )
                .await;
        }

        let Some(content) = notification.content_for("en").cloned() else {
            return self
                .finish_failed_attempt(
                    delivery,
                    &notification,
                    FailureReason::PayloadRejected,
                    "notification has no content".to_string(),
                    None,
                )
                .await;
        };

        let ctx = SendContext {
            notification_id: notification.id,
            delivery_id,
            attempt: ordinal,
            urgency: notification.urgency,
        };

        let started = Instant::now();
        let outcome = handler.send(&delivery.destination, &content, &ctx).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        delivery.provider = Some(handler.name().to_string());

        match outcome {
            Ok(response) if response.is_success() => {
                self.signals.record_send(latency_ms, true).await;
                self.breakers.record_success(channel_name);
                self.finish_delivered(delivery, handler.name(), response).await
            }
            Ok(response) => {
                self.signals.record_send(latency_ms, false).await;
                self.breakers.record_failure(channel_name);
                let reason = response.failure_reason.unwrap_or(FailureReason::ProviderError);
                let message = response
                    .failure_message
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".to_string());
                let trace = Some(ProviderTrace {
                    provider_message_id: response.provider_message_id.clone(),
                    raw_response: response.raw_response.clone(),
                });
                self.finish_failed_attempt(delivery, &notification, reason, message, trace)
                    .await
            }
            Err(e) => {
                self.signals.record_send(latency_ms, false).await;
                self.breakers.record_failure(channel_name);
                tracing::warn!(
                    delivery_id = %delivery_id,
                    channel = %delivery.channel,
                    error = %e,
                    "provider call errored"
                );
                self.finish_failed_attempt(
                    delivery,
                    &notification,
                    FailureReason::ProviderError,
                    e.to_string(),
                    None,
                )
                .await
            }
        }
    }

    async fn finish_delivered(
        &self,
        mut delivery: Delivery,
        provider_name: &str,
        response: ProviderResponse,
    ) -> BnResult<ExecutionReport> {
        let now = Utc::now();
        if let Some(attempt) = delivery.attempts.last_mut() {
            attempt.status = AttemptStatus::Delivered;
            attempt.ended_at = Some(now);
            attempt.provider_trace = Some(ProviderTrace {
                provider_message_id: response.provider_message_id.clone(),
                raw_response: response.raw_response.clone(),
            });
        }

        let receipt = delivery.receipt.get_or_insert_with(DeliveryReceipt::default);
        receipt.delivered_at = Some(now);
        receipt.confirmation_source = Some(provider_name.to_string());
        receipt.confirmation_payload = response.raw_response.clone();

        delivery.status = DeliveryStatus::Delivered;
        self.store.save_delivery(&delivery).await?;
        self.drop_token(delivery.id).await;

        tracing::info!(
            delivery_id = %delivery.id,
            channel = %delivery.channel,
            provider = provider_name,
            attempt = delivery.attempts.len(),
            "delivery confirmed"
        );

        Ok(ExecutionReport {
            delivery_id: delivery.id,
            status: DeliveryStatus::Delivered,
            escalation: None,
        })
    }

    /// Close the open attempt as failed, then decide what happens next:
    /// permanent and infrastructure failures finish the delivery, critical
    /// notifications go through the escalation engine, everything else
    /// follows the retry policy.
    async fn finish_failed_attempt(
        &self,
        mut delivery: Delivery,
        notification: &Notification,
        reason: FailureReason,
        message: String,
        trace: Option<ProviderTrace>,
    ) -> BnResult<ExecutionReport> {
        let now = Utc::now();
        if let Some(attempt) = delivery.attempts.last_mut() {
            attempt.status = AttemptStatus::Failed;
            attempt.ended_at = Some(now);
            attempt.error_code = Some(reason);
            attempt.error_message = Some(message.clone());
            attempt.provider_trace = trace;
        }
        self.store.save_delivery(&delivery).await?;

        tracing::warn!(
            delivery_id = %delivery.id,
            channel = %delivery.channel,
            reason = %reason,
            attempt = delivery.attempts.len(),
            "delivery attempt failed"
        );

        if notification.urgency == Urgency::Critical {
            // Permanent and infrastructure failures can never succeed on
            // this channel, so escalation skips the same-channel step.
            let ctx = self.escalation_context(&delivery, notification).await?;
            let decision = if reason.is_retryable() {
                escalation::decide(&ctx, &self.escalation_config)
            } else {
                escalation::decide_exhausted(&ctx, &self.escalation_config)
            };
            return match decision {
                EscalationDecision::RetrySameChannel { delay_ms, .. } => {
                    self.schedule_retry(delivery, delay_ms).await
                }
                EscalationDecision::SwitchChannel { .. }
                | EscalationDecision::EscalateOffline { .. } => {
                    // The current channel is exhausted; the orchestrator
                    // drives the replacement delivery.
                    self.fail_delivery(delivery, Some(decision)).await
                }
                EscalationDecision::GiveUp { ref reason, .. } => {
                    tracing::warn!(
                        delivery_id = %delivery.id,
                        reason = %reason,
                        "escalation gave up"
                    );
                    self.fail_delivery(delivery, Some(decision)).await
                }
            };
        }

        if !reason.is_retryable() {
            return self.fail_delivery(delivery, None).await;
        }
        self.handle_retry(delivery, notification).await
    }

    async fn handle_retry(
        &self,
        delivery: Delivery,
        notification: &Notification,
    ) -> BnResult<ExecutionReport> {
        let profile = profile_for_classification(
            notification.urgency,
            &notification.intent,
            notification.target.known_offline,
        );
        let mut policy = profile.policy;
        if let Some(max_retries) = delivery.sla.and_then(|s| s.max_retries) {
            policy.max_attempts = policy.max_attempts.min(max_retries);
        }

        // Remaining time-to-live caps the delay; an exhausted TTL expires
        // the delivery outright.
        let sla_cap = delivery.sla.and_then(|s| s.ttl_secs).map(|ttl| {
            let elapsed = Utc::now().signed_duration_since(delivery.created_at);
            (ttl - elapsed.num_seconds()).max(0) * 1_000
        });
        if sla_cap == Some(0) {
            return self.expire_exhausted(delivery).await;
        }

        let attempt_count = delivery.attempts.len() as u32;
        let backoff = compute_backoff_delay(&DispatchBackoffContext {
            attempt: attempt_count,
            policy,
            adaptive: Some(self.signals.adaptive_context().await),
            priority: notification.priority,
            known_offline: notification.target.known_offline,
            sla_max_delay_ms: sla_cap.map(|ms| ms as u64),
        });

        match backoff {
            Backoff::Abandon => self.fail_delivery(delivery, None).await,
            Backoff::Delay(delay_ms) => self.schedule_retry(delivery, delay_ms).await,
        }
    }

    async fn schedule_retry(&self, mut delivery: Delivery, delay_ms: u64) -> BnResult<ExecutionReport> {
        delivery.status = DeliveryStatus::RetryScheduled;
        self.store.save_delivery(&delivery).await?;

        tracing::info!(
            delivery_id = %delivery.id,
            channel = %delivery.channel,
            delay_ms,
            "retry scheduled"
        );
        self.arm_retry(delivery.id, delay_ms).await;

        Ok(ExecutionReport {
            delivery_id: delivery.id,
            status: DeliveryStatus::RetryScheduled,
            escalation: None,
        })
    }

    /// Arm a deferred re-execution, cancellable via the delivery's token.
    async fn arm_retry(&self, delivery_id: Uuid, delay_ms: u64) {
        let token = self.token_for(delivery_id).await;
        let Some(executor) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(delivery_id = %delivery_id, "armed retry cancelled");
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {
                    // Route the recursive re-execution through a free helper
                    // with a concrete `dyn Future + Send` return type. This
                    // keeps the spawned task's Send check out of the impl's
                    // opaque-type defining scope (execute -> schedule_retry ->
                    // arm_retry -> spawn), which otherwise cannot resolve.
                    if let Err(e) = boxed_execute(executor, delivery_id).await {
                        tracing::error!(
                            delivery_id = %delivery_id,
                            error = %e,
                            "deferred retry execution failed"
                        );
                    }
                }
            }
        });
    }

    async fn fail_delivery(
        &self,
        mut delivery: Delivery,
        escalation: Option<EscalationDecision>,
    ) -> BnResult<ExecutionReport> {
        delivery.status = DeliveryStatus::Failed;
        self.store.save_delivery(&delivery).await?;
        self.drop_token(delivery.id).await;

        Ok(ExecutionReport {
            delivery_id: delivery.id,
            status: DeliveryStatus::Failed,
            escalation,
        })
    }

    async fn expire_exhausted(&self, mut delivery: Delivery) -> BnResult<ExecutionReport> {
        delivery.status = DeliveryStatus::Expired;
        self.store.save_delivery(&delivery).await?;
        self.drop_token(delivery.id).await;

        tracing::warn!(delivery_id = %delivery.id, "delivery TTL exhausted");
        Ok(ExecutionReport {
            delivery_id: delivery.id,
            status: DeliveryStatus::Expired,
            escalation: None,
        })
    }

    /// Escalation input spans every delivery of the notification so
    /// already-attempted channels are excluded from switches.
    async fn escalation_context(
        &self,
        delivery: &Delivery,
        notification: &Notification,
    ) -> BnResult<EscalationContext> {
        let siblings = self.store.list_deliveries(notification.id).await?;
        let mut failures = Vec::new();
        let mut first_attempt_at = None;

        for sibling in &siblings {
            for attempt in &sibling.attempts {
                if first_attempt_at.map_or(true, |t| attempt.started_at < t) {
                    first_attempt_at = Some(attempt.started_at);
                }
                if attempt.status == AttemptStatus::Failed {
                    failures.push(ChannelFailure {
                        channel: sibling.channel,
                        at: attempt.started_at,
                        reason: attempt.error_code.unwrap_or(FailureReason::ProviderError),
                    });
                }
            }
        }
        failures.sort_by_key(|f| f.at);

        Ok(EscalationContext {
            urgency: notification.urgency,
            current_channel: delivery.channel,
            failures,
            capabilities: notification.target.capabilities,
            first_attempt_at: first_attempt_at.unwrap_or(delivery.created_at),
            now: Utc::now(),
        })
    }

    /// Record a read acknowledgment. Valid only from Delivered; a no-op
    /// (returning false) from any other state.
    pub async fn mark_as_read(
        &self,
        delivery_id: Uuid,
        source: &str,
        payload: Option<serde_json::Value>,
    ) -> BnResult<bool> {
        let entry_lock = self.lock_for(delivery_id).await;
        let _guard = entry_lock.lock().await;

        let mut delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(BeaconError::DeliveryNotFound(delivery_id))?;

        if delivery.status != DeliveryStatus::Delivered {
            return Ok(false);
        }

        let receipt = delivery.receipt.get_or_insert_with(DeliveryReceipt::default);
        receipt.read_at = Some(Utc::now());
        receipt.read_source = Some(source.to_string());
        receipt.read_payload = payload;
        delivery.status = DeliveryStatus::Read;
        self.store.save_delivery(&delivery).await?;
        Ok(true)
    }

    /// Cancel a delivery. No-op on terminal deliveries; otherwise appends
    /// a synthetic cancelled attempt and stops any armed retry.
    pub async fn cancel(&self, delivery_id: Uuid, reason: &str) -> BnResult<bool> {
        self.terminate(delivery_id, DeliveryStatus::Cancelled, AttemptStatus::Cancelled, reason)
            .await
    }

    /// Expire a delivery (TTL ran out). Same shape as `cancel`.
    pub async fn expire(&self, delivery_id: Uuid) -> BnResult<bool> {
        self.terminate(
            delivery_id,
            DeliveryStatus::Expired,
            AttemptStatus::Expired,
            "time-to-live exceeded",
        )
        .await
    }

    async fn terminate(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
        attempt_status: AttemptStatus,
        reason: &str,
    ) -> BnResult<bool> {
        let entry_lock = self.lock_for(delivery_id).await;
        let _guard = entry_lock.lock().await;

        let mut delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or(BeaconError::DeliveryNotFound(delivery_id))?;

        if delivery.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        delivery.attempts.push(DeliveryAttempt {
            attempt: delivery.attempts.len() as u32 + 1,
            status: attempt_status,
            started_at: now,
            ended_at: Some(now),
            error_code: None,
            error_message: Some(reason.to_string()),
            provider_trace: None,
        });
        delivery.status = status;
        self.store.save_delivery(&delivery).await?;
        self.drop_token(delivery_id).await;

        tracing::info!(delivery_id = %delivery_id, status = %status, reason, "delivery terminated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::memory::MemoryProvider;
    use crate::channels::ChannelProvider;
    use crate::circuit_breaker::BreakerConfig;
    use crate::registry::RegisterOptions;
    use beacon_core::{
        ChannelKind, DeliverySla, MessageContent, RecipientCapabilities, TargetDescriptor,
    };

    struct Fixture {
        store: Arc<DeliveryStore>,
        registry: Arc<ChannelRegistry>,
        executor: Arc<DeliveryExecutor>,
        push: Arc<MemoryProvider>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(DeliveryStore::in_memory().unwrap());
        let registry = Arc::new(ChannelRegistry::new());
        let push = Arc::new(MemoryProvider::new(ChannelKind::Push));
        registry
            .register(
                "push",
                Arc::clone(&push) as Arc<dyn ChannelProvider>,
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        let executor = DeliveryExecutor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(DeliverySignals::new()),
            Arc::new(ChannelBreakerBank::new(BreakerConfig::default())),
            EscalationConfig::default(),
        );

        Fixture {
            store,
            registry,
            executor,
            push,
        }
    }

    async fn seed(
        fixture: &Fixture,
        urgency: Urgency,
        sla: Option<DeliverySla>,
    ) -> (Notification, Delivery) {
        let notification = Notification::new(
            "order_shipped",
            urgency,
            TargetDescriptor::for_recipient("u1")
                .with_address(ChannelKind::Push, "token-1")
                .with_capabilities(RecipientCapabilities::online_smartphone()),
        )
        .with_content("en", MessageContent::new("hello"));
        fixture.store.insert_notification(&notification).await.unwrap();

        let mut delivery = Delivery::new(notification.id, ChannelKind::Push, "token-1");
        if let Some(sla) = sla {
            delivery = delivery.with_sla(sla);
        }
        fixture.store.insert_delivery(&delivery).await.unwrap();
        (notification, delivery)
    }

    #[tokio::test]
    async fn successful_execute_records_receipt_and_attempt() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert!(report.escalation.is_none());

        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Delivered);
        assert_eq!(loaded.attempts.len(), 1);
        assert_eq!(loaded.attempts[0].status, AttemptStatus::Delivered);
        assert!(loaded.attempts[0].ended_at.is_some());

        let receipt = loaded.receipt.unwrap();
        assert!(receipt.delivered_at.is_some());
        assert_eq!(receipt.confirmation_source.as_deref(), Some("memory-push"));
        assert_eq!(loaded.provider.as_deref(), Some("memory-push"));
    }

    #[tokio::test]
    async fn execute_on_terminal_delivery_is_noop() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;

        fx.executor.execute(delivery.id).await.unwrap();
        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);

        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts.len(), 1, "no second attempt appended");
        assert_eq!(fx.push.sent_count().await, 1);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;
        fx.push.fail_next(FailureReason::Timeout).await;

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::RetryScheduled);

        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::RetryScheduled);
        assert_eq!(loaded.attempts.len(), 1);
        assert_eq!(loaded.attempts[0].status, AttemptStatus::Failed);
        assert_eq!(loaded.attempts[0].error_code, Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn permanent_failure_fails_immediately() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;
        fx.push.fail_next(FailureReason::InvalidTarget).await;

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);

        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Failed);
        assert_eq!(loaded.attempts.len(), 1);
    }

    #[tokio::test]
    async fn missing_provider_fails_fast() {
        let fx = fixture().await;
        let notification = Notification::new(
            "x",
            Urgency::Normal,
            TargetDescriptor::for_recipient("u1").with_address(ChannelKind::Sms, "+155"),
        )
        .with_content("en", MessageContent::new("hi"));
        fx.store.insert_notification(&notification).await.unwrap();
        let delivery = Delivery::new(notification.id, ChannelKind::Sms, "+155");
        fx.store.insert_delivery(&delivery).await.unwrap();

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);

        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts[0].error_code, Some(FailureReason::NoProvider));
    }

    #[tokio::test]
    async fn sla_max_retries_caps_attempts() {
        let fx = fixture().await;
        let (_n, delivery) = seed(
            &fx,
            Urgency::Normal,
            Some(DeliverySla {
                max_retries: Some(1),
                ttl_secs: None,
            }),
        )
        .await;
        fx.push.fail_times(FailureReason::Timeout, 3).await;

        // One retry is permitted under the SLA cap; the second failure
        // exhausts the budget.
        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::RetryScheduled);

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn critical_first_failure_retries_same_channel() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Critical, None).await;
        fx.push.fail_next(FailureReason::Timeout).await;

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::RetryScheduled);
        assert!(report.escalation.is_none());
    }

    #[tokio::test]
    async fn critical_repeated_failures_escalate_to_switch() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Critical, None).await;
        fx.push.fail_times(FailureReason::Timeout, 2).await;

        fx.executor.execute(delivery.id).await.unwrap();
        // Second direct execution (instead of waiting out the armed 5s
        // retry) records the second failure on the same channel.
        let report = fx.executor.execute(delivery.id).await.unwrap();

        assert_eq!(report.status, DeliveryStatus::Failed);
        match report.escalation {
            Some(EscalationDecision::SwitchChannel { channel, .. }) => {
                assert_eq!(channel, ChannelKind::Email)
            }
            other => panic!("expected switch-channel escalation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mark_as_read_only_from_delivered() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;

        // Pending delivery: no-op.
        assert!(!fx
            .executor
            .mark_as_read(delivery.id, "webhook", None)
            .await
            .unwrap());

        fx.executor.execute(delivery.id).await.unwrap();
        assert!(fx
            .executor
            .mark_as_read(delivery.id, "webhook", Some(serde_json::json!({"ua": "test"})))
            .await
            .unwrap());

        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Read);
        let receipt = loaded.receipt.unwrap();
        assert!(receipt.read_at.is_some());
        assert_eq!(receipt.read_source.as_deref(), Some("webhook"));

        // Read is terminal for sends; a second ack is a no-op.
        assert!(!fx
            .executor
            .mark_as_read(delivery.id, "webhook", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_appends_synthetic_attempt() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;

        assert!(fx.executor.cancel(delivery.id, "superseded").await.unwrap());
        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Cancelled);
        assert_eq!(loaded.attempts.len(), 1);
        assert_eq!(loaded.attempts[0].status, AttemptStatus::Cancelled);
        assert_eq!(loaded.attempts[0].error_message.as_deref(), Some("superseded"));

        // Cancelling again is a no-op.
        assert!(!fx.executor.cancel(delivery.id, "again").await.unwrap());
        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts.len(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_armed_retry() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;
        fx.push.fail_next(FailureReason::Timeout).await;

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::RetryScheduled);

        assert!(fx.executor.cancel(delivery.id, "user cancelled").await.unwrap());

        // Give any (wrongly) surviving timer a chance to fire: the retry
        // delay for a first standard failure is over a second, so sleep
        // briefly and confirm no new send happened and state is stable.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Cancelled);
        assert_eq!(fx.push.sent_count().await, 1);
    }

    #[tokio::test]
    async fn expire_sets_expired_status() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;

        assert!(fx.executor.expire(delivery.id).await.unwrap());
        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Expired);
        assert_eq!(loaded.attempts[0].status, AttemptStatus::Expired);
    }

    #[tokio::test]
    async fn exhausted_ttl_expires_on_retry_path() {
        let fx = fixture().await;
        let (_n, delivery) = seed(
            &fx,
            Urgency::Normal,
            Some(DeliverySla {
                max_retries: None,
                ttl_secs: Some(0),
            }),
        )
        .await;
        fx.push.fail_next(FailureReason::Timeout).await;

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Expired);
    }

    #[tokio::test]
    async fn disabled_channel_counts_as_no_provider() {
        let fx = fixture().await;
        let (_n, delivery) = seed(&fx, Urgency::Normal, None).await;
        fx.registry.disable("push").await.unwrap();

        let report = fx.executor.execute(delivery.id).await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);
        let loaded = fx.store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts[0].error_code, Some(FailureReason::NoProvider));
    }
}
