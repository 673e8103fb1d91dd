//! Notification dispatch orchestrator.
//!
//! Top-level entry point: resolves target channels from the urgency
//! routing table, guarantees idempotent creation, drives per-channel
//! delivery execution, follows escalation switches, and aggregates the
//! per-channel outcomes into the notification's global status.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use beacon_core::{
    BeaconError, BnResult, Delivery, Notification, NotificationRequest, NotificationStatus,
};

use crate::config::RoutingConfig;
use crate::delivery::DeliveryExecutor;
use crate::escalation::EscalationDecision;
use crate::scheduler::JobRunner;
use crate::store::DeliveryStore;

/// How many pending notifications one recovery sweep re-drives.
const RETRY_PENDING_BATCH: usize = 100;

pub struct Orchestrator {
    store: Arc<DeliveryStore>,
    executor: Arc<DeliveryExecutor>,
    routing: RoutingConfig,
    max_channel_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<DeliveryStore>,
        executor: Arc<DeliveryExecutor>,
        routing: RoutingConfig,
        max_channel_attempts: u32,
    ) -> Self {
        Self {
            store,
            executor,
            routing,
            max_channel_attempts,
        }
    }

    /// Create a notification plus one delivery per resolved channel — or
    /// return the existing notification unchanged when the idempotency key
    /// has been seen before.
    pub async fn create_or_get(&self, request: &NotificationRequest) -> BnResult<Notification> {
        if let Some(ref key) = request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                tracing::debug!(
                    idempotency_key = %key,
                    notification_id = %existing.id,
                    "idempotency hit, returning existing notification"
                );
                return Ok(existing);
            }
        }

        let channels = self.routing.channels_for(request.urgency).to_vec();
        let notification = Notification::from_request(request).with_channels(channels.clone());
        self.store.insert_notification(&notification).await?;

        for channel in channels {
            let destination = notification
                .target
                .address_for(channel)
                .unwrap_or_default()
                .to_string();
            let delivery = Delivery::new(notification.id, channel, destination);
            self.store.insert_delivery(&delivery).await?;
        }

        tracing::info!(
            notification_id = %notification.id,
            intent = %notification.intent,
            urgency = %notification.urgency,
            channels = notification.channels.len(),
            "notification created"
        );
        Ok(notification)
    }

    /// Create (or fetch) the notification and drive every channel once.
    pub async fn dispatch(&self, request: &NotificationRequest) -> BnResult<Notification> {
        let notification = self.create_or_get(request).await?;
        self.dispatch_existing(notification.id).await?;
        self.store
            .get_notification(notification.id)
            .await?
            .ok_or(BeaconError::NotificationNotFound(notification.id))
    }

    /// Drive all unresolved channels of an existing notification, then
    /// recompute its global status.
    pub async fn dispatch_existing(&self, notification_id: Uuid) -> BnResult<()> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or(BeaconError::NotificationNotFound(notification_id))?;

        if notification.status != NotificationStatus::Pending {
            return Ok(());
        }

        let deliveries = self.store.list_deliveries(notification_id).await?;
        for delivery in deliveries {
            self.dispatch_to_channel(&notification, delivery).await?;
        }

        self.recompute_global_status(notification_id).await?;
        Ok(())
    }

    /// Run one channel's delivery, bounded by "already delivered, skip"
    /// and the per-channel attempt cap. Escalation switches spawn and
    /// drive a delivery on the target channel.
    async fn dispatch_to_channel(
        &self,
        notification: &Notification,
        delivery: Delivery,
    ) -> BnResult<()> {
        if delivery.is_terminal() {
            return Ok(());
        }
        if delivery.attempts.len() >= self.max_channel_attempts as usize {
            tracing::debug!(
                delivery_id = %delivery.id,
                channel = %delivery.channel,
                attempts = delivery.attempts.len(),
                "channel attempt cap reached, skipping"
            );
            return Ok(());
        }

        let report = self.executor.execute(delivery.id).await?;

        if let Some(decision) = report.escalation {
            self.follow_escalation(notification, decision).await?;
        }
        Ok(())
    }

    /// Act on a switch/offline escalation by creating (if needed) and
    /// driving a delivery on the target channel. Other decisions are
    /// informational here — the executor already applied them.
    async fn follow_escalation(
        &self,
        notification: &Notification,
        decision: EscalationDecision,
    ) -> BnResult<()> {
        let (channel, reason) = match decision {
            EscalationDecision::SwitchChannel { channel, reason }
            | EscalationDecision::EscalateOffline { channel, reason } => (channel, reason),
            EscalationDecision::RetrySameChannel { .. } | EscalationDecision::GiveUp { .. } => {
                return Ok(());
            }
        };

        let existing = self.store.list_deliveries(notification.id).await?;
        if existing.iter().any(|d| d.channel == channel) {
            // Escalation is idempotent per channel.
            return Ok(());
        }

        tracing::warn!(
            notification_id = %notification.id,
            channel = %channel,
            reason = %reason,
            "escalating to new channel"
        );

        let destination = notification
            .target
            .address_for(channel)
            .unwrap_or_default()
            .to_string();
        let delivery = Delivery::new(notification.id, channel, destination);
        let delivery_id = delivery.id;
        self.store.insert_delivery(&delivery).await?;

        let report = self.executor.execute(delivery_id).await?;
        if report.escalation.is_some() {
            // One escalation hop per dispatch pass; further hops happen on
            // the next drive of this notification.
            tracing::debug!(
                notification_id = %notification.id,
                "escalated channel failed too, deferring further escalation"
            );
        }
        Ok(())
    }

    /// Delivered if any channel reached the recipient; failed only if
    /// every channel terminally failed; pending otherwise.
    pub async fn recompute_global_status(
        &self,
        notification_id: Uuid,
    ) -> BnResult<NotificationStatus> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or(BeaconError::NotificationNotFound(notification_id))?;
        let deliveries = self.store.list_deliveries(notification_id).await?;

        let any_delivered = deliveries.iter().any(|d| {
            matches!(
                d.status,
                beacon_core::DeliveryStatus::Delivered | beacon_core::DeliveryStatus::Read
            )
        });
        let all_failed = !deliveries.is_empty()
            && deliveries.iter().all(|d| d.status.is_failure_terminal());

        let status = if any_delivered {
            NotificationStatus::Delivered
        } else if all_failed {
            NotificationStatus::Failed
        } else {
            NotificationStatus::Pending
        };

        if status != notification.status {
            self.store
                .update_notification_status(notification_id, status)
                .await?;
            tracing::info!(
                notification_id = %notification_id,
                status = %status,
                "global status recomputed"
            );
        }
        Ok(status)
    }

    /// Crash-recovery sweep: re-drive dispatch for persisted pending
    /// notifications whose in-memory jobs were lost. Returns the number
    /// re-driven.
    pub async fn retry_pending(&self) -> BnResult<usize> {
        let pending = self.store.list_pending(RETRY_PENDING_BATCH).await?;
        let mut retried = 0;
        for notification in pending {
            if let Err(e) = self.dispatch_existing(notification.id).await {
                tracing::error!(
                    notification_id = %notification.id,
                    error = %e,
                    "retry sweep failed for notification"
                );
                continue;
            }
            retried += 1;
        }
        tracing::info!(retried, "pending notifications re-driven");
        Ok(retried)
    }
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run(&self, notification_id: Uuid) -> BnResult<()> {
        self.dispatch_existing(notification_id).await
    }
}
