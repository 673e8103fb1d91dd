//! SQLite-backed persistence for notifications and deliveries.
//!
//! Records are never physically deleted. The delivery attempt log is
//! append-only: a save that would shrink the stored log is rejected as a
//! corruption error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use beacon_core::{
    BeaconError, BnResult, Delivery, DeliveryStatus, Notification, NotificationStatus,
};

pub struct DeliveryStore {
    db: Arc<Mutex<Connection>>,
}

/// Aggregate counts for the stats surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    pub notifications_total: u64,
    pub notifications_by_status: HashMap<String, u64>,
    pub deliveries_total: u64,
    pub deliveries_by_status: HashMap<String, u64>,
    pub attempts_total: u64,
}

impl DeliveryStore {
    pub fn open(db_path: &str) -> BnResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| BeaconError::Storage(format!("store open: {e}")))?;
        Self::create_tables(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store (for tests).
    pub fn in_memory() -> BnResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BeaconError::Storage(format!("store in-memory: {e}")))?;
        Self::create_tables(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> BnResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT UNIQUE,
                intent TEXT NOT NULL,
                priority INTEGER NOT NULL,
                urgency TEXT NOT NULL,
                mode TEXT NOT NULL,
                target TEXT NOT NULL,
                content TEXT NOT NULL,
                channels TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_status
                ON notifications(status, created_at ASC);
            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                destination TEXT NOT NULL,
                provider TEXT,
                status TEXT NOT NULL,
                attempts TEXT NOT NULL,
                last_attempt_at TEXT,
                receipt TEXT,
                sla TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_notification
                ON deliveries(notification_id);",
        )
        .map_err(|e| BeaconError::Storage(format!("store schema: {e}")))?;
        Ok(())
    }

    // ── Notifications ───────────────────────────────────────────────

    pub async fn insert_notification(&self, notification: &Notification) -> BnResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO notifications
             (id, idempotency_key, intent, priority, urgency, mode, target, content, channels, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                notification.id.to_string(),
                notification.idempotency_key,
                notification.intent,
                notification.priority,
                serde_json::to_string(&notification.urgency)?,
                serde_json::to_string(&notification.mode)?,
                serde_json::to_string(&notification.target)?,
                serde_json::to_string(&notification.content)?,
                serde_json::to_string(&notification.channels)?,
                notification.status.as_str(),
                notification.created_at.to_rfc3339(),
                notification.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| BeaconError::Storage(format!("insert notification: {e}")))?;
        Ok(())
    }

    pub async fn get_notification(&self, id: Uuid) -> BnResult<Option<Notification>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT id, idempotency_key, intent, priority, urgency, mode, target, content, channels, status, created_at, updated_at
             FROM notifications WHERE id = ?1",
            params![id.to_string()],
            |row| Self::row_to_notification(row),
        )
        .optional()
        .map_err(|e| BeaconError::Storage(format!("get notification: {e}")))
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> BnResult<Option<Notification>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT id, idempotency_key, intent, priority, urgency, mode, target, content, channels, status, created_at, updated_at
             FROM notifications WHERE idempotency_key = ?1",
            params![key],
            |row| Self::row_to_notification(row),
        )
        .optional()
        .map_err(|e| BeaconError::Storage(format!("idempotency lookup: {e}")))
    }

    /// Notifications addressed to a recipient id, newest first.
    pub async fn find_by_recipient(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> BnResult<Vec<Notification>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, idempotency_key, intent, priority, urgency, mode, target, content, channels, status, created_at, updated_at
                 FROM notifications
                 WHERE json_extract(target, '$.recipient_id') = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(|e| BeaconError::Storage(format!("recipient prepare: {e}")))?;

        let rows = stmt
            .query_map(params![recipient_id, limit as i64], |row| {
                Self::row_to_notification(row)
            })
            .map_err(|e| BeaconError::Storage(format!("recipient query: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| BeaconError::Storage(format!("recipient row: {e}")))?);
        }
        Ok(out)
    }

    pub async fn update_notification_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> BnResult<()> {
        let db = self.db.lock().await;
        let affected = db
            .execute(
                "UPDATE notifications SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .map_err(|e| BeaconError::Storage(format!("update notification: {e}")))?;
        if affected == 0 {
            return Err(BeaconError::NotificationNotFound(id));
        }
        Ok(())
    }

    /// Oldest pending notifications, bounded; the crash-recovery sweep.
    pub async fn list_pending(&self, limit: usize) -> BnResult<Vec<Notification>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, idempotency_key, intent, priority, urgency, mode, target, content, channels, status, created_at, updated_at
                 FROM notifications WHERE status = 'pending'
                 ORDER BY created_at ASC LIMIT ?1",
            )
            .map_err(|e| BeaconError::Storage(format!("pending prepare: {e}")))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| Self::row_to_notification(row))
            .map_err(|e| BeaconError::Storage(format!("pending query: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| BeaconError::Storage(format!("pending row: {e}")))?);
        }
        Ok(out)
    }

    // ── Deliveries ──────────────────────────────────────────────────

    pub async fn insert_delivery(&self, delivery: &Delivery) -> BnResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO deliveries
             (id, notification_id, channel, destination, provider, status, attempts, last_attempt_at, receipt, sla, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                delivery.id.to_string(),
                delivery.notification_id.to_string(),
                delivery.channel.as_str(),
                delivery.destination,
                delivery.provider,
                delivery.status.as_str(),
                serde_json::to_string(&delivery.attempts)?,
                delivery.last_attempt_at.map(|dt| dt.to_rfc3339()),
                delivery
                    .receipt
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                delivery.sla.as_ref().map(serde_json::to_string).transpose()?,
                delivery.created_at.to_rfc3339(),
                delivery.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| BeaconError::Storage(format!("insert delivery: {e}")))?;
        Ok(())
    }

    pub async fn get_delivery(&self, id: Uuid) -> BnResult<Option<Delivery>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT id, notification_id, channel, destination, provider, status, attempts, last_attempt_at, receipt, sla, created_at, updated_at
             FROM deliveries WHERE id = ?1",
            params![id.to_string()],
            |row| Self::row_to_delivery(row),
        )
        .optional()
        .map_err(|e| BeaconError::Storage(format!("get delivery: {e}")))
    }

    pub async fn list_deliveries(&self, notification_id: Uuid) -> BnResult<Vec<Delivery>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, notification_id, channel, destination, provider, status, attempts, last_attempt_at, receipt, sla, created_at, updated_at
                 FROM deliveries WHERE notification_id = ?1 ORDER BY created_at ASC",
            )
            .map_err(|e| BeaconError::Storage(format!("deliveries prepare: {e}")))?;

        let rows = stmt
            .query_map(params![notification_id.to_string()], |row| {
                Self::row_to_delivery(row)
            })
            .map_err(|e| BeaconError::Storage(format!("deliveries query: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| BeaconError::Storage(format!("deliveries row: {e}")))?);
        }
        Ok(out)
    }

    /// Persist a delivery. Rejects any save that would shrink the stored
    /// attempt log — the log is append-only by contract.
    pub async fn save_delivery(&self, delivery: &Delivery) -> BnResult<()> {
        let db = self.db.lock().await;

        let stored_attempts: Option<String> = db
            .query_row(
                "SELECT attempts FROM deliveries WHERE id = ?1",
                params![delivery.id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| BeaconError::Storage(format!("save lookup: {e}")))?;

        let Some(stored_attempts) = stored_attempts else {
            return Err(BeaconError::DeliveryNotFound(delivery.id));
        };

        let stored: Vec<serde_json::Value> = serde_json::from_str(&stored_attempts)?;
        if delivery.attempts.len() < stored.len() {
            return Err(BeaconError::AppendOnlyViolation {
                delivery_id: delivery.id,
                stored: stored.len(),
                incoming: delivery.attempts.len(),
            });
        }

        db.execute(
            "UPDATE deliveries
             SET status = ?1, provider = ?2, attempts = ?3, last_attempt_at = ?4, receipt = ?5, sla = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                delivery.status.as_str(),
                delivery.provider,
                serde_json::to_string(&delivery.attempts)?,
                delivery.last_attempt_at.map(|dt| dt.to_rfc3339()),
                delivery
                    .receipt
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                delivery.sla.as_ref().map(serde_json::to_string).transpose()?,
                Utc::now().to_rfc3339(),
                delivery.id.to_string(),
            ],
        )
        .map_err(|e| BeaconError::Storage(format!("save delivery: {e}")))?;
        Ok(())
    }

    // ── Stats ───────────────────────────────────────────────────────

    pub async fn stats(&self) -> BnResult<DeliveryStats> {
        let db = self.db.lock().await;
        let mut stats = DeliveryStats::default();

        let mut stmt = db
            .prepare("SELECT status, COUNT(*) FROM notifications GROUP BY status")
            .map_err(|e| BeaconError::Storage(format!("stats prepare: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: u64 = row.get(1)?;
                Ok((status, count))
            })
            .map_err(|e| BeaconError::Storage(format!("stats query: {e}")))?;
        for row in rows {
            let (status, count) =
                row.map_err(|e| BeaconError::Storage(format!("stats row: {e}")))?;
            stats.notifications_total += count;
            stats.notifications_by_status.insert(status, count);
        }

        let mut stmt = db
            .prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(json_array_length(attempts)), 0)
                 FROM deliveries GROUP BY status",
            )
            .map_err(|e| BeaconError::Storage(format!("stats prepare: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: u64 = row.get(1)?;
                let attempts: u64 = row.get(2)?;
                Ok((status, count, attempts))
            })
            .map_err(|e| BeaconError::Storage(format!("stats query: {e}")))?;
        for row in rows {
            let (status, count, attempts) =
                row.map_err(|e| BeaconError::Storage(format!("stats row: {e}")))?;
            stats.deliveries_total += count;
            stats.attempts_total += attempts;
            stats.deliveries_by_status.insert(status, count);
        }

        Ok(stats)
    }

    // ── Row mapping ─────────────────────────────────────────────────

    fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
        let id_str: String = row.get(0)?;
        let idempotency_key: Option<String> = row.get(1)?;
        let intent: String = row.get(2)?;
        let priority: u8 = row.get(3)?;
        let urgency_str: String = row.get(4)?;
        let mode_str: String = row.get(5)?;
        let target_str: String = row.get(6)?;
        let content_str: String = row.get(7)?;
        let channels_str: String = row.get(8)?;
        let status_str: String = row.get(9)?;
        let created_at_str: String = row.get(10)?;
        let updated_at_str: String = row.get(11)?;

        Ok(Notification {
            id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
            idempotency_key,
            intent,
            priority,
            urgency: serde_json::from_str(&urgency_str)
                .unwrap_or(beacon_core::Urgency::Normal),
            mode: serde_json::from_str(&mode_str)
                .unwrap_or(beacon_core::DeliveryMode::Immediate),
            target: serde_json::from_str(&target_str).unwrap_or_default(),
            content: serde_json::from_str(&content_str).unwrap_or_default(),
            channels: serde_json::from_str(&channels_str).unwrap_or_default(),
            status: status_str.parse().unwrap_or(NotificationStatus::Pending),
            created_at: parse_dt(&created_at_str),
            updated_at: parse_dt(&updated_at_str),
        })
    }

    fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
        let id_str: String = row.get(0)?;
        let notification_id_str: String = row.get(1)?;
        let channel_str: String = row.get(2)?;
        let destination: String = row.get(3)?;
        let provider: Option<String> = row.get(4)?;
        let status_str: String = row.get(5)?;
        let attempts_str: String = row.get(6)?;
        let last_attempt_at_str: Option<String> = row.get(7)?;
        let receipt_str: Option<String> = row.get(8)?;
        let sla_str: Option<String> = row.get(9)?;
        let created_at_str: String = row.get(10)?;
        let updated_at_str: String = row.get(11)?;

        Ok(Delivery {
            id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
            notification_id: Uuid::parse_str(&notification_id_str)
                .unwrap_or_else(|_| Uuid::nil()),
            channel: channel_str.parse().unwrap_or(beacon_core::ChannelKind::Push),
            destination,
            provider,
            status: status_str.parse().unwrap_or(DeliveryStatus::Pending),
            attempts: serde_json::from_str(&attempts_str).unwrap_or_default(),
            last_attempt_at: last_attempt_at_str.as_deref().map(parse_dt),
            receipt: receipt_str
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            sla: sla_str.as_deref().and_then(|s| serde_json::from_str(s).ok()),
            created_at: parse_dt(&created_at_str),
            updated_at: parse_dt(&updated_at_str),
        })
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
