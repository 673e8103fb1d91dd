//! Thin REST surface over the delivery engine.
//!
//! Authentication and authorization happen upstream; these handlers only
//! translate between HTTP and the orchestrator.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_core::{Delivery, DeliveryMode, Notification, NotificationRequest};

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/notifications", post(dispatch).get(list_by_target))
        .route("/notifications/stats", get(stats))
        .route("/notifications/retry", post(retry_pending))
        .route("/notifications/:id", get(get_notification))
        .route("/notifications/:id/deliveries/:delivery_id/read", post(mark_read))
        .with_state(state)
}

// --- DTOs ---

#[derive(Serialize)]
pub struct NotificationResponse {
    pub id: String,
    pub intent: String,
    pub priority: u8,
    pub urgency: String,
    pub status: String,
    pub channels: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Notification> for NotificationResponse {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id.to_string(),
            intent: n.intent.clone(),
            priority: n.priority,
            urgency: n.urgency.to_string(),
            status: n.status.to_string(),
            channels: n.channels.iter().map(|c| c.to_string()).collect(),
            created_at: n.created_at.to_rfc3339(),
            updated_at: n.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct DeliveryResponse {
    pub id: String,
    pub channel: String,
    pub destination: String,
    pub provider: Option<String>,
    pub status: String,
    pub attempt_count: usize,
    pub last_attempt_at: Option<String>,
    pub last_error: Option<String>,
}

impl From<&Delivery> for DeliveryResponse {
    fn from(d: &Delivery) -> Self {
        Self {
            id: d.id.to_string(),
            channel: d.channel.to_string(),
            destination: d.destination.clone(),
            provider: d.provider.clone(),
            status: d.status.to_string(),
            attempt_count: d.attempts.len(),
            last_attempt_at: d.last_attempt_at.map(|dt| dt.to_rfc3339()),
            last_error: d
                .last_failure()
                .and_then(|a| a.error_message.clone()),
        }
    }
}

#[derive(Serialize)]
pub struct NotificationDetailResponse {
    #[serde(flatten)]
    pub notification: NotificationResponse,
    pub deliveries: Vec<DeliveryResponse>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub target: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
pub struct MarkReadDto {
    pub source: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

fn parse_uuid(s: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(s).map_err(|_| (StatusCode::BAD_REQUEST, "invalid uuid".to_string()))
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// --- Handlers ---

/// POST /notifications
async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if request.content.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "content must not be empty".into()));
    }

    // Scheduled-mode requests are created now but dispatched by the
    // scheduler at their requested time.
    if request.mode == DeliveryMode::Scheduled {
        let notification = state
            .orchestrator
            .create_or_get(&request)
            .await
            .map_err(internal)?;
        let run_at = request
            .schedule
            .as_ref()
            .and_then(|s| s.get("at"))
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let job_id = state
            .scheduler
            .enqueue(notification.id, run_at, Some(notification.priority as i32))
            .await;

        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "id": notification.id,
                "status": notification.status,
                "job_id": job_id,
            })),
        )
            .into_response());
    }

    let notification = state.orchestrator.dispatch(&request).await.map_err(internal)?;
    let deliveries = state
        .store
        .list_deliveries(notification.id)
        .await
        .map_err(internal)?;

    let body = NotificationDetailResponse {
        notification: NotificationResponse::from(&notification),
        deliveries: deliveries.iter().map(DeliveryResponse::from).collect(),
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// GET /notifications/:id
async fn get_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NotificationDetailResponse>, (StatusCode, String)> {
    let id = parse_uuid(&id)?;
    let notification = state
        .store
        .get_notification(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "notification not found".to_string()))?;
    let deliveries = state.store.list_deliveries(id).await.map_err(internal)?;

    Ok(Json(NotificationDetailResponse {
        notification: NotificationResponse::from(&notification),
        deliveries: deliveries.iter().map(DeliveryResponse::from).collect(),
    }))
}

/// GET /notifications?target=
async fn list_by_target(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationResponse>>, (StatusCode, String)> {
    let notifications = state
        .store
        .find_by_recipient(&query.target, query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(
        notifications.iter().map(NotificationResponse::from).collect(),
    ))
}

/// GET /notifications/stats
async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let store_stats = state.store.stats().await.map_err(internal)?;
    let scheduler_stats = state.scheduler.stats().await;
    let channel_health = state.registry.health_check_all().await;
    let counters = state.signals.counters().await;

    Ok(Json(serde_json::json!({
        "store": store_stats,
        "scheduler": scheduler_stats,
        "channels": channel_health,
        "counters": counters,
    })))
}

/// POST /notifications/retry
async fn retry_pending(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let retried = state.orchestrator.retry_pending().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "retried": retried })))
}

/// POST /notifications/:id/deliveries/:delivery_id/read
async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path((id, delivery_id)): Path<(String, String)>,
    Json(dto): Json<MarkReadDto>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let _ = parse_uuid(&id)?;
    let delivery_id = parse_uuid(&delivery_id)?;

    let transitioned = state
        .executor
        .mark_as_read(delivery_id, &dto.source, dto.payload)
        .await
        .map_err(internal)?;

    Ok(Json(serde_json::json!({ "read": transitioned })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{
        ChannelKind, DeliveryStatus, MessageContent, NotificationStatus, TargetDescriptor, Urgency,
    };
    use chrono::Utc;

    fn sample_notification() -> Notification {
        let mut n = Notification::new(
            "order_shipped",
            Urgency::High,
            TargetDescriptor::for_recipient("u1"),
        )
        .with_content("en", MessageContent::new("hi"))
        .with_channels(vec![ChannelKind::Push, ChannelKind::Email]);
        n.status = NotificationStatus::Delivered;
        n
    }

    #[test]
    fn notification_response_from_model() {
        let n = sample_notification();
        let resp = NotificationResponse::from(&n);
        assert_eq!(resp.intent, "order_shipped");
        assert_eq!(resp.urgency, "high");
        assert_eq!(resp.status, "delivered");
        assert_eq!(resp.channels, vec!["push", "email"]);
    }

    #[test]
    fn delivery_response_surfaces_last_error() {
        let mut d = Delivery::new(Uuid::now_v7(), ChannelKind::Push, "token");
        d.status = DeliveryStatus::Failed;
        let now = Utc::now();
        d.attempts.push(beacon_core::DeliveryAttempt {
            attempt: 1,
            status: beacon_core::AttemptStatus::Failed,
            started_at: now,
            ended_at: Some(now),
            error_code: Some(beacon_core::FailureReason::Timeout),
            error_message: Some("gateway timeout".into()),
            provider_trace: None,
        });

        let resp = DeliveryResponse::from(&d);
        assert_eq!(resp.status, "failed");
        assert_eq!(resp.attempt_count, 1);
        assert_eq!(resp.last_error.as_deref(), Some("gateway timeout"));
    }

    #[test]
    fn detail_response_flattens_notification() {
        let n = sample_notification();
        let detail = NotificationDetailResponse {
            notification: NotificationResponse::from(&n),
            deliveries: Vec::new(),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["intent"], "order_shipped");
        assert!(json["deliveries"].as_array().unwrap().is_empty());
    }

    #[test]
    fn list_query_defaults_limit() {
        let query: ListQuery = serde_json::from_value(serde_json::json!({
            "target": "u1"
        }))
        .unwrap();
        assert_eq!(query.limit, 50);
    }

    #[test]
    fn parse_uuid_rejects_garbage() {
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_uuid(&Uuid::now_v7().to_string()).is_ok());
    }
}
