use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical request to communicate with a recipient, independent of channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub idempotency_key: Option<String>,
    /// Business intent/category, e.g. "order_shipped" or "payment_alert".
    pub intent: String,
    /// Numeric priority, 1 (lowest) to 10 (highest). 5 is neutral.
    pub priority: u8,
    pub urgency: Urgency,
    pub mode: DeliveryMode,
    pub target: TargetDescriptor,
    /// Per-language content keyed by language code.
    pub content: HashMap<String, MessageContent>,
    /// Channels resolved for this notification at dispatch time.
    pub channels: Vec<ChannelKind>,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Immediate,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
}

/// A delivery transport. The set is closed: adding a transport means adding
/// a variant and a provider implementation, not runtime reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Email,
    Sms,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Telegram,
    Ussd,
    Mesh,
}

/// Who and where to reach: recipient identity, per-channel destination
/// addresses, and device/connectivity capabilities used for escalation
/// gating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub addresses: HashMap<ChannelKind, String>,
    #[serde(default)]
    pub capabilities: RecipientCapabilities,
    /// Set when the recipient is known to be offline (e.g. last heartbeat
    /// stale); floors retry delays and biases profile selection.
    #[serde(default)]
    pub known_offline: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecipientCapabilities {
    #[serde(default)]
    pub smartphone: bool,
    #[serde(default)]
    pub internet: bool,
    #[serde(default)]
    pub sim: bool,
    #[serde(default)]
    pub supports_ussd: bool,
    #[serde(default)]
    pub supports_mesh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub title: Option<String>,
    pub body: String,
}

/// Inbound dispatch request, JSON-shaped. Rules/schedule/security/audit
/// blocks are consumed by upstream advisory engines and carried opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub idempotency_key: Option<String>,
    pub intent: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_urgency")]
    pub urgency: Urgency,
    #[serde(default = "default_mode")]
    pub mode: DeliveryMode,
    pub target: TargetDescriptor,
    pub content: HashMap<String, MessageContent>,
    #[serde(default)]
    pub rules: Option<serde_json::Value>,
    #[serde(default)]
    pub schedule: Option<serde_json::Value>,
    #[serde(default)]
    pub security: Option<serde_json::Value>,
    #[serde(default)]
    pub audit: Option<serde_json::Value>,
}

fn default_priority() -> u8 {
    5
}

fn default_urgency() -> Urgency {
    Urgency::Normal
}

fn default_mode() -> DeliveryMode {
    DeliveryMode::Immediate
}

impl Notification {
    pub fn new(intent: impl Into<String>, urgency: Urgency, target: TargetDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            idempotency_key: None,
            intent: intent.into(),
            priority: 5,
            urgency,
            mode: DeliveryMode::Immediate,
            target,
            content: HashMap::new(),
            channels: Vec::new(),
            status: NotificationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_request(request: &NotificationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            idempotency_key: request.idempotency_key.clone(),
            intent: request.intent.clone(),
            priority: request.priority.clamp(1, 10),
            urgency: request.urgency,
            mode: request.mode,
            target: request.target.clone(),
            content: request.content.clone(),
            channels: Vec::new(),
            status: NotificationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_content(mut self, language: impl Into<String>, content: MessageContent) -> Self {
        self.content.insert(language.into(), content);
        self
    }

    pub fn with_channels(mut self, channels: Vec<ChannelKind>) -> Self {
        self.channels = channels;
        self
    }

    /// Content for a language, falling back to "en", then to any entry.
    pub fn content_for(&self, language: &str) -> Option<&MessageContent> {
        self.content
            .get(language)
            .or_else(|| self.content.get("en"))
            .or_else(|| self.content.values().next())
    }
}

impl MessageContent {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            title: None,
            body: body.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl TargetDescriptor {
    pub fn for_recipient(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, channel: ChannelKind, address: impl Into<String>) -> Self {
        self.addresses.insert(channel, address.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: RecipientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_known_offline(mut self, offline: bool) -> Self {
        self.known_offline = offline;
        self
    }

    pub fn address_for(&self, channel: ChannelKind) -> Option<&str> {
        self.addresses.get(&channel).map(String::as_str)
    }
}

impl RecipientCapabilities {
    /// A recipient on a connected smartphone with a SIM — the common case.
    pub fn online_smartphone() -> Self {
        Self {
            smartphone: true,
            internet: true,
            sim: true,
            supports_ussd: false,
            supports_mesh: false,
        }
    }
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "delivered" => Ok(NotificationStatus::Delivered),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status: {other}")),
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Push => "push",
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::WhatsApp => "whatsapp",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Ussd => "ussd",
            ChannelKind::Mesh => "mesh",
        }
    }

    pub const ALL: [ChannelKind; 7] = [
        ChannelKind::Push,
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::WhatsApp,
        ChannelKind::Telegram,
        ChannelKind::Ussd,
        ChannelKind::Mesh,
    ];
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(ChannelKind::Push),
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            "whatsapp" => Ok(ChannelKind::WhatsApp),
            "telegram" => Ok(ChannelKind::Telegram),
            "ussd" => Ok(ChannelKind::Ussd),
            "mesh" => Ok(ChannelKind::Mesh),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Normal => write!(f, "normal"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}
