use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("notification not found: {0}")]
    NotificationNotFound(Uuid),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(Uuid),

    #[error("channel already registered: {0}")]
    DuplicateChannel(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("attempt log for delivery {delivery_id} would shrink from {stored} to {incoming} entries")]
    AppendOnlyViolation {
        delivery_id: Uuid,
        stored: usize,
        incoming: usize,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BnResult<T> = Result<T, BeaconError>;
