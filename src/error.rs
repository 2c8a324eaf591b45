//! Error types for the replay bus.

use crate::subscriptions::SubscriptionId;
use crate::types::EventId;
use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Emitter has been destroyed")]
    Destroyed,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Middleware failed on channel {channel} for event {event_id}: {reason}")]
    MiddlewareFailure {
        channel: String,
        event_id: EventId,
        reason: String,
    },

    #[error("Subscriber {subscription:?} failed on channel {channel} for event {event_id}: {reason}")]
    SubscriberFailure {
        channel: String,
        event_id: EventId,
        subscription: SubscriptionId,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Error returned by a middleware stage.
pub type MiddlewareError = Box<dyn std::error::Error + Send + Sync>;

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
