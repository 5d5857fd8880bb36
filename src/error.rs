use thiserror::Error;

use crate::subscription::SubscriptionStatus;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Invalid relation type: {0}")]
    InvalidRelationType(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Gateway charge failed: {0}")]
    GatewayChargeFailure(String),

    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(i64),

    #[error("Order {0} not found")]
    OrderNotFound(i64),

    #[error("Retry {0} not found")]
    RetryNotFound(i64),
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;
