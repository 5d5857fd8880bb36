use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    OnHold,
    Failed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::OnHold => "on-hold",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "completed" => Some(OrderStatus::Completed),
            "on-hold" => Some(OrderStatus::OnHold),
            "failed" => Some(OrderStatus::Failed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub customer_id: i64,
    pub status: OrderStatus,
    pub total: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn needs_payment(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Failed) && self.total > Decimal::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: i64,
    pub status: OrderStatus,
    pub total: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create_order(&self, payload: NewOrder) -> Result<Order>;
    async fn get_order(&self, id: i64) -> Result<Option<Order>>;
    async fn update_order_status(&self, id: i64, status: OrderStatus) -> Result<bool>;
    async fn mark_order_paid(&self, id: i64, status: OrderStatus, paid_at: DateTime<Utc>) -> Result<bool>;
    /// Removes the order together with its metadata and relations.
    async fn delete_order(&self, id: i64) -> Result<bool>;
}
