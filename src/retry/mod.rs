pub mod manager;
pub mod migration;
pub mod rules;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use rules::RetryRule;

pub use manager::{RetryManager, RetryOutcome};
pub use migration::{MigrationProgress, RetryStoreMigrator};
pub use rules::RetryRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Processing,
    Failed,
    Complete,
    Cancelled,
}

impl RetryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Processing => "processing",
            RetryStatus::Failed => "failed",
            RetryStatus::Complete => "complete",
            RetryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RetryStatus::Pending),
            "processing" => Some(RetryStatus::Processing),
            "failed" => Some(RetryStatus::Failed),
            "complete" => Some(RetryStatus::Complete),
            "cancelled" => Some(RetryStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RetryStatus::Failed | RetryStatus::Complete | RetryStatus::Cancelled
        )
    }

    pub fn can_move_to(self, next: RetryStatus) -> bool {
        matches!(
            (self, next),
            (RetryStatus::Pending, RetryStatus::Processing)
                | (RetryStatus::Pending, RetryStatus::Cancelled)
                | (RetryStatus::Processing, RetryStatus::Complete)
                | (RetryStatus::Processing, RetryStatus::Failed)
                | (RetryStatus::Processing, RetryStatus::Cancelled)
        )
    }
}

/// One scheduled re-attempt of a failed renewal charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retry {
    pub id: i64,
    pub order_id: i64,
    pub status: RetryStatus,
    pub date_gmt: DateTime<Utc>,
    /// Snapshot of the rule that produced this retry.
    pub rule: RetryRule,
}

#[derive(Debug, Clone)]
pub struct NewRetry {
    pub order_id: i64,
    pub status: RetryStatus,
    pub date_gmt: DateTime<Utc>,
    pub rule: RetryRule,
}

#[derive(Debug, Clone, Default)]
pub struct RetryQuery {
    pub status: Option<RetryStatus>,
    /// Only retries with a greater id.
    pub after_id: Option<i64>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    async fn create_retry(&self, retry: NewRetry) -> Result<Retry>;

    async fn get_retry(&self, id: i64) -> Result<Option<Retry>>;

    /// Refuses moves out of terminal statuses; returns `false` when refused.
    async fn update_retry_status(&self, id: i64, status: RetryStatus) -> Result<bool>;

    /// Ascending by id.
    async fn get_retries_for_order(&self, order_id: i64) -> Result<Vec<Retry>>;

    /// Ascending by id.
    async fn get_retries(&self, query: RetryQuery) -> Result<Vec<Retry>>;

    async fn delete_retry(&self, id: i64) -> Result<bool>;

    /// Copies a retry from another backend. Importing the same source id twice
    /// is a no-op; returns the id in this store.
    async fn import_retry(&self, retry: &Retry) -> Result<i64>;

    async fn get_retry_count_for_order(&self, order_id: i64) -> Result<usize> {
        Ok(self.get_retries_for_order(order_id).await?.len())
    }

    async fn get_last_retry_for_order(&self, order_id: i64) -> Result<Option<Retry>> {
        Ok(self.get_retries_for_order(order_id).await?.pop())
    }
}
