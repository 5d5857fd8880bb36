use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Entry points the scheduler may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledHook {
    PaymentDue,
    PaymentRetry,
    SubscriptionEnd,
    EndOfPrepaidTerm,
}

impl ScheduledHook {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduledHook::PaymentDue => "payment_due",
            ScheduledHook::PaymentRetry => "payment_retry",
            ScheduledHook::SubscriptionEnd => "subscription_end",
            ScheduledHook::EndOfPrepaidTerm => "end_of_prepaid_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_due" => Some(ScheduledHook::PaymentDue),
            "payment_retry" => Some(ScheduledHook::PaymentRetry),
            "subscription_end" => Some(ScheduledHook::SubscriptionEnd),
            "end_of_prepaid_term" => Some(ScheduledHook::EndOfPrepaidTerm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionArgs {
    Subscription { subscription_id: i64 },
    Order { order_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Complete,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Complete => "complete",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "complete" => Some(ActionStatus::Complete),
            "failed" => Some(ActionStatus::Failed),
            "cancelled" => Some(ActionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub id: i64,
    pub hook: ScheduledHook,
    pub args: ActionArgs,
    pub scheduled_at: DateTime<Utc>,
    pub status: ActionStatus,
}

/// At-least-once job queue. Handlers must tolerate duplicate delivery.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Replaces any pending action with the same hook and args.
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        hook: ScheduledHook,
        args: ActionArgs,
    ) -> Result<i64>;

    /// Cancels pending actions for the hook and args; returns how many.
    async fn unschedule(&self, hook: ScheduledHook, args: ActionArgs) -> Result<u64>;

    async fn next_scheduled(
        &self,
        hook: ScheduledHook,
        args: ActionArgs,
    ) -> Result<Option<ScheduledAction>>;

    /// Pending actions due at or before `now`, oldest first.
    async fn due_actions(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledAction>>;

    async fn mark_complete(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, message: &str) -> Result<()>;
}
