use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::{Result, SubscriptionError};
use crate::notify::Recipient;
use crate::order::{Order, OrderStatus};
use crate::subscription::{Subscription, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDelay {
    pub amount: u32,
    pub unit: DelayUnit,
}

impl RetryDelay {
    pub const fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Hours,
        }
    }

    pub const fn days(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Days,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        let amount = i64::from(self.amount);
        match self.unit {
            DelayUnit::Minutes => Duration::try_minutes(amount),
            DelayUnit::Hours => Duration::try_hours(amount),
            DelayUnit::Days => Duration::try_days(amount),
            DelayUnit::Weeks => Duration::try_weeks(amount),
        }
    }

    pub fn after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.as_duration()
            .and_then(|delay| from.checked_add_signed(delay))
            .ok_or_else(|| {
                SubscriptionError::InvalidArgument(format!(
                    "retry delay of {} {:?} is out of range",
                    self.amount, self.unit
                ))
            })
    }
}

/// Longest delay a configured rule may ask for.
pub const MAX_RETRY_DELAY_DAYS: i64 = 366;

fn default_subscription_status() -> SubscriptionStatus {
    SubscriptionStatus::OnHold
}

fn default_order_status() -> OrderStatus {
    OrderStatus::Pending
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRule {
    pub delay: RetryDelay,
    /// Subscription status while the retry waits.
    #[serde(default = "default_subscription_status")]
    pub subscription_status: SubscriptionStatus,
    /// Order status while the retry waits.
    #[serde(default = "default_order_status")]
    pub order_status: OrderStatus,
    #[serde(default)]
    pub customer_template: Option<String>,
    #[serde(default)]
    pub admin_template: Option<String>,
    /// Marks the end of the schedule: reaching this rule means no further retry.
    #[serde(default)]
    pub give_up: bool,
}

impl RetryRule {
    pub fn new(delay: RetryDelay) -> Self {
        Self {
            delay,
            subscription_status: default_subscription_status(),
            order_status: default_order_status(),
            customer_template: None,
            admin_template: None,
            give_up: false,
        }
    }

    pub fn with_customer_template(mut self, template: &str) -> Self {
        self.customer_template = Some(template.to_string());
        self
    }

    pub fn with_admin_template(mut self, template: &str) -> Self {
        self.admin_template = Some(template.to_string());
        self
    }

    pub fn notifications(&self) -> Vec<(Recipient, &str)> {
        let mut out = Vec::new();
        if let Some(t) = self.customer_template.as_deref() {
            out.push((Recipient::Customer, t));
        }
        if let Some(t) = self.admin_template.as_deref() {
            out.push((Recipient::Admin, t));
        }
        out
    }
}

/// Ordered rule table indexed by attempt number (1-based).
#[derive(Debug, Clone)]
pub struct RetryRules {
    rules: Vec<RetryRule>,
}

impl Default for RetryRules {
    /// Five attempts spread over seven days.
    fn default() -> Self {
        Self {
            rules: vec![
                RetryRule::new(RetryDelay::hours(12)).with_admin_template("payment_retry"),
                RetryRule::new(RetryDelay::hours(12))
                    .with_customer_template("customer_payment_retry")
                    .with_admin_template("payment_retry"),
                RetryRule::new(RetryDelay::days(1)).with_admin_template("payment_retry"),
                RetryRule::new(RetryDelay::days(2))
                    .with_customer_template("customer_payment_retry")
                    .with_admin_template("payment_retry"),
                RetryRule::new(RetryDelay::days(3))
                    .with_customer_template("customer_payment_retry")
                    .with_admin_template("payment_retry"),
            ],
        }
    }
}

impl RetryRules {
    pub fn new(rules: Vec<RetryRule>) -> Result<Self> {
        if rules.is_empty() {
            return Err(SubscriptionError::InvalidArgument(
                "retry rule table must not be empty".into(),
            ));
        }
        let max = Duration::days(MAX_RETRY_DELAY_DAYS);
        for (i, rule) in rules.iter().enumerate() {
            if !rule.delay.as_duration().is_some_and(|d| d <= max) {
                return Err(SubscriptionError::InvalidArgument(format!(
                    "retry rule {} delay exceeds {} days",
                    i + 1,
                    MAX_RETRY_DELAY_DAYS
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        if config.rules.is_empty() {
            Ok(Self::default())
        } else {
            Self::new(config.rules.clone())
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn has_rule(&self, retry_count: i64) -> bool {
        retry_count >= 1 && (retry_count as u64) <= self.rules.len() as u64
    }

    /// Counts past the end of the table reuse the last rule.
    pub fn get_rule(
        &self,
        retry_count: i64,
        subscription: &Subscription,
        order: &Order,
    ) -> Result<RetryRule> {
        if retry_count <= 0 {
            return Err(SubscriptionError::InvalidArgument(format!(
                "retry count must be positive, got {retry_count}"
            )));
        }
        let index = usize::try_from(retry_count - 1)
            .unwrap_or(usize::MAX)
            .min(self.rules.len() - 1);
        tracing::debug!(
            subscription_id = subscription.id,
            order_id = order.id,
            retry_count,
            rule_index = index,
            "resolved retry rule"
        );
        Ok(self.rules[index].clone())
    }
}
