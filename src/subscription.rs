use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubscriptionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    OnHold,
    Cancelled,
    PendingCancel,
    Expired,
    Switched,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::OnHold => "on-hold",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PendingCancel => "pending-cancel",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Switched => "switched",
        }
    }

    /// Accepts the current names plus the legacy aliases still found in old rows.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(SubscriptionStatus::Pending),
            "active" => Some(SubscriptionStatus::Active),
            "on-hold" | "on_hold" | "suspended" => Some(SubscriptionStatus::OnHold),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "pending-cancel" | "pending_cancellation" | "pending-cancellation" => {
                Some(SubscriptionStatus::PendingCancel)
            }
            "expired" => Some(SubscriptionStatus::Expired),
            "switched" => Some(SubscriptionStatus::Switched),
            _ => None,
        }
    }

    /// No transition leaves these statuses.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired
                | SubscriptionStatus::Switched
        )
    }

    /// Statuses in which `next_payment` must stay unset.
    pub fn forbids_next_payment(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired
                | SubscriptionStatus::PendingCancel
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl BillingPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingPeriod::Day => "day",
            BillingPeriod::Week => "week",
            BillingPeriod::Month => "month",
            BillingPeriod::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(BillingPeriod::Day),
            "week" => Some(BillingPeriod::Week),
            "month" => Some(BillingPeriod::Month),
            "year" => Some(BillingPeriod::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateType {
    Start,
    TrialEnd,
    NextPayment,
    End,
    LastOrderDateCreated,
    PaymentRetry,
    Cancelled,
}

impl DateType {
    pub const ALL: [DateType; 7] = [
        DateType::Start,
        DateType::TrialEnd,
        DateType::NextPayment,
        DateType::End,
        DateType::LastOrderDateCreated,
        DateType::PaymentRetry,
        DateType::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DateType::Start => "start",
            DateType::TrialEnd => "trial_end",
            DateType::NextPayment => "next_payment",
            DateType::End => "end",
            DateType::LastOrderDateCreated => "last_order_date_created",
            DateType::PaymentRetry => "payment_retry",
            DateType::Cancelled => "cancelled",
        }
    }

    /// Column holding this date in the `subscriptions` table.
    pub fn column(self) -> &'static str {
        match self {
            DateType::Start => "date_start",
            DateType::TrialEnd => "date_trial_end",
            DateType::NextPayment => "date_next_payment",
            DateType::End => "date_end",
            DateType::LastOrderDateCreated => "date_last_order_created",
            DateType::PaymentRetry => "date_payment_retry",
            DateType::Cancelled => "date_cancelled",
        }
    }
}

/// A batch of date changes; `None` unsets the date.
pub type DateUpdates = BTreeMap<DateType, Option<DateTime<Utc>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDates {
    pub start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub next_payment: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub last_order_date_created: Option<DateTime<Utc>>,
    pub payment_retry: Option<DateTime<Utc>>,
    pub cancelled: Option<DateTime<Utc>>,
}

impl SubscriptionDates {
    pub fn get(&self, date_type: DateType) -> Option<DateTime<Utc>> {
        match date_type {
            DateType::Start => self.start,
            DateType::TrialEnd => self.trial_end,
            DateType::NextPayment => self.next_payment,
            DateType::End => self.end,
            DateType::LastOrderDateCreated => self.last_order_date_created,
            DateType::PaymentRetry => self.payment_retry,
            DateType::Cancelled => self.cancelled,
        }
    }

    pub fn set(&mut self, date_type: DateType, value: Option<DateTime<Utc>>) {
        let slot = match date_type {
            DateType::Start => &mut self.start,
            DateType::TrialEnd => &mut self.trial_end,
            DateType::NextPayment => &mut self.next_payment,
            DateType::End => &mut self.end,
            DateType::LastOrderDateCreated => &mut self.last_order_date_created,
            DateType::PaymentRetry => &mut self.payment_retry,
            DateType::Cancelled => &mut self.cancelled,
        };
        *slot = value;
    }

    pub fn apply(&mut self, updates: &DateUpdates) {
        for (date_type, value) in updates {
            self.set(*date_type, *value);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub customer_id: i64,
    pub status: SubscriptionStatus,
    pub billing_interval: u32,
    pub billing_period: BillingPeriod,
    pub dates: SubscriptionDates,
    /// Empty for manual subscriptions.
    pub payment_method: String,
    pub total: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Facts the status machine needs beyond the subscription row itself.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    /// Admin or system action that may bypass date preconditions.
    pub forced: bool,
    /// The payment method names a registered gateway.
    pub payment_method_valid: bool,
    pub manual_renewals_accepted: bool,
}

impl Subscription {
    pub fn is_manual(&self) -> bool {
        self.payment_method.trim().is_empty()
    }

    pub fn has_status(&self, statuses: &[SubscriptionStatus]) -> bool {
        statuses.contains(&self.status)
    }

    fn can_renew(&self, ctx: &TransitionContext) -> bool {
        if self.is_manual() {
            ctx.manual_renewals_accepted
        } else {
            ctx.payment_method_valid
        }
    }

    pub fn can_be_updated_to(&self, new_status: SubscriptionStatus, ctx: &TransitionContext) -> bool {
        use SubscriptionStatus::*;

        if self.status.is_terminal() || self.status == new_status {
            return false;
        }

        match new_status {
            Cancelled => true,
            Active => match self.status {
                Pending => true,
                OnHold | PendingCancel => self.can_renew(ctx),
                _ => false,
            },
            OnHold => matches!(self.status, Pending | Active),
            PendingCancel => matches!(self.status, Active | OnHold),
            Expired => {
                let end_passed = self.dates.end.is_some_and(|end| end <= ctx.now);
                matches!(self.status, Active | OnHold | PendingCancel) && (end_passed || ctx.forced)
            }
            Switched => self.status == Active,
            Pending => false,
        }
    }

    /// Adds `count` billing intervals to `from`. Months clamp to the last day of the month.
    pub fn add_billing_intervals(&self, from: DateTime<Utc>, count: u32) -> Result<DateTime<Utc>> {
        add_period(from, self.billing_interval, self.billing_period, count)
    }
}

pub fn add_period(
    from: DateTime<Utc>,
    interval: u32,
    period: BillingPeriod,
    count: u32,
) -> Result<DateTime<Utc>> {
    if interval == 0 {
        return Err(SubscriptionError::InvalidArgument(
            "billing interval must be positive".into(),
        ));
    }
    let steps = interval
        .checked_mul(count)
        .ok_or_else(|| SubscriptionError::InvalidArgument("billing interval overflow".into()))?;
    let next = match period {
        BillingPeriod::Day => from.checked_add_signed(Duration::days(i64::from(steps))),
        BillingPeriod::Week => from.checked_add_signed(Duration::weeks(i64::from(steps))),
        BillingPeriod::Month => from.checked_add_months(Months::new(steps)),
        BillingPeriod::Year => steps
            .checked_mul(12)
            .and_then(|months| from.checked_add_months(Months::new(months))),
    };
    next.ok_or_else(|| SubscriptionError::InvalidArgument("date out of range".into()))
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: i64,
    pub status: SubscriptionStatus,
    pub billing_interval: u32,
    pub billing_period: BillingPeriod,
    pub dates: SubscriptionDates,
    pub payment_method: String,
    pub total: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodChange {
    pub payment_method: String,
    /// Gateway metadata (tokens, customer references) written with the method.
    pub meta: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethodChangeOutcome {
    Applied,
    RevertedToManual,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create_subscription(&self, payload: NewSubscription) -> Result<Subscription>;

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>>;

    /// Compare-and-set: succeeds only while the stored status still equals
    /// `expected`. `dates` are written in the same transaction.
    async fn update_status(
        &self,
        id: i64,
        expected: SubscriptionStatus,
        new_status: SubscriptionStatus,
        dates: &DateUpdates,
    ) -> Result<bool>;

    /// Applies every entry in one transaction.
    async fn update_dates(&self, id: i64, updates: &DateUpdates) -> Result<()>;

    /// Writes the method and its metadata atomically; any failure leaves the
    /// subscription manual.
    async fn apply_payment_method_change(
        &self,
        id: i64,
        change: &PaymentMethodChange,
    ) -> Result<PaymentMethodChangeOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn subscription(status: SubscriptionStatus, payment_method: &str) -> Subscription {
        Subscription {
            id: 1,
            customer_id: 7,
            status,
            billing_interval: 1,
            billing_period: BillingPeriod::Month,
            dates: SubscriptionDates::default(),
            payment_method: payment_method.to_string(),
            total: Decimal::new(1000, 2),
            currency: "USD".into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn ctx(payment_method_valid: bool, manual_renewals_accepted: bool) -> TransitionContext {
        TransitionContext {
            now: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            forced: false,
            payment_method_valid,
            manual_renewals_accepted,
        }
    }

    #[test]
    fn legacy_status_aliases_parse() {
        assert_eq!(SubscriptionStatus::parse("suspended"), Some(SubscriptionStatus::OnHold));
        assert_eq!(
            SubscriptionStatus::parse("pending_cancellation"),
            Some(SubscriptionStatus::PendingCancel)
        );
        assert_eq!(SubscriptionStatus::parse("trash"), None);
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        let c = ctx(true, true);
        for from in [
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Switched,
        ] {
            let sub = subscription(from, "stripe");
            for to in [
                SubscriptionStatus::Active,
                SubscriptionStatus::OnHold,
                SubscriptionStatus::Cancelled,
                SubscriptionStatus::PendingCancel,
                SubscriptionStatus::Pending,
            ] {
                assert!(!sub.can_be_updated_to(to, &c), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn cancel_is_always_legal_from_live_statuses() {
        let c = ctx(false, false);
        for from in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Active,
            SubscriptionStatus::OnHold,
            SubscriptionStatus::PendingCancel,
        ] {
            assert!(subscription(from, "").can_be_updated_to(SubscriptionStatus::Cancelled, &c));
        }
    }

    #[test]
    fn reactivation_needs_payment_method_or_manual_acceptance() {
        let on_hold = subscription(SubscriptionStatus::OnHold, "stripe");
        assert!(on_hold.can_be_updated_to(SubscriptionStatus::Active, &ctx(true, false)));
        assert!(!on_hold.can_be_updated_to(SubscriptionStatus::Active, &ctx(false, true)));

        let manual = subscription(SubscriptionStatus::OnHold, "");
        assert!(manual.can_be_updated_to(SubscriptionStatus::Active, &ctx(false, true)));
        assert!(!manual.can_be_updated_to(SubscriptionStatus::Active, &ctx(false, false)));
    }

    #[test]
    fn expiry_requires_past_end_or_force() {
        let mut sub = subscription(SubscriptionStatus::Active, "stripe");
        let mut c = ctx(true, true);
        assert!(!sub.can_be_updated_to(SubscriptionStatus::Expired, &c));

        sub.dates.end = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert!(sub.can_be_updated_to(SubscriptionStatus::Expired, &c));

        sub.dates.end = Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        assert!(!sub.can_be_updated_to(SubscriptionStatus::Expired, &c));
        c.forced = true;
        assert!(sub.can_be_updated_to(SubscriptionStatus::Expired, &c));
    }

    #[test]
    fn month_addition_clamps_to_month_end() {
        let jan31 = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let next = add_period(jan31, 1, BillingPeriod::Month, 1).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());

        let yearly = add_period(jan31, 2, BillingPeriod::Year, 1).unwrap();
        assert_eq!(yearly, Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            add_period(now, 0, BillingPeriod::Day, 1),
            Err(SubscriptionError::InvalidArgument(_))
        ));
    }
}
