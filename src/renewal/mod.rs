pub mod early;

use std::sync::Arc;

use crate::engine::EngineState;
use crate::error::Result;
use crate::events::SubscriptionEvent;
use crate::notify::{self, NotificationContext, Recipient};
use crate::order::{NewOrder, Order, OrderStatus};
use crate::relations::RelationType;
use crate::retry::{RetryManager, RetryOutcome};
use crate::scheduler::{ActionArgs, ScheduledHook};
use crate::status::{StatusMachine, TransitionOutcome};
use crate::subscription::{DateType, DateUpdates, Subscription, SubscriptionStatus};

pub use early::{EarlyRenewalOutcome, EarlyRenewalProcessor, EarlyRenewalRequest, Redirect};

/// Dates that move when one billing interval is paid for.
///
/// With a next payment date, it advances by one interval, or is cleared when
/// the advanced date would reach the end date. Without one, a set end date is
/// pushed out by one interval instead.
pub fn get_dates_to_update(subscription: &Subscription) -> Result<DateUpdates> {
    let mut updates = DateUpdates::new();
    let dates = &subscription.dates;
    if let Some(next_payment) = dates.next_payment {
        let next = subscription.add_billing_intervals(next_payment, 1)?;
        if dates.end.is_some_and(|end| next >= end) {
            updates.insert(DateType::NextPayment, None);
        } else {
            updates.insert(DateType::NextPayment, Some(next));
        }
    } else if let Some(end) = dates.end {
        updates.insert(DateType::End, Some(subscription.add_billing_intervals(end, 1)?));
    }
    Ok(updates)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenewalOutcome {
    /// The action was stale: the subscription is no longer due at that time.
    Skipped,
    Paid { order_id: i64 },
    /// Manual subscription; the customer was sent an invoice.
    AwaitingPayment { order_id: i64 },
    Failed {
        order_id: i64,
        /// `None` when retries are disabled.
        retry: Option<RetryOutcome>,
    },
}

pub struct RenewalProcessor {
    state: Arc<EngineState>,
}

impl RenewalProcessor {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Handler for the `payment_due` action.
    pub async fn process_payment_due(
        &self,
        subscription_id: i64,
        due_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<RenewalOutcome> {
        let subscription = self.state.require_subscription(subscription_id).await?;
        if subscription.status != SubscriptionStatus::Active
            || subscription.dates.next_payment != Some(due_at)
        {
            tracing::info!(
                subscription_id,
                status = %subscription.status,
                next_payment = ?subscription.dates.next_payment,
                due_at = %due_at,
                "payment due action is stale, skipping"
            );
            return Ok(RenewalOutcome::Skipped);
        }

        let order = self.create_renewal_order(&subscription).await?;
        StatusMachine::new(self.state.clone())
            .hold_for_renewal(subscription_id)
            .await?;

        if subscription.is_manual() {
            self.notify_held(subscription_id, order.id).await;
            notify::send(
                self.state.notifier.as_ref(),
                "customer_renewal_invoice",
                Recipient::Customer,
                NotificationContext::renewal(subscription_id, order.id),
            )
            .await;
            return Ok(RenewalOutcome::AwaitingPayment { order_id: order.id });
        }

        self.charge_renewal_order(&order).await
    }

    /// Creates a pending renewal order linked to the subscription.
    pub async fn create_renewal_order(&self, subscription: &Subscription) -> Result<Order> {
        let order = self.insert_renewal_order(subscription).await?;
        self.record_renewal_order(subscription.id, &order).await?;
        Ok(order)
    }

    pub(crate) async fn insert_renewal_order(&self, subscription: &Subscription) -> Result<Order> {
        let order = self
            .state
            .orders
            .create_order(NewOrder {
                customer_id: subscription.customer_id,
                status: OrderStatus::Pending,
                total: subscription.total,
                currency: subscription.currency.clone(),
                payment_method: subscription.payment_method.clone(),
                created_at: self.state.clock.now(),
            })
            .await?;
        if let Err(e) = self
            .state
            .relations
            .add_relation(order.id, subscription.id, RelationType::Renewal)
            .await
        {
            tracing::error!(
                subscription_id = subscription.id,
                order_id = order.id,
                "failed to link renewal order: {}",
                e
            );
            self.state.orders.delete_order(order.id).await?;
            return Err(e);
        }
        Ok(order)
    }

    pub(crate) async fn record_renewal_order(&self, subscription_id: i64, order: &Order) -> Result<()> {
        let mut updates = DateUpdates::new();
        updates.insert(DateType::LastOrderDateCreated, Some(self.state.clock.now()));
        self.state.subscriptions.update_dates(subscription_id, &updates).await?;
        tracing::info!(subscription_id, order_id = order.id, "renewal order created");
        self.state.events.emit(SubscriptionEvent::RenewalOrderCreated {
            subscription_id,
            order_id: order.id,
        });
        Ok(())
    }

    async fn charge_renewal_order(&self, order: &Order) -> Result<RenewalOutcome> {
        let charge = self.state.gateways.dispatch_charge(order).await;
        if charge.is_paid() {
            self.complete_renewal_payment(order.id).await?;
            return Ok(RenewalOutcome::Paid { order_id: order.id });
        }

        tracing::info!(order_id = order.id, ?charge, "renewal charge failed");
        self.state
            .orders
            .update_order_status(order.id, OrderStatus::Failed)
            .await?;
        let subscription_ids = self
            .state
            .relations
            .get_related_subscription_ids(order.id, RelationType::Renewal)
            .await?;
        for subscription_id in &subscription_ids {
            self.notify_held(*subscription_id, order.id).await;
        }

        let retries = RetryManager::new(self.state.clone());
        if retries.is_retry_enabled() {
            let retry = retries.handle_failed_renewal(order.id).await?;
            return Ok(RenewalOutcome::Failed {
                order_id: order.id,
                retry: Some(retry),
            });
        }

        for subscription_id in subscription_ids {
            notify::send(
                self.state.notifier.as_ref(),
                "renewal_payment_failed",
                Recipient::Customer,
                NotificationContext::renewal(subscription_id, order.id),
            )
            .await;
        }
        Ok(RenewalOutcome::Failed {
            order_id: order.id,
            retry: None,
        })
    }

    async fn notify_held(&self, subscription_id: i64, order_id: i64) {
        notify::send(
            self.state.notifier.as_ref(),
            "on_hold_subscription",
            Recipient::Admin,
            NotificationContext::renewal(subscription_id, order_id),
        )
        .await;
    }

    /// Records payment of a renewal order and moves every subscription it
    /// renews forward one interval. A second call for the same order does
    /// nothing.
    pub async fn complete_renewal_payment(&self, order_id: i64) -> Result<()> {
        let state = &self.state;
        let order = state.require_order(order_id).await?;
        if order.paid_at.is_some() {
            tracing::debug!(order_id, "renewal payment already recorded");
            return Ok(());
        }
        let now = state.clock.now();
        state
            .orders
            .mark_order_paid(order_id, OrderStatus::Processing, now)
            .await?;

        let machine = StatusMachine::new(state.clone());
        for subscription_id in state
            .relations
            .get_related_subscription_ids(order_id, RelationType::Renewal)
            .await?
        {
            let subscription = state.require_subscription(subscription_id).await?;
            if subscription.status.is_terminal()
                || subscription.status == SubscriptionStatus::PendingCancel
            {
                tracing::warn!(
                    subscription_id,
                    order_id,
                    status = %subscription.status,
                    "renewal paid for a subscription that is ending, dates left alone"
                );
                continue;
            }

            let mut updates = get_dates_to_update(&subscription)?;
            updates.insert(DateType::PaymentRetry, None);
            state.subscriptions.update_dates(subscription_id, &updates).await?;

            if subscription.status == SubscriptionStatus::Active {
                self.schedule_next_renewal(subscription_id).await?;
            } else {
                let outcome = machine
                    .update_status(subscription_id, SubscriptionStatus::Active, true)
                    .await?;
                if !outcome.is_changed() {
                    tracing::warn!(subscription_id, order_id, ?outcome, "could not reactivate after renewal payment");
                }
            }
        }
        tracing::info!(order_id, "renewal payment completed");
        Ok(())
    }

    /// Schedules `payment_due` at the next payment date, or
    /// `subscription_end` when billing has finished.
    pub(crate) async fn schedule_next_renewal(&self, subscription_id: i64) -> Result<()> {
        let subscription = self.state.require_subscription(subscription_id).await?;
        let args = ActionArgs::Subscription { subscription_id };
        let scheduler = &self.state.scheduler;
        match subscription.dates.next_payment {
            Some(next_payment) => {
                scheduler
                    .schedule_at(next_payment, ScheduledHook::PaymentDue, args)
                    .await?;
            }
            None => {
                scheduler.unschedule(ScheduledHook::PaymentDue, args).await?;
            }
        }
        if let Some(end) = subscription.dates.end {
            scheduler
                .schedule_at(end, ScheduledHook::SubscriptionEnd, args)
                .await?;
        }
        Ok(())
    }

    /// Handler for the `subscription_end` action.
    pub async fn process_subscription_end(&self, subscription_id: i64) -> Result<TransitionOutcome> {
        let subscription = self.state.require_subscription(subscription_id).await?;
        let now = self.state.clock.now();
        if subscription.dates.end.is_some_and(|end| end > now) {
            tracing::info!(subscription_id, "end date moved, not expiring yet");
            return Ok(TransitionOutcome::Unchanged);
        }
        StatusMachine::new(self.state.clone())
            .update_status(subscription_id, SubscriptionStatus::Expired, true)
            .await
    }

    /// Handler for the `end_of_prepaid_term` action.
    pub async fn process_end_of_prepaid_term(&self, subscription_id: i64) -> Result<TransitionOutcome> {
        let subscription = self.state.require_subscription(subscription_id).await?;
        if subscription.status != SubscriptionStatus::PendingCancel {
            return Ok(TransitionOutcome::Unchanged);
        }
        StatusMachine::new(self.state.clone())
            .update_status(subscription_id, SubscriptionStatus::Cancelled, true)
            .await
    }
}
