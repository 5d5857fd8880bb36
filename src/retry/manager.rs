use std::sync::Arc;

use crate::engine::EngineState;
use crate::error::{Result, SubscriptionError};
use crate::events::SubscriptionEvent;
use crate::gateways::{Capability, CapabilityCache};
use crate::notify::{self, NotificationContext, Recipient};
use crate::order::OrderStatus;
use crate::relations::RelationType;
use crate::renewal::RenewalProcessor;
use crate::retry::{NewRetry, Retry, RetryStatus, RetryStore};
use crate::scheduler::{ActionArgs, ScheduledHook};
use crate::status::StatusMachine;
use crate::subscription::{
    DateType, DateUpdates, PaymentMethodChange, PaymentMethodChangeOutcome, SubscriptionStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// A new pending retry was persisted and scheduled.
    Scheduled(Retry),
    /// The rule table or attempt ceiling is exhausted; the subscription keeps
    /// its failure status.
    Exhausted,
    /// The retried charge went through and the renewal was completed.
    Paid,
    /// The pending retry was no longer needed and has been cancelled.
    Cancelled,
    /// Nothing pending for the order.
    Skipped,
}

/// Drives the failed-renewal retry schedule.
pub struct RetryManager {
    state: Arc<EngineState>,
}

impl RetryManager {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    pub fn is_retry_enabled(&self) -> bool {
        self.state.settings.retry.enabled
    }

    pub fn store(&self) -> Arc<dyn RetryStore> {
        self.state.retries.clone()
    }

    pub async fn handle_failed_renewal(&self, order_id: i64) -> Result<RetryOutcome> {
        let state = &self.state;
        let store = self.store();
        let order = state.require_order(order_id).await?;
        let subscription_ids = self.renewed_subscription_ids(order_id).await?;
        let Some(&primary) = subscription_ids.first() else {
            return Err(SubscriptionError::InvalidArgument(format!(
                "order {order_id} does not renew any subscription"
            )));
        };
        let subscription = state.require_subscription(primary).await?;

        let attempt = i64::try_from(store.get_retry_count_for_order(order_id).await?)
            .unwrap_or(i64::MAX)
            .saturating_add(1);
        let rule = state.retry_rules.get_rule(attempt, &subscription, &order)?;
        if !state.retry_rules.has_rule(attempt) {
            tracing::debug!(order_id, attempt, "past the rule table, reusing the last rule");
        }

        if attempt > i64::from(state.settings.retry.max_attempts) || rule.give_up {
            tracing::info!(order_id, attempt, "payment retries exhausted");
            for id in &subscription_ids {
                let mut updates = DateUpdates::new();
                updates.insert(DateType::PaymentRetry, None);
                state.subscriptions.update_dates(*id, &updates).await?;
            }
            for recipient in [Recipient::Customer, Recipient::Admin] {
                notify::send(
                    state.notifier.as_ref(),
                    "payment_retry_exhausted",
                    recipient,
                    NotificationContext::renewal(primary, order_id),
                )
                .await;
            }
            let last = store.get_last_retry_for_order(order_id).await?;
            state.events.emit(SubscriptionEvent::RetryExhausted {
                order_id,
                retry: last,
            });
            return Ok(RetryOutcome::Exhausted);
        }

        let retry_at = rule.delay.after(state.clock.now())?;
        let retry = store
            .create_retry(NewRetry {
                order_id,
                status: RetryStatus::Pending,
                date_gmt: retry_at,
                rule: rule.clone(),
            })
            .await
            .map_err(|e| {
                tracing::error!(order_id, attempt, "failed to persist retry: {}", e);
                e
            })?;

        // Nothing outside the retry row is written until the action is scheduled.
        if let Err(e) = state
            .scheduler
            .schedule_at(
                retry.date_gmt,
                ScheduledHook::PaymentRetry,
                ActionArgs::Order { order_id },
            )
            .await
        {
            tracing::error!(order_id, retry_id = retry.id, "failed to schedule retry: {}", e);
            store.update_retry_status(retry.id, RetryStatus::Cancelled).await?;
            return Err(e);
        }

        state.orders.update_order_status(order_id, rule.order_status).await?;
        let machine = StatusMachine::new(state.clone());
        for id in &subscription_ids {
            let outcome = machine
                .update_status(*id, rule.subscription_status, true)
                .await?;
            tracing::debug!(subscription_id = *id, ?outcome, "applied retry rule status");
            let mut updates = DateUpdates::new();
            updates.insert(DateType::PaymentRetry, Some(retry.date_gmt));
            state.subscriptions.update_dates(*id, &updates).await?;
        }

        for (recipient, template) in rule.notifications() {
            notify::send(
                state.notifier.as_ref(),
                template,
                recipient,
                NotificationContext {
                    subscription_id: Some(primary),
                    order_id: Some(order_id),
                    retry_id: Some(retry.id),
                },
            )
            .await;
        }

        tracing::info!(
            order_id,
            retry_id = retry.id,
            attempt,
            at = %retry.date_gmt,
            "payment retry scheduled"
        );
        state.events.emit(SubscriptionEvent::RetryScheduled {
            order_id,
            retry: retry.clone(),
        });
        Ok(RetryOutcome::Scheduled(retry))
    }

    /// Handler for the `payment_retry` action. Safe to run more than once.
    pub async fn process_retry(&self, order_id: i64) -> Result<RetryOutcome> {
        let state = &self.state;
        let store = self.store();
        let Some(retry) = store.get_last_retry_for_order(order_id).await? else {
            tracing::debug!(order_id, "no retry recorded for order");
            return Ok(RetryOutcome::Skipped);
        };
        if retry.status != RetryStatus::Pending {
            tracing::debug!(order_id, retry_id = retry.id, status = retry.status.as_str(), "retry not pending");
            return Ok(RetryOutcome::Skipped);
        }

        let order = state.require_order(order_id).await?;
        let subscription_ids = self.renewed_subscription_ids(order_id).await?;
        let mut blocked = subscription_ids.is_empty();
        for id in &subscription_ids {
            let subscription = state.require_subscription(*id).await?;
            if subscription.has_status(&[
                SubscriptionStatus::Cancelled,
                SubscriptionStatus::Expired,
                SubscriptionStatus::PendingCancel,
            ]) {
                blocked = true;
            }
        }

        if blocked || !order.needs_payment() {
            store.update_retry_status(retry.id, RetryStatus::Cancelled).await?;
            for id in &subscription_ids {
                let mut updates = DateUpdates::new();
                updates.insert(DateType::PaymentRetry, None);
                state.subscriptions.update_dates(*id, &updates).await?;
            }
            tracing::info!(order_id, retry_id = retry.id, "retry no longer needed, cancelled");
            return Ok(RetryOutcome::Cancelled);
        }

        if !store.update_retry_status(retry.id, RetryStatus::Processing).await? {
            return Ok(RetryOutcome::Skipped);
        }

        let charge = state.gateways.dispatch_charge(&order).await;
        if charge.is_paid() {
            store.update_retry_status(retry.id, RetryStatus::Complete).await?;
            RenewalProcessor::new(state.clone())
                .complete_renewal_payment(order_id)
                .await?;
            tracing::info!(order_id, retry_id = retry.id, "retry charge succeeded");
            return Ok(RetryOutcome::Paid);
        }

        tracing::info!(order_id, retry_id = retry.id, ?charge, "retry charge failed");
        store.update_retry_status(retry.id, RetryStatus::Failed).await?;
        state.orders.update_order_status(order_id, OrderStatus::Failed).await?;
        self.handle_failed_renewal(order_id).await
    }

    /// Cancels every pending retry of the order and its scheduled action.
    pub async fn cancel_pending_retries(&self, order_id: i64) -> Result<u64> {
        let store = self.store();
        let mut cancelled = 0;
        for retry in store.get_retries_for_order(order_id).await? {
            if retry.status == RetryStatus::Pending
                && store.update_retry_status(retry.id, RetryStatus::Cancelled).await?
            {
                cancelled += 1;
            }
        }
        self.state
            .scheduler
            .unschedule(ScheduledHook::PaymentRetry, ActionArgs::Order { order_id })
            .await?;
        if cancelled > 0 {
            tracing::info!(order_id, cancelled, "cancelled pending retries");
        }
        Ok(cancelled)
    }

    /// Cancels the retries of the subscription's latest renewal order.
    pub async fn cancel_retries_for_subscription(&self, subscription_id: i64) -> Result<u64> {
        let last = self
            .state
            .relations
            .get_last_related_order_id(subscription_id, RelationType::Renewal)
            .await?;
        match last {
            Some(order_id) => self.cancel_pending_retries(order_id).await,
            None => Ok(0),
        }
    }

    /// Moves every subscription renewed by the order onto a new payment
    /// method, typically after the customer paid a failed renewal with it.
    pub async fn apply_payment_method_change(
        &self,
        order_id: i64,
        change: &PaymentMethodChange,
    ) -> Result<Vec<(i64, PaymentMethodChangeOutcome)>> {
        let state = &self.state;
        if !change.payment_method.trim().is_empty()
            && !state.gateways.is_valid_payment_method(&change.payment_method)
        {
            return Err(SubscriptionError::InvalidArgument(format!(
                "unknown payment method {}",
                change.payment_method
            )));
        }

        let subscription_ids = self.renewed_subscription_ids(order_id).await?;
        let mut cache = CapabilityCache::new();
        if subscription_ids.len() > 1
            && !change.payment_method.trim().is_empty()
            && !state.gateways.gateway_supports(
                &change.payment_method,
                Capability::MultiplePaymentMethodChange,
                &mut cache,
            )
        {
            return Err(SubscriptionError::InvalidArgument(format!(
                "{} cannot update {} subscriptions at once",
                change.payment_method,
                subscription_ids.len()
            )));
        }

        let mut outcomes = Vec::new();
        for id in subscription_ids {
            let outcome = state.subscriptions.apply_payment_method_change(id, change).await?;
            if outcome == PaymentMethodChangeOutcome::Applied {
                let subscription = state.require_subscription(id).await?;
                state.gateways.dispatch_payment_method_changed(&subscription).await;
            } else {
                tracing::warn!(subscription_id = id, order_id, "payment method change reverted to manual");
            }
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    async fn renewed_subscription_ids(&self, order_id: i64) -> Result<Vec<i64>> {
        self.state
            .relations
            .get_related_subscription_ids(order_id, RelationType::Renewal)
            .await
    }
}
