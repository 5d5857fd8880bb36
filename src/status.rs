use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engine::EngineState;
use crate::error::{Result, SubscriptionError};
use crate::events::SubscriptionEvent;
use crate::notify::{self, NotificationContext, Recipient};
use crate::retry::RetryManager;
use crate::scheduler::{ActionArgs, ScheduledHook};
use crate::subscription::{DateType, DateUpdates, Subscription, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Changed {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Already in the requested status.
    Unchanged,
    /// Illegal from the current status, or the stored status moved between
    /// read and write. Nothing was written.
    Rejected {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
}

impl TransitionOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, TransitionOutcome::Changed { .. })
    }

    /// For callers that treat a rejection as an error.
    pub fn into_result(self) -> Result<Self> {
        match self {
            TransitionOutcome::Rejected { from, to } => {
                Err(SubscriptionError::InvalidStatusTransition { from, to })
            }
            other => Ok(other),
        }
    }
}

/// Applies status transitions and their side effects. Callers hold the
/// subscription lock.
pub struct StatusMachine {
    state: Arc<EngineState>,
}

impl StatusMachine {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    pub async fn update_status(
        &self,
        subscription_id: i64,
        new_status: SubscriptionStatus,
        forced: bool,
    ) -> Result<TransitionOutcome> {
        self.transition(subscription_id, new_status, forced, true).await
    }

    /// Puts an active subscription on hold while its renewal order is being
    /// paid. The admin on-hold notice is left to the caller, which only sends
    /// it when the renewal stays unpaid.
    pub async fn hold_for_renewal(&self, subscription_id: i64) -> Result<TransitionOutcome> {
        self.transition(subscription_id, SubscriptionStatus::OnHold, true, false)
            .await
    }

    async fn transition(
        &self,
        subscription_id: i64,
        new_status: SubscriptionStatus,
        forced: bool,
        notify_admin: bool,
    ) -> Result<TransitionOutcome> {
        let subscription = self.state.require_subscription(subscription_id).await?;
        let old_status = subscription.status;
        if old_status == new_status {
            return Ok(TransitionOutcome::Unchanged);
        }

        let ctx = self.state.transition_context(&subscription, forced);
        if !subscription.can_be_updated_to(new_status, &ctx) {
            tracing::info!(
                subscription_id,
                from = %old_status,
                to = %new_status,
                forced,
                "status transition rejected"
            );
            return Ok(TransitionOutcome::Rejected {
                from: old_status,
                to: new_status,
            });
        }

        let dates = transition_dates(&subscription, new_status, ctx.now);
        let written = self
            .state
            .subscriptions
            .update_status(subscription_id, old_status, new_status, &dates)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id,
                    from = %old_status,
                    to = %new_status,
                    "failed to persist status change: {}",
                    e
                );
                e
            })?;
        if !written {
            tracing::warn!(
                subscription_id,
                from = %old_status,
                to = %new_status,
                "status changed concurrently, transition dropped"
            );
            return Ok(TransitionOutcome::Rejected {
                from: old_status,
                to: new_status,
            });
        }

        tracing::info!(subscription_id, from = %old_status, to = %new_status, "subscription status changed");

        let updated = self.state.require_subscription(subscription_id).await?;
        self.reschedule(&updated).await?;

        let clears_retries = match new_status {
            SubscriptionStatus::Active => matches!(
                old_status,
                SubscriptionStatus::OnHold | SubscriptionStatus::PendingCancel
            ),
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => true,
            _ => false,
        };
        if clears_retries {
            RetryManager::new(self.state.clone())
                .cancel_retries_for_subscription(subscription_id)
                .await?;
        }

        self.state
            .gateways
            .dispatch_status_changed(&updated, old_status, new_status)
            .await;
        self.state.events.emit(SubscriptionEvent::StatusChanged {
            subscription_id,
            old_status,
            new_status,
        });

        let template = match new_status {
            SubscriptionStatus::Cancelled => Some("cancelled_subscription"),
            SubscriptionStatus::Expired => Some("expired_subscription"),
            SubscriptionStatus::OnHold => Some("on_hold_subscription"),
            _ => None,
        };
        if let Some(template) = template.filter(|_| notify_admin) {
            notify::send(
                self.state.notifier.as_ref(),
                template,
                Recipient::Admin,
                NotificationContext::subscription(subscription_id),
            )
            .await;
        }

        Ok(TransitionOutcome::Changed {
            from: old_status,
            to: new_status,
        })
    }

    async fn reschedule(&self, subscription: &Subscription) -> Result<()> {
        let scheduler = &self.state.scheduler;
        let args = ActionArgs::Subscription {
            subscription_id: subscription.id,
        };
        match subscription.status {
            SubscriptionStatus::Active => {
                if let Some(next_payment) = subscription.dates.next_payment {
                    scheduler
                        .schedule_at(next_payment, ScheduledHook::PaymentDue, args)
                        .await?;
                }
                if let Some(end) = subscription.dates.end {
                    scheduler
                        .schedule_at(end, ScheduledHook::SubscriptionEnd, args)
                        .await?;
                }
                scheduler
                    .unschedule(ScheduledHook::EndOfPrepaidTerm, args)
                    .await?;
            }
            SubscriptionStatus::OnHold => {
                scheduler.unschedule(ScheduledHook::PaymentDue, args).await?;
            }
            SubscriptionStatus::PendingCancel => {
                scheduler
                    .unschedule(ScheduledHook::PaymentDue, args)
                    .await?;
                scheduler
                    .unschedule(ScheduledHook::SubscriptionEnd, args)
                    .await?;
                if let Some(end) = subscription.dates.end {
                    scheduler
                        .schedule_at(end, ScheduledHook::EndOfPrepaidTerm, args)
                        .await?;
                }
            }
            SubscriptionStatus::Cancelled
            | SubscriptionStatus::Expired
            | SubscriptionStatus::Switched => {
                for hook in [
                    ScheduledHook::PaymentDue,
                    ScheduledHook::SubscriptionEnd,
                    ScheduledHook::EndOfPrepaidTerm,
                ] {
                    scheduler.unschedule(hook, args).await?;
                }
            }
            SubscriptionStatus::Pending => {}
        }
        Ok(())
    }
}

/// Date changes written together with a status change.
fn transition_dates(
    subscription: &Subscription,
    new_status: SubscriptionStatus,
    now: DateTime<Utc>,
) -> DateUpdates {
    let dates = &subscription.dates;
    let mut updates = DateUpdates::new();
    match new_status {
        SubscriptionStatus::Cancelled => {
            updates.insert(DateType::NextPayment, None);
            updates.insert(DateType::PaymentRetry, None);
            updates.insert(DateType::Cancelled, Some(now));
            let keep_end = subscription.status == SubscriptionStatus::PendingCancel
                && dates.end.is_some_and(|end| end <= now);
            if !keep_end && dates.end.is_none_or(|end| end > now) {
                updates.insert(DateType::End, Some(now));
            }
        }
        SubscriptionStatus::Expired => {
            updates.insert(DateType::NextPayment, None);
            updates.insert(DateType::PaymentRetry, None);
            if dates.end.is_none() {
                updates.insert(DateType::End, Some(now));
            }
        }
        SubscriptionStatus::PendingCancel => {
            // Access runs until the period already paid for ends.
            let end = dates.next_payment.filter(|next| *next > now).unwrap_or(now);
            updates.insert(DateType::End, Some(end));
            updates.insert(DateType::NextPayment, None);
            updates.insert(DateType::Cancelled, Some(now));
        }
        SubscriptionStatus::Switched => {
            updates.insert(DateType::NextPayment, None);
        }
        SubscriptionStatus::Active => {
            if dates.payment_retry.is_some() {
                updates.insert(DateType::PaymentRetry, None);
            }
            if subscription.status == SubscriptionStatus::PendingCancel {
                if let Some(end) = dates.end.filter(|end| *end > now) {
                    updates.insert(DateType::NextPayment, Some(end));
                    updates.insert(DateType::End, None);
                }
                updates.insert(DateType::Cancelled, None);
            }
        }
        SubscriptionStatus::OnHold | SubscriptionStatus::Pending => {}
    }
    updates
}
