use std::sync::Arc;

use chrono::Duration;

use crate::early_renewal_tokens::{EarlyRenewalTokenRecord, hash_token, issue_token};
use crate::engine::EngineState;
use crate::error::{Result, SubscriptionError};
use crate::gateways::Capability;
use crate::notify::{self, NotificationContext, Recipient};
use crate::order::OrderStatus;
use crate::renewal::{RenewalProcessor, get_dates_to_update};
use crate::subscription::{Subscription, SubscriptionStatus};

/// A customer asking to pay for the next period now.
#[derive(Debug, Clone)]
pub struct EarlyRenewalRequest {
    pub subscription_id: i64,
    pub customer_id: i64,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Account,
    Subscription { subscription_id: i64 },
    /// Pay for the renewal through the regular checkout.
    Checkout { subscription_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EarlyRenewalOutcome {
    Rejected { notice: String, redirect: Redirect },
    Renewed { order_id: i64, redirect: Redirect },
    PaymentRequired { notice: String, redirect: Redirect },
}

fn rejected(notice: &str) -> EarlyRenewalOutcome {
    EarlyRenewalOutcome::Rejected {
        notice: notice.to_string(),
        redirect: Redirect::Account,
    }
}

pub struct EarlyRenewalProcessor {
    state: Arc<EngineState>,
}

impl EarlyRenewalProcessor {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Issues a one-time token for the renewal link. Only its hash is stored.
    pub async fn issue_token(&self, subscription_id: i64, customer_id: i64) -> Result<String> {
        let subscription = self.state.require_subscription(subscription_id).await?;
        if subscription.customer_id != customer_id {
            return Err(SubscriptionError::InvalidArgument(format!(
                "subscription {subscription_id} does not belong to customer {customer_id}"
            )));
        }
        let token = issue_token();
        let now = self.state.clock.now();
        self.state
            .tokens
            .create_token(EarlyRenewalTokenRecord {
                token_hash: hash_token(&token),
                subscription_id,
                customer_id,
                created_at: now,
                expires_at: now + Duration::seconds(self.state.settings.early_renewal.token_ttl_secs),
            })
            .await?;
        Ok(token)
    }

    /// Why the subscription cannot be renewed early, if it cannot.
    pub fn ineligibility(&self, subscription: &Subscription) -> Option<&'static str> {
        if subscription.is_manual() {
            return Some("Subscriptions paid manually cannot be renewed early.");
        }
        if subscription.status != SubscriptionStatus::Active {
            return Some("Only active subscriptions can be renewed early.");
        }
        let now = self.state.clock.now();
        if !subscription.dates.next_payment.is_some_and(|next| next > now) {
            return Some("This subscription has no upcoming payment to bring forward.");
        }
        if !self
            .state
            .gateways
            .supports(subscription, Capability::SubscriptionDateChanges)
        {
            return Some("The payment method on this subscription does not support early renewal.");
        }
        None
    }

    pub async fn handle_request(&self, request: EarlyRenewalRequest) -> Result<EarlyRenewalOutcome> {
        let state = &self.state;
        if !state.settings.early_renewal.enabled {
            return Ok(rejected("Early renewal is not available."));
        }
        let Some(token) = request.token.as_deref() else {
            return Ok(rejected("That renewal link is invalid or has expired."));
        };
        let now = state.clock.now();
        let valid = state
            .tokens
            .consume_token(&hash_token(token), request.subscription_id, request.customer_id, now)
            .await?;
        if !valid {
            tracing::info!(
                subscription_id = request.subscription_id,
                customer_id = request.customer_id,
                "early renewal token rejected"
            );
            return Ok(rejected("That renewal link is invalid or has expired."));
        }

        let Some(subscription) = state.subscriptions.get_subscription(request.subscription_id).await?
        else {
            return Ok(rejected("That subscription could not be found."));
        };
        if subscription.customer_id != request.customer_id {
            return Ok(rejected("That subscription could not be found."));
        }
        if let Some(reason) = self.ineligibility(&subscription) {
            tracing::info!(subscription_id = subscription.id, reason, "early renewal refused");
            return Ok(rejected(reason));
        }

        let renewals = RenewalProcessor::new(state.clone());
        let order = renewals.insert_renewal_order(&subscription).await?;
        let charge = state.gateways.dispatch_charge(&order).await;

        if !charge.is_paid() {
            tracing::info!(subscription_id = subscription.id, order_id = order.id, ?charge, "early renewal charge failed");
            state.relations.delete_all_relations(order.id).await?;
            state.orders.delete_order(order.id).await?;
            return Ok(EarlyRenewalOutcome::PaymentRequired {
                notice: "We couldn't charge your saved payment method. Please complete the renewal at checkout."
                    .to_string(),
                redirect: Redirect::Checkout {
                    subscription_id: subscription.id,
                },
            });
        }

        state
            .orders
            .mark_order_paid(order.id, OrderStatus::Processing, now)
            .await?;
        renewals.record_renewal_order(subscription.id, &order).await?;
        let updates = get_dates_to_update(&subscription)?;
        state.subscriptions.update_dates(subscription.id, &updates).await?;
        renewals.schedule_next_renewal(subscription.id).await?;

        notify::send(
            state.notifier.as_ref(),
            "early_renewal_complete",
            Recipient::Customer,
            NotificationContext::renewal(subscription.id, order.id),
        )
        .await;
        tracing::info!(subscription_id = subscription.id, order_id = order.id, "subscription renewed early");
        Ok(EarlyRenewalOutcome::Renewed {
            order_id: order.id,
            redirect: Redirect::Subscription {
                subscription_id: subscription.id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::{RelatedOrderStore, RelationType};
    use crate::scheduler::{ActionArgs, ScheduledHook, Scheduler};
    use crate::subscription::SubscriptionStore;
    use crate::testing::{TestEngine, new_subscription};
    use chrono::{TimeZone, Utc};

    async fn request_for(t: &TestEngine, sub: &Subscription) -> EarlyRenewalRequest {
        let processor = EarlyRenewalProcessor::new(t.engine.state().clone());
        let token = processor.issue_token(sub.id, sub.customer_id).await.unwrap();
        EarlyRenewalRequest {
            subscription_id: sub.id,
            customer_id: sub.customer_id,
            token: Some(token),
        }
    }

    #[tokio::test]
    async fn manual_subscriptions_are_rejected_without_an_order() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("")).await;
        let request = request_for(&t, &sub).await;

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            EarlyRenewalOutcome::Rejected {
                redirect: Redirect::Account,
                ..
            }
        ));
        assert!(t.db.get_related_order_ids(sub.id, RelationType::Renewal).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn declined_charge_discards_the_order_and_keeps_dates() {
        let t = TestEngine::new().await;
        t.gateway.set_failing(true);
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let request = request_for(&t, &sub).await;

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            EarlyRenewalOutcome::PaymentRequired {
                redirect: Redirect::Checkout { subscription_id },
                ..
            } if subscription_id == sub.id
        ));
        assert!(t.db.get_related_order_ids(sub.id, RelationType::Renewal).await.unwrap().is_empty());
        let stored = t.db.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.dates, sub.dates);
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn successful_early_renewal_moves_the_schedule() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let request = request_for(&t, &sub).await;

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request.clone())
            .await
            .unwrap();
        let EarlyRenewalOutcome::Renewed { order_id, .. } = outcome else {
            panic!("expected the subscription to renew");
        };
        let next = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let stored = t.db.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.dates.next_payment, Some(next));
        assert_eq!(
            t.db.get_related_order_ids(sub.id, RelationType::Renewal).await.unwrap(),
            vec![order_id]
        );
        let action = t
            .db
            .next_scheduled(
                ScheduledHook::PaymentDue,
                ActionArgs::Subscription { subscription_id: sub.id },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.scheduled_at, next);
        assert!(t
            .notifier
            .sent()
            .iter()
            .any(|(template, _, _)| template == "early_renewal_complete"));

        // The link works once.
        let replay = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(replay, EarlyRenewalOutcome::Rejected { .. }));
        assert_eq!(t.gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn gateway_without_date_changes_is_ineligible() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("basic")).await;
        let request = request_for(&t, &sub).await;

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(outcome, EarlyRenewalOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn tokens_are_bound_to_the_requesting_customer() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let mut request = request_for(&t, &sub).await;
        request.customer_id += 1;

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(outcome, EarlyRenewalOutcome::Rejected { .. }));
        assert_eq!(t.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn missing_token_is_rejected_without_charging() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let request = EarlyRenewalRequest {
            subscription_id: sub.id,
            customer_id: sub.customer_id,
            token: None,
        };

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            EarlyRenewalOutcome::Rejected {
                redirect: Redirect::Account,
                ..
            }
        ));
        assert_eq!(t.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn unknown_subscription_is_rejected() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let processor = EarlyRenewalProcessor::new(t.engine.state().clone());
        assert!(matches!(
            processor.issue_token(sub.id + 100, sub.customer_id).await,
            Err(SubscriptionError::SubscriptionNotFound(_))
        ));

        // A valid token presented for a subscription that does not exist.
        let mut request = request_for(&t, &sub).await;
        request.subscription_id = sub.id + 100;
        let outcome = processor.handle_request(request).await.unwrap();
        assert!(matches!(
            outcome,
            EarlyRenewalOutcome::Rejected {
                redirect: Redirect::Account,
                ..
            }
        ));
        assert_eq!(t.gateway.charge_count(), 0);
        assert_eq!(
            t.db.get_subscription(sub.id).await.unwrap().unwrap().dates,
            sub.dates
        );
    }

    #[tokio::test]
    async fn disabled_feature_rejects_everything() {
        let t = TestEngine::with_settings(|s| s.early_renewal.enabled = false).await;
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let request = request_for(&t, &sub).await;

        let outcome = EarlyRenewalProcessor::new(t.engine.state().clone())
            .handle_request(request)
            .await
            .unwrap();
        assert!(matches!(outcome, EarlyRenewalOutcome::Rejected { .. }));
    }
}
