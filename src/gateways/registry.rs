use std::collections::HashMap;
use std::sync::Arc;

use crate::gateways::{Capability, CapabilityCache, ChargeOutcome, PaymentGateway};
use crate::order::Order;
use crate::subscription::{Subscription, SubscriptionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeResult {
    /// The order no longer needs payment; nothing was charged.
    AlreadyPaid,
    Charged { transaction_id: String },
    Failed { reason: String },
    /// No gateway is registered for the order's payment method.
    NoGateway,
}

impl ChargeResult {
    pub fn is_paid(&self) -> bool {
        matches!(self, ChargeResult::AlreadyPaid | ChargeResult::Charged { .. })
    }
}

/// Maps payment-method ids to gateway implementations.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        let id = gateway.id().to_string();
        if self.gateways.insert(id.clone(), gateway).is_some() {
            tracing::warn!(gateway = %id, "gateway registered twice, keeping the latest");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn resolve(&self, subscription: &Subscription) -> Option<Arc<dyn PaymentGateway>> {
        if subscription.is_manual() {
            return None;
        }
        self.get(&subscription.payment_method)
    }

    pub fn is_valid_payment_method(&self, payment_method: &str) -> bool {
        !payment_method.trim().is_empty() && self.gateways.contains_key(payment_method)
    }

    pub fn supports(&self, subscription: &Subscription, capability: Capability) -> bool {
        self.resolve(subscription)
            .is_some_and(|g| g.capabilities().supports(capability))
    }

    pub fn any_supports(&self, capability: Capability, cache: &mut CapabilityCache) -> bool {
        cache.get_or_insert_with(capability, || {
            self.gateways
                .values()
                .any(|g| g.capabilities().supports(capability))
        })
    }

    pub fn gateway_supports(
        &self,
        gateway_id: &str,
        capability: Capability,
        cache: &mut CapabilityCache,
    ) -> bool {
        cache.gateway_or_insert_with(gateway_id, capability, || {
            self.get(gateway_id)
                .is_some_and(|g| g.capabilities().supports(capability))
        })
    }

    /// Charges the order's outstanding total. Re-running this for a paid order is a no-op.
    pub async fn dispatch_charge(&self, order: &Order) -> ChargeResult {
        if !order.needs_payment() {
            tracing::info!(order_id = order.id, "order already paid, skipping charge");
            return ChargeResult::AlreadyPaid;
        }
        let Some(gateway) = self.get(&order.payment_method) else {
            tracing::warn!(
                order_id = order.id,
                payment_method = %order.payment_method,
                "no gateway registered for payment method"
            );
            return ChargeResult::NoGateway;
        };

        match gateway.charge(order, order.total).await {
            Ok(ChargeOutcome::Success { transaction_id }) => {
                tracing::info!(order_id = order.id, gateway = gateway.id(), %transaction_id, "charge succeeded");
                ChargeResult::Charged { transaction_id }
            }
            Ok(ChargeOutcome::Failure { reason }) => {
                tracing::info!(order_id = order.id, gateway = gateway.id(), %reason, "charge declined");
                ChargeResult::Failed { reason }
            }
            Err(e) => {
                tracing::error!(order_id = order.id, gateway = gateway.id(), "charge errored: {}", e);
                ChargeResult::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn dispatch_status_changed(
        &self,
        subscription: &Subscription,
        old_status: SubscriptionStatus,
        new_status: SubscriptionStatus,
    ) {
        let Some(gateway) = self.resolve(subscription) else {
            return;
        };
        if let Err(e) = gateway
            .on_status_changed(subscription, old_status, new_status)
            .await
        {
            tracing::error!(
                subscription_id = subscription.id,
                gateway = gateway.id(),
                %old_status,
                %new_status,
                "gateway status hook failed: {}",
                e
            );
        }
    }

    pub async fn dispatch_payment_method_changed(&self, subscription: &Subscription) {
        let Some(gateway) = self.resolve(subscription) else {
            return;
        };
        if let Err(e) = gateway.on_payment_method_changed(subscription).await {
            tracing::error!(
                subscription_id = subscription.id,
                gateway = gateway.id(),
                "gateway payment method hook failed: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderStatus;
    use crate::testing::FakeGateway;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn order(status: OrderStatus, payment_method: &str) -> Order {
        Order {
            id: 3,
            customer_id: 1,
            status,
            total: Decimal::new(1500, 2),
            currency: "USD".into(),
            payment_method: payment_method.into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn paid_orders_are_not_charged_again() {
        let gateway = Arc::new(FakeGateway::new("fake"));
        let mut registry = GatewayRegistry::new();
        registry.register(gateway.clone());

        let result = registry
            .dispatch_charge(&order(OrderStatus::Processing, "fake"))
            .await;
        assert_eq!(result, ChargeResult::AlreadyPaid);
        assert_eq!(gateway.charge_count(), 0);

        let result = registry.dispatch_charge(&order(OrderStatus::Pending, "fake")).await;
        assert!(matches!(result, ChargeResult::Charged { .. }));
        assert_eq!(gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn unknown_payment_methods_report_no_gateway() {
        let registry = GatewayRegistry::new();
        let result = registry.dispatch_charge(&order(OrderStatus::Pending, "nope")).await;
        assert_eq!(result, ChargeResult::NoGateway);
        assert!(!registry.is_valid_payment_method("nope"));
        assert!(!registry.is_valid_payment_method(""));
    }

    #[test]
    fn capability_checks_are_memoized_per_cache() {
        let mut registry = GatewayRegistry::new();
        registry.register(Arc::new(
            FakeGateway::new("fake").with_capabilities(&[Capability::Subscriptions]),
        ));
        let mut cache = CapabilityCache::new();
        assert!(registry.any_supports(Capability::Subscriptions, &mut cache));
        assert!(!registry.any_supports(Capability::MultiplePaymentMethodChange, &mut cache));

        // A gateway registered later is invisible to the old cache but seen by a new one.
        registry.register(Arc::new(
            FakeGateway::new("multi").with_capabilities(&[Capability::MultiplePaymentMethodChange]),
        ));
        assert!(!registry.any_supports(Capability::MultiplePaymentMethodChange, &mut cache));
        let mut fresh = CapabilityCache::new();
        assert!(registry.any_supports(Capability::MultiplePaymentMethodChange, &mut fresh));
        assert!(registry.gateway_supports("multi", Capability::MultiplePaymentMethodChange, &mut fresh));
        assert!(!registry.gateway_supports("fake", Capability::MultiplePaymentMethodChange, &mut fresh));
        assert!(!registry.gateway_supports("missing", Capability::Subscriptions, &mut fresh));
    }
}
