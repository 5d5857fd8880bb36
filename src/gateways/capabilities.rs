use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Subscriptions,
    SubscriptionCancellation,
    SubscriptionSuspension,
    SubscriptionReactivation,
    SubscriptionDateChanges,
    PaymentMethodChange,
    MultiplePaymentMethodChange,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Subscriptions => "subscriptions",
            Capability::SubscriptionCancellation => "subscription_cancellation",
            Capability::SubscriptionSuspension => "subscription_suspension",
            Capability::SubscriptionReactivation => "subscription_reactivation",
            Capability::SubscriptionDateChanges => "subscription_date_changes",
            Capability::PaymentMethodChange => "payment_method_change",
            Capability::MultiplePaymentMethodChange => "multiple_payment_method_change",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    pub fn new(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().copied().collect())
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Memoizes capability checks for one operation, registry-wide and per
/// gateway.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    any_supports: HashMap<Capability, bool>,
    gateway_supports: HashMap<(String, Capability), bool>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(&mut self, capability: Capability, f: impl FnOnce() -> bool) -> bool {
        *self.any_supports.entry(capability).or_insert_with(f)
    }

    pub fn gateway_or_insert_with(
        &mut self,
        gateway_id: &str,
        capability: Capability,
        f: impl FnOnce() -> bool,
    ) -> bool {
        *self
            .gateway_supports
            .entry((gateway_id.to_string(), capability))
            .or_insert_with(f)
    }
}
