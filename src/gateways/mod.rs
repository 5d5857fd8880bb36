pub mod capabilities;
pub mod registry;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::order::Order;
use crate::subscription::{Subscription, SubscriptionStatus};

pub use capabilities::{Capability, CapabilityCache, CapabilitySet};
pub use registry::{ChargeResult, GatewayRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Success { transaction_id: String },
    Failure { reason: String },
}

/// A payment gateway able to charge stored payment methods.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    /// Charges `amount` for `order` using the payment method stored for the
    /// customer. `Err` means the gateway itself misbehaved; a declined charge
    /// is `Ok(ChargeOutcome::Failure)`.
    async fn charge(&self, order: &Order, amount: Decimal) -> Result<ChargeOutcome>;

    async fn on_status_changed(
        &self,
        _subscription: &Subscription,
        _old_status: SubscriptionStatus,
        _new_status: SubscriptionStatus,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_payment_method_changed(&self, _subscription: &Subscription) -> Result<()> {
        Ok(())
    }
}
