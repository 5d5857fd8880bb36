use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Customer,
    Admin,
}

impl Recipient {
    pub fn as_str(self) -> &'static str {
        match self {
            Recipient::Customer => "customer",
            Recipient::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContext {
    pub subscription_id: Option<i64>,
    pub order_id: Option<i64>,
    pub retry_id: Option<i64>,
}

impl NotificationContext {
    pub fn subscription(subscription_id: i64) -> Self {
        Self {
            subscription_id: Some(subscription_id),
            ..Default::default()
        }
    }

    pub fn renewal(subscription_id: i64, order_id: i64) -> Self {
        Self {
            subscription_id: Some(subscription_id),
            order_id: Some(order_id),
            retry_id: None,
        }
    }
}

// Concrete channels (email and so on) live in the host platform.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        template_key: &str,
        recipient: Recipient,
        context: &NotificationContext,
    ) -> Result<()>;
}

/// Records notifications in the log only.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        template_key: &str,
        recipient: Recipient,
        context: &NotificationContext,
    ) -> Result<()> {
        tracing::info!(
            template = template_key,
            recipient = recipient.as_str(),
            subscription_id = ?context.subscription_id,
            order_id = ?context.order_id,
            retry_id = ?context.retry_id,
            "notification"
        );
        Ok(())
    }
}

/// Notification failures are logged and never abort lifecycle work.
pub(crate) async fn send(
    notifier: &dyn Notifier,
    template_key: &str,
    recipient: Recipient,
    context: NotificationContext,
) {
    if let Err(e) = notifier.notify(template_key, recipient, &context).await {
        tracing::warn!(
            template = template_key,
            subscription_id = ?context.subscription_id,
            order_id = ?context.order_id,
            "notification failed: {}",
            e
        );
    }
}
