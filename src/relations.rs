use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubscriptionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Parent,
    Renewal,
    Switch,
    Resubscribe,
}

impl RelationType {
    pub const ALL: [RelationType; 4] = [
        RelationType::Parent,
        RelationType::Renewal,
        RelationType::Switch,
        RelationType::Resubscribe,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RelationType::Parent => "parent",
            RelationType::Renewal => "renewal",
            RelationType::Switch => "switch",
            RelationType::Resubscribe => "resubscribe",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "parent" => Ok(RelationType::Parent),
            "renewal" => Ok(RelationType::Renewal),
            "switch" => Ok(RelationType::Switch),
            "resubscribe" => Ok(RelationType::Resubscribe),
            other => Err(SubscriptionError::InvalidRelationType(other.to_string())),
        }
    }

    /// Order metadata key used by the metadata-backed store.
    pub fn meta_key(self) -> &'static str {
        match self {
            RelationType::Parent => "_subscription_parent",
            RelationType::Renewal => "_subscription_renewal",
            RelationType::Switch => "_subscription_switch",
            RelationType::Resubscribe => "_subscription_resubscribe",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed edges between orders and subscriptions.
#[async_trait]
pub trait RelatedOrderStore: Send + Sync {
    /// Idempotent. A subscription carries at most one parent order.
    async fn add_relation(
        &self,
        order_id: i64,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<()>;

    /// Newest first.
    async fn get_related_order_ids(
        &self,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<Vec<i64>>;

    async fn get_related_subscription_ids(
        &self,
        order_id: i64,
        relation_type: RelationType,
    ) -> Result<Vec<i64>>;

    async fn delete_relation(
        &self,
        order_id: i64,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<()>;

    async fn delete_relations(&self, order_id: i64, relation_type: RelationType) -> Result<()>;

    async fn get_last_related_order_id(
        &self,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<Option<i64>> {
        Ok(self
            .get_related_order_ids(subscription_id, relation_type)
            .await?
            .into_iter()
            .next())
    }

    async fn delete_all_relations(&self, order_id: i64) -> Result<()> {
        for relation_type in RelationType::ALL {
            self.delete_relations(order_id, relation_type).await?;
        }
        Ok(())
    }
}

pub(crate) fn parent_conflict(subscription_id: i64, existing: i64, order_id: i64) -> SubscriptionError {
    SubscriptionError::InvalidArgument(format!(
        "subscription {subscription_id} already has parent order {existing}, refusing {order_id}"
    ))
}
