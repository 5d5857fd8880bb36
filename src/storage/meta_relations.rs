use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, SubscriptionError};
use crate::meta::{EntityKind, MetaStore};
use crate::relations::{RelatedOrderStore, RelationType, parent_conflict};

/// Relations kept as order metadata: one value per related subscription under
/// the relation type's key.
pub struct MetaRelationStore {
    meta: Arc<dyn MetaStore>,
}

impl MetaRelationStore {
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        Self { meta }
    }
}

fn parse_subscription_id(order_id: i64, value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|_| {
        SubscriptionError::InvalidArgument(format!(
            "order {order_id} holds a non-numeric subscription reference {value:?}"
        ))
    })
}

#[async_trait]
impl RelatedOrderStore for MetaRelationStore {
    async fn add_relation(
        &self,
        order_id: i64,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<()> {
        let value = subscription_id.to_string();
        if relation_type == RelationType::Parent {
            let existing = self
                .meta
                .find_entity_ids(EntityKind::Order, relation_type.meta_key(), &value)
                .await?;
            if let Some(other) = existing.into_iter().find(|id| *id != order_id) {
                return Err(parent_conflict(subscription_id, other, order_id));
            }
        }
        self.meta
            .add_meta_value(EntityKind::Order, order_id, relation_type.meta_key(), &value)
            .await?;
        Ok(())
    }

    async fn get_related_order_ids(
        &self,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<Vec<i64>> {
        self.meta
            .find_entity_ids(
                EntityKind::Order,
                relation_type.meta_key(),
                &subscription_id.to_string(),
            )
            .await
    }

    async fn get_related_subscription_ids(
        &self,
        order_id: i64,
        relation_type: RelationType,
    ) -> Result<Vec<i64>> {
        let values = self
            .meta
            .get_meta_values(EntityKind::Order, order_id, relation_type.meta_key())
            .await?;
        let mut ids = values
            .iter()
            .map(|v| parse_subscription_id(order_id, v))
            .collect::<Result<Vec<i64>>>()?;
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn delete_relation(
        &self,
        order_id: i64,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<()> {
        self.meta
            .delete_meta(
                EntityKind::Order,
                order_id,
                relation_type.meta_key(),
                Some(&subscription_id.to_string()),
            )
            .await?;
        Ok(())
    }

    async fn delete_relations(&self, order_id: i64, relation_type: RelationType) -> Result<()> {
        self.meta
            .delete_meta(EntityKind::Order, order_id, relation_type.meta_key(), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::tempdir;

    async fn exercise(store: &dyn RelatedOrderStore) {
        store.add_relation(10, 1, RelationType::Renewal).await.unwrap();
        store.add_relation(10, 1, RelationType::Renewal).await.unwrap();
        store.add_relation(12, 1, RelationType::Renewal).await.unwrap();
        store.add_relation(11, 1, RelationType::Renewal).await.unwrap();
        store.add_relation(11, 2, RelationType::Renewal).await.unwrap();
        store.add_relation(5, 1, RelationType::Parent).await.unwrap();

        assert_eq!(
            store.get_related_order_ids(1, RelationType::Renewal).await.unwrap(),
            vec![12, 11, 10]
        );
        assert_eq!(
            store.get_last_related_order_id(1, RelationType::Renewal).await.unwrap(),
            Some(12)
        );
        assert_eq!(
            store.get_related_subscription_ids(11, RelationType::Renewal).await.unwrap(),
            vec![1, 2]
        );
        assert!(store
            .get_related_order_ids(1, RelationType::Switch)
            .await
            .unwrap()
            .is_empty());

        // Second parent for the same subscription is refused, the same one is idempotent.
        store.add_relation(5, 1, RelationType::Parent).await.unwrap();
        assert!(matches!(
            store.add_relation(6, 1, RelationType::Parent).await,
            Err(SubscriptionError::InvalidArgument(_))
        ));

        store.delete_relation(11, 1, RelationType::Renewal).await.unwrap();
        store.delete_relation(11, 1, RelationType::Renewal).await.unwrap();
        assert_eq!(
            store.get_related_order_ids(1, RelationType::Renewal).await.unwrap(),
            vec![12, 10]
        );
        assert_eq!(
            store.get_related_subscription_ids(11, RelationType::Renewal).await.unwrap(),
            vec![2]
        );

        store.delete_relations(11, RelationType::Renewal).await.unwrap();
        assert!(store
            .get_related_subscription_ids(11, RelationType::Renewal)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn table_backed_relations() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        exercise(&db).await;
    }

    #[tokio::test]
    async fn meta_backed_relations() {
        let dir = tempdir().unwrap();
        let db = Arc::new(
            Database::new(dir.path().join("test.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let store = MetaRelationStore::new(db);
        exercise(&store).await;
    }

    #[tokio::test]
    async fn duplicate_add_leaves_one_edge() {
        let dir = tempdir().unwrap();
        let db = Arc::new(
            Database::new(dir.path().join("test.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let store = MetaRelationStore::new(db.clone());
        store.add_relation(3, 4, RelationType::Switch).await.unwrap();
        store.add_relation(3, 4, RelationType::Switch).await.unwrap();
        assert_eq!(
            db.get_meta_values(EntityKind::Order, 3, "_subscription_switch")
                .await
                .unwrap(),
            vec!["4".to_string()]
        );
    }
}
