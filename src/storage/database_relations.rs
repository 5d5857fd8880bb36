use async_trait::async_trait;
use rusqlite::OptionalExtension;

use crate::error::Result;
use crate::relations::{RelatedOrderStore, RelationType, parent_conflict};
use crate::storage::database::Database;

// Table-backed relations, unique per (order, subscription, type)
#[async_trait]
impl RelatedOrderStore for Database {
    async fn add_relation(
        &self,
        order_id: i64,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<()> {
        let conn = self.connection.lock().await;
        if relation_type == RelationType::Parent {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT order_id FROM order_relations
                     WHERE subscription_id = ?1 AND relation_type = ?2 AND order_id <> ?3
                     LIMIT 1",
                    rusqlite::params![subscription_id, relation_type.as_str(), order_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(parent_conflict(subscription_id, existing, order_id));
            }
        }
        conn.execute(
            "INSERT OR IGNORE INTO order_relations (order_id, subscription_id, relation_type)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![order_id, subscription_id, relation_type.as_str()],
        )?;
        Ok(())
    }

    async fn get_related_order_ids(
        &self,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<Vec<i64>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT order_id FROM order_relations
             WHERE subscription_id = ?1 AND relation_type = ?2
             ORDER BY order_id DESC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![subscription_id, relation_type.as_str()],
            |row| row.get(0),
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn get_related_subscription_ids(
        &self,
        order_id: i64,
        relation_type: RelationType,
    ) -> Result<Vec<i64>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT subscription_id FROM order_relations
             WHERE order_id = ?1 AND relation_type = ?2
             ORDER BY subscription_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![order_id, relation_type.as_str()], |row| {
            row.get(0)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn delete_relation(
        &self,
        order_id: i64,
        subscription_id: i64,
        relation_type: RelationType,
    ) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM order_relations
             WHERE order_id = ?1 AND subscription_id = ?2 AND relation_type = ?3",
            rusqlite::params![order_id, subscription_id, relation_type.as_str()],
        )?;
        Ok(())
    }

    async fn delete_relations(&self, order_id: i64, relation_type: RelationType) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM order_relations WHERE order_id = ?1 AND relation_type = ?2",
            rusqlite::params![order_id, relation_type.as_str()],
        )?;
        Ok(())
    }
}
