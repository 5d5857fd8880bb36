use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::{Result, SubscriptionError};
use crate::meta::EntityKind;
use crate::order::{NewOrder, Order, OrderStatus, OrderStore};
use crate::storage::database::Database;
use crate::storage::database_subscriptions::column_decimal;
use crate::storage::time::{column_datetime, column_opt_datetime, to_db_string};

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let status_s: String = row.get(2)?;
    let total_s: String = row.get(3)?;
    let created_at_s: String = row.get(6)?;
    Ok(Order {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        status: OrderStatus::parse(&status_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "status".into(), rusqlite::types::Type::Text)
        })?,
        total: column_decimal(3, &total_s)?,
        currency: row.get(4)?,
        payment_method: row.get(5)?,
        created_at: column_datetime(6, &created_at_s)?,
        paid_at: column_opt_datetime(7, row.get(7)?)?,
    })
}

fn load(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Order>> {
    conn.query_row(
        "SELECT id, customer_id, status, total, currency, payment_method, created_at, paid_at
         FROM orders WHERE id = ?1",
        [id],
        row_to_order,
    )
    .optional()
}

#[async_trait]
impl OrderStore for Database {
    async fn create_order(&self, payload: NewOrder) -> Result<Order> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO orders (customer_id, status, total, currency, payment_method, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                payload.customer_id,
                payload.status.as_str(),
                payload.total.to_string(),
                payload.currency,
                payload.payment_method,
                to_db_string(&payload.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        load(&conn, id)?.ok_or(SubscriptionError::OrderNotFound(id))
    }

    async fn get_order(&self, id: i64) -> Result<Option<Order>> {
        let conn = self.connection.lock().await;
        Ok(load(&conn, id)?)
    }

    async fn update_order_status(&self, id: i64, status: OrderStatus) -> Result<bool> {
        let conn = self.connection.lock().await;
        let rows = conn.execute(
            "UPDATE orders SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), id],
        )?;
        Ok(rows > 0)
    }

    async fn mark_order_paid(
        &self,
        id: i64,
        status: OrderStatus,
        paid_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.connection.lock().await;
        let rows = conn.execute(
            "UPDATE orders SET status = ?1, paid_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), to_db_string(&paid_at), id],
        )?;
        Ok(rows > 0)
    }

    async fn delete_order(&self, id: i64) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        let rows = tx.execute("DELETE FROM orders WHERE id = ?1", [id])?;
        tx.execute(
            "DELETE FROM entity_meta WHERE entity_kind = ?1 AND entity_id = ?2",
            rusqlite::params![EntityKind::Order.as_str(), id],
        )?;
        tx.execute("DELETE FROM order_relations WHERE order_id = ?1", [id])?;
        tx.execute("DELETE FROM payment_retries WHERE order_id = ?1", [id])?;
        tx.commit()?;
        Ok(rows > 0)
    }
}
