use async_trait::async_trait;
use rusqlite::OptionalExtension;

use crate::error::{Result, SubscriptionError};
use crate::retry::rules::RetryRule;
use crate::retry::{NewRetry, Retry, RetryQuery, RetryStatus, RetryStore};
use crate::storage::database::Database;
use crate::storage::time::{column_datetime, to_db_string};

const SELECT_COLUMNS: &str = "id, order_id, status, date_gmt, rule_raw";

fn row_to_retry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Retry> {
    let status_s: String = row.get(2)?;
    let date_s: String = row.get(3)?;
    let rule_raw: String = row.get(4)?;
    let rule: RetryRule = serde_json::from_str(&rule_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Retry {
        id: row.get(0)?,
        order_id: row.get(1)?,
        status: RetryStatus::parse(&status_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "status".into(), rusqlite::types::Type::Text)
        })?,
        date_gmt: column_datetime(3, &date_s)?,
        rule,
    })
}

fn load(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Retry>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM payment_retries WHERE id = ?1"),
        [id],
        row_to_retry,
    )
    .optional()
}

// Table-backed store: payment_retries
#[async_trait]
impl RetryStore for Database {
    async fn create_retry(&self, retry: NewRetry) -> Result<Retry> {
        let rule_raw = serde_json::to_string(&retry.rule)?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO payment_retries (order_id, status, date_gmt, rule_raw) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                retry.order_id,
                retry.status.as_str(),
                to_db_string(&retry.date_gmt),
                rule_raw,
            ],
        )?;
        Ok(Retry {
            id: conn.last_insert_rowid(),
            order_id: retry.order_id,
            status: retry.status,
            date_gmt: retry.date_gmt,
            rule: retry.rule,
        })
    }

    async fn get_retry(&self, id: i64) -> Result<Option<Retry>> {
        let conn = self.connection.lock().await;
        Ok(load(&conn, id)?)
    }

    async fn update_retry_status(&self, id: i64, status: RetryStatus) -> Result<bool> {
        let conn = self.connection.lock().await;
        let current = load(&conn, id)?.ok_or(SubscriptionError::RetryNotFound(id))?;
        if !current.status.can_move_to(status) {
            tracing::warn!(
                retry_id = id,
                from = current.status.as_str(),
                to = status.as_str(),
                "refusing retry status change"
            );
            return Ok(false);
        }
        let rows = conn.execute(
            "UPDATE payment_retries SET status = ?1 WHERE id = ?2 AND status = ?3",
            rusqlite::params![status.as_str(), id, current.status.as_str()],
        )?;
        Ok(rows > 0)
    }

    async fn get_retries_for_order(&self, order_id: i64) -> Result<Vec<Retry>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM payment_retries WHERE order_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([order_id], row_to_retry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn get_retries(&self, query: RetryQuery) -> Result<Vec<Retry>> {
        let conn = self.connection.lock().await;
        let limit = query
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM payment_retries
             WHERE (?1 IS NULL OR status = ?1) AND id > ?2
             ORDER BY id
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                query.status.map(|s| s.as_str()),
                query.after_id.unwrap_or(0),
                limit,
            ],
            row_to_retry,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn delete_retry(&self, id: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        let rows = conn.execute("DELETE FROM payment_retries WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    async fn import_retry(&self, retry: &Retry) -> Result<i64> {
        let rule_raw = serde_json::to_string(&retry.rule)?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO payment_retries (order_id, status, date_gmt, rule_raw, legacy_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                retry.order_id,
                retry.status.as_str(),
                to_db_string(&retry.date_gmt),
                rule_raw,
                retry.id,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM payment_retries WHERE legacy_id = ?1",
            [retry.id],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}
