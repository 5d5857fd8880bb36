use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::early_renewal_tokens::{EarlyRenewalTokenRecord, EarlyRenewalTokenStore};
use crate::error::Result;
use crate::storage::database::Database;
use crate::storage::time::to_db_string;

#[async_trait]
impl EarlyRenewalTokenStore for Database {
    async fn create_token(&self, token: EarlyRenewalTokenRecord) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO early_renewal_tokens (token_hash, subscription_id, customer_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                token.token_hash,
                token.subscription_id,
                token.customer_id,
                to_db_string(&token.created_at),
                to_db_string(&token.expires_at),
            ],
        )?;
        Ok(())
    }

    async fn consume_token(
        &self,
        token_hash: &str,
        subscription_id: i64,
        customer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.connection.lock().await;
        let rows = conn.execute(
            "DELETE FROM early_renewal_tokens
             WHERE token_hash = ?1 AND subscription_id = ?2 AND customer_id = ?3 AND expires_at > ?4",
            rusqlite::params![token_hash, subscription_id, customer_id, to_db_string(&now)],
        )?;
        Ok(rows > 0)
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.connection.lock().await;
        let rows = conn.execute(
            "DELETE FROM early_renewal_tokens WHERE expires_at <= ?1",
            [to_db_string(&now)],
        )?;
        Ok(rows as u64)
    }
}
