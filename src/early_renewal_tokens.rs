use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EarlyRenewalTokenRecord {
    pub token_hash: String,
    pub subscription_id: i64,
    pub customer_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait EarlyRenewalTokenStore: Send + Sync {
    async fn create_token(&self, token: EarlyRenewalTokenRecord) -> Result<()>;

    /// Deletes the token if it is bound to the subscription and requester and
    /// has not expired. Returns whether it was valid; a token works once.
    async fn consume_token(
        &self,
        token_hash: &str,
        subscription_id: i64,
        customer_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub fn issue_token() -> String {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL_SAFE_NO_PAD;
    use rand::Rng;

    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    B64_URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
