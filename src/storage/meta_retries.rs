use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, SubscriptionError};
use crate::meta::{EntityKind, MetaStore};
use crate::retry::{NewRetry, Retry, RetryQuery, RetryStatus, RetryStore};

const RETRY_KEY_PREFIX: &str = "_payment_retry_";
const SEQUENCE_KEY: &str = "_payment_retry_sequence";

fn retry_key(id: i64) -> String {
    // Zero-padded so key order equals id order.
    format!("{RETRY_KEY_PREFIX}{id:012}")
}

/// Retries stored as JSON documents in the owning order's metadata.
pub struct MetaRetryStore {
    meta: Arc<dyn MetaStore>,
    sequence: Mutex<()>,
}

impl MetaRetryStore {
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        Self {
            meta,
            sequence: Mutex::new(()),
        }
    }

    async fn next_id(&self) -> Result<i64> {
        let _guard = self.sequence.lock().await;
        let current = self
            .meta
            .get_meta(EntityKind::Site, 0, SEQUENCE_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        self.meta
            .set_meta(EntityKind::Site, 0, SEQUENCE_KEY, &next.to_string())
            .await?;
        Ok(next)
    }

    async fn bump_sequence_to(&self, id: i64) -> Result<()> {
        let _guard = self.sequence.lock().await;
        let current = self
            .meta
            .get_meta(EntityKind::Site, 0, SEQUENCE_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if id > current {
            self.meta
                .set_meta(EntityKind::Site, 0, SEQUENCE_KEY, &id.to_string())
                .await?;
        }
        Ok(())
    }

    async fn write(&self, retry: &Retry) -> Result<()> {
        let doc = serde_json::to_string(retry)?;
        self.meta
            .set_meta(EntityKind::Order, retry.order_id, &retry_key(retry.id), &doc)
            .await
    }

    async fn all(&self) -> Result<Vec<Retry>> {
        let rows = self.meta.scan_meta(EntityKind::Order, RETRY_KEY_PREFIX).await?;
        rows.iter()
            .map(|(_, _, doc)| serde_json::from_str::<Retry>(doc).map_err(SubscriptionError::from))
            .collect()
    }
}

#[async_trait]
impl RetryStore for MetaRetryStore {
    async fn create_retry(&self, retry: NewRetry) -> Result<Retry> {
        let id = self.next_id().await?;
        let stored = Retry {
            id,
            order_id: retry.order_id,
            status: retry.status,
            date_gmt: retry.date_gmt,
            rule: retry.rule,
        };
        self.write(&stored).await?;
        Ok(stored)
    }

    async fn get_retry(&self, id: i64) -> Result<Option<Retry>> {
        let rows = self.meta.scan_meta(EntityKind::Order, &retry_key(id)).await?;
        match rows.first() {
            Some((_, _, doc)) => Ok(Some(serde_json::from_str(doc)?)),
            None => Ok(None),
        }
    }

    async fn update_retry_status(&self, id: i64, status: RetryStatus) -> Result<bool> {
        let mut retry = self
            .get_retry(id)
            .await?
            .ok_or(SubscriptionError::RetryNotFound(id))?;
        if !retry.status.can_move_to(status) {
            tracing::warn!(
                retry_id = id,
                from = retry.status.as_str(),
                to = status.as_str(),
                "refusing retry status change"
            );
            return Ok(false);
        }
        retry.status = status;
        self.write(&retry).await?;
        Ok(true)
    }

    async fn get_retries_for_order(&self, order_id: i64) -> Result<Vec<Retry>> {
        let rows = self
            .meta
            .list_meta(EntityKind::Order, order_id, RETRY_KEY_PREFIX)
            .await?;
        rows.iter()
            .map(|(_, doc)| serde_json::from_str::<Retry>(doc).map_err(SubscriptionError::from))
            .collect()
    }

    async fn get_retries(&self, query: RetryQuery) -> Result<Vec<Retry>> {
        let after_id = query.after_id.unwrap_or(0);
        let matching = self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.id > after_id)
            .filter(|r| query.status.is_none_or(|s| r.status == s));
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn delete_retry(&self, id: i64) -> Result<bool> {
        let Some(retry) = self.get_retry(id).await? else {
            return Ok(false);
        };
        let removed = self
            .meta
            .delete_meta(EntityKind::Order, retry.order_id, &retry_key(id), None)
            .await?;
        Ok(removed > 0)
    }

    async fn import_retry(&self, retry: &Retry) -> Result<i64> {
        if self.get_retry(retry.id).await?.is_none() {
            self.write(retry).await?;
            self.bump_sequence_to(retry.id).await?;
        }
        Ok(retry.id)
    }
}
