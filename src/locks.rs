use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per subscription id. Guards are not reentrant: only the
/// engine's entry points acquire them.
#[derive(Debug, Default)]
pub struct SubscriptionLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, subscription_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds so the map stays small.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(subscription_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Locks several subscriptions in ascending id order.
    pub async fn lock_all(&self, subscription_ids: &[i64]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = subscription_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }
}
