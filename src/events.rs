use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::retry::Retry;
use crate::subscription::SubscriptionStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    StatusChanged {
        subscription_id: i64,
        old_status: SubscriptionStatus,
        new_status: SubscriptionStatus,
    },
    RenewalOrderCreated {
        subscription_id: i64,
        order_id: i64,
    },
    RetryScheduled {
        order_id: i64,
        retry: Retry,
    },
    RetryExhausted {
        order_id: i64,
        /// Last retry made for the order, if any.
        retry: Option<Retry>,
    },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &SubscriptionEvent);
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub fn emit(&self, event: SubscriptionEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "subscriptions::events", "{}", json),
            Err(e) => tracing::warn!("failed to encode event: {}", e),
        }
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }
}
