pub mod clock;
pub mod config;
pub mod early_renewal_tokens;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateways;
pub mod locks;
pub mod meta;
pub mod notify;
pub mod order;
pub mod relations;
pub mod renewal;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use engine::{EngineState, RunSummary, SubscriptionEngine};
pub use error::{Result, SubscriptionError};
