pub mod database;
pub mod database_early_renewal_tokens;
pub mod database_meta;
pub mod database_orders;
pub mod database_relations;
pub mod database_retries;
pub mod database_scheduler;
pub mod database_subscriptions;
pub mod meta_relations;
pub mod meta_retries;
pub mod time;

pub use database::Database;
pub use meta_relations::MetaRelationStore;
pub use meta_retries::MetaRetryStore;
