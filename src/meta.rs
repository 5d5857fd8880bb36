use async_trait::async_trait;

use crate::error::Result;

/// Owner of a metadata row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Order,
    Subscription,
    /// Site-wide options such as migration cursors. Use entity id 0.
    Site,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Order => "order",
            EntityKind::Subscription => "subscription",
            EntityKind::Site => "site",
        }
    }
}

/// Per-entity key/value store. A key may hold several values.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_meta(&self, kind: EntityKind, id: i64, key: &str) -> Result<Option<String>>;

    async fn get_meta_values(&self, kind: EntityKind, id: i64, key: &str) -> Result<Vec<String>>;

    /// Replaces every value stored under `key`.
    async fn set_meta(&self, kind: EntityKind, id: i64, key: &str, value: &str) -> Result<()>;

    /// Adds a value unless the exact (key, value) pair already exists.
    /// Returns `false` when nothing was inserted.
    async fn add_meta_value(&self, kind: EntityKind, id: i64, key: &str, value: &str) -> Result<bool>;

    /// Deletes one value, or all values when `value` is `None`.
    async fn delete_meta(
        &self,
        kind: EntityKind,
        id: i64,
        key: &str,
        value: Option<&str>,
    ) -> Result<u64>;

    /// Entities holding `value` under `key`, highest id first.
    async fn find_entity_ids(&self, kind: EntityKind, key: &str, value: &str) -> Result<Vec<i64>>;

    /// All (key, value) pairs of one entity whose key starts with `prefix`.
    async fn list_meta(&self, kind: EntityKind, id: i64, prefix: &str) -> Result<Vec<(String, String)>>;

    /// All (entity id, key, value) rows of a kind whose key starts with `prefix`,
    /// ordered by key.
    async fn scan_meta(&self, kind: EntityKind, prefix: &str) -> Result<Vec<(i64, String, String)>>;
}
