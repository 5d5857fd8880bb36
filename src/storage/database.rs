use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    billing_interval INTEGER NOT NULL CHECK (billing_interval > 0),
    billing_period TEXT NOT NULL,
    date_start TEXT,
    date_trial_end TEXT,
    date_next_payment TEXT,
    date_end TEXT,
    date_last_order_created TEXT,
    date_payment_retry TEXT,
    date_cancelled TEXT,
    payment_method TEXT NOT NULL DEFAULT '',
    total TEXT NOT NULL,
    currency TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_status ON subscriptions (status);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    total TEXT NOT NULL,
    currency TEXT NOT NULL,
    payment_method TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    paid_at TEXT
);

CREATE TABLE IF NOT EXISTS entity_meta (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_kind TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    meta_key TEXT NOT NULL CHECK (meta_key <> ''),
    meta_value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entity_meta_owner ON entity_meta (entity_kind, entity_id, meta_key);
CREATE INDEX IF NOT EXISTS idx_entity_meta_value ON entity_meta (entity_kind, meta_key, meta_value);

CREATE TABLE IF NOT EXISTS order_relations (
    order_id INTEGER NOT NULL,
    subscription_id INTEGER NOT NULL,
    relation_type TEXT NOT NULL,
    PRIMARY KEY (order_id, subscription_id, relation_type)
);
CREATE INDEX IF NOT EXISTS idx_order_relations_subscription ON order_relations (subscription_id, relation_type);

CREATE TABLE IF NOT EXISTS payment_retries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    date_gmt TEXT NOT NULL,
    rule_raw TEXT NOT NULL,
    legacy_id INTEGER UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_payment_retries_order ON payment_retries (order_id);

CREATE TABLE IF NOT EXISTS scheduled_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hook TEXT NOT NULL,
    args TEXT NOT NULL,
    scheduled_at TEXT NOT NULL,
    status TEXT NOT NULL,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_scheduled_actions_due ON scheduled_actions (status, scheduled_at);

CREATE TABLE IF NOT EXISTS early_renewal_tokens (
    token_hash TEXT PRIMARY KEY,
    subscription_id INTEGER NOT NULL,
    customer_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

/// SQLite-backed implementation of every store trait.
#[derive(Clone)]
pub struct Database {
    pub(crate) connection: Arc<Mutex<Connection>>,
}

impl Database {
    pub async fn new(database_path: &str) -> Result<Self> {
        // Make sure the database directory exists
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Database initialized at: {}", database_path);

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }
}
