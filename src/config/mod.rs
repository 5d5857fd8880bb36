pub mod settings;

pub use settings::{
    DatabaseConfig, EarlyRenewalConfig, MigrationConfig, RelationsConfig, RenewalConfig,
    RetryConfig, Settings, StoreBackend, WorkerConfig,
};
