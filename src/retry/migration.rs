use std::sync::Arc;

use crate::error::Result;
use crate::meta::{EntityKind, MetaStore};
use crate::retry::{RetryQuery, RetryStore};

const CURSOR_KEY: &str = "_retry_migration_cursor";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationProgress {
    /// Records moved by this call.
    pub migrated: usize,
    /// Highest source id handled so far.
    pub cursor: i64,
    pub done: bool,
}

/// Moves retries between backends in id order. Progress is kept in site
/// metadata so an interrupted run resumes where it stopped.
pub struct RetryStoreMigrator {
    source: Arc<dyn RetryStore>,
    destination: Arc<dyn RetryStore>,
    meta: Arc<dyn MetaStore>,
    batch_size: usize,
}

impl RetryStoreMigrator {
    pub fn new(
        source: Arc<dyn RetryStore>,
        destination: Arc<dyn RetryStore>,
        meta: Arc<dyn MetaStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            destination,
            meta,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn cursor(&self) -> Result<i64> {
        Ok(self
            .meta
            .get_meta(EntityKind::Site, 0, CURSOR_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn migrate_batch(&self) -> Result<MigrationProgress> {
        let mut cursor = self.cursor().await?;
        let batch = self
            .source
            .get_retries(RetryQuery {
                status: None,
                after_id: Some(cursor),
                limit: Some(self.batch_size),
            })
            .await?;

        for retry in &batch {
            // The destination ignores a source id it has already imported, so
            // a crash between import and delete is safe to rerun.
            let new_id = self.destination.import_retry(retry).await?;
            self.source.delete_retry(retry.id).await?;
            cursor = retry.id;
            self.meta
                .set_meta(EntityKind::Site, 0, CURSOR_KEY, &cursor.to_string())
                .await?;
            tracing::debug!(source_id = retry.id, new_id, order_id = retry.order_id, "migrated retry");
        }

        let progress = MigrationProgress {
            migrated: batch.len(),
            cursor,
            done: batch.len() < self.batch_size,
        };
        tracing::info!(migrated = progress.migrated, cursor, done = progress.done, "retry migration batch");
        Ok(progress)
    }

    pub async fn migrate_all(&self) -> Result<MigrationProgress> {
        let mut total = MigrationProgress::default();
        loop {
            let batch = self.migrate_batch().await?;
            total.migrated += batch.migrated;
            total.cursor = batch.cursor;
            if batch.done {
                total.done = true;
                return Ok(total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::rules::{RetryDelay, RetryRule};
    use crate::retry::{NewRetry, RetryStatus};
    use crate::storage::{Database, MetaRetryStore};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    async fn setup(batch_size: usize) -> (tempfile::TempDir, Arc<Database>, Arc<MetaRetryStore>, RetryStoreMigrator) {
        let dir = tempdir().unwrap();
        let db = Arc::new(
            Database::new(dir.path().join("test.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let source = Arc::new(MetaRetryStore::new(db.clone()));
        let migrator = RetryStoreMigrator::new(source.clone(), db.clone(), db.clone(), batch_size);
        (dir, db, source, migrator)
    }

    async fn seed(source: &MetaRetryStore, order_id: i64, count: usize) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..count {
            source
                .create_retry(NewRetry {
                    order_id,
                    status: if i + 1 == count {
                        RetryStatus::Pending
                    } else {
                        RetryStatus::Failed
                    },
                    date_gmt: start + Duration::hours(12 * (i as i64 + 1)),
                    rule: RetryRule::new(RetryDelay::hours(12)),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn migrates_in_batches_and_preserves_order() {
        let (_dir, db, source, migrator) = setup(2).await;
        seed(&source, 10, 2).await;
        seed(&source, 11, 1).await;
        let before = source.get_retries_for_order(10).await.unwrap();

        let first = migrator.migrate_batch().await.unwrap();
        assert_eq!(first.migrated, 2);
        assert!(!first.done);
        let second = migrator.migrate_batch().await.unwrap();
        assert_eq!(second.migrated, 1);
        assert!(second.done);
        assert_eq!(migrator.cursor().await.unwrap(), 3);

        let after = db.get_retries_for_order(10).await.unwrap();
        assert_eq!(after.len(), 2);
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.status, new.status);
            assert_eq!(old.date_gmt, new.date_gmt);
            assert_eq!(old.rule, new.rule);
        }
        assert_eq!(
            db.get_last_retry_for_order(10).await.unwrap().unwrap().status,
            RetryStatus::Pending
        );
        assert!(source.get_retries(RetryQuery::default()).await.unwrap().is_empty());
        assert_eq!(migrator.migrate_all().await.unwrap().migrated, 0);
    }

    #[tokio::test]
    async fn rerun_after_partial_import_does_not_duplicate() {
        let (_dir, db, source, migrator) = setup(10).await;
        seed(&source, 10, 2).await;
        // Simulate a crash after the first import but before its source delete.
        let first = source.get_retries_for_order(10).await.unwrap().remove(0);
        db.import_retry(&first).await.unwrap();

        let progress = migrator.migrate_all().await.unwrap();
        assert_eq!(progress.migrated, 2);
        assert!(progress.done);
        assert_eq!(db.get_retries_for_order(10).await.unwrap().len(), 2);
    }
}
