use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::Result;
use crate::scheduler::{ActionArgs, ActionStatus, ScheduledAction, ScheduledHook, Scheduler};
use crate::storage::database::Database;
use crate::storage::time::{column_datetime, to_db_string};

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledAction> {
    let hook_s: String = row.get(1)?;
    let args_s: String = row.get(2)?;
    let scheduled_s: String = row.get(3)?;
    let status_s: String = row.get(4)?;
    Ok(ScheduledAction {
        id: row.get(0)?,
        hook: ScheduledHook::parse(&hook_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(1, "hook".into(), rusqlite::types::Type::Text)
        })?,
        args: serde_json::from_str(&args_s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        scheduled_at: column_datetime(3, &scheduled_s)?,
        status: ActionStatus::parse(&status_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(4, "status".into(), rusqlite::types::Type::Text)
        })?,
    })
}

#[async_trait]
impl Scheduler for Database {
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        hook: ScheduledHook,
        args: ActionArgs,
    ) -> Result<i64> {
        let args_s = serde_json::to_string(&args)?;
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE scheduled_actions SET status = ?1
             WHERE hook = ?2 AND args = ?3 AND status = ?4",
            rusqlite::params![
                ActionStatus::Cancelled.as_str(),
                hook.as_str(),
                &args_s,
                ActionStatus::Pending.as_str(),
            ],
        )?;
        tx.execute(
            "INSERT INTO scheduled_actions (hook, args, scheduled_at, status) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                hook.as_str(),
                &args_s,
                to_db_string(&at),
                ActionStatus::Pending.as_str(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        tracing::debug!(action_id = id, hook = hook.as_str(), args = %args_s, at = %at, "scheduled action");
        Ok(id)
    }

    async fn unschedule(&self, hook: ScheduledHook, args: ActionArgs) -> Result<u64> {
        let args_s = serde_json::to_string(&args)?;
        let conn = self.connection.lock().await;
        let rows = conn.execute(
            "UPDATE scheduled_actions SET status = ?1
             WHERE hook = ?2 AND args = ?3 AND status = ?4",
            rusqlite::params![
                ActionStatus::Cancelled.as_str(),
                hook.as_str(),
                &args_s,
                ActionStatus::Pending.as_str(),
            ],
        )?;
        Ok(rows as u64)
    }

    async fn next_scheduled(
        &self,
        hook: ScheduledHook,
        args: ActionArgs,
    ) -> Result<Option<ScheduledAction>> {
        let args_s = serde_json::to_string(&args)?;
        let conn = self.connection.lock().await;
        let action = conn
            .query_row(
                "SELECT id, hook, args, scheduled_at, status FROM scheduled_actions
                 WHERE hook = ?1 AND args = ?2 AND status = ?3
                 ORDER BY scheduled_at LIMIT 1",
                rusqlite::params![hook.as_str(), &args_s, ActionStatus::Pending.as_str()],
                row_to_action,
            )
            .optional()?;
        Ok(action)
    }

    async fn due_actions(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledAction>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, hook, args, scheduled_at, status FROM scheduled_actions
             WHERE status = ?1 AND scheduled_at <= ?2
             ORDER BY scheduled_at, id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                ActionStatus::Pending.as_str(),
                to_db_string(&now),
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            row_to_action,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn mark_complete(&self, id: i64) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE scheduled_actions SET status = ?1 WHERE id = ?2",
            rusqlite::params![ActionStatus::Complete.as_str(), id],
        )?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE scheduled_actions SET status = ?1, last_error = ?2 WHERE id = ?3",
            rusqlite::params![ActionStatus::Failed.as_str(), message, id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    #[tokio::test]
    async fn rescheduling_replaces_the_pending_action() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let args = ActionArgs::Subscription { subscription_id: 1 };

        db.schedule_at(t0, ScheduledHook::PaymentDue, args).await.unwrap();
        let second = db
            .schedule_at(t0 + Duration::days(30), ScheduledHook::PaymentDue, args)
            .await
            .unwrap();

        let next = db
            .next_scheduled(ScheduledHook::PaymentDue, args)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, second);
        assert!(db.due_actions(t0 + Duration::days(1), 10).await.unwrap().is_empty());

        let due = db.due_actions(t0 + Duration::days(31), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].args, args);

        db.mark_complete(second).await.unwrap();
        assert!(db.due_actions(t0 + Duration::days(31), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unschedule_only_touches_matching_args() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        db.schedule_at(t0, ScheduledHook::PaymentRetry, ActionArgs::Order { order_id: 1 })
            .await
            .unwrap();
        db.schedule_at(t0, ScheduledHook::PaymentRetry, ActionArgs::Order { order_id: 2 })
            .await
            .unwrap();

        let removed = db
            .unschedule(ScheduledHook::PaymentRetry, ActionArgs::Order { order_id: 1 })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let due = db.due_actions(t0, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].args, ActionArgs::Order { order_id: 2 });
    }
}
