use std::str::FromStr;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use rust_decimal::Decimal;

use crate::error::{Result, SubscriptionError};
use crate::meta::EntityKind;
use crate::storage::database::Database;
use crate::storage::time::{column_datetime, column_opt_datetime, to_db_string};
use crate::subscription::{
    BillingPeriod, DateType, DateUpdates, NewSubscription, PaymentMethodChange,
    PaymentMethodChangeOutcome, Subscription, SubscriptionDates, SubscriptionStatus,
    SubscriptionStore,
};

const SELECT_COLUMNS: &str = "id, customer_id, status, billing_interval, billing_period,
    date_start, date_trial_end, date_next_payment, date_end, date_last_order_created,
    date_payment_retry, date_cancelled, payment_method, total, currency, created_at";

pub(crate) fn column_decimal(idx: usize, s: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let status_s: String = row.get(2)?;
    let period_s: String = row.get(4)?;
    let total_s: String = row.get(13)?;
    let created_at_s: String = row.get(15)?;
    Ok(Subscription {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        status: SubscriptionStatus::parse(&status_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "status".into(), rusqlite::types::Type::Text)
        })?,
        billing_interval: row.get(3)?,
        billing_period: BillingPeriod::parse(&period_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(
                4,
                "billing_period".into(),
                rusqlite::types::Type::Text,
            )
        })?,
        dates: SubscriptionDates {
            start: column_opt_datetime(5, row.get(5)?)?,
            trial_end: column_opt_datetime(6, row.get(6)?)?,
            next_payment: column_opt_datetime(7, row.get(7)?)?,
            end: column_opt_datetime(8, row.get(8)?)?,
            last_order_date_created: column_opt_datetime(9, row.get(9)?)?,
            payment_retry: column_opt_datetime(10, row.get(10)?)?,
            cancelled: column_opt_datetime(11, row.get(11)?)?,
        },
        payment_method: row.get(12)?,
        total: column_decimal(13, &total_s)?,
        currency: row.get(14)?,
        created_at: column_datetime(15, &created_at_s)?,
    })
}

fn load(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Subscription>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM subscriptions WHERE id = ?1"),
        [id],
        row_to_subscription,
    )
    .optional()
}

fn write_dates(
    tx: &rusqlite::Transaction<'_>,
    id: i64,
    status: SubscriptionStatus,
    updates: &DateUpdates,
) -> Result<()> {
    if status.forbids_next_payment() {
        if let Some(Some(_)) = updates.get(&DateType::NextPayment) {
            return Err(SubscriptionError::InvalidArgument(format!(
                "subscription {id} is {status}, next payment must stay unset"
            )));
        }
    }
    for (date_type, value) in updates {
        tx.execute(
            &format!("UPDATE subscriptions SET {} = ?1 WHERE id = ?2", date_type.column()),
            rusqlite::params![value.as_ref().map(to_db_string), id],
        )?;
    }
    Ok(())
}

#[async_trait]
impl SubscriptionStore for Database {
    async fn create_subscription(&self, payload: NewSubscription) -> Result<Subscription> {
        if payload.billing_interval == 0 {
            return Err(SubscriptionError::InvalidArgument(
                "billing interval must be positive".into(),
            ));
        }
        let mut dates = payload.dates;
        if payload.status.forbids_next_payment() {
            dates.next_payment = None;
        }
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO subscriptions (customer_id, status, billing_interval, billing_period,
                date_start, date_trial_end, date_next_payment, date_end, date_last_order_created,
                date_payment_retry, date_cancelled, payment_method, total, currency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                payload.customer_id,
                payload.status.as_str(),
                payload.billing_interval,
                payload.billing_period.as_str(),
                dates.start.as_ref().map(to_db_string),
                dates.trial_end.as_ref().map(to_db_string),
                dates.next_payment.as_ref().map(to_db_string),
                dates.end.as_ref().map(to_db_string),
                dates.last_order_date_created.as_ref().map(to_db_string),
                dates.payment_retry.as_ref().map(to_db_string),
                dates.cancelled.as_ref().map(to_db_string),
                payload.payment_method,
                payload.total.to_string(),
                payload.currency,
                to_db_string(&payload.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        load(&conn, id)?.ok_or(SubscriptionError::SubscriptionNotFound(id))
    }

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
        let conn = self.connection.lock().await;
        Ok(load(&conn, id)?)
    }

    async fn update_status(
        &self,
        id: i64,
        expected: SubscriptionStatus,
        new_status: SubscriptionStatus,
        dates: &DateUpdates,
    ) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE subscriptions SET status = ?1 WHERE id = ?2 AND status = ?3",
            rusqlite::params![new_status.as_str(), id, expected.as_str()],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        write_dates(&tx, id, new_status, dates)?;
        tx.commit()?;
        Ok(true)
    }

    async fn update_dates(&self, id: i64, updates: &DateUpdates) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        let status_s: Option<String> = tx
            .query_row("SELECT status FROM subscriptions WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(status_s) = status_s else {
            return Err(SubscriptionError::SubscriptionNotFound(id));
        };
        let status = SubscriptionStatus::parse(&status_s)
            .ok_or_else(|| SubscriptionError::Config(format!("unknown status {status_s}")))?;
        write_dates(&tx, id, status, updates)?;
        tx.commit()?;
        Ok(())
    }

    async fn apply_payment_method_change(
        &self,
        id: i64,
        change: &PaymentMethodChange,
    ) -> Result<PaymentMethodChangeOutcome> {
        let mut conn = self.connection.lock().await;
        let applied = (|| -> rusqlite::Result<bool> {
            let tx = conn.transaction()?;
            let rows = tx.execute(
                "UPDATE subscriptions SET payment_method = ?1 WHERE id = ?2",
                rusqlite::params![&change.payment_method, id],
            )?;
            if rows == 0 {
                return Ok(false);
            }
            for (key, value) in &change.meta {
                tx.execute(
                    "DELETE FROM entity_meta WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3",
                    rusqlite::params![EntityKind::Subscription.as_str(), id, key],
                )?;
                tx.execute(
                    "INSERT INTO entity_meta (entity_kind, entity_id, meta_key, meta_value) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![EntityKind::Subscription.as_str(), id, key, value],
                )?;
            }
            tx.commit()?;
            Ok(true)
        })();

        match applied {
            Ok(true) => Ok(PaymentMethodChangeOutcome::Applied),
            Ok(false) => Err(SubscriptionError::SubscriptionNotFound(id)),
            Err(e) => {
                tracing::error!(
                    subscription_id = id,
                    payment_method = %change.payment_method,
                    "payment method change rolled back, reverting to manual: {}",
                    e
                );
                conn.execute(
                    "UPDATE subscriptions SET payment_method = '' WHERE id = ?1",
                    [id],
                )?;
                Ok(PaymentMethodChangeOutcome::RevertedToManual)
            }
        }
    }
}
