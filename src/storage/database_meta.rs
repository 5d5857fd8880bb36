use async_trait::async_trait;
use rusqlite::OptionalExtension;

use crate::error::Result;
use crate::meta::{EntityKind, MetaStore};
use crate::storage::database::Database;

fn like_prefix(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}%")
}

#[async_trait]
impl MetaStore for Database {
    async fn get_meta(&self, kind: EntityKind, id: i64, key: &str) -> Result<Option<String>> {
        let conn = self.connection.lock().await;
        let value = conn
            .query_row(
                "SELECT meta_value FROM entity_meta
                 WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3
                 ORDER BY id LIMIT 1",
                rusqlite::params![kind.as_str(), id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn get_meta_values(&self, kind: EntityKind, id: i64, key: &str) -> Result<Vec<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT meta_value FROM entity_meta
             WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![kind.as_str(), id, key], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn set_meta(&self, kind: EntityKind, id: i64, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entity_meta WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3",
            rusqlite::params![kind.as_str(), id, key],
        )?;
        tx.execute(
            "INSERT INTO entity_meta (entity_kind, entity_id, meta_key, meta_value) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![kind.as_str(), id, key, value],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn add_meta_value(&self, kind: EntityKind, id: i64, key: &str, value: &str) -> Result<bool> {
        let conn = self.connection.lock().await;
        let rows = conn.execute(
            "INSERT INTO entity_meta (entity_kind, entity_id, meta_key, meta_value)
             SELECT ?1, ?2, ?3, ?4
             WHERE NOT EXISTS (
                SELECT 1 FROM entity_meta
                WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3 AND meta_value = ?4
             )",
            rusqlite::params![kind.as_str(), id, key, value],
        )?;
        Ok(rows > 0)
    }

    async fn delete_meta(
        &self,
        kind: EntityKind,
        id: i64,
        key: &str,
        value: Option<&str>,
    ) -> Result<u64> {
        let conn = self.connection.lock().await;
        let rows = match value {
            Some(value) => conn.execute(
                "DELETE FROM entity_meta
                 WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3 AND meta_value = ?4",
                rusqlite::params![kind.as_str(), id, key, value],
            )?,
            None => conn.execute(
                "DELETE FROM entity_meta WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key = ?3",
                rusqlite::params![kind.as_str(), id, key],
            )?,
        };
        Ok(rows as u64)
    }

    async fn find_entity_ids(&self, kind: EntityKind, key: &str, value: &str) -> Result<Vec<i64>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity_id FROM entity_meta
             WHERE entity_kind = ?1 AND meta_key = ?2 AND meta_value = ?3
             ORDER BY entity_id DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![kind.as_str(), key, value], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn list_meta(&self, kind: EntityKind, id: i64, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT meta_key, meta_value FROM entity_meta
             WHERE entity_kind = ?1 AND entity_id = ?2 AND meta_key LIKE ?3 ESCAPE '\\'
             ORDER BY meta_key, id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![kind.as_str(), id, like_prefix(prefix)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn scan_meta(&self, kind: EntityKind, prefix: &str) -> Result<Vec<(i64, String, String)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT entity_id, meta_key, meta_value FROM entity_meta
             WHERE entity_kind = ?1 AND meta_key LIKE ?2 ESCAPE '\\'
             ORDER BY meta_key, id",
        )?;
        let rows = stmt.query_map(rusqlite::params![kind.as_str(), like_prefix(prefix)], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
