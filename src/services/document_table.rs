//! DocumentTable: JSON documents and named locks persisted in SQLite.
//!
//! Ids are path-like (`/job-assignments/{uuid}`, `/restore-work-items/...`,
//! `{jobId}/file-copier-state-0`) and `query` pages through every document
//! whose id starts with a given prefix, in id order.

use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{Row, SqlitePool};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("document `{id}` is not valid json: {source}")]
    Json {
        id: String,
        source: serde_json::Error,
    },
    #[error("timed out waiting for lock `{0}`")]
    LockTimeout(String),
}

pub type TableResult<T> = Result<T, TableError>;

/// One page of a prefix query.
#[derive(Debug)]
pub struct QueryPage<T> {
    pub results: Vec<T>,
    pub next_page_start_token: Option<String>,
}

#[derive(Clone)]
pub struct DocumentTable {
    pub db: Arc<SqlitePool>,
}

impl DocumentTable {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema, one statement at a time.
    pub async fn migrate(&self) -> TableResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> TableResult<Option<T>> {
        let row = sqlx::query("SELECT value FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        row.map(|row| decode(id, row.get::<String, _>("value")))
            .transpose()
    }

    pub async fn put<T: Serialize>(&self, id: &str, value: &T) -> TableResult<()> {
        let json = serde_json::to_string(value).map_err(|source| TableError::Json {
            id: id.to_string(),
            source,
        })?;

        sqlx::query(
            "INSERT INTO documents (id, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(json)
        .bind(Utc::now().timestamp_millis())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Returns whether a document was removed.
    pub async fn delete(&self, id: &str) -> TableResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Documents whose id starts with `prefix`, ordered by id.
    ///
    /// `page_start_token` is the id of the last document of the previous page.
    pub async fn query<T: DeserializeOwned>(
        &self,
        prefix: &str,
        page_size: usize,
        page_start_token: Option<&str>,
    ) -> TableResult<QueryPage<T>> {
        let page_size = page_size.max(1);
        let rows = sqlx::query(
            "SELECT id, value FROM documents
             WHERE substr(id, 1, ?) = ? AND id > ?
             ORDER BY id
             LIMIT ?",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(page_start_token.unwrap_or(""))
        .bind(page_size as i64 + 1)
        .fetch_all(&*self.db)
        .await?;

        let has_more = rows.len() > page_size;
        let mut results = Vec::with_capacity(rows.len().min(page_size));
        let mut last_id = None;
        for row in rows.into_iter().take(page_size) {
            let id: String = row.get("id");
            results.push(decode(&id, row.get::<String, _>("value"))?);
            last_id = Some(id);
        }

        Ok(QueryPage {
            results,
            next_page_start_token: if has_more { last_id } else { None },
        })
    }

    /// Every document under `prefix`, following page tokens to the end.
    pub async fn query_all<T: DeserializeOwned>(&self, prefix: &str) -> TableResult<Vec<T>> {
        let mut all = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.query::<T>(prefix, 100, token.as_deref()).await?;
            all.extend(page.results);
            match page.next_page_start_token {
                Some(next) => token = Some(next),
                None => return Ok(all),
            }
        }
    }

    pub fn create_mutex(
        &self,
        name: impl Into<String>,
        holder: impl Into<String>,
        lock_timeout: Duration,
    ) -> TableMutex {
        TableMutex {
            table: self.clone(),
            name: name.into(),
            holder: holder.into(),
            lock_timeout,
        }
    }
}

fn decode<T: DeserializeOwned>(id: &str, value: String) -> TableResult<T> {
    serde_json::from_str(&value).map_err(|source| TableError::Json {
        id: id.to_string(),
        source,
    })
}

/// Named lock shared by every process using the same table.
///
/// A lock is held by `holder` until it is released or until `lock_timeout`
/// elapses, after which any other holder may take it over.
pub struct TableMutex {
    table: DocumentTable,
    name: String,
    holder: String,
    lock_timeout: Duration,
}

impl TableMutex {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lock if it is free, expired or already ours.
    pub async fn try_lock(&self) -> TableResult<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lock_timeout.as_millis() as i64;

        let result = sqlx::query(
            "INSERT INTO mutexes (name, holder, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE mutexes.expires_at < ? OR mutexes.holder = excluded.holder",
        )
        .bind(&self.name)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(&*self.table.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Wait for the lock, giving up after `lock_timeout`.
    pub async fn lock(&self) -> TableResult<()> {
        let give_up_at = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            if self.try_lock().await? {
                debug!(lock = %self.name, holder = %self.holder, "lock acquired");
                return Ok(());
            }
            if tokio::time::Instant::now() >= give_up_at {
                return Err(TableError::LockTimeout(self.name.clone()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    pub async fn unlock(&self) -> TableResult<()> {
        sqlx::query("DELETE FROM mutexes WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(&*self.table.db)
            .await?;
        debug!(lock = %self.name, holder = %self.holder, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_table;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn put_get_delete() {
        let table = memory_table().await;
        table.put("/docs/1", &json!({"a": 1})).await.unwrap();
        table.put("/docs/1", &json!({"a": 2})).await.unwrap();

        let doc: Option<Value> = table.get("/docs/1").await.unwrap();
        assert_eq!(doc, Some(json!({"a": 2})));

        assert!(table.delete("/docs/1").await.unwrap());
        assert!(!table.delete("/docs/1").await.unwrap());
        assert!(table.get::<Value>("/docs/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_pages_by_prefix() {
        let table = memory_table().await;
        for i in 0..5 {
            table.put(&format!("/items/{i}"), &json!(i)).await.unwrap();
        }
        table.put("/other/1", &json!(99)).await.unwrap();

        let first = table.query::<i64>("/items/", 3, None).await.unwrap();
        assert_eq!(first.results, vec![0, 1, 2]);
        let token = first.next_page_start_token.expect("more pages");

        let second = table.query::<i64>("/items/", 3, Some(&token)).await.unwrap();
        assert_eq!(second.results, vec![3, 4]);
        assert!(second.next_page_start_token.is_none());

        let all = table.query_all::<i64>("/items/").await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn mutex_excludes_other_holders_until_released() {
        let table = memory_table().await;
        let a = table.create_mutex("monitor", "a", Duration::from_secs(60));
        let b = table.create_mutex("monitor", "b", Duration::from_secs(60));

        assert!(a.try_lock().await.unwrap());
        assert!(a.try_lock().await.unwrap());
        assert!(!b.try_lock().await.unwrap());

        a.unlock().await.unwrap();
        assert!(b.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let table = memory_table().await;
        let a = table.create_mutex("restore", "a", Duration::from_millis(0));
        let b = table.create_mutex("restore", "b", Duration::from_secs(60));

        assert!(a.try_lock().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(b.try_lock().await.unwrap());
    }
}
