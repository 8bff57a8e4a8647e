use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Params};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    format_timestamp, CollectionPath, Document, DocumentStore, StoreChange, CREATED_AT_FIELD,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Embedded document store backed by a single SQLite table.
///
/// The `created_at` column has no declared type, so it keeps whatever SQLite
/// storage class the writer's `createdAt` mapped to. Range queries compare it
/// as text, which is exactly how a type mismatch hides documents from them.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteDocumentStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Document store lock poisoned: {}", e))
    }

    /// Create or open the store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open document store at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            changes,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                collection TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at,
                inserted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_collection_created
                ON documents(collection, created_at);"#,
        )
        .context("Failed to create document store schema")?;
        Ok(())
    }

    /// Number of live change-feed receivers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn query_documents<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Document>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let documents = stmt
            .query_map(params, |row| {
                let fields_raw: String = row.get(1)?;
                let fields = serde_json::from_str(&fields_raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(Document {
                    id: row.get(0)?,
                    fields,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(documents)
    }
}

/// Map `createdAt` onto the SQLite storage class a naive writer would produce.
fn created_at_column(fields: &Value) -> SqlValue {
    match fields.get(CREATED_AT_FIELD) {
        Some(Value::String(raw)) => SqlValue::Text(raw.clone()),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Some(Value::Null) | None => SqlValue::Null,
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn add(&self, collection: &CollectionPath, fields: Value) -> Result<String> {
        if !fields.is_object() {
            anyhow::bail!("Document fields for {} must be a JSON object", collection);
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let body = serde_json::to_string(&fields).context("Failed to serialize document")?;

        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO documents (id, collection, fields, created_at, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    collection.as_str(),
                    body,
                    created_at_column(&fields),
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert document into {}", collection))?;
        }

        tracing::debug!("Added document {} to {}", id, collection);
        // No receivers just means nobody is watching right now.
        let _ = self.changes.send(StoreChange {
            collection: collection.clone(),
            document_id: id.clone(),
        });
        Ok(id)
    }

    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>> {
        self.query_documents(
            "SELECT id, fields FROM documents WHERE collection = ?1 ORDER BY seq ASC",
            [collection.as_str()],
        )
        .with_context(|| format!("Failed to list {}", collection))
    }

    async fn query_created_between(
        &self,
        collection: &CollectionPath,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        self.query_documents(
            "SELECT id, fields FROM documents
             WHERE collection = ?1 AND created_at >= ?2 AND created_at <= ?3
             ORDER BY created_at ASC, seq ASC",
            params![
                collection.as_str(),
                format_timestamp(start),
                format_timestamp(end)
            ],
        )
        .with_context(|| format!("Failed to query {} by createdAt", collection))
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn journals(user: &str) -> CollectionPath {
        CollectionPath::journals(&Identity::new(user).unwrap())
    }

    #[tokio::test]
    async fn add_and_list_preserve_insertion_order_per_partition() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let first = store
            .add(&journals("u1"), json!({"text": "first"}))
            .await
            .unwrap();
        store
            .add(&journals("u2"), json!({"text": "other user"}))
            .await
            .unwrap();
        let second = store
            .add(&journals("u1"), json!({"text": "second"}))
            .await
            .unwrap();

        let docs = store.list(&journals("u1")).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(docs[1].str_field("text"), Some("second"));
    }

    #[tokio::test]
    async fn rejects_non_object_documents() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        assert!(store.add(&journals("u1"), json!("bare")).await.is_err());
    }

    #[tokio::test]
    async fn range_query_only_sees_canonical_text_timestamps() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let path = journals("u1");

        store
            .add(&path, json!({"text": "text", "createdAt": format_timestamp(noon)}))
            .await
            .unwrap();
        store
            .add(&path, json!({"text": "millis", "createdAt": noon.timestamp_millis()}))
            .await
            .unwrap();
        store
            .add(&path, json!({"text": "none"}))
            .await
            .unwrap();

        let found = store
            .query_created_between(&path, noon - Duration::hours(1), noon + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].str_field("text"), Some("text"));
        assert_eq!(store.list(&path).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn range_query_bounds_are_inclusive() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let end = start + Duration::milliseconds(86_399_999);
        let path = journals("u1");

        for (label, ts) in [
            ("start", start),
            ("end", end),
            ("after", end + Duration::milliseconds(1)),
        ] {
            store
                .add(&path, json!({"text": label, "createdAt": format_timestamp(ts)}))
                .await
                .unwrap();
        }

        let found = store.query_created_between(&path, start, end).await.unwrap();
        let labels: Vec<_> = found.iter().filter_map(|d| d.str_field("text")).collect();
        assert_eq!(labels, vec!["start", "end"]);
    }

    #[tokio::test]
    async fn add_publishes_change() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let mut rx = store.changes();
        assert_eq!(store.subscriber_count(), 1);

        let id = store
            .add(&journals("u1"), json!({"text": "hello"}))
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.collection, journals("u1"));
        assert_eq!(change.document_id, id);
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daybook.db");
        {
            let store = SqliteDocumentStore::open(&path).unwrap();
            store
                .add(&journals("u1"), json!({"text": "kept"}))
                .await
                .unwrap();
        }
        let store = SqliteDocumentStore::open(&path).unwrap();
        let docs = store.list(&journals("u1")).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].str_field("text"), Some("kept"));
    }
}
