//! Identity-partitioned document store.
//!
//! Documents are schemaless JSON objects living under a collection path such
//! as `users/{identity}/journals`. Stores support an append, an unfiltered
//! listing, a range query over the `createdAt` field, and a change feed that
//! live readers subscribe to.
//!
//! `createdAt` is whatever the writer put there. Our own writers always use
//! RFC 3339 text with millisecond precision, but documents written by other
//! clients may carry epoch milliseconds or `{seconds, nanoseconds}` objects,
//! which a store-side range query will not match. Readers that must not miss
//! data parse timestamps with [`parse_timestamp`].

pub mod sqlite;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::identity::Identity;

pub use sqlite::SqliteDocumentStore;

pub const CREATED_AT_FIELD: &str = "createdAt";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn journals(identity: &Identity) -> Self {
        Self(format!("users/{}/journals", identity.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Value,
}

impl Document {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.fields.get(CREATED_AT_FIELD).and_then(parse_timestamp)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub collection: CollectionPath,
    pub document_id: String,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Append a document and return the id the store assigned to it.
    async fn add(&self, collection: &CollectionPath, fields: Value) -> Result<String>;

    /// Every document in the collection, in insertion order.
    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>>;

    /// Documents whose `createdAt` the store itself places within `[start, end]`.
    async fn query_created_between(
        &self,
        collection: &CollectionPath,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Document>>;

    /// Change feed covering every collection in the store.
    fn changes(&self) -> broadcast::Receiver<StoreChange>;
}

/// Canonical `createdAt` text: UTC, millisecond precision, `Z` suffix.
/// Fixed width, so lexical and chronological order agree.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
        }
        _ => None,
    }
}
