use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use crate::identity::Identity;
use crate::store::{CollectionPath, Document, DocumentStore};

const LAST_MILLI_OF_DAY: i64 = 86_399_999;
// Longest DST jump we step over when local midnight does not exist.
const MAX_GAP_MINUTES: i64 = 180;

/// Inclusive instant range covering one local calendar day:
/// midnight through 23:59:59.999.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayBounds {
    pub fn local(day: NaiveDate) -> Self {
        Self::in_timezone(day, &Local)
    }

    pub fn in_timezone<Tz: TimeZone>(day: NaiveDate, tz: &Tz) -> Self {
        let midnight = day.and_time(NaiveTime::MIN);
        let last_milli = midnight + Duration::milliseconds(LAST_MILLI_OF_DAY);
        Self {
            start: resolve_forward(tz, midnight),
            end: resolve_backward(tz, last_milli),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

fn resolve_forward<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    (0..=MAX_GAP_MINUTES)
        .find_map(|minutes| {
            tz.from_local_datetime(&(naive + Duration::minutes(minutes)))
                .earliest()
        })
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

fn resolve_backward<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    (0..=MAX_GAP_MINUTES)
        .find_map(|minutes| {
            tz.from_local_datetime(&(naive - Duration::minutes(minutes)))
                .latest()
        })
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snippet {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Snippet {
    fn from_document(document: &Document) -> Option<Self> {
        let text = document.str_field("text")?.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            id: document.id.clone(),
            text: text.to_string(),
            created_at: document.created_at()?,
        })
    }
}

/// Collects the text snippets an identity wrote on a given day.
#[derive(Clone)]
pub struct SnippetAggregator {
    store: Arc<dyn DocumentStore>,
}

impl SnippetAggregator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn fetch_for_day(
        &self,
        identity: Option<&Identity>,
        day: NaiveDate,
    ) -> Result<Vec<Snippet>> {
        self.fetch_within(identity, DayBounds::local(day)).await
    }

    /// Range query first; if that finds nothing, rescan the whole partition
    /// and filter client-side, since documents whose `createdAt` is not
    /// canonical text are invisible to the store's range comparison.
    /// Results are sorted ascending by creation time.
    pub async fn fetch_within(
        &self,
        identity: Option<&Identity>,
        bounds: DayBounds,
    ) -> Result<Vec<Snippet>> {
        let Some(identity) = identity else {
            tracing::warn!("No signed-in identity; skipping snippet lookup");
            return Ok(Vec::new());
        };
        let collection = CollectionPath::journals(identity);

        let primary = self
            .store
            .query_created_between(&collection, bounds.start, bounds.end)
            .await
            .with_context(|| format!("Failed to query snippets in {}", collection))?;
        let mut snippets = select_in_bounds(&primary, &bounds);

        if snippets.is_empty() {
            tracing::debug!(
                "Range query on {} returned nothing for {}..{}; scanning partition",
                collection,
                bounds.start,
                bounds.end
            );
            let all = self
                .store
                .list(&collection)
                .await
                .with_context(|| format!("Failed to scan snippets in {}", collection))?;
            snippets = select_in_bounds(&all, &bounds);
            if !snippets.is_empty() {
                tracing::warn!(
                    "Recovered {} snippet(s) from {} by client-side scan; createdAt types are inconsistent",
                    snippets.len(),
                    collection
                );
            }
        }

        snippets.sort_by_key(|snippet| snippet.created_at);
        Ok(snippets)
    }
}

fn select_in_bounds(documents: &[Document], bounds: &DayBounds) -> Vec<Snippet> {
    documents
        .iter()
        .filter_map(Snippet::from_document)
        .filter(|snippet| bounds.contains(snippet.created_at))
        .collect()
}
