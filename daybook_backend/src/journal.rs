use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Local, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::{DaybookResult, ValidationError};
use crate::identity::{Identity, IdentityWatch};
use crate::screen::ActionGuard;
use crate::store::{format_timestamp, CollectionPath, Document, DocumentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("Unknown media type '{}'", other)),
        }
    }
}

/// Reference to media held elsewhere. Only the URI is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub text: String,
    pub date: String,
    pub time: String,
    pub created_at: DateTime<Utc>,
    pub media: Vec<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_uri: Option<String>,
}

/// Stored shape of an entry. Everything but `createdAt`, which is parsed
/// leniently from whatever the writer used.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredEntry {
    text: String,
    date: String,
    time: String,
    media: Vec<MediaAttachment>,
    audio_uri: Option<String>,
}

impl JournalEntry {
    fn from_document(doc: Document) -> Option<Self> {
        let Some(created_at) = doc.created_at() else {
            tracing::warn!("Journal entry {} has no readable createdAt", doc.id);
            return None;
        };
        let stored: StoredEntry = match serde_json::from_value(doc.fields) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Skipping malformed journal entry {}: {}", doc.id, e);
                return None;
            }
        };
        Some(Self {
            id: doc.id,
            text: stored.text,
            date: stored.date,
            time: stored.time,
            created_at,
            media: stored.media,
            audio_uri: stored.audio_uri,
        })
    }
}

/// What the user is composing on the journal screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JournalDraft {
    pub text: String,
    pub media: Vec<MediaAttachment>,
    pub audio_uri: Option<String>,
}

impl JournalDraft {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Images and videos join the media list; an audio recording replaces the
    /// draft's single audio reference.
    pub fn add_media(&mut self, kind: MediaKind, uri: impl Into<String>) {
        let uri = uri.into();
        match kind {
            MediaKind::Audio => self.audio_uri = Some(uri),
            MediaKind::Image | MediaKind::Video => {
                self.media.push(MediaAttachment { kind, uri })
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media.is_empty() && self.audio_uri.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone)]
pub struct JournalPersistor {
    store: Arc<dyn DocumentStore>,
}

impl JournalPersistor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn save(
        &self,
        identity: Option<&Identity>,
        draft: &JournalDraft,
    ) -> DaybookResult<JournalEntry> {
        if draft.is_empty() {
            return Err(ValidationError::EmptyEntry.into());
        }
        let Some(identity) = identity else {
            tracing::warn!("Journal save attempted while signed out");
            return Err(ValidationError::SignedOut.into());
        };

        let created_at = Utc::now().trunc_subsecs(3);
        let local = created_at.with_timezone(&Local);
        let date = local.format("%Y-%m-%d").to_string();
        let time = local.format("%H:%M").to_string();
        let text = draft.text.trim().to_string();

        let mut fields = serde_json::json!({
            "text": text,
            "date": date,
            "time": time,
            "createdAt": format_timestamp(created_at),
            "media": draft.media,
        });
        if let (Some(audio_uri), Value::Object(map)) = (&draft.audio_uri, &mut fields) {
            map.insert("audioUri".to_string(), Value::String(audio_uri.clone()));
        }

        let collection = CollectionPath::journals(identity);
        let id = self.store.add(&collection, fields).await?;
        tracing::info!("Saved journal entry {} to {}", id, collection);

        Ok(JournalEntry {
            id,
            text,
            date,
            time,
            created_at,
            media: draft.media.clone(),
            audio_uri: draft.audio_uri.clone(),
        })
    }

    /// Current entries, oldest first.
    pub async fn entries(&self, identity: &Identity) -> Result<Vec<JournalEntry>> {
        load_entries(self.store.as_ref(), &CollectionPath::journals(identity)).await
    }

    /// Subscribe to the identity's entries. The feed yields the current list
    /// first and a fresh list after every change to the partition. A reader
    /// that falls behind only sees the latest list.
    pub fn live_entries(&self, identity: &Identity) -> JournalFeed {
        let collection = CollectionPath::journals(identity);
        // Subscribe before the first load so no change slips between them.
        let mut changes = self.store.changes();
        let store = self.store.clone();
        let (tx, rx) = flume::bounded(1);
        let stale = rx.clone();

        let task = tokio::spawn(async move {
            let mut reload = true;
            loop {
                if reload {
                    match load_entries(store.as_ref(), &collection).await {
                        Ok(entries) => {
                            if !publish_latest(&tx, &stale, entries) {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Live reload of {} failed: {:#}", collection, e),
                    }
                }
                reload = match changes.recv().await {
                    Ok(change) => change.collection == collection,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Live feed for {} lagged by {}", collection, skipped);
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
            }
            tracing::debug!("Live feed for {} stopped", collection);
        });

        JournalFeed {
            snapshots: rx,
            task,
        }
    }
}

/// Hand `entries` to the feed, replacing any snapshot it has not read yet.
/// Returns false once the feed itself is gone.
fn publish_latest(
    tx: &flume::Sender<Vec<JournalEntry>>,
    stale: &flume::Receiver<Vec<JournalEntry>>,
    mut entries: Vec<JournalEntry>,
) -> bool {
    // `stale` is the task's own handle, so one receiver means no reader.
    if tx.receiver_count() <= 1 {
        return false;
    }
    loop {
        match tx.try_send(entries) {
            Ok(()) => return true,
            Err(flume::TrySendError::Full(latest)) => {
                let _ = stale.try_recv();
                entries = latest;
            }
            Err(flume::TrySendError::Disconnected(_)) => return false,
        }
    }
}

async fn load_entries(
    store: &dyn DocumentStore,
    collection: &CollectionPath,
) -> Result<Vec<JournalEntry>> {
    let docs = store.list(collection).await?;
    let mut entries: Vec<JournalEntry> = docs
        .into_iter()
        .filter_map(JournalEntry::from_document)
        .collect();
    entries.sort_by_key(|entry| entry.created_at);
    Ok(entries)
}

/// Live subscription handle. Dropping it releases the subscription.
pub struct JournalFeed {
    snapshots: flume::Receiver<Vec<JournalEntry>>,
    task: JoinHandle<()>,
}

impl JournalFeed {
    /// Next snapshot, or `None` once the store has shut down.
    pub async fn next(&mut self) -> Option<Vec<JournalEntry>> {
        self.snapshots.recv_async().await.ok()
    }

    pub fn try_next(&mut self) -> Option<Vec<JournalEntry>> {
        self.snapshots.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for JournalFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The journal screen: composes drafts and saves them for the signed-in user.
pub struct JournalScreen {
    persistor: JournalPersistor,
    identity: IdentityWatch,
    guard: ActionGuard,
}

impl JournalScreen {
    pub fn new(persistor: JournalPersistor, identity: IdentityWatch) -> Self {
        Self {
            persistor,
            identity,
            guard: ActionGuard::new(),
        }
    }

    pub fn is_saving(&self) -> bool {
        self.guard.is_busy()
    }

    pub async fn save(&self, draft: &JournalDraft) -> DaybookResult<JournalEntry> {
        let _busy = self.guard.try_begin()?;
        let identity = self.identity.current();
        self.persistor.save(identity.as_ref(), draft).await
    }

    pub async fn entries(&self) -> DaybookResult<Vec<JournalEntry>> {
        let identity = self.identity.current().ok_or(ValidationError::SignedOut)?;
        Ok(self.persistor.entries(&identity).await?)
    }

    pub fn live_entries(&self) -> DaybookResult<JournalFeed> {
        let identity = self.identity.current().ok_or(ValidationError::SignedOut)?;
        Ok(self.persistor.live_entries(&identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaybookError;
    use crate::store::SqliteDocumentStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn user() -> Identity {
        Identity::new("u1").unwrap()
    }

    fn persistor() -> (Arc<SqliteDocumentStore>, JournalPersistor) {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().unwrap());
        (store.clone(), JournalPersistor::new(store))
    }

    async fn wait_for_subscribers(store: &SqliteDocumentStore, expected: usize) {
        for _ in 0..100 {
            if store.subscriber_count() == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!(
            "expected {} subscribers, found {}",
            expected,
            store.subscriber_count()
        );
    }

    #[test]
    fn audio_counts_as_media_and_replaces_previous_recording() {
        let mut draft = JournalDraft::default();
        assert!(draft.is_empty());
        draft.add_media(MediaKind::Audio, "file:///a.m4a");
        draft.add_media(MediaKind::Audio, "file:///b.m4a");
        assert!(!draft.is_empty());
        assert!(draft.media.is_empty());
        assert_eq!(draft.audio_uri.as_deref(), Some("file:///b.m4a"));

        draft.add_media(MediaKind::Image, "file:///p.jpg");
        assert_eq!(draft.media[0].kind, MediaKind::Image);
        draft.clear();
        assert!(draft.is_empty());
    }

    #[test]
    fn media_kind_parses_case_insensitively() {
        assert_eq!("Video".parse::<MediaKind>(), Ok(MediaKind::Video));
        assert!("gif".parse::<MediaKind>().is_err());
    }

    #[tokio::test]
    async fn empty_draft_is_rejected_before_touching_the_store() {
        let (store, persistor) = persistor();
        let mut changes = store.changes();

        let err = persistor
            .save(Some(&user()), &JournalDraft::from_text("   "))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaybookError::Validation(ValidationError::EmptyEntry)
        ));
        // Empty-entry takes precedence over the missing identity.
        let err = persistor
            .save(None, &JournalDraft::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaybookError::Validation(ValidationError::EmptyEntry)
        ));

        assert!(changes.try_recv().is_err());
        assert!(persistor.entries(&user()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn signed_out_save_is_rejected() {
        let (_store, persistor) = persistor();
        let err = persistor
            .save(None, &JournalDraft::from_text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaybookError::Validation(ValidationError::SignedOut)
        ));
    }

    #[tokio::test]
    async fn saved_entry_round_trips_through_the_store() {
        let (_store, persistor) = persistor();
        let mut draft = JournalDraft::from_text("  Long walk by the river  ");
        draft.add_media(MediaKind::Image, "file:///river.jpg");
        draft.add_media(MediaKind::Audio, "file:///birds.m4a");

        let saved = persistor.save(Some(&user()), &draft).await.unwrap();
        assert_eq!(saved.text, "Long walk by the river");
        assert_eq!(saved.date.len(), 10);
        assert_eq!(saved.time.len(), 5);
        assert_eq!(saved.created_at.timestamp_subsec_nanos() % 1_000_000, 0);

        let entries = persistor.entries(&user()).await.unwrap();
        assert_eq!(entries, vec![saved]);
    }

    #[tokio::test]
    async fn entries_without_timestamps_are_skipped_and_rest_sorted() {
        let (store, persistor) = persistor();
        let collection = CollectionPath::journals(&user());
        let later = Utc.with_ymd_and_hms(2026, 5, 2, 9, 0, 0).unwrap();
        store
            .add(
                &collection,
                json!({"text": "later", "createdAt": format_timestamp(later)}),
            )
            .await
            .unwrap();
        store
            .add(&collection, json!({"text": "no timestamp"}))
            .await
            .unwrap();
        store
            .add(
                &collection,
                json!({"text": "earlier", "createdAt": (later - Duration::days(1)).timestamp_millis()}),
            )
            .await
            .unwrap();

        let texts: Vec<String> = persistor
            .entries(&user())
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.text)
            .collect();
        assert_eq!(texts, vec!["earlier", "later"]);
    }

    #[tokio::test]
    async fn live_feed_gains_external_entry_in_order() {
        let (store, persistor) = persistor();
        let collection = CollectionPath::journals(&user());
        let noon = Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap();
        for (text, offset) in [("morning", -3), ("evening", 6)] {
            store
                .add(
                    &collection,
                    json!({"text": text, "createdAt": format_timestamp(noon + Duration::hours(offset))}),
                )
                .await
                .unwrap();
        }

        let mut feed = persistor.live_entries(&user());
        let initial = feed.next().await.unwrap();
        assert_eq!(initial.len(), 2);

        // Another partition changing does not disturb this feed's contents.
        store
            .add(
                &CollectionPath::journals(&Identity::new("u2").unwrap()),
                json!({"text": "elsewhere", "createdAt": format_timestamp(noon)}),
            )
            .await
            .unwrap();
        store
            .add(
                &collection,
                json!({"text": "lunch", "createdAt": format_timestamp(noon)}),
            )
            .await
            .unwrap();

        let updated = feed.next().await.unwrap();
        let texts: Vec<&str> = updated.iter().map(|entry| entry.text.as_str()).collect();
        assert_eq!(texts, vec!["morning", "lunch", "evening"]);
    }

    #[tokio::test]
    async fn slow_reader_only_sees_the_latest_snapshot() {
        let (store, persistor) = persistor();
        let collection = CollectionPath::journals(&user());
        let mut feed = persistor.live_entries(&user());
        assert!(feed.next().await.unwrap().is_empty());

        let noon = Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap();
        for (text, offset) in [("one", 1), ("two", 2), ("three", 3)] {
            store
                .add(
                    &collection,
                    json!({"text": text, "createdAt": format_timestamp(noon + Duration::hours(offset))}),
                )
                .await
                .unwrap();
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let latest = feed.next().await.unwrap();
        let texts: Vec<&str> = latest.iter().map(|entry| entry.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(feed.try_next().is_none());
    }

    #[tokio::test]
    async fn dropping_the_feed_releases_the_subscription() {
        let (store, persistor) = persistor();
        let mut feed = persistor.live_entries(&user());
        assert_eq!(store.subscriber_count(), 1);
        assert!(feed.next().await.unwrap().is_empty());

        feed.unsubscribe();
        wait_for_subscribers(&store, 0).await;
    }

    #[tokio::test]
    async fn journal_screen_uses_current_identity() {
        let (_store, persistor) = persistor();
        let (publisher, watch) = crate::identity::identity_channel(None);
        let screen = JournalScreen::new(persistor, watch);

        assert!(matches!(
            screen.save(&JournalDraft::from_text("hi")).await,
            Err(DaybookError::Validation(ValidationError::SignedOut))
        ));

        publisher.sign_in(user());
        let saved = screen.save(&JournalDraft::from_text("hi")).await.unwrap();
        assert_eq!(screen.entries().await.unwrap(), vec![saved]);
        assert!(!screen.is_saving());
    }
}
