use anyhow::{Context, Result};
use daybook_backend::chat::ChatTurn;
use daybook_backend::journal::{JournalDraft, JournalEntry};
use daybook_backend::server::IDENTITY_HEADER;
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8797";

#[derive(Debug, Clone, Deserialize)]
pub struct SendReply {
    pub status: String,
    pub turn: Option<ChatTurn>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryReply {
    pub status: String,
    pub text: Option<String>,
    pub snippet_count: Option<usize>,
    pub notice: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeResponse {
    pub outcome: SummaryReply,
    pub entry: Option<JournalEntry>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
    user: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("DAYBOOK_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let token = non_empty_env("DAYBOOK_BACKEND_TOKEN");
        let user = non_empty_env("DAYBOOK_USER");

        Self::new(base, token, user)
    }

    pub fn new(base_url: String, token: Option<String>, user: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        let http = daybook_backend::http_client::build_http_client().unwrap_or_else(|error| {
            tracing::warn!("Falling back to a default HTTP client: {:#}", error);
            reqwest::Client::new()
        });

        Self {
            http,
            base_url: normalized_base,
            ws_url,
            token,
            user,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_user(&mut self, user: Option<String>) {
        self.user = user.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    }

    pub async fn open_session(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "/v1/sessions")
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/sessions failed")?
            .json::<SessionResponse>()
            .await
            .context("Failed to decode session response")?;
        Ok(response.session_id)
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/v1/sessions/{}", session_id),
        )
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("DELETE /v1/sessions/{} failed", session_id))?;
        Ok(())
    }

    pub async fn list_turns(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ChatTurn>> {
        let mut builder = self.request(
            reqwest::Method::GET,
            &format!("/v1/sessions/{}/turns", session_id),
        );
        if let Some(limit) = limit {
            builder = builder.query(&[("limit", limit)]);
        }
        builder
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET /v1/sessions/{}/turns failed", session_id))?
            .json::<Vec<ChatTurn>>()
            .await
            .context("Failed to decode chat turns")
    }

    pub async fn send_message(&self, session_id: &str, content: &str) -> Result<SendReply> {
        #[derive(Serialize)]
        struct SendMessageRequest<'a> {
            content: &'a str,
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/sessions/{}/messages", session_id),
            )
            .json(&SendMessageRequest { content })
            .send()
            .await?;
        decode(response, "send message").await
    }

    pub async fn summarize(&self, session_id: &str, save: bool) -> Result<SummarizeResponse> {
        #[derive(Serialize)]
        struct SummarizeRequest {
            save: bool,
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/sessions/{}/summarize", session_id),
            )
            .json(&SummarizeRequest { save })
            .send()
            .await?;
        decode(response, "summarize").await
    }

    pub async fn save_journal(&self, session_id: &str, draft: &JournalDraft) -> Result<JournalEntry> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/sessions/{}/journals", session_id),
            )
            .json(draft)
            .send()
            .await?;
        decode(response, "save journal entry").await
    }

    pub async fn list_journals(&self) -> Result<Vec<JournalEntry>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/journals")
            .send()
            .await?;
        decode(response, "list journal entries").await
    }

    pub async fn stream_journals_forever(self, tx: Sender<Vec<JournalEntry>>) {
        loop {
            match self.stream_journals_once(&tx).await {
                Ok(()) => {
                    if tx.is_disconnected() {
                        return;
                    }
                    tracing::info!("Journal stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Journal stream failed: {}; reconnecting in 2s", error);
                }
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_journals_once(&self, tx: &Sender<Vec<JournalEntry>>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/journals/live", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }
        if let Some(user) = self.user.as_deref() {
            let value = WsHeaderValue::from_str(user).context("Invalid user identifier")?;
            request.headers_mut().insert(IDENTITY_HEADER, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect journal stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            let snapshot = parse_snapshot(&text)?;
            if tx.send(snapshot).is_err() {
                return Ok(());
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(user) = self.user.as_deref() {
            builder = builder.header(IDENTITY_HEADER, user);
        }
        builder
    }
}

/// Decode a success body, or turn the backend's plain-text error body into
/// the error message.
async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    action: &str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = body.trim();
        anyhow::bail!(
            "Failed to {}: {}",
            action,
            if detail.is_empty() {
                status.to_string()
            } else {
                detail.to_string()
            }
        );
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("Failed to decode {} response", action))
}

fn parse_snapshot(text: &str) -> Result<Vec<JournalEntry>> {
    serde_json::from_str(text).context("Failed to decode journal snapshot")
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url(""), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(
            normalize_ws_url("http://127.0.0.1:8797"),
            "ws://127.0.0.1:8797"
        );
        assert_eq!(normalize_ws_url("https://example.com"), "wss://example.com");
    }

    #[test]
    fn set_user_ignores_blank_identifiers() {
        let mut client = ApiClient::new("http://127.0.0.1:8797/".to_string(), None, None);
        assert_eq!(client.base_url(), "http://127.0.0.1:8797");
        client.set_user(Some("  u1 ".to_string()));
        assert_eq!(client.user(), Some("u1"));
        client.set_user(Some("   ".to_string()));
        assert_eq!(client.user(), None);
    }

    #[test]
    fn summary_reply_decodes_each_status() {
        let payload = serde_json::json!({
            "outcome": {"status": "no_snippets", "notice": "No snippets found for today."}
        });
        let parsed: SummarizeResponse = serde_json::from_value(payload).expect("decode summary");
        assert_eq!(parsed.outcome.status, "no_snippets");
        assert!(parsed.outcome.text.is_none());
        assert!(parsed.entry.is_none());

        let payload = serde_json::json!({"status": "summary", "text": "A day.", "snippet_count": 2});
        let parsed: SummaryReply = serde_json::from_value(payload).expect("decode summary");
        assert_eq!(parsed.snippet_count, Some(2));
    }

    #[test]
    fn snapshot_decodes_backend_entries() {
        let text = r#"[{"id":"a","text":"hi","date":"2026-05-02","time":"09:00",
            "createdAt":"2026-05-02T09:00:00.000Z","media":[{"type":"image","uri":"file:///p.jpg"}]}]"#;
        let entries = parse_snapshot(text).expect("decode snapshot");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].audio_uri.is_none());
        assert_eq!(entries[0].media[0].uri, "file:///p.jpg");
    }
}
