use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::chat::{ChatScreen, ChatTurn, SendOutcome};
use crate::error::{DaybookError, ValidationError};
use crate::identity::{Identity, IdentityWatch};
use crate::journal::{JournalDraft, JournalEntry, JournalFeed, JournalScreen};
use crate::runtime::DaybookRuntime;
use crate::summarize::SummaryOutcome;

/// Header the authenticating gateway uses to forward the signed-in user.
pub const IDENTITY_HEADER: &str = "x-daybook-user";

pub struct ServerState {
    pub runtime: DaybookRuntime,
    pub auth: BackendAuthConfig,
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
}

impl ServerState {
    pub fn new(runtime: DaybookRuntime, auth: BackendAuthConfig) -> Self {
        Self {
            runtime,
            auth,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn insert_session(&self, identity: Option<Identity>) -> (String, DateTime<Utc>) {
        let watch = IdentityWatch::fixed(identity.clone());
        let opened_at = Utc::now();
        let session = ClientSession {
            chat: self.runtime.chat_screen(watch.clone()),
            journal: self.runtime.journal_screen(watch),
            identity,
            last_active_ms: AtomicI64::new(opened_at.timestamp_millis()),
        };
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(session));
        (session_id, opened_at)
    }

    /// Close and drop every session last used before `cutoff`.
    pub async fn expire_idle_sessions(&self, cutoff: DateTime<Utc>) -> usize {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut expired = Vec::new();
        self.sessions.write().await.retain(|id, session| {
            let keep = session.last_active_ms() >= cutoff_ms;
            if !keep {
                expired.push((id.clone(), session.clone()));
            }
            keep
        });
        for (id, session) in &expired {
            session.chat.close();
            tracing::info!("Expired idle session {}", id);
        }
        expired.len()
    }
}

/// One connected client: its chat screen and journal screen, both bound to
/// the identity the session was opened with.
struct ClientSession {
    chat: ChatScreen,
    journal: JournalScreen,
    identity: Option<Identity>,
    last_active_ms: AtomicI64,
}

impl ClientSession {
    fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    /// A request may only act on a session opened for the same identity.
    fn check_identity(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if request_identity(headers)? != self.identity {
            return Err((
                StatusCode::FORBIDDEN,
                "session belongs to a different user".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CloseResponse {
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct ListTurnsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct SummarizeRequest {
    #[serde(default)]
    save: bool,
}

#[derive(Debug, Serialize)]
struct SummarizeResponse {
    outcome: SummaryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<JournalEntry>,
}

type ApiError = (StatusCode, String);

pub async fn serve_backend(runtime: DaybookRuntime) -> Result<()> {
    let bind_addr = std::env::var("DAYBOOK_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8797".to_string())
        .parse::<SocketAddr>()
        .context("Invalid DAYBOOK_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let idle_secs = runtime.config.session_idle_secs;
    let state = Arc::new(ServerState::new(runtime, auth));
    spawn_session_sweeper(state.clone(), idle_secs);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Daybook backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/sessions", post(open_session))
        .route("/sessions/:id", axum::routing::delete(close_session))
        .route("/sessions/:id/turns", get(list_turns))
        .route("/sessions/:id/messages", post(send_message))
        .route("/sessions/:id/summarize", post(summarize_today))
        .route("/sessions/:id/journals", post(save_journal))
        .route("/journals", get(list_journals))
        .route("/journals/live", get(live_journals_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

fn spawn_session_sweeper(state: Arc<ServerState>, idle_secs: u64) {
    if idle_secs == 0 {
        tracing::warn!("Session idle expiry disabled; sessions live until deleted");
        return;
    }
    let period = Duration::from_secs(idle_secs.clamp(1, 60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::seconds(idle_secs as i64);
            let expired = state.expire_idle_sessions(cutoff).await;
            if expired > 0 {
                tracing::debug!("Swept {} idle session(s)", expired);
            }
        }
    });
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("DAYBOOK_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("DAYBOOK_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "DAYBOOK_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid DAYBOOK_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

/// The forwarded identity. A missing header means signed out; a malformed
/// one is a client error.
fn request_identity(headers: &HeaderMap) -> Result<Option<Identity>, ApiError> {
    let Some(raw) = headers.get(IDENTITY_HEADER) else {
        return Ok(None);
    };
    let raw = raw.to_str().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("{} must be valid UTF-8", IDENTITY_HEADER),
        )
    })?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Identity::new(raw)
        .map(Some)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn require_identity(headers: &HeaderMap) -> Result<Identity, ApiError> {
    request_identity(headers)?.ok_or_else(|| daybook_error(ValidationError::SignedOut.into()))
}

fn daybook_error(error: DaybookError) -> ApiError {
    let status = match &error {
        DaybookError::Validation(ValidationError::SignedOut) => StatusCode::UNAUTHORIZED,
        DaybookError::Validation(_) => StatusCode::BAD_REQUEST,
        DaybookError::Busy => StatusCode::CONFLICT,
        DaybookError::Completion(_) => StatusCode::BAD_GATEWAY,
        DaybookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {:#}", error);
    }
    (status, error.to_string())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.runtime.config.llm_model.clone(),
    })
}

async fn open_session(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let (session_id, opened_at) = state.insert_session(request_identity(&headers)?).await;
    tracing::info!("Opened session {}", session_id);
    Ok(Json(SessionResponse {
        session_id,
        opened_at,
    }))
}

async fn close_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CloseResponse>, ApiError> {
    let session = {
        let mut sessions = state.sessions.write().await;
        let session = sessions
            .get(&session_id)
            .ok_or_else(|| not_found(format!("session '{}' not found", session_id)))?;
        session.check_identity(&headers)?;
        sessions.remove(&session_id)
    };
    let Some(session) = session else {
        return Err(not_found(format!("session '{}' not found", session_id)));
    };
    // Requests still holding the session finish, but their results are dropped.
    session.chat.close();
    tracing::info!("Closed session {}", session_id);
    Ok(Json(CloseResponse { closed: true }))
}

async fn list_turns(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ListTurnsQuery>,
) -> Result<Json<Vec<ChatTurn>>, ApiError> {
    let session = require_session(&state, &session_id, &headers).await?;
    let turns = session.chat.turns();
    let limit = clamp_limit(query.limit, turns.len().max(1), 1, 10_000);
    let skip = turns.len().saturating_sub(limit);
    Ok(Json(turns.into_iter().skip(skip).collect()))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    let session = require_session(&state, &session_id, &headers).await?;
    session
        .chat
        .send_message(&body.content)
        .await
        .map(Json)
        .map_err(daybook_error)
}

async fn summarize_today(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<SummarizeRequest>>,
) -> Result<Json<SummarizeResponse>, ApiError> {
    let session = require_session(&state, &session_id, &headers).await?;
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let outcome = session
        .chat
        .summarize_today()
        .await
        .map_err(daybook_error)?;

    let entry = match (request.save, outcome.summary_text()) {
        (true, Some(text)) => Some(
            session
                .journal
                .save(&JournalDraft::from_text(text))
                .await
                .map_err(daybook_error)?,
        ),
        _ => None,
    };
    Ok(Json(SummarizeResponse { outcome, entry }))
}

async fn save_journal(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(draft): Json<JournalDraft>,
) -> Result<Json<JournalEntry>, ApiError> {
    let session = require_session(&state, &session_id, &headers).await?;
    session
        .journal
        .save(&draft)
        .await
        .map(Json)
        .map_err(daybook_error)
}

async fn list_journals(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    let identity = require_identity(&headers)?;
    state
        .runtime
        .persistor()
        .entries(&identity)
        .await
        .map(Json)
        .map_err(|e| daybook_error(e.into()))
}

async fn live_journals_route(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let identity = require_identity(&headers)?;
    let feed = state.runtime.persistor().live_entries(&identity);
    Ok(ws.on_upgrade(move |socket| handle_live_socket(feed, socket)))
}

async fn handle_live_socket(mut feed: JournalFeed, mut socket: WebSocket) {
    loop {
        tokio::select! {
            snapshot = feed.next() => {
                let Some(entries) = snapshot else { break };
                let payload = match serde_json::to_string(&entries) {
                    Ok(serialized) => serialized,
                    Err(error) => {
                        tracing::warn!("Failed to serialize journal snapshot: {}", error);
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    feed.unsubscribe();
}

async fn require_session(
    state: &ServerState,
    session_id: &str,
    headers: &HeaderMap,
) -> Result<Arc<ClientSession>, ApiError> {
    let session = state
        .sessions
        .read()
        .await
        .get(session_id)
        .cloned()
        .ok_or_else(|| not_found(format!("session '{}' not found", session_id)))?;
    session.check_identity(headers)?;
    session.touch();
    Ok(session)
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, message)
}
