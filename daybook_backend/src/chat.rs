use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{DaybookResult, ValidationError};
use crate::identity::IdentityWatch;
use crate::llm_client::{CompletionClient, Message, Role};
use crate::screen::ActionGuard;
use crate::summarize::{Summarizer, SummaryOutcome};

pub const SEND_ERROR_TEXT: &str = "Error fetching response from the assistant.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub text: String,
    pub sender: Sender,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::User,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::Assistant,
        }
    }

    pub fn to_message(&self) -> Message {
        let role = match self.sender {
            Sender::User => Role::User,
            Sender::Assistant => Role::Assistant,
        };
        Message {
            role,
            content: self.text.clone(),
        }
    }
}

/// Append-only chat log for one screen session.
#[derive(Debug, Default)]
pub struct MessageStore {
    turns: RwLock<Vec<ChatTurn>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, turn: ChatTurn) {
        self.turns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(turn);
    }

    pub fn all(&self) -> Vec<ChatTurn> {
        self.turns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.turns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn history(&self) -> Vec<Message> {
        self.turns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(ChatTurn::to_message)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Replied { turn: ChatTurn },
    Failed { turn: ChatTurn, error: String },
    /// The screen closed while the request was in flight; nothing was appended.
    Discarded,
}

/// The chat screen: message log, loading state and the two actions a user
/// can trigger from it.
pub struct ChatScreen {
    messages: MessageStore,
    completion: Arc<dyn CompletionClient>,
    summarizer: Summarizer,
    identity: IdentityWatch,
    guard: ActionGuard,
    open: AtomicBool,
    today: fn() -> NaiveDate,
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

impl ChatScreen {
    pub fn new(
        completion: Arc<dyn CompletionClient>,
        summarizer: Summarizer,
        identity: IdentityWatch,
    ) -> Self {
        Self {
            messages: MessageStore::new(),
            completion,
            summarizer,
            identity,
            guard: ActionGuard::new(),
            open: AtomicBool::new(true),
            today: local_today,
        }
    }

    /// Override which calendar day "today" means.
    pub fn with_today(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.messages.all()
    }

    pub fn is_loading(&self) -> bool {
        self.guard.is_busy()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Tear the screen down. Requests still in flight finish, but their
    /// results are dropped instead of appended.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub async fn send_message(&self, input: &str) -> DaybookResult<SendOutcome> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let _busy = self.guard.try_begin()?;

        self.messages.append(ChatTurn::user(text));
        let history = self.messages.history();

        let outcome = match self.completion.complete(&history).await {
            Ok(reply) => {
                let turn = ChatTurn::assistant(reply);
                self.deliver(turn.clone())
                    .then(|| SendOutcome::Replied { turn })
            }
            Err(error) => {
                tracing::warn!("Chat completion failed: {}", error);
                let turn = ChatTurn::assistant(SEND_ERROR_TEXT);
                self.deliver(turn.clone()).then(|| SendOutcome::Failed {
                    turn,
                    error: error.to_string(),
                })
            }
        };
        Ok(outcome.unwrap_or(SendOutcome::Discarded))
    }

    /// Summarize today's snippets for the current identity and append the
    /// result (or a notice) as one assistant turn.
    pub async fn summarize_today(&self) -> DaybookResult<SummaryOutcome> {
        let _busy = self.guard.try_begin()?;

        let identity = self.identity.current();
        let outcome = self
            .summarizer
            .summarize_day(identity.as_ref(), (self.today)())
            .await;
        self.deliver(outcome.turn());
        Ok(outcome)
    }

    fn deliver(&self, turn: ChatTurn) -> bool {
        if !self.is_open() {
            tracing::debug!("Chat screen closed; dropping late {:?} turn", turn.sender);
            return false;
        }
        self.messages.append(turn);
        true
    }
}
