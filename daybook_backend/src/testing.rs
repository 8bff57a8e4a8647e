//! Fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm_client::{CompletionClient, CompletionError, Message};

/// Completion client that replays queued replies and records every history
/// it was asked to complete. An empty queue answers with a 502.
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(reply: &str) -> Self {
        let fake = Self::new();
        fake.push_reply(reply);
        fake
    }

    pub fn push_reply(&self, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(reply.to_string()));
    }

    pub fn push_failure(&self, body: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(body.to_string()));
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, history: &[Message]) -> Result<String, CompletionError> {
        self.calls.lock().unwrap().push(history.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(body)) => Err(CompletionError::Endpoint {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body,
            }),
            None => Err(CompletionError::Endpoint {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: "no scripted reply".to_string(),
            }),
        }
    }
}
