use std::sync::Arc;

use anyhow::{Context, Result};

use crate::chat::ChatScreen;
use crate::config::BackendConfig;
use crate::identity::IdentityWatch;
use crate::journal::{JournalPersistor, JournalScreen};
use crate::llm_client::{CompletionClient, LlmClient};
use crate::snippets::SnippetAggregator;
use crate::store::{DocumentStore, SqliteDocumentStore};
use crate::summarize::Summarizer;

/// Explicitly constructed service handles shared by every screen.
#[derive(Clone)]
pub struct DaybookRuntime {
    pub config: BackendConfig,
    pub store: Arc<dyn DocumentStore>,
    pub completion: Arc<dyn CompletionClient>,
}

pub struct DaybookRuntimeBuilder {
    config: BackendConfig,
    store: Option<Arc<dyn DocumentStore>>,
    completion: Option<Arc<dyn CompletionClient>>,
}

impl DaybookRuntimeBuilder {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            store: None,
            completion: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn build(self) -> Result<DaybookRuntime> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => {
                let store = SqliteDocumentStore::open(&config.database_path).with_context(|| {
                    format!("Failed to open document store at {}", config.database_path)
                })?;
                tracing::info!("Document store opened at {}", config.database_path);
                Arc::new(store)
            }
        };

        let completion = match self.completion {
            Some(completion) => completion,
            None => {
                if !config.has_api_key() {
                    tracing::warn!(
                        "No LLM API key configured; completions will be rejected by {}",
                        config.llm_api_url
                    );
                }
                let client = LlmClient::from_config(&config)?;
                tracing::info!("Completion client ready (model: {})", client.model());
                Arc::new(client)
            }
        };

        Ok(DaybookRuntime {
            config,
            store,
            completion,
        })
    }
}

impl DaybookRuntime {
    pub fn bootstrap(config: BackendConfig) -> Result<Self> {
        DaybookRuntimeBuilder::new(config).build()
    }

    pub fn persistor(&self) -> JournalPersistor {
        JournalPersistor::new(self.store.clone())
    }

    pub fn summarizer(&self) -> Summarizer {
        Summarizer::new(
            SnippetAggregator::new(self.store.clone()),
            self.completion.clone(),
        )
    }

    pub fn chat_screen(&self, identity: IdentityWatch) -> ChatScreen {
        ChatScreen::new(self.completion.clone(), self.summarizer(), identity)
    }

    pub fn journal_screen(&self, identity: IdentityWatch) -> JournalScreen {
        JournalScreen::new(self.persistor(), identity)
    }
}
