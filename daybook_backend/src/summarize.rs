use std::sync::Arc;

use chrono::{Local, NaiveDate, SecondsFormat};
use serde::Serialize;

use crate::chat::ChatTurn;
use crate::identity::Identity;
use crate::llm_client::{CompletionClient, Message};
use crate::snippets::{DayBounds, Snippet, SnippetAggregator};

pub const SUMMARY_INSTRUCTION: &str = "Please combine these snippets into a single journal entry for the day. \
Write it in the first person as a reflective diary entry that captures the key moments and how the day felt.";

pub const SIGN_IN_NOTICE: &str = "Please sign in to summarize today's snippets.";

/// What a summarization attempt produced. Every variant renders to exactly
/// one assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryOutcome {
    Summary { text: String, snippet_count: usize },
    SignedOut,
    NoSnippets { notice: String },
    Failed { error: String },
}

impl SummaryOutcome {
    pub fn turn(&self) -> ChatTurn {
        match self {
            SummaryOutcome::Summary { text, .. } => ChatTurn::assistant(text.clone()),
            SummaryOutcome::SignedOut => ChatTurn::assistant(SIGN_IN_NOTICE),
            SummaryOutcome::NoSnippets { notice } => ChatTurn::assistant(notice.clone()),
            SummaryOutcome::Failed { error } => ChatTurn::assistant(format!(
                "Sorry, I couldn't summarize today's snippets: {}",
                error
            )),
        }
    }

    pub fn summary_text(&self) -> Option<&str> {
        match self {
            SummaryOutcome::Summary { text, .. } => Some(text),
            _ => None,
        }
    }
}

pub fn build_summary_prompt(snippets: &[Snippet]) -> String {
    let mut prompt = String::from("Here are my snippets from today:\n");
    for (index, snippet) in snippets.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", index + 1, snippet.text));
    }
    prompt.push('\n');
    prompt.push_str(SUMMARY_INSTRUCTION);
    prompt
}

#[derive(Clone)]
pub struct Summarizer {
    aggregator: SnippetAggregator,
    completion: Arc<dyn CompletionClient>,
}

impl Summarizer {
    pub fn new(aggregator: SnippetAggregator, completion: Arc<dyn CompletionClient>) -> Self {
        Self {
            aggregator,
            completion,
        }
    }

    pub async fn summarize_day(&self, identity: Option<&Identity>, day: NaiveDate) -> SummaryOutcome {
        self.summarize_within(identity, DayBounds::local(day)).await
    }

    pub async fn summarize_within(
        &self,
        identity: Option<&Identity>,
        bounds: DayBounds,
    ) -> SummaryOutcome {
        let Some(identity) = identity else {
            tracing::warn!("Summarize requested while signed out");
            return SummaryOutcome::SignedOut;
        };

        let snippets = match self.aggregator.fetch_within(Some(identity), bounds).await {
            Ok(snippets) => snippets,
            Err(error) => {
                tracing::error!("Snippet lookup for {} failed: {:#}", identity, error);
                return SummaryOutcome::Failed {
                    error: format!("{:#}", error),
                };
            }
        };

        if snippets.is_empty() {
            let checked_at = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
            tracing::info!("No snippets for {} at {}", identity, checked_at);
            return SummaryOutcome::NoSnippets {
                notice: format!(
                    "No snippets found for today. (user: {}, checked at {})",
                    identity, checked_at
                ),
            };
        }

        let prompt = build_summary_prompt(&snippets);
        tracing::debug!(
            "Summarizing {} snippet(s) for {}",
            snippets.len(),
            identity
        );

        match self.completion.complete(&[Message::user(prompt)]).await {
            Ok(text) => SummaryOutcome::Summary {
                text,
                snippet_count: snippets.len(),
            },
            Err(error) => {
                tracing::error!("Summary completion for {} failed: {}", identity, error);
                SummaryOutcome::Failed {
                    error: error.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Sender;
    use crate::llm_client::Role;
    use crate::store::{format_timestamp, CollectionPath, DocumentStore, SqliteDocumentStore};
    use crate::testing::ScriptedCompletion;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn user() -> Identity {
        Identity::new("u1").unwrap()
    }

    fn bounds() -> DayBounds {
        DayBounds::in_timezone(NaiveDate::from_ymd_opt(2026, 6, 2).unwrap(), &Utc)
    }

    async fn seeded_store(texts: &[(&str, i64)]) -> Arc<SqliteDocumentStore> {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().unwrap());
        for (text, hour) in texts {
            store
                .add(
                    &CollectionPath::journals(&user()),
                    json!({
                        "text": text,
                        "createdAt": format_timestamp(bounds().start + Duration::hours(*hour)),
                    }),
                )
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn prompt_numbers_each_snippet_then_instructs() {
        let snippets: Vec<Snippet> = ["Had coffee", "Finished report", "Evening walk"]
            .iter()
            .enumerate()
            .map(|(i, text)| Snippet {
                id: i.to_string(),
                text: text.to_string(),
                created_at: Utc::now(),
            })
            .collect();

        let prompt = build_summary_prompt(&snippets);
        assert_eq!(
            prompt,
            format!(
                "Here are my snippets from today:\n1. Had coffee\n2. Finished report\n3. Evening walk\n\n{}",
                SUMMARY_INSTRUCTION
            )
        );
    }

    #[tokio::test]
    async fn summary_is_the_completion_verbatim() {
        // Stored out of order; the prompt lists them chronologically.
        let store = seeded_store(&[("Evening walk", 19), ("Had coffee", 8), ("Finished report", 15)]).await;
        let completion = Arc::new(ScriptedCompletion::replying("A calm, productive day."));
        let summarizer = Summarizer::new(SnippetAggregator::new(store), completion.clone());

        let outcome = summarizer.summarize_within(Some(&user()), bounds()).await;
        assert_eq!(
            outcome,
            SummaryOutcome::Summary {
                text: "A calm, productive day.".to_string(),
                snippet_count: 3,
            }
        );
        assert_eq!(outcome.turn().text, "A calm, productive day.");
        assert_eq!(outcome.turn().sender, Sender::Assistant);

        let calls = completion.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].role, Role::User);
        assert!(calls[0][0]
            .content
            .starts_with("Here are my snippets from today:\n1. Had coffee\n2. Finished report\n3. Evening walk\n"));
        assert!(calls[0][0].content.ends_with(SUMMARY_INSTRUCTION));
    }

    #[tokio::test]
    async fn signed_out_makes_no_calls() {
        let store = seeded_store(&[("Had coffee", 8)]).await;
        let completion = Arc::new(ScriptedCompletion::replying("unused"));
        let summarizer = Summarizer::new(SnippetAggregator::new(store), completion.clone());

        let outcome = summarizer.summarize_within(None, bounds()).await;
        assert_eq!(outcome, SummaryOutcome::SignedOut);
        assert_eq!(outcome.turn().text, SIGN_IN_NOTICE);
        assert_eq!(completion.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_day_reports_identity_and_skips_completion() {
        let store = seeded_store(&[]).await;
        let completion = Arc::new(ScriptedCompletion::replying("unused"));
        let summarizer = Summarizer::new(SnippetAggregator::new(store), completion.clone());

        let outcome = summarizer.summarize_within(Some(&user()), bounds()).await;
        match &outcome {
            SummaryOutcome::NoSnippets { notice } => {
                assert!(notice.starts_with("No snippets found for today."));
                assert!(notice.contains("user: u1"));
                assert!(notice.contains("checked at"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(completion.call_count(), 0);
    }

    #[tokio::test]
    async fn completion_failure_surfaces_the_cause() {
        let store = seeded_store(&[("Had coffee", 8)]).await;
        let completion = Arc::new(ScriptedCompletion::new());
        completion.push_failure("upstream overloaded");
        let summarizer = Summarizer::new(SnippetAggregator::new(store), completion);

        let outcome = summarizer.summarize_within(Some(&user()), bounds()).await;
        let turn = outcome.turn();
        assert!(matches!(outcome, SummaryOutcome::Failed { .. }));
        assert!(turn.text.starts_with("Sorry, I couldn't summarize"));
        assert!(turn.text.contains("upstream overloaded"));
        assert!(outcome.summary_text().is_none());
    }
}
