pub mod chat;
pub mod config;
pub mod error;
pub mod http_client;
pub mod identity;
pub mod journal;
pub mod llm_client;
pub mod runtime;
pub mod screen;
pub mod server;
pub mod snippets;
pub mod store;
pub mod summarize;

#[cfg(test)]
pub(crate) mod testing;
