mod api;
mod console;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use api::ApiClient;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,daybook=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let api_client = ApiClient::from_env();

    tracing::info!("Backend API: {}", api_client.base_url());
    if std::env::var("DAYBOOK_BACKEND_TOKEN")
        .ok()
        .map(|token| token.trim().is_empty())
        .unwrap_or(true)
    {
        tracing::warn!(
            "DAYBOOK_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }
    if api_client.user().is_none() {
        tracing::warn!("DAYBOOK_USER is unset; journal actions need /user <id> first");
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start client runtime")?;
    rt.block_on(console::run(api_client))
}
