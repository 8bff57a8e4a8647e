use anyhow::{Context, Result};
use daybook_backend::config::BackendConfig;
use daybook_backend::runtime::DaybookRuntime;
use daybook_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,daybook_backend=debug")),
        )
        .init();

    let config = BackendConfig::load();

    tracing::info!(
        "Starting daybook backend (set DAYBOOK_BACKEND_TOKEN + optional DAYBOOK_BACKEND_BIND; auth mode via DAYBOOK_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async {
        let runtime = DaybookRuntime::bootstrap(config)
            .context("failed to bootstrap daybook runtime")?;
        serve_backend(runtime).await
    })
}
