use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub fn build_http_client() -> Result<reqwest::Client> {
    build_http_client_with_timeout(None)
}

pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("DAYBOOK_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        // Proxy discovery can panic on some platforms; fall through to no_proxy.
        match std::panic::catch_unwind(|| attempt_build(timeout, false)) {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(error)) => tracing::warn!(
                "HTTP client initialization with system proxy failed ({}); retrying with no_proxy",
                error
            ),
            Err(_) => tracing::warn!(
                "HTTP client initialization with system proxy discovery panicked; retrying with no_proxy"
            ),
        }
    }

    match std::panic::catch_unwind(|| attempt_build(timeout, true)) {
        Ok(result) => result.context("Failed to initialize HTTP client"),
        Err(_) => Err(anyhow!(
            "Failed to initialize HTTP client (no_proxy fallback panicked)"
        )),
    }
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
