//! OpenAI client configuration with sensible defaults.

use crate::error::{Result, RettelseError};
use async_openai::{config::OpenAIConfig, Client};
use std::time::Duration;

/// Create an OpenAI client for `config` with a custom timeout.
///
/// The client never retries on its own: rate limits must reach the caller's
/// cascade as errors so it can switch models.
pub fn create_client_with_config(config: OpenAIConfig, timeout: Duration) -> Result<Client<OpenAIConfig>> {
    let http_client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RettelseError::OpenAI(format!("Failed to create HTTP client: {}", e)))?;

    let no_retry = backoff::ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build();

    Ok(Client::with_config(config)
        .with_http_client(http_client)
        .with_backoff(no_retry))
}
