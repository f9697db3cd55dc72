//! Mistral through its OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use super::openai::ChatCompletions;
use super::{ProviderError, ProviderKind};
use crate::config::ProviderConfig;

pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const BASE_URL_ENV: &str = "MISTRAL_API_BASE_URL";

pub fn build(api_key: String, settings: &ProviderConfig, timeout: Duration) -> Result<ChatCompletions, ProviderError> {
    ChatCompletions::new(
        ProviderKind::Mistral,
        api_key,
        base_url(settings),
        settings,
        timeout,
    )
}

/// Environment first, then config, then the public endpoint.
fn base_url(settings: &ProviderConfig) -> String {
    std::env::var(BASE_URL_ENV)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .or_else(|| settings.base_url.clone())
        .unwrap_or_else(|| MISTRAL_BASE_URL.to_string())
}
