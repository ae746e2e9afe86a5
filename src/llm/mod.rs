//! LLM integration.
//!
//! `provider` defines the streaming `LlmProvider` trait and the message types
//! shared with the chat loop. `openai` implements it (and `Embedder`) against
//! any OpenAI-compatible Chat Completions endpoint.

pub mod openai;
pub mod provider;

pub use openai::{DEFAULT_BASE_URL, OpenAiProvider};
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Upper bound on a single provider call, including the whole stream.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub embedding_model: String,
    pub base_url: String,
}

/// Create the OpenAI provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<OpenAiProvider>, LlmError> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "openai".to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })?;

    tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI provider");
    let provider = OpenAiProvider::new(
        client,
        config.api_key.clone(),
        &config.model,
        &config.embedding_model,
    )
    .with_base_url(&config.base_url);
    Ok(Arc::new(provider))
}
