//! Service configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::chat::DEFAULT_MAX_STEPS;
use crate::error::ConfigError;
use crate::llm::{DEFAULT_BASE_URL, LlmConfig};

/// Runtime configuration for the HTTP service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Provider credential. The service still boots without it; chat turns
    /// then fail with a configuration error.
    pub openai_api_key: Option<SecretString>,
    pub openai_base_url: String,
    /// Chat model.
    pub model: String,
    pub embedding_model: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Model round trips allowed per turn (at least 1).
    pub max_steps: usize,
    /// Minimum cosine similarity for a document to be included.
    pub match_threshold: f32,
    /// Documents included per turn.
    pub match_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            port: 3000,
            db_path: PathBuf::from("./data/localdesk.db"),
            max_steps: DEFAULT_MAX_STEPS,
            match_threshold: 0.7,
            match_count: 5,
        }
    }
}

impl ServerConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup. Unset or blank variables take
    /// their default; unparsable numbers fall back with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            openai_api_key: get("OPENAI_API_KEY").map(SecretString::from),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            model: get("LOCALDESK_MODEL").unwrap_or(defaults.model),
            embedding_model: get("LOCALDESK_EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            port: parse_or("LOCALDESK_PORT", get("LOCALDESK_PORT"), defaults.port),
            db_path: get("LOCALDESK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            max_steps: parse_or(
                "LOCALDESK_MAX_STEPS",
                get("LOCALDESK_MAX_STEPS"),
                defaults.max_steps,
            )
            .max(1),
            match_threshold: parse_or(
                "LOCALDESK_MATCH_THRESHOLD",
                get("LOCALDESK_MATCH_THRESHOLD"),
                defaults.match_threshold,
            ),
            match_count: parse_or(
                "LOCALDESK_MATCH_COUNT",
                get("LOCALDESK_MATCH_COUNT"),
                defaults.match_count,
            ),
        }
    }

    /// Provider settings, when a credential is configured.
    pub fn llm_config(&self) -> Option<LlmConfig> {
        let api_key = self.openai_api_key.clone()?;
        Some(LlmConfig {
            api_key,
            model: self.model.clone(),
            embedding_model: self.embedding_model.clone(),
            base_url: self.openai_base_url.clone(),
        })
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            let err = ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            };
            tracing::warn!(error = %err, "Using default");
            default
        }
    }
}
