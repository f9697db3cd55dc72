//! Classifier backends.
//!
//! Every backend turns a rendered prompt into raw text and runs it through
//! the shared `schema` validator, so all of them accept and reject exactly
//! the same responses.

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod mistral;
pub mod openai;
pub mod schema;

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Arc, time::Duration};

use crate::config::{Config, ProviderConfig};

/// Sampling temperature for every backend. Classification wants the most
/// repeatable output the backend can give.
pub const TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Claude,
    Mistral,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::Gemini,
        ProviderKind::Claude,
        ProviderKind::Mistral,
    ];

    /// Environment variable holding the API key.
    pub fn env_var(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Gemini => "GOOGLE_API_KEY",
            ProviderKind::Claude => "ANTHROPIC_API_KEY",
            ProviderKind::Mistral => "MISTRAL_API_KEY",
        }
    }

    fn settings(self, config: &Config) -> &ProviderConfig {
        match self {
            ProviderKind::OpenAi => &config.providers.openai,
            ProviderKind::Gemini => &config.providers.gemini,
            ProviderKind::Claude => &config.providers.claude,
            ProviderKind::Mistral => &config.providers.mistral,
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Claude => "claude",
            ProviderKind::Mistral => "mistral",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "mistral" => Ok(ProviderKind::Mistral),
            other => Err(format!(
                "unknown provider {other:?}, expected one of openai, gemini, claude, mistral"
            )),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
}

impl ProviderError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_) | ProviderError::Timeout(_) | ProviderError::Network(_)
        )
    }

    /// Short code stored in sub_cat_2 of fallback rows.
    pub fn reason_code(&self) -> String {
        match self {
            ProviderError::Auth(_) => "auth".into(),
            ProviderError::RateLimit(_) => "rate_limited".into(),
            ProviderError::Timeout(_) => "timeout".into(),
            ProviderError::Malformed(_) => "malformed_response".into(),
            ProviderError::Network(_) => "network".into(),
            ProviderError::Http { status, .. } => format!("http_{status}"),
        }
    }
}

/// Category path proposed for one keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub keyword: String,
    pub main_cat: String,
    pub sub_cat_1: String,
    pub sub_cat_2: String,
    pub theme: String,
}

#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    /// Display text of the keywords, in the order they appear in the prompt
    pub keywords: Vec<String>,
    pub language: String,
    /// Fully rendered prompt (template, taxonomy digest and keywords)
    pub prompt: String,
}

pub trait Classifier: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Largest chunk this backend should be sent.
    fn max_batch_keywords(&self) -> usize;

    /// One assignment per requested keyword, in request order.
    fn classify(&self, request: &ClassifyRequest) -> Result<Vec<Assignment>, ProviderError>;
}

/// Backends available to this process. A backend without credentials is
/// kept as an auth error so only that backend is unusable.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Result<Arc<dyn Classifier>, ProviderError>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut registry = Self::empty();

        for kind in ProviderKind::ALL {
            let entry = api_key(kind).and_then(|key| {
                let settings = kind.settings(config);
                let classifier: Arc<dyn Classifier> = match kind {
                    ProviderKind::OpenAi => Arc::new(openai::ChatCompletions::openai(key, settings, timeout)?),
                    ProviderKind::Mistral => Arc::new(mistral::build(key, settings, timeout)?),
                    ProviderKind::Gemini => Arc::new(gemini::GeminiClassifier::new(key, settings, timeout)?),
                    ProviderKind::Claude => Arc::new(anthropic::ClaudeClassifier::new(key, settings, timeout)?),
                };
                Ok(classifier)
            });

            match &entry {
                Ok(_) => log::debug!("provider={kind} outcome=ready"),
                Err(err) => log::debug!("provider={kind} outcome=unavailable reason={err}"),
            }
            registry.providers.insert(kind, entry);
        }

        registry
    }

    /// Register a backend explicitly, replacing whatever was there.
    pub fn with(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.providers.insert(classifier.kind(), Ok(classifier));
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Classifier>, ProviderError> {
        match self.providers.get(&kind) {
            Some(entry) => entry.clone(),
            None => Err(ProviderError::Auth(format!("{} is not set", kind.env_var()))),
        }
    }

    pub fn available(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| matches!(self.providers.get(k), Some(Ok(_))))
            .collect()
    }
}

fn api_key(kind: ProviderKind) -> Result<String, ProviderError> {
    std::env::var(kind.env_var())
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProviderError::Auth(format!("{} is not set", kind.env_var())))
}
