use crate::storage::{self, StorageManager};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

const WORKERS: u16 = 4;
const CHUNK_SIZE: usize = 25;
const MAX_CHUNK_CHARS: usize = 4000;
const MAX_ATTEMPTS: u8 = 4;
const MAX_ATTEMPTS_LIMIT: u8 = 10;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 8000;
const REQUEST_TIMEOUT_SECS: u64 = 60;
/// Minimum Levenshtein ratio for two sibling names to be treated as the same category
const SIMILARITY_THRESHOLD: f32 = 0.9;
const MAX_EXEMPLARS: usize = 5;

/// Limits for the taxonomy digest handed to the classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DigestConfig {
    #[serde(default = "default_max_main")]
    pub max_main: usize,
    #[serde(default = "default_max_sub1")]
    pub max_sub1: usize,
    #[serde(default = "default_max_sub2")]
    pub max_sub2: usize,
    #[serde(default = "default_digest_exemplars")]
    pub max_exemplars: usize,

    /// Up to this many nodes the whole tree is listed; above it branches are sampled
    #[serde(default = "default_full_tree_threshold")]
    pub full_tree_threshold: usize,

    /// Hard cap on the rendered digest
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            max_main: default_max_main(),
            max_sub1: default_max_sub1(),
            max_sub2: default_max_sub2(),
            max_exemplars: default_digest_exemplars(),
            full_tree_threshold: default_full_tree_threshold(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_main() -> usize {
    15
}

fn default_max_sub1() -> usize {
    6
}

fn default_max_sub2() -> usize {
    6
}

fn default_digest_exemplars() -> usize {
    3
}

fn default_full_tree_threshold() -> usize {
    150
}

fn default_max_chars() -> usize {
    6000
}

/// Per-backend settings. The API key itself always comes from the environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub model: String,
    #[serde(default = "default_max_batch_keywords")]
    pub max_batch_keywords: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            max_batch_keywords: default_max_batch_keywords(),
            max_tokens: default_max_tokens(),
            base_url: None,
        }
    }
}

fn default_max_batch_keywords() -> usize {
    50
}

fn default_max_tokens() -> usize {
    4096
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai")]
    pub openai: ProviderConfig,
    #[serde(default = "default_gemini")]
    pub gemini: ProviderConfig,
    #[serde(default = "default_claude")]
    pub claude: ProviderConfig,
    #[serde(default = "default_mistral")]
    pub mistral: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: default_openai(),
            gemini: default_gemini(),
            claude: default_claude(),
            mistral: default_mistral(),
        }
    }
}

fn default_openai() -> ProviderConfig {
    ProviderConfig::with_model("gpt-4o-mini")
}

fn default_gemini() -> ProviderConfig {
    ProviderConfig::with_model("gemini-1.5-pro")
}

fn default_claude() -> ProviderConfig {
    ProviderConfig::with_model("claude-3-5-sonnet-latest")
}

fn default_mistral() -> ProviderConfig {
    ProviderConfig::with_model("mistral-large-latest")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Concurrent provider calls per batch
    #[serde(default = "workers")]
    pub workers: u16,
    #[serde(default = "chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// Total attempts per chunk for transient failures
    #[serde(default = "max_attempts")]
    pub max_attempts: u8,
    #[serde(default = "backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "max_exemplars")]
    pub max_exemplars: usize,

    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: WORKERS,
            chunk_size: CHUNK_SIZE,
            max_chunk_chars: MAX_CHUNK_CHARS,
            max_attempts: MAX_ATTEMPTS,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_max_ms: BACKOFF_MAX_MS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            similarity_threshold: SIMILARITY_THRESHOLD,
            max_exemplars: MAX_EXEMPLARS,
            digest: DigestConfig::default(),
            providers: ProvidersConfig::default(),
            base_path: String::new(),
        }
    }
}

fn workers() -> u16 {
    WORKERS
}

fn chunk_size() -> usize {
    CHUNK_SIZE
}

fn max_chunk_chars() -> usize {
    MAX_CHUNK_CHARS
}

fn max_attempts() -> u8 {
    MAX_ATTEMPTS
}

fn backoff_base_ms() -> u64 {
    BACKOFF_BASE_MS
}

fn backoff_max_ms() -> u64 {
    BACKOFF_MAX_MS
}

fn request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT_SECS
}

fn similarity_threshold() -> f32 {
    SIMILARITY_THRESHOLD
}

fn max_exemplars() -> usize {
    MAX_EXEMPLARS
}

impl Config {
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.workers == 0 {
            self.workers = 1
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            bail!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {}",
                self.max_attempts
            );
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be between 0.0 and 1.0, got {}",
                self.similarity_threshold
            );
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            bail!(
                "backoff_max_ms ({}) must not be lower than backoff_base_ms ({})",
                self.backoff_max_ms,
                self.backoff_base_ms
            );
        }
        if self.digest.max_chars < 200 {
            bail!("digest.max_chars must be at least 200");
        }

        for (name, provider) in [
            ("openai", &self.providers.openai),
            ("gemini", &self.providers.gemini),
            ("claude", &self.providers.claude),
            ("mistral", &self.providers.mistral),
        ] {
            if provider.model.trim().is_empty() {
                bail!("providers.{name}.model must not be empty");
            }
            if provider.max_batch_keywords == 0 {
                bail!("providers.{name}.max_batch_keywords must be greater than 0");
            }
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
