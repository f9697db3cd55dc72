use anyhow::{Context, Result};
use homedir::my_home;
use std::path::Path;
use std::sync::Arc;

use super::engine::Engine;
use crate::config::Config;
use crate::keywords::BackendCsv;
use crate::lock::DataDirLock;
use crate::prompts::PromptStore;
use crate::providers::ProviderRegistry;
use crate::storage::BackendLocal;
use crate::taxonomy::TaxonomyStore;

pub const BASE_PATH_ENV: &str = "KWGROUP_BASE_PATH";

/// Builds engines over a data directory.
pub struct EngineFactory;

impl EngineFactory {
    /// Resolve and create the data directory.
    pub fn get_paths() -> Result<EnginePaths> {
        let base_path = match std::env::var(BASE_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => path,
            _ => {
                let home = my_home()
                    .context("could not determine home directory")?
                    .context("home directory path is empty")?;
                format!("{}/.local/share/kwgroup", home.to_string_lossy())
            }
        };
        EnginePaths::new(&base_path)
    }

    /// Engine with providers taken from the environment.
    ///
    /// `writable` takes the directory lock; read-only engines can browse and
    /// export while another process is writing.
    pub fn create_engine(paths: &EnginePaths, writable: bool) -> Result<Engine> {
        let config = Config::load_with(&paths.base_path)?;
        let providers = ProviderRegistry::from_config(&config);
        Self::create_engine_with(paths, config, providers, writable)
    }

    pub fn create_engine_with(
        paths: &EnginePaths,
        config: Config,
        providers: ProviderRegistry,
        writable: bool,
    ) -> Result<Engine> {
        let dir_lock = if writable {
            Some(DataDirLock::try_acquire(Path::new(&paths.base_path)).context("failed to lock data directory")?)
        } else {
            None
        };

        let store = BackendLocal::new(&paths.base_path)?;
        let keywords = BackendCsv::load(&paths.keywords_path)
            .with_context(|| format!("failed to load {}", paths.keywords_path))?;
        let prompts = PromptStore::load(store.clone()).context("failed to load prompts")?;

        let engine = Engine::new(
            config,
            Arc::new(keywords),
            Arc::new(TaxonomyStore::new(store)),
            prompts,
            providers,
            dir_lock,
        )?;
        Ok(engine)
    }
}

#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub base_path: String,
    pub keywords_path: String,
}

impl EnginePaths {
    pub fn new(base_path: &str) -> Result<Self> {
        std::fs::create_dir_all(base_path).context("failed to create data directory")?;
        Ok(Self {
            base_path: base_path.to_string(),
            keywords_path: format!("{base_path}/keywords.csv"),
        })
    }
}
