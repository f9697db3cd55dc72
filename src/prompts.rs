//! Versioned prompt templates stored in `prompts.yaml`.
//!
//! Versions are named `v1`, `v2`, ... in creation order. Exactly one version
//! is active; a submission may pin any other version explicitly. Adding a
//! text that already exists (same sha256) returns the existing version.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::RwLock;

use crate::keywords::timestamp;
use crate::storage::{BackendLocal, StorageManager};

const PROMPTS_FILE: &str = "prompts.yaml";

/// Overrides the built-in template when seeding a fresh store
pub const DEFAULT_PROMPT_ENV: &str = "DEFAULT_LLM_PROMPT";

pub const PLACEHOLDER_LANGUAGE: &str = "{language}";
pub const PLACEHOLDER_TAXONOMY: &str = "{taxonomy}";
pub const PLACEHOLDER_KEYWORDS: &str = "{keywords}";

pub const DEFAULT_TEMPLATE: &str = r#"You are grouping search keywords written in language "{language}".

Existing categories. Reuse these names exactly, character for character, whenever a keyword fits one of them. Only propose a new category when none fits:
{taxonomy}

For every keyword below:
1. Determine the core semantic theme or user intent behind searching for it.
2. Assign it to a 3-level hierarchy: main_cat, sub_cat_1, sub_cat_2. Keywords that share an intent must receive exactly the same three names. Populate every level and never use "Unclassified".
3. Write a short semantic_theme describing that shared intent.

Keywords (JSON array):
{keywords}

Reply ONLY with JSON in this exact shape, one entry per keyword, keyword text copied verbatim:
{"results": [{"keyword": "...", "main_cat": "...", "sub_cat_1": "...", "sub_cat_2": "...", "semantic_theme": "..."}]}"#;

/// Appended on the single retry after a malformed response.
pub const STRICT_INSTRUCTION: &str = "IMPORTANT: your previous answer could not be used. Respond with one JSON object only, no prose and no code fences. The \"results\" array must contain exactly one entry for each keyword listed above, with the keyword copied verbatim and all five fields non-empty.";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub version: String,
    pub text: String,
    pub hash: String,
    pub created_at: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("prompt version not found: {0}")]
    NotFound(String),

    #[error("invalid prompt template: {0}")]
    Invalid(String),

    #[error("no active prompt version")]
    NoActive,

    #[error("storage error: {0}")]
    Storage(String),
}

pub struct PromptStore {
    templates: RwLock<Vec<PromptTemplate>>,
    store: BackendLocal,
}

impl PromptStore {
    pub fn load(store: BackendLocal) -> Result<Self, PromptError> {
        if !store.exists(PROMPTS_FILE) {
            let text = std::env::var(DEFAULT_PROMPT_ENV)
                .ok()
                .filter(|t| validate_template(t).is_ok())
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
            let seed = vec![PromptTemplate {
                version: "v1".into(),
                hash: hash_text(&text),
                text,
                created_at: timestamp(),
                active: true,
            }];
            log::info!("seeding {PROMPTS_FILE} with prompt v1");
            write_templates(&store, &seed)?;
        }

        let data = store
            .read(PROMPTS_FILE)
            .map_err(|e| PromptError::Storage(e.to_string()))?;
        let yaml_str = String::from_utf8(data).map_err(|e| PromptError::Storage(e.to_string()))?;
        let templates: Vec<PromptTemplate> =
            serde_yml::from_str(&yaml_str).map_err(|e| PromptError::Storage(e.to_string()))?;

        if templates.iter().filter(|t| t.active).count() != 1 {
            return Err(PromptError::Storage(format!(
                "{PROMPTS_FILE} must have exactly one active version"
            )));
        }

        Ok(Self {
            templates: RwLock::new(templates),
            store,
        })
    }

    pub fn list(&self) -> Result<Vec<PromptTemplate>, PromptError> {
        Ok(self.read()?.clone())
    }

    pub fn get(&self, version: &str) -> Result<PromptTemplate, PromptError> {
        self.read()?
            .iter()
            .find(|t| t.version == version.trim())
            .cloned()
            .ok_or_else(|| PromptError::NotFound(version.to_string()))
    }

    pub fn active(&self) -> Result<PromptTemplate, PromptError> {
        self.read()?
            .iter()
            .find(|t| t.active)
            .cloned()
            .ok_or(PromptError::NoActive)
    }

    /// The pinned version if given, the active one otherwise.
    pub fn resolve(&self, pinned: Option<&str>) -> Result<PromptTemplate, PromptError> {
        match pinned.map(str::trim).filter(|v| !v.is_empty()) {
            Some(version) => self.get(version),
            None => self.active(),
        }
    }

    /// Store a new template. Returns the stored template and whether it was new.
    pub fn add(&self, text: &str) -> Result<(PromptTemplate, bool), PromptError> {
        validate_template(text)?;
        let hash = hash_text(text);

        let mut templates = self.write()?;
        if let Some(existing) = templates.iter().find(|t| t.hash == hash) {
            return Ok((existing.clone(), false));
        }

        let template = PromptTemplate {
            version: format!("v{}", templates.len() + 1),
            text: text.to_string(),
            hash,
            created_at: timestamp(),
            active: false,
        };

        let mut staged = templates.clone();
        staged.push(template.clone());
        write_templates(&self.store, &staged)?;
        *templates = staged;

        log::info!("added prompt version={}", template.version);
        Ok((template, true))
    }

    pub fn activate(&self, version: &str) -> Result<PromptTemplate, PromptError> {
        let mut templates = self.write()?;
        if !templates.iter().any(|t| t.version == version) {
            return Err(PromptError::NotFound(version.to_string()));
        }

        let mut staged = templates.clone();
        for template in staged.iter_mut() {
            template.active = template.version == version;
        }
        write_templates(&self.store, &staged)?;
        *templates = staged;

        log::info!("activated prompt version={version}");
        templates
            .iter()
            .find(|t| t.active)
            .cloned()
            .ok_or(PromptError::NoActive)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<PromptTemplate>>, PromptError> {
        self.templates
            .read()
            .map_err(|_| PromptError::Storage("prompt store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<PromptTemplate>>, PromptError> {
        self.templates
            .write()
            .map_err(|_| PromptError::Storage("prompt store lock poisoned".into()))
    }
}

impl PromptTemplate {
    /// Fill in the placeholders. `strict` appends the retry instruction.
    pub fn render(&self, language: &str, taxonomy: &str, keywords: &[String], strict: bool) -> String {
        let keyword_list = serde_json::to_string_pretty(keywords).unwrap_or_else(|_| keywords.join("\n"));
        let mut prompt = self
            .text
            .replace(PLACEHOLDER_LANGUAGE, language)
            .replace(PLACEHOLDER_TAXONOMY, taxonomy)
            .replace(PLACEHOLDER_KEYWORDS, &keyword_list);
        if strict {
            prompt.push_str("\n\n");
            prompt.push_str(STRICT_INSTRUCTION);
        }
        prompt
    }
}

fn validate_template(text: &str) -> Result<(), PromptError> {
    if text.trim().is_empty() {
        return Err(PromptError::Invalid("template is empty".into()));
    }
    if !text.contains(PLACEHOLDER_KEYWORDS) {
        return Err(PromptError::Invalid(format!(
            "template must contain the {PLACEHOLDER_KEYWORDS} placeholder"
        )));
    }
    Ok(())
}

pub fn hash_text(text: &str) -> String {
    Sha256::digest(text.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn write_templates(store: &BackendLocal, templates: &[PromptTemplate]) -> Result<(), PromptError> {
    let yaml = serde_yml::to_string(templates).map_err(|e| PromptError::Storage(e.to_string()))?;
    store
        .write(PROMPTS_FILE, yaml.as_bytes())
        .map_err(|e| PromptError::Storage(e.to_string()))
}
