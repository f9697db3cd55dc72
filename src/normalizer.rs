//! Keyword batch cleanup: whitespace, case-folding, dedup and the
//! "already classified" cross-check against stored rows.

use std::collections::HashSet;

use crate::grouping::errors::GroupingError;
use crate::keywords::KeywordRow;
use crate::taxonomy::FALLBACK_CATEGORY;

/// Largest batch accepted by a single submission (after dedup)
pub const MAX_BATCH_SIZE: usize = 250;

pub const DEFAULT_LANGUAGE: &str = "en";

const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("english", "en"),
    ("spanish", "es"),
    ("french", "fr"),
    ("german", "de"),
    ("dutch", "nl"),
    ("italian", "it"),
    ("portuguese", "pt"),
    ("polish", "pl"),
    ("swedish", "sv"),
    ("danish", "da"),
    ("norwegian", "no"),
    ("finnish", "fi"),
    ("japanese", "ja"),
    ("chinese", "zh"),
    ("korean", "ko"),
    ("russian", "ru"),
    ("turkish", "tr"),
    ("arabic", "ar"),
    ("hindi", "hi"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedKeyword {
    /// Case-folded, whitespace-collapsed fingerprint
    pub key: String,
    /// Whitespace-collapsed text with the submitter's casing
    pub display: String,
}

#[derive(Debug, Clone)]
pub enum Disposition {
    AlreadyClassified(KeywordRow),
    NeedsClassification,
}

#[derive(Debug, Clone)]
pub struct PreparedKeyword {
    pub keyword: NormalizedKeyword,
    pub disposition: Disposition,
    /// Row already stored for this key and language, reused or not
    pub stored: Option<KeywordRow>,
}

impl PreparedKeyword {
    /// True when a real classification is stored, whatever its prompt version.
    pub fn has_good_row(&self) -> bool {
        self.stored
            .as_ref()
            .is_some_and(|row| row.main_cat != FALLBACK_CATEGORY)
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim, collapse internal whitespace and case-fold.
pub fn normalize_key(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

/// Resolve a language hint to a lowercase ISO 639 code.
pub fn normalize_language(hint: Option<&str>) -> Result<String, GroupingError> {
    let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(DEFAULT_LANGUAGE.to_string());
    };
    let lower = hint.to_lowercase();

    if (2..=3).contains(&lower.len()) && lower.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(lower);
    }

    LANGUAGE_NAMES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, code)| code.to_string())
        .ok_or_else(|| GroupingError::input(format!("unknown language {hint:?}")))
}

/// Clean and dedup a raw batch, keeping first-occurrence order.
pub fn normalize_batch<S: AsRef<str>>(raw: &[S]) -> Result<Vec<NormalizedKeyword>, GroupingError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for text in raw {
        let display = collapse_whitespace(text.as_ref());
        if display.is_empty() {
            continue;
        }
        let key = display.to_lowercase();
        if seen.insert(key.clone()) {
            out.push(NormalizedKeyword { key, display });
        }
    }

    if out.is_empty() {
        return Err(GroupingError::input("keyword batch is empty"));
    }
    if out.len() > MAX_BATCH_SIZE {
        return Err(GroupingError::input(format!(
            "keyword batch has {} unique keywords, the limit is {MAX_BATCH_SIZE}",
            out.len()
        )));
    }

    Ok(out)
}

/// Mark keywords whose (key, language, prompt version) was already classified.
///
/// Rows in the fallback branch never count, so they are retried on the next
/// submission. The first failed lookup aborts the whole pass.
pub fn mark_already_classified<F, E>(
    batch: Vec<NormalizedKeyword>,
    language: &str,
    prompt_version: &str,
    force: bool,
    lookup: F,
) -> Result<Vec<PreparedKeyword>, E>
where
    F: Fn(&str, &str) -> Result<Option<KeywordRow>, E>,
{
    batch
        .into_iter()
        .map(|keyword| {
            let stored = lookup(&keyword.key, language)?;
            let disposition = match &stored {
                Some(row)
                    if !force
                        && row.prompt_version == prompt_version
                        && row.main_cat != FALLBACK_CATEGORY =>
                {
                    Disposition::AlreadyClassified(row.clone())
                }
                _ => Disposition::NeedsClassification,
            };
            Ok(PreparedKeyword {
                keyword,
                disposition,
                stored,
            })
        })
        .collect()
}
