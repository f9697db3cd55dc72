//! Validation of raw classifier output.
//!
//! Accepted shapes: `{"results": [...]}`, a bare array, or a single entry
//! object, optionally wrapped in a code fence or prose. Each entry needs
//! `keyword`, `main_cat`, `sub_cat_1`, `sub_cat_2` and `semantic_theme`
//! (`theme` is accepted too). Either every requested keyword gets exactly one
//! valid entry or the whole response is rejected.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{Assignment, ProviderError};
use crate::normalizer::{collapse_whitespace, normalize_key};
use crate::taxonomy::FALLBACK_CATEGORY;

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    keyword: Option<String>,
    #[serde(default)]
    main_cat: Option<String>,
    #[serde(default)]
    sub_cat_1: Option<String>,
    #[serde(default)]
    sub_cat_2: Option<String>,
    #[serde(default, alias = "theme")]
    semantic_theme: Option<String>,
}

/// Cut the outermost JSON object or array out of `raw`.
///
/// The span that opens first wins when it parses. Otherwise the other one is
/// tried, so prose like "results [JSON]: {...}" still yields the object.
pub fn extract_json(raw: &str) -> Option<&str> {
    let span = move |open: char, close: char| {
        let start = raw.find(open)?;
        let end = raw.rfind(close)?;
        (end > start).then(|| (start, &raw[start..=end]))
    };

    let mut candidates: Vec<(usize, &str)> = [span('{', '}'), span('[', ']')].into_iter().flatten().collect();
    candidates.sort_by_key(|(start, _)| *start);

    candidates
        .iter()
        .find(|(_, json)| serde_json::from_str::<serde::de::IgnoredAny>(json).is_ok())
        .or_else(|| candidates.first())
        .map(|(_, json)| *json)
}

/// Parse and validate a response for `keywords`, returning assignments in
/// the same order.
pub fn parse_assignments(raw: &str, keywords: &[String]) -> Result<Vec<Assignment>, ProviderError> {
    let malformed = |reason: String| ProviderError::Malformed(reason);

    let json = extract_json(raw).ok_or_else(|| malformed("no JSON found in response".into()))?;
    let value: Value =
        serde_json::from_str(json).map_err(|err| malformed(format!("invalid JSON: {err}")))?;

    let entries = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(malformed("`results` is not an array".into())),
            None if obj.contains_key("keyword") => vec![Value::Object(obj)],
            None => return Err(malformed("missing `results` array".into())),
        },
        _ => return Err(malformed("response is not an object or array".into())),
    };

    let wanted: HashMap<String, usize> = keywords
        .iter()
        .enumerate()
        .map(|(idx, k)| (normalize_key(k), idx))
        .collect();
    let mut slots: Vec<Option<Assignment>> = vec![None; keywords.len()];

    for entry in entries {
        let entry: RawEntry = serde_json::from_value(entry)
            .map_err(|err| malformed(format!("invalid entry: {err}")))?;

        let keyword = entry
            .keyword
            .as_deref()
            .map(normalize_key)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| malformed("entry without keyword".into()))?;
        let idx = *wanted
            .get(&keyword)
            .ok_or_else(|| malformed(format!("unexpected keyword {keyword:?}")))?;
        if slots[idx].is_some() {
            return Err(malformed(format!("keyword {keyword:?} classified twice")));
        }

        let field = |value: Option<String>, name: &str| {
            value
                .map(|v| collapse_whitespace(&v))
                .filter(|v| !v.is_empty())
                .ok_or_else(|| malformed(format!("empty {name} for {keyword:?}")))
        };
        let assignment = Assignment {
            keyword: keywords[idx].clone(),
            main_cat: field(entry.main_cat, "main_cat")?,
            sub_cat_1: field(entry.sub_cat_1, "sub_cat_1")?,
            sub_cat_2: field(entry.sub_cat_2, "sub_cat_2")?,
            theme: field(entry.semantic_theme, "semantic_theme")?,
        };
        if normalize_key(&assignment.main_cat) == normalize_key(FALLBACK_CATEGORY) {
            return Err(malformed(format!(
                "reserved category {FALLBACK_CATEGORY:?} proposed for {keyword:?}"
            )));
        }

        slots[idx] = Some(assignment);
    }

    let missing: Vec<&str> = slots
        .iter()
        .zip(keywords)
        .filter(|(slot, _)| slot.is_none())
        .map(|(_, k)| k.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(malformed(format!("no classification for {missing:?}")));
    }

    Ok(slots.into_iter().flatten().collect())
}
