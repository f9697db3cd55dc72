//! Fourteen gardening keywords through the whole pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::support::{assign, engine_with_config, path, test_config, FakeClassifier};
use crate::grouping::{BatchStatus, CancelToken, Progress, SubmitRequest};
use crate::keywords::KeywordQuery;
use crate::providers::ProviderKind;
use crate::taxonomy::Level;

const KEYWORDS: [&str; 14] = [
    "buy tomato seeds online",
    "heirloom vegetable seeds for sale",
    "cheap flower seeds",
    "buy potting soil",
    "organic compost near me",
    "what is loam soil",
    "raised garden bed kit",
    "cedar raised beds for sale",
    "bulk garden soil delivery",
    "how to test soil ph",
    "best soil for vegetables",
    "how to start a vegetable garden",
    "when to plant tomatoes",
    "how often to water a garden",
];

/// What a well-behaved model would answer. The second chunk spells one
/// category slightly differently.
fn model(keyword: &str, late_chunk: bool) -> [String; 4] {
    let k = keyword.to_lowercase();
    if k.contains("seeds") {
        path("Gardening", "Buying", "Buying Seeds", "Purchasing seeds to grow plants")
    } else if k.contains("raised") {
        path(
            "Gardening",
            "Buying",
            "Buying Raised Garden Beds",
            "Purchasing raised beds and kits",
        )
    } else if k.starts_with("buy") || k.contains("compost") || k.contains("delivery") {
        let name = if late_chunk { "Buying Soil and Compost" } else { "Buying Soil & Compost" };
        path("Gardening", "Buying", name, "Purchasing soil, compost and growing media")
    } else if k.contains("soil") {
        path(
            "Gardening",
            "Learning",
            "Soil Information & Advice",
            "Understanding soil types and soil health",
        )
    } else {
        path(
            "Gardening",
            "Learning",
            "Gardening How-To & Advice",
            "Practical guidance for growing a garden",
        )
    }
}

#[test]
fn gardening_keywords_form_five_clusters() {
    let tmp = tempfile::tempdir().unwrap();
    let classifier = Arc::new(FakeClassifier::new(|request, _| {
        let late_chunk = request.keywords.iter().any(|k| k == KEYWORDS[7]);
        Ok(request
            .keywords
            .iter()
            .map(|k| assign(k, model(k, late_chunk)))
            .collect())
    }));
    let mut config = test_config();
    config.chunk_size = 7;
    let engine = engine_with_config(&tmp, classifier.clone(), config);

    let result = engine
        .submit(
            SubmitRequest {
                keywords: KEYWORDS.iter().map(|k| k.to_string()).collect(),
                language: Some("English".into()),
                provider: ProviderKind::OpenAi,
                prompt_version: None,
                force: false,
            },
            &CancelToken::new(),
            &|_: Progress| {},
        )
        .unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.language, "en");
    assert_eq!(result.classified_count, 14);
    assert_eq!(classifier.call_count(), 2);

    // every keyword in exactly one sub_cat_2
    let rows = engine.snapshot().unwrap();
    assert_eq!(rows.len(), 14);
    let mut clusters: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut themes: HashMap<String, String> = HashMap::new();
    for row in &rows {
        assert!(!row.theme.trim().is_empty());
        clusters
            .entry(row.sub_cat_2.clone())
            .or_default()
            .push(row.display_text.clone());
        themes.insert(row.sub_cat_2.clone(), row.theme.clone());
    }

    let expected = [
        "Buying Seeds",
        "Buying Soil & Compost",
        "Buying Raised Garden Beds",
        "Soil Information & Advice",
        "Gardening How-To & Advice",
    ];
    assert_eq!(clusters.len(), expected.len());
    for name in expected {
        assert!(clusters.contains_key(name), "missing cluster {name}");
        assert!(!themes[name].is_empty());
    }
    assert_eq!(clusters["Buying Seeds"].len(), 3);
    assert_eq!(clusters["Buying Soil & Compost"].len(), 3);
    assert_eq!(clusters["Buying Raised Garden Beds"].len(), 2);
    assert_eq!(clusters["Soil Information & Advice"].len(), 3);
    assert_eq!(clusters["Gardening How-To & Advice"].len(), 3);

    // the late spelling was folded into the existing node
    assert!(result
        .aliases
        .iter()
        .any(|a| a.proposed == "Buying Soil and Compost" && a.canonical == "Buying Soil & Compost"));

    let tree = engine.taxonomy();
    assert_eq!(tree.count_level(Level::Main), 1);
    assert_eq!(tree.count_level(Level::Sub1), 2);
    assert_eq!(tree.count_level(Level::Sub2), 5);
    tree.validate().unwrap();

    let learning = engine
        .query(&KeywordQuery {
            sub_cat_1: Some("learning".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(learning.total, 6);
}
