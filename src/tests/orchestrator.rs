use std::sync::Mutex;

use super::support::{assign, path, FakeClassifier};
use crate::grouping::orchestrator::{KeywordResult, Orchestrator, OrchestratorSettings, RetryPolicy};
use crate::grouping::{CancelToken, Progress};
use crate::providers::ProviderError;
use crate::taxonomy::FALLBACK_CATEGORY;

fn settings(workers: usize, chunk_size: usize, max_attempts: u8) -> OrchestratorSettings {
    OrchestratorSettings {
        workers,
        chunk_size,
        max_chunk_chars: 10_000,
        retry: RetryPolicy {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        },
    }
}

fn words(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("keyword {i}")).collect()
}

fn render(keywords: &[String], strict: bool) -> String {
    format!("{}{}", keywords.join("|"), if strict { " STRICT" } else { "" })
}

fn echo(keyword: &str) -> [String; 4] {
    path("Main", "Sub", keyword, "theme")
}

#[test]
fn results_keep_input_order_across_workers() {
    let classifier = FakeClassifier::mapping(echo);
    let keywords = words(23);

    let report = Orchestrator::new(&classifier, settings(4, 5, 3)).run(
        &keywords,
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );

    assert_eq!(report.chunks_total, 5);
    assert_eq!(report.chunks_done, 5);
    assert_eq!(classifier.call_count(), 5);
    for (keyword, result) in keywords.iter().zip(&report.results) {
        match result {
            KeywordResult::Classified(a) => assert_eq!(&a.sub_cat_2, keyword),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn chunk_size_is_capped_by_provider_limit() {
    let classifier = FakeClassifier::mapping(echo).with_max_batch(2);
    let report = Orchestrator::new(&classifier, settings(1, 25, 3)).run(
        &words(5),
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );
    assert_eq!(report.chunks_total, 3);
    assert!(classifier.calls().iter().all(|c| c.keywords.len() <= 2));
}

#[test]
fn transient_errors_are_retried() {
    let classifier = FakeClassifier::new(|request, call| {
        if call < 2 {
            return Err(ProviderError::RateLimit("slow down".into()));
        }
        Ok(request.keywords.iter().map(|k| assign(k, echo(k))).collect())
    });

    let report = Orchestrator::new(&classifier, settings(1, 10, 4)).run(
        &words(3),
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );

    assert_eq!(classifier.call_count(), 3);
    assert!(report.errors.is_empty());
    assert!(report
        .results
        .iter()
        .all(|r| matches!(r, KeywordResult::Classified(_))));
}

#[test]
fn exhausted_retries_fall_back() {
    let classifier = FakeClassifier::new(|_, _| Err(ProviderError::Timeout("deadline".into())));

    let report = Orchestrator::new(&classifier, settings(1, 10, 3)).run(
        &words(2),
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );

    assert_eq!(classifier.call_count(), 3);
    assert_eq!(report.errors.len(), 1);
    for result in &report.results {
        match result {
            KeywordResult::Fallback { assignment, error } => {
                assert_eq!(assignment.main_cat, FALLBACK_CATEGORY);
                assert_eq!(assignment.sub_cat_2, "openai:timeout");
                assert!(matches!(error, ProviderError::Timeout(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn malformed_gets_one_strict_retry() {
    let classifier = FakeClassifier::new(|request, _| {
        if request.prompt.ends_with("STRICT") {
            Ok(request.keywords.iter().map(|k| assign(k, echo(k))).collect())
        } else {
            Err(ProviderError::Malformed("not json".into()))
        }
    });

    let report = Orchestrator::new(&classifier, settings(1, 10, 4)).run(
        &words(2),
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );

    let calls = classifier.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].prompt.ends_with("STRICT"));
    assert!(calls[1].prompt.ends_with("STRICT"));
    assert!(matches!(report.results[0], KeywordResult::Classified(_)));
}

#[test]
fn wrong_assignment_count_is_malformed() {
    let classifier = FakeClassifier::new(|request, _| {
        Ok(request.keywords.iter().take(1).map(|k| assign(k, echo(k))).collect())
    });

    let report = Orchestrator::new(&classifier, settings(1, 10, 4)).run(
        &words(2),
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );

    assert_eq!(classifier.call_count(), 2);
    assert!(matches!(
        &report.results[1],
        KeywordResult::Fallback {
            error: ProviderError::Malformed(_),
            ..
        }
    ));
}

#[test]
fn auth_error_stops_new_chunks() {
    let classifier = FakeClassifier::new(|_, _| Err(ProviderError::Auth("bad key".into())));

    let report = Orchestrator::new(&classifier, settings(1, 1, 4)).run(
        &words(4),
        "en",
        &render,
        &CancelToken::new(),
        &|_: Progress| {},
    );

    assert_eq!(classifier.call_count(), 1);
    assert!(report.stopped_on_auth);
    assert!(matches!(report.results[0], KeywordResult::Fallback { .. }));
    assert!(report.results[1..]
        .iter()
        .all(|r| matches!(r, KeywordResult::Skipped)));
}

#[test]
fn cancel_skips_remaining_chunks() {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    let classifier = FakeClassifier::new(move |request, _| {
        handle.cancel();
        Ok(request.keywords.iter().map(|k| assign(k, echo(k))).collect())
    });

    let report = Orchestrator::new(&classifier, settings(1, 2, 4)).run(&words(6), "en", &render, &cancel, &|_: Progress| {});

    // the in-flight chunk finishes, nothing new starts
    assert_eq!(classifier.call_count(), 1);
    assert!(report.cancelled);
    assert!(matches!(report.results[1], KeywordResult::Classified(_)));
    assert!(matches!(report.results[2], KeywordResult::Skipped));
}

#[test]
fn progress_is_reported_per_chunk() {
    let classifier = FakeClassifier::mapping(echo);
    let seen = Mutex::new(vec![]);
    let progress = |p: Progress| seen.lock().unwrap().push(p.done);

    Orchestrator::new(&classifier, settings(2, 2, 4)).run(&words(6), "en", &render, &CancelToken::new(), &progress);

    let mut seen = seen.into_inner().unwrap();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}
