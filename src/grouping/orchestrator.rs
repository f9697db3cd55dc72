//! Chunked, concurrent classification of one batch.
//!
//! The keyword list is cut into chunks, chunks are handed to a fixed pool of
//! scoped worker threads, and every chunk walks its own `ChunkState` machine
//! until it either succeeds or degrades to the fallback branch. Results are
//! put back into input order by index.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use rand::random;

use crate::config::Config;
use crate::providers::{Assignment, Classifier, ClassifyRequest, ProviderError, ProviderKind};
use crate::taxonomy::FALLBACK_CATEGORY;

/// Shared abort flag. Cancelling stops new chunks from being issued; chunks
/// already in flight run to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u8) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1) as u32);
        let jitter = random::<u64>() % (self.backoff_base_ms + 1);
        let ms = self
            .backoff_base_ms
            .saturating_mul(exp)
            .saturating_add(jitter)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub chunk_size: usize,
    pub max_chunk_chars: usize,
    pub retry: RetryPolicy,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers.max(1) as usize,
            chunk_size: config.chunk_size,
            max_chunk_chars: config.max_chunk_chars,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_base_ms: config.backoff_base_ms,
                backoff_max_ms: config.backoff_max_ms,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Position of the first keyword in the batch
    pub offset: usize,
    pub keywords: Vec<String>,
}

/// Cut `keywords` into chunks of at most `max_keywords` entries and
/// `max_chars` characters. An oversized keyword gets a chunk of its own.
pub fn plan_chunks(keywords: &[String], max_keywords: usize, max_chars: usize) -> Vec<Chunk> {
    let max_keywords = max_keywords.max(1);
    let mut chunks: Vec<Chunk> = vec![];
    let mut current: Vec<String> = vec![];
    let mut chars = 0;
    let mut offset = 0;

    for (idx, keyword) in keywords.iter().enumerate() {
        let len = keyword.chars().count();
        if !current.is_empty() && (current.len() >= max_keywords || chars + len > max_chars) {
            chunks.push(Chunk {
                index: chunks.len(),
                offset,
                keywords: std::mem::take(&mut current),
            });
            chars = 0;
            offset = idx;
        }
        chars += len;
        current.push(keyword.clone());
    }
    if !current.is_empty() {
        chunks.push(Chunk {
            index: chunks.len(),
            offset,
            keywords: current,
        });
    }

    chunks
}

/// Per-chunk lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkState {
    Pending { attempt: u8, strict: bool },
    InFlight { attempt: u8, strict: bool },
    RetryableFailure { attempt: u8, strict: bool, error: ProviderError },
    Malformed { attempt: u8, error: ProviderError },
    StrictRetry { attempt: u8 },
    Success(Vec<Assignment>),
    Fallback(ProviderError),
}

impl ChunkState {
    pub fn start() -> Self {
        ChunkState::Pending {
            attempt: 1,
            strict: false,
        }
    }

    /// Transition out of a provider call.
    pub fn after_call(attempt: u8, strict: bool, result: Result<Vec<Assignment>, ProviderError>) -> Self {
        match result {
            Ok(assignments) => ChunkState::Success(assignments),
            Err(error) if error.is_transient() => ChunkState::RetryableFailure {
                attempt,
                strict,
                error,
            },
            Err(error @ ProviderError::Malformed(_)) if !strict => ChunkState::Malformed { attempt, error },
            Err(error) => ChunkState::Fallback(error),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Success(_) | ChunkState::Fallback(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeywordResult {
    Classified(Assignment),
    Fallback {
        assignment: Assignment,
        error: ProviderError,
    },
    /// Never sent because the batch was cancelled or stopped
    Skipped,
}

#[derive(Debug, Default)]
pub struct OrchestratorReport {
    /// One entry per input keyword, in input order
    pub results: Vec<KeywordResult>,
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub cancelled: bool,
    pub stopped_on_auth: bool,
    pub errors: Vec<String>,
}

/// Fallback-branch assignment for a keyword that could not be classified.
pub fn fallback_assignment(keyword: &str, provider: ProviderKind, error: &ProviderError) -> Assignment {
    let reason = error.reason_code();
    Assignment {
        keyword: keyword.to_string(),
        main_cat: FALLBACK_CATEGORY.to_string(),
        sub_cat_1: FALLBACK_CATEGORY.to_string(),
        sub_cat_2: format!("{provider}:{reason}"),
        theme: format!("classification failed ({reason})"),
    }
}

pub struct Orchestrator<'a> {
    classifier: &'a dyn Classifier,
    settings: OrchestratorSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(classifier: &'a dyn Classifier, settings: OrchestratorSettings) -> Self {
        Self {
            classifier,
            settings,
        }
    }

    /// Classify `keywords`. `render` builds the prompt for a chunk; its flag
    /// asks for the strict variant.
    pub fn run<R, P>(
        &self,
        keywords: &[String],
        language: &str,
        render: &R,
        cancel: &CancelToken,
        progress: &P,
    ) -> OrchestratorReport
    where
        R: Fn(&[String], bool) -> String + Sync + ?Sized,
        P: Fn(Progress) + Sync + ?Sized,
    {
        let max_keywords = self
            .settings
            .chunk_size
            .min(self.classifier.max_batch_keywords());
        let chunks = plan_chunks(keywords, max_keywords, self.settings.max_chunk_chars);
        let total = chunks.len();
        let provider = self.classifier.kind();

        let mut report = OrchestratorReport {
            results: vec![KeywordResult::Skipped; keywords.len()],
            chunks_total: total,
            ..Default::default()
        };
        if chunks.is_empty() {
            return report;
        }

        log::info!(
            "provider={provider} keywords={} chunks={total} workers={}",
            keywords.len(),
            self.settings.workers
        );
        progress(Progress { done: 0, total });

        let next = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<(usize, Result<Vec<Assignment>, ProviderError>)>();

        thread::scope(|s| {
            for _ in 0..self.settings.workers.min(total) {
                let tx = tx.clone();
                let (chunks, next, done, stop) = (&chunks, &next, &done, &stop);
                s.spawn(move || loop {
                    if cancel.is_cancelled() || stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(chunk) = chunks.get(idx) else {
                        break;
                    };

                    let result = self.run_chunk(chunk, language, render);
                    if let Err(ProviderError::Auth(_)) = &result {
                        stop.store(true, Ordering::SeqCst);
                    }
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress(Progress {
                        done: finished,
                        total,
                    });

                    if tx.send((idx, result)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        for (idx, result) in rx.try_iter() {
            let chunk = &chunks[idx];
            report.chunks_done += 1;
            match result {
                Ok(assignments) => {
                    for (i, assignment) in assignments.into_iter().enumerate() {
                        report.results[chunk.offset + i] = KeywordResult::Classified(assignment);
                    }
                }
                Err(error) => {
                    if matches!(error, ProviderError::Auth(_)) {
                        report.stopped_on_auth = true;
                    }
                    report.errors.push(format!("chunk {idx}: {provider}: {error}"));
                    for (i, keyword) in chunk.keywords.iter().enumerate() {
                        report.results[chunk.offset + i] = KeywordResult::Fallback {
                            assignment: fallback_assignment(keyword, provider, &error),
                            error: error.clone(),
                        };
                    }
                }
            }
        }

        report.cancelled = cancel.is_cancelled() && report.chunks_done < total;
        if report.cancelled || report.stopped_on_auth {
            log::warn!(
                "provider={provider} batch stopped early chunks_done={}/{total} cancelled={} auth={}",
                report.chunks_done,
                report.cancelled,
                report.stopped_on_auth
            );
        }

        report
    }

    fn run_chunk<R>(&self, chunk: &Chunk, language: &str, render: &R) -> Result<Vec<Assignment>, ProviderError>
    where
        R: Fn(&[String], bool) -> String + Sync + ?Sized,
    {
        let provider = self.classifier.kind();
        let retry = &self.settings.retry;
        let mut state = ChunkState::start();

        loop {
            state = match state {
                ChunkState::Pending { attempt, strict } => ChunkState::InFlight { attempt, strict },
                ChunkState::StrictRetry { attempt } => ChunkState::InFlight {
                    attempt,
                    strict: true,
                },
                ChunkState::InFlight { attempt, strict } => {
                    let request = ClassifyRequest {
                        keywords: chunk.keywords.clone(),
                        language: language.to_string(),
                        prompt: render(&chunk.keywords, strict),
                    };
                    log::debug!(
                        "provider={provider} chunk={} attempt={attempt} strict={strict} keywords={}",
                        chunk.index,
                        chunk.keywords.len()
                    );
                    let result = self.classifier.classify(&request).and_then(|assignments| {
                        if assignments.len() == chunk.keywords.len() {
                            Ok(assignments)
                        } else {
                            Err(ProviderError::Malformed(format!(
                                "expected {} assignments, got {}",
                                chunk.keywords.len(),
                                assignments.len()
                            )))
                        }
                    });
                    ChunkState::after_call(attempt, strict, result)
                }
                ChunkState::RetryableFailure {
                    attempt,
                    strict,
                    error,
                } => {
                    if attempt >= retry.max_attempts {
                        log::warn!(
                            "provider={provider} chunk={} outcome=fallback attempts={attempt} error={error}",
                            chunk.index
                        );
                        ChunkState::Fallback(error)
                    } else {
                        let delay = retry.delay(attempt);
                        log::info!(
                            "provider={provider} chunk={} outcome=retry attempt={attempt}/{} backoff={}ms error={error}",
                            chunk.index,
                            retry.max_attempts,
                            delay.as_millis()
                        );
                        thread::sleep(delay);
                        ChunkState::Pending {
                            attempt: attempt.saturating_add(1),
                            strict,
                        }
                    }
                }
                ChunkState::Malformed { attempt, error } => {
                    log::info!(
                        "provider={provider} chunk={} outcome=strict_retry error={error}",
                        chunk.index
                    );
                    ChunkState::StrictRetry {
                        attempt: attempt.saturating_add(1),
                    }
                }
                ChunkState::Success(assignments) => {
                    log::debug!("provider={provider} chunk={} outcome=success", chunk.index);
                    return Ok(assignments);
                }
                ChunkState::Fallback(error) => return Err(error),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("keyword {i}")).collect()
    }

    #[test]
    fn chunks_respect_count_and_chars() {
        let chunks = plan_chunks(&words(7), 3, 10_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].offset, 6);
        assert_eq!(chunks[2].keywords, vec!["keyword 6"]);

        // "keyword N" is 9 chars, so two fit in 20
        let chunks = plan_chunks(&words(5), 100, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].offset, 2);

        // oversized keyword still gets a chunk
        let chunks = plan_chunks(&["x".repeat(50)], 10, 20);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn state_transitions() {
        let malformed = ProviderError::Malformed("bad".into());
        assert_eq!(
            ChunkState::after_call(1, false, Err(malformed.clone())),
            ChunkState::Malformed {
                attempt: 1,
                error: malformed.clone()
            }
        );
        assert_eq!(
            ChunkState::after_call(2, true, Err(malformed.clone())),
            ChunkState::Fallback(malformed)
        );
        assert!(matches!(
            ChunkState::after_call(1, false, Err(ProviderError::Timeout("t".into()))),
            ChunkState::RetryableFailure { attempt: 1, .. }
        ));
        assert!(matches!(
            ChunkState::after_call(
                1,
                false,
                Err(ProviderError::Http {
                    status: 400,
                    body: String::new()
                })
            ),
            ChunkState::Fallback(_)
        ));
        assert!(ChunkState::after_call(1, false, Ok(vec![])).is_terminal());
        assert!(!ChunkState::start().is_terminal());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
        };
        let first = policy.delay(1).as_millis();
        assert!((500..=1000).contains(&first));
        assert_eq!(policy.delay(9).as_millis(), 8000);

        let zero = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        };
        assert_eq!(zero.delay(3), Duration::ZERO);
    }

    #[test]
    fn fallback_names_provider_and_reason() {
        let a = fallback_assignment("kw", ProviderKind::Gemini, &ProviderError::RateLimit("x".into()));
        assert_eq!(a.main_cat, FALLBACK_CATEGORY);
        assert_eq!(a.sub_cat_1, FALLBACK_CATEGORY);
        assert_eq!(a.sub_cat_2, "gemini:rate_limited");
        assert!(!a.theme.is_empty());
    }
}
