use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};

use super::errors::GroupingError;
use super::orchestrator::{CancelToken, KeywordResult, Orchestrator, OrchestratorSettings, Progress};
use crate::config::Config;
use crate::eid::Eid;
use crate::keywords::{timestamp, KeywordManager, KeywordQuery, KeywordRow, Page, UpsertStats};
use crate::lock::DataDirLock;
use crate::normalizer::{self, Disposition};
use crate::prompts::{PromptError, PromptStore};
use crate::providers::{Assignment, ProviderKind, ProviderRegistry};
use crate::taxonomy::reconcile::{AliasEvent, CreatedNode};
use crate::taxonomy::{build_digest, Reconciler, Taxonomy, TaxonomyPersistence, FALLBACK_CATEGORY};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitRequest {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub provider: ProviderKind,
    /// Pin a prompt version instead of the active one
    #[serde(default)]
    pub prompt_version: Option<String>,
    /// Re-classify keywords that already have a row
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Reused a stored row without calling the provider
    Cached,
    Classified,
    Fallback { reason: String },
    /// Never sent to the provider
    Skipped,
    /// Classified but not persisted
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordOutcome {
    pub keyword: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// One submission. Lives only for the duration of `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub id: Eid,
    pub keywords: Vec<String>,
    pub language: String,
    pub provider: ProviderKind,
    pub prompt_version: String,
    pub status: BatchStatus,
    pub outcomes: Vec<KeywordOutcome>,
    pub error_summary: Option<String>,
}

impl BatchJob {
    fn new(keywords: Vec<String>, language: String, provider: ProviderKind, prompt_version: String) -> Self {
        Self {
            id: Eid::new(),
            keywords,
            language,
            provider,
            prompt_version,
            status: BatchStatus::Pending,
            outcomes: vec![],
            error_summary: None,
        }
    }

    fn set_status(&mut self, status: BatchStatus) {
        log::debug!("batch={} status={:?}", self.id, status);
        self.status = status;
    }

    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.outcome)).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: Eid,
    pub status: BatchStatus,
    pub provider: ProviderKind,
    pub language: String,
    pub prompt_version: String,
    pub classified_count: usize,
    pub cached_count: usize,
    pub fallback_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub error_summary: Option<String>,
    /// Stored rows for every keyword that has one, in input order
    pub rows: Vec<KeywordRow>,
    pub outcomes: Vec<KeywordOutcome>,
    pub aliases: Vec<AliasEvent>,
    pub created: Vec<CreatedNode>,
}

impl BatchResult {
    fn from_job(job: BatchJob, rows: Vec<KeywordRow>, aliases: Vec<AliasEvent>, created: Vec<CreatedNode>) -> Self {
        Self {
            classified_count: job.count(|o| *o == Outcome::Classified),
            cached_count: job.count(|o| *o == Outcome::Cached),
            fallback_count: job.count(|o| matches!(o, Outcome::Fallback { .. })),
            skipped_count: job.count(|o| *o == Outcome::Skipped),
            failed_count: job.count(|o| *o == Outcome::Failed),
            batch_id: job.id,
            status: job.status,
            provider: job.provider,
            language: job.language,
            prompt_version: job.prompt_version,
            error_summary: job.error_summary,
            rows,
            outcomes: job.outcomes,
            aliases,
            created,
        }
    }
}

struct Commit {
    stats: UpsertStats,
    aliases: Vec<AliasEvent>,
    created: Vec<CreatedNode>,
}

/// The grouping engine: owns the stores and runs submissions.
///
/// Classification runs without any lock held. Only the commit step
/// (reconcile, write tree, write rows) is serialized.
pub struct Engine {
    config: Config,
    keywords: Arc<dyn KeywordManager>,
    taxonomy_store: Arc<dyn TaxonomyPersistence>,
    prompts: PromptStore,
    providers: ProviderRegistry,
    tree: RwLock<Arc<Taxonomy>>,
    commit_lock: Mutex<()>,
    dir_lock: Option<DataDirLock>,
}

impl Engine {
    pub fn new(
        config: Config,
        keywords: Arc<dyn KeywordManager>,
        taxonomy_store: Arc<dyn TaxonomyPersistence>,
        prompts: PromptStore,
        providers: ProviderRegistry,
        dir_lock: Option<DataDirLock>,
    ) -> Result<Self, GroupingError> {
        let tree = taxonomy_store.load().map_err(GroupingError::persistence)?;
        log::info!(
            "engine ready categories={} keywords={} providers={:?} writable={}",
            tree.len(),
            keywords.total().map_err(GroupingError::persistence)?,
            providers.available(),
            dir_lock.is_some()
        );

        Ok(Self {
            config,
            keywords,
            taxonomy_store,
            prompts,
            providers,
            tree: RwLock::new(Arc::new(tree)),
            commit_lock: Mutex::new(()),
            dir_lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn prompts(&self) -> &PromptStore {
        &self.prompts
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Current tree. Never blocks on a running classification.
    pub fn taxonomy(&self) -> Arc<Taxonomy> {
        match self.tree.read() {
            Ok(tree) => tree.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The digest text a classifier would see right now.
    pub fn digest(&self) -> String {
        build_digest(&self.taxonomy(), &self.config.digest).render(self.config.digest.max_chars)
    }

    pub fn query(&self, query: &KeywordQuery) -> Result<Page<KeywordRow>, GroupingError> {
        self.keywords.query(query).map_err(GroupingError::persistence)
    }

    pub fn snapshot(&self) -> Result<Vec<KeywordRow>, GroupingError> {
        self.keywords.snapshot().map_err(GroupingError::persistence)
    }

    pub fn submit<P>(
        &self,
        request: SubmitRequest,
        cancel: &CancelToken,
        progress: &P,
    ) -> Result<BatchResult, GroupingError>
    where
        P: Fn(Progress) + Sync + ?Sized,
    {
        let language = normalizer::normalize_language(request.language.as_deref())?;
        let batch = normalizer::normalize_batch(&request.keywords)?;
        let classifier = self
            .providers
            .get(request.provider)
            .map_err(|err| GroupingError::from_provider(request.provider, err))?;
        let displays: Vec<String> = batch.iter().map(|k| k.display.clone()).collect();
        let prompt = match self.prompts.resolve(request.prompt_version.as_deref()) {
            Ok(prompt) => prompt,
            Err(PromptError::NotFound(v)) => {
                return Err(GroupingError::input(format!("unknown prompt version {v:?}")))
            }
            Err(err) => {
                let job = BatchJob::new(
                    displays,
                    language,
                    request.provider,
                    request.prompt_version.unwrap_or_default(),
                );
                return Ok(abort(job, GroupingError::persistence(err)));
            }
        };

        let mut job = BatchJob::new(displays, language.clone(), request.provider, prompt.version.clone());
        log::info!(
            "batch={} provider={} language={language} prompt={} keywords={} force={}",
            job.id,
            job.provider,
            job.prompt_version,
            batch.len(),
            request.force
        );
        job.set_status(BatchStatus::Running);

        let prepared = match normalizer::mark_already_classified(
            batch,
            &language,
            &prompt.version,
            request.force,
            |key, lang| self.keywords.find(key, lang),
        ) {
            Ok(prepared) => prepared,
            Err(err) => return Ok(abort(job, GroupingError::persistence(err))),
        };

        let pending: Vec<usize> = prepared
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p.disposition, Disposition::NeedsClassification))
            .map(|(idx, _)| idx)
            .collect();
        let to_classify: Vec<String> = pending
            .iter()
            .map(|&idx| prepared[idx].keyword.display.clone())
            .collect();

        let digest = self.digest();
        let render = |keywords: &[String], strict: bool| prompt.render(&language, &digest, keywords, strict);
        let report = Orchestrator::new(classifier.as_ref(), OrchestratorSettings::from(&self.config)).run(
            &to_classify,
            &language,
            &render,
            cancel,
            progress,
        );

        // per-keyword outcome, in batch order
        let mut outcomes: Vec<Outcome> = prepared
            .iter()
            .map(|p| match p.disposition {
                Disposition::AlreadyClassified(_) => Outcome::Cached,
                Disposition::NeedsClassification => Outcome::Skipped,
            })
            .collect();
        let mut assignments: Vec<(usize, Assignment)> = vec![];
        for (&idx, result) in pending.iter().zip(report.results) {
            match result {
                KeywordResult::Classified(assignment) => {
                    outcomes[idx] = Outcome::Classified;
                    assignments.push((idx, assignment));
                }
                KeywordResult::Fallback { assignment, error } => {
                    outcomes[idx] = Outcome::Fallback {
                        reason: error.reason_code(),
                    };
                    // a stored classification beats a fallback
                    if prepared[idx].has_good_row() {
                        log::warn!(
                            "batch={} keeping stored row for {:?} after {}",
                            job.id,
                            prepared[idx].keyword.display,
                            error.reason_code()
                        );
                    } else {
                        assignments.push((idx, assignment));
                    }
                }
                KeywordResult::Skipped => {}
            }
        }

        let mut errors = report.errors;
        if report.cancelled {
            errors.push(format!(
                "cancelled, {} keywords skipped",
                outcomes.iter().filter(|o| **o == Outcome::Skipped).count()
            ));
        }

        let mut aliases = vec![];
        let mut created = vec![];
        if !assignments.is_empty() {
            let now = timestamp();
            let job_id = job.id.to_string();
            let keys: Vec<String> = assignments
                .iter()
                .map(|(idx, _)| prepared[*idx].keyword.key.clone())
                .collect();
            let proposed: Vec<Assignment> = assignments.iter().map(|(_, a)| a.clone()).collect();

            let reconciler = Reconciler::new(self.config.similarity_threshold, self.config.max_exemplars);
            let make_rows = |canonical: Vec<Assignment>| {
                canonical
                    .into_iter()
                    .zip(&keys)
                    .map(|(a, key)| KeywordRow {
                        normalized_text: key.clone(),
                        display_text: a.keyword,
                        language: language.clone(),
                        main_cat: a.main_cat,
                        sub_cat_1: a.sub_cat_1,
                        sub_cat_2: a.sub_cat_2,
                        theme: a.theme,
                        date_added: now.clone(),
                        prompt_version: prompt.version.clone(),
                        source_batch_id: job_id.clone(),
                    })
                    .collect()
            };
            let commit = self.commit(reconciler, &proposed, make_rows, false);

            match commit {
                Ok(c) => {
                    aliases = c.aliases;
                    created = c.created;
                }
                Err(err) => {
                    log::error!("batch={} commit failed: {err}", job.id);
                    errors.push(err.to_string());
                    for (idx, _) in &assignments {
                        outcomes[*idx] = Outcome::Failed;
                    }
                }
            }
        }

        // rows as stored, so date_added reflects the first classification
        let rows: Vec<KeywordRow> = prepared
            .iter()
            .zip(&outcomes)
            .filter_map(|(p, outcome)| match (&p.disposition, outcome) {
                (Disposition::AlreadyClassified(row), _) => Some(row.clone()),
                (_, Outcome::Classified | Outcome::Fallback { .. }) => self
                    .keywords
                    .find(&p.keyword.key, &language)
                    .ok()
                    .flatten()
                    .or_else(|| p.stored.clone()),
                _ => None,
            })
            .collect();

        job.outcomes = prepared
            .iter()
            .zip(outcomes)
            .map(|(p, outcome)| KeywordOutcome {
                keyword: p.keyword.display.clone(),
                outcome,
            })
            .collect();
        job.error_summary = (!errors.is_empty()).then(|| errors.join("; "));

        let status = if job.count(|o| *o == Outcome::Failed) > 0 {
            BatchStatus::Failed
        } else if job.count(|o| matches!(o, Outcome::Fallback { .. } | Outcome::Skipped)) > 0 {
            BatchStatus::CompletedWithFailures
        } else {
            BatchStatus::Completed
        };
        job.set_status(status);

        let result = BatchResult::from_job(job, rows, aliases, created);
        log::info!(
            "batch={} status={:?} classified={} cached={} fallback={} skipped={} failed={} new_categories={} aliases={}",
            result.batch_id,
            result.status,
            result.classified_count,
            result.cached_count,
            result.fallback_count,
            result.skipped_count,
            result.failed_count,
            result.created.len(),
            result.aliases.len()
        );

        Ok(result)
    }

    /// Load exported rows back, keeping their dates and category names.
    /// Category paths missing from the tree are added by exact name.
    pub fn restore(&self, rows: Vec<KeywordRow>) -> Result<UpsertStats, GroupingError> {
        if let Some(bad) = rows.iter().find(|r| !r.is_complete()) {
            return Err(GroupingError::input(format!(
                "row for {:?} has an empty column",
                bad.display_text
            )));
        }

        let restore_id = format!("restore-{}", Eid::new());
        let mut rows = rows;
        for row in rows.iter_mut() {
            row.normalized_text = normalizer::normalize_key(&row.display_text);
            row.language = normalizer::normalize_language(Some(&row.language))?;
            if row.prompt_version.is_empty() {
                row.prompt_version = match self.keywords.find(&row.normalized_text, &row.language) {
                    Ok(Some(existing)) if same_path(&existing, row) => existing.prompt_version,
                    _ => "restored".into(),
                };
            }
            if row.source_batch_id.is_empty() {
                row.source_batch_id = restore_id.clone();
            }
        }

        let proposed: Vec<Assignment> = rows
            .iter()
            .map(|r| Assignment {
                keyword: r.display_text.clone(),
                main_cat: r.main_cat.clone(),
                sub_cat_1: r.sub_cat_1.clone(),
                sub_cat_2: r.sub_cat_2.clone(),
                theme: r.theme.clone(),
            })
            .collect();

        let count = rows.len();
        let commit = self.commit(Reconciler::exact(self.config.max_exemplars), &proposed, move |_| rows, true)?;
        log::info!(
            "restored rows={count} inserted={} updated={} new_categories={}",
            commit.stats.inserted,
            commit.stats.updated,
            commit.created.len()
        );
        Ok(commit.stats)
    }

    /// Reconcile on a copy of the tree, write the tree, then write the rows.
    /// If the rows cannot be written the previous tree file is put back and
    /// the in-memory tree is left untouched.
    fn commit<F>(
        &self,
        reconciler: Reconciler,
        proposed: &[Assignment],
        make_rows: F,
        restore: bool,
    ) -> Result<Commit, GroupingError>
    where
        F: FnOnce(Vec<Assignment>) -> Vec<KeywordRow>,
    {
        self.writable()?;
        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.taxonomy();
        let mut working = (*current).clone();
        let (canonical, report) = reconciler
            .reconcile(&mut working, proposed, &timestamp())
            .map_err(GroupingError::persistence)?;
        let rows = make_rows(canonical);

        let tree_changed = proposed.iter().any(|a| a.main_cat != FALLBACK_CATEGORY);
        if tree_changed {
            self.taxonomy_store
                .save(&working)
                .map_err(GroupingError::persistence)?;
        }

        let written = if restore {
            self.keywords.restore(rows)
        } else {
            self.keywords.upsert(rows)
        };
        let stats = match written {
            Ok(stats) => stats,
            Err(err) => {
                if tree_changed {
                    if let Err(rollback) = self.taxonomy_store.save(&current) {
                        log::error!("failed to restore previous taxonomy: {rollback}");
                    }
                }
                return Err(GroupingError::persistence(err));
            }
        };

        if tree_changed {
            match self.tree.write() {
                Ok(mut tree) => *tree = Arc::new(working),
                Err(poisoned) => *poisoned.into_inner() = Arc::new(working),
            }
        }

        Ok(Commit {
            stats,
            aliases: report.aliases,
            created: report.created,
        })
    }

    fn writable(&self) -> Result<(), GroupingError> {
        match self.dir_lock {
            Some(_) => Ok(()),
            None => Err(GroupingError::persistence("store is opened read-only")),
        }
    }
}

/// Report a batch that could not start: nothing was sent, nothing written.
fn abort(mut job: BatchJob, err: GroupingError) -> BatchResult {
    log::error!("batch={} aborted: {err}", job.id);
    job.outcomes = job
        .keywords
        .iter()
        .map(|keyword| KeywordOutcome {
            keyword: keyword.clone(),
            outcome: Outcome::Skipped,
        })
        .collect();
    job.error_summary = Some(err.to_string());
    job.set_status(BatchStatus::Failed);
    BatchResult::from_job(job, vec![], vec![], vec![])
}

fn same_path(a: &KeywordRow, b: &KeywordRow) -> bool {
    a.main_cat == b.main_cat && a.sub_cat_1 == b.sub_cat_1 && a.sub_cat_2 == b.sub_cat_2 && a.theme == b.theme
}
