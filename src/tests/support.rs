use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::grouping::{CancelToken, Engine, EngineFactory, EnginePaths, Progress, SubmitRequest};
use crate::providers::{Assignment, ClassifyRequest, Classifier, ProviderError, ProviderKind, ProviderRegistry};

type Script = Box<dyn Fn(&ClassifyRequest, usize) -> Result<Vec<Assignment>, ProviderError> + Send + Sync>;

/// In-memory classifier. `script` gets the request and the zero-based call
/// number; every request is recorded.
pub struct FakeClassifier {
    kind: ProviderKind,
    max_batch: usize,
    calls: Mutex<Vec<ClassifyRequest>>,
    script: Script,
}

impl FakeClassifier {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ClassifyRequest, usize) -> Result<Vec<Assignment>, ProviderError> + Send + Sync + 'static,
    {
        Self {
            kind: ProviderKind::OpenAi,
            max_batch: 100,
            calls: Mutex::new(vec![]),
            script: Box::new(script),
        }
    }

    /// Every keyword goes to the path returned by `path`.
    pub fn mapping<F>(path: F) -> Self
    where
        F: Fn(&str) -> [String; 4] + Send + Sync + 'static,
    {
        Self::new(move |request, _| Ok(request.keywords.iter().map(|k| assign(k, path(k))).collect()))
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn calls(&self) -> Vec<ClassifyRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Keywords sent across all calls
    pub fn sent_keywords(&self) -> Vec<String> {
        self.calls().into_iter().flat_map(|c| c.keywords).collect()
    }
}

impl Classifier for FakeClassifier {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn max_batch_keywords(&self) -> usize {
        self.max_batch
    }

    fn classify(&self, request: &ClassifyRequest) -> Result<Vec<Assignment>, ProviderError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() - 1
        };
        (self.script)(request, call)
    }
}

pub fn assign(keyword: &str, path: [String; 4]) -> Assignment {
    let [main_cat, sub_cat_1, sub_cat_2, theme] = path;
    Assignment {
        keyword: keyword.to_string(),
        main_cat,
        sub_cat_1,
        sub_cat_2,
        theme,
    }
}

pub fn path(main: &str, sub1: &str, sub2: &str, theme: &str) -> [String; 4] {
    [main.into(), sub1.into(), sub2.into(), theme.into()]
}

/// Fast retries, small chunks.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.backoff_base_ms = 0;
    config.backoff_max_ms = 0;
    config.workers = 2;
    config
}

pub fn paths(tmp: &tempfile::TempDir) -> EnginePaths {
    EnginePaths::new(tmp.path().to_str().unwrap()).unwrap()
}

pub fn engine_with(tmp: &tempfile::TempDir, classifier: Arc<FakeClassifier>) -> Engine {
    engine_with_config(tmp, classifier, test_config())
}

pub fn engine_with_config(tmp: &tempfile::TempDir, classifier: Arc<FakeClassifier>, config: Config) -> Engine {
    EngineFactory::create_engine_with(&paths(tmp), config, ProviderRegistry::empty().with(classifier), true).unwrap()
}

pub fn request(keywords: &[&str]) -> SubmitRequest {
    SubmitRequest {
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        language: Some("en".into()),
        provider: ProviderKind::OpenAi,
        prompt_version: None,
        force: false,
    }
}

pub fn submit(engine: &Engine, keywords: &[&str]) -> crate::grouping::BatchResult {
    engine
        .submit(request(keywords), &CancelToken::new(), &|_: Progress| {})
        .unwrap()
}
