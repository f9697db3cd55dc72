use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{http, schema, Assignment, Classifier, ClassifyRequest, ProviderError, ProviderKind, TEMPERATURE};
use crate::config::ProviderConfig;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub(super) const SYSTEM_PROMPT: &str =
    "You classify search keywords into a three-level category taxonomy. Reply with a single JSON object and nothing else.";

/// Chat completions client, shared by every OpenAI-compatible endpoint.
pub struct ChatCompletions {
    kind: ProviderKind,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
    max_batch_keywords: usize,
    client: Client,
}

impl ChatCompletions {
    pub fn new(
        kind: ProviderKind,
        api_key: String,
        base_url: String,
        settings: &ProviderConfig,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            kind,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            max_batch_keywords: settings.max_batch_keywords,
            client: http::client(timeout)?,
        })
    }

    pub fn openai(api_key: String, settings: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());
        Self::new(ProviderKind::OpenAi, api_key, base_url, settings, timeout)
    }

    fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| ProviderError::Auth(format!("invalid {} API key", self.kind)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let parsed: ChatResponse = http::send_json(
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .headers(headers)
                .json(&body),
        )?;

        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ProviderError::Malformed(format!("{} response has no message content", self.kind)))
    }
}

impl Classifier for ChatCompletions {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn max_batch_keywords(&self) -> usize {
        self.max_batch_keywords
    }

    fn classify(&self, request: &ClassifyRequest) -> Result<Vec<Assignment>, ProviderError> {
        let content = self.complete(&request.prompt)?;
        schema::parse_assignments(&content, &request.keywords)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    response_format: ResponseFormat<'a>,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
