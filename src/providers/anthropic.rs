use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::openai::SYSTEM_PROMPT;
use super::{http, schema, Assignment, Classifier, ClassifyRequest, ProviderError, ProviderKind, TEMPERATURE};
use crate::config::ProviderConfig;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeClassifier {
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
    max_batch_keywords: usize,
    client: Client,
}

impl ClaudeClassifier {
    pub fn new(api_key: String, settings: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            max_batch_keywords: settings.max_batch_keywords,
            client: http::client(timeout)?,
        })
    }

    fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.trim())
                .map_err(|_| ProviderError::Auth("invalid Anthropic API key".into()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: TEMPERATURE,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: vec![ContentBlock {
                    kind: "text",
                    text: prompt,
                }],
            }],
        };

        let parsed: MessagesResponse = http::send_json(
            self.client
                .post(format!("{}/messages", self.base_url))
                .headers(headers)
                .json(&body),
        )?;

        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if answer.trim().is_empty() {
            return Err(ProviderError::Malformed("claude response missing text content".into()));
        }
        if parsed.stop_reason.as_deref() == Some("max_tokens") {
            log::warn!("provider=claude outcome=truncated max_tokens={}", self.max_tokens);
        }
        Ok(answer)
    }
}

impl Classifier for ClaudeClassifier {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
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
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
struct ContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
