use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::openai::SYSTEM_PROMPT;
use super::{http, schema, Assignment, Classifier, ClassifyRequest, ProviderError, ProviderKind, TEMPERATURE};
use crate::config::ProviderConfig;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClassifier {
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
    max_batch_keywords: usize,
    client: Client,
}

impl GeminiClassifier {
    pub fn new(api_key: String, settings: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string())
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
            "x-goog-api-key",
            HeaderValue::from_str(self.api_key.trim())
                .map_err(|_| ProviderError::Auth("invalid Gemini API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: SYSTEM_PROMPT }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: self.max_tokens,
                response_mime_type: "application/json",
            },
        };

        let parsed: GenerateResponse = http::send_json(
            self.client
                .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
                .headers(headers)
                .json(&body),
        )?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::Malformed("gemini response has no text".into()));
        }
        Ok(text)
    }
}

impl Classifier for GeminiClassifier {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    temperature: f32,
    max_output_tokens: usize,
    response_mime_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case() {
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: "sys" }],
            },
            contents: vec![],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: 10,
                response_mime_type: "application/json",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 10);
        assert!(json["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn response_text_is_joined() {
        let raw = r#"{"candidates": [{"content": {"parts": [{"text": "{\"a\""}, {"text": ": 1}"}], "role": "model"}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let parts = &parsed.candidates[0].content.as_ref().unwrap().parts;
        let text: String = parts.iter().filter_map(|p| p.text.clone()).collect();
        assert_eq!(text, r#"{"a": 1}"#);
    }
}
