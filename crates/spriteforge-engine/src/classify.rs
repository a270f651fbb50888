//! Free-text query classification via the Gemini API: decides whether a query
//! asks for an image and extracts a clean description for the generators.

use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use spriteforge_contracts::classify::QueryClassification;
use spriteforge_contracts::config::Config;

use crate::{response_json_or_error, ConfigurationError, ProviderError, HTTP_TIMEOUT};

const CLASSIFIER_MODEL: &str = "gemini-2.5-flash";

const SYSTEM_PROMPT: &str = "You classify user queries for a pixel art generation tool. \
Decide whether the query is a request to generate, create, draw or depict an image. \
Greetings, questions, commands unrelated to images, and empty queries are not image requests. \
When the query is an image request, extract a concise visual description of the subject, \
stripped of phrasing like 'draw me' or 'generate an image of'. \
When it is not, give a short reason. \
Respond with JSON only.";

/// Gemini-backed query classifier. Construction fails fast when no Google
/// API key is configured, so the pipeline never reaches the providers with
/// an unclassifiable query.
#[derive(Debug)]
pub struct QueryClassifier {
    api_key: String,
    api_base: String,
    http: HttpClient,
}

impl QueryClassifier {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .google_api_key
            .clone()
            .ok_or_else(|| {
                ConfigurationError(
                    "GOOGLE_API_KEY is required for query classification".to_string(),
                )
            })?;
        Ok(Self {
            api_key,
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            http: HttpClient::new(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn classify(&self, query: &str) -> Result<QueryClassification> {
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.api_base, CLASSIFIER_MODEL
        );
        let payload = json!({
            "system_instruction": {
                "parts": [{ "text": SYSTEM_PROMPT }]
            },
            "contents": [{
                "role": "user",
                "parts": [{ "text": query }]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "is_image_request": { "type": "BOOLEAN" },
                        "confidence": { "type": "NUMBER" },
                        "image_description": { "type": "STRING" },
                        "rejection_reason": { "type": "STRING" },
                    },
                    "required": ["is_image_request", "confidence"],
                },
            },
        });

        debug!("classifying query with {CLASSIFIER_MODEL}");
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(HTTP_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| ProviderError(format!("Gemini request failed ({endpoint}): {err}")))?;
        let parsed = response_json_or_error("Gemini", response)?;

        let text = parsed
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ProviderError("Gemini response contained no candidates".to_string())
            })?;
        let classification: QueryClassification = serde_json::from_str(text)
            .with_context(|| {
                ProviderError(format!(
                    "Gemini returned an unparsable classification: {}",
                    crate::truncate_text(text, 256)
                ))
            })?;

        info!(
            "classified query: image_request={} confidence={:.2}",
            classification.is_image_request, classification.confidence
        );
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;
    use spriteforge_contracts::config::Config;

    use super::*;

    fn config_with_key() -> Config {
        Config {
            google_api_key: Some("google-key".to_string()),
            ..Config::default()
        }
    }

    fn gemini_body(classification: Value) -> Value {
        json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": classification.to_string() }]
                }
            }]
        })
    }

    #[test]
    fn construction_fails_fast_without_google_key() {
        let err = QueryClassifier::new(&Config::default()).expect_err("no key");
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    #[test]
    fn classify_parses_accepted_query() -> Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/models/{CLASSIFIER_MODEL}:generateContent"))
                .query_param("key", "google-key");
            then.status(200).json_body(gemini_body(json!({
                "is_image_request": true,
                "confidence": 0.97,
                "image_description": "a cute pixel art cat",
            })));
        });

        let classifier =
            QueryClassifier::new(&config_with_key())?.with_api_base(server.base_url());
        let classification = classifier.classify("draw me a cute cat")?;
        assert!(classification.is_image_request);
        assert_eq!(
            classification.description_or("draw me a cute cat"),
            "a cute pixel art cat"
        );
        mock.assert();
        Ok(())
    }

    #[test]
    fn classify_parses_rejection() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path(format!("/models/{CLASSIFIER_MODEL}:generateContent"));
            then.status(200).json_body(gemini_body(json!({
                "is_image_request": false,
                "confidence": 0.99,
                "rejection_reason": "greeting, not an image request",
            })));
        });

        let classifier =
            QueryClassifier::new(&config_with_key())?.with_api_base(server.base_url());
        let classification = classifier.classify("hello there")?;
        assert!(!classification.is_image_request);
        assert_eq!(
            classification.rejection_reason.as_deref(),
            Some("greeting, not an image request")
        );
        Ok(())
    }

    #[test]
    fn classify_rejects_candidate_free_responses() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path(format!("/models/{CLASSIFIER_MODEL}:generateContent"));
            then.status(200).json_body(json!({"candidates": []}));
        });

        let classifier =
            QueryClassifier::new(&config_with_key())?.with_api_base(server.base_url());
        let err = classifier.classify("a cat").expect_err("no candidates");
        assert!(err.downcast_ref::<ProviderError>().is_some());
        Ok(())
    }

    #[test]
    fn classify_surfaces_api_errors() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path(format!("/models/{CLASSIFIER_MODEL}:generateContent"));
            then.status(403).body("forbidden");
        });

        let classifier =
            QueryClassifier::new(&config_with_key())?.with_api_base(server.base_url());
        let err = classifier.classify("a cat").expect_err("403");
        let provider_err = err.downcast_ref::<ProviderError>().expect("typed error");
        assert!(provider_err.0.contains("403"));
        Ok(())
    }
}
