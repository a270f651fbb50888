use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use indexmap::IndexMap;
use log::{error, info, warn};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use spriteforge_contracts::config::Config;

pub mod classify;
pub mod pixel;
pub mod store;

pub use spriteforge_contracts::error::{
    ConfigurationError, ImageProcessingError, NoProvidersAvailable, ProviderError,
};

pub const MIN_VARIATIONS: u32 = 1;
pub const MAX_VARIATIONS: u32 = 4;

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// One provider's answer to a generation request. Partial batches (fewer
/// images than requested, non-empty errors) are valid and preserved.
#[derive(Debug, Default)]
pub struct ImageBatch {
    pub service: String,
    pub prompt: String,
    pub variations_requested: u32,
    pub images: Vec<DynamicImage>,
    pub errors: Vec<String>,
}

impl ImageBatch {
    fn empty(service: &str, prompt: &str, variations_requested: u32) -> Self {
        Self {
            service: service.to_string(),
            prompt: prompt.to_string(),
            variations_requested,
            images: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn failed(
        service: &str,
        prompt: &str,
        variations_requested: u32,
        error: impl Into<String>,
    ) -> Self {
        let mut batch = Self::empty(service, prompt, variations_requested);
        batch.errors.push(error.into());
        batch
    }

    pub fn variations_generated(&self) -> usize {
        self.images.len()
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Capability contract for one remote image-generation backend.
///
/// `is_available` is a pure credential-presence check and never performs
/// network I/O. `generate_one` produces exactly one image; adapters append
/// their own style suffix to the prompt before sending it.
pub trait ImageProvider: Send + Sync {
    fn service_name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn generate_one(&self, prompt: &str) -> Result<DynamicImage>;

    /// Pause between successive calls, for backends with tight rate limits.
    fn inter_call_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Sequential per-variation generation. Fails on the first per-call
    /// error; use [`generate_with_metadata`] to keep images collected before
    /// a failure.
    fn generate(&self, prompt: &str, variations: u32) -> Result<Vec<DynamicImage>> {
        let variations = variations.clamp(MIN_VARIATIONS, MAX_VARIATIONS);
        let mut images = Vec::with_capacity(variations as usize);
        for idx in 0..variations {
            if idx > 0 {
                let delay = self.inter_call_delay();
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            images.push(self.generate_one(prompt)?);
        }
        Ok(images)
    }
}

/// Failure-isolation boundary between one provider and the fan-out layer:
/// always returns a batch, never an error. Images collected before a
/// per-call failure are kept; the failure is recorded as one error string.
pub fn generate_with_metadata(
    provider: &dyn ImageProvider,
    prompt: &str,
    variations: u32,
) -> ImageBatch {
    let variations = variations.clamp(MIN_VARIATIONS, MAX_VARIATIONS);
    let service = provider.service_name();
    let mut batch = ImageBatch::empty(service, prompt, variations);

    info!("generating {variations} images with {service}...");
    for idx in 0..variations {
        if idx > 0 {
            let delay = provider.inter_call_delay();
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        match provider.generate_one(prompt) {
            Ok(image) => batch.images.push(image),
            Err(err) => {
                let message = error_chain_text(&err, 512);
                error!(
                    "{service} failed on variation {} of {variations}: {message}",
                    idx + 1
                );
                batch.errors.push(message);
                break;
            }
        }
    }
    info!(
        "{service} generated {} of {variations} images",
        batch.images.len()
    );
    batch
}

/// Holds every adapter with credentials present and fans a request out to
/// all of them concurrently.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every known adapter from explicit credentials and registers
    /// the usable ones.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(OpenAiProvider::new(config.openai_api_key.clone()));
        registry.register(FreepikProvider::new(config.freepik_api_key.clone()));
        registry.register(ReplicateProvider::new(config.replicate_api_token.clone()));
        registry.register(StabilityProvider::new(config.stability_api_key.clone()));
        // TODO: runway and leonardo adapters once their text-to-image APIs
        // settle enough to pin request shapes.
        if registry.providers.is_empty() {
            warn!("no image providers registered; configure at least one API key");
        }
        registry
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        if provider.is_available() {
            info!("registered {} provider", provider.service_name());
            self.providers.push(Box::new(provider));
        } else {
            warn!(
                "{} credentials missing; provider not registered",
                provider.service_name()
            );
        }
    }

    pub fn available(&self) -> Vec<&'static str> {
        self.providers
            .iter()
            .map(|provider| provider.service_name())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Dispatches one wrapped call per registered adapter, concurrently, and
    /// waits for all of them. The result map has exactly one entry per
    /// registered adapter, in registration order; all providers failing
    /// individually is not an error here.
    pub fn generate_all(
        &self,
        prompt: &str,
        variations: u32,
    ) -> Result<IndexMap<String, ImageBatch>> {
        if self.providers.is_empty() {
            return Err(NoProvidersAvailable.into());
        }
        let variations = variations.clamp(MIN_VARIATIONS, MAX_VARIATIONS);

        let batches: Vec<ImageBatch> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .providers
                .iter()
                .map(|provider| {
                    let provider = provider.as_ref();
                    scope.spawn(move || generate_with_metadata(provider, prompt, variations))
                })
                .collect();
            handles
                .into_iter()
                .zip(self.providers.iter())
                .map(|(handle, provider)| {
                    // A panicking provider thread must never abort siblings.
                    handle.join().unwrap_or_else(|_| {
                        ImageBatch::failed(
                            provider.service_name(),
                            prompt,
                            variations,
                            "provider thread panicked",
                        )
                    })
                })
                .collect()
        });

        let mut results = IndexMap::with_capacity(batches.len());
        for batch in batches {
            results.insert(batch.service.clone(), batch);
        }
        Ok(results)
    }
}

pub struct OpenAiProvider {
    api_key: Option<String>,
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            api_base: "https://api.openai.com/v1".to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = normalize_api_base(api_base.into());
        self
    }
}

impl ImageProvider for OpenAiProvider {
    fn service_name(&self) -> &'static str {
        "openai"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn generate_one(&self, prompt: &str) -> Result<DynamicImage> {
        let api_key = require_api_key(self.api_key.as_deref(), "OpenAI API key not configured")?;
        // DALL-E 2 supports the smallest output size.
        let styled = format!("{prompt}, pixel art style, 16-bit, retro game art");
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": "dall-e-2",
            "prompt": styled,
            "size": "256x256",
            "n": 1,
            "response_format": "url",
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .timeout(HTTP_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| ProviderError(format!("OpenAI request failed ({endpoint}): {err}")))?;
        let parsed = response_json_or_error("OpenAI", response)?;

        let url = parsed
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError("OpenAI response contained no image URL".to_string()))?;
        download_image(&self.http, "OpenAI", url)
    }
}

pub struct FreepikProvider {
    api_key: Option<String>,
    api_base: String,
    http: HttpClient,
}

impl FreepikProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            api_base: "https://api.freepik.com/v1".to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = normalize_api_base(api_base.into());
        self
    }
}

impl ImageProvider for FreepikProvider {
    fn service_name(&self) -> &'static str {
        "freepik"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    // Freepik rate-limits aggressively on free keys.
    fn inter_call_delay(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn generate_one(&self, prompt: &str) -> Result<DynamicImage> {
        let api_key = require_api_key(self.api_key.as_deref(), "Freepik API key not configured")?;
        let styled = format!("{prompt}, pixel art style, 16-bit, retro game sprite");
        let endpoint = format!("{}/ai/text-to-image", self.api_base);
        let payload = json!({
            "prompt": styled,
            "num_images": 1,
            "image": { "size": "square" },
            "styling": { "style": "digital-art" },
        });

        let response = self
            .http
            .post(&endpoint)
            .header("x-freepik-api-key", api_key)
            .timeout(HTTP_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| ProviderError(format!("Freepik request failed ({endpoint}): {err}")))?;
        let parsed = response_json_or_error("Freepik", response)?;

        let url = parsed
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError("Freepik response contained no image URL".to_string()))?;
        download_image(&self.http, "Freepik", url)
    }
}

pub struct ReplicateProvider {
    api_token: Option<String>,
    api_base: String,
    http: HttpClient,
}

impl ReplicateProvider {
    /// Pinned Stable Diffusion version on Replicate.
    const MODEL_VERSION: &'static str =
        "db21e45d3f7023abc2a46ee38a23973f6dce16bb082a930b0c49861f96d1e5bf";
    const POLL_INTERVAL: Duration = Duration::from_secs(1);
    const POLL_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(api_token: Option<String>) -> Self {
        Self {
            api_token,
            api_base: "https://api.replicate.com/v1".to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = normalize_api_base(api_base.into());
        self
    }

    fn poll_prediction(&self, poll_url: &str, api_token: &str) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_token)
                .timeout(HTTP_TIMEOUT)
                .send()
                .map_err(|err| {
                    ProviderError(format!("Replicate poll request failed ({poll_url}): {err}"))
                })?;
            let prediction = response_json_or_error("Replicate", response)?;
            let status = prediction
                .get("status")
                .and_then(Value::as_str)
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_default();
            if status == "succeeded" {
                return Ok(prediction);
            }
            if matches!(status.as_str(), "failed" | "canceled") {
                return Err(ProviderError(format!(
                    "Replicate prediction failed: {}",
                    truncate_text(&prediction.to_string(), 512)
                ))
                .into());
            }
            if started.elapsed() >= Self::POLL_TIMEOUT {
                return Err(ProviderError(format!(
                    "Replicate polling timed out after {}s",
                    Self::POLL_TIMEOUT.as_secs()
                ))
                .into());
            }
            thread::sleep(Self::POLL_INTERVAL);
        }
    }

    fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(url) => {
                let trimmed = url.trim();
                if !trimmed.is_empty()
                    && trimmed.starts_with("http")
                    && !out.iter().any(|existing| existing == trimmed)
                {
                    out.push(trimmed.to_string());
                }
            }
            Value::Array(rows) => {
                for row in rows {
                    Self::extract_output_urls(row, out);
                }
            }
            Value::Object(obj) => {
                for key in ["url", "urls", "output"] {
                    if let Some(nested) = obj.get(key) {
                        Self::extract_output_urls(nested, out);
                    }
                }
            }
            _ => {}
        }
    }
}

impl ImageProvider for ReplicateProvider {
    fn service_name(&self) -> &'static str {
        "replicate"
    }

    fn is_available(&self) -> bool {
        self.api_token.is_some()
    }

    fn generate_one(&self, prompt: &str) -> Result<DynamicImage> {
        let api_token = require_api_key(
            self.api_token.as_deref(),
            "Replicate API token not configured",
        )?;
        let styled = format!("{prompt}, pixel art style, 16-bit, retro game sprite, low resolution");
        let endpoint = format!("{}/predictions", self.api_base);
        let payload = json!({
            "version": Self::MODEL_VERSION,
            "input": {
                "prompt": styled,
                "width": 512,
                "height": 512,
                "num_outputs": 1,
                "num_inference_steps": 50,
                "guidance_scale": 7.5,
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_token)
            .header("Prefer", "wait")
            .timeout(HTTP_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| {
                ProviderError(format!("Replicate request failed ({endpoint}): {err}"))
            })?;
        let mut prediction = response_json_or_error("Replicate", response)?;

        let status = prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if status != "succeeded" {
            if matches!(status.as_str(), "starting" | "processing") {
                let poll_url = prediction
                    .pointer("/urls/get")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        ProviderError("Replicate prediction missing poll URL".to_string())
                    })?
                    .to_string();
                prediction = self.poll_prediction(&poll_url, api_token)?;
            } else {
                return Err(ProviderError(format!(
                    "Replicate prediction failed: {}",
                    truncate_text(&prediction.to_string(), 512)
                ))
                .into());
            }
        }

        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            Self::extract_output_urls(output, &mut urls);
        }
        let url = urls
            .first()
            .ok_or_else(|| ProviderError("Replicate response returned no image URLs".to_string()))?;
        download_image(&self.http, "Replicate", url)
    }
}

pub struct StabilityProvider {
    api_key: Option<String>,
    api_base: String,
    http: HttpClient,
}

impl StabilityProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            api_base: "https://api.stability.ai/v1".to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = normalize_api_base(api_base.into());
        self
    }
}

impl ImageProvider for StabilityProvider {
    fn service_name(&self) -> &'static str {
        "stability"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn generate_one(&self, prompt: &str) -> Result<DynamicImage> {
        let api_key = require_api_key(self.api_key.as_deref(), "Stability API key not configured")?;
        let styled = format!("{prompt}, pixel art style, 16-bit, retro game sprite, pixelated");
        let endpoint = format!(
            "{}/generation/stable-diffusion-v1-6/text-to-image",
            self.api_base
        );
        let payload = json!({
            "text_prompts": [{ "text": styled, "weight": 1.0 }],
            "cfg_scale": 7,
            "height": 512,
            "width": 512,
            "samples": 1,
            "steps": 30,
            "style_preset": "digital-art",
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .timeout(HTTP_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| {
                ProviderError(format!("Stability request failed ({endpoint}): {err}"))
            })?;
        let parsed = response_json_or_error("Stability", response)?;

        let artifact_b64 = parsed
            .get("artifacts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|artifact| {
                artifact.get("finishReason").and_then(Value::as_str) == Some("SUCCESS")
            })
            .and_then(|artifact| artifact.get("base64"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ProviderError("Stability response contained no successful artifacts".to_string())
            })?;
        let bytes = BASE64
            .decode(artifact_b64.as_bytes())
            .map_err(|err| ProviderError(format!("Stability image base64 decode failed: {err}")))?;
        decode_image("Stability", &bytes)
    }
}

fn require_api_key<'a>(api_key: Option<&'a str>, message: &str) -> Result<&'a str> {
    api_key.ok_or_else(|| ConfigurationError(message.to_string()).into())
}

fn normalize_api_base(api_base: String) -> String {
    api_base.trim().trim_end_matches('/').to_string()
}

pub(crate) fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("failed reading {service} response body"))?;
    if !status.is_success() {
        return Err(ProviderError(format!(
            "{service} API returned status {}: {}",
            status.as_u16(),
            truncate_text(&body, 512)
        ))
        .into());
    }
    if body.trim().is_empty() {
        return Err(ProviderError(format!("{service} API returned an empty body")).into());
    }
    match serde_json::from_str(&body) {
        Ok(value) => Ok(value),
        Err(err) => Err(ProviderError(format!("{service} returned malformed JSON: {err}")).into()),
    }
}

fn download_image(http: &HttpClient, service: &str, url: &str) -> Result<DynamicImage> {
    let response = http
        .get(url)
        .timeout(HTTP_TIMEOUT)
        .send()
        .map_err(|err| ProviderError(format!("{service} image download failed ({url}): {err}")))?;
    if !response.status().is_success() {
        return Err(ProviderError(format!(
            "{service} image download failed with status {}",
            response.status().as_u16()
        ))
        .into());
    }
    let bytes = response
        .bytes()
        .map_err(|err| ProviderError(format!("{service} image download was truncated: {err}")))?;
    decode_image(service, &bytes)
}

fn decode_image(service: &str, bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|err| {
        ProviderError(format!("{service} returned an undecodable image payload: {err}")).into()
    })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let prefix: String = value.chars().take(max_chars).collect();
    format!("{prefix}...")
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    truncate_text(&format!("{err:#}"), max_chars)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use base64::Engine as _;
    use httpmock::prelude::*;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use spriteforge_contracts::config::Config;

    use super::*;

    /// Succeeds for the first `succeed_for` calls, then fails every call.
    struct ScriptedProvider {
        name: &'static str,
        succeed_for: usize,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, succeed_for: usize) -> Self {
            Self {
                name,
                succeed_for,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ImageProvider for ScriptedProvider {
        fn service_name(&self) -> &'static str {
            self.name
        }

        fn is_available(&self) -> bool {
            true
        }

        fn generate_one(&self, _prompt: &str) -> Result<DynamicImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.succeed_for {
                Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                    4,
                    4,
                    Rgb([200, 40, 40]),
                )))
            } else {
                Err(ProviderError(format!("{} call {} failed", self.name, call + 1)).into())
            }
        }
    }

    struct PanickingProvider;

    impl ImageProvider for PanickingProvider {
        fn service_name(&self) -> &'static str {
            "panicky"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn generate_one(&self, _prompt: &str) -> Result<DynamicImage> {
            panic!("misbehaving adapter");
        }
    }

    fn png_bytes() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .expect("png encode");
        buffer.into_inner()
    }

    #[test]
    fn generate_all_with_zero_providers_fails() {
        let registry = ProviderRegistry::new();
        let err = registry
            .generate_all("a cute pixel art cat", 1)
            .expect_err("empty registry must fail");
        assert!(err.downcast_ref::<NoProvidersAvailable>().is_some());
    }

    #[test]
    fn one_failing_provider_never_suppresses_others() -> Result<()> {
        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("steady", usize::MAX));
        registry.register(ScriptedProvider::new("flaky", 0));

        let results = registry.generate_all("a cute pixel art cat", 2)?;
        assert_eq!(results.len(), 2);

        let steady = &results["steady"];
        assert_eq!(steady.variations_requested, 2);
        assert_eq!(steady.variations_generated(), 2);
        assert!(steady.succeeded());

        let flaky = &results["flaky"];
        assert_eq!(flaky.variations_requested, 2);
        assert_eq!(flaky.variations_generated(), 0);
        assert_eq!(flaky.errors.len(), 1);
        Ok(())
    }

    #[test]
    fn result_map_keeps_registration_order() -> Result<()> {
        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("zeta", usize::MAX));
        registry.register(ScriptedProvider::new("alpha", usize::MAX));
        registry.register(ScriptedProvider::new("mu", usize::MAX));

        let results = registry.generate_all("a coin", 1)?;
        let names: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mu"]);
        Ok(())
    }

    #[test]
    fn panicking_provider_yields_synthesized_batch() -> Result<()> {
        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("steady", usize::MAX));
        registry.register(PanickingProvider);

        let results = registry.generate_all("a coin", 1)?;
        assert_eq!(results.len(), 2);
        assert_eq!(results["steady"].variations_generated(), 1);

        let panicky = &results["panicky"];
        assert_eq!(panicky.variations_generated(), 0);
        assert_eq!(panicky.errors, vec!["provider thread panicked".to_string()]);
        Ok(())
    }

    #[test]
    fn wrapper_keeps_images_collected_before_failure() {
        let provider = ScriptedProvider::new("flaky", 2);
        let batch = generate_with_metadata(&provider, "a tree", 4);
        assert_eq!(batch.variations_requested, 4);
        assert_eq!(batch.variations_generated(), 2);
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors[0].contains("call 3 failed"));
        assert!(!batch.succeeded());
    }

    #[test]
    fn wrapper_clamps_variations_into_range() {
        let provider = ScriptedProvider::new("steady", usize::MAX);
        let batch = generate_with_metadata(&provider, "a tree", 9);
        assert_eq!(batch.variations_requested, MAX_VARIATIONS);
        assert_eq!(batch.variations_generated(), MAX_VARIATIONS as usize);

        let provider = ScriptedProvider::new("steady", usize::MAX);
        let batch = generate_with_metadata(&provider, "a tree", 0);
        assert_eq!(batch.variations_requested, MIN_VARIATIONS);
    }

    #[test]
    fn trait_generate_fails_on_first_error() {
        let provider = ScriptedProvider::new("flaky", 1);
        let err = provider
            .generate("a tree", 3)
            .expect_err("second call fails");
        assert!(err.downcast_ref::<ProviderError>().is_some());

        let provider = ScriptedProvider::new("steady", usize::MAX);
        let images = provider.generate("a tree", 2).expect("both calls succeed");
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn from_config_registers_only_configured_providers() {
        let config = Config {
            openai_api_key: Some("openai-key".to_string()),
            stability_api_key: Some("stability-key".to_string()),
            ..Config::default()
        };
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.available(), vec!["openai", "stability"]);
        assert_eq!(registry.len(), 2);

        let registry = ProviderRegistry::from_config(&Config::default());
        assert!(registry.is_empty());
    }

    #[test]
    fn manifest_totals_follow_fanned_out_batches() -> Result<()> {
        use spriteforge_contracts::classify::QueryClassification;
        use spriteforge_contracts::manifest::{ProviderReport, SessionManifest};

        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("steady", usize::MAX));
        registry.register(ScriptedProvider::new("flaky", 1));

        let results = registry.generate_all("a cute pixel art cat", 2)?;
        assert_eq!(results.len(), 2);

        let classification = QueryClassification {
            is_image_request: true,
            confidence: 0.95,
            image_description: Some("a cute pixel art cat".to_string()),
            rejection_reason: None,
        };
        let mut manifest =
            SessionManifest::new("a cute pixel art cat", classification, "/out/session");
        for (provider, batch) in &results {
            assert_eq!(batch.variations_requested, 2);
            let mut report = ProviderReport::new(batch.variations_requested);
            for error in &batch.errors {
                report.record_error(error.clone());
            }
            for _ in &batch.images {
                report.record_saved();
            }
            manifest.record_provider(provider.clone(), report);
        }

        let summed: u32 = manifest
            .providers
            .values()
            .map(|report| report.variations_generated)
            .sum();
        assert_eq!(manifest.total_images_generated, summed);
        assert_eq!(manifest.total_images_generated, 3);
        Ok(())
    }

    #[test]
    fn adapters_without_credentials_fail_with_configuration_error() {
        let provider = OpenAiProvider::new(None);
        assert!(!provider.is_available());
        let err = provider.generate_one("a cat").expect_err("no key");
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    #[test]
    fn openai_adapter_generates_and_downloads() -> Result<()> {
        let server = MockServer::start();
        let image_mock = server.mock(|when, then| {
            when.method(GET).path("/image.png");
            then.status(200).body(png_bytes());
        });
        let generation_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/images/generations")
                .header("authorization", "Bearer test-key")
                .json_body_partial(r#"{"model": "dall-e-2", "n": 1, "size": "256x256"}"#);
            then.status(200)
                .json_body(json!({"data": [{"url": server.url("/image.png")}]}));
        });

        let provider =
            OpenAiProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        let image = provider.generate_one("a heart icon")?;
        assert_eq!((image.width(), image.height()), (2, 2));

        generation_mock.assert();
        image_mock.assert();
        Ok(())
    }

    #[test]
    fn openai_adapter_appends_style_suffix() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/image.png");
            then.status(200).body(png_bytes());
        });
        let generation_mock = server.mock(|when, then| {
            when.method(POST).path("/images/generations").json_body_partial(
                r#"{"prompt": "a heart icon, pixel art style, 16-bit, retro game art"}"#,
            );
            then.status(200)
                .json_body(json!({"data": [{"url": server.url("/image.png")}]}));
        });

        let provider =
            OpenAiProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        provider.generate_one("a heart icon")?;
        generation_mock.assert();
        Ok(())
    }

    #[test]
    fn openai_adapter_surfaces_bad_status_as_provider_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/images/generations");
            then.status(429).body("rate limited");
        });

        let provider =
            OpenAiProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        let err = provider.generate_one("a heart icon").expect_err("429");
        let provider_err = err
            .downcast_ref::<ProviderError>()
            .expect("typed provider error");
        assert!(provider_err.0.contains("429"));
    }

    #[test]
    fn stability_adapter_decodes_base64_artifacts() -> Result<()> {
        let server = MockServer::start();
        let generation_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/generation/stable-diffusion-v1-6/text-to-image");
            then.status(200).json_body(json!({
                "artifacts": [
                    {"finishReason": "CONTENT_FILTERED", "base64": ""},
                    {"finishReason": "SUCCESS", "base64": BASE64.encode(png_bytes())},
                ]
            }));
        });

        let provider =
            StabilityProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        let image = provider.generate_one("a potion")?;
        assert_eq!((image.width(), image.height()), (2, 2));
        generation_mock.assert();
        Ok(())
    }

    #[test]
    fn stability_adapter_rejects_batches_without_successful_artifacts() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/generation/stable-diffusion-v1-6/text-to-image");
            then.status(200)
                .json_body(json!({"artifacts": [{"finishReason": "ERROR"}]}));
        });

        let provider =
            StabilityProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        let err = provider.generate_one("a potion").expect_err("no artifacts");
        assert!(err.downcast_ref::<ProviderError>().is_some());
    }

    #[test]
    fn freepik_adapter_downloads_from_data_url() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/image.png");
            then.status(200).body(png_bytes());
        });
        let generation_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/ai/text-to-image")
                .header("x-freepik-api-key", "test-key");
            then.status(200)
                .json_body(json!({"data": [{"url": server.url("/image.png")}]}));
        });

        let provider =
            FreepikProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        let image = provider.generate_one("a shield")?;
        assert_eq!((image.width(), image.height()), (2, 2));
        generation_mock.assert();
        Ok(())
    }

    #[test]
    fn replicate_adapter_polls_until_succeeded() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/image.png");
            then.status(200).body(png_bytes());
        });
        let poll_mock = server.mock(|when, then| {
            when.method(GET).path("/predictions/p1");
            then.status(200).json_body(json!({
                "status": "succeeded",
                "output": [server.url("/image.png")],
            }));
        });
        let create_mock = server.mock(|when, then| {
            when.method(POST).path("/predictions");
            then.status(201).json_body(json!({
                "id": "p1",
                "status": "processing",
                "urls": {"get": server.url("/predictions/p1")},
            }));
        });

        let provider = ReplicateProvider::new(Some("test-token".to_string()))
            .with_api_base(server.base_url());
        let image = provider.generate_one("a spaceship")?;
        assert_eq!((image.width(), image.height()), (2, 2));
        create_mock.assert();
        poll_mock.assert();
        Ok(())
    }

    #[test]
    fn replicate_adapter_fails_on_canceled_prediction() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/predictions");
            then.status(200)
                .json_body(json!({"id": "p1", "status": "canceled"}));
        });

        let provider = ReplicateProvider::new(Some("test-token".to_string()))
            .with_api_base(server.base_url());
        let err = provider.generate_one("a spaceship").expect_err("canceled");
        assert!(err.downcast_ref::<ProviderError>().is_some());
    }

    #[test]
    fn undecodable_image_payload_is_a_provider_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/image.png");
            then.status(200).body("not a png");
        });
        server.mock(|when, then| {
            when.method(POST).path("/images/generations");
            then.status(200)
                .json_body(json!({"data": [{"url": server.url("/image.png")}]}));
        });

        let provider =
            OpenAiProvider::new(Some("test-key".to_string())).with_api_base(server.base_url());
        let err = provider.generate_one("a heart icon").expect_err("bad png");
        let provider_err = err.downcast_ref::<ProviderError>().expect("typed error");
        assert!(provider_err.0.contains("undecodable"));
    }

    #[test]
    fn truncate_text_limits_long_bodies() {
        assert_eq!(truncate_text("short", 512), "short");
        let long = "x".repeat(600);
        let truncated = truncate_text(&long, 512);
        assert_eq!(truncated.chars().count(), 515);
        assert!(truncated.ends_with("..."));
    }
}
