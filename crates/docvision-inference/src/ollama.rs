//! Ollama vision and embedding backends.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use docvision_core::{
    logging::SLOW_OPERATION_MS, EmbeddingBackend, Error, PageImage, Result, VisionBackend,
};

/// Timeout for health probes.
const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Timeout for embedding requests.
const EMBED_TIMEOUT_SECS: u64 = 60;

/// Ollama-based vision backend (e.g., qwen2.5vl, llava).
///
/// One instance per endpoint: the GPU host and the CPU container each get
/// their own.
pub struct OllamaVisionBackend {
    base_url: String,
    model: String,
    temperature: f32,
    client: Client,
    timeout_secs: u64,
}

impl OllamaVisionBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: docvision_core::defaults::VISION_TEMPERATURE,
            client: Client::new(),
            timeout_secs: docvision_core::defaults::INFERENCE_TIMEOUT_SECS,
        }
    }

    /// HTTP timeout; the router applies its own timeout on top.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>, // base64 encoded
    stream: bool,
    format: &'static str,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

/// Map a transport failure onto the inference taxonomy.
pub(crate) fn classify_send_error(e: &reqwest::Error, timeout_secs: u64) -> Error {
    if e.is_timeout() {
        Error::InferenceTimeout(timeout_secs)
    } else if e.is_connect() {
        Error::BackendUnavailable(format!("connection failed: {e}"))
    } else {
        Error::InferenceError(format!("request failed: {e}"))
    }
}

/// Map a non-success HTTP status onto the inference taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        // Model not pulled, or the server is shedding load.
        StatusCode::NOT_FOUND | StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            Error::BackendUnavailable(format!("Ollama returned {status}: {body}"))
        }
        _ => Error::InferenceError(format!("Ollama returned {status}: {body}")),
    }
}

#[async_trait]
impl VisionBackend for OllamaVisionBackend {
    #[instrument(skip(self, pages, prompt), fields(subsystem = "inference", component = "ollama", op = "analyze", model = %self.model, page_count = pages.len()))]
    async fn analyze(&self, pages: &[PageImage], prompt: &str) -> Result<String> {
        let start = Instant::now();
        let images = pages
            .iter()
            .map(|p| base64::engine::general_purpose::STANDARD.encode(&p.png))
            .collect();

        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            images,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| classify_send_error(&e, self.timeout_secs))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let result: OllamaGenerateResponse = response.json().await.map_err(|e| {
            Error::InferenceError(format!("Failed to parse vision response: {}", e))
        })?;

        if result.response.trim().is_empty() {
            return Err(Error::InferenceError("empty model response".to_string()));
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            response_len = result.response.len(),
            duration_ms = elapsed,
            "Vision call complete"
        );
        if elapsed > SLOW_OPERATION_MS {
            warn!(duration_ms = elapsed, slow = true, "Slow vision operation");
        }
        Ok(result.response)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Ollama embedding backend (`/api/embed`).
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: Client,
    timeout_secs: u64,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: Client::new(),
            timeout_secs: EMBED_TIMEOUT_SECS,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "ollama", op = "embed_texts", model = %self.model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, self.timeout_secs))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::InferenceError(format!("Failed to parse embeddings: {}", e)))?;

        if result.embeddings.len() != texts.len() {
            return Err(Error::InferenceError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.embeddings.len()
            )));
        }

        debug!(
            result_count = result.embeddings.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding complete"
        );
        Ok(result.embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_vision_backend_new_trims_slash() {
        let backend = OllamaVisionBackend::new("http://gpu:11434/", "qwen2.5vl:7b");
        assert_eq!(backend.base_url(), "http://gpu:11434");
        assert_eq!(backend.model_name(), "qwen2.5vl:7b");
        assert_eq!(
            backend.timeout_secs,
            docvision_core::defaults::INFERENCE_TIMEOUT_SECS
        );
    }

    #[test]
    fn test_generate_request_serialization() {
        let request = OllamaGenerateRequest {
            model: "llava",
            prompt: "Extract metadata",
            images: vec!["base64data".to_string()],
            stream: false,
            format: "json",
            options: GenerateOptions { temperature: 0.1 },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llava");
        assert_eq!(json["images"][0], "base64data");
        assert_eq!(json["stream"], false);
        assert_eq!(json["format"], "json");
        assert!(json["options"]["temperature"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_generate_response_missing_field_is_empty() {
        let response: OllamaGenerateResponse = serde_json::from_str(r#"{"done": true}"#).unwrap();
        assert!(response.response.is_empty());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "model not found"),
            Error::BackendUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "oom"),
            Error::InferenceError(_)
        ));
    }
}
