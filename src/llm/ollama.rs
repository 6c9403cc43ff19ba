//! HTTP classifier against an Ollama-compatible `/api/generate` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use crate::llm::parse::parse_classification;
use crate::llm::prompt::build_classification_prompt;
use crate::llm::provider::{Classification, ClassificationRequest, ClassificationService};

const PROVIDER: &str = "ollama";
const SAMPLING_TEMPERATURE: f64 = 0.3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Ollama-backed `ClassificationService`.
pub struct OllamaClassifier {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl OllamaClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let timeout = config.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> ClassifierError {
        if e.is_timeout() {
            ClassifierError::Timeout {
                provider: PROVIDER.into(),
                timeout: self.timeout,
            }
        } else {
            ClassifierError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            }
        }
    }

    /// Probe `/api/tags` and confirm the configured model is installed. A
    /// model present only as `<name>:latest` is switched to that tag.
    pub async fn check_connection(&mut self) -> Result<(), ClassifierError> {
        let resp = self
            .authorize(self.client.get(self.url("/api/tags")).timeout(PROBE_TIMEOUT))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(ClassifierError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("/api/tags returned {}", resp.status()),
            });
        }

        let tags: TagsResponse = resp.json().await.map_err(|e| ClassifierError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })?;
        let names: Vec<&str> = tags.models.iter().map(|m| m.name.as_str()).collect();

        if names.contains(&self.model.as_str()) {
            info!(model = %self.model, "Connected to classifier");
            return Ok(());
        }
        let latest = format!("{}:latest", self.model);
        if names.contains(&latest.as_str()) {
            info!(model = %latest, "Connected to classifier");
            self.model = latest;
            return Ok(());
        }

        warn!(model = %self.model, available = ?names, "Model not found on classifier");
        Err(ClassifierError::ModelNotAvailable {
            provider: PROVIDER.into(),
            model: self.model.clone(),
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String, ClassifierError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": SAMPLING_TEMPERATURE },
        });

        let resp = self
            .authorize(self.client.post(self.url("/api/generate")).json(&body))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ClassifierError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("HTTP {status}: {}", text.chars().take(200).collect::<String>()),
            });
        }

        let parsed: GenerateResponse =
            resp.json().await.map_err(|e| ClassifierError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl ClassificationService for OllamaClassifier {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassifierError> {
        let prompt = build_classification_prompt(request);
        debug!(
            sender = %request.sender,
            examples = request.examples.len(),
            "Requesting classification"
        );
        let text = self.generate(&prompt).await?;
        let classification = parse_classification(&text);
        debug!(
            sender = %request.sender,
            recommendation = %classification.recommendation,
            confidence = classification.confidence,
            "Classification received"
        );
        Ok(classification)
    }
}
