//! Classification service integration.
//!
//! - `provider`: the `ClassificationService` trait and request/response types
//! - `prompt`: prompt construction and age descriptors
//! - `parse`: defensive response parsing
//! - `ollama`: HTTP implementation against an Ollama-compatible server

pub mod ollama;
pub mod parse;
pub mod prompt;
pub mod provider;

pub use ollama::OllamaClassifier;
pub use provider::{
    Classification, ClassificationRequest, ClassificationService, MAX_BODY_CHARS, MAX_EXAMPLES,
};

use std::sync::Arc;

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;

/// Build the configured classifier, verifying the model is available.
pub async fn create_classifier(
    config: &ClassifierConfig,
) -> Result<Arc<dyn ClassificationService>, ClassifierError> {
    let mut classifier = OllamaClassifier::new(config)?;
    classifier.check_connection().await?;
    tracing::info!("Using Ollama classifier (model: {})", classifier.model_name());
    Ok(Arc::new(classifier))
}
