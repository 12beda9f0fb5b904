//! In-process inference backends.
//!
//! Used directly by [`crate::LocalLanguageModel`] and by the provider service
//! to execute jobs it has been paid for.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::DvmError;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Inference failed: {0}")]
    InferenceError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<BackendError> for DvmError {
    fn from(err: BackendError) -> Self {
        DvmError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub stream: bool,
    /// Job params that have no dedicated field.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
            stream: false,
            extra: HashMap::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Map a job `param` onto the request. Numeric params that fail to parse
    /// are kept as strings in `extra`.
    pub fn apply_param(&mut self, name: &str, value: &str) {
        match name {
            "model" => self.model = value.to_string(),
            "max_tokens" => match value.parse() {
                Ok(n) => self.max_tokens = Some(n),
                Err(_) => self.insert_extra(name, value),
            },
            "temperature" => match value.parse() {
                Ok(t) => self.temperature = Some(t),
                Err(_) => self.insert_extra(name, value),
            },
            _ => self.insert_extra(name, value),
        }
    }

    fn insert_extra(&mut self, name: &str, value: &str) {
        self.extra
            .insert(name.to_string(), serde_json::Value::String(value.to_string()));
    }
}

/// One streamed delta from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendChunk {
    pub id: String,
    pub model: String,
    pub delta: String,
    pub finish_reason: Option<String>,
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Core trait that all inference backends must implement
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend identifier (e.g., "ollama", "llamacpp")
    fn id(&self) -> &str;

    /// Check if the backend is ready to serve requests. Callers check this
    /// before taking on work and fail with [`BackendError::Unavailable`].
    async fn is_ready(&self) -> bool;

    /// Execute a streaming completion request. The backend stops producing
    /// once the receiver is dropped.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<BackendChunk>>>;
}
