//! Completion invocation with ordered model fallback.
//!
//! A [`FallbackInvoker`] holds an ordered list of model identifiers and a
//! single [`CompletionBackend`].  Candidates are tried strictly one at a time,
//! one attempt each.  Only two outcomes advance to the next candidate: the
//! provider reporting the model as decommissioned, missing or unavailable, and
//! a success response with no usable content.  Every other upstream failure is
//! returned immediately.

use std::sync::Arc;

pub mod openai;

pub use self::openai::OpenAiCompatibleBackend;

/// Models tried after the optional override, in order.
pub const DEFAULT_MODELS: &[&str] = &[
    "llama-3.3-70b-versatile",
    "llama-3.1-8b-instant",
    "gemma2-9b-it",
];

/// Structured `error.code` values meaning the requested model cannot serve.
const UNAVAILABLE_CODES: &[&str] = &[
    "model_decommissioned",
    "model_not_found",
    "model_not_available",
];

/// Body substrings used when the provider gives no structured code.  These
/// match the wording of the Groq/OpenAI error messages and are provider
/// specific.
const UNAVAILABLE_MARKERS: &[&str] = &["decommissioned", "not found", "does not exist", "unavailable"];

/// Build the ordered candidate list: override first, then the defaults.
pub fn candidate_models(model_override: Option<&str>) -> Vec<String> {
    let mut models = Vec::with_capacity(DEFAULT_MODELS.len() + 1);
    if let Some(m) = model_override.map(str::trim).filter(|m| !m.is_empty()) {
        models.push(m.to_string());
    }
    for m in DEFAULT_MODELS {
        if !models.iter().any(|existing| existing == m) {
            models.push((*m).to_string());
        }
    }
    models
}

/// Everything sent upstream apart from the model identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Status {
        status: u16,
        code: Option<String>,
        body: String,
    },
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// True when the failure means "this model cannot serve", which is the
    /// only upstream failure that moves on to the next candidate.
    pub fn is_model_unavailable(&self) -> bool {
        match self {
            UpstreamError::Status { code, body, .. } => {
                if let Some(code) = code {
                    if UNAVAILABLE_CODES.contains(&code.as_str()) {
                        return true;
                    }
                }
                mentions_unavailable(body)
            }
            UpstreamError::Transport(message) => mentions_unavailable(message),
            UpstreamError::Decode(_) => false,
        }
    }
}

fn mentions_unavailable(text: &str) -> bool {
    let lower = text.to_lowercase();
    UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// One upstream chat-completion endpoint.  `Ok(None)` means the call
/// succeeded but carried no message content.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<Option<String>, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("all models failed: {last_error}")]
    AllModelsFailed { last_error: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// A successful answer together with the model that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub answer: String,
    pub model: String,
    /// Candidates tried, including the successful one.
    pub attempts: usize,
}

pub struct FallbackInvoker {
    models: Vec<String>,
    backend: Arc<dyn CompletionBackend>,
    system: String,
    temperature: f32,
    max_tokens: u32,
}

impl FallbackInvoker {
    pub fn new(
        models: Vec<String>,
        backend: Arc<dyn CompletionBackend>,
        system: String,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            models,
            backend,
            system,
            temperature,
            max_tokens,
        }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub async fn complete(&self, prompt: &str) -> Result<Completion, CompletionError> {
        let request = CompletionRequest {
            system: self.system.clone(),
            prompt: prompt.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let mut last_error = String::from("no model candidates configured");
        for (idx, model) in self.models.iter().enumerate() {
            tracing::debug!(model = %model, attempt = idx + 1, "requesting completion");
            match self.backend.complete(model, &request).await {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    if idx > 0 {
                        tracing::info!(model = %model, attempts = idx + 1, "answered by fallback model");
                    }
                    return Ok(Completion {
                        answer: text,
                        model: model.clone(),
                        attempts: idx + 1,
                    });
                }
                Ok(_) => {
                    tracing::warn!(model = %model, "empty completion, trying next model");
                    last_error = format!("{model}: empty response");
                }
                Err(err) if err.is_model_unavailable() => {
                    tracing::warn!(model = %model, error = %err, "model unavailable, trying next model");
                    last_error = format!("{model}: {err}");
                }
                Err(err) => {
                    tracing::warn!(model = %model, error = %err, "upstream failure");
                    return Err(CompletionError::Upstream(err));
                }
            }
        }
        Err(CompletionError::AllModelsFailed { last_error })
    }
}
