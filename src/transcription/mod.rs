//! Transcription module for Rettelse.
//!
//! The worker talks to the external speech/translation service through the
//! [`TranscriptionService`] trait. [`ModelCascade`] wraps a service with the
//! retry policy (transient retries with backoff, quota fallback to a second
//! model), and [`ResponseParser`] turns the raw model text into chunk-local
//! segments.

mod cascade;
mod openai;
mod response;

pub use cascade::{CascadeFailure, CascadeSuccess, ModelCascade};
pub use openai::OpenAiService;
pub use response::ResponseParser;

use async_trait::async_trait;
use thiserror::Error;

/// Everything the service needs to transcribe one chunk.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// Local path or http(s) URL of the chunk audio.
    pub audio_path: String,
    /// Rendered system prompt.
    pub system_prompt: String,
    /// Rendered user prompt. `{{source_segments}}` is left for the service to fill.
    pub user_prompt: String,
    /// Language hint for speech recognition.
    pub source_language: Option<String>,
}

/// Failure modes of a single service call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Rate limit or quota exhaustion on the requested model.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The call did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Connection failure or 5xx-class error.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service answered with something that is not a usable transcript.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Worth retrying on the same model.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Timeout(_) | ServiceError::Unavailable(_))
    }
}

/// External transcription + translation service.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Transcribe and translate one chunk with `model`, returning the raw model
    /// text containing the ordered `{start, end, text, translation}` list.
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        model: &str,
    ) -> std::result::Result<String, ServiceError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Service that replays a fixed script of responses and records the models asked.
    pub struct ScriptedService {
        script: Mutex<VecDeque<std::result::Result<String, ServiceError>>>,
        calls: Mutex<Vec<String>>,
        hang: bool,
    }

    impl ScriptedService {
        pub fn new(script: Vec<std::result::Result<String, ServiceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                hang: false,
            }
        }

        /// A service that never answers.
        pub fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(vec![])
            }
        }

        pub fn models_called(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TranscriptionService for ScriptedService {
        async fn transcribe(
            &self,
            _request: &TranscriptionRequest,
            model: &str,
        ) -> std::result::Result<String, ServiceError> {
            self.calls.lock().unwrap().push(model.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::Unavailable("script exhausted".to_string())))
        }
    }
}
