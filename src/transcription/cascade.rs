//! Retry policy around a [`TranscriptionService`].

use super::{ServiceError, TranscriptionRequest, TranscriptionService};
use crate::config::{TranscriptionSettings, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A successful cascade run.
#[derive(Debug, Clone)]
pub struct CascadeSuccess {
    /// Model that produced the response.
    pub model: String,
    /// Raw response text.
    pub raw: String,
    /// Service calls made, including failed ones.
    pub calls: u32,
}

/// A cascade run that gave up.
#[derive(Debug, Clone)]
pub struct CascadeFailure {
    pub reason: String,
    pub calls: u32,
}

/// Primary model first, fallback model on quota exhaustion, bounded
/// exponential-backoff retries for transient errors.
pub struct ModelCascade {
    service: Arc<dyn TranscriptionService>,
    primary: String,
    fallback: Option<String>,
    max_transient_retries: u32,
    backoff_base: Duration,
    call_timeout: Duration,
}

impl ModelCascade {
    pub fn new(
        service: Arc<dyn TranscriptionService>,
        transcription: &TranscriptionSettings,
        worker: &WorkerSettings,
    ) -> Self {
        Self {
            service,
            primary: transcription.primary_model.clone(),
            fallback: transcription
                .has_fallback()
                .then(|| transcription.fallback_model.clone()),
            max_transient_retries: worker.max_transient_retries,
            backoff_base: Duration::from_millis(worker.backoff_base_ms),
            call_timeout: worker.call_timeout(),
        }
    }

    /// Models in the order they are tried.
    pub fn models(&self) -> Vec<&str> {
        std::iter::once(self.primary.as_str())
            .chain(self.fallback.as_deref())
            .collect()
    }

    /// Delay before transient retry number `retry` (0-based).
    fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << retry.min(16))
    }

    #[instrument(skip(self, request), fields(audio = %request.audio_path))]
    pub async fn run(&self, request: &TranscriptionRequest) -> Result<CascadeSuccess, CascadeFailure> {
        let mut calls = 0;
        let mut quota_errors = Vec::new();

        for model in self.models() {
            let mut retries = 0;

            loop {
                calls += 1;
                debug!("Calling {} (call {})", model, calls);

                let result = match tokio::time::timeout(
                    self.call_timeout,
                    self.service.transcribe(request, model),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout(format!(
                        "no response within {}s",
                        self.call_timeout.as_secs()
                    ))),
                };

                match result {
                    Ok(raw) => {
                        info!("Transcribed with {} after {} call(s)", model, calls);
                        return Ok(CascadeSuccess {
                            model: model.to_string(),
                            raw,
                            calls,
                        });
                    }
                    Err(ServiceError::QuotaExceeded(msg)) => {
                        warn!("Quota exceeded on {}: {}", model, msg);
                        quota_errors.push(format!("{}: {}", model, msg));
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        if retries >= self.max_transient_retries {
                            warn!("Giving up on {} after {} retries: {}", model, retries, e);
                            return Err(CascadeFailure {
                                reason: format!("{} failed after {} retries: {}", model, retries, e),
                                calls,
                            });
                        }
                        let delay = self.backoff(retries);
                        retries += 1;
                        warn!(
                            "Transient error on {} ({}), retry {}/{} in {:?}",
                            model, e, retries, self.max_transient_retries, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        warn!("Permanent error from {}: {}", model, e);
                        return Err(CascadeFailure {
                            reason: format!("{}: {}", model, e),
                            calls,
                        });
                    }
                }
            }
        }

        Err(CascadeFailure {
            reason: format!("quota exceeded on every model ({})", quota_errors.join("; ")),
            calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ScriptedService;
    use super::*;

    fn request() -> TranscriptionRequest {
        TranscriptionRequest {
            audio_path: "/audio/V/000.wav".to_string(),
            system_prompt: "system".to_string(),
            user_prompt: "user".to_string(),
            source_language: None,
        }
    }

    fn cascade(service: Arc<ScriptedService>, fallback: &str) -> ModelCascade {
        let transcription = TranscriptionSettings {
            primary_model: "primary".to_string(),
            fallback_model: fallback.to_string(),
            ..Default::default()
        };
        let worker = WorkerSettings {
            backoff_base_ms: 100,
            call_timeout_secs: 10,
            ..Default::default()
        };
        ModelCascade::new(service, &transcription, &worker)
    }

    #[tokio::test]
    async fn test_quota_falls_back_once() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ServiceError::QuotaExceeded("429".into())),
            Ok("[]".into()),
        ]));
        let success = cascade(service.clone(), "fallback").run(&request()).await.unwrap();

        assert_eq!(success.model, "fallback");
        assert_eq!(success.calls, 2);
        assert_eq!(service.models_called(), vec!["primary", "fallback"]);
    }

    #[tokio::test]
    async fn test_quota_on_both_models_fails() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ServiceError::QuotaExceeded("429".into())),
            Err(ServiceError::QuotaExceeded("429".into())),
        ]));
        let failure = cascade(service.clone(), "fallback").run(&request()).await.unwrap_err();

        assert_eq!(failure.calls, 2);
        assert!(failure.reason.contains("quota"));
    }

    #[tokio::test]
    async fn test_no_fallback_configured() {
        let service = Arc::new(ScriptedService::new(vec![Err(ServiceError::QuotaExceeded(
            "429".into(),
        ))]));
        let failure = cascade(service.clone(), "").run(&request()).await.unwrap_err();
        assert_eq!(failure.calls, 1);
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ServiceError::Malformed("not json".into())),
            Ok("[]".into()),
        ]));
        let failure = cascade(service.clone(), "fallback").run(&request()).await.unwrap_err();

        assert_eq!(failure.calls, 1);
        assert_eq!(service.models_called(), vec!["primary"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_back_off_then_succeed() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ServiceError::Unavailable("502".into())),
            Err(ServiceError::Timeout("slow".into())),
            Ok("[]".into()),
        ]));
        let started = tokio::time::Instant::now();
        let success = cascade(service.clone(), "fallback").run(&request()).await.unwrap();

        assert_eq!(success.model, "primary");
        assert_eq!(success.calls, 3);
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_are_bounded() {
        let service = Arc::new(ScriptedService::new(
            (0..10)
                .map(|_| Err(ServiceError::Unavailable("503".into())))
                .collect(),
        ));
        let failure = cascade(service.clone(), "fallback").run(&request()).await.unwrap_err();

        // First call plus three retries, never the fallback.
        assert_eq!(failure.calls, 4);
        assert!(service.models_called().iter().all(|m| m == "primary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out() {
        let service = Arc::new(ScriptedService::hanging());
        let worker = WorkerSettings {
            max_transient_retries: 0,
            call_timeout_secs: 5,
            ..Default::default()
        };
        let cascade = ModelCascade::new(service, &TranscriptionSettings::default(), &worker);

        let failure = cascade.run(&request()).await.unwrap_err();
        assert!(failure.reason.contains("timed out"));
    }
}
