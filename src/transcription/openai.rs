//! OpenAI-backed transcription service.
//!
//! Two steps per chunk: Whisper (verbose JSON) provides timestamped source
//! segments, then a chat model corrects them and adds the translation.

use super::{ServiceError, TranscriptionRequest, TranscriptionService};
use crate::config::{Prompts, TranscriptionSettings};
use crate::error::{Result, RettelseError};
use crate::openai::create_client_with_config;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    AudioInput, AudioResponseFormat, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, CreateTranscriptionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

/// Whisper + chat completion service.
pub struct OpenAiService {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    timestamp_model: String,
    /// Whisper output of the most recent chunk, reused when the cascade
    /// retries the same audio on another model.
    last_source: Mutex<Option<(String, String)>>,
}

impl OpenAiService {
    /// Service against the API configured in the environment (`OPENAI_API_KEY`).
    pub fn new(settings: &TranscriptionSettings, timeout: Duration) -> Result<Self> {
        Self::with_config(settings, OpenAIConfig::default(), timeout)
    }

    pub fn with_config(
        settings: &TranscriptionSettings,
        config: OpenAIConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RettelseError::OpenAI(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: create_client_with_config(config, timeout)?,
            http,
            timestamp_model: settings.timestamp_model.clone(),
            last_source: Mutex::new(None),
        })
    }

    async fn read_audio(&self, audio_path: &str) -> std::result::Result<(String, Vec<u8>), ServiceError> {
        if let Ok(url) = url::Url::parse(audio_path) {
            if matches!(url.scheme(), "http" | "https") {
                let file_name = url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("audio.wav")
                    .to_string();
                let bytes = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(classify_reqwest)?
                    .bytes()
                    .await
                    .map_err(classify_reqwest)?;
                return Ok((file_name, bytes.to_vec()));
            }
        }

        let path = Path::new(audio_path);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("cannot read {}: {}", audio_path, e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();
        Ok((file_name, bytes))
    }

    /// Timestamped source segments for the chunk as a JSON array string.
    #[instrument(skip(self, request), fields(audio = %request.audio_path))]
    async fn source_segments(&self, request: &TranscriptionRequest) -> std::result::Result<String, ServiceError> {
        {
            let cached = self.last_source.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((path, segments)) = cached.as_ref() {
                if path == &request.audio_path {
                    return Ok(segments.clone());
                }
            }
        }

        let (file_name, bytes) = self.read_audio(&request.audio_path).await?;

        let mut builder = CreateTranscriptionRequestArgs::default();
        builder
            .file(AudioInput::from_vec_u8(file_name, bytes))
            .model(&self.timestamp_model)
            .response_format(AudioResponseFormat::VerboseJson);
        if let Some(lang) = &request.source_language {
            builder.language(lang);
        }
        let whisper_request = builder
            .build()
            .map_err(|e| ServiceError::Malformed(format!("Failed to build request: {}", e)))?;

        // The timestamp model is the same whichever chat model the cascade is
        // on, so its quota errors are only worth a retry, never a fallback.
        let response = self
            .client
            .audio()
            .transcribe_verbose_json(whisper_request)
            .await
            .map_err(|e| match classify_openai(e) {
                ServiceError::QuotaExceeded(msg) => {
                    ServiceError::Unavailable(format!("{}: {}", self.timestamp_model, msg))
                }
                other => other,
            })?;

        let segments: Vec<serde_json::Value> = match response.segments {
            Some(segs) => segs
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "start": round2(s.start as f64),
                        "end": round2(s.end as f64),
                        "text": s.text.trim(),
                    })
                })
                .collect(),
            None => vec![serde_json::json!({
                "start": 0.0,
                "end": round2(response.duration as f64),
                "text": response.text.trim(),
            })],
        };
        debug!("Whisper returned {} source segments", segments.len());

        let rendered = serde_json::to_string_pretty(&segments)
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;

        let mut cached = self.last_source.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some((request.audio_path.clone(), rendered.clone()));
        Ok(rendered)
    }
}

#[async_trait]
impl TranscriptionService for OpenAiService {
    #[instrument(skip(self, request), fields(audio = %request.audio_path))]
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        model: &str,
    ) -> std::result::Result<String, ServiceError> {
        let source = self.source_segments(request).await?;

        let mut vars = HashMap::new();
        vars.insert("source_segments".to_string(), source);
        let user_prompt = Prompts::render(&request.user_prompt, &vars);

        let build_err = |e: OpenAIError| ServiceError::Malformed(format!("Failed to build request: {}", e));
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system_prompt.clone())
                .build()
                .map_err(build_err)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt)
                .build()
                .map_err(build_err)?
                .into(),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .temperature(0.0)
            .response_format(ResponseFormat::JsonObject)
            .build()
            .map_err(build_err)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify_openai)?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ServiceError::Malformed("empty response".to_string()))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn classify_reqwest(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        return ServiceError::Timeout(e.to_string());
    }
    match e.status() {
        Some(status) if status.as_u16() == 429 => ServiceError::QuotaExceeded(e.to_string()),
        Some(status) if status.is_client_error() => ServiceError::Malformed(e.to_string()),
        _ => ServiceError::Unavailable(e.to_string()),
    }
}

fn classify_openai(e: OpenAIError) -> ServiceError {
    match e {
        OpenAIError::Reqwest(e) => classify_reqwest(e),
        OpenAIError::ApiError(api) => {
            let detail = [api.r#type.as_deref(), api.code.as_deref(), Some(api.message.as_str())]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(": ");
            classify_api_message(&detail)
        }
        OpenAIError::JSONDeserialize(e) => ServiceError::Malformed(e.to_string()),
        other => ServiceError::Unavailable(other.to_string()),
    }
}

fn classify_api_message(message: &str) -> ServiceError {
    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("rate limit") || lower.contains("rate_limit") {
        ServiceError::QuotaExceeded(message.to_string())
    } else if lower.contains("invalid_request") || lower.contains("invalid request") {
        ServiceError::Malformed(message.to_string())
    } else {
        ServiceError::Unavailable(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_api_message_classification() {
        assert!(matches!(
            classify_api_message("insufficient_quota: You exceeded your current quota"),
            ServiceError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_api_message("Rate limit reached for gpt-4.1"),
            ServiceError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_api_message("invalid_request_error: Invalid file format"),
            ServiceError::Malformed(_)
        ));
        assert!(classify_api_message("server_error: The server had an error").is_transient());
    }

    /// Local stand-in for the OpenAI API that counts calls per endpoint.
    struct MockApi {
        whisper_rate_limited: bool,
        whisper_hits: AtomicUsize,
        chat_hits: AtomicUsize,
    }

    fn rate_limited() -> (StatusCode, Json<Value>) {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": {
                    "message": "Rate limit reached for requests",
                    "type": "requests",
                    "param": null,
                    "code": "rate_limit_exceeded"
                }
            })),
        )
    }

    async fn transcriptions(State(api): State<Arc<MockApi>>, _body: Bytes) -> (StatusCode, Json<Value>) {
        api.whisper_hits.fetch_add(1, Ordering::SeqCst);
        if api.whisper_rate_limited {
            return rate_limited();
        }
        (
            StatusCode::OK,
            Json(json!({"language": "norwegian", "duration": 12.5, "text": " God kveld. "})),
        )
    }

    async fn completions(State(api): State<Arc<MockApi>>, _body: Bytes) -> (StatusCode, Json<Value>) {
        api.chat_hits.fetch_add(1, Ordering::SeqCst);
        rate_limited()
    }

    async fn spawn_api(whisper_rate_limited: bool) -> (Arc<MockApi>, OpenAiService) {
        let api = Arc::new(MockApi {
            whisper_rate_limited,
            whisper_hits: AtomicUsize::new(0),
            chat_hits: AtomicUsize::new(0),
        });
        let router = Router::new()
            .route("/v1/audio/transcriptions", post(transcriptions))
            .route("/v1/chat/completions", post(completions))
            .with_state(api.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let config = OpenAIConfig::new()
            .with_api_key("sk-test")
            .with_api_base(format!("http://{}/v1", addr));
        let service =
            OpenAiService::with_config(&TranscriptionSettings::default(), config, Duration::from_secs(5))
                .unwrap();
        (api, service)
    }

    fn request(audio: &tempfile::NamedTempFile) -> TranscriptionRequest {
        TranscriptionRequest {
            audio_path: audio.path().to_string_lossy().into_owned(),
            system_prompt: "Correct the transcript.".to_string(),
            user_prompt: "{{source_segments}}".to_string(),
            source_language: Some("no".to_string()),
        }
    }

    fn audio_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(b"RIFF----WAVE").unwrap();
        file
    }

    #[tokio::test]
    async fn test_chat_rate_limit_is_reported_without_internal_retry() {
        let (api, service) = spawn_api(false).await;
        let audio = audio_file();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            service.transcribe(&request(&audio), "gpt-4.1"),
        )
        .await
        .expect("rate limit must surface instead of being retried");

        assert!(matches!(result, Err(ServiceError::QuotaExceeded(_))), "{:?}", result);
        assert_eq!(api.chat_hits.load(Ordering::SeqCst), 1);
        assert_eq!(api.whisper_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_model_reuses_whisper_output() {
        let (api, service) = spawn_api(false).await;
        let audio = audio_file();
        let request = request(&audio);

        let _ = service.transcribe(&request, "gpt-4.1").await;
        let _ = service.transcribe(&request, "gpt-4.1-mini").await;

        assert_eq!(api.whisper_hits.load(Ordering::SeqCst), 1);
        assert_eq!(api.chat_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_whisper_rate_limit_is_transient() {
        let (api, service) = spawn_api(true).await;
        let audio = audio_file();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            service.transcribe(&request(&audio), "gpt-4.1"),
        )
        .await
        .expect("rate limit must surface instead of being retried");

        match result {
            Err(e @ ServiceError::Unavailable(_)) => assert!(e.is_transient()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(api.whisper_hits.load(Ordering::SeqCst), 1);
        assert_eq!(api.chat_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(30.0), 30.0);
    }
}
