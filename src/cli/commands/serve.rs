//! HTTP API server for the annotation frontend.
//!
//! Provides REST endpoints for the queue, chunk locks and review, plus a
//! server-sent event stream of queue status.

use crate::app::App;
use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::error::RettelseError;
use crate::notifier::{QueueEvent, StatusNotifier, Subscription};
use crate::store::{
    Chunk, DenoiseState, Job, LockInfo, ProcessingState, QueueSummary, Segment, Video,
    VideoManifest,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Shared application state.
pub struct AppState {
    pub app: App,
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/queue/enqueue", post(enqueue))
        .route("/queue/summary", get(summary))
        .route("/queue/events", get(events))
        .route("/queue/retry", post(retry))
        .route("/videos", get(list_videos))
        .route("/videos/import", post(import_video))
        .route("/videos/{video_id}", delete(delete_video))
        .route("/videos/{video_id}/jobs", get(video_jobs))
        .route("/locks/acquire", post(acquire_lock))
        .route("/locks/renew", post(renew_lock))
        .route("/locks/release", post(release_lock))
        .route("/chunks/{chunk_id}", get(get_chunk))
        .route("/chunks/{chunk_id}/state", put(set_chunk_state))
        .route("/chunks/{chunk_id}/denoise", put(set_chunk_denoise))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP API server with the worker and the status notifier.
pub async fn run_serve(
    host: Option<String>,
    port: Option<u16>,
    no_worker: bool,
    settings: Settings,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);

    let app = App::open(settings)?;
    let worker = if no_worker {
        None
    } else {
        preflight::check(Operation::Process)?;
        Some(app.openai_worker()?)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let notifier_task = tokio::spawn(
        app.notifier()
            .clone()
            .run(app.queue().clone(), shutdown_rx.clone()),
    );
    let worker_task = worker.map(|worker| {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(rx).await })
    });

    let state = Arc::new(AppState { app });
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("Rettelse API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    if worker_task.is_none() {
        Output::warning("Worker disabled, queued jobs will not be processed");
    }
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /health");
    Output::kv("Enqueue", "POST /queue/enqueue");
    Output::kv("Summary", "GET  /queue/summary?videoId=");
    Output::kv("Events", "GET  /queue/events");
    Output::kv("Retry", "POST /queue/retry");
    Output::kv("Videos", "GET  /videos | POST /videos/import | DELETE /videos/{videoId}");
    Output::kv("Jobs", "GET  /videos/{videoId}/jobs");
    Output::kv("Locks", "POST /locks/acquire | /locks/renew | /locks/release");
    Output::kv("Chunk", "GET  /chunks/{chunkId}");
    Output::kv("Review", "PUT  /chunks/{chunkId}/state | /chunks/{chunkId}/denoise");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(task) = worker_task {
        Output::info("Waiting for the in-flight job to finish...");
        task.await?;
    }
    notifier_task.await?;
    info!("Server stopped");

    Ok(())
}

// === Request/Response Types ===

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    video_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    video_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryRequest {
    video_id: String,
}

#[derive(Serialize)]
struct RetryResponse {
    retried: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportResponse {
    video_id: String,
    chunks: Vec<Chunk>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireRequest {
    chunk_id: i64,
    user_id: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRequest {
    chunk_id: i64,
    user_id: String,
}

#[derive(Serialize)]
struct ReleaseResponse {
    released: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRequest {
    user_id: String,
    state: String,
}

#[derive(Deserialize)]
struct DenoiseRequest {
    state: String,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

#[derive(Serialize)]
struct ChunkResponse {
    chunk: Chunk,
    lock: Option<LockInfo>,
    segments: Vec<Segment>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    held_by: Option<String>,
}

/// A library error rendered as an HTTP response.
struct ApiError(RettelseError);

impl From<RettelseError> for ApiError {
    fn from(e: RettelseError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0.to_string();
        let (status, body) = match self.0 {
            RettelseError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                ErrorResponse { error, conflict: None, held_by: None },
            ),
            RettelseError::LockConflict { held_by, .. } => (
                StatusCode::CONFLICT,
                ErrorResponse { error, conflict: Some(true), held_by: Some(held_by) },
            ),
            RettelseError::LockNotHeld { .. }
            | RettelseError::InvalidTransition { .. }
            | RettelseError::InvalidState(_) => (
                StatusCode::CONFLICT,
                ErrorResponse { error, conflict: None, held_by: None },
            ),
            RettelseError::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse { error, conflict: None, held_by: None },
            ),
            _ => {
                error!("Request failed: {}", error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse { error, conflict: None, held_by: None },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// === Handlers ===

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "subscribers": state.app.notifier().subscriber_count(),
    }))
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> ApiResult<crate::queue::EnqueueOutcome> {
    Ok(Json(state.app.queue().enqueue_many(&req.video_ids)?))
}

async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<QueueSummary> {
    Ok(Json(state.app.queue().summary(query.video_id.as_deref())?))
}

async fn retry(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetryRequest>,
) -> ApiResult<RetryResponse> {
    let retried = state.app.queue().retry_failed(&req.video_id)?;
    Ok(Json(RetryResponse { retried }))
}

async fn import_video(
    State(state): State<Arc<AppState>>,
    Json(manifest): Json<VideoManifest>,
) -> ApiResult<ImportResponse> {
    let chunks = state.app.import(&manifest)?;
    Ok(Json(ImportResponse {
        video_id: manifest.video_id,
        chunks,
    }))
}

async fn list_videos(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Video>> {
    Ok(Json(state.app.database().list_videos()?))
}

async fn delete_video(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<String>,
) -> ApiResult<DeleteResponse> {
    if !state.app.delete_video(&video_id)? {
        return Err(RettelseError::NotFound(format!("video {}", video_id)).into());
    }
    Ok(Json(DeleteResponse { deleted: true }))
}

async fn video_jobs(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<String>,
) -> ApiResult<Vec<Job>> {
    if state.app.database().video(&video_id)?.is_none() {
        return Err(RettelseError::NotFound(format!("video {}", video_id)).into());
    }
    Ok(Json(state.app.queue().jobs_for_video(&video_id)?))
}

async fn acquire_lock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> ApiResult<LockInfo> {
    let ttl = req.ttl_seconds.map(Duration::from_secs);
    Ok(Json(state.app.locks().acquire(req.chunk_id, &req.user_id, ttl)?))
}

async fn renew_lock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LockRequest>,
) -> ApiResult<LockInfo> {
    Ok(Json(state.app.locks().renew(req.chunk_id, &req.user_id)?))
}

async fn release_lock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LockRequest>,
) -> ApiResult<ReleaseResponse> {
    state.app.locks().release(req.chunk_id, &req.user_id)?;
    Ok(Json(ReleaseResponse { released: true }))
}

async fn get_chunk(
    State(state): State<Arc<AppState>>,
    Path(chunk_id): Path<i64>,
) -> ApiResult<ChunkResponse> {
    let db = state.app.database();
    let chunk = db.require_chunk(chunk_id)?;
    let lock = chunk.active_lock(state.app.clock().now());
    let segments = db.segments(chunk_id)?;
    Ok(Json(ChunkResponse { chunk, lock, segments }))
}

async fn set_chunk_state(
    State(state): State<Arc<AppState>>,
    Path(chunk_id): Path<i64>,
    Json(req): Json<StateRequest>,
) -> ApiResult<Chunk> {
    let to: ProcessingState = req.state.parse()?;
    Ok(Json(state.app.review(chunk_id, &req.user_id, to)?))
}

async fn set_chunk_denoise(
    State(state): State<Arc<AppState>>,
    Path(chunk_id): Path<i64>,
    Json(req): Json<DenoiseRequest>,
) -> ApiResult<Chunk> {
    let to: DenoiseState = req.state.parse()?;
    Ok(Json(state.app.set_denoise(chunk_id, to)?))
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let notifier = state.app.notifier().clone();
    let queue = state.app.queue();
    let subscription = notifier.subscribe(|| queue.summary(None))?;
    let guard = SubscriberGuard {
        notifier,
        id: subscription.id,
    };

    Ok(Sse::new(event_stream(subscription, guard)))
}

/// Unsubscribes when the client goes away.
struct SubscriberGuard {
    notifier: Arc<StatusNotifier>,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.id);
    }
}

fn event_stream(
    subscription: Subscription,
    guard: SubscriberGuard,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold((subscription, guard), |(mut subscription, guard)| async move {
        let event = subscription.recv().await?;
        Some((to_sse(&event), (subscription, guard)))
    })
}

fn to_sse(event: &QueueEvent) -> Result<Event, axum::Error> {
    let sse = Event::default().event(event.name());
    match event {
        QueueEvent::QueueUpdate(summary) => sse.json_data(summary),
        QueueEvent::Heartbeat { at } => sse.json_data(serde_json::json!({ "at": at })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, ManualClock};
    use crate::store::Database;
    use serde_json::{json, Value};

    async fn spawn_server() -> String {
        let app = App::with_database(
            Settings::default(),
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(ManualClock::new(from_millis(1_700_000_000_000))),
        )
        .unwrap();
        let state = Arc::new(AppState { app });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn import(client: &reqwest::Client, base: &str, video_id: &str, chunks: usize) -> Value {
        let chunks: Vec<Value> = (0..chunks)
            .map(|i| {
                json!({
                    "index": i,
                    "startSeconds": i as f64 * 30.0,
                    "endSeconds": (i + 1) as f64 * 30.0,
                    "audioPath": format!("https://media.example/{}/{}.wav", video_id, i),
                })
            })
            .collect();
        let resp = client
            .post(format!("{}/videos/import", base))
            .json(&json!({ "videoId": video_id, "title": "Møte", "chunks": chunks }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    #[tokio::test]
    async fn test_import_enqueue_and_summary() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();

        let imported = import(&client, &base, "V", 2).await;
        assert_eq!(imported["videoId"], "V");
        assert_eq!(imported["chunks"].as_array().unwrap().len(), 2);

        let first: Value = client
            .post(format!("{}/queue/enqueue", base))
            .json(&json!({ "videoIds": ["V"] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["queued"], 2);
        assert_eq!(first["skippedDuplicate"], 0);

        let second: Value = client
            .post(format!("{}/queue/enqueue", base))
            .json(&json!({ "videoIds": ["V"] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["queued"], 0);
        assert_eq!(second["skippedDuplicate"], 2);

        let summary: Value = client
            .get(format!("{}/queue/summary?videoId=V", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["queued"], 2);
        assert_eq!(summary["perVideo"][0]["videoId"], "V");

        let jobs: Value = client
            .get(format!("{}/videos/V/jobs", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(jobs.as_array().unwrap().len(), 2);
        assert_eq!(jobs[0]["status"], "QUEUED");
    }

    #[tokio::test]
    async fn test_unknown_resources_are_404() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/queue/enqueue", base))
            .json(&json!({ "videoIds": ["nope"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.get(format!("{}/chunks/999", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.get(format!("{}/videos/nope/jobs", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_lock_conflict_is_409() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();
        let imported = import(&client, &base, "V", 1).await;
        let chunk_id = imported["chunks"][0]["id"].as_i64().unwrap();

        let resp = client
            .post(format!("{}/locks/acquire", base))
            .json(&json!({ "chunkId": chunk_id, "userId": "alice", "ttlSeconds": 300 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let grant: Value = resp.json().await.unwrap();
        assert_eq!(grant["lockedBy"], "alice");

        let resp = client
            .post(format!("{}/locks/acquire", base))
            .json(&json!({ "chunkId": chunk_id, "userId": "bob", "ttlSeconds": 300 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["conflict"], true);
        assert_eq!(body["heldBy"], "alice");

        let resp = client
            .post(format!("{}/locks/renew", base))
            .json(&json!({ "chunkId": chunk_id, "userId": "bob" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let chunk: Value = client
            .get(format!("{}/chunks/{}", base, chunk_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(chunk["lock"]["lockedBy"], "alice");
        assert_eq!(chunk["chunk"]["processingState"], "pending");

        let released: Value = client
            .post(format!("{}/locks/release", base))
            .json(&json!({ "chunkId": chunk_id, "userId": "alice" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(released["released"], true);
    }

    #[tokio::test]
    async fn test_review_of_pending_chunk_is_rejected() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();
        let imported = import(&client, &base, "V", 1).await;
        let chunk_id = imported["chunks"][0]["id"].as_i64().unwrap();

        client
            .post(format!("{}/locks/acquire", base))
            .json(&json!({ "chunkId": chunk_id, "userId": "alice" }))
            .send()
            .await
            .unwrap();

        let resp = client
            .put(format!("{}/chunks/{}/state", base, chunk_id))
            .json(&json!({ "userId": "alice", "state": "reviewed" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let resp = client
            .put(format!("{}/chunks/{}/state", base, chunk_id))
            .json(&json!({ "userId": "alice", "state": "archived" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_video_listing_denoise_and_delete() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();
        let imported = import(&client, &base, "V", 1).await;
        let chunk_id = imported["chunks"][0]["id"].as_i64().unwrap();

        let videos: Value = client
            .get(format!("{}/videos", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(videos[0]["id"], "V");
        assert_eq!(videos[0]["title"], "Møte");

        let chunk: Value = client
            .put(format!("{}/chunks/{}/denoise", base, chunk_id))
            .json(&json!({ "state": "flagged" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(chunk["denoiseState"], "flagged");

        let resp = client
            .put(format!("{}/chunks/{}/denoise", base, chunk_id))
            .json(&json!({ "state": "none" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let resp = client.delete(format!("{}/videos/V", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client.delete(format!("{}/videos/V", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_event_stream_starts_with_current_summary() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["subscribers"], 0);

        let mut resp = client.get(format!("{}/queue/events", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let chunk = resp.chunk().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: queue_update"));
        assert!(text.contains("\"queued\":0"));
    }
}
