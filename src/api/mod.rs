//! HTTP surface
//!
//! REST endpoints for message events, memory CRUD, recall (plain JSON and
//! SSE), conversations, profiles and metrics. Every endpoint trusts the
//! `userId` the gateway forwards; a missing or blank identity is a 403.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::audit::{is_trivial_message, RejectionCounters};
use crate::cadence::CadenceTracker;
use crate::embedding::EmbeddingService;
use crate::engine::MemoryEngine;
use crate::error::MnemoError;
use crate::jobs::{JobPayload, JobQueue};
use crate::profile::{ProfileBuilder, UserProfile};
use crate::recall::RecallEngine;
use crate::storage::{queries, Storage};
use crate::types::{
    ExpansionMode, ListOptions, Memory, MemoryPatch, MessageEvent, RecallRequest, Role,
    SaveMemoryInput, SaveOutcome, Tier,
};

/// Shared state for all handlers
pub struct AppContext {
    pub storage: Storage,
    pub cadence: Arc<CadenceTracker>,
    pub jobs: JobQueue,
    pub embeddings: Arc<EmbeddingService>,
    pub engine: Arc<MemoryEngine>,
    pub recall: Arc<RecallEngine>,
    pub profiles: Arc<ProfileBuilder>,
    pub rejections: Arc<RejectionCounters>,
    pub started_at: DateTime<Utc>,
}

pub type SharedContext = Arc<AppContext>;

/// Build the API router
pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events/message", post(post_message_event))
        .route("/v1/jobs/audit", post(post_audit_job))
        .route("/v1/memories", get(list_memories).post(create_memory))
        .route("/v1/memories/:id", patch(patch_memory))
        .route("/v1/recall", get(get_recall))
        .route("/v1/recall/stream", get(get_recall_stream))
        .route("/v1/conversations", get(get_conversations))
        .route("/v1/profile", get(get_profile))
        .route("/v1/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// JSON error envelope with the mapped status code
struct ApiError(MnemoError);

impl From<MnemoError> for ApiError {
    fn from(e: MnemoError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn require_user_id(user_id: Option<&str>) -> Result<String, ApiError> {
    match user_id {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => Err(ApiError(MnemoError::Forbidden("userId is required".to_string()))),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Events & jobs
// ---------------------------------------------------------------------------

async fn post_message_event(
    State(ctx): State<SharedContext>,
    Json(event): Json<MessageEvent>,
) -> Result<StatusCode, ApiError> {
    require_user_id(Some(&event.user_id))?;
    if event.thread_id.trim().is_empty() {
        return Err(ApiError(MnemoError::InvalidInput("threadId is required".to_string())));
    }

    let now = event.timestamp.unwrap_or_else(Utc::now);
    if ctx.cadence.record_message(&event, now) {
        ctx.jobs.enqueue(JobPayload::Audit {
            user_id: event.user_id.clone(),
            thread_id: event.thread_id.clone(),
        });
    }

    if event.role == Role::User && !is_trivial_message(&event.content) {
        ctx.jobs.enqueue(JobPayload::Research {
            user_id: event.user_id.clone(),
            thread_id: event.thread_id.clone(),
            content: event.content.clone(),
        });
    }

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditJobRequest {
    user_id: String,
    thread_id: String,
}

async fn post_audit_job(
    State(ctx): State<SharedContext>,
    Json(body): Json<AuditJobRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let user_id = require_user_id(Some(&body.user_id))?;
    let job_id = ctx.jobs.enqueue(JobPayload::Audit {
        user_id,
        thread_id: body.thread_id,
    });
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "jobId": job_id }))))
}

// ---------------------------------------------------------------------------
// Memories
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMemoriesQuery {
    user_id: Option<String>,
    thread_id: Option<String>,
    min_priority: Option<f32>,
    #[serde(default)]
    include_deleted: bool,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListMemoriesResponse {
    memories: Vec<Memory>,
    total: i64,
    limit: i64,
    offset: i64,
}

async fn list_memories(
    State(ctx): State<SharedContext>,
    Query(query): Query<ListMemoriesQuery>,
) -> Result<Json<ListMemoriesResponse>, ApiError> {
    let user_id = require_user_id(query.user_id.as_deref())?;
    let options = ListOptions {
        thread_id: query.thread_id,
        min_priority: query.min_priority,
        include_deleted: query.include_deleted,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0).max(0),
    };
    let (memories, total) = ctx.engine.list(&user_id, &options)?;
    Ok(Json(ListMemoriesResponse {
        memories,
        total,
        limit: options.limit,
        offset: options.offset,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMemoryRequest {
    user_id: String,
    thread_id: String,
    content: String,
    priority: Option<f32>,
    tier: Option<Tier>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveMemoryResponse {
    memory: Memory,
    outcome: SaveOutcome,
}

async fn create_memory(
    State(ctx): State<SharedContext>,
    Json(body): Json<CreateMemoryRequest>,
) -> Result<(StatusCode, Json<SaveMemoryResponse>), ApiError> {
    let user_id = require_user_id(Some(&body.user_id))?;

    let input = SaveMemoryInput {
        user_id,
        thread_id: body.thread_id,
        content: body.content,
        priority: body.priority,
        tier: body.tier,
        confidence: None,
        entities: None,
        explicit: true,
    };

    match ctx.engine.save(input).await {
        Ok((memory, outcome)) => Ok((StatusCode::CREATED, Json(SaveMemoryResponse { memory, outcome }))),
        Err(e) => {
            if matches!(e, MnemoError::InvalidInput(_)) {
                ctx.rejections.all_redacted.fetch_add(1, Ordering::Relaxed);
            }
            Err(ApiError(e))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserQuery {
    user_id: Option<String>,
}

async fn patch_memory(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
    Json(patch): Json<MemoryPatch>,
) -> Result<Json<Memory>, ApiError> {
    let user_id = require_user_id(query.user_id.as_deref())?;
    let memory = ctx.engine.patch(&user_id, &id, patch).await?;
    Ok(Json(memory))
}

// ---------------------------------------------------------------------------
// Recall
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecallQuery {
    user_id: Option<String>,
    thread_id: Option<String>,
    query: Option<String>,
    max_items: Option<usize>,
    deadline_ms: Option<u64>,
    expansion_mode: Option<String>,
}

impl RecallQuery {
    fn into_request(self) -> Result<RecallRequest, ApiError> {
        let user_id = require_user_id(self.user_id.as_deref())?;
        let mode = match self.expansion_mode.as_deref() {
            None => ExpansionMode::Normal,
            Some(raw) => raw
                .parse::<ExpansionMode>()
                .map_err(|e| ApiError(MnemoError::InvalidInput(e)))?,
        };
        Ok(RecallRequest {
            user_id,
            thread_id: self.thread_id,
            query: self.query,
            max_items: self.max_items.unwrap_or(5),
            deadline_ms: self.deadline_ms.unwrap_or(200),
            mode,
        }
        .clamped())
    }
}

async fn get_recall(
    State(ctx): State<SharedContext>,
    Query(query): Query<RecallQuery>,
) -> Result<Json<crate::types::RecallResponse>, ApiError> {
    let request = query.into_request()?;
    Ok(Json(ctx.recall.recall(request).await))
}

/// SSE rendition of recall: one `memory` event per item, then a terminal
/// `summary` event
async fn get_recall_stream(
    State(ctx): State<SharedContext>,
    Query(query): Query<RecallQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = query.into_request()?;
    let response = ctx.recall.recall(request).await;

    let summary = serde_json::json!({
        "count": response.count,
        "elapsedMs": response.elapsed_ms,
        "timedOut": response.timed_out,
        "searchType": response.search_type,
    });

    let mut events: Vec<Result<Event, Infallible>> = Vec::with_capacity(response.memories.len() + 1);
    for item in &response.memories {
        events.push(Ok(Event::default()
            .event("memory")
            .json_data(item)
            .unwrap_or_else(|_| Event::default().event("memory"))));
    }
    events.push(Ok(Event::default()
        .event("summary")
        .json_data(&summary)
        .unwrap_or_else(|_| Event::default().event("summary"))));

    Ok(Sse::new(tokio_stream::iter(events)))
}

// ---------------------------------------------------------------------------
// Auxiliary
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationsQuery {
    user_id: Option<String>,
    exclude_thread_id: Option<String>,
    limit: Option<i64>,
}

async fn get_conversations(
    State(ctx): State<SharedContext>,
    Query(query): Query<ConversationsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_id(query.user_id.as_deref())?;
    let limit = query.limit.unwrap_or(10).clamp(1, 50);
    let threads = ctx.storage.with_read(|conn| {
        queries::recent_audited_threads(conn, &user_id, query.exclude_thread_id.as_deref(), limit)
    })?;
    let count = threads.len();
    Ok(Json(serde_json::json!({
        "conversations": threads,
        "count": count,
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    profile: Option<UserProfile>,
    found: bool,
}

async fn get_profile(
    State(ctx): State<SharedContext>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let user_id = require_user_id(query.user_id.as_deref())?;
    let profile = ctx.profiles.get_or_build(&user_id).await?;
    Ok(Json(ProfileResponse {
        found: profile.is_some(),
        profile,
    }))
}

async fn get_metrics(State(ctx): State<SharedContext>) -> Result<Json<serde_json::Value>, ApiError> {
    let memories = ctx.storage.with_read(queries::memory_counts)?;
    let audits = ctx.storage.with_read(queries::count_audits)?;
    let last_audit = ctx.storage.with_read(queries::last_audit_at)?;
    let pending_embeddings = ctx.storage.with_read(queries::count_pending_embeddings)?;
    let db_size = ctx.storage.db_size().unwrap_or(0);
    let jobs = ctx.jobs.metrics();

    let last_audit_ms_ago = last_audit.map(|at| (Utc::now() - at).num_milliseconds().max(0));

    Ok(Json(serde_json::json!({
        "jobs": jobs,
        "memories": memories,
        "audits": audits,
        "health": {
            "dbSizeMb": db_size as f64 / (1024.0 * 1024.0),
            "queueDepth": ctx.jobs.depth(),
            "pendingEmbeddings": pending_embeddings,
            "lastAuditMsAgo": last_audit_ms_ago,
            "trackedThreads": ctx.cadence.tracked(),
            "uptimeSecs": (Utc::now() - ctx.started_at).num_seconds(),
        },
        "rejections": ctx.rejections.snapshot(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditHandler, ResearchHandler, WriteBatchHandler};
    use crate::jobs::JobType;
    use crate::providers::{KvStore, MemoryKv};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub(crate) fn test_context() -> SharedContext {
        let storage = Storage::open_in_memory().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let embeddings = Arc::new(EmbeddingService::new(None, kv.clone(), 8));
        let engine = Arc::new(MemoryEngine::new(storage.clone(), embeddings.clone(), kv.clone()));
        let recall = Arc::new(RecallEngine::new(storage.clone(), embeddings.clone()));
        let profiles = Arc::new(ProfileBuilder::new(storage.clone(), kv));
        let cadence = Arc::new(CadenceTracker::new());
        let jobs = JobQueue::new();
        let rejections = Arc::new(RejectionCounters::default());

        jobs.register(
            JobType::Audit,
            Arc::new(AuditHandler::new(
                storage.clone(),
                engine.clone(),
                cadence.clone(),
                jobs.clone(),
                None,
                rejections.clone(),
            )),
        );
        jobs.register(JobType::Research, Arc::new(ResearchHandler::new(None)));
        jobs.register(JobType::WriteBatch, Arc::new(WriteBatchHandler::new(storage.clone())));

        Arc::new(AppContext {
            storage,
            cadence,
            jobs,
            embeddings,
            engine,
            recall,
            profiles,
            rejections,
            started_at: Utc::now(),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = router(test_context());
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn message_event_is_accepted() {
        let app = router(test_context());
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/events/message",
                serde_json::json!({
                    "userId": "u1",
                    "threadId": "t1",
                    "msgId": "m1",
                    "role": "user",
                    "content": "my name is Dana and I work at Meridian Labs",
                    "tokens": {"input": 20, "output": 0},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn create_then_list_memories() {
        let ctx = test_context();
        let app = router(ctx.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/memories",
                serde_json::json!({
                    "userId": "u1",
                    "threadId": "t1",
                    "content": "my favorite color is blue",
                    "priority": 0.9,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "created");
        assert_eq!(body["memory"]["tier"], "t1");

        let response = app
            .oneshot(get_request("/v1/memories?userId=u1&limit=10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["memories"][0]["content"], "my favorite color is blue");
    }

    #[tokio::test]
    async fn all_redacted_content_is_400_and_counted() {
        let ctx = test_context();
        let app = router(ctx.clone());

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/memories",
                serde_json::json!({
                    "userId": "u1",
                    "threadId": "t1",
                    "content": "dev@example.com",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ctx.rejections.snapshot().all_redacted, 1);
    }

    #[tokio::test]
    async fn missing_user_id_is_forbidden() {
        let app = router(test_context());
        let response = app
            .oneshot(get_request("/v1/memories?limit=10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn recall_endpoint_round_trip() {
        let ctx = test_context();
        let app = router(ctx.clone());

        app.clone()
            .oneshot(json_request(
                "POST",
                "/v1/memories",
                serde_json::json!({
                    "userId": "u1",
                    "threadId": "t1",
                    "content": "my favorite color is green",
                }),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(get_request("/v1/recall?userId=u1&query=favorite%20color&maxItems=5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["searchType"], "keyword");
        assert_eq!(body["timedOut"], false);
    }

    #[tokio::test]
    async fn recall_bounds_are_validated() {
        let app = router(test_context());
        let response = app
            .oneshot(get_request("/v1/recall?userId=u1&expansionMode=bogus"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_foreign_memory_is_404() {
        let ctx = test_context();
        let app = router(ctx.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/memories",
                serde_json::json!({
                    "userId": "owner",
                    "threadId": "t1",
                    "content": "my favorite color is blue",
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let id = body["memory"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(json_request(
                "PATCH",
                &format!("/v1/memories/{id}?userId=intruder"),
                serde_json::json!({"priority": 0.1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_shape() {
        let app = router(test_context());
        let response = app.oneshot(get_request("/v1/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["jobs"]["queueDepth"].is_number());
        assert!(body["memories"]["live"].is_number());
        assert!(body["health"]["dbSizeMb"].is_number());
        assert!(body["rejections"]["allRedacted"].is_number());
    }

    #[tokio::test]
    async fn profile_endpoint_reports_found_flag() {
        let ctx = test_context();
        let app = router(ctx.clone());

        let response = app
            .clone()
            .oneshot(get_request("/v1/profile?userId=u1"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["found"], false);

        app.clone()
            .oneshot(json_request(
                "POST",
                "/v1/memories",
                serde_json::json!({
                    "userId": "u1",
                    "threadId": "t1",
                    "content": "i am a backend engineer working in rust",
                }),
            ))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/v1/profile?userId=u1")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["found"], true);
        assert_eq!(body["profile"]["techStack"][0]["name"], "rust");
    }
}
