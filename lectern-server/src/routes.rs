//! HTTP routes: health, upload, chat (buffered + SSE), conversations.

use crate::state::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use lectern_core::agent::{error_kind, SAFE_REFUSAL};
use lectern_core::error::{AgentError, GatewayError, IngestError, ProcessingError, RateLimitError};
use lectern_core::types::{AgentEvent, AgentReply, Citation, ContentType, ConversationTurn};
use lectern_core::Persistence;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;
use uuid::Uuid;

/// Verified tenant identity header, set by the authenticating front.
const TENANT_HEADER: &str = "x-tenant-id";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload/content", post(upload_content))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/conversations/:tenant_id", get(list_conversations))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    retry_after: Option<u64>,
    /// Bucket capacity, echoed as `X-RateLimit-Limit` on denials.
    rate_limit: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            retry_after: None,
            rate_limit: None,
        }
    }

    fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "input_invalid", message)
    }

    fn unauthenticated() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "A tenant identity is required.",
        )
    }

    fn forbidden_tenant() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "forbidden_tenant",
            "The request is not permitted for this tenant.",
        )
    }

    fn guard_rejected() -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "guard_rejected", SAFE_REFUSAL)
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Something went wrong.",
        )
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        let RateLimitError::Exhausted {
            retry_after_secs, ..
        } = err;
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            kind: "rate_limited",
            message: "Rate limit exceeded. Please try again later.".to_string(),
            retry_after: Some(retry_after_secs),
            rate_limit: None,
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match &err {
            AgentError::StageTimeout { .. } => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "stage_timeout",
                "The request took too long to process.",
            ),
            AgentError::Upstream { source, .. } => match source {
                GatewayError::CircuitOpen {
                    retry_after_secs, ..
                } => Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    kind: "upstream_unavailable",
                    message: "The service is temporarily degraded.".to_string(),
                    retry_after: Some(*retry_after_secs),
                    rate_limit: None,
                },
                GatewayError::Unavailable { .. } => Self::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_unavailable",
                    "An upstream dependency is unavailable.",
                ),
                GatewayError::PolicyRejection { .. } => Self::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_policy_rejection",
                    "The request could not be completed.",
                ),
                GatewayError::InvalidRequest { .. } => {
                    Self::invalid_input("The request could not be processed.")
                }
                _ => Self::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_transient",
                    "An upstream dependency failed.",
                ),
            },
            AgentError::Retrieval(_) => Self::internal(),
            AgentError::Abandoned => Self::internal(),
        }
    }
}

impl From<&IngestError> for ApiError {
    fn from(err: &IngestError) -> Self {
        match err {
            IngestError::Processing(ProcessingError::UnsupportedType { .. }) => {
                Self::invalid_input("Unsupported content type.")
            }
            IngestError::Processing(ProcessingError::EmptyCorpus) => {
                Self::invalid_input("No text could be extracted from the file.")
            }
            IngestError::Processing(ProcessingError::ExtractionFailed { .. }) => {
                Self::invalid_input("The file could not be processed.")
            }
            IngestError::Processing(ProcessingError::Transcription(_)) => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "Transcription is temporarily unavailable.",
            ),
            IngestError::Embedding(GatewayError::CircuitOpen {
                retry_after_secs, ..
            }) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                kind: "upstream_unavailable",
                message: "Embedding is temporarily unavailable.".to_string(),
                retry_after: Some(*retry_after_secs),
                rate_limit: None,
            },
            IngestError::Embedding(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "Embedding is temporarily unavailable.",
            ),
            IngestError::Index(_) => Self::internal(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "kind": self.kind,
            "message": self.message,
        });
        if let Some(retry_after) = self.retry_after {
            error["retry_after"] = json!(retry_after);
        }
        let mut response = (self.status, Json(json!({ "error": error }))).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if let Some(limit) = self.rate_limit {
            if let Ok(value) = limit.to_string().parse() {
                response.headers_mut().insert("x-ratelimit-limit", value);
            }
            if let Ok(value) = "0".parse() {
                response
                    .headers_mut()
                    .insert("x-ratelimit-remaining", value);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Tenant and client resolution
// ---------------------------------------------------------------------------

/// Resolve the effective tenant: a verified identity header wins; a
/// caller-supplied value is accepted only in anonymous demo scope, and a
/// mismatch between the two is a cross-tenant attempt.
fn resolve_tenant(
    state: &AppState,
    headers: &HeaderMap,
    supplied: Option<&str>,
) -> Result<String, ApiError> {
    let verified = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());

    match (verified, supplied.map(str::trim).filter(|s| !s.is_empty())) {
        (Some(verified), Some(supplied)) if verified != supplied => {
            Err(ApiError::forbidden_tenant())
        }
        (Some(verified), _) => Ok(verified.to_string()),
        (None, Some(supplied)) if state.config.server.allow_anonymous_tenant => {
            Ok(supplied.to_string())
        }
        _ => Err(ApiError::unauthenticated()),
    }
}

/// Best-effort client address for the per-IP bucket, proxy headers first.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    "unknown".to_string()
}

async fn enforce_rate_limits(
    state: &AppState,
    tenant_id: &str,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    if let Err(e) = state.tenant_limiter.allow(tenant_id, 1.0).await {
        let mut error = ApiError::from(e);
        error.rate_limit = Some(state.tenant_limiter.capacity());
        return Err(error);
    }
    if let Err(e) = state.ip_limiter.allow(&client_ip(headers), 1.0).await {
        let mut error = ApiError::from(e);
        error.rate_limit = Some(state.ip_limiter.capacity());
        return Err(error);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// /health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let gateway = state.gateway.health().await;
    let persistence_healthy = state.persistence.is_healthy().await;
    let status = if gateway.chat_available() && persistence_healthy {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "dependencies": {
            "model_gateway": gateway,
            "vector": "ok",
            "persistence": if persistence_healthy { "ok" } else { "unavailable" },
        }
    }))
}

// ---------------------------------------------------------------------------
// /upload/content
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: String,
    filename: String,
    tenant_id: String,
    chunks_created: usize,
    upload_id: Uuid,
}

async fn upload_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut tenant_field: Option<String> = None;
    let mut content_type_field: Option<String> = None;
    let mut title: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid_input(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::invalid_input(format!("failed to read file: {e}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            "tenant_id" => tenant_field = field.text().await.ok(),
            "content_type" => content_type_field = field.text().await.ok(),
            "title" => title = field.text().await.ok().filter(|t| !t.trim().is_empty()),
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| ApiError::invalid_input("a 'file' part is required"))?;
    if bytes.is_empty() {
        return Err(ApiError::invalid_input("the uploaded file is empty"));
    }
    let declared_type: ContentType = content_type_field
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(|e: String| ApiError::invalid_input(e))?;
    let tenant_id = resolve_tenant(&state, &headers, tenant_field.as_deref())?;

    let record = state
        .ingestion
        .ingest(&tenant_id, &filename, declared_type, title.as_deref(), bytes)
        .await
        .map_err(|(_, error)| ApiError::from(&error))?;

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        filename: record.filename,
        tenant_id: record.tenant_id,
        chunks_created: record.chunk_count,
        upload_id: record.id,
    }))
}

// ---------------------------------------------------------------------------
// /chat and /chat/stream
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    sources: Vec<Citation>,
    should_escalate: bool,
    confidence: f32,
    conversation_id: String,
}

struct PreparedChat {
    tenant_id: String,
    conversation_id: String,
    query_embedding: Option<Vec<f32>>,
    cached: Option<CachedAnswer>,
}

struct CachedAnswer {
    response: String,
    sources: Vec<Citation>,
    confidence: f32,
}

/// Shared front half of both chat endpoints: validation, tenant scoping,
/// rate limits, and the cache probe.
async fn prepare_chat(
    state: &AppState,
    headers: &HeaderMap,
    request: &ChatRequest,
) -> Result<PreparedChat, ApiError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::invalid_input("message must not be empty"));
    }
    if request.message.chars().count() > state.config.limits.max_message_chars {
        return Err(ApiError::invalid_input(format!(
            "message exceeds the {} character limit",
            state.config.limits.max_message_chars
        )));
    }

    let tenant_id = resolve_tenant(state, headers, request.tenant_id.as_deref())?;
    enforce_rate_limits(state, &tenant_id, headers).await?;

    let conversation_id = request
        .conversation_id
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Exact-tier probe needs no embedding; the semantic tier reuses the
    // embedding the agent would compute anyway. An embedding failure here
    // is not fatal — the agent retries with its own error handling.
    let mut cached = lookup_cached(state, &tenant_id, message, None).await;
    let mut query_embedding = None;
    if cached.is_none() {
        match state.gateway.embed_one(message).await {
            Ok(embedding) => {
                cached = lookup_cached(state, &tenant_id, message, Some(&embedding)).await;
                query_embedding = Some(embedding);
            }
            Err(e) => {
                warn!(error = %e, "Query embedding failed during cache probe");
            }
        }
    }

    Ok(PreparedChat {
        tenant_id,
        conversation_id,
        query_embedding,
        cached,
    })
}

async fn lookup_cached(
    state: &AppState,
    tenant_id: &str,
    message: &str,
    embedding: Option<&[f32]>,
) -> Option<CachedAnswer> {
    let entry = state.cache.lookup(tenant_id, message, embedding).await?;
    Some(CachedAnswer {
        response: entry.response,
        sources: entry.sources,
        confidence: entry.confidence,
    })
}

/// Post-turn bookkeeping shared by both endpoints: best-effort
/// persistence and conditional cache population. Neither may fail the
/// user-visible response.
async fn record_turn(
    state: &AppState,
    tenant_id: &str,
    message: &str,
    reply: &AgentReply,
    query_embedding: Option<Vec<f32>>,
) {
    let turn: ConversationTurn = reply.clone().into_turn(tenant_id, message);
    if let Err(e) = state.persistence.insert_turn(turn).await {
        warn!(error = %e, "Failed to persist conversation turn");
    }

    if let Some(embedding) = query_embedding {
        if !reply.guard_rejected {
            state
                .cache
                .store(
                    tenant_id,
                    message,
                    embedding,
                    reply.response.clone(),
                    reply.sources.clone(),
                    reply.confidence,
                    reply.should_escalate,
                )
                .await;
        }
    }
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let prepared = prepare_chat(&state, &headers, &request).await?;
    let message = request.message.trim().to_string();

    if let Some(cached) = prepared.cached {
        return Ok(Json(ChatResponse {
            response: cached.response,
            sources: cached.sources,
            should_escalate: false,
            confidence: cached.confidence,
            conversation_id: prepared.conversation_id,
        }));
    }

    let memory = state.memory.bind(&prepared.conversation_id).await;
    let reply = state
        .agent
        .answer(
            &message,
            &prepared.tenant_id,
            memory,
            prepared.query_embedding.clone(),
        )
        .await?;

    record_turn(
        &state,
        &prepared.tenant_id,
        &message,
        &reply,
        prepared.query_embedding,
    )
    .await;

    if reply.guard_rejected {
        return Err(ApiError::guard_rejected());
    }

    Ok(Json(ChatResponse {
        response: reply.response,
        sources: reply.sources,
        should_escalate: reply.should_escalate,
        confidence: reply.confidence,
        conversation_id: prepared.conversation_id,
    }))
}

fn sse_event(value: serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let prepared = prepare_chat(&state, &headers, &request).await?;
    let message = request.message.trim().to_string();

    let (tx, rx) = mpsc::channel::<AgentEvent>(256);

    if let Some(cached) = prepared.cached {
        // A cache hit streams as one synthetic token followed by done,
        // carrying the same payload as the buffered path.
        let reply = AgentReply {
            response: cached.response,
            sources: cached.sources,
            confidence: cached.confidence,
            hallucination_flags: Vec::new(),
            should_escalate: false,
            guard_rejected: false,
        };
        let _ = tx.send(AgentEvent::Token(reply.response.clone())).await;
        let _ = tx.send(AgentEvent::Done(reply)).await;
        drop(tx);
    } else {
        let task_state = state.clone();
        let tenant_id = prepared.tenant_id.clone();
        let conversation_id = prepared.conversation_id.clone();
        let query_embedding = prepared.query_embedding.clone();
        let task_message = message.clone();
        tokio::spawn(async move {
            let memory = task_state.memory.bind(&conversation_id).await;
            let (agent_tx, mut agent_rx) = mpsc::channel::<AgentEvent>(256);
            let run = task_state.agent.run(
                &task_message,
                &tenant_id,
                memory,
                query_embedding.clone(),
                agent_tx,
            );
            let forward = async {
                let mut reply: Option<AgentReply> = None;
                while let Some(event) = agent_rx.recv().await {
                    if let AgentEvent::Done(done) = &event {
                        reply = Some(done.clone());
                    }
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                reply
            };
            let (run_result, reply) = tokio::join!(run, forward);
            match (run_result, reply) {
                (Ok(()), Some(reply)) => {
                    record_turn(&task_state, &tenant_id, &task_message, &reply, query_embedding)
                        .await;
                }
                (Err(e), _) => {
                    warn!(error = %e, kind = error_kind(&e), "Streaming turn failed");
                }
                _ => {}
            }
        });
    }

    let stream = ReceiverStream::new(rx).map(|event| {
        let event = match event {
            AgentEvent::Token(content) => sse_event(json!({
                "type": "token",
                "content": content,
            })),
            AgentEvent::Done(reply) if reply.guard_rejected => sse_event(json!({
                "type": "error",
                "kind": "guard_rejected",
                "message": SAFE_REFUSAL,
            })),
            AgentEvent::Done(reply) => sse_event(json!({
                "type": "done",
                "sources": reply.sources,
                "should_escalate": reply.should_escalate,
                "confidence": reply.confidence,
            })),
            AgentEvent::Error { kind, message } => sse_event(json!({
                "type": "error",
                "kind": kind,
                "message": message,
            })),
        };
        Ok(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// /conversations/{tenant_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(query): Query<ConversationsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // The path names the tenant; a verified identity must match it.
    let resolved = resolve_tenant(&state, &headers, Some(&tenant_id))?;
    if resolved != tenant_id {
        return Err(ApiError::forbidden_tenant());
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let turns = state
        .persistence
        .list_turns(&tenant_id, limit)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to list conversations");
            ApiError::internal()
        })?;

    Ok(Json(json!({ "conversations": turns })))
}
