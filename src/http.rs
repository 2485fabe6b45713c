//! HTTP surface: chat streaming, history, stats, tool budget, ingestion.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, HeaderValue, header::HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::{
    AppError, HEADER_RATELIMIT_LIMIT, HEADER_RATELIMIT_REMAINING, HEADER_RATELIMIT_RESET,
};
use crate::governor::ToolUsageGovernor;
use crate::ingest::{ChunkingMode, Ingestor};
use crate::limiter::{RateLimitDecision, RateLimiter, client_fingerprint};
use crate::llm::ChatMessage;
use crate::pipeline::{ChatEvent, ChatPipeline, ChatTurn};
use crate::retrieval::CONTEXT_TOOL;
use crate::store::sessions::{SessionMetadata, SessionStore};

pub const HEADER_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub governor: Arc<ToolUsageGovernor>,
    pub pipeline: Arc<ChatPipeline>,
    pub sessions: SessionStore,
    pub ingestor: Arc<Ingestor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/history", get(history))
        .route("/stats", get(stats))
        .route("/tools/usage", get(tools_usage))
        .route("/embeddings", post(embeddings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Apply the fixed-window limit; an exhausted budget becomes a 429 with
/// the retry headers attached.
fn rate_gate(
    limiter: &RateLimiter,
    headers: &HeaderMap,
) -> Result<(String, RateLimitDecision), AppError> {
    let client_id = client_fingerprint(headers);
    let decision = limiter.check(&client_id);
    if !decision.allowed {
        return Err(AppError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset,
        });
    }
    Ok((client_id, decision))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn request_metadata(headers: &HeaderMap) -> SessionMetadata {
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "x-real-ip"))
        .or_else(|| header_str(headers, "cf-connecting-ip"))
        .map(str::to_string);
    SessionMetadata {
        user_agent: header_str(headers, "user-agent").map(str::to_string),
        ip,
        device_type: None,
        referrer: header_str(headers, "referer").map(str::to_string),
    }
}

fn insert_header(response: &mut Response, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn with_rate_headers(mut response: Response, decision: &RateLimitDecision) -> Response {
    insert_header(
        &mut response,
        HEADER_RATELIMIT_LIMIT,
        &decision.limit.to_string(),
    );
    insert_header(
        &mut response,
        HEADER_RATELIMIT_REMAINING,
        &decision.remaining.to_string(),
    );
    insert_header(
        &mut response,
        HEADER_RATELIMIT_RESET,
        &decision.reset.to_rfc3339(),
    );
    response
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    // Optional at the wire level so a missing field is rejected as a
    // validation error rather than a deserialization failure.
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default, rename = "conversationHistory")]
    conversation_history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    role: String,
    content: String,
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let (client_id, decision) = rate_gate(&state.limiter, &headers)?;

    let seed_history = body
        .conversation_history
        .into_iter()
        .map(|entry| match entry.role.as_str() {
            "assistant" | "model" => ChatMessage::assistant(entry.content),
            _ => ChatMessage::user(entry.content),
        })
        .collect();

    let (session_id, events) = state
        .pipeline
        .respond(ChatTurn {
            query: body.query.unwrap_or_default(),
            session_id: body.session_id,
            client_id,
            metadata: request_metadata(&headers),
            seed_history,
        })
        .await?;

    let sse_stream = events.map(|event| {
        Ok::<Event, Infallible>(match event {
            ChatEvent::Delta(text) => Event::default().data(text),
            ChatEvent::Done { session_id } => Event::default().event("done").data(session_id),
            ChatEvent::Error(message) => Event::default().event("error").data(message),
        })
    });

    let mut response = Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    insert_header(&mut response, HEADER_SESSION_ID, &session_id);
    Ok(with_rate_headers(response, &decision))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    session_id: Option<String>,
    limit: Option<i64>,
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Response, AppError> {
    let (_, decision) = rate_gate(&state.limiter, &headers)?;
    let session_id = params
        .session_id
        .ok_or_else(|| AppError::validation("session_id is required"))?;
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let messages = state.sessions.recent_messages(&session_id, limit).await?;
    let response = Json(json!({
        "session_id": session_id,
        "count": messages.len(),
        "messages": messages,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response();
    Ok(with_rate_headers(response, &decision))
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let (_, decision) = rate_gate(&state.limiter, &headers)?;
    let stats = state.sessions.stats().await?;
    let top_clients = state.sessions.top_clients(5).await?;
    let response = Json(json!({
        "stats": stats,
        "top_clients": top_clients,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response();
    Ok(with_rate_headers(response, &decision))
}

#[derive(Debug, Deserialize)]
struct ToolUsageParams {
    session_id: Option<String>,
}

async fn tools_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ToolUsageParams>,
) -> Result<Response, AppError> {
    let (_, decision) = rate_gate(&state.limiter, &headers)?;
    let session_id = params
        .session_id
        .ok_or_else(|| AppError::validation("session_id is required"))?;
    let remaining = state.governor.remaining(&session_id, CONTEXT_TOOL);
    let response = Json(json!({
        "session_id": session_id,
        "tool_usage": {
            CONTEXT_TOOL: {
                "remaining": remaining,
                "max_usage": state.governor.max_usage(),
                "cooldown_ms": state.governor.cooldown_ms(),
            }
        },
    }))
    .into_response();
    Ok(with_rate_headers(response, &decision))
}

async fn embeddings(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut file: Option<Vec<u8>> = None;
    let mut mode = ChunkingMode::Windowed;
    let mut section: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::validation(format!("invalid multipart body: {err}")))?
    {
        match field.name() {
            Some("file") => {
                let content_type = field.content_type().map(str::to_string);
                if content_type.as_deref() != Some("application/pdf") {
                    return Err(AppError::validation("file must be a PDF"));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::validation(format!("could not read file: {err}")))?;
                file = Some(bytes.to_vec());
            }
            Some("mode") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::validation(format!("could not read mode: {err}")))?;
                mode = match value.as_str() {
                    "windowed" => ChunkingMode::Windowed,
                    "structured" => ChunkingMode::Structured,
                    other => {
                        return Err(AppError::validation(format!(
                            "unknown chunking mode {other:?}"
                        )));
                    }
                };
            }
            Some("section") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::validation(format!("could not read section: {err}")))?;
                if !value.trim().is_empty() {
                    section = Some(value);
                }
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| AppError::validation("file field is required"))?;
    let stored = state.ingestor.ingest_document(&file, mode, section).await?;
    info!(stored, "ingestion request complete");
    Ok(Json(json!({
        "chunks": stored,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response())
}
