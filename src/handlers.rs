use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures::Stream;
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, ErrorCode, Result};
use crate::models::{CancelResponse, ChatRequest, HealthStatus, ResumeQuery, SessionStatus};
use crate::stream::{ScanContext, SessionReader, WireFrame};

pub const STREAM_SESSION_HEADER: &str = "x-stream-session";

// ============================================================================
// HEADER MIDDLEWARE
// ============================================================================

/// Who is asking, taken from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: String,
    pub conversation_id: String,
}

pub fn identity_from_headers(headers: &HeaderMap) -> Result<RequestIdentity> {
    let user_id = headers
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::unauthorized("Missing X-User-ID header"))?;

    let conversation_id = headers
        .get("X-Conversation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    Ok(RequestIdentity {
        user_id,
        conversation_id,
    })
}

pub async fn auth_middleware(mut request: Request, next: Next) -> Result<Response> {
    let identity = identity_from_headers(request.headers())?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

// ============================================================================
// STREAM HANDLERS
// ============================================================================

/// POST /api/chat/stream
///
/// Starts a generation and streams it from offset 0. The session id comes
/// back in the `X-Stream-Session` header so clients can resume later.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<RequestIdentity>,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    if request.message.trim().is_empty() {
        return Err(AppError::bad_request("Message must not be empty"));
    }

    let source = state
        .generator
        .generate(&request.message, request.model.as_deref())
        .await
        .map_err(|e| {
            AppError::new(
                ErrorCode::ExternalServiceError,
                format!("Generator '{}' failed: {}", state.generator.name(), e),
            )
        })?;

    let context = ScanContext {
        agent_name: state.agent_name.clone(),
        user_id: identity.user_id,
        conversation_id: identity.conversation_id,
    };
    let (session_id, reader) = state.service.open_session(source, context).await?;

    Ok(([(STREAM_SESSION_HEADER, session_id)], sse_response(reader)).into_response())
}

/// GET /api/chat/stream/{session_id}?from=K
///
/// Replays from `from` (or from `Last-Event-ID` + 1), then follows live.
pub async fn chat_stream_resume(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<RequestIdentity>,
    Path(session_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    ensure_owner(&state, &session_id, &identity).await?;
    let from = resume_offset(&query, &headers)?;
    let reader = state.service.resume_session(&session_id, from).await?;

    Ok(([(STREAM_SESSION_HEADER, session_id)], sse_response(reader)).into_response())
}

/// DELETE /api/chat/stream/{session_id}
pub async fn chat_stream_cancel(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<RequestIdentity>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    ensure_owner(&state, &session_id, &identity).await?;

    if state.service.cancel(&session_id).await {
        Ok(Json(CancelResponse {
            success: true,
            session_id: session_id.clone(),
            message: format!("Session {} cancelled successfully", session_id),
        }))
    } else {
        Err(AppError::new(
            ErrorCode::NotFound,
            format!("Session {} not found or already completed", session_id),
        ))
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let sessions = state.service.sessions();
    let resumable = sessions.bounded(sessions.store().ping()).await.is_ok();
    Json(HealthStatus::healthy(
        resumable,
        sessions.active_count().await,
        state.service.requests().active_count().await,
    ))
}

// ============================================================================
// Helpers
// ============================================================================

/// Query `from` wins; otherwise resume right after the last id the client saw.
pub fn resume_offset(query: &ResumeQuery, headers: &HeaderMap) -> Result<Option<u64>> {
    if query.from.is_some() {
        return Ok(query.from);
    }

    match headers.get("Last-Event-ID") {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .and_then(|last| last.checked_add(1))
            .map(Some)
            .ok_or_else(|| AppError::bad_request("Last-Event-ID must be an event offset")),
    }
}

async fn ensure_owner(
    state: &AppState,
    session_id: &str,
    identity: &RequestIdentity,
) -> Result<()> {
    match state.service.sessions().owner_of(session_id).await {
        Some(owner) if owner != identity.user_id => {
            Err(AppError::not_found(format!("Session {}", session_id)))
        }
        _ => Ok(()),
    }
}

fn sse_response(reader: SessionReader) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(frame_stream(reader)).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn frame_stream(mut reader: SessionReader) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(item) = reader.next_event().await {
            match WireFrame::from_item(&item) {
                Ok(frame) => {
                    let done = frame.is_done();
                    yield Ok(to_sse_event(frame));
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    log::error!(
                        "❌ Failed to serialize event for session {}: {}",
                        reader.session_id(),
                        e
                    );
                    yield Ok(to_sse_event(WireFrame::done(SessionStatus::Failed)));
                    break;
                }
            }
        }
    }
}

fn to_sse_event(frame: WireFrame) -> Event {
    let event = Event::default();
    let event = match frame.id {
        Some(id) => event.id(id),
        None => event,
    };
    event.data(frame.data)
}
