//! Conversation message endpoints.
//!
//! - POST /api/v1/agents/{agent_id}/messages - submit a message
//! - GET  /api/v1/agents/{agent_id}/messages - recent messages for a user
//!
//! A POST with `stream: true` or `Accept: text/event-stream` is answered
//! with Server-Sent Events; anything else gets the complete reply in the
//! JSON envelope. SSE event names:
//! - `user_message`, `assistant_placeholder`
//! - `assistant_delta` - `{ id, full, delta?, finish_reason?, done? }`
//! - `speech_stream_started`, `speech_stream_chunk`,
//!   `speech_stream_completed`, `speech_stream_failed`
//! - `assistant_message`, `error`, `done`

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::ACCEPT;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use companion_core::turn::{TurnRequest, TurnStatus};
use companion_types::chat::{ChatMessage, MessageRole};
use companion_types::event::TurnEvent;
use companion_types::speech::SpeechPreferences;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Events buffered between the turn task and the SSE body.
const EVENT_BUFFER: usize = 64;

/// Request body for posting a message.
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub speech: Option<SpeechPreferences>,
}

/// Query parameters for message listing.
#[derive(Debug, Deserialize)]
pub struct MessageListQuery {
    pub user_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Parse a UUID from a request field, returning a 400 error on invalid format.
fn parse_uuid(field: &str, s: &str) -> Result<Uuid, AppError> {
    s.trim()
        .parse::<Uuid>()
        .map_err(|_| AppError::Validation(format!("Invalid {field}: {s}")))
}

/// True when the client asked for an event stream.
fn wants_event_stream(headers: &HeaderMap, body_flag: bool) -> bool {
    body_flag
        || headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| {
                v.split(';')
                    .next()
                    .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
            })
}

fn sse_event(event: &TurnEvent) -> Event {
    Event::default().event(event.name()).data(event.payload_json())
}

/// POST /api/v1/agents/{agent_id}/messages
pub async fn post_message(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostMessageRequest>,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let stream = wants_event_stream(&headers, body.stream);

    let request = TurnRequest {
        agent_id: parse_uuid("agent_id", &agent_id)?,
        user_id: parse_uuid("user_id", &body.user_id)?,
        role: body.role.unwrap_or(MessageRole::User),
        content: body.content,
        speech: body.speech.unwrap_or_default(),
    };

    // Only user messages produce a reply worth streaming.
    if stream && request.role == MessageRole::User {
        return stream_turn(state, request).await;
    }

    let reply = state.turns.submit(request).await?;
    Ok(ApiResponse::success(reply, start).into_response())
}

/// Open the turn, then relay its events as SSE.
///
/// Errors before the placeholder exists come back as a plain HTTP error.
/// Dropping the response body cancels the turn.
async fn stream_turn(state: AppState, request: TurnRequest) -> Result<Response, AppError> {
    let turn = state.turns.begin_stream(request).await?;

    let (tx, mut rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        let outcome = turn.run(tx, cancel).await;
        match outcome.status {
            TurnStatus::Completed | TurnStatus::Recovered => {
                tracing::debug!(message_id = %outcome.message_id, status = ?outcome.status, "streaming turn finished");
            }
            TurnStatus::Failed | TurnStatus::Cancelled => {
                tracing::info!(message_id = %outcome.message_id, status = ?outcome.status, "streaming turn ended early");
            }
        }
    });

    let sse_stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok::<_, Infallible>(sse_event(&event));
        }
    };

    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

/// GET /api/v1/agents/{agent_id}/messages?user_id=&limit=
pub async fn list_messages(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<MessageListQuery>,
) -> Result<ApiResponse<Vec<ChatMessage>>, AppError> {
    let start = Instant::now();
    let agent_id = parse_uuid("agent_id", &agent_id)?;
    let user_id = parse_uuid("user_id", &query.user_id)?;

    let messages = state
        .turns
        .recent_messages(&agent_id, &user_id, query.limit)
        .await?;

    Ok(ApiResponse::success(messages, start))
}
