//! HTTP endpoints for chat turns and chat history.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::orchestrator::ChatService;
use super::request::ChatTurn;
use crate::error::ApiError;
use crate::store::Database;

/// Text deltas buffered between the turn task and the response body.
const STREAM_BUFFER: usize = 32;

/// Shared state for chat routes.
#[derive(Clone)]
pub struct ChatRouteState {
    pub service: Arc<ChatService>,
    pub store: Arc<dyn Database>,
}

/// POST /chat
///
/// Validates the body, opens the model stream and answers with the
/// assistant's text as a chunked `text/plain` body. Errors before the first
/// byte are JSON `{ error }` responses.
async fn chat(State(state): State<ChatRouteState>, body: Bytes) -> Result<Response, ApiError> {
    let turn = ChatTurn::from_body(&body)?;
    let active = state.service.begin(turn).await?;

    let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);
    tokio::spawn(active.run(tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

/// GET /api/users/{user_id}/chats
async fn list_chats(
    State(state): State<ChatRouteState>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let chats = state.store.list_chats(&user_id).await?;
    Ok(Json(chats).into_response())
}

/// GET /api/users/{user_id}/chats/{chat_id}/messages
///
/// 404 when the chat does not exist or belongs to someone else.
async fn list_messages(
    State(state): State<ChatRouteState>,
    Path((user_id, chat_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let chat_id =
        Uuid::parse_str(&chat_id).map_err(|_| ApiError::validation("Invalid chat ID"))?;
    let messages = state.store.list_chat_messages(&user_id, chat_id).await?;
    Ok(Json(messages).into_response())
}

/// Build the chat routes.
pub fn chat_routes(state: ChatRouteState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/api/users/{user_id}/chats", get(list_chats))
        .route("/api/users/{user_id}/chats/{chat_id}/messages", get(list_messages))
        .with_state(state)
}
