use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use crate::relay::{Consumer, Frame, Producer};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub producer: Producer,
    pub consumer: Consumer,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub thread_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub thread_id: String,
}

/// Build the HTTP router. An empty `cors_origins` allows any origin.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/chat/message", post(send_message))
        .route("/api/v1/chat/stream", get(stream))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| {
                HeaderValue::from_str(origin)
                    .inspect_err(|_| warn!(origin = %origin, "Ignoring invalid CORS origin"))
                    .ok()
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "chatrelay" }))
}

/// `POST /api/v1/chat/message`: start a turn; generation continues in the background.
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<StatusCode, ApiError> {
    let thread_id = parse_thread_id(&req.thread_id)?;
    if req.message.trim().is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let stream_id = state.producer.start(&thread_id, &req.message).await?;
    info!(thread_id = %thread_id, stream_id = %stream_id, "Message accepted");

    Ok(StatusCode::OK)
}

/// `GET /api/v1/chat/stream`: SSE stream of the thread's running turn, or
/// `204` when there is nothing to stream.
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let thread_id = parse_thread_id(&query.thread_id)?;
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());

    let Some(attachment) = state.consumer.attach(&thread_id, last_event_id).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let events = state
        .consumer
        .frames(attachment)
        .map(|frame| Ok::<_, Infallible>(sse_event(frame)));

    Ok((
        [
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
        ],
        Sse::new(events),
    )
        .into_response())
}

fn parse_thread_id(raw: &str) -> Result<String, ApiError> {
    Uuid::parse_str(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| ApiError::bad_request(format!("Invalid thread_id '{raw}'")))
}

/// Render one frame. Line breaks in payloads become separate `data:` lines.
fn sse_event(frame: Frame) -> Event {
    match frame {
        Frame::Heartbeat => Event::default().comment("heartbeat"),
        Frame::Entry(entry) => {
            let data = entry.payload.replace("\r\n", "\n").replace('\r', "\n");
            Event::default()
                .event(entry.kind.as_str())
                .id(entry.id.to_string())
                .data(data)
        }
    }
}
