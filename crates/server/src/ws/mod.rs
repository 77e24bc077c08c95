// WebSocket upgrade bridge.
//
// The bridge owns the collaboration routes and is attached to the host
// router exactly once; the boolean guard makes a second attach a no-op
// that callers can detect. Authentication and room validation happen
// before the protocol switch, so failures are ordinary HTTP responses
// (401/400) instead of raw bytes written to a hijacked socket.

pub mod connections;
mod handler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fieldsync_common::protocol::ws::CURRENT_PROTOCOL_VERSION;
use fieldsync_common::types::RoomKey;
use serde_json::json;
use tracing::info;

use crate::auth::session_cookie_token;
use crate::error::{
    request_id_from_headers_or_generate, with_request_id_scope, CollabError, ErrorCode,
};
use crate::state::CollabState;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: usize = 262_144;

/// One-shot mount point for the collaboration routes.
pub struct CollabBridge {
    state: CollabState,
    attached: AtomicBool,
}

impl CollabBridge {
    pub fn new(state: CollabState) -> Arc<Self> {
        Arc::new(Self { state, attached: AtomicBool::new(false) })
    }

    /// Build the collaboration router. Returns `None` on every call
    /// after the first; the bridge must be mounted exactly once.
    pub fn attach(&self) -> Option<Router> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(router(self.state.clone()))
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

fn router(state: CollabState) -> Router {
    Router::new()
        .route("/collaboration", get(missing_room))
        .route("/collaboration/status", get(status))
        .route("/collaboration/{room}", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn ws_upgrade(
    Path(room): Path<String>,
    State(state): State<CollabState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request_id = request_id_from_headers_or_generate(&headers);
    with_request_id_scope(request_id, async move {
        let Some(token) = session_cookie_token(&headers, &state.config.cookie_name) else {
            return CollabError::new(ErrorCode::AuthInvalidToken, "missing session cookie")
                .into_response();
        };

        let accountability = match state.tokens.verify_session_token(&token) {
            Ok(accountability) => accountability,
            Err(_) => {
                return CollabError::new(ErrorCode::AuthInvalidToken, "invalid session token")
                    .into_response();
            }
        };

        let key: RoomKey = match room.parse() {
            Ok(key) => key,
            Err(error) => {
                return CollabError::new(
                    ErrorCode::ValidationFailed,
                    format!("invalid room identifier: {error}"),
                )
                .into_response();
            }
        };

        info!(room = %key, user_id = %accountability.user_id, "websocket upgrade accepted");
        ws.max_frame_size(MAX_FRAME_BYTES)
            .on_upgrade(move |socket| handler::handle_socket(state, socket, accountability, key))
            .into_response()
    })
    .await
}

async fn missing_room(headers: HeaderMap) -> Response {
    let request_id = request_id_from_headers_or_generate(&headers);
    with_request_id_scope(request_id, async move {
        CollabError::new(ErrorCode::ValidationFailed, "missing room identifier in path")
            .into_response()
    })
    .await
}

async fn status(State(state): State<CollabState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "initialized": true,
        "protocol": CURRENT_PROTOCOL_VERSION,
        "websocket_url": format!("{}/collaboration", state.config.ws_base_url),
        "connections": state.connections.connection_count().await,
        "rooms": state.rooms.room_count().await,
    }))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
