// Per-socket event loop.
//
// The socket auto-joins the room named in the upgrade path, then serves
// control messages until close or heartbeat timeout. Messages from one
// socket are processed in arrival order; outbound traffic from other
// sockets arrives through the connection store's channel.

use axum::extract::ws::{Message, WebSocket};
use fieldsync_common::protocol::ws::CollabMessage;
use fieldsync_common::types::{Accountability, RoomKey};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::state::CollabState;
use crate::sync;
use crate::ws::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS};

pub(crate) async fn handle_socket(
    state: CollabState,
    mut socket: WebSocket,
    accountability: Accountability,
    initial_room: RoomKey,
) {
    let socket_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<CollabMessage>();
    state.connections.register(socket_id, accountability.clone(), outbound_sender).await;

    // The upgrade path names the room; join it before serving traffic.
    match sync::handle_join(&state, socket_id, &accountability, &initial_room.to_string()).await {
        Ok(messages) => {
            for message in messages {
                if send_message(&mut socket, &message).await.is_err() {
                    sync::disconnect_cleanup(&state, socket_id).await;
                    return;
                }
            }
        }
        Err(error_message) => {
            let _ = send_message(&mut socket, &error_message).await;
            let _ = socket.send(Message::Close(None)).await;
            sync::disconnect_cleanup(&state, socket_id).await;
            return;
        }
    }

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if
    // no pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(socket_id = %socket_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if send_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = match serde_json::from_str::<CollabMessage>(&raw_message) {
                            Ok(message) => message,
                            Err(_) => {
                                let error = sync::ws_error(
                                    ErrorCode::ValidationFailed,
                                    "invalid websocket frame payload",
                                    None,
                                );
                                if send_message(&mut socket, &error).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        let result =
                            dispatch(&state, socket_id, &accountability, inbound).await;
                        let outcome = match result {
                            Ok(messages) => messages,
                            Err(error_message) => vec![error_message],
                        };
                        let mut send_failed = false;
                        for outbound in outcome {
                            if send_message(&mut socket, &outbound).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    debug!(socket_id = %socket_id, "socket closed");
    sync::disconnect_cleanup(&state, socket_id).await;
}

async fn dispatch(
    state: &CollabState,
    socket_id: Uuid,
    accountability: &Accountability,
    inbound: CollabMessage,
) -> Result<Vec<CollabMessage>, CollabMessage> {
    match inbound {
        CollabMessage::Join { room } => {
            sync::handle_join(state, socket_id, accountability, &room).await
        }
        CollabMessage::Leave { room } => {
            sync::handle_leave(state, socket_id, accountability, &room).await
        }
        CollabMessage::Update { room, payload_b64 } => {
            sync::handle_update(state, socket_id, accountability, &room, &payload_b64).await
        }
        CollabMessage::SetActiveField { room, field } => {
            sync::handle_set_active_field(state, socket_id, accountability, &room, &field).await
        }
        CollabMessage::RemoveActiveField { room } => {
            sync::handle_remove_active_field(state, socket_id, accountability, &room).await
        }
        // Server-to-client message types are not valid inbound.
        _ => Err(sync::ws_error(
            ErrorCode::ValidationFailed,
            "unexpected message type from client",
            None,
        )),
    }
}

async fn send_message(socket: &mut WebSocket, message: &CollabMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
