// Join/sync protocol logic.
//
// Each handler takes the shared state, the calling socket, and a
// verified accountability, and returns the messages to deliver to that
// socket. Side effects (room mutation, broadcasts to other sockets, bus
// publications) happen inside. Permission checks run at sync time, not
// from a cache, because access can change between edits and a later
// join; checks are batched per collection to keep joins to one
// authorization round-trip per collection.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use fieldsync_common::protocol::ws::{CollabMessage, FieldBinding};
use fieldsync_common::types::{Accountability, ActiveField, PresentUser, RoomKey};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusAction, BusEvent};
use crate::error::ErrorCode;
use crate::rooms::RoomError;
use crate::state::CollabState;

pub fn ws_error(code: ErrorCode, message: impl Into<String>, room: Option<String>) -> CollabMessage {
    CollabMessage::Error {
        code: code.as_str().to_string(),
        message: message.into(),
        retryable: code.retryable(),
        room,
    }
}

fn room_error(room: &str, error: RoomError) -> CollabMessage {
    match error {
        RoomError::NotFound(_) => {
            ws_error(ErrorCode::NotFound, "room does not exist", Some(room.to_string()))
        }
        RoomError::InvalidUpdate { detail, .. } => {
            ws_error(ErrorCode::ValidationFailed, detail, Some(room.to_string()))
        }
    }
}

fn internal(room: &str) -> CollabMessage {
    ws_error(ErrorCode::InternalError, ErrorCode::InternalError.default_message(), Some(room.to_string()))
}

fn teardown_timer_id(room: &str) -> String {
    format!("room-teardown:{room}")
}

/// Join a socket to a room and reply with the room's sync payload.
///
/// Creates the room on first join, cancels a pending teardown, mints or
/// reuses the account's ephemeral identity, announces the user to the
/// rest of the room and over the bus, and builds a permission-filtered
/// snapshot for the joiner. A repeated join of the same room by the same
/// socket only re-sends the snapshot.
pub async fn handle_join(
    state: &CollabState,
    socket_id: Uuid,
    accountability: &Accountability,
    room: &str,
) -> Result<Vec<CollabMessage>, CollabMessage> {
    let key: RoomKey = room
        .parse()
        .map_err(|error: fieldsync_common::types::InvalidRoomKey| {
            ws_error(ErrorCode::ValidationFailed, error.to_string(), Some(room.to_string()))
        })?;
    let name = key.to_string();

    state.rooms.create(&name).await;
    state.timers.cancel(&teardown_timer_id(&name)).await;

    if state.connections.is_in_room(socket_id, &name).await {
        let sync = build_sync_payload(state, &key, &name, accountability)
            .await
            .map_err(|error| {
                warn!(%error, room = %name, "failed to build sync payload");
                internal(&name)
            })?;
        return Ok(vec![sync]);
    }

    state.connections.track_room(socket_id, &name).await;

    let identity = state.identity.resolve(accountability.user_id).await;
    let profile = match state.profiles.profile(accountability.user_id).await {
        Ok(profile) => profile,
        Err(error) => {
            warn!(%error, "profile lookup failed; joining anonymously");
            None
        }
    };
    let display_name = profile.as_ref().and_then(|p| p.display_name.clone());
    let avatar = profile.as_ref().and_then(|p| p.avatar.clone());

    state
        .rooms
        .add_user(
            &name,
            identity.ephemeral_id,
            accountability.user_id,
            identity.color.clone(),
            display_name.clone(),
        )
        .await
        .map_err(|error| room_error(&name, error))?;
    state.awareness.upsert(identity.ephemeral_id, &name).await;

    let user = PresentUser {
        connection_id: identity.ephemeral_id,
        user_id: accountability.user_id,
        color: identity.color,
        display_name,
        avatar,
    };

    state
        .bus
        .publish(BusEvent::AwarenessUser {
            room: name.clone(),
            action: BusAction::Join,
            user_id: accountability.user_id,
            data: serde_json::to_value(&user).unwrap_or_default(),
        })
        .await;

    state
        .connections
        .broadcast_to_room(
            &name,
            CollabMessage::UserJoined { room: name.clone(), user },
            Some(socket_id),
        )
        .await;

    let sync = build_sync_payload(state, &key, &name, accountability).await.map_err(|error| {
        warn!(%error, room = %name, "failed to build sync payload");
        internal(&name)
    })?;

    debug!(room = %name, user_id = %accountability.user_id, "user joined room");
    Ok(vec![sync])
}

/// Snapshot of a room for one caller: sanitized document state, users
/// deduplicated by account id, and active fields the caller may see.
async fn build_sync_payload(
    state: &CollabState,
    key: &RoomKey,
    name: &str,
    accountability: &Accountability,
) -> anyhow::Result<CollabMessage> {
    let document_fields = state.rooms.document_fields(name, key).await?;
    let readable =
        state.access.readable_fields(accountability, &key.collection, &document_fields).await?;
    let state_b64 = BASE64.encode(state.rooms.sanitized_state(name, key, &readable).await?);

    let mut users = Vec::new();
    let mut seen_accounts = HashSet::new();
    for (ephemeral_id, room_user) in state.rooms.users(name).await? {
        if !seen_accounts.insert(room_user.user_id) {
            continue;
        }
        let avatar = match state.profiles.profile(room_user.user_id).await {
            Ok(profile) => profile.and_then(|p| p.avatar),
            Err(error) => {
                warn!(%error, "profile lookup failed for present user");
                None
            }
        };
        users.push(PresentUser {
            connection_id: ephemeral_id,
            user_id: room_user.user_id,
            color: room_user.color,
            display_name: room_user.display_name,
            avatar,
        });
    }

    // Field bindings are re-validated on every sync; one permission call
    // per collection covers all of its bindings. Denied fields are
    // omitted, not errors.
    let bindings = state.rooms.fields(name).await?;
    let mut candidates_by_collection: HashMap<String, Vec<String>> = HashMap::new();
    for (_, field) in &bindings {
        let fields = candidates_by_collection.entry(field.collection.clone()).or_default();
        if !fields.contains(&field.field) {
            fields.push(field.field.clone());
        }
    }
    let mut permitted_by_collection: HashMap<String, Vec<String>> = HashMap::new();
    for (collection, candidates) in candidates_by_collection {
        let permitted =
            state.access.readable_fields(accountability, &collection, &candidates).await?;
        permitted_by_collection.insert(collection, permitted);
    }
    let active_fields = bindings
        .into_iter()
        .filter(|(_, field)| {
            permitted_by_collection
                .get(&field.collection)
                .is_some_and(|permitted| permitted.contains(&field.field))
        })
        .map(|(connection_id, field)| FieldBinding { connection_id, field })
        .collect();

    Ok(CollabMessage::Sync { room: name.to_string(), state_b64, users, active_fields })
}

/// Apply a document update from a socket and fan it out to the rest of
/// the room.
pub async fn handle_update(
    state: &CollabState,
    socket_id: Uuid,
    accountability: &Accountability,
    room: &str,
    payload_b64: &str,
) -> Result<Vec<CollabMessage>, CollabMessage> {
    if !state.connections.is_in_room(socket_id, room).await {
        return Err(ws_error(
            ErrorCode::NotFound,
            "socket has not joined this room",
            Some(room.to_string()),
        ));
    }

    let payload = BASE64.decode(payload_b64).map_err(|_| {
        ws_error(ErrorCode::ValidationFailed, "payload is not valid base64", Some(room.to_string()))
    })?;

    state.rooms.apply_update(room, &payload).await.map_err(|error| room_error(room, error))?;

    if let Some(identity) = state.identity.peek(accountability.user_id).await {
        state.awareness.touch(identity.ephemeral_id).await;
    }

    state
        .connections
        .broadcast_to_room(
            room,
            CollabMessage::Update { room: room.to_string(), payload_b64: payload_b64.to_string() },
            Some(socket_id),
        )
        .await;

    Ok(Vec::new())
}

/// Claim a field lock for the caller's presence identity.
///
/// Denied reads surface as an explicit forbidden error to the caller
/// rather than a silent drop.
pub async fn handle_set_active_field(
    state: &CollabState,
    socket_id: Uuid,
    accountability: &Accountability,
    room: &str,
    field: &str,
) -> Result<Vec<CollabMessage>, CollabMessage> {
    if !state.connections.is_in_room(socket_id, room).await {
        return Err(ws_error(
            ErrorCode::NotFound,
            "socket has not joined this room",
            Some(room.to_string()),
        ));
    }

    let key: RoomKey = room.parse().map_err(|_| {
        ws_error(ErrorCode::ValidationFailed, "invalid room identifier", Some(room.to_string()))
    })?;

    let permitted = state
        .access
        .can_read_field(accountability, &key.collection, field)
        .await
        .map_err(|error| {
            warn!(%error, "permission check failed");
            internal(room)
        })?;
    if !permitted {
        return Err(ws_error(
            ErrorCode::AuthForbidden,
            format!("no read access to field '{field}'"),
            Some(room.to_string()),
        ));
    }

    let identity = state.identity.resolve(accountability.user_id).await;
    let active = ActiveField {
        collection: key.collection.clone(),
        field: field.to_string(),
        primary_key: key.primary_key.clone(),
    };

    state
        .rooms
        .set_field(room, identity.ephemeral_id, active.clone())
        .await
        .map_err(|error| room_error(room, error))?;
    let replaced =
        state.awareness.set_active_field(identity.ephemeral_id, room, active.clone()).await;

    // A connection holds one lock across all rooms. Moving it here must
    // also release the binding still recorded in the previous room, or
    // that room shows a phantom active field until its holder leaves.
    if let Some((previous_room, _)) = replaced {
        if previous_room != room {
            release_field_binding(state, accountability, identity.ephemeral_id, &previous_room)
                .await;
        }
    }

    let binding = FieldBinding { connection_id: identity.ephemeral_id, field: active };
    state
        .bus
        .publish(BusEvent::AwarenessUser {
            room: room.to_string(),
            action: BusAction::FieldFocus,
            user_id: accountability.user_id,
            data: serde_json::to_value(&binding).unwrap_or_default(),
        })
        .await;
    state
        .connections
        .broadcast_to_room(
            room,
            CollabMessage::FieldFocus { room: room.to_string(), binding },
            Some(socket_id),
        )
        .await;

    Ok(Vec::new())
}

/// Clear a connection's binding in `room` and announce the blur to the
/// room and over the bus. Missing rooms and absent bindings are ignored.
async fn release_field_binding(
    state: &CollabState,
    accountability: &Accountability,
    connection_id: Uuid,
    room: &str,
) {
    match state.rooms.clear_field(room, connection_id).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(error) => {
            debug!(%error, room, "no field binding to release");
            return;
        }
    }

    state
        .bus
        .publish(BusEvent::AwarenessUser {
            room: room.to_string(),
            action: BusAction::FieldBlur,
            user_id: accountability.user_id,
            data: serde_json::Value::String(connection_id.to_string()),
        })
        .await;
    state
        .connections
        .broadcast_to_room(
            room,
            CollabMessage::FieldBlur { room: room.to_string(), connection_id },
            None,
        )
        .await;
}

/// Release the caller's field lock, if any.
pub async fn handle_remove_active_field(
    state: &CollabState,
    socket_id: Uuid,
    accountability: &Accountability,
    room: &str,
) -> Result<Vec<CollabMessage>, CollabMessage> {
    if !state.connections.is_in_room(socket_id, room).await {
        return Err(ws_error(
            ErrorCode::NotFound,
            "socket has not joined this room",
            Some(room.to_string()),
        ));
    }

    let Some(identity) = state.identity.peek(accountability.user_id).await else {
        return Ok(Vec::new());
    };

    let cleared =
        state.rooms.clear_field(room, identity.ephemeral_id).await.map_err(|error| room_error(room, error))?;
    state.awareness.clear_active_field(identity.ephemeral_id).await;

    if cleared {
        state
            .bus
            .publish(BusEvent::AwarenessUser {
                room: room.to_string(),
                action: BusAction::FieldBlur,
                user_id: accountability.user_id,
                data: serde_json::Value::String(identity.ephemeral_id.to_string()),
            })
            .await;
        state
            .connections
            .broadcast_to_room(
                room,
                CollabMessage::FieldBlur {
                    room: room.to_string(),
                    connection_id: identity.ephemeral_id,
                },
                Some(socket_id),
            )
            .await;
    }

    Ok(Vec::new())
}

/// Leave a room on request.
pub async fn handle_leave(
    state: &CollabState,
    socket_id: Uuid,
    accountability: &Accountability,
    room: &str,
) -> Result<Vec<CollabMessage>, CollabMessage> {
    if !state.connections.is_in_room(socket_id, room).await {
        return Err(ws_error(
            ErrorCode::NotFound,
            "socket has not joined this room",
            Some(room.to_string()),
        ));
    }

    state.connections.untrack_room(socket_id, room).await;
    depart_room(state, accountability, room).await;
    Ok(Vec::new())
}

/// Socket closed: leave every room it was in and retire the account's
/// ephemeral identity once its last socket is gone.
pub async fn disconnect_cleanup(state: &CollabState, socket_id: Uuid) {
    let accountability = state.connections.accountability(socket_id).await;
    let rooms = state.connections.unregister(socket_id).await;

    let Some(accountability) = accountability else {
        return;
    };

    for room in rooms {
        depart_room(state, &accountability, &room).await;
    }

    if state.connections.sockets_for_account(accountability.user_id).await == 0 {
        if let Some(identity) = state.identity.peek(accountability.user_id).await {
            state.awareness.remove(identity.ephemeral_id).await;
        }
        state.identity.invalidate(accountability.user_id).await;
    }
}

async fn depart_room(state: &CollabState, accountability: &Accountability, room: &str) {
    let Some(identity) = state.identity.peek(accountability.user_id).await else {
        return;
    };

    let outcome = match state.rooms.remove_user(room, identity.ephemeral_id).await {
        Ok(outcome) => outcome,
        Err(RoomError::NotFound(_)) => return,
        Err(error) => {
            warn!(%error, room, "failed to remove user from room");
            return;
        }
    };

    if outcome.removed {
        state.awareness.remove_room(identity.ephemeral_id, room).await;
        state
            .bus
            .publish(BusEvent::AwarenessUser {
                room: room.to_string(),
                action: BusAction::Leave,
                user_id: accountability.user_id,
                data: serde_json::Value::String(identity.ephemeral_id.to_string()),
            })
            .await;
        state
            .connections
            .broadcast_to_room(
                room,
                CollabMessage::UserLeft {
                    room: room.to_string(),
                    connection_id: identity.ephemeral_id,
                },
                None,
            )
            .await;
        debug!(room, user_id = %accountability.user_id, "user left room");
    }

    if outcome.room_empty {
        let rooms = state.rooms.clone();
        let room_name = room.to_string();
        state
            .timers
            .schedule(&teardown_timer_id(room), state.config.room_grace, async move {
                // Re-check emptiness at fire time; a join during the
                // grace period cancels the timer, but be safe anyway.
                if rooms.is_empty(&room_name).await.unwrap_or(false) {
                    rooms.remove(&room_name).await;
                    debug!(room = %room_name, "tore down empty room");
                }
            })
            .await;
    }
}

/// Background task releasing field locks idle past the configured
/// threshold. Presence is untouched; only the lock expires.
pub fn spawn_idle_sweeper(state: CollabState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let swept = state.awareness.sweep(Utc::now(), state.config.idle_timeout).await;
            for lock in swept {
                if let Err(error) = state.rooms.clear_field(&lock.room, lock.connection_id).await {
                    debug!(%error, room = %lock.room, "swept lock for missing room");
                }
                state
                    .connections
                    .broadcast_to_room(
                        &lock.room,
                        CollabMessage::FieldBlur {
                            room: lock.room.clone(),
                            connection_id: lock.connection_id,
                        },
                        None,
                    )
                    .await;
                debug!(room = %lock.room, connection_id = %lock.connection_id, "released idle field lock");
            }
        }
    });
}

/// Background task applying presence events published by other replicas.
pub fn spawn_bus_listener(state: CollabState) {
    let Some(mut subscription) = state.bus.subscribe() else {
        return;
    };
    state.bus.spawn_listener();

    tokio::spawn(async move {
        loop {
            let frame = match subscription.recv().await {
                Ok(frame) => frame,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscription lagged; presence may be stale");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if state.bus.is_own(&frame) {
                continue;
            }
            apply_remote_event(&state, frame.event).await;
        }
    });
}

async fn apply_remote_event(state: &CollabState, event: BusEvent) {
    let BusEvent::AwarenessUser { room, action, data, .. } = event;

    let message = match action {
        BusAction::Join => match serde_json::from_value::<PresentUser>(data) {
            Ok(user) => CollabMessage::UserJoined { room: room.clone(), user },
            Err(error) => {
                warn!(%error, "ignoring malformed remote join event");
                return;
            }
        },
        BusAction::Leave => match parse_connection_id(&data) {
            Some(connection_id) => CollabMessage::UserLeft { room: room.clone(), connection_id },
            None => return,
        },
        BusAction::FieldFocus => match serde_json::from_value::<FieldBinding>(data) {
            Ok(binding) => CollabMessage::FieldFocus { room: room.clone(), binding },
            Err(error) => {
                warn!(%error, "ignoring malformed remote focus event");
                return;
            }
        },
        BusAction::FieldBlur => match parse_connection_id(&data) {
            Some(connection_id) => CollabMessage::FieldBlur { room: room.clone(), connection_id },
            None => return,
        },
    };

    state.connections.broadcast_to_room(&room, message, None).await;
}

fn parse_connection_id(data: &serde_json::Value) -> Option<Uuid> {
    data.as_str().and_then(|raw| Uuid::parse_str(raw).ok())
}
