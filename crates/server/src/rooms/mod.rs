// Room bookkeeping: one shared Yjs document plus user/field state per
// collaboration room.
//
// No authorization happens at this layer — callers must have already
// authorized the user for the collection/record the room name encodes.
// Operations on missing rooms return `RoomError::NotFound` instead of
// silently doing nothing, so callers can assert invariants.

use std::collections::HashMap;
use std::sync::Arc;

use fieldsync_common::types::{ActiveField, RoomKey};
use tokio::sync::RwLock;
use uuid::Uuid;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact, Update};

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room '{0}' does not exist")]
    NotFound(String),

    #[error("invalid document update for room '{room}': {detail}")]
    InvalidUpdate { room: String, detail: String },
}

/// A user present in a room, keyed externally by ephemeral connection id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomUser {
    pub user_id: Uuid,
    pub color: String,
    pub display_name: Option<String>,
    /// Live WebSocket connections behind this ephemeral id. Presence is
    /// removed only when this reaches zero, so one connection's
    /// disconnect cannot clear another's presence.
    pub connections: usize,
}

struct Room {
    doc: Doc,
    users: HashMap<Uuid, RoomUser>,
    fields: HashMap<Uuid, ActiveField>,
}

impl Room {
    fn new() -> Self {
        Self { doc: Doc::new(), users: HashMap::new(), fields: HashMap::new() }
    }
}

/// Outcome of removing a user's connection from a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveUserOutcome {
    /// The presence entry was fully removed (last connection gone).
    pub removed: bool,
    /// The room has no users left after the removal.
    pub room_empty: bool,
}

/// In-memory map of room name -> room state.
///
/// Explicitly constructed and dependency-injected; no process-global
/// instance exists.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the room if absent. Returns true when a room was created.
    pub async fn create(&self, name: &str) -> bool {
        let mut guard = self.rooms.write().await;
        if guard.contains_key(name) {
            return false;
        }
        guard.insert(name.to_string(), Room::new());
        true
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.rooms.read().await.contains_key(name)
    }

    /// Remove the room entirely. Returns true when a room was removed.
    pub async fn remove(&self, name: &str) -> bool {
        self.rooms.write().await.remove(name).is_some()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Add a user connection under the given ephemeral id, creating the
    /// presence entry on first connection.
    pub async fn add_user(
        &self,
        name: &str,
        ephemeral_id: Uuid,
        user_id: Uuid,
        color: String,
        display_name: Option<String>,
    ) -> Result<(), RoomError> {
        let mut guard = self.rooms.write().await;
        let room = guard.get_mut(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        room.users
            .entry(ephemeral_id)
            .and_modify(|user| user.connections += 1)
            .or_insert(RoomUser { user_id, color, display_name, connections: 1 });
        Ok(())
    }

    /// Drop one connection for the ephemeral id; the presence entry and
    /// any active field go away with the last connection.
    pub async fn remove_user(
        &self,
        name: &str,
        ephemeral_id: Uuid,
    ) -> Result<RemoveUserOutcome, RoomError> {
        let mut guard = self.rooms.write().await;
        let room = guard.get_mut(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;

        let mut removed = false;
        if let Some(user) = room.users.get_mut(&ephemeral_id) {
            user.connections = user.connections.saturating_sub(1);
            if user.connections == 0 {
                room.users.remove(&ephemeral_id);
                room.fields.remove(&ephemeral_id);
                removed = true;
            }
        }

        Ok(RemoveUserOutcome { removed, room_empty: room.users.is_empty() })
    }

    pub async fn users(&self, name: &str) -> Result<Vec<(Uuid, RoomUser)>, RoomError> {
        let guard = self.rooms.read().await;
        let room = guard.get(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        Ok(room.users.iter().map(|(id, user)| (*id, user.clone())).collect())
    }

    pub async fn user_count(&self, name: &str) -> Result<usize, RoomError> {
        let guard = self.rooms.read().await;
        let room = guard.get(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        Ok(room.users.len())
    }

    pub async fn is_empty(&self, name: &str) -> Result<bool, RoomError> {
        Ok(self.user_count(name).await? == 0)
    }

    pub async fn set_field(
        &self,
        name: &str,
        ephemeral_id: Uuid,
        field: ActiveField,
    ) -> Result<(), RoomError> {
        let mut guard = self.rooms.write().await;
        let room = guard.get_mut(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        room.fields.insert(ephemeral_id, field);
        Ok(())
    }

    /// Returns true when a field binding existed and was cleared.
    pub async fn clear_field(&self, name: &str, ephemeral_id: Uuid) -> Result<bool, RoomError> {
        let mut guard = self.rooms.write().await;
        let room = guard.get_mut(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        Ok(room.fields.remove(&ephemeral_id).is_some())
    }

    pub async fn fields(&self, name: &str) -> Result<Vec<(Uuid, ActiveField)>, RoomError> {
        let guard = self.rooms.read().await;
        let room = guard.get(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        Ok(room.fields.iter().map(|(id, field)| (*id, field.clone())).collect())
    }

    /// Apply an incoming binary Yjs update to the room's shared document.
    ///
    /// Takes the registry write lock so document writes serialize; the
    /// yrs write transaction is not re-entrant.
    pub async fn apply_update(&self, name: &str, data: &[u8]) -> Result<(), RoomError> {
        let guard = self.rooms.write().await;
        let room = guard.get(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;

        let update = Update::decode_v1(data).map_err(|error| RoomError::InvalidUpdate {
            room: name.to_string(),
            detail: error.to_string(),
        })?;
        room.doc.transact_mut().apply_update(update).map_err(|error| {
            RoomError::InvalidUpdate { room: name.to_string(), detail: error.to_string() }
        })?;
        Ok(())
    }

    /// Field names currently present in the room's document map.
    pub async fn document_fields(&self, name: &str, key: &RoomKey) -> Result<Vec<String>, RoomError> {
        let guard = self.rooms.read().await;
        let room = guard.get(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;
        let map = room.doc.get_or_insert_map(key.to_string());
        let txn = room.doc.transact();
        Ok(map.keys(&txn).map(ToOwned::to_owned).collect())
    }

    /// Encode a point-in-time state update containing only the permitted
    /// fields of the room's document map.
    ///
    /// The sanitized state is built on a fresh document so the recipient
    /// never observes values it is not allowed to read, not even as
    /// tombstones.
    pub async fn sanitized_state(
        &self,
        name: &str,
        key: &RoomKey,
        permitted: &[String],
    ) -> Result<Vec<u8>, RoomError> {
        let guard = self.rooms.read().await;
        let room = guard.get(name).ok_or_else(|| RoomError::NotFound(name.to_string()))?;

        let source_map = room.doc.get_or_insert_map(key.to_string());
        let source_txn = room.doc.transact();

        let sanitized = Doc::new();
        let target_map = sanitized.get_or_insert_map(key.to_string());
        {
            let mut txn = sanitized.transact_mut();
            for field in permitted {
                if let Some(value) = source_map.get(&source_txn, field) {
                    target_map.insert(&mut txn, field.as_str(), value.to_json(&source_txn));
                }
            }
        }

        let txn = sanitized.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }
}
