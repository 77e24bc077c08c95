// WebSocket message types for the fieldsync-collab.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActiveField, PresentUser};

/// Identifier for the current revision of the collaboration wire
/// format, advertised by the server's status endpoint.
pub const CURRENT_PROTOCOL_VERSION: &str = "fieldsync-collab.v1";

/// All message types in the fieldsync-collab.v1 WebSocket protocol.
///
/// Document payloads are binary Yjs v1 updates, base64-encoded inside
/// the JSON control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollabMessage {
    /// Client -> Server: join a collaboration room.
    Join { room: String },

    /// Client -> Server: leave a room.
    Leave { room: String },

    /// Bidirectional: a Yjs document update for a room.
    Update { room: String, payload_b64: String },

    /// Client -> Server: the sender is now editing a field. The field
    /// name is resolved against the collection and record the room key
    /// encodes.
    SetActiveField { room: String, field: String },

    /// Client -> Server: the sender stopped editing.
    RemoveActiveField { room: String },

    /// Server -> Client: point-in-time room snapshot sent after a join.
    ///
    /// `state_b64` contains only the fields the recipient may read;
    /// `users` is deduplicated by account id.
    Sync {
        room: String,
        state_b64: String,
        users: Vec<PresentUser>,
        active_fields: Vec<FieldBinding>,
    },

    /// Server -> Client: another user joined the room.
    UserJoined { room: String, user: PresentUser },

    /// Server -> Client: a user left the room.
    UserLeft { room: String, connection_id: Uuid },

    /// Server -> Client: a user focused a field.
    FieldFocus { room: String, binding: FieldBinding },

    /// Server -> Client: a user released a field (blur or idle expiry).
    FieldBlur { room: String, connection_id: Uuid },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
}

/// An active-field entry as carried in sync and focus messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldBinding {
    pub connection_id: Uuid,
    #[serde(flatten)]
    pub field: ActiveField,
}
