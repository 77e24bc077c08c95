// Per-connection awareness (room membership and field locks).
//
// Keyed by ephemeral connection id. Timestamps refresh on every
// awareness mutation so the idle sweeper only releases locks that have
// genuinely gone stale. Time is injected into `sweep` to keep the
// policy testable without a running clock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldsync_common::types::ActiveField;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result of an awareness upsert, so callers can tell a fresh
/// connection from a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this connection was seen.
    Inserted,
    /// Known connection entered a new room.
    Updated,
    /// Known connection, already in the room.
    Unchanged,
}

/// A field lock released by the idle sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptLock {
    pub connection_id: Uuid,
    pub room: String,
}

#[derive(Debug, Clone)]
struct AwarenessEntry {
    rooms: HashSet<String>,
    active_field: Option<(String, ActiveField)>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AwarenessStore {
    entries: Arc<RwLock<HashMap<Uuid, AwarenessEntry>>>,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a connection is present in a room.
    ///
    /// An unchanged upsert is a true no-op: the activity timestamp is
    /// only refreshed when the entry actually changes, so repeated
    /// identical upserts cannot keep a stale lock alive.
    pub async fn upsert(&self, connection_id: Uuid, room: &str) -> UpsertOutcome {
        let mut guard = self.entries.write().await;
        match guard.get_mut(&connection_id) {
            Some(entry) => {
                if entry.rooms.insert(room.to_string()) {
                    entry.last_updated = Utc::now();
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
            None => {
                let mut rooms = HashSet::new();
                rooms.insert(room.to_string());
                guard.insert(
                    connection_id,
                    AwarenessEntry { rooms, active_field: None, last_updated: Utc::now() },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Rooms the connection is currently present in.
    pub async fn rooms(&self, connection_id: Uuid) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(&connection_id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a field lock for the connection. A connection holds at
    /// most one lock; taking a new one replaces the old. The replaced
    /// lock is returned so the caller can release its room-side binding.
    pub async fn set_active_field(
        &self,
        connection_id: Uuid,
        room: &str,
        field: ActiveField,
    ) -> Option<(String, ActiveField)> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(&connection_id)?;
        entry.last_updated = Utc::now();
        entry.active_field.replace((room.to_string(), field))
    }

    /// Release the connection's field lock, returning the room it was
    /// held in.
    pub async fn clear_active_field(&self, connection_id: Uuid) -> Option<String> {
        let mut guard = self.entries.write().await;
        let entry = guard.get_mut(&connection_id)?;
        entry.last_updated = Utc::now();
        entry.active_field.take().map(|(room, _)| room)
    }

    pub async fn active_field(&self, connection_id: Uuid) -> Option<(String, ActiveField)> {
        self.entries.read().await.get(&connection_id).and_then(|e| e.active_field.clone())
    }

    /// Refresh the activity timestamp (document updates count as activity).
    pub async fn touch(&self, connection_id: Uuid) {
        if let Some(entry) = self.entries.write().await.get_mut(&connection_id) {
            entry.last_updated = Utc::now();
        }
    }

    /// Remove one room from the connection's membership; the whole entry
    /// goes away with the last room.
    pub async fn remove_room(&self, connection_id: Uuid, room: &str) {
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get_mut(&connection_id) {
            entry.rooms.remove(room);
            if entry.active_field.as_ref().is_some_and(|(r, _)| r == room) {
                entry.active_field = None;
            }
            if entry.rooms.is_empty() {
                guard.remove(&connection_id);
            }
        }
    }

    pub async fn remove(&self, connection_id: Uuid) {
        self.entries.write().await.remove(&connection_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn last_updated(&self, connection_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&connection_id).map(|entry| entry.last_updated)
    }

    #[cfg(test)]
    pub(crate) async fn backdate_for_tests(&self, connection_id: Uuid, to: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(&connection_id) {
            entry.last_updated = to;
        }
    }

    /// Release field locks idle for longer than `idle_after`.
    ///
    /// Returns the released locks so the caller can broadcast blurs.
    /// Presence itself is untouched; only the lock expires.
    pub async fn sweep(&self, now: DateTime<Utc>, idle_after: Duration) -> Vec<SweptLock> {
        let idle_after = chrono::Duration::from_std(idle_after).unwrap_or(chrono::Duration::MAX);
        let mut swept = Vec::new();

        let mut guard = self.entries.write().await;
        for (connection_id, entry) in guard.iter_mut() {
            if entry.active_field.is_none() {
                continue;
            }
            if now.signed_duration_since(entry.last_updated) > idle_after {
                if let Some((room, _)) = entry.active_field.take() {
                    swept.push(SweptLock { connection_id: *connection_id, room });
                }
            }
        }

        swept
    }
}
