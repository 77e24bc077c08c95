// Live socket bookkeeping.
//
// One record per WebSocket, keyed by a per-socket id (distinct from the
// ephemeral presence id, which is shared by all sockets of an account).
// Outbound messages go through an unbounded channel owned by the
// socket's write loop; a closed receiver just means the socket is gone
// and the message is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fieldsync_common::protocol::ws::CollabMessage;
use fieldsync_common::types::Accountability;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug)]
struct ConnectionRecord {
    accountability: Accountability,
    outbound: mpsc::UnboundedSender<CollabMessage>,
    rooms: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStore {
    inner: Arc<RwLock<HashMap<Uuid, ConnectionRecord>>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        socket_id: Uuid,
        accountability: Accountability,
        outbound: mpsc::UnboundedSender<CollabMessage>,
    ) {
        self.inner.write().await.insert(
            socket_id,
            ConnectionRecord { accountability, outbound, rooms: HashSet::new() },
        );
    }

    /// Drop the record, returning the rooms it was still tracking.
    pub async fn unregister(&self, socket_id: Uuid) -> Vec<String> {
        self.inner
            .write()
            .await
            .remove(&socket_id)
            .map(|record| record.rooms.into_iter().collect())
            .unwrap_or_default()
    }

    pub async fn track_room(&self, socket_id: Uuid, room: &str) {
        if let Some(record) = self.inner.write().await.get_mut(&socket_id) {
            record.rooms.insert(room.to_string());
        }
    }

    pub async fn untrack_room(&self, socket_id: Uuid, room: &str) {
        if let Some(record) = self.inner.write().await.get_mut(&socket_id) {
            record.rooms.remove(room);
        }
    }

    pub async fn is_in_room(&self, socket_id: Uuid, room: &str) -> bool {
        self.inner
            .read()
            .await
            .get(&socket_id)
            .is_some_and(|record| record.rooms.contains(room))
    }

    pub async fn accountability(&self, socket_id: Uuid) -> Option<Accountability> {
        self.inner.read().await.get(&socket_id).map(|record| record.accountability.clone())
    }

    /// Queue a message for one socket. Send failures mean the socket
    /// already closed and are ignored.
    pub async fn send_to(&self, socket_id: Uuid, message: CollabMessage) {
        if let Some(record) = self.inner.read().await.get(&socket_id) {
            let _ = record.outbound.send(message);
        }
    }

    /// Queue a message for every socket in a room, optionally skipping
    /// one. Returns the number of sockets targeted.
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        message: CollabMessage,
        exclude: Option<Uuid>,
    ) -> usize {
        let guard = self.inner.read().await;
        let mut sent = 0;
        for (socket_id, record) in guard.iter() {
            if Some(*socket_id) == exclude || !record.rooms.contains(room) {
                continue;
            }
            let _ = record.outbound.send(message.clone());
            sent += 1;
        }
        sent
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Live sockets belonging to an account, across all rooms.
    pub async fn sockets_for_account(&self, user_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|record| record.accountability.user_id == user_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::protocol::ws::CollabMessage;

    fn editor() -> Accountability {
        Accountability { user_id: Uuid::new_v4(), role: "editor".to_string(), admin: false }
    }

    fn leave(room: &str) -> CollabMessage {
        CollabMessage::Leave { room: room.to_string() }
    }

    #[tokio::test]
    async fn broadcast_reaches_room_members_only() {
        let store = ConnectionStore::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.register(a, editor(), tx_a).await;
        store.register(b, editor(), tx_b).await;
        store.track_room(a, "articles:1").await;
        store.track_room(b, "articles:2").await;

        let sent = store.broadcast_to_room("articles:1", leave("articles:1"), None).await;
        assert_eq!(sent, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_can_exclude_the_sender() {
        let store = ConnectionStore::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.register(a, editor(), tx_a).await;
        store.register(b, editor(), tx_b).await;
        store.track_room(a, "articles:1").await;
        store.track_room(b, "articles:1").await;

        let sent = store.broadcast_to_room("articles:1", leave("articles:1"), Some(a)).await;
        assert_eq!(sent, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_returns_tracked_rooms() {
        let store = ConnectionStore::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let socket = Uuid::new_v4();

        store.register(socket, editor(), tx).await;
        store.track_room(socket, "articles:1").await;
        store.track_room(socket, "pages:2").await;

        let mut rooms = store.unregister(socket).await;
        rooms.sort();
        assert_eq!(rooms, vec!["articles:1".to_string(), "pages:2".to_string()]);
        assert_eq!(store.connection_count().await, 0);
    }

    #[tokio::test]
    async fn counts_sockets_per_account() {
        let store = ConnectionStore::new();
        let account = editor();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        store.register(Uuid::new_v4(), account.clone(), tx_a).await;
        store.register(Uuid::new_v4(), account.clone(), tx_b).await;

        assert_eq!(store.sockets_for_account(account.user_id).await, 2);
        assert_eq!(store.sockets_for_account(Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn send_to_closed_socket_is_ignored() {
        let store = ConnectionStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let socket = Uuid::new_v4();
        store.register(socket, editor(), tx).await;

        store.send_to(socket, leave("articles:1")).await;
    }
}
