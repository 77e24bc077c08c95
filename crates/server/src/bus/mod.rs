// Cross-replica awareness fan-out.
//
// Presence changes are best-effort broadcast over PostgreSQL
// LISTEN/NOTIFY so horizontally scaled replicas converge on who is in
// which room. There is no delivery guarantee and no reconciliation;
// dropped frames mean temporarily stale remote presence, nothing more.
// Every frame carries the publishing replica's origin id so a replica
// can skip its own notifications.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

const LOCAL_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusAction {
    Join,
    Leave,
    FieldFocus,
    FieldBlur,
}

/// Payload of a cross-replica presence notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusEvent {
    AwarenessUser {
        room: String,
        action: BusAction,
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// A bus event plus the replica that published it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusFrame {
    pub origin: Uuid,
    #[serde(flatten)]
    pub event: BusEvent,
}

#[derive(Clone)]
enum Backend {
    Postgres { pool: PgPool, channel: String, local: broadcast::Sender<BusFrame> },
    Local { tx: broadcast::Sender<BusFrame> },
    Disabled,
}

/// Best-effort presence broadcast bus.
#[derive(Clone)]
pub struct CollabBus {
    origin: Uuid,
    backend: Backend,
}

impl CollabBus {
    pub fn disabled() -> Self {
        Self { origin: Uuid::new_v4(), backend: Backend::Disabled }
    }

    pub fn postgres(pool: PgPool, channel: String) -> Self {
        let (local, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { origin: Uuid::new_v4(), backend: Backend::Postgres { pool, channel, local } }
    }

    /// Two buses wired back-to-back in process, with distinct origins.
    /// Frames published on one arrive on both subscriptions.
    pub fn local_pair() -> (Self, Self) {
        let (tx, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        (
            Self { origin: Uuid::new_v4(), backend: Backend::Local { tx: tx.clone() } },
            Self { origin: Uuid::new_v4(), backend: Backend::Local { tx } },
        )
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, Backend::Disabled)
    }

    /// True when the frame was published by this replica.
    pub fn is_own(&self, frame: &BusFrame) -> bool {
        frame.origin == self.origin
    }

    /// Publish an event. Failures are logged and swallowed; the bus is
    /// best-effort by contract.
    pub async fn publish(&self, event: BusEvent) {
        let frame = BusFrame { origin: self.origin, event };
        match &self.backend {
            Backend::Postgres { pool, channel, .. } => {
                if let Err(error) = notify(pool, channel, &frame).await {
                    warn!(%error, "failed to publish presence event on bus");
                }
            }
            Backend::Local { tx } => {
                let _ = tx.send(frame);
            }
            Backend::Disabled => {}
        }
    }

    /// Subscribe to frames from other replicas (own frames included;
    /// filter with [`is_own`]).
    ///
    /// [`is_own`]: CollabBus::is_own
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BusFrame>> {
        match &self.backend {
            Backend::Postgres { local, .. } => Some(local.subscribe()),
            Backend::Local { tx } => Some(tx.subscribe()),
            Backend::Disabled => None,
        }
    }

    /// Spawn the LISTEN loop forwarding PostgreSQL notifications into
    /// the local subscription channel. No-op for non-Postgres backends.
    pub fn spawn_listener(&self) {
        let Backend::Postgres { pool, channel, local } = &self.backend else {
            return;
        };
        let pool = pool.clone();
        let channel = channel.clone();
        let local = local.clone();

        tokio::spawn(async move {
            if let Err(error) = listen_loop(pool, &channel, local).await {
                warn!(%error, "presence bus listener terminated");
            }
        });
    }
}

async fn notify(pool: &PgPool, channel: &str, frame: &BusFrame) -> anyhow::Result<()> {
    let payload = serde_json::to_string(frame).context("failed to serialize bus frame")?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(pool)
        .await
        .context("pg_notify failed")?;
    Ok(())
}

async fn listen_loop(
    pool: PgPool,
    channel: &str,
    local: broadcast::Sender<BusFrame>,
) -> anyhow::Result<()> {
    let mut listener =
        PgListener::connect_with(&pool).await.context("failed to open bus listener")?;
    listener.listen(channel).await.context("failed to LISTEN on bus channel")?;

    loop {
        let notification = listener.recv().await.context("bus listener connection lost")?;
        match serde_json::from_str::<BusFrame>(notification.payload()) {
            Ok(frame) => {
                let _ = local.send(frame);
            }
            Err(error) => {
                warn!(%error, "ignoring malformed bus frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_event(room: &str, user_id: Uuid) -> BusEvent {
        BusEvent::AwarenessUser {
            room: room.to_string(),
            action: BusAction::Join,
            user_id,
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn frame_wire_shape_matches_contract() {
        let origin = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let frame = BusFrame { origin, event: join_event("articles:1", user_id) };

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "awareness-user");
        assert_eq!(value["room"], "articles:1");
        assert_eq!(value["action"], "join");
        assert_eq!(value["userId"], user_id.to_string());
        assert_eq!(value["origin"], origin.to_string());

        let parsed: BusFrame = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn local_pair_delivers_across_origins() {
        let (a, b) = CollabBus::local_pair();
        assert_ne!(a.origin(), b.origin());

        let mut sub = b.subscribe().expect("local bus should be subscribable");
        a.publish(join_event("articles:1", Uuid::new_v4())).await;

        let frame = sub.recv().await.unwrap();
        assert!(a.is_own(&frame));
        assert!(!b.is_own(&frame));
    }

    #[tokio::test]
    async fn disabled_bus_swallows_publishes() {
        let bus = CollabBus::disabled();
        assert!(!bus.is_enabled());
        assert!(bus.subscribe().is_none());
        bus.publish(join_event("articles:1", Uuid::new_v4())).await;
    }
}
