// Account -> ephemeral presence identity.
//
// Presence messages never expose account ids to other clients; each
// account is represented by an ephemeral id plus a presence color that
// stays stable across rooms for as long as the account has at least one
// live connection. The entry must be invalidated when the account's
// last connection departs so a reconnect gets a fresh identity.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Presence color palette. Mirrors the editor's cursor colors.
const PRESENCE_COLORS: &[&str] = &[
    "#6644ff", "#2ecda7", "#ff9800", "#e35169", "#3399ff", "#aa66cc", "#00bcd4", "#8bc34a",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    pub ephemeral_id: Uuid,
    pub color: String,
}

/// Cache of account id -> ephemeral presence identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    entries: Arc<RwLock<HashMap<Uuid, CachedIdentity>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached identity for an account, minting one on first use.
    pub async fn resolve(&self, user_id: Uuid) -> CachedIdentity {
        let mut guard = self.entries.write().await;
        guard
            .entry(user_id)
            .or_insert_with(|| CachedIdentity {
                ephemeral_id: Uuid::new_v4(),
                color: pick_color(),
            })
            .clone()
    }

    pub async fn peek(&self, user_id: Uuid) -> Option<CachedIdentity> {
        self.entries.read().await.get(&user_id).cloned()
    }

    /// Drop the cached identity. Returns true when an entry existed.
    pub async fn invalidate(&self, user_id: Uuid) -> bool {
        self.entries.write().await.remove(&user_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn pick_color() -> String {
    PRESENCE_COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("#6644ff")
        .to_string()
}
