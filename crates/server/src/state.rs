// Shared server state.
//
// Every service is constructed here and passed down explicitly; nothing
// in the crate reaches for a global.

use std::sync::Arc;

use anyhow::Context;

use crate::auth::SessionTokenService;
use crate::bus::CollabBus;
use crate::config::ServerConfig;
use crate::db::{check_pool_health, create_pg_pool, PoolConfig};
use crate::perm::{AccessStore, ProfileStore};
use crate::presence::{AwarenessStore, IdentityCache, TimerRegistry};
use crate::rooms::RoomRegistry;
use crate::ws::connections::ConnectionStore;

#[derive(Clone)]
pub struct CollabState {
    pub config: Arc<ServerConfig>,
    pub tokens: Arc<SessionTokenService>,
    pub rooms: RoomRegistry,
    pub identity: IdentityCache,
    pub awareness: AwarenessStore,
    pub timers: TimerRegistry,
    pub connections: ConnectionStore,
    pub access: AccessStore,
    pub profiles: ProfileStore,
    pub bus: CollabBus,
}

impl CollabState {
    /// Wire up all services from configuration, connecting to PostgreSQL
    /// when a database URL is configured.
    pub async fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let tokens = Arc::new(
            SessionTokenService::new(&config.secret)
                .context("failed to initialize session token service")?,
        );

        let (access, profiles, bus) = match &config.database_url {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, PoolConfig::from_env())
                    .await
                    .context("failed to initialize PostgreSQL pool")?;
                check_pool_health(&pool).await?;

                let bus = match &config.bus_channel {
                    Some(channel) => CollabBus::postgres(pool.clone(), channel.clone()),
                    None => CollabBus::disabled(),
                };

                (AccessStore::Postgres(pool.clone()), ProfileStore::Postgres(pool), bus)
            }
            None => (AccessStore::Permissive, ProfileStore::Disabled, CollabBus::disabled()),
        };

        Ok(Self {
            config: Arc::new(config),
            tokens,
            rooms: RoomRegistry::new(),
            identity: IdentityCache::new(),
            awareness: AwarenessStore::new(),
            timers: TimerRegistry::new(),
            connections: ConnectionStore::new(),
            access,
            profiles,
            bus,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(access: AccessStore, profiles: ProfileStore, bus: CollabBus) -> Self {
        // Fixed defaults; unit tests must not pick up ambient FIELDSYNC_*
        // variables.
        let config =
            ServerConfig::from_env_fn(|_| Err::<String, _>(std::env::VarError::NotPresent));
        let tokens = Arc::new(
            SessionTokenService::new(&config.secret)
                .expect("dev secret should initialize token service"),
        );

        Self {
            config: Arc::new(config),
            tokens,
            rooms: RoomRegistry::new(),
            identity: IdentityCache::new(),
            awareness: AwarenessStore::new(),
            timers: TimerRegistry::new(),
            connections: ConnectionStore::new(),
            access,
            profiles,
            bus,
        }
    }
}
