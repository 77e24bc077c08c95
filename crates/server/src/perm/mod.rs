// Field-level read permissions and user profiles.
//
// Both stores come in a Postgres flavor for production, an in-memory
// flavor for tests, and a no-database flavor for standalone development
// (permissive access, anonymous profiles). Permission checks are
// batched: one store call resolves every candidate field of a
// collection at once.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use fieldsync_common::types::{Accountability, UserProfile};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

const WILDCARD: &str = "*";

/// Read-permission lookup, keyed by role and collection.
#[derive(Clone)]
pub enum AccessStore {
    Postgres(PgPool),
    /// All fields readable by everyone. Used when no database is
    /// configured.
    Permissive,
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(Arc<RwLock<HashMap<(String, String), Vec<String>>>>),
}

impl AccessStore {
    /// Filter `candidates` down to the fields the caller may read in
    /// `collection`, preserving input order.
    ///
    /// Admins and a stored `*` grant pass everything through. A role
    /// with no grant for the collection reads nothing.
    pub async fn readable_fields(
        &self,
        accountability: &Accountability,
        collection: &str,
        candidates: &[String],
    ) -> anyhow::Result<Vec<String>> {
        if accountability.admin {
            return Ok(candidates.to_vec());
        }

        let granted = self.granted_fields(&accountability.role, collection).await?;
        let Some(granted) = granted else {
            return Ok(Vec::new());
        };

        if granted.iter().any(|field| field == WILDCARD) {
            return Ok(candidates.to_vec());
        }

        Ok(candidates.iter().filter(|field| granted.contains(field)).cloned().collect())
    }

    /// Single-field convenience over [`readable_fields`].
    ///
    /// [`readable_fields`]: AccessStore::readable_fields
    pub async fn can_read_field(
        &self,
        accountability: &Accountability,
        collection: &str,
        field: &str,
    ) -> anyhow::Result<bool> {
        let candidates = [field.to_string()];
        let readable = self.readable_fields(accountability, collection, &candidates).await?;
        Ok(!readable.is_empty())
    }

    async fn granted_fields(
        &self,
        role: &str,
        collection: &str,
    ) -> anyhow::Result<Option<Vec<String>>> {
        match self {
            Self::Postgres(pool) => {
                let fields = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT fields
                    FROM collection_permissions
                    WHERE role = $1
                      AND collection = $2
                      AND action = 'read'
                    "#,
                )
                .bind(role)
                .bind(collection)
                .fetch_optional(pool)
                .await
                .context("failed to query collection read permissions")?;

                Ok(fields.map(|csv| {
                    csv.split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(ToOwned::to_owned)
                        .collect()
                }))
            }
            Self::Permissive => Ok(Some(vec![WILDCARD.to_string()])),
            Self::Memory(store) => {
                Ok(store.read().await.get(&(role.to_string(), collection.to_string())).cloned())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    #[cfg(test)]
    pub(crate) async fn grant_for_tests(&self, role: &str, collection: &str, fields: &[&str]) {
        if let Self::Memory(store) = self {
            store.write().await.insert(
                (role.to_string(), collection.to_string()),
                fields.iter().map(|f| f.to_string()).collect(),
            );
        }
    }
}

/// Display-name and avatar lookup for presence payloads.
#[derive(Clone)]
pub enum ProfileStore {
    Postgres(PgPool),
    /// No database configured; every user is anonymous.
    Disabled,
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(Arc<RwLock<HashMap<Uuid, UserProfile>>>),
}

impl ProfileStore {
    pub async fn profile(&self, user_id: Uuid) -> anyhow::Result<Option<UserProfile>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (Option<String>, Option<String>)>(
                    r#"
                    SELECT display_name, avatar_url
                    FROM user_profiles
                    WHERE user_id = $1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to query user profile")?;

                Ok(row.map(|(display_name, avatar)| UserProfile { display_name, avatar }))
            }
            Self::Disabled => Ok(None),
            Self::Memory(store) => Ok(store.read().await.get(&user_id).cloned()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_tests(&self, user_id: Uuid, profile: UserProfile) {
        if let Self::Memory(store) = self {
            store.write().await.insert(user_id, profile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> Accountability {
        Accountability { user_id: Uuid::new_v4(), role: "editor".to_string(), admin: false }
    }

    fn admin() -> Accountability {
        Accountability { user_id: Uuid::new_v4(), role: "admin".to_string(), admin: true }
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn admin_reads_everything() {
        let store = AccessStore::for_tests();
        let readable = store
            .readable_fields(&admin(), "articles", &fields(&["title", "secret"]))
            .await
            .unwrap();
        assert_eq!(readable, fields(&["title", "secret"]));
    }

    #[tokio::test]
    async fn role_without_grant_reads_nothing() {
        let store = AccessStore::for_tests();
        let readable =
            store.readable_fields(&editor(), "articles", &fields(&["title"])).await.unwrap();
        assert!(readable.is_empty());
    }

    #[tokio::test]
    async fn grant_filters_candidates_preserving_order() {
        let store = AccessStore::for_tests();
        store.grant_for_tests("editor", "articles", &["title", "body"]).await;

        let readable = store
            .readable_fields(&editor(), "articles", &fields(&["secret", "body", "title"]))
            .await
            .unwrap();
        assert_eq!(readable, fields(&["body", "title"]));
    }

    #[tokio::test]
    async fn wildcard_grant_passes_everything() {
        let store = AccessStore::for_tests();
        store.grant_for_tests("editor", "articles", &["*"]).await;

        let readable = store
            .readable_fields(&editor(), "articles", &fields(&["anything", "at_all"]))
            .await
            .unwrap();
        assert_eq!(readable, fields(&["anything", "at_all"]));
    }

    #[tokio::test]
    async fn grants_are_scoped_per_collection() {
        let store = AccessStore::for_tests();
        store.grant_for_tests("editor", "articles", &["title"]).await;

        assert!(store.can_read_field(&editor(), "articles", "title").await.unwrap());
        assert!(!store.can_read_field(&editor(), "pages", "title").await.unwrap());
    }

    #[tokio::test]
    async fn permissive_store_allows_all() {
        let store = AccessStore::Permissive;
        assert!(store.can_read_field(&editor(), "articles", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn disabled_profiles_are_anonymous() {
        let store = ProfileStore::Disabled;
        assert!(store.profile(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_profiles_round_trip() {
        let store = ProfileStore::for_tests();
        let user = Uuid::new_v4();
        store
            .insert_for_tests(
                user,
                UserProfile { display_name: Some("Ada".into()), avatar: None },
            )
            .await;

        let profile = store.profile(user).await.unwrap().expect("profile should exist");
        assert_eq!(profile.display_name.as_deref(), Some("Ada"));
    }
}
