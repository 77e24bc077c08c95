// Core domain types shared across all fieldsync crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies a collaboration room: one record of one collection.
///
/// Wire form is `collection:primary_key`, e.g. `articles:1`. The
/// primary key may itself contain `:` (composite keys), so parsing
/// splits on the first separator only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub collection: String,
    pub primary_key: String,
}

/// Error returned when a room identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room identifier '{0}': expected collection:primary_key")]
pub struct InvalidRoomKey(pub String);

impl FromStr for RoomKey {
    type Err = InvalidRoomKey;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (collection, primary_key) =
            raw.split_once(':').ok_or_else(|| InvalidRoomKey(raw.to_string()))?;
        if collection.is_empty() || primary_key.is_empty() {
            return Err(InvalidRoomKey(raw.to_string()));
        }
        Ok(Self { collection: collection.to_string(), primary_key: primary_key.to_string() })
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.primary_key)
    }
}

/// The authorization context derived from a verified session token.
///
/// Re-derived per request by permission checks; never cached inside
/// presence entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Accountability {
    /// Stable account id of the authenticated user.
    pub user_id: Uuid,
    /// Role key used for permission lookups.
    pub role: String,
    /// Admin accountability bypasses field-level permission checks.
    #[serde(default)]
    pub admin: bool,
}

/// A user as presented to other room members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentUser {
    /// Ephemeral per-connection identifier (not the account id).
    pub connection_id: Uuid,
    /// Stable account id.
    pub user_id: Uuid,
    /// Hex display color assigned at join, e.g. "#6644ff".
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A field a user is currently focused on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveField {
    pub collection: String,
    pub field: String,
    pub primary_key: String,
}

/// Profile data attached to sync payloads, fetched per account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_key_parses_collection_and_primary_key() {
        let key: RoomKey = "articles:1".parse().unwrap();
        assert_eq!(key.collection, "articles");
        assert_eq!(key.primary_key, "1");
        assert_eq!(key.to_string(), "articles:1");
    }

    #[test]
    fn room_key_splits_on_first_separator_only() {
        let key: RoomKey = "events:2026:08:25".parse().unwrap();
        assert_eq!(key.collection, "events");
        assert_eq!(key.primary_key, "2026:08:25");
    }

    #[test]
    fn room_key_rejects_missing_separator() {
        assert!("articles".parse::<RoomKey>().is_err());
    }

    #[test]
    fn room_key_rejects_empty_parts() {
        assert!(":1".parse::<RoomKey>().is_err());
        assert!("articles:".parse::<RoomKey>().is_err());
    }
}
