//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An entity payload as the API sends it. Only the `id` field is interpreted;
/// everything else is carried through untouched.
pub type Entity = Map<String, Value>;

/// Identity of an entity inside its collection.
///
/// The API mixes text ids (`"t1"`) and integer row ids (`42`); both are
/// normalised to their string form so they compare equal across sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawEntityId", into = "String")]
pub struct EntityId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntityId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl From<RawEntityId> for EntityId {
    fn from(raw: RawEntityId) -> Self {
        match raw {
            RawEntityId::Text(text) => EntityId(text),
            RawEntityId::Signed(n) => EntityId(n.to_string()),
            RawEntityId::Unsigned(n) => EntityId(n.to_string()),
        }
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId(value)
    }
}

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the identity out of a JSON value (`"t1"` or `42`).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) if !text.is_empty() => Some(EntityId(text.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(|v| v.to_string())
                .or_else(|| n.as_u64().map(|v| v.to_string()))
                .map(EntityId),
            _ => None,
        }
    }

    /// Identity of an entity payload, if it carries a usable `id`.
    pub fn of(entity: &Entity) -> Option<Self> {
        entity.get("id").and_then(Self::from_value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EntityCreate,
    EntityUpdate,
    EntityDelete,
    Presence,
    SystemNotice,
}

/// Presence status advertised by a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Warning,
    Error,
    Update,
    #[default]
    #[serde(other)]
    Info,
}

/// Body of a `notification` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type", default)]
    pub level: NoticeLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}
