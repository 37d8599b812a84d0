//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Entity mutations
    EntityCreate {
        #[serde(rename = "entityType")]
        entity_type: String,
        data: Entity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    EntityUpdate {
        #[serde(rename = "entityType")]
        entity_type: String,
        data: Entity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    EntityDelete {
        #[serde(rename = "entityType")]
        entity_type: String,
        id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },

    // Presence
    CompanyPresence {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    UsersUpdate {
        #[serde(default)]
        users: Vec<Value>,
    },

    // Notices
    Notification {
        #[serde(default)]
        payload: NotificationPayload,
    },
    SafetyAlert {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    ProjectUpdated {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    TaskUpdated {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    RbacUpdated {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },

    /// Any frame type this client does not know about yet.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Event classification, `None` for frames this client ignores.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            ServerMessage::EntityCreate { .. } => Some(EventKind::EntityCreate),
            ServerMessage::EntityUpdate { .. } => Some(EventKind::EntityUpdate),
            ServerMessage::EntityDelete { .. } => Some(EventKind::EntityDelete),
            ServerMessage::CompanyPresence { .. } | ServerMessage::UsersUpdate { .. } => {
                Some(EventKind::Presence)
            }
            ServerMessage::Notification { .. }
            | ServerMessage::SafetyAlert { .. }
            | ServerMessage::ProjectUpdated { .. }
            | ServerMessage::TaskUpdated { .. }
            | ServerMessage::RbacUpdated { .. } => Some(EventKind::SystemNotice),
            ServerMessage::Unknown => None,
        }
    }

    /// Wire name of this message, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::EntityCreate { .. } => "entity_create",
            ServerMessage::EntityUpdate { .. } => "entity_update",
            ServerMessage::EntityDelete { .. } => "entity_delete",
            ServerMessage::CompanyPresence { .. } => "company_presence",
            ServerMessage::UsersUpdate { .. } => "users_update",
            ServerMessage::Notification { .. } => "notification",
            ServerMessage::SafetyAlert { .. } => "safety_alert",
            ServerMessage::ProjectUpdated { .. } => "project_updated",
            ServerMessage::TaskUpdated { .. } => "task_updated",
            ServerMessage::RbacUpdated { .. } => "rbac_updated",
            ServerMessage::Unknown => "unknown",
        }
    }
}

/// Response body of the polling endpoint.
///
/// Items stay raw so one malformed update cannot spoil the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatesBatch {
    #[serde(default)]
    pub updates: Vec<Value>,
}
