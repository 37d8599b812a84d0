//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::PresenceStatus;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Identity
    JoinUserChannel {
        token: String,
    },

    // Rooms
    JoinProject {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    LeaveProject {
        #[serde(rename = "projectId")]
        project_id: String,
    },

    // Keep-alive / presence
    PresencePing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<PresenceStatus>,
    },

    // Chat
    ChatMessage {
        message: String,
    },
}

impl ClientMessage {
    /// Wire name of this message, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinUserChannel { .. } => "join_user_channel",
            ClientMessage::JoinProject { .. } => "join_project",
            ClientMessage::LeaveProject { .. } => "leave_project",
            ClientMessage::PresencePing { .. } => "presence_ping",
            ClientMessage::ChatMessage { .. } => "chat_message",
        }
    }
}
