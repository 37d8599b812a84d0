//! Event dispatcher: the single entry point for inbound events.
//!
//! Frames from the duplex channel and batches from the polling fallback both
//! land here. Entity events go to the collection store, presence goes to the
//! presence sink, and notices go to the notification sink.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use sitesync_protocol::{EntityId, EventKind, NoticeLevel, ServerMessage};
use tracing::{debug, info, warn};

use crate::collections::CollectionStore;
use crate::reconcile::{Applied, EntityEvent};

/// Entity types whose changes raise a user-visible notice.
pub const NOTEWORTHY_ENTITY_TYPES: &[&str] = &["safety_incidents", "safety_hazards"];

/// A user-visible notice handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    /// Full list of users currently connected (`users_update`).
    Roster(Vec<Value>),
    /// Company-wide presence change (`company_presence`).
    Company(Map<String, Value>),
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

pub trait PresenceSink: Send + Sync {
    fn presence(&self, update: PresenceUpdate);
}

/// Sink that only writes to the log. Used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: Notice) {
        info!(
            component = "dispatcher",
            event = "notice.raised",
            level = ?notice.level,
            title = %notice.title,
            message = %notice.message,
            link = notice.link.as_deref().unwrap_or(""),
        );
    }
}

impl PresenceSink for LogSink {
    fn presence(&self, update: PresenceUpdate) {
        match update {
            PresenceUpdate::Roster(users) => info!(
                component = "dispatcher",
                event = "presence.roster",
                users = users.len(),
            ),
            PresenceUpdate::Company(fields) => info!(
                component = "dispatcher",
                event = "presence.company",
                fields = %serde_json::Value::Object(fields),
            ),
        }
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Entity {
        entity_type: String,
        applied: Applied,
    },
    UnknownEntityType(String),
    Presence,
    Notice,
    Ignored,
}

pub struct EventDispatcher {
    store: Arc<CollectionStore>,
    notices: Arc<dyn NotificationSink>,
    presence: Arc<dyn PresenceSink>,
    noteworthy: HashSet<String>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<CollectionStore>,
        notices: Arc<dyn NotificationSink>,
        presence: Arc<dyn PresenceSink>,
    ) -> Self {
        Self {
            store,
            notices,
            presence,
            noteworthy: NOTEWORTHY_ENTITY_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }

    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    /// Parse and dispatch a raw text frame. Malformed frames are logged and
    /// dropped.
    pub fn dispatch_frame(&self, text: &str) -> Option<Dispatched> {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => Some(self.dispatch(message)),
            Err(e) => {
                warn!(
                    component = "dispatcher",
                    event = "dispatch.parse_failed",
                    error = %e,
                    bytes = text.len(),
                    "Dropping malformed frame"
                );
                None
            }
        }
    }

    pub fn dispatch(&self, message: ServerMessage) -> Dispatched {
        match message.kind() {
            Some(EventKind::EntityCreate | EventKind::EntityUpdate | EventKind::EntityDelete) => {
                match EntityEvent::from_message(message) {
                    Some((entity_type, event)) => self.dispatch_entity(entity_type, event),
                    None => Dispatched::Ignored,
                }
            }
            Some(EventKind::Presence) => self.dispatch_presence(message),
            Some(EventKind::SystemNotice) => self.dispatch_notice(message),
            None => {
                debug!(
                    component = "dispatcher",
                    event = "dispatch.ignored",
                    message_type = message.type_name(),
                    "Ignoring unrecognised frame type"
                );
                Dispatched::Ignored
            }
        }
    }

    fn dispatch_presence(&self, message: ServerMessage) -> Dispatched {
        let update = match message {
            ServerMessage::UsersUpdate { users } => PresenceUpdate::Roster(users),
            ServerMessage::CompanyPresence { fields } => PresenceUpdate::Company(fields),
            _ => return Dispatched::Ignored,
        };
        self.presence.presence(update);
        Dispatched::Presence
    }

    fn dispatch_notice(&self, message: ServerMessage) -> Dispatched {
        let notice = match message {
            ServerMessage::Notification { payload } => Notice {
                level: payload.level,
                title: payload.title.unwrap_or_else(|| "Notification".to_string()),
                message: payload.message.unwrap_or_default(),
                link: payload.link,
            },
            ServerMessage::SafetyAlert { fields } => {
                notice_from_fields(NoticeLevel::Error, "Safety alert", &fields)
            }
            ServerMessage::ProjectUpdated { fields } => {
                notice_from_fields(NoticeLevel::Update, "Project updated", &fields)
            }
            ServerMessage::TaskUpdated { fields } => {
                notice_from_fields(NoticeLevel::Update, "Task updated", &fields)
            }
            ServerMessage::RbacUpdated { fields } => {
                notice_from_fields(NoticeLevel::Update, "Permissions updated", &fields)
            }
            _ => return Dispatched::Ignored,
        };
        self.notices.notify(notice);
        Dispatched::Notice
    }

    fn dispatch_entity(&self, entity_type: String, event: EntityEvent) -> Dispatched {
        let id = event.id();
        let verb = match &event {
            EntityEvent::Create(_) => "created",
            EntityEvent::Update(_) => "updated",
            EntityEvent::Delete(_) => "removed",
        };

        let Some(applied) = self.store.apply(&entity_type, event) else {
            warn!(
                component = "dispatcher",
                event = "dispatch.unknown_entity_type",
                entity_type = %entity_type,
                "Dropping event for unregistered entity type"
            );
            return Dispatched::UnknownEntityType(entity_type);
        };

        if applied.changed() && self.noteworthy.contains(&entity_type) {
            self.notices.notify(Notice {
                level: if matches!(applied, Applied::Removed) {
                    NoticeLevel::Info
                } else {
                    NoticeLevel::Warning
                },
                title: humanize(&entity_type),
                message: match id {
                    Some(id) => format!("Record {id} {verb}"),
                    None => format!("Record {verb}"),
                },
                link: None,
            });
        }

        Dispatched::Entity {
            entity_type,
            applied,
        }
    }
}

fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn notice_from_fields(level: NoticeLevel, fallback_title: &str, fields: &Map<String, Value>) -> Notice {
    let subject = fields
        .get("id")
        .and_then(EntityId::from_value)
        .map(|id| format!("Record {id} changed"));
    Notice {
        level,
        title: text_field(fields, &["title"]).unwrap_or_else(|| fallback_title.to_string()),
        message: text_field(fields, &["message", "description", "name"])
            .or(subject)
            .unwrap_or_default(),
        link: text_field(fields, &["link"]),
    }
}

/// `safety_incidents` -> `Safety incidents`
fn humanize(entity_type: &str) -> String {
    let spaced = entity_type.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
