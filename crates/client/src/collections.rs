//! Session-owned entity collections

use dashmap::DashMap;
use sitesync_protocol::{Entity, EntityId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::reconcile::{apply_entity_event, Applied, EntityEvent};

/// Entity types a session tracks out of the box.
pub const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "tasks",
    "projects",
    "rfis",
    "inventory",
    "daily_logs",
    "safety_incidents",
    "safety_hazards",
    "safety_checklists",
    "equipment",
    "team",
    "documents",
    "punch_items",
    "team_messages",
];

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Who wrote a change into a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Remote,
    Optimistic,
}

/// Published after every mutation that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange {
    Entity {
        entity_type: String,
        id: Option<EntityId>,
        applied: Applied,
        origin: ChangeOrigin,
    },
    Reloaded {
        entity_type: String,
        count: usize,
    },
    Cleared,
}

/// One ordered collection per registered entity type.
///
/// Writers from the dispatcher and the optimistic UI path share the same
/// identity-keyed rule, so the store needs no coordination beyond the
/// per-shard locking of the map.
pub struct CollectionStore {
    collections: DashMap<String, Vec<Entity>>,
    changes: broadcast::Sender<CollectionChange>,
}

impl CollectionStore {
    pub fn new<I, S>(entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let collections = DashMap::new();
        for entity_type in entity_types {
            collections.insert(entity_type.into(), Vec::new());
        }
        Self {
            collections,
            changes,
        }
    }

    pub fn with_default_types() -> Self {
        Self::new(DEFAULT_ENTITY_TYPES.iter().copied())
    }

    /// Start tracking another entity type. Existing contents are kept.
    pub fn register(&self, entity_type: impl Into<String>) {
        self.collections.entry(entity_type.into()).or_default();
    }

    pub fn is_registered(&self, entity_type: &str) -> bool {
        self.collections.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Apply a server-originated mutation. `None` when the type is unknown.
    pub fn apply(&self, entity_type: &str, event: EntityEvent) -> Option<Applied> {
        self.apply_from(entity_type, event, ChangeOrigin::Remote)
    }

    /// Apply a local optimistic mutation ahead of the server's confirmation.
    pub fn apply_optimistic(&self, entity_type: &str, event: EntityEvent) -> Option<Applied> {
        self.apply_from(entity_type, event, ChangeOrigin::Optimistic)
    }

    fn apply_from(
        &self,
        entity_type: &str,
        event: EntityEvent,
        origin: ChangeOrigin,
    ) -> Option<Applied> {
        let id = event.id();
        let applied = {
            let mut collection = self.collections.get_mut(entity_type)?;
            apply_entity_event(collection.value_mut(), event)
        };

        if applied == Applied::Rejected {
            warn!(
                component = "collections",
                event = "collections.apply.rejected",
                entity_type = %entity_type,
                origin = ?origin,
                "Entity payload has no usable id"
            );
        } else {
            debug!(
                component = "collections",
                event = "collections.apply",
                entity_type = %entity_type,
                entity_id = id.as_ref().map(EntityId::as_str).unwrap_or(""),
                applied = applied.as_str(),
                origin = ?origin,
            );
        }

        let _ = self.changes.send(CollectionChange::Entity {
            entity_type: entity_type.to_string(),
            id,
            applied,
            origin,
        });
        Some(applied)
    }

    /// Replace a collection wholesale, e.g. after the initial load.
    ///
    /// Entries without a usable id are dropped; duplicate ids collapse to the
    /// last occurrence, kept at the position of the first. Returns the
    /// resulting length, or `None` when the type is unknown.
    pub fn replace_all(&self, entity_type: &str, entities: Vec<Entity>) -> Option<usize> {
        let mut seeded = Vec::with_capacity(entities.len());
        let mut dropped = 0usize;
        for entity in entities {
            if apply_entity_event(&mut seeded, EntityEvent::Create(entity)) == Applied::Rejected {
                dropped += 1;
            }
        }

        let count = seeded.len();
        {
            let mut collection = self.collections.get_mut(entity_type)?;
            *collection.value_mut() = seeded;
        }

        if dropped > 0 {
            warn!(
                component = "collections",
                event = "collections.reload.dropped",
                entity_type = %entity_type,
                dropped,
                "Dropped entities without id during reload"
            );
        }
        let _ = self.changes.send(CollectionChange::Reloaded {
            entity_type: entity_type.to_string(),
            count,
        });
        Some(count)
    }

    pub fn snapshot(&self, entity_type: &str) -> Option<Vec<Entity>> {
        self.collections.get(entity_type).map(|c| c.value().clone())
    }

    pub fn get(&self, entity_type: &str, id: &EntityId) -> Option<Entity> {
        let collection = self.collections.get(entity_type)?;
        collection
            .iter()
            .find(|entity| EntityId::of(entity).as_ref() == Some(id))
            .cloned()
    }

    pub fn len(&self, entity_type: &str) -> usize {
        self.collections
            .get(entity_type)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Empty every collection. Registered types stay registered.
    pub fn clear(&self) {
        for mut collection in self.collections.iter_mut() {
            collection.value_mut().clear();
        }
        let _ = self.changes.send(CollectionChange::Cleared);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionChange> {
        self.changes.subscribe()
    }
}

impl Default for CollectionStore {
    fn default() -> Self {
        Self::with_default_types()
    }
}
