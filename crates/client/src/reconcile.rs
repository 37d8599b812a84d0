//! The single identity-keyed merge rule for entity collections.
//!
//! Both the dispatcher (server events) and the optimistic UI path go through
//! [`apply_entity_event`], so the two writers can never disagree on how a
//! change lands.

use sitesync_protocol::{Entity, EntityId, ServerMessage};

/// A mutation of one entity inside one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    Create(Entity),
    Update(Entity),
    Delete(EntityId),
}

impl EntityEvent {
    /// Split an entity frame into its collection tag and the mutation.
    pub fn from_message(message: ServerMessage) -> Option<(String, EntityEvent)> {
        match message {
            ServerMessage::EntityCreate {
                entity_type, data, ..
            } => Some((entity_type, EntityEvent::Create(data))),
            ServerMessage::EntityUpdate {
                entity_type, data, ..
            } => Some((entity_type, EntityEvent::Update(data))),
            ServerMessage::EntityDelete {
                entity_type, id, ..
            } => Some((entity_type, EntityEvent::Delete(id))),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<EntityId> {
        match self {
            EntityEvent::Create(entity) | EntityEvent::Update(entity) => EntityId::of(entity),
            EntityEvent::Delete(id) => Some(id.clone()),
        }
    }
}

/// What an application did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// No entry had this id; the entity was appended.
    Inserted,
    /// A Create found the id and replaced the slot.
    Replaced,
    /// An Update found the id and merged its fields into the slot.
    Merged,
    Removed,
    /// Delete for an id that is not present.
    Missing,
    /// The payload carried no usable id.
    Rejected,
}

impl Applied {
    /// Whether the collection contents changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Applied::Inserted | Applied::Replaced | Applied::Merged | Applied::Removed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Applied::Inserted => "inserted",
            Applied::Replaced => "replaced",
            Applied::Merged => "merged",
            Applied::Removed => "removed",
            Applied::Missing => "missing",
            Applied::Rejected => "rejected",
        }
    }
}

fn position(collection: &[Entity], id: &EntityId) -> Option<usize> {
    collection
        .iter()
        .position(|entity| EntityId::of(entity).as_ref() == Some(id))
}

/// Apply one mutation with last-write-wins-by-identity semantics.
///
/// Create replaces the slot with the same id or appends. Update merges the
/// payload's fields over the slot (partial payloads keep the fields they do
/// not mention) or appends. Delete removes the slot and is a no-op when the id
/// is absent. Each id occupies at most one slot afterwards.
///
/// An Update echo overrides every field it carries, but fields that only the
/// optimistic write set survive it; only a Create echo resets the slot.
pub fn apply_entity_event(collection: &mut Vec<Entity>, event: EntityEvent) -> Applied {
    match event {
        EntityEvent::Create(entity) => {
            let Some(id) = EntityId::of(&entity) else {
                return Applied::Rejected;
            };
            match position(collection, &id) {
                Some(index) => {
                    collection[index] = entity;
                    Applied::Replaced
                }
                None => {
                    collection.push(entity);
                    Applied::Inserted
                }
            }
        }
        EntityEvent::Update(patch) => {
            let Some(id) = EntityId::of(&patch) else {
                return Applied::Rejected;
            };
            match position(collection, &id) {
                Some(index) => {
                    let slot = &mut collection[index];
                    for (key, value) in patch {
                        slot.insert(key, value);
                    }
                    Applied::Merged
                }
                None => {
                    collection.push(patch);
                    Applied::Inserted
                }
            }
        }
        EntityEvent::Delete(id) => match position(collection, &id) {
            Some(index) => {
                collection.remove(index);
                Applied::Removed
            }
            None => Applied::Missing,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn entity(value: Value) -> Entity {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn task_lifecycle_create_update_delete() {
        let mut tasks = Vec::new();

        let create = entity(json!({"id": "t1", "title": "Pour foundation", "status": "pending"}));
        assert_eq!(
            apply_entity_event(&mut tasks, EntityEvent::Create(create)),
            Applied::Inserted
        );
        assert_eq!(tasks.len(), 1);

        let update = entity(json!({"id": "t1", "status": "completed"}));
        assert_eq!(
            apply_entity_event(&mut tasks, EntityEvent::Update(update)),
            Applied::Merged
        );
        assert_eq!(
            tasks,
            vec![entity(
                json!({"id": "t1", "title": "Pour foundation", "status": "completed"})
            )]
        );

        assert_eq!(
            apply_entity_event(&mut tasks, EntityEvent::Delete("t1".into())),
            Applied::Removed
        );
        assert!(tasks.is_empty());
    }

    #[test]
    fn applying_the_same_event_twice_equals_applying_once() {
        let events = [
            EntityEvent::Create(entity(json!({"id": "r1", "subject": "Rebar spacing"}))),
            EntityEvent::Update(entity(json!({"id": "r1", "status": "answered"}))),
        ];

        for event in events {
            let mut once = vec![entity(json!({"id": "r0"}))];
            apply_entity_event(&mut once, event.clone());

            let mut twice = vec![entity(json!({"id": "r0"}))];
            apply_entity_event(&mut twice, event.clone());
            apply_entity_event(&mut twice, event);

            assert_eq!(once, twice);
        }
    }

    #[test]
    fn delete_of_missing_id_leaves_collection_unchanged() {
        let mut items = vec![entity(json!({"id": "a"}))];
        let before = items.clone();

        assert_eq!(
            apply_entity_event(&mut items, EntityEvent::Delete("zzz".into())),
            Applied::Missing
        );
        assert_eq!(
            apply_entity_event(&mut items, EntityEvent::Delete("zzz".into())),
            Applied::Missing
        );
        assert_eq!(items, before);
    }

    #[test]
    fn server_echo_wins_over_optimistic_insert() {
        let mut equipment = Vec::new();
        apply_entity_event(
            &mut equipment,
            EntityEvent::Create(entity(json!({"id": "e9", "name": "Excavator", "status": "draft"}))),
        );

        let echo = entity(json!({"id": "e9", "name": "Excavator CAT 320", "status": "active"}));
        assert_eq!(
            apply_entity_event(&mut equipment, EntityEvent::Create(echo.clone())),
            Applied::Replaced
        );
        assert_eq!(equipment, vec![echo]);
    }

    #[test]
    fn update_echo_overrides_its_fields_and_keeps_optimistic_extras() {
        let mut rfis = Vec::new();
        apply_entity_event(
            &mut rfis,
            EntityEvent::Create(entity(
                json!({"id": "r3", "subject": "Rebar spacing", "status": "draft", "pending": true}),
            )),
        );

        let echo = entity(json!({"id": "r3", "status": "open", "subject": "Rebar spacing L2"}));
        assert_eq!(
            apply_entity_event(&mut rfis, EntityEvent::Update(echo)),
            Applied::Merged
        );
        assert_eq!(
            rfis,
            vec![entity(
                json!({"id": "r3", "subject": "Rebar spacing L2", "status": "open", "pending": true})
            )]
        );
    }

    #[test]
    fn update_for_unknown_id_appends() {
        let mut items = vec![entity(json!({"id": 1}))];
        apply_entity_event(&mut items, EntityEvent::Update(entity(json!({"id": 2, "qty": 5}))));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn replace_keeps_slot_position() {
        let mut items = vec![
            entity(json!({"id": "a"})),
            entity(json!({"id": "b"})),
            entity(json!({"id": "c"})),
        ];
        apply_entity_event(
            &mut items,
            EntityEvent::Create(entity(json!({"id": "b", "v": 2}))),
        );
        assert_eq!(items[1], entity(json!({"id": "b", "v": 2})));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn numeric_and_text_ids_address_the_same_slot() {
        let mut items = vec![entity(json!({"id": 42, "name": "Crane"}))];
        assert_eq!(
            apply_entity_event(&mut items, EntityEvent::Delete("42".into())),
            Applied::Removed
        );
    }

    #[test]
    fn payload_without_id_is_rejected() {
        let mut items = Vec::new();
        assert_eq!(
            apply_entity_event(&mut items, EntityEvent::Create(entity(json!({"title": "x"})))),
            Applied::Rejected
        );
        assert!(items.is_empty());
    }

    #[test]
    fn from_message_splits_entity_frames_only() {
        let message: ServerMessage = serde_json::from_value(json!({
            "type": "entity_delete", "entityType": "rfis", "id": "r7"
        }))
        .expect("parse delete");
        let (entity_type, event) = EntityEvent::from_message(message).expect("entity frame");
        assert_eq!(entity_type, "rfis");
        assert_eq!(event, EntityEvent::Delete("r7".into()));

        assert!(EntityEvent::from_message(ServerMessage::Unknown).is_none());
    }
}
