//! Keyed, insertion-ordered entity collections and the create/update/delete
//! batch algorithm shared by calls, queues, queue calls and colleagues.
//!
//! All three operations match by id. A raw item without an id is dropped with
//! a warning and never prevents its siblings in the same batch from applying.

use indexmap::IndexMap;
use log::warn;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("{kind} item is missing an id")]
    MissingId { kind: &'static str },
}

/// A parsed, untyped item from an inbound event batch.
pub trait RawItem {
    /// Used in diagnostics only.
    const KIND: &'static str;

    fn id(&self) -> Option<&str>;

    fn checked_id(&self) -> Result<&str, SyncError> {
        match self.id() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(SyncError::MissingId { kind: Self::KIND }),
        }
    }
}

/// A server-synchronized object mirrored locally by id.
pub trait Entity: Sized {
    type Raw: RawItem;

    fn id(&self) -> &str;

    fn from_raw(raw: Self::Raw) -> Self;

    /// Mutates the entity in place; identity never changes.
    fn update_from_raw(&mut self, raw: Self::Raw);
}

#[derive(Debug, Clone)]
pub struct EntityCollection<T> {
    items: IndexMap<String, T>,
}

impl<T> Default for EntityCollection<T> {
    fn default() -> Self {
        Self {
            items: IndexMap::new(),
        }
    }
}

impl<T: Entity> EntityCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from a full snapshot; later duplicates are ignored.
    pub fn from_raw_items(items: impl IntoIterator<Item = T::Raw>) -> Self {
        let mut collection = Self::new();
        collection.apply_create(items);
        collection
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<&T> {
        self.items.values().find(|entity| predicate(entity))
    }

    pub fn find_mut(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.items.values_mut().find(|entity| predicate(entity))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    /// Appends a locally created entity (e.g. after an originate). Returns
    /// `false` and leaves the collection untouched if the id already exists.
    pub fn insert(&mut self, entity: T) -> bool {
        if self.items.contains_key(entity.id()) {
            return false;
        }
        self.items.insert(entity.id().to_string(), entity);
        true
    }

    /// Removes one entity by id, keeping the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.items.shift_remove(id)
    }

    /// Removes everything, preserving order in the returned list.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).map(|(_, entity)| entity).collect()
    }

    /// Applies a `create` batch with [`Entity::from_raw`].
    ///
    /// Returns the ids genuinely added, in order. Duplicates of existing ids
    /// (or of earlier items in the same batch) are skipped.
    pub fn apply_create(&mut self, items: impl IntoIterator<Item = T::Raw>) -> Vec<String> {
        self.apply_create_with(items, T::from_raw)
    }

    /// Like [`apply_create`](Self::apply_create) with a custom constructor.
    pub fn apply_create_with(
        &mut self,
        items: impl IntoIterator<Item = T::Raw>,
        mut build: impl FnMut(T::Raw) -> T,
    ) -> Vec<String> {
        let mut added = Vec::new();
        for raw in items {
            let id = match raw.checked_id() {
                Ok(id) => id.to_string(),
                Err(e) => {
                    warn!(target: "Sync", "Dropping create item: {e}");
                    continue;
                }
            };
            if self.items.contains_key(&id) {
                continue;
            }
            let entity = build(raw);
            self.items.insert(id.clone(), entity);
            added.push(id);
        }
        added
    }

    /// Applies an `update` batch with [`Entity::update_from_raw`].
    ///
    /// Returns the ids that matched, one per matched item. Items for unknown
    /// ids are dropped: an update is never an implicit create.
    pub fn apply_update(&mut self, items: impl IntoIterator<Item = T::Raw>) -> Vec<String> {
        self.apply_update_with(items, |entity, raw| {
            entity.update_from_raw(raw);
            entity.id().to_string()
        })
    }

    /// Like [`apply_update`](Self::apply_update), handing each matched entity
    /// and its raw item to `update`, which performs the mutation and any
    /// dependent invalidation itself.
    pub fn apply_update_with<R>(
        &mut self,
        items: impl IntoIterator<Item = T::Raw>,
        mut update: impl FnMut(&mut T, T::Raw) -> R,
    ) -> Vec<R> {
        let mut updated = Vec::new();
        for raw in items {
            let id = match raw.checked_id() {
                Ok(id) => id.to_string(),
                Err(e) => {
                    warn!(target: "Sync", "Dropping update item: {e}");
                    continue;
                }
            };
            match self.items.get_mut(&id) {
                Some(entity) => updated.push(update(entity, raw)),
                None => {
                    log::debug!(
                        target: "Sync",
                        "Update for unknown {} '{id}' ignored", T::Raw::KIND
                    );
                }
            }
        }
        updated
    }

    /// Applies a `delete` batch, returning the removed entities paired with the
    /// raw item that removed them. Unknown ids are no-ops.
    pub fn apply_delete(&mut self, items: impl IntoIterator<Item = T::Raw>) -> Vec<(T, T::Raw)> {
        let mut removed = Vec::new();
        for raw in items {
            let id = match raw.checked_id() {
                Ok(id) => id.to_string(),
                Err(e) => {
                    warn!(target: "Sync", "Dropping delete item: {e}");
                    continue;
                }
            };
            if let Some(entity) = self.items.shift_remove(&id) {
                removed.push((entity, raw));
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct RawThing {
        id: Option<String>,
        value: String,
    }

    impl RawItem for RawThing {
        const KIND: &'static str = "thing";

        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Thing {
        id: String,
        value: String,
        updates: u32,
    }

    impl Entity for Thing {
        type Raw = RawThing;

        fn id(&self) -> &str {
            &self.id
        }

        fn from_raw(raw: RawThing) -> Self {
            Self {
                id: raw.id.unwrap_or_default(),
                value: raw.value,
                updates: 0,
            }
        }

        fn update_from_raw(&mut self, raw: RawThing) {
            self.value = raw.value;
            self.updates += 1;
        }
    }

    fn raw(id: &str, value: &str) -> RawThing {
        RawThing {
            id: Some(id.to_string()),
            value: value.to_string(),
        }
    }

    fn values(collection: &EntityCollection<Thing>) -> Vec<(String, String)> {
        collection
            .iter()
            .map(|t| (t.id.clone(), t.value.clone()))
            .collect()
    }

    #[test]
    fn test_create_is_idempotent_under_redelivery() {
        let batch = vec![raw("1", "a"), raw("2", "b")];
        let mut collection = EntityCollection::<Thing>::new();

        let added = collection.apply_create(batch.clone());
        assert_eq!(added, vec!["1", "2"]);
        let once = values(&collection);

        let added_again = collection.apply_create(batch);
        assert!(added_again.is_empty());
        assert_eq!(values(&collection), once);
    }

    #[test]
    fn test_create_skips_duplicates_within_batch() {
        let mut collection = EntityCollection::<Thing>::new();
        let added = collection.apply_create(vec![raw("1", "a"), raw("1", "b")]);
        assert_eq!(added, vec!["1"]);
        assert_eq!(collection.get("1").unwrap().value, "a");
    }

    #[test]
    fn test_malformed_item_does_not_block_siblings() {
        let mut collection = EntityCollection::<Thing>::new();
        let batch = vec![
            raw("1", "a"),
            RawThing {
                id: None,
                value: "broken".into(),
            },
            RawThing {
                id: Some(String::new()),
                value: "empty".into(),
            },
            raw("2", "b"),
        ];
        let added = collection.apply_create(batch);
        assert_eq!(added, vec!["1", "2"]);
    }

    #[test]
    fn test_update_mutates_in_place_and_drops_unknown() {
        let mut collection = EntityCollection::<Thing>::from_raw_items(vec![raw("1", "a")]);
        let updated = collection.apply_update(vec![raw("1", "A"), raw("9", "ghost")]);

        assert_eq!(updated, vec!["1"]);
        assert_eq!(collection.len(), 1);
        let thing = collection.get("1").unwrap();
        assert_eq!(thing.value, "A");
        assert_eq!(thing.updates, 1);
        assert!(!collection.contains("9"));
    }

    #[test]
    fn test_delete_partitions_by_id_and_keeps_order() {
        let mut collection = EntityCollection::<Thing>::from_raw_items(vec![
            raw("1", "a"),
            raw("2", "b"),
            raw("3", "c"),
        ]);
        let removed = collection.apply_delete(vec![raw("2", ""), raw("7", "")]);

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0.id, "2");
        assert_eq!(collection.ids(), vec!["1", "3"]);

        assert_eq!(collection.remove("1").unwrap().value, "a");
        assert!(collection.remove("1").is_none());
        assert_eq!(collection.ids(), vec!["3"]);
    }

    #[test]
    fn test_insert_rejects_existing_id() {
        let mut collection = EntityCollection::<Thing>::from_raw_items(vec![raw("1", "a")]);
        assert!(!collection.insert(Thing::from_raw(raw("1", "z"))));
        assert!(collection.insert(Thing::from_raw(raw("2", "b"))));
        assert_eq!(collection.get("1").unwrap().value, "a");
    }

    #[test]
    fn test_drain_empties_in_order() {
        let mut collection =
            EntityCollection::<Thing>::from_raw_items(vec![raw("1", "a"), raw("2", "b")]);
        let drained = collection.drain();
        assert!(collection.is_empty());
        assert_eq!(drained.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["1", "2"]);
    }
}
