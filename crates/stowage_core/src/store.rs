//! In-memory object store with versioning and dirty tracking.
//!
//! Every `put` or `update` bumps the entity's version and marks it dirty.
//! `mark_clean` only clears the flag when the caller's version is still the
//! current one, so a change made after a save was dispatched is never lost.
//!
//! Observers registered with [`ObjectStore::subscribe`] are told about every
//! dirty, clean and remove transition. Notifications are delivered while the
//! store's write lock is held, so every observer sees the events for a key in
//! the order the changes were applied. Observers must not call back into the
//! store.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::id::{EntityKey, ObjectId};

/// A state change in the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The entity now has unsaved changes at `version`.
    Dirtied {
        /// Entity key.
        key: EntityKey,
        /// Version after the change.
        version: u64,
    },
    /// The changes up to `version` were confirmed persisted.
    Cleaned {
        /// Entity key.
        key: EntityKey,
        /// Version that was confirmed.
        version: u64,
    },
    /// The entity was removed from the store.
    Removed {
        /// Entity key.
        key: EntityKey,
    },
}

impl StoreEvent {
    /// The key the event is about.
    pub fn key(&self) -> EntityKey {
        match self {
            StoreEvent::Dirtied { key, .. }
            | StoreEvent::Cleaned { key, .. }
            | StoreEvent::Removed { key } => *key,
        }
    }
}

/// Receives store events.
pub trait StoreObserver: Send + Sync {
    /// Called once per event, in the order the changes were applied.
    ///
    /// Runs with the store locked; calling into the store deadlocks.
    fn on_event(&self, event: &StoreEvent);
}

/// Keyed, versioned storage for entities.
#[derive(Default)]
pub struct ObjectStore {
    entities: RwLock<HashMap<EntityKey, Entity>>,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
}

impl ObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for store events.
    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) {
        self.observers.write().push(observer);
    }

    /// Inserts or replaces an entity by key and marks it dirty.
    ///
    /// Returns the new version. A stale copy without a remote id does not
    /// erase the id already assigned to the stored entity; a copy carrying
    /// a different id is rejected.
    pub fn put(&self, mut entity: Entity) -> CoreResult<u64> {
        let key = entity.key();
        let mut entities = self.entities.write();
        let version = match entities.get(&key) {
            Some(existing) => {
                match (existing.object_id(), entity.object_id()) {
                    (Some(current), Some(incoming)) if current != incoming => {
                        return Err(CoreError::IdentifierImmutable {
                            key,
                            current: current.clone(),
                            attempted: incoming.clone(),
                        });
                    }
                    (Some(current), None) => entity.set_object_id(current.clone()),
                    _ => {}
                }
                existing.version().max(entity.version()) + 1
            }
            None => entity.version() + 1,
        };
        entity.set_state(version, true);
        entities.insert(key, entity);

        trace!(%key, version, "entity put");
        self.notify(StoreEvent::Dirtied { key, version });
        Ok(version)
    }

    /// Mutates a stored entity in place and marks it dirty.
    ///
    /// The closure works on a copy; if it fails the stored entity is left
    /// untouched and the error is returned.
    pub fn update<F>(&self, key: EntityKey, f: F) -> CoreResult<u64>
    where
        F: FnOnce(&mut Entity) -> CoreResult<()>,
    {
        let mut entities = self.entities.write();
        let stored = entities.get_mut(&key).ok_or(CoreError::not_found(key))?;
        let mut draft = stored.clone();
        f(&mut draft)?;
        let version = stored.version() + 1;
        draft.set_state(version, true);
        *stored = draft;

        trace!(%key, version, "entity updated");
        self.notify(StoreEvent::Dirtied { key, version });
        Ok(version)
    }

    /// Returns a snapshot of the entity.
    pub fn get(&self, key: EntityKey) -> CoreResult<Entity> {
        self.entities
            .read()
            .get(&key)
            .cloned()
            .ok_or(CoreError::not_found(key))
    }

    /// Clears the dirty flag if `version` is still the current version.
    ///
    /// A mismatch returns [`CoreError::VersionConflict`] and changes nothing.
    pub fn mark_clean(&self, key: EntityKey, version: u64) -> CoreResult<()> {
        let mut entities = self.entities.write();
        let stored = entities.get_mut(&key).ok_or(CoreError::not_found(key))?;
        if stored.version() != version {
            debug!(
                %key,
                expected = version,
                actual = stored.version(),
                "stale mark_clean ignored"
            );
            return Err(CoreError::VersionConflict {
                key,
                expected: version,
                actual: stored.version(),
            });
        }
        let was_dirty = stored.is_dirty();
        stored.set_state(version, false);

        if was_dirty {
            self.notify(StoreEvent::Cleaned { key, version });
        }
        Ok(())
    }

    /// Records the id assigned by the remote endpoint.
    ///
    /// The first assignment wins; assigning the same id again is a no-op.
    /// Neither the version nor the dirty flag change.
    pub fn assign_object_id(&self, key: EntityKey, object_id: ObjectId) -> CoreResult<()> {
        let mut entities = self.entities.write();
        let stored = entities.get_mut(&key).ok_or(CoreError::not_found(key))?;
        match stored.object_id() {
            Some(current) if *current == object_id => Ok(()),
            Some(current) => Err(CoreError::IdentifierImmutable {
                key,
                current: current.clone(),
                attempted: object_id,
            }),
            None => {
                debug!(%key, %object_id, "object id assigned");
                stored.set_object_id(object_id);
                Ok(())
            }
        }
    }

    /// Removes an entity, returning it.
    pub fn remove(&self, key: EntityKey) -> CoreResult<Entity> {
        let mut entities = self.entities.write();
        let removed = entities.remove(&key).ok_or(CoreError::not_found(key))?;
        self.notify(StoreEvent::Removed { key });
        Ok(removed)
    }

    /// Returns true if an entity is stored under the key.
    pub fn contains(&self, key: EntityKey) -> bool {
        self.entities.read().contains_key(&key)
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Keys of all entities with unsaved changes.
    pub fn dirty_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<_> = self
            .entities
            .read()
            .values()
            .filter(|e| e.is_dirty())
            .map(Entity::key)
            .collect();
        keys.sort();
        keys
    }

    /// Callers hold the entities write lock.
    fn notify(&self, event: StoreEvent) {
        for observer in self.observers.read().iter() {
            observer.on_event(&event);
        }
    }
}
