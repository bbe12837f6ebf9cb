//! Identity map: one object per (hierarchy root, identifier) in a context.
//!
//! Keys use the root of the inheritance hierarchy, so an instance found as
//! `Vehicle` and later as `Car` with the same identifier is the same object.
//! The mutex is held only for the lookup or insert itself, never across a
//! row-source call.

use crate::object::ObjectRef;
use entmap_core::{EntityId, Result, StateError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub(crate) type Key = (String, EntityId);

#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: Mutex<HashMap<Key, ObjectRef>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, ObjectRef>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, root: &str, id: &EntityId) -> Option<ObjectRef> {
        self.lock().get(&(root.to_string(), id.clone())).cloned()
    }

    pub fn contains(&self, root: &str, id: &EntityId) -> bool {
        self.lock().contains_key(&(root.to_string(), id.clone()))
    }

    /// Register `object` under `id`.
    ///
    /// Re-registering the same object is a no-op; a different object already
    /// registered under the identity is rejected.
    pub fn insert(&self, root: &str, id: EntityId, object: ObjectRef) -> Result<()> {
        let mut entries = self.lock();
        match entries.get(&(root.to_string(), id.clone())) {
            Some(existing) if existing.ptr_eq(&object) => Ok(()),
            Some(_) => Err(StateError::for_entity(
                root,
                format!(
                    "another instance with identifier {:?} is already managed",
                    id.values()
                ),
            )
            .into()),
            None => {
                entries.insert((root.to_string(), id), object);
                Ok(())
            }
        }
    }

    /// Drop the entry for `id` if it still points at `object`.
    pub fn remove(&self, root: &str, id: &EntityId, object: &ObjectRef) -> bool {
        let mut entries = self.lock();
        let key = (root.to_string(), id.clone());
        if entries.get(&key).is_some_and(|o| o.ptr_eq(object)) {
            entries.remove(&key);
            true
        } else {
            false
        }
    }

    pub(crate) fn snapshot(&self) -> HashMap<Key, ObjectRef> {
        self.lock().clone()
    }

    pub(crate) fn restore(&self, entries: HashMap<Key, ObjectRef>) {
        *self.lock() = entries;
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_core::Value;

    #[test]
    fn same_identity_returns_same_object() {
        let map = IdentityMap::new();
        let order = ObjectRef::new("Order");
        map.insert("Order", EntityId::from(1i64), order.clone())
            .unwrap();

        // width of the key value does not matter
        let found = map
            .get("Order", &EntityId::single(Value::Int(1)))
            .unwrap();
        assert!(found.ptr_eq(&order));
        assert!(map.get("Customer", &EntityId::from(1i64)).is_none());
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let map = IdentityMap::new();
        let a = ObjectRef::new("Order");
        let b = ObjectRef::new("Order");
        map.insert("Order", EntityId::from(1i64), a.clone()).unwrap();
        map.insert("Order", EntityId::from(1i64), a.clone()).unwrap();

        let err = map
            .insert("Order", EntityId::from(1i64), b.clone())
            .unwrap_err();
        assert!(matches!(err, entmap_core::Error::State(_)));

        assert!(!map.remove("Order", &EntityId::from(1i64), &b));
        assert!(map.remove("Order", &EntityId::from(1i64), &a));
        assert!(map.is_empty());
    }
}
