//! Managed instances: one tracked object plus its lifecycle bookkeeping.

use crate::change_tracker::{ChangeSet, Snapshot, SnapshotValue};
use crate::object::{FieldValue, ObjectRef};
use entmap_core::{EntityId, Result, Row, TypeError, Value};
use entmap_mapping::{AttributeMapping, AttributePath, EntityType, JoinStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstanceState {
    /// Persisted in memory, not yet inserted.
    New,
    /// Synchronised with a row.
    Managed,
    /// Scheduled for deletion at the next flush.
    Removed,
    /// No longer tracked by any context.
    Detached,
}

/// What a lazy association needs in order to be loaded later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazyKey {
    /// Foreign key values read from the owner's row (owning to-one).
    ForeignKey(EntityId),
    /// The owner's own identity (collections and inverse sides).
    Owner(EntityId),
}

impl LazyKey {
    pub fn id(&self) -> &EntityId {
        match self {
            LazyKey::ForeignKey(id) | LazyKey::Owner(id) => id,
        }
    }
}

/// Runtime wrapper around one object tracked by a persistence context.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    object: ObjectRef,
    entity: String,
    state: InstanceState,
    snapshot: Snapshot,
    lazy: BTreeMap<AttributePath, LazyKey>,
    forced: HashSet<AttributePath>,
    seq: u64,
}

/// Identifier values currently held by `object`.
pub fn entity_id(entity: &EntityType, object: &ObjectRef) -> EntityId {
    EntityId::new(
        entity
            .id_mappings()
            .iter()
            .map(|id| object.value_at(&id.path))
            .collect(),
    )
}

impl ManagedInstance {
    /// A freshly persisted instance.
    pub fn new(object: ObjectRef, entity: &EntityType) -> Self {
        Self {
            object,
            entity: entity.name().to_string(),
            state: InstanceState::New,
            snapshot: Snapshot::empty(),
            lazy: BTreeMap::new(),
            forced: HashSet::new(),
            seq: 0,
        }
    }

    /// Populate `object` from `row` and wrap it as MANAGED.
    ///
    /// Scalars are copied from their columns. Every association is left
    /// unloaded with a lazy handle recording the identity needed to fetch it.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %entity.name()))]
    pub fn load_from(object: ObjectRef, row: &Row, entity: &EntityType) -> Result<Self> {
        for basic in entity.basics() {
            let value = match row.get_by_name(&basic.column.name) {
                Some(value) => value.clone(),
                None if basic.id => {
                    return Err(TypeError {
                        expected: "identifier column",
                        actual: "no such column in row".to_string(),
                        column: Some(basic.column.name.clone()),
                    }
                    .into());
                }
                None => Value::Null,
            };
            object.set_field(&basic.path, FieldValue::Value(value));
        }

        let owner_id = entity_id(entity, &object);
        let mut lazy = BTreeMap::new();
        for attr in entity.associations() {
            let key = match (attr, attr.join_strategy()) {
                (AttributeMapping::OwnerToOne(_), Some(JoinStrategy::SourceColumns(columns))) => {
                    LazyKey::ForeignKey(EntityId::new(
                        columns
                            .iter()
                            .map(|c| row.get_by_name(&c.column).cloned().unwrap_or(Value::Null))
                            .collect(),
                    ))
                }
                _ => LazyKey::Owner(owner_id.clone()),
            };
            object.set_field(attr.path(), FieldValue::Unloaded);
            lazy.insert(attr.path().clone(), key);
        }

        let snapshot = Snapshot::capture(&object, entity);
        Ok(Self {
            object,
            entity: entity.name().to_string(),
            state: InstanceState::Managed,
            snapshot,
            lazy,
            forced: HashSet::new(),
            seq: 0,
        })
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Concrete entity type name.
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn set_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    /// Identifier the instance is tracked under: the values it was loaded or
    /// last flushed with, or the current ones before its first flush.
    pub fn id(&self, entity: &EntityType) -> EntityId {
        EntityId::new(
            entity
                .id_mappings()
                .iter()
                .map(|id| self.snapshot_id_value(&id.path))
                .collect(),
        )
    }

    pub fn snapshot_id_value(&self, path: &AttributePath) -> Value {
        self.snapshot_value(path)
            .unwrap_or_else(|| self.object.value_at(path))
    }

    /// Whether the application changed an identifier value after it was
    /// stored.
    pub fn id_changed(&self, entity: &EntityType) -> bool {
        self.id(entity) != entity_id(entity, &self.object)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Scalar value recorded in the snapshot for `path`.
    pub fn snapshot_value(&self, path: &AttributePath) -> Option<Value> {
        match self.snapshot.get(path) {
            Some(SnapshotValue::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Force `path` into the next change set.
    pub fn mark_dirty(&mut self, path: AttributePath) {
        self.forced.insert(path);
    }

    /// Differences between the object and its last-flushed snapshot.
    pub fn compute_change_set(&self, entity: &EntityType) -> ChangeSet {
        self.snapshot.diff(&self.object, entity, &self.forced)
    }

    /// Lazy associations not resolved yet.
    pub fn lazy_handles(&self) -> &BTreeMap<AttributePath, LazyKey> {
        &self.lazy
    }

    pub fn is_lazy(&self, path: &AttributePath) -> bool {
        self.lazy.contains_key(path)
    }

    pub(crate) fn lazy_key(&self, path: &AttributePath) -> Option<&LazyKey> {
        self.lazy.get(path)
    }

    /// Install a resolved association and re-baseline that path only.
    pub(crate) fn resolve_lazy(&mut self, path: &AttributePath, value: FieldValue) {
        self.lazy.remove(path);
        self.object.set_field(path, value);
        self.snapshot.record_current(&self.object, path);
    }

    /// Record the original contents of a lazy association the application
    /// overwrote before it was ever loaded.
    pub(crate) fn settle_lazy(&mut self, path: &AttributePath, original: SnapshotValue) {
        self.lazy.remove(path);
        self.snapshot.record(path.clone(), original);
    }

    /// Take a fresh snapshot after a successful flush.
    pub(crate) fn rebaseline(&mut self, entity: &EntityType) {
        self.snapshot = Snapshot::capture(&self.object, entity);
        self.forced.clear();
    }
}
