//! The persistence context: identity map, lifecycle operations and flush.
//!
//! A context tracks the objects of one unit of work. It is meant to be used
//! by one thread at a time; the identity map is guarded by a short-held mutex,
//! everything else assumes a single writer.
//!
//! # Flush
//!
//! Flushing synchronises the tracked objects with the row source:
//!
//! 1. lazy associations the application overwrote before loading them get
//!    their original contents recorded, so the diff is complete
//! 2. PERSIST is cascaded to reachable unmanaged objects and orphans are
//!    scheduled for removal
//! 3. NEW rows are inserted in foreign-key order (IDENTITY keys are written
//!    back as soon as each insert returns)
//! 4. foreign keys deferred to break a nullable cycle are set, and dirty
//!    MANAGED rows are updated under their version check
//! 5. join-table rows and target-row foreign keys are maintained
//! 6. REMOVED rows are deleted, dependents first, each after the join rows
//!    that reference it
//!
//! Lifecycle transitions happen only once every row operation succeeded. When
//! a flush fails, identifiers and versions written during it are restored and
//! every instance keeps its state.

use crate::change_tracker::{ChangeSet, SnapshotValue};
use crate::emitter::Emitter;
use crate::flush::{FlushOrderer, FlushResult, InsertOrder};
use crate::identity_map::IdentityMap;
use crate::managed::{InstanceState, LazyKey, ManagedInstance, entity_id};
use crate::object::{FieldValue, ObjectRef};
use entmap_core::{
    ColumnValues, EntityId, OptimisticLockError, Result, Row, RowSource, StateError, Value,
};
use entmap_mapping::{
    AssociationMapping, AttributeMapping, AttributePath, Cardinality, CascadeType, CollectionOrder,
    EntityType, FetchType, GenerationType, JoinColumn, JoinStrategy, MappingGraph,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Configuration for a persistence context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Detach every instance after a successful commit.
    pub detach_on_commit: bool,
    /// Cascade PERSIST over reachable objects when flushing.
    pub cascade_persist_on_flush: bool,
    /// Version written into a NEW instance whose version is unset.
    pub initial_version: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            detach_on_commit: true,
            cascade_persist_on_flush: true,
            initial_version: 1,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn detach_on_commit(mut self, detach: bool) -> Self {
        self.detach_on_commit = detach;
        self
    }

    #[must_use]
    pub fn cascade_persist_on_flush(mut self, cascade: bool) -> Self {
        self.cascade_persist_on_flush = cascade;
        self
    }

    #[must_use]
    pub fn initial_version(mut self, version: i64) -> Self {
        self.initial_version = version;
        self
    }
}

/// Field writes made during a flush, undone if it fails.
#[derive(Debug, Default)]
struct Journal {
    writes: Vec<(ObjectRef, AttributePath, Option<FieldValue>)>,
}

impl Journal {
    fn write(&mut self, object: &ObjectRef, path: &AttributePath, value: FieldValue) {
        self.writes
            .push((object.clone(), path.clone(), object.field(path)));
        object.set_field(path, value);
    }

    fn rollback(self) {
        for (object, path, previous) in self.writes.into_iter().rev() {
            object.set_field(&path, previous.unwrap_or(FieldValue::Value(Value::Null)));
        }
    }
}

fn count(affected: u64) -> usize {
    usize::try_from(affected).unwrap_or(usize::MAX)
}

/// `columns` bound to the identifier values of `referenced`.
fn key_predicate(columns: &[JoinColumn], referenced: &EntityType, id: &EntityId) -> ColumnValues {
    let id_columns = referenced.id_columns();
    columns
        .iter()
        .map(|jc| {
            let value = id_columns
                .iter()
                .position(|c| *c == jc.referenced_column)
                .and_then(|i| id.values().get(i))
                .cloned()
                .unwrap_or(Value::Null);
            (jc.column.clone(), value)
        })
        .collect()
}

/// Identifier of `referenced` read from the join columns of `row`.
fn id_from_row(columns: &[JoinColumn], referenced: &EntityType, row: &Row) -> EntityId {
    EntityId::new(
        referenced
            .id_columns()
            .iter()
            .map(|id| {
                columns
                    .iter()
                    .find(|jc| jc.referenced_column == *id)
                    .and_then(|jc| row.get_by_name(&jc.column))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect(),
    )
}

/// Identifier of `referenced` from foreign-key values in `columns` order.
fn id_from_key(columns: &[JoinColumn], referenced: &EntityType, key: &EntityId) -> EntityId {
    EntityId::new(
        referenced
            .id_columns()
            .iter()
            .map(|id| {
                columns
                    .iter()
                    .position(|jc| jc.referenced_column == *id)
                    .and_then(|i| key.values().get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect(),
    )
}

fn position_in(row: &Row, column: Option<&str>) -> Value {
    column
        .and_then(|c| row.get_by_name(c))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Put loaded collection elements in their declared order. Without one the
/// row source order is kept.
fn arrange(
    order: Option<&CollectionOrder>,
    target: &EntityType,
    mut found: Vec<(Value, ObjectRef)>,
) -> Vec<ObjectRef> {
    match order {
        Some(CollectionOrder::Column(_)) => found.sort_by(|(a, _), (b, _)| a.sort_cmp(b)),
        Some(CollectionOrder::By(keys)) => {
            let keys: Vec<(AttributePath, bool)> = if keys.is_empty() {
                target
                    .id_mappings()
                    .into_iter()
                    .map(|id| (id.path.clone(), false))
                    .collect()
            } else {
                keys.iter().map(|k| (k.path.clone(), k.descending)).collect()
            };
            found.sort_by(|(_, a), (_, b)| {
                keys.iter()
                    .map(|(path, descending)| {
                        let ordering = a.value_at(path).sort_cmp(&b.value_at(path));
                        if *descending { ordering.reverse() } else { ordering }
                    })
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }
        None => {}
    }
    found.into_iter().map(|(_, object)| object).collect()
}

fn id_predicate(entity: &EntityType, id: &EntityId) -> ColumnValues {
    entity
        .id_columns()
        .into_iter()
        .map(str::to_string)
        .zip(id.values().iter().cloned())
        .collect()
}

/// A unit of work over one mapping graph and one row source.
pub struct PersistenceContext<R: RowSource> {
    graph: Arc<MappingGraph>,
    rows: R,
    config: ContextConfig,
    identity: IdentityMap,
    instances: HashMap<ObjectRef, ManagedInstance>,
    seq: u64,
    closed: bool,
}

impl<R: RowSource> PersistenceContext<R> {
    pub fn new(graph: Arc<MappingGraph>, rows: R) -> Self {
        Self::with_config(graph, rows, ContextConfig::default())
    }

    pub fn with_config(graph: Arc<MappingGraph>, rows: R, config: ContextConfig) -> Self {
        Self {
            graph,
            rows,
            config,
            identity: IdentityMap::new(),
            instances: HashMap::new(),
            seq: 0,
            closed: false,
        }
    }

    pub fn graph(&self) -> &Arc<MappingGraph> {
        &self.graph
    }

    pub fn row_source(&self) -> &R {
        &self.rows
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Number of tracked instances, REMOVED ones included.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StateError::new("persistence context is closed").into());
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Whether `object` is NEW or MANAGED here.
    pub fn contains(&self, object: &ObjectRef) -> bool {
        matches!(
            self.state_of(object),
            Some(InstanceState::New | InstanceState::Managed)
        )
    }

    /// Lifecycle state of `object`; `None` when this context does not track it.
    pub fn state_of(&self, object: &ObjectRef) -> Option<InstanceState> {
        self.instances.get(object).map(ManagedInstance::state)
    }

    pub fn instance(&self, object: &ObjectRef) -> Option<&ManagedInstance> {
        self.instances.get(object)
    }

    /// Pending changes of a tracked object.
    pub fn change_set(&self, object: &ObjectRef) -> Result<ChangeSet> {
        let instance = self.managed(object)?;
        let entity = self.graph.entity(instance.entity_name())?;
        Ok(instance.compute_change_set(entity))
    }

    fn managed(&self, object: &ObjectRef) -> Result<&ManagedInstance> {
        self.instances.get(object).ok_or_else(|| {
            StateError::for_entity(object.entity(), "instance is not managed by this context")
                .into()
        })
    }

    /// Forget an instance and its identity-map entry.
    fn forget(&mut self, entity: &EntityType, object: &ObjectRef) {
        let id = match self.instances.remove(object) {
            Some(instance) => instance.id(entity),
            None => entity_id(entity, object),
        };
        if id.is_complete() {
            self.identity.remove(entity.root(), &id, object);
        }
    }

    /// Make `object` NEW.
    #[tracing::instrument(level = "debug", skip(self, object), fields(entity = %object.entity()))]
    pub fn persist(&mut self, object: &ObjectRef) -> Result<()> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        let mut visited = HashSet::new();
        let mut journal = Journal::default();
        self.persist_cascade(&graph, object, &mut visited, &mut journal)
    }

    fn persist_cascade(
        &mut self,
        graph: &MappingGraph,
        object: &ObjectRef,
        visited: &mut HashSet<ObjectRef>,
        journal: &mut Journal,
    ) -> Result<()> {
        if !visited.insert(object.clone()) {
            return Ok(());
        }
        let entity = graph.entity(object.entity())?;
        match self.state_of(object) {
            Some(InstanceState::Removed) => {
                return Err(StateError::for_entity(
                    entity.name(),
                    "cannot persist a removed instance",
                )
                .into());
            }
            Some(_) => {}
            None => self.make_new(entity, object, journal)?,
        }

        for attr in entity.associations() {
            let Some(assoc) = attr.association() else {
                continue;
            };
            if !assoc.cascades_to(CascadeType::Persist) {
                continue;
            }
            let targets = object
                .field(attr.path())
                .map(|f| f.references())
                .unwrap_or_default();
            for target in targets {
                self.persist_cascade(graph, &target, visited, journal)?;
            }
        }
        Ok(())
    }

    fn make_new(
        &mut self,
        entity: &EntityType,
        object: &ObjectRef,
        journal: &mut Journal,
    ) -> Result<()> {
        let mut id = entity_id(entity, object);
        if !id.is_complete() {
            match entity.generation() {
                GenerationType::Sequence { name } => {
                    let value = self.rows.next_sequence_value(&name)?;
                    if let [mapping] = entity.id_mappings().as_slice() {
                        journal.write(object, &mapping.path, value.into());
                    }
                    id = entity_id(entity, object);
                }
                GenerationType::Identity => {}
                GenerationType::Assigned => {
                    return Err(StateError::for_entity(
                        entity.name(),
                        "identifier must be assigned before persist",
                    )
                    .into());
                }
            }
        }
        if id.is_complete() {
            self.identity.insert(entity.root(), id, object.clone())?;
        }
        let seq = self.next_seq();
        self.instances.insert(
            object.clone(),
            ManagedInstance::new(object.clone(), entity).with_seq(seq),
        );
        tracing::debug!(entity = %entity.name(), "Instance is now NEW");
        Ok(())
    }

    /// Schedule `object` for deletion (or forget it if it was never flushed).
    #[tracing::instrument(level = "debug", skip(self, object), fields(entity = %object.entity()))]
    pub fn remove(&mut self, object: &ObjectRef) -> Result<()> {
        self.ensure_open()?;
        self.managed(object)?;
        let graph = Arc::clone(&self.graph);
        let mut visited = HashSet::new();
        self.remove_cascade(&graph, object, &mut visited)
    }

    fn remove_cascade(
        &mut self,
        graph: &MappingGraph,
        object: &ObjectRef,
        visited: &mut HashSet<ObjectRef>,
    ) -> Result<()> {
        if !visited.insert(object.clone()) {
            return Ok(());
        }
        let Some(state) = self.state_of(object) else {
            return Ok(());
        };
        let entity = graph.entity(object.entity())?;

        let mut targets = Vec::new();
        for attr in entity.associations() {
            let Some(assoc) = attr.association() else {
                continue;
            };
            if !(assoc.cascades_to(CascadeType::Remove) || assoc.orphan_removal()) {
                continue;
            }
            let field = match object.field(attr.path()) {
                Some(FieldValue::Unloaded) => {
                    self.resolve_association(graph, object, attr.path())?
                }
                Some(field) => field,
                None => continue,
            };
            targets.extend(field.references());
        }

        match state {
            InstanceState::New => {
                self.forget(entity, object);
                tracing::debug!(entity = %entity.name(), "NEW instance dropped");
            }
            InstanceState::Managed => {
                if let Some(instance) = self.instances.get_mut(object) {
                    instance.set_state(InstanceState::Removed);
                }
                tracing::debug!(entity = %entity.name(), "Instance is now REMOVED");
            }
            InstanceState::Removed | InstanceState::Detached => {}
        }

        for target in targets {
            self.remove_cascade(graph, &target, visited)?;
        }
        Ok(())
    }

    /// Look up an instance by identifier.
    ///
    /// Identity-map hits are answered without touching the row source.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn find(&mut self, entity: &str, id: impl Into<EntityId>) -> Result<Option<ObjectRef>> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        let entity = graph.entity(entity)?;
        self.find_by_type(&graph, entity, &id.into())
    }

    /// Every instance stored in `entity`'s table, subtypes included.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn find_all(&mut self, entity: &str) -> Result<Vec<ObjectRef>> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        let entity = graph.entity(entity)?;
        self.hydrate_all(&graph, entity, &[])
    }

    fn find_by_type(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        id: &EntityId,
    ) -> Result<Option<ObjectRef>> {
        let expected = entity.id_columns().len();
        if id.values().len() != expected {
            return Err(StateError::for_entity(
                entity.name(),
                format!(
                    "identifier has {} value(s), expected {}",
                    id.values().len(),
                    expected
                ),
            )
            .into());
        }
        if !id.is_complete() {
            return Ok(None);
        }
        if let Some(object) = self.identity.get(entity.root(), id) {
            tracing::trace!(entity = %entity.name(), "Identity map hit");
            return Ok(self.visible(graph, entity, object));
        }

        let Some(row) = self.rows.fetch_row(entity.table(), &id_predicate(entity, id))? else {
            tracing::debug!(entity = %entity.name(), "No row for identifier");
            return Ok(None);
        };
        self.hydrate(graph, entity, &row)
    }

    /// `object` unless it is REMOVED or not an instance of `entity`.
    fn visible(
        &self,
        graph: &MappingGraph,
        entity: &EntityType,
        object: ObjectRef,
    ) -> Option<ObjectRef> {
        let removed = self.state_of(&object) == Some(InstanceState::Removed);
        (!removed && graph.is_assignable(object.entity(), entity.name())).then_some(object)
    }

    fn hydrate_all(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        predicate: &[(String, Value)],
    ) -> Result<Vec<ObjectRef>> {
        let found = self.hydrate_positioned(graph, entity, predicate, None)?;
        Ok(found.into_iter().map(|(_, object)| object).collect())
    }

    /// Materialise the rows matching `predicate`, each paired with the
    /// value of its `position` column.
    fn hydrate_positioned(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        predicate: &[(String, Value)],
        position: Option<&str>,
    ) -> Result<Vec<(Value, ObjectRef)>> {
        let rows = self.rows.fetch_rows(entity.table(), predicate)?;
        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let at = position_in(row, position);
            found.extend(self.hydrate(graph, entity, row)?.map(|o| (at, o)));
        }
        Ok(found)
    }

    /// Materialise `row` through the identity map.
    fn hydrate(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        row: &Row,
    ) -> Result<Option<ObjectRef>> {
        let discriminator = entity
            .discriminator()
            .and_then(|d| row.get_by_name(&d.column))
            .and_then(Value::as_str);
        if let Some(value) = discriminator {
            if graph
                .get(value)
                .is_some_and(|t| !graph.is_assignable(t.name(), entity.name()))
            {
                return Ok(None);
            }
        }
        let concrete = graph.concrete_type(entity, discriminator);

        let id = EntityId::new(
            concrete
                .id_columns()
                .iter()
                .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                .collect(),
        );
        if let Some(existing) = self.identity.get(concrete.root(), &id) {
            return Ok(self.visible(graph, entity, existing));
        }

        let object = ObjectRef::new(concrete.name());
        let seq = self.next_seq();
        let instance = ManagedInstance::load_from(object.clone(), row, concrete)?.with_seq(seq);
        self.identity.insert(concrete.root(), id, object.clone())?;
        self.instances.insert(object.clone(), instance);
        tracing::debug!(entity = %concrete.name(), table = %concrete.table(), "Loaded instance");

        self.load_eager(graph, concrete, &object)?;
        Ok(Some(object))
    }

    fn load_eager(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        object: &ObjectRef,
    ) -> Result<()> {
        for attr in entity.associations() {
            if attr.fetch() == FetchType::Eager {
                self.resolve_association(graph, object, attr.path())?;
            }
        }
        Ok(())
    }

    /// Resolve a lazy association of a managed object.
    ///
    /// Already loaded (or application-assigned) associations are returned
    /// as they are.
    #[tracing::instrument(level = "debug", skip(self, object, path), fields(entity = %object.entity()))]
    pub fn load_association(
        &mut self,
        object: &ObjectRef,
        path: impl Into<AttributePath>,
    ) -> Result<FieldValue> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        self.resolve_association(&graph, object, &path.into())
    }

    /// Field at a dotted path, loading it first if it is a lazy association.
    pub fn get(&mut self, object: &ObjectRef, path: &str) -> Result<FieldValue> {
        self.load_association(object, AttributePath::parse(path))
    }

    fn resolve_association(
        &mut self,
        graph: &MappingGraph,
        object: &ObjectRef,
        path: &AttributePath,
    ) -> Result<FieldValue> {
        let instance = self.managed(object)?;
        let current = object.field(path);
        let key = match (&current, instance.lazy_key(path)) {
            (Some(FieldValue::Unloaded), Some(key)) => key.clone(),
            _ => {
                tracing::trace!(attribute = %path, "Already loaded");
                return Ok(current.unwrap_or(FieldValue::Value(Value::Null)));
            }
        };
        let entity = graph.entity(instance.entity_name())?;
        let attr = entity.attribute(path).ok_or_else(|| {
            StateError::for_entity(entity.name(), format!("no association at '{path}'"))
        })?;

        let value = self.fetch_association(graph, entity, attr, &key)?;
        if let Some(instance) = self.instances.get_mut(object) {
            instance.resolve_lazy(path, value.clone());
        }
        tracing::debug!(
            entity = %entity.name(),
            attribute = %path,
            found = value.references().len(),
            "Association loaded"
        );
        Ok(value)
    }

    /// Read the contents of an association from the row source.
    fn fetch_association(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        attr: &AttributeMapping,
        key: &LazyKey,
    ) -> Result<FieldValue> {
        let Some(assoc) = attr.association() else {
            return Ok(FieldValue::Value(Value::Null));
        };
        let target = graph.entity(assoc.target())?;
        let found = if attr.is_owner() {
            self.fetch_owned(graph, entity, assoc, target, key)?
        } else {
            self.fetch_inverse(graph, entity, assoc, target, key)?
        };
        Ok(match attr.cardinality() {
            Some(Cardinality::Many) => FieldValue::Many(found),
            _ => FieldValue::One(found.into_iter().next()),
        })
    }

    fn fetch_owned(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        assoc: &AssociationMapping,
        target: &EntityType,
        key: &LazyKey,
    ) -> Result<Vec<ObjectRef>> {
        let position = assoc.order_column();
        let found = match assoc.join_strategy() {
            Some(JoinStrategy::SourceColumns(columns)) => {
                let id = id_from_key(columns, target, key.id());
                return Ok(self.find_by_type(graph, target, &id)?.into_iter().collect());
            }
            Some(JoinStrategy::JoinTable(table)) => {
                let predicate = key_predicate(&table.owner_columns, entity, key.id());
                let rows = self.rows.fetch_rows(&table.name, &predicate)?;
                let mut found = Vec::with_capacity(rows.len());
                for row in &rows {
                    let id = id_from_row(&table.inverse_columns, target, row);
                    let at = position_in(row, position);
                    found.extend(self.find_by_type(graph, target, &id)?.map(|o| (at, o)));
                }
                found
            }
            Some(JoinStrategy::TargetColumns(columns)) => {
                let predicate = key_predicate(columns, entity, key.id());
                self.hydrate_positioned(graph, target, &predicate, position)?
            }
            Some(JoinStrategy::Inverse) | None => Vec::new(),
        };
        Ok(arrange(assoc.order(), target, found))
    }

    fn fetch_inverse(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        assoc: &AssociationMapping,
        target: &EntityType,
        key: &LazyKey,
    ) -> Result<Vec<ObjectRef>> {
        let Some((_, owning)) = graph.owning_side(entity, assoc) else {
            return Ok(Vec::new());
        };
        let found = match owning.join_strategy() {
            Some(JoinStrategy::SourceColumns(columns)) => {
                let predicate = key_predicate(columns, entity, key.id());
                self.hydrate_positioned(graph, target, &predicate, None)?
            }
            Some(JoinStrategy::JoinTable(table)) => {
                let predicate = key_predicate(&table.inverse_columns, entity, key.id());
                let rows = self.rows.fetch_rows(&table.name, &predicate)?;
                let mut found = Vec::with_capacity(rows.len());
                for row in &rows {
                    let id = id_from_row(&table.owner_columns, target, row);
                    found.extend(self.find_by_type(graph, target, &id)?.map(|o| (Value::Null, o)));
                }
                found
            }
            _ => Vec::new(),
        };
        Ok(arrange(assoc.order(), target, found))
    }

    /// Stop tracking `object`, cascading DETACH.
    #[tracing::instrument(level = "debug", skip(self, object), fields(entity = %object.entity()))]
    pub fn detach(&mut self, object: &ObjectRef) -> Result<()> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        let mut visited = HashSet::new();
        self.detach_cascade(&graph, object, &mut visited)
    }

    fn detach_cascade(
        &mut self,
        graph: &MappingGraph,
        object: &ObjectRef,
        visited: &mut HashSet<ObjectRef>,
    ) -> Result<()> {
        if !visited.insert(object.clone()) {
            return Ok(());
        }
        let Some(instance) = self.instances.get(object) else {
            return Ok(());
        };
        let entity = graph.entity(instance.entity_name())?;
        self.forget(entity, object);

        for attr in entity.associations() {
            if !attr
                .association()
                .is_some_and(|a| a.cascades_to(CascadeType::Detach))
            {
                continue;
            }
            let targets = object
                .field(attr.path())
                .map(|f| f.references())
                .unwrap_or_default();
            for target in targets {
                self.detach_cascade(graph, &target, visited)?;
            }
        }
        Ok(())
    }

    /// Reload a MANAGED object from its row, cascading REFRESH.
    ///
    /// Unflushed changes are discarded and associations become lazy again.
    #[tracing::instrument(level = "debug", skip(self, object), fields(entity = %object.entity()))]
    pub fn refresh(&mut self, object: &ObjectRef) -> Result<()> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        let mut visited = HashSet::new();
        self.refresh_cascade(&graph, object, &mut visited)
    }

    fn refresh_cascade(
        &mut self,
        graph: &MappingGraph,
        object: &ObjectRef,
        visited: &mut HashSet<ObjectRef>,
    ) -> Result<()> {
        if !visited.insert(object.clone()) {
            return Ok(());
        }
        let instance = self.managed(object)?;
        if instance.state() != InstanceState::Managed {
            return Err(StateError::for_entity(
                object.entity(),
                "only MANAGED instances can be refreshed",
            )
            .into());
        }
        let entity = graph.entity(instance.entity_name())?;
        let seq = instance.seq();
        let id = instance.id(entity);

        let mut targets = Vec::new();
        for attr in entity.associations() {
            if attr
                .association()
                .is_some_and(|a| a.cascades_to(CascadeType::Refresh))
            {
                targets.extend(
                    object
                        .field(attr.path())
                        .map(|f| f.references())
                        .unwrap_or_default(),
                );
            }
        }

        let row = self
            .rows
            .fetch_row(entity.table(), &id_predicate(entity, &id))?
            .ok_or_else(|| StateError::for_entity(entity.name(), "row no longer exists"))?;
        let reloaded = ManagedInstance::load_from(object.clone(), &row, entity)?.with_seq(seq);
        self.instances.insert(object.clone(), reloaded);
        tracing::debug!(entity = %entity.name(), "Instance refreshed");
        self.load_eager(graph, entity, object)?;

        for target in targets {
            if self.state_of(&target) == Some(InstanceState::Managed) {
                self.refresh_cascade(graph, &target, visited)?;
            }
        }
        Ok(())
    }

    /// Copy the state of a detached object onto its managed counterpart.
    ///
    /// The counterpart is looked up by identifier (loading it if needed) or
    /// created as NEW. A versioned object whose version no longer matches
    /// fails with an optimistic-lock error. Returns the managed object.
    #[tracing::instrument(level = "debug", skip(self, object), fields(entity = %object.entity()))]
    pub fn merge(&mut self, object: &ObjectRef) -> Result<ObjectRef> {
        self.ensure_open()?;
        let graph = Arc::clone(&self.graph);
        let mut merged = HashMap::new();
        let mut journal = Journal::default();
        self.merge_cascade(&graph, object, &mut merged, &mut journal)
    }

    fn merge_cascade(
        &mut self,
        graph: &MappingGraph,
        object: &ObjectRef,
        merged: &mut HashMap<ObjectRef, ObjectRef>,
        journal: &mut Journal,
    ) -> Result<ObjectRef> {
        if let Some(target) = merged.get(object) {
            return Ok(target.clone());
        }
        let entity = graph.entity(object.entity())?;

        if let Some(state) = self.state_of(object) {
            if state == InstanceState::Removed {
                return Err(StateError::for_entity(
                    entity.name(),
                    "cannot merge a removed instance",
                )
                .into());
            }
            merged.insert(object.clone(), object.clone());
            self.merge_associations(graph, entity, object, object, merged, journal)?;
            return Ok(object.clone());
        }

        let id = entity_id(entity, object);
        let existing = if id.is_complete() {
            self.find_by_type(graph, entity, &id)?
        } else {
            None
        };

        let target = match existing {
            Some(managed) => {
                if let Some(vm) = entity.version_mapping() {
                    let theirs = object.value_at(&vm.path);
                    let ours = managed.value_at(&vm.path);
                    if !theirs.is_null() && !theirs.matches(&ours) {
                        return Err(OptimisticLockError {
                            entity: entity.name().to_string(),
                            table: entity.table().to_string(),
                            id: id.into_values(),
                            expected_version: Some(theirs),
                        }
                        .into());
                    }
                }
                for basic in entity.basics().filter(|b| !b.id && !b.version) {
                    managed.set_field(&basic.path, FieldValue::Value(object.value_at(&basic.path)));
                }
                managed
            }
            None => {
                let fresh = ObjectRef::new(object.entity());
                for basic in entity.basics() {
                    fresh.set_field(&basic.path, FieldValue::Value(object.value_at(&basic.path)));
                }
                self.make_new(entity, &fresh, journal)?;
                fresh
            }
        };
        merged.insert(object.clone(), target.clone());
        self.merge_associations(graph, entity, object, &target, merged, journal)?;
        tracing::debug!(entity = %entity.name(), "Merged detached state");
        Ok(target)
    }

    fn merge_associations(
        &mut self,
        graph: &MappingGraph,
        entity: &EntityType,
        source: &ObjectRef,
        target: &ObjectRef,
        merged: &mut HashMap<ObjectRef, ObjectRef>,
        journal: &mut Journal,
    ) -> Result<()> {
        for attr in entity.associations() {
            let Some(assoc) = attr.association() else {
                continue;
            };
            let value = match source.field(attr.path()) {
                Some(FieldValue::One(None)) => FieldValue::One(None),
                Some(FieldValue::One(Some(reference))) => FieldValue::One(Some(
                    self.merge_reference(graph, assoc, &reference, merged, journal)?,
                )),
                Some(FieldValue::Many(references)) => {
                    let mut resolved = Vec::with_capacity(references.len());
                    for reference in &references {
                        resolved.push(self.merge_reference(graph, assoc, reference, merged, journal)?);
                    }
                    FieldValue::Many(resolved)
                }
                _ => continue,
            };
            target.set_field(attr.path(), value);
        }
        Ok(())
    }

    fn merge_reference(
        &mut self,
        graph: &MappingGraph,
        assoc: &AssociationMapping,
        reference: &ObjectRef,
        merged: &mut HashMap<ObjectRef, ObjectRef>,
        journal: &mut Journal,
    ) -> Result<ObjectRef> {
        if assoc.cascades_to(CascadeType::Merge) {
            return self.merge_cascade(graph, reference, merged, journal);
        }
        if self.instances.contains_key(reference) {
            return Ok(reference.clone());
        }
        if let Some(target) = merged.get(reference) {
            return Ok(target.clone());
        }
        let target_type = graph.entity(reference.entity())?;
        let id = entity_id(target_type, reference);
        if id.is_complete() {
            if let Some(managed) = self.find_by_type(graph, target_type, &id)? {
                return Ok(managed);
            }
        }
        Err(StateError::for_entity(
            reference.entity(),
            "merge reaches an unmanaged instance through an association without MERGE cascade",
        )
        .into())
    }

    /// Force `path` into the next change set of `object`.
    pub fn mark_dirty(&mut self, object: &ObjectRef, path: &str) -> Result<()> {
        self.ensure_open()?;
        let instance = self.instances.get_mut(object).ok_or_else(|| {
            StateError::for_entity(object.entity(), "instance is not managed by this context")
        })?;
        instance.mark_dirty(AttributePath::parse(path));
        Ok(())
    }

    /// Write every pending change to the row source.
    #[tracing::instrument(level = "debug", skip(self), fields(instances = self.instances.len()))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.ensure_open()?;
        let started = Instant::now();
        let graph = Arc::clone(&self.graph);
        let saved_instances = self.instances.clone();
        let saved_identity = self.identity.snapshot();
        let mut journal = Journal::default();

        match self.run_flush(&graph, &mut journal) {
            Ok(result) => {
                tracing::info!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    join_rows = result.join_rows,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Flush complete"
                );
                Ok(result)
            }
            Err(err) => {
                journal.rollback();
                self.instances = saved_instances;
                self.identity.restore(saved_identity);
                tracing::warn!(error = %err, "Flush failed; instance states left unchanged");
                Err(err)
            }
        }
    }

    fn run_flush(&mut self, graph: &MappingGraph, journal: &mut Journal) -> Result<FlushResult> {
        self.settle_lazy_handles(graph)?;
        self.cascade_on_flush(graph, journal)?;
        self.schedule_orphans(graph)?;

        let emitter = Emitter::new(graph, self.config.initial_version);
        let mut result = FlushResult::new();

        let mut tracked: Vec<(u64, ObjectRef, InstanceState)> = self
            .instances
            .values()
            .map(|i| (i.seq(), i.object().clone(), i.state()))
            .collect();
        tracked.sort_by_key(|(seq, ..)| *seq);
        let in_state = |state: InstanceState| -> Vec<ObjectRef> {
            tracked
                .iter()
                .filter(|(_, _, s)| *s == state)
                .map(|(_, o, _)| o.clone())
                .collect()
        };
        let new = in_state(InstanceState::New);
        let managed = in_state(InstanceState::Managed);
        let removed = in_state(InstanceState::Removed);
        tracing::debug!(
            new = new.len(),
            managed = managed.len(),
            removed = removed.len(),
            "Flushing"
        );

        // inserts
        let plan = self.insert_order(graph, &new)?;
        for &index in &plan.order {
            let object = &new[index];
            let entity = graph.entity(object.entity())?;
            if let Some(vm) = entity.version_mapping() {
                if object.value_at(&vm.path).is_null() {
                    journal.write(
                        object,
                        &vm.path,
                        Value::BigInt(self.config.initial_version).into(),
                    );
                }
            }
            let inserted = emitter
                .insert(entity, object, |path| plan.is_deferred(index, path))
                .execute(&self.rows)?;
            result.inserted += 1;

            if entity.generation() == GenerationType::Identity {
                if let [id] = entity.id_mappings().as_slice() {
                    if object.value_at(&id.path).is_null() {
                        let key = inserted.generated_key.ok_or_else(|| {
                            StateError::for_entity(
                                entity.name(),
                                "row source returned no generated key for an IDENTITY identifier",
                            )
                        })?;
                        journal.write(object, &id.path, key.into());
                    }
                }
            }
        }

        // deferred foreign keys, then updates
        for link in &plan.deferred {
            let object = &new[link.node];
            let entity = graph.entity(object.entity())?;
            if let Some(op) = emitter.link_update(entity, object, &link.path) {
                op.execute(&self.rows)?;
                result.updated += 1;
            }
        }
        let mut changed = Vec::new();
        for object in &managed {
            let instance = self.managed(object)?;
            let entity = graph.entity(instance.entity_name())?;
            if instance.id_changed(entity) {
                return Err(StateError::for_entity(
                    entity.name(),
                    format!(
                        "identifier of a managed instance changed from {:?} to {:?}",
                        instance.id(entity).values(),
                        entity_id(entity, object).values()
                    ),
                )
                .into());
            }
            let changes = instance.compute_change_set(entity);
            if changes.is_empty() {
                continue;
            }
            if let Some(planned) = emitter.update(entity, instance, &changes)? {
                let affected = planned.operation.execute(&self.rows)?.affected;
                if affected == 0 {
                    return Err(self.stale(entity, instance).into());
                }
                if let Some((path, version)) = planned.version {
                    journal.write(object, &path, version.into());
                }
                result.updated += 1;
            }
            changed.push((object.clone(), changes));
        }

        // join tables and target-row foreign keys
        for object in &new {
            let instance = self.managed(object)?;
            let entity = graph.entity(instance.entity_name())?;
            let changes = instance.compute_change_set(entity);
            for op in emitter.association_rows(entity, object, &changes) {
                result.join_rows += count(op.execute(&self.rows)?.affected);
            }
        }
        for (object, changes) in &changed {
            let entity = graph.entity(object.entity())?;
            for op in emitter.association_rows(entity, object, changes) {
                result.join_rows += count(op.execute(&self.rows)?.affected);
            }
        }

        // deletes
        for index in self.delete_order(graph, &removed)? {
            let object = &removed[index];
            let instance = self.managed(object)?;
            let entity = graph.entity(instance.entity_name())?;
            for op in emitter.cleanup_rows(entity, object) {
                result.join_rows += count(op.execute(&self.rows)?.affected);
            }
            let affected = emitter.delete(entity, instance).execute(&self.rows)?.affected;
            if affected == 0 {
                return Err(self.stale(entity, instance).into());
            }
            result.deleted += 1;
        }

        // every row operation succeeded
        for object in &new {
            let entity = graph.entity(object.entity())?;
            let id = entity_id(entity, object);
            if id.is_complete() {
                self.identity.insert(entity.root(), id, object.clone())?;
            }
            if let Some(instance) = self.instances.get_mut(object) {
                instance.set_state(InstanceState::Managed);
                instance.rebaseline(entity);
            }
        }
        for (object, _) in &changed {
            let entity = graph.entity(object.entity())?;
            if let Some(instance) = self.instances.get_mut(object) {
                instance.rebaseline(entity);
            }
        }
        for object in &removed {
            let entity = graph.entity(object.entity())?;
            self.forget(entity, object);
        }
        Ok(result)
    }

    fn stale(&self, entity: &EntityType, instance: &ManagedInstance) -> OptimisticLockError {
        OptimisticLockError {
            entity: entity.name().to_string(),
            table: entity.table().to_string(),
            id: instance.id(entity).into_values(),
            expected_version: entity
                .version_mapping()
                .and_then(|vm| instance.snapshot_value(&vm.path)),
        }
    }

    /// Record the original contents of lazy associations the application
    /// replaced without loading them.
    fn settle_lazy_handles(&mut self, graph: &MappingGraph) -> Result<()> {
        let mut pending = Vec::new();
        for instance in self.instances.values() {
            if instance.state() != InstanceState::Managed {
                continue;
            }
            for path in instance.lazy_handles().keys() {
                if !matches!(instance.object().field(path), Some(FieldValue::Unloaded)) {
                    pending.push((instance.object().clone(), path.clone()));
                }
            }
        }

        for (object, path) in pending {
            let instance = self.managed(&object)?;
            let entity = graph.entity(instance.entity_name())?;
            let (Some(attr), Some(key)) = (entity.attribute(&path), instance.lazy_key(&path).cloned())
            else {
                continue;
            };
            let original = match self.fetch_association(graph, entity, attr, &key)? {
                FieldValue::One(target) => SnapshotValue::One(target),
                FieldValue::Many(targets) => SnapshotValue::Many(targets),
                _ => SnapshotValue::Unloaded,
            };
            tracing::trace!(entity = %entity.name(), attribute = %path, "Settled overwritten lazy association");
            if let Some(instance) = self.instances.get_mut(&object) {
                instance.settle_lazy(&path, original);
            }
        }
        Ok(())
    }

    /// Cascade PERSIST from every NEW or MANAGED instance, then reject
    /// owning references to objects that are still unmanaged.
    fn cascade_on_flush(&mut self, graph: &MappingGraph, journal: &mut Journal) -> Result<()> {
        let mut roots: Vec<(u64, ObjectRef)> = self
            .instances
            .values()
            .filter(|i| matches!(i.state(), InstanceState::New | InstanceState::Managed))
            .map(|i| (i.seq(), i.object().clone()))
            .collect();
        roots.sort_by_key(|(seq, _)| *seq);

        if self.config.cascade_persist_on_flush {
            let mut visited = HashSet::new();
            for (_, object) in &roots {
                let entity = graph.entity(object.entity())?;
                for attr in entity.associations() {
                    if !attr
                        .association()
                        .is_some_and(|a| a.cascades_to(CascadeType::Persist))
                    {
                        continue;
                    }
                    let targets = object
                        .field(attr.path())
                        .map(|f| f.references())
                        .unwrap_or_default();
                    for target in targets {
                        if self.state_of(&target) == Some(InstanceState::Removed) {
                            continue;
                        }
                        self.persist_cascade(graph, &target, &mut visited, journal)?;
                    }
                }
            }
        }

        for instance in self.instances.values() {
            if !matches!(instance.state(), InstanceState::New | InstanceState::Managed) {
                continue;
            }
            let object = instance.object();
            let entity = graph.entity(instance.entity_name())?;
            for attr in entity.associations().into_iter().filter(|a| a.is_owner()) {
                let targets = object
                    .field(attr.path())
                    .map(|f| f.references())
                    .unwrap_or_default();
                if let Some(unmanaged) = targets.iter().find(|t| !self.instances.contains_key(*t)) {
                    return Err(StateError::for_entity(
                        entity.name(),
                        format!(
                            "'{}' references an unmanaged {} instance; persist it or cascade PERSIST",
                            attr.path(),
                            unmanaged.entity()
                        ),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Remove objects dropped from orphan-removal associations.
    fn schedule_orphans(&mut self, graph: &MappingGraph) -> Result<()> {
        let mut orphans = Vec::new();
        for instance in self.instances.values() {
            if instance.state() != InstanceState::Managed {
                continue;
            }
            let entity = graph.entity(instance.entity_name())?;
            for change in &instance.compute_change_set(entity) {
                if entity
                    .association(change.path())
                    .is_some_and(AssociationMapping::orphan_removal)
                {
                    orphans.extend(change.dropped());
                }
            }
        }

        for orphan in orphans {
            if self.contains(&orphan) {
                tracing::debug!(entity = %orphan.entity(), "Removing orphan");
                let mut visited = HashSet::new();
                self.remove_cascade(graph, &orphan, &mut visited)?;
            }
        }
        Ok(())
    }

    /// Insert order over owning to-one references between NEW instances.
    fn insert_order(&self, graph: &MappingGraph, new: &[ObjectRef]) -> Result<InsertOrder> {
        let mut orderer = FlushOrderer::new();
        let mut index = HashMap::with_capacity(new.len());
        for object in new {
            index.insert(object.clone(), orderer.add_node(object.entity()));
        }
        for (i, object) in new.iter().enumerate() {
            let entity = graph.entity(object.entity())?;
            for attr in entity.associations() {
                let AttributeMapping::OwnerToOne(assoc) = attr else {
                    continue;
                };
                let Some(JoinStrategy::SourceColumns(columns)) = assoc.join_strategy() else {
                    continue;
                };
                let Some(FieldValue::One(Some(target))) = object.field(assoc.path()) else {
                    continue;
                };
                if let Some(&j) = index.get(&target) {
                    let nullable = columns.iter().all(|c| c.nullable);
                    orderer.add_dependency(i, j, assoc.path().clone(), nullable);
                }
            }
        }
        orderer.order_inserts()
    }

    /// Dependent-first order over the rows being deleted, using the
    /// references recorded at load time.
    fn delete_order(&self, graph: &MappingGraph, removed: &[ObjectRef]) -> Result<Vec<usize>> {
        let mut orderer = FlushOrderer::new();
        let mut index = HashMap::with_capacity(removed.len());
        for object in removed {
            index.insert(object.clone(), orderer.add_node(object.entity()));
        }
        for (i, object) in removed.iter().enumerate() {
            let instance = self.managed(object)?;
            let entity = graph.entity(instance.entity_name())?;
            for attr in entity.associations() {
                let path = attr.path();
                match (attr, attr.join_strategy()) {
                    (AttributeMapping::OwnerToOne(assoc), Some(JoinStrategy::SourceColumns(columns))) => {
                        let target = match (instance.snapshot().get(path), instance.lazy_key(path)) {
                            (Some(SnapshotValue::One(Some(target))), _) => Some(target.clone()),
                            (_, Some(LazyKey::ForeignKey(key))) => graph.get(assoc.target()).and_then(|t| {
                                self.identity.get(t.root(), &id_from_key(columns, t, key))
                            }),
                            _ => None,
                        };
                        if let Some(&j) = target.as_ref().and_then(|t| index.get(t)) {
                            orderer.add_dependency(i, j, path.clone(), true);
                        }
                    }
                    (AttributeMapping::OwnerToMany(_), Some(JoinStrategy::TargetColumns(_))) => {
                        let children = instance
                            .snapshot()
                            .get(path)
                            .map(SnapshotValue::references)
                            .unwrap_or_default();
                        for child in children {
                            if let Some(&j) = index.get(&child) {
                                orderer.add_dependency(j, i, path.clone(), true);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(orderer.order_deletes())
    }

    /// Flush, then end the unit of work.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<FlushResult> {
        let result = self.flush()?;
        if self.config.detach_on_commit {
            self.detach_all();
        }
        Ok(result)
    }

    /// Discard all in-memory tracking without writing anything.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(instances = self.instances.len(), "Rolling back persistence context");
        self.detach_all();
        Ok(())
    }

    /// Detach everything; every later call fails.
    pub fn close(&mut self) {
        self.detach_all();
        self.closed = true;
        tracing::debug!("Persistence context closed");
    }

    fn detach_all(&mut self) {
        self.instances.clear();
        self.identity.clear();
    }
}
