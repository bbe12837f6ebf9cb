//! Row-level statement emission.
//!
//! The [`Emitter`] turns one managed instance and its change set into
//! [`RowOperation`]s: the base-table insert, update or delete, join-table row
//! maintenance and target-row foreign-key updates. Operations are executed
//! against a [`RowSource`] and render to parameterised SQL for logging.

use crate::change_tracker::{Change, ChangeSet};
use crate::managed::ManagedInstance;
use crate::object::{FieldValue, ObjectRef};
use entmap_core::{ColumnValues, InsertResult, Result, RowSource, TypeError, Value, quote_ident};
use entmap_mapping::{
    AssociationMapping, AttributeMapping, AttributePath, EntityType, GenerationType, JoinColumn,
    JoinStrategy, JoinTable, MappingGraph,
};
use std::collections::HashSet;
use std::fmt;

/// One row-level write.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOperation {
    Insert {
        table: String,
        values: ColumnValues,
    },
    Update {
        table: String,
        values: ColumnValues,
        predicate: ColumnValues,
    },
    Delete {
        table: String,
        predicate: ColumnValues,
    },
}

impl RowOperation {
    pub fn table(&self) -> &str {
        match self {
            RowOperation::Insert { table, .. }
            | RowOperation::Update { table, .. }
            | RowOperation::Delete { table, .. } => table,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, RowOperation::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RowOperation::Delete { .. })
    }

    /// ANSI SQL with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        let mut param = 0;
        let mut next = || {
            param += 1;
            format!("${}", param)
        };
        match self {
            RowOperation::Insert { table, values } => {
                if values.is_empty() {
                    return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
                }
                let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
                let params: Vec<String> = values.iter().map(|_| next()).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(table),
                    columns.join(", "),
                    params.join(", ")
                )
            }
            RowOperation::Update {
                table,
                values,
                predicate,
            } => {
                let set: Vec<String> = values
                    .iter()
                    .map(|(c, _)| format!("{} = {}", quote_ident(c), next()))
                    .collect();
                format!(
                    "UPDATE {} SET {}{}",
                    quote_ident(table),
                    set.join(", "),
                    where_clause(predicate, &mut next)
                )
            }
            RowOperation::Delete { table, predicate } => format!(
                "DELETE FROM {}{}",
                quote_ident(table),
                where_clause(predicate, &mut next)
            ),
        }
    }

    /// Bound parameters in placeholder order.
    pub fn params(&self) -> Vec<&Value> {
        match self {
            RowOperation::Insert { values, .. } => values.iter().map(|(_, v)| v).collect(),
            RowOperation::Update {
                values, predicate, ..
            } => values
                .iter()
                .map(|(_, v)| v)
                .chain(predicate.iter().map(|(_, v)| v).filter(|v| !v.is_null()))
                .collect(),
            RowOperation::Delete { predicate, .. } => predicate
                .iter()
                .map(|(_, v)| v)
                .filter(|v| !v.is_null())
                .collect(),
        }
    }

    /// Run against `rows`. Updates and deletes report their affected count.
    pub fn execute<R: RowSource + ?Sized>(&self, rows: &R) -> Result<InsertResult> {
        tracing::trace!(sql = %self, "Executing row operation");
        match self {
            RowOperation::Insert { table, values } => rows.execute_insert(table, values),
            RowOperation::Update {
                table,
                values,
                predicate,
            } => rows
                .execute_update(table, values, predicate)
                .map(InsertResult::affected),
            RowOperation::Delete { table, predicate } => rows
                .execute_delete(table, predicate)
                .map(InsertResult::affected),
        }
    }
}

fn where_clause(predicate: &ColumnValues, next: &mut impl FnMut() -> String) -> String {
    if predicate.is_empty() {
        return String::new();
    }
    let terms: Vec<String> = predicate
        .iter()
        .map(|(c, v)| {
            if v.is_null() {
                format!("{} IS NULL", quote_ident(c))
            } else {
                format!("{} = {}", quote_ident(c), next())
            }
        })
        .collect();
    format!(" WHERE {}", terms.join(" AND "))
}

impl fmt::Display for RowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// A base-table update plus the version value it writes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub operation: RowOperation,
    /// Version attribute and its bumped value, for versioned entities
    pub version: Option<(AttributePath, Value)>,
}

/// Emits row operations for instances of one mapping graph.
#[derive(Debug, Clone, Copy)]
pub struct Emitter<'g> {
    graph: &'g MappingGraph,
    initial_version: i64,
}

impl<'g> Emitter<'g> {
    pub fn new(graph: &'g MappingGraph, initial_version: i64) -> Self {
        Self {
            graph,
            initial_version,
        }
    }

    /// Type used to read identifier columns off a referenced object.
    fn type_of<'a>(&'a self, object: &ObjectRef, declared: &'a str) -> Option<&'a EntityType> {
        self.graph
            .get(object.entity())
            .or_else(|| self.graph.get(declared))
    }

    /// Values of the identifier columns `columns` point at, read off `target`.
    fn referenced_values(
        &self,
        columns: &[JoinColumn],
        target: &ObjectRef,
        declared: &str,
    ) -> Vec<Value> {
        let target_type = self.type_of(target, declared);
        columns
            .iter()
            .map(|jc| {
                target_type
                    .and_then(|t| t.basics().find(|b| b.column.name == jc.referenced_column))
                    .map_or(Value::Null, |b| target.value_at(&b.path))
            })
            .collect()
    }

    fn foreign_key(
        &self,
        columns: &[JoinColumn],
        target: Option<&ObjectRef>,
        declared: &str,
    ) -> ColumnValues {
        let values = match target {
            Some(target) => self.referenced_values(columns, target, declared),
            None => vec![Value::Null; columns.len()],
        };
        columns.iter().map(|jc| jc.column.clone()).zip(values).collect()
    }

    /// Identifier columns of `entity` with the values `object` holds.
    pub fn id_predicate(&self, entity: &EntityType, object: &ObjectRef) -> ColumnValues {
        entity
            .id_mappings()
            .into_iter()
            .map(|id| (id.column.name.clone(), object.value_at(&id.path)))
            .collect()
    }

    /// Base-table insert of a new instance.
    ///
    /// An IDENTITY identifier still unset is left to the store. Foreign keys
    /// whose path `deferred` accepts are written as NULL.
    pub fn insert(
        &self,
        entity: &EntityType,
        object: &ObjectRef,
        deferred: impl Fn(&AttributePath) -> bool,
    ) -> RowOperation {
        let identity = entity.generation() == GenerationType::Identity;
        let mut values = ColumnValues::new();
        for leaf in entity.leaves() {
            match leaf {
                AttributeMapping::Basic(basic) if basic.column.insertable => {
                    let value = object.value_at(&basic.path);
                    if basic.id && identity && value.is_null() {
                        continue;
                    }
                    values.push((basic.column.name.clone(), value));
                }
                AttributeMapping::OwnerToOne(assoc) => {
                    let Some(JoinStrategy::SourceColumns(columns)) = assoc.join_strategy() else {
                        continue;
                    };
                    let target = if deferred(assoc.path()) {
                        None
                    } else {
                        reference(object, assoc.path())
                    };
                    let fk = self.foreign_key(columns, target.as_ref(), assoc.target());
                    values.extend(
                        fk.into_iter()
                            .zip(columns)
                            .filter(|(_, jc)| jc.insertable)
                            .map(|(pair, _)| pair),
                    );
                }
                _ => {}
            }
        }
        if let Some(discriminator) = entity.discriminator() {
            values.push((
                discriminator.column.clone(),
                Value::Text(discriminator.value.clone()),
            ));
        }
        RowOperation::Insert {
            table: entity.table().to_string(),
            values,
        }
    }

    /// Base-table update for the changed scalars and to-one foreign keys.
    ///
    /// `None` when no updatable column changed. The row is addressed by the
    /// identifier it was loaded with. Fails when the version cannot be
    /// incremented.
    pub fn update(
        &self,
        entity: &EntityType,
        instance: &ManagedInstance,
        changes: &ChangeSet,
    ) -> Result<Option<PlannedUpdate>> {
        let object = instance.object();
        let mut values = ColumnValues::new();
        for change in changes {
            match (entity.attribute(change.path()), change) {
                (Some(AttributeMapping::Basic(basic)), Change::Scalar { new, .. })
                    if basic.column.updatable && !basic.id && !basic.version =>
                {
                    values.push((basic.column.name.clone(), new.clone()));
                }
                (Some(AttributeMapping::OwnerToOne(assoc)), Change::One { new, .. }) => {
                    if let Some(JoinStrategy::SourceColumns(columns)) = assoc.join_strategy() {
                        let fk = self.foreign_key(columns, new.as_ref(), assoc.target());
                        values.extend(
                            fk.into_iter()
                                .zip(columns)
                                .filter(|(_, jc)| jc.updatable)
                                .map(|(pair, _)| pair),
                        );
                    }
                }
                _ => {}
            }
        }
        if values.is_empty() {
            return Ok(None);
        }

        let mut predicate = self.snapshot_id_predicate(entity, instance);
        let mut version = None;
        if let Some(vm) = entity.version_mapping() {
            let current = instance.snapshot_value(&vm.path).unwrap_or(Value::Null);
            let Some(next) = current.next_version(self.initial_version) else {
                return Err(TypeError {
                    expected: "an integer version below its type's maximum",
                    actual: format!("{current:?}"),
                    column: Some(vm.column.name.clone()),
                }
                .into());
            };
            values.push((vm.column.name.clone(), next.clone()));
            predicate.push((vm.column.name.clone(), current));
            version = Some((vm.path.clone(), next));
        }

        Ok(Some(PlannedUpdate {
            operation: RowOperation::Update {
                table: entity.table().to_string(),
                values,
                predicate,
            },
            version,
        }))
    }

    /// Identifier columns of a managed instance with the values it was loaded
    /// or last flushed with.
    fn snapshot_id_predicate(&self, entity: &EntityType, instance: &ManagedInstance) -> ColumnValues {
        entity
            .id_mappings()
            .into_iter()
            .map(|id| (id.column.name.clone(), instance.snapshot_id_value(&id.path)))
            .collect()
    }

    /// Base-table delete, version checked against the snapshot.
    pub fn delete(&self, entity: &EntityType, instance: &ManagedInstance) -> RowOperation {
        let object = instance.object();
        let mut predicate = self.snapshot_id_predicate(entity, instance);
        if let Some(vm) = entity.version_mapping() {
            let version = instance
                .snapshot_value(&vm.path)
                .unwrap_or_else(|| object.value_at(&vm.path));
            predicate.push((vm.column.name.clone(), version));
        }
        RowOperation::Delete {
            table: entity.table().to_string(),
            predicate,
        }
    }

    /// Follow-up update setting a foreign key inserted as NULL.
    pub fn link_update(
        &self,
        entity: &EntityType,
        object: &ObjectRef,
        path: &AttributePath,
    ) -> Option<RowOperation> {
        let assoc = entity.association(path)?;
        let columns = assoc.join_strategy()?.source_columns()?;
        let target = reference(object, path)?;
        Some(RowOperation::Update {
            table: entity.table().to_string(),
            values: self.foreign_key(columns, Some(&target), assoc.target()),
            predicate: self.id_predicate(entity, object),
        })
    }

    fn join_row(
        &self,
        table: &JoinTable,
        owner: &ObjectRef,
        owner_type: &EntityType,
        target: &ObjectRef,
        target_type: &str,
    ) -> ColumnValues {
        let owner_values = self.referenced_values(&table.owner_columns, owner, owner_type.name());
        let target_values = self.referenced_values(&table.inverse_columns, target, target_type);
        table
            .columns()
            .map(|jc| jc.column.clone())
            .zip(owner_values.into_iter().chain(target_values))
            .collect()
    }

    /// Join-table and target-row maintenance for the owning associations in
    /// `changes`. Removals are emitted before additions; untouched elements
    /// produce nothing.
    pub fn association_rows(
        &self,
        entity: &EntityType,
        object: &ObjectRef,
        changes: &ChangeSet,
    ) -> Vec<RowOperation> {
        let mut ops = Vec::new();
        for change in changes {
            let Some(attr) = entity.attribute(change.path()) else {
                continue;
            };
            if !attr.is_owner() {
                continue;
            }
            let Some(assoc) = attr.association() else {
                continue;
            };
            let (removed, added): (Vec<ObjectRef>, Vec<ObjectRef>) = match change {
                Change::Many { added, removed, .. } => (removed.clone(), added.clone()),
                Change::One { old, new, .. } => {
                    (old.iter().cloned().collect(), new.iter().cloned().collect())
                }
                Change::Scalar { .. } => continue,
            };
            if let Some(column) = assoc.order_column() {
                self.positional_rows(&mut ops, entity, object, change, assoc, column);
                continue;
            }
            match assoc.join_strategy() {
                Some(JoinStrategy::JoinTable(table)) => {
                    for target in &removed {
                        ops.push(RowOperation::Delete {
                            table: table.name.clone(),
                            predicate: self.join_row(table, object, entity, target, assoc.target()),
                        });
                    }
                    for target in &added {
                        ops.push(RowOperation::Insert {
                            table: table.name.clone(),
                            values: self.join_row(table, object, entity, target, assoc.target()),
                        });
                    }
                }
                Some(JoinStrategy::TargetColumns(columns)) => {
                    let Some(target_type) = self.graph.get(assoc.target()) else {
                        continue;
                    };
                    for (target, owner) in removed
                        .iter()
                        .map(|t| (t, None))
                        .chain(added.iter().map(|t| (t, Some(object))))
                    {
                        let values = match owner {
                            Some(owner) => self.foreign_key(columns, Some(owner), entity.name()),
                            None => self.foreign_key(columns, None, entity.name()),
                        };
                        let target_type = self.type_of(target, target_type.name()).unwrap_or(target_type);
                        ops.push(RowOperation::Update {
                            table: target_type.table().to_string(),
                            values,
                            predicate: self.id_predicate(target_type, target),
                        });
                    }
                }
                _ => {}
            }
        }
        ops
    }

    /// Rows of a collection whose element positions live in `column`.
    ///
    /// Elements appended at the end get their positions written. Any other
    /// change rewrites every position: the owner's join rows are replaced,
    /// or every target row is updated.
    fn positional_rows(
        &self,
        ops: &mut Vec<RowOperation>,
        entity: &EntityType,
        object: &ObjectRef,
        change: &Change,
        assoc: &AssociationMapping,
        column: &str,
    ) {
        let Change::Many {
            added,
            removed,
            reordered,
            ..
        } = change
        else {
            return;
        };
        let mut seen = HashSet::new();
        let current: Vec<ObjectRef> = object
            .field(change.path())
            .map(|f| f.references())
            .unwrap_or_default()
            .into_iter()
            .filter(|o| seen.insert(o.clone()))
            .collect();
        let kept = current.len().saturating_sub(added.len());
        let appended = !reordered
            && removed.is_empty()
            && current.iter().skip(kept).all(|o| added.contains(o));
        let first = if appended { kept } else { 0 };
        let positioned = current.iter().enumerate().skip(first);

        match assoc.join_strategy() {
            Some(JoinStrategy::JoinTable(table)) => {
                if !appended {
                    ops.push(RowOperation::Delete {
                        table: table.name.clone(),
                        predicate: self.key_of(&table.owner_columns, object, entity.name()),
                    });
                }
                for (index, target) in positioned {
                    let mut values = self.join_row(table, object, entity, target, assoc.target());
                    values.push((column.to_string(), position(index)));
                    ops.push(RowOperation::Insert {
                        table: table.name.clone(),
                        values,
                    });
                }
            }
            Some(JoinStrategy::TargetColumns(columns)) => {
                let Some(declared) = self.graph.get(assoc.target()) else {
                    return;
                };
                let detached = removed.iter().map(|t| (t, None, Value::Null));
                let placed = positioned.map(|(i, t)| (t, Some(object), position(i)));
                for (target, owner, at) in detached.chain(placed) {
                    let mut values = self.foreign_key(columns, owner, entity.name());
                    values.push((column.to_string(), at));
                    let target_type = self.type_of(target, declared.name()).unwrap_or(declared);
                    ops.push(RowOperation::Update {
                        table: target_type.table().to_string(),
                        values,
                        predicate: self.id_predicate(target_type, target),
                    });
                }
            }
            _ => {}
        }
    }

    /// `columns` paired with the identifier values of `object` they reference.
    fn key_of(&self, columns: &[JoinColumn], object: &ObjectRef, declared: &str) -> ColumnValues {
        let values = self.referenced_values(columns, object, declared);
        columns.iter().map(|jc| jc.column.clone()).zip(values).collect()
    }

    /// Rows referencing a removed instance that must go before its own row:
    /// join rows on either side and nullable target-row foreign keys.
    pub fn cleanup_rows(&self, entity: &EntityType, object: &ObjectRef) -> Vec<RowOperation> {
        let mut ops = Vec::new();
        for attr in entity.associations() {
            let Some(assoc) = attr.association() else {
                continue;
            };
            let Some((_, owning)) = self.graph.owning_side(entity, assoc) else {
                continue;
            };
            match owning.join_strategy() {
                Some(JoinStrategy::JoinTable(table)) => {
                    let columns = if attr.is_owner() {
                        &table.owner_columns
                    } else {
                        &table.inverse_columns
                    };
                    ops.push(RowOperation::Delete {
                        table: table.name.clone(),
                        predicate: self.key_of(columns, object, entity.name()),
                    });
                }
                Some(JoinStrategy::TargetColumns(columns))
                    if attr.is_owner() && columns.iter().all(|jc| jc.nullable) =>
                {
                    let Some(target_type) = self.graph.get(assoc.target()) else {
                        continue;
                    };
                    ops.push(RowOperation::Update {
                        table: target_type.table().to_string(),
                        values: self.foreign_key(columns, None, entity.name()),
                        predicate: self.foreign_key(columns, Some(object), entity.name()),
                    });
                }
                _ => {}
            }
        }
        ops
    }
}

/// Stored position of the element at `index`.
fn position(index: usize) -> Value {
    Value::Int(i32::try_from(index).unwrap_or(i32::MAX))
}

/// The object a to-one field currently points at.
fn reference(object: &ObjectRef, path: &AttributePath) -> Option<ObjectRef> {
    match object.field(path) {
        Some(FieldValue::One(target)) => target,
        _ => None,
    }
}
