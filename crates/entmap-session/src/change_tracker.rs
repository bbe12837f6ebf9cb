//! Snapshot-based change detection.
//!
//! A [`Snapshot`] records, per leaf attribute path, what an instance looked
//! like when it was loaded or last flushed. Diffing the live object against it
//! yields a [`ChangeSet`]. Scalars are compared by value, references by
//! object identity.

use crate::object::{FieldValue, ObjectRef};
use entmap_core::Value;
use entmap_mapping::{AttributeMapping, AttributePath, EntityType};
use std::collections::{BTreeMap, HashSet};

/// Recorded state of one leaf attribute.
#[derive(Debug, Clone)]
pub enum SnapshotValue {
    Value(Value),
    One(Option<ObjectRef>),
    Many(Vec<ObjectRef>),
    /// The association was not loaded when the snapshot was taken.
    Unloaded,
}

impl SnapshotValue {
    fn of(field: Option<FieldValue>) -> Self {
        match field {
            Some(FieldValue::Value(v)) => SnapshotValue::Value(v),
            Some(FieldValue::One(obj)) => SnapshotValue::One(obj),
            Some(FieldValue::Many(objs)) => SnapshotValue::Many(objs),
            Some(FieldValue::Unloaded) => SnapshotValue::Unloaded,
            Some(FieldValue::Embedded(_)) | None => SnapshotValue::Value(Value::Null),
        }
    }

    pub fn references(&self) -> Vec<ObjectRef> {
        match self {
            SnapshotValue::One(Some(obj)) => vec![obj.clone()],
            SnapshotValue::Many(objs) => objs.clone(),
            _ => Vec::new(),
        }
    }
}

/// Per-path state of an instance at its last synchronisation point.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<AttributePath, SnapshotValue>,
}

impl Snapshot {
    /// An empty snapshot; every populated field of the object diffs as new.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Record every leaf of `entity` as currently held by `object`.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %entity.name()))]
    pub fn capture(object: &ObjectRef, entity: &EntityType) -> Self {
        let entries = entity
            .leaves()
            .into_iter()
            .map(|leaf| {
                let path = leaf.path().clone();
                let value = SnapshotValue::of(object.field(&path));
                (path, value)
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, path: &AttributePath) -> Option<&SnapshotValue> {
        self.entries.get(path)
    }

    /// Re-baseline a single path.
    pub fn record(&mut self, path: AttributePath, value: SnapshotValue) {
        self.entries.insert(path, value);
    }

    /// Re-baseline a single path from the object's current field.
    pub fn record_current(&mut self, object: &ObjectRef, path: &AttributePath) {
        self.entries
            .insert(path.clone(), SnapshotValue::of(object.field(path)));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compare `object` with this snapshot.
    ///
    /// Paths in `forced` are reported even when unchanged.
    pub fn diff(
        &self,
        object: &ObjectRef,
        entity: &EntityType,
        forced: &HashSet<AttributePath>,
    ) -> ChangeSet {
        let mut changes = Vec::new();
        for leaf in entity.leaves() {
            let path = leaf.path();
            let current = object.field(path);
            let recorded = self.entries.get(path);
            let force = forced.contains(path);
            let change = match leaf {
                AttributeMapping::Basic(_) => scalar_change(path, current, recorded, force),
                _ => {
                    let positional = leaf.association().is_some_and(|a| a.order_column().is_some());
                    association_change(path, current, recorded, force, positional)
                }
            };
            changes.extend(change);
        }
        ChangeSet { changes }
    }
}

fn scalar_change(
    path: &AttributePath,
    current: Option<FieldValue>,
    recorded: Option<&SnapshotValue>,
    force: bool,
) -> Option<Change> {
    let new = current
        .and_then(|f| f.as_value().cloned())
        .unwrap_or(Value::Null);
    let old = match recorded {
        Some(SnapshotValue::Value(v)) => Some(v.clone()),
        _ => None,
    };
    let changed = match &old {
        Some(old) => !old.matches(&new),
        None => !new.is_null(),
    };
    (changed || force).then(|| Change::Scalar {
        path: path.clone(),
        old,
        new,
    })
}

fn dedup(objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
    let mut seen = HashSet::new();
    objects.into_iter().filter(|o| seen.insert(o.clone())).collect()
}

fn association_change(
    path: &AttributePath,
    current: Option<FieldValue>,
    recorded: Option<&SnapshotValue>,
    force: bool,
    positional: bool,
) -> Option<Change> {
    match current {
        None | Some(FieldValue::Unloaded) => None,
        Some(FieldValue::One(new)) => {
            let old = match recorded {
                Some(SnapshotValue::One(old)) => old.clone(),
                _ => None,
            };
            let same = match (&old, &new) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            };
            // An unloaded baseline means the original target is unknown.
            let unknown = matches!(recorded, Some(SnapshotValue::Unloaded));
            (!same || force || (unknown && new.is_some())).then(|| Change::One {
                path: path.clone(),
                old,
                new,
            })
        }
        Some(FieldValue::Many(now)) => {
            let now = dedup(now);
            let before = match recorded {
                Some(SnapshotValue::Many(before)) => dedup(before.clone()),
                _ => Vec::new(),
            };
            let before_set: HashSet<&ObjectRef> = before.iter().collect();
            let now_set: HashSet<&ObjectRef> = now.iter().collect();
            let added: Vec<ObjectRef> = now
                .iter()
                .filter(|o| !before_set.contains(o))
                .cloned()
                .collect();
            let removed: Vec<ObjectRef> = before
                .iter()
                .filter(|o| !now_set.contains(o))
                .cloned()
                .collect();
            let reordered = positional && {
                let kept_before: Vec<&ObjectRef> =
                    before.iter().filter(|o| now_set.contains(o)).collect();
                let kept_now: Vec<&ObjectRef> =
                    now.iter().filter(|o| before_set.contains(o)).collect();
                kept_before != kept_now
            };
            (!added.is_empty() || !removed.is_empty() || reordered || force).then(|| {
                Change::Many {
                    path: path.clone(),
                    added,
                    removed,
                    reordered,
                }
            })
        }
        Some(FieldValue::Value(_) | FieldValue::Embedded(_)) => None,
    }
}

/// One changed leaf attribute.
#[derive(Debug, Clone)]
pub enum Change {
    Scalar {
        path: AttributePath,
        /// `None` when the snapshot holds no value for the path
        old: Option<Value>,
        new: Value,
    },
    One {
        path: AttributePath,
        old: Option<ObjectRef>,
        new: Option<ObjectRef>,
    },
    Many {
        path: AttributePath,
        added: Vec<ObjectRef>,
        removed: Vec<ObjectRef>,
        /// Elements kept in a positional collection changed their order
        reordered: bool,
    },
}

impl Change {
    pub fn path(&self) -> &AttributePath {
        match self {
            Change::Scalar { path, .. } | Change::One { path, .. } | Change::Many { path, .. } => {
                path
            }
        }
    }

    /// Objects no longer referenced through this path.
    pub fn dropped(&self) -> Vec<ObjectRef> {
        match self {
            Change::One { old: Some(old), new, .. } => {
                if new.as_ref().is_some_and(|n| n.ptr_eq(old)) {
                    Vec::new()
                } else {
                    vec![old.clone()]
                }
            }
            Change::Many { removed, .. } => removed.clone(),
            _ => Vec::new(),
        }
    }
}

/// Every change of one instance since its snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn get(&self, path: &AttributePath) -> Option<&Change> {
        self.changes.iter().find(|c| c.path() == path)
    }

    pub fn paths(&self) -> Vec<&AttributePath> {
        self.changes.iter().map(Change::path).collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
