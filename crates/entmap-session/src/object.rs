//! Type-erased application objects.
//!
//! Entities are described by metadata records rather than Rust types, so the
//! objects a persistence context manages are dynamic: an entity name plus a
//! tree of named fields. [`ObjectRef`] is the shared handle applications hold.
//! Two handles are the same object exactly when they point at the same
//! allocation; that is the identity the context's bookkeeping relies on.

use entmap_core::Value;
use entmap_mapping::AttributePath;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Named fields of an object or of an embedded value.
pub type Fields = BTreeMap<String, FieldValue>;

/// The value held by one field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// A scalar
    Value(Value),
    /// An embedded value object
    Embedded(Fields),
    /// A to-one reference
    One(Option<ObjectRef>),
    /// A to-many collection
    Many(Vec<ObjectRef>),
    /// An association that has not been loaded yet
    Unloaded,
}

impl FieldValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Objects referenced by an association field.
    pub fn references(&self) -> Vec<ObjectRef> {
        match self {
            FieldValue::One(Some(obj)) => vec![obj.clone()],
            FieldValue::Many(objs) => objs.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_unloaded(&self) -> bool {
        matches!(self, FieldValue::Unloaded)
    }
}

macro_rules! scalar_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::Value(value.into())
                }
            }
        )*
    };
}

scalar_field!(Value, bool, i32, i64, f64, String, &str, Vec<u8>);

impl From<Option<ObjectRef>> for FieldValue {
    fn from(value: Option<ObjectRef>) -> Self {
        FieldValue::One(value)
    }
}

impl From<ObjectRef> for FieldValue {
    fn from(value: ObjectRef) -> Self {
        FieldValue::One(Some(value))
    }
}

impl From<Vec<ObjectRef>> for FieldValue {
    fn from(value: Vec<ObjectRef>) -> Self {
        FieldValue::Many(value)
    }
}

/// Shared state behind an [`ObjectRef`].
#[derive(Debug)]
pub struct EntityObject {
    entity: String,
    fields: RwLock<Fields>,
}

/// Shared handle to an application object.
#[derive(Clone)]
pub struct ObjectRef(Arc<EntityObject>);

impl ObjectRef {
    /// An empty object of the named entity type.
    pub fn new(entity: impl Into<String>) -> Self {
        Self(Arc::new(EntityObject {
            entity: entity.into(),
            fields: RwLock::new(Fields::new()),
        }))
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(self, path: &str, value: impl Into<FieldValue>) -> Self {
        self.set(path, value);
        self
    }

    /// Name of the entity type this object is an instance of.
    pub fn entity(&self) -> &str {
        &self.0.entity
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn fields(&self) -> RwLockReadGuard<'_, Fields> {
        self.0.fields.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fields_mut(&self) -> RwLockWriteGuard<'_, Fields> {
        self.0.fields.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Field at a dotted path.
    pub fn get(&self, path: &str) -> Option<FieldValue> {
        self.field(&AttributePath::parse(path))
    }

    /// Scalar at a dotted path; `Null` when absent or not a scalar.
    pub fn value(&self, path: &str) -> Value {
        self.value_at(&AttributePath::parse(path))
    }

    /// The object referenced by a to-one field.
    pub fn one(&self, path: &str) -> Option<ObjectRef> {
        match self.get(path) {
            Some(FieldValue::One(obj)) => obj,
            _ => None,
        }
    }

    /// The elements of a to-many field; empty when unloaded.
    pub fn many(&self, path: &str) -> Vec<ObjectRef> {
        match self.get(path) {
            Some(FieldValue::Many(objs)) => objs,
            _ => Vec::new(),
        }
    }

    pub fn set(&self, path: &str, value: impl Into<FieldValue>) {
        self.set_field(&AttributePath::parse(path), value.into());
    }

    /// Append to a to-many field, starting a collection if needed.
    pub fn push(&self, path: &str, element: ObjectRef) {
        let path = AttributePath::parse(path);
        let mut fields = self.fields_mut();
        let slot = slot_mut(&mut fields, &path);
        match slot {
            FieldValue::Many(elements) => elements.push(element),
            other => *other = FieldValue::Many(vec![element]),
        }
    }

    /// Remove every occurrence of `element` from a to-many field.
    ///
    /// Returns whether anything was removed.
    pub fn remove_from(&self, path: &str, element: &ObjectRef) -> bool {
        let path = AttributePath::parse(path);
        let mut fields = self.fields_mut();
        match slot_mut(&mut fields, &path) {
            FieldValue::Many(elements) => {
                let before = elements.len();
                elements.retain(|e| !e.ptr_eq(element));
                elements.len() != before
            }
            _ => false,
        }
    }

    pub fn field(&self, path: &AttributePath) -> Option<FieldValue> {
        lookup(&self.fields(), path).cloned()
    }

    pub fn value_at(&self, path: &AttributePath) -> Value {
        match lookup(&self.fields(), path) {
            Some(FieldValue::Value(v)) => v.clone(),
            _ => Value::Null,
        }
    }

    pub fn set_field(&self, path: &AttributePath, value: FieldValue) {
        let mut fields = self.fields_mut();
        *slot_mut(&mut fields, path) = value;
    }

    /// Scalar fields as JSON; references are rendered by entity name.
    pub fn to_json(&self) -> serde_json::Value {
        fields_to_json(&self.fields())
    }
}

fn fields_to_json(fields: &Fields) -> serde_json::Value {
    let map = fields
        .iter()
        .map(|(name, field)| {
            let json = match field {
                FieldValue::Value(v) => serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                FieldValue::Embedded(inner) => fields_to_json(inner),
                FieldValue::One(Some(obj)) => serde_json::Value::String(obj.entity().to_string()),
                FieldValue::One(None) | FieldValue::Unloaded => serde_json::Value::Null,
                FieldValue::Many(objs) => serde_json::Value::Array(
                    objs.iter()
                        .map(|o| serde_json::Value::String(o.entity().to_string()))
                        .collect(),
                ),
            };
            (name.clone(), json)
        })
        .collect();
    serde_json::Value::Object(map)
}

fn lookup<'a>(fields: &'a Fields, path: &AttributePath) -> Option<&'a FieldValue> {
    let (last, init) = path.segments().split_last()?;
    let mut current = fields;
    for segment in init {
        match current.get(segment)? {
            FieldValue::Embedded(inner) => current = inner,
            _ => return None,
        }
    }
    current.get(last)
}

/// The slot at `path`, creating embedded maps on the way.
///
/// A non-embedded value sitting where an embedded map is needed is replaced.
fn slot_mut<'a>(fields: &'a mut Fields, path: &AttributePath) -> &'a mut FieldValue {
    let segments = path.segments();
    let mut current = fields;
    for segment in &segments[..segments.len().saturating_sub(1)] {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| FieldValue::Embedded(Fields::new()));
        if !matches!(entry, FieldValue::Embedded(_)) {
            *entry = FieldValue::Embedded(Fields::new());
        }
        current = match entry {
            FieldValue::Embedded(inner) => inner,
            _ => unreachable!("slot was just replaced with an embedded map"),
        };
    }
    let last = segments.last().cloned().unwrap_or_default();
    current
        .entry(last)
        .or_insert(FieldValue::Value(Value::Null))
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for ObjectRef {
    // Objects reference each other; printing fields could recurse forever.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}@{:p})", self.0.entity, Arc::as_ptr(&self.0))
    }
}
