//! Resolved entity types and attribute mappings.

use crate::association::{AssociationMapping, Cardinality, JoinStrategy};
use crate::metadata::{FetchType, GenerationType};
use std::fmt;

/// Ordered attribute names from the root entity down to one attribute.
///
/// Embedded attributes produce multi-segment paths (`address.city`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// A top-level attribute.
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// Parse a dotted path.
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }

    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment; empty for an empty path.
    pub fn leaf(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Segments joined with `_`, used for conventional column names.
    pub fn column_prefix(&self) -> String {
        self.0.join("_")
    }

    pub fn starts_with(&self, prefix: &AttributePath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for AttributePath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

/// A physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicMapping {
    pub path: AttributePath,
    pub column: ColumnMapping,
    pub id: bool,
    pub version: bool,
    pub generation: GenerationType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedMapping {
    pub path: AttributePath,
    pub attributes: Vec<AttributeMapping>,
}

/// One attribute of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeMapping {
    Basic(BasicMapping),
    Embedded(EmbeddedMapping),
    OwnerToOne(AssociationMapping),
    OwnerToMany(AssociationMapping),
    InverseToOne(AssociationMapping),
    InverseToMany(AssociationMapping),
}

impl AttributeMapping {
    pub fn path(&self) -> &AttributePath {
        match self {
            AttributeMapping::Basic(b) => &b.path,
            AttributeMapping::Embedded(e) => &e.path,
            AttributeMapping::OwnerToOne(a)
            | AttributeMapping::OwnerToMany(a)
            | AttributeMapping::InverseToOne(a)
            | AttributeMapping::InverseToMany(a) => a.path(),
        }
    }

    /// Declaring attribute name.
    pub fn name(&self) -> &str {
        self.path().leaf()
    }

    /// Basic and embedded attributes are always fetched with their owner.
    pub fn fetch(&self) -> FetchType {
        self.association().map_or(FetchType::Eager, AssociationMapping::fetch)
    }

    pub fn association(&self) -> Option<&AssociationMapping> {
        match self {
            AttributeMapping::OwnerToOne(a)
            | AttributeMapping::OwnerToMany(a)
            | AttributeMapping::InverseToOne(a)
            | AttributeMapping::InverseToMany(a) => Some(a),
            _ => None,
        }
    }

    pub fn basic(&self) -> Option<&BasicMapping> {
        match self {
            AttributeMapping::Basic(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(
            self,
            AttributeMapping::OwnerToOne(_) | AttributeMapping::OwnerToMany(_)
        )
    }

    pub fn is_inverse(&self) -> bool {
        matches!(
            self,
            AttributeMapping::InverseToOne(_) | AttributeMapping::InverseToMany(_)
        )
    }

    pub fn cardinality(&self) -> Option<Cardinality> {
        match self {
            AttributeMapping::OwnerToOne(_) | AttributeMapping::InverseToOne(_) => {
                Some(Cardinality::One)
            }
            AttributeMapping::OwnerToMany(_) | AttributeMapping::InverseToMany(_) => {
                Some(Cardinality::Many)
            }
            _ => None,
        }
    }

    pub fn opposite(&self) -> Option<&AttributePath> {
        self.association().and_then(AssociationMapping::opposite)
    }

    pub fn join_strategy(&self) -> Option<&JoinStrategy> {
        self.association().and_then(AssociationMapping::join_strategy)
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a AttributeMapping>) {
        match self {
            AttributeMapping::Embedded(e) => {
                for attr in &e.attributes {
                    attr.collect_leaves(out);
                }
            }
            other => out.push(other),
        }
    }
}

/// Discriminator of a single-table hierarchy member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discriminator {
    pub column: String,
    /// Value identifying this concrete type.
    pub value: String,
}

/// A resolved entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) parent: Option<String>,
    pub(crate) root: String,
    pub(crate) subtypes: Vec<String>,
    pub(crate) discriminator: Option<Discriminator>,
    pub(crate) attributes: Vec<AttributeMapping>,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Root of the inheritance hierarchy (the entity itself when it has no parent).
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Every descendant type, transitively.
    pub fn subtypes(&self) -> &[String] {
        &self.subtypes
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    /// Top-level attributes, inherited ones first.
    pub fn attributes(&self) -> &[AttributeMapping] {
        &self.attributes
    }

    /// Basic and association mappings with embedded groups flattened out.
    pub fn leaves(&self) -> Vec<&AttributeMapping> {
        let mut out = Vec::new();
        for attr in &self.attributes {
            attr.collect_leaves(&mut out);
        }
        out
    }

    pub fn basics(&self) -> impl Iterator<Item = &BasicMapping> {
        self.leaves().into_iter().filter_map(AttributeMapping::basic)
    }

    /// Association mappings paired with their variant.
    pub fn associations(&self) -> Vec<&AttributeMapping> {
        self.leaves()
            .into_iter()
            .filter(|a| a.association().is_some())
            .collect()
    }

    /// Look up a mapping by path, descending into embedded groups.
    pub fn attribute(&self, path: &AttributePath) -> Option<&AttributeMapping> {
        let (last, init) = path.segments().split_last()?;
        let mut current = &self.attributes;
        for segment in init {
            match current.iter().find(|a| a.name() == segment)? {
                AttributeMapping::Embedded(e) => current = &e.attributes,
                _ => return None,
            }
        }
        current.iter().find(|a| a.name() == last)
    }

    pub fn association(&self, path: &AttributePath) -> Option<&AssociationMapping> {
        self.attribute(path).and_then(AttributeMapping::association)
    }

    /// Identifier mappings in declaration order.
    pub fn id_mappings(&self) -> Vec<&BasicMapping> {
        self.basics().filter(|b| b.id).collect()
    }

    pub fn id_columns(&self) -> Vec<&str> {
        self.basics()
            .filter(|b| b.id)
            .map(|b| b.column.name.as_str())
            .collect()
    }

    pub fn version_mapping(&self) -> Option<&BasicMapping> {
        self.basics().find(|b| b.version)
    }

    /// Generation strategy of the identifier.
    ///
    /// Composite identifiers are always assigned.
    pub fn generation(&self) -> GenerationType {
        match self.id_mappings().as_slice() {
            [single] => single.generation.clone(),
            _ => GenerationType::Assigned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let path = AttributePath::root("address").child("city");
        assert_eq!(path.to_string(), "address.city");
        assert_eq!(path.column_prefix(), "address_city");
        assert_eq!(path.leaf(), "city");
        assert_eq!(AttributePath::parse("address.city"), path);
        assert!(path.starts_with(&AttributePath::root("address")));
        assert!(!path.starts_with(&AttributePath::root("city")));
    }
}
