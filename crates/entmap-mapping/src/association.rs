//! Resolved association mappings and their join strategies.

use crate::entity::AttributePath;
use crate::metadata::{AssociationKind, CascadeType, FetchType, JoinColumnMetadata, JoinTableMetadata};
use entmap_core::{MappingError, MappingErrorKind, Result};
use std::fmt;
use std::sync::OnceLock;

/// Number of related instances on the declaring side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// Set of cascaded operations.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CascadeSet(u8);

impl CascadeSet {
    const PERSIST: u8 = 1;
    const MERGE: u8 = 1 << 1;
    const REMOVE: u8 = 1 << 2;
    const REFRESH: u8 = 1 << 3;
    const DETACH: u8 = 1 << 4;

    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(Self::PERSIST | Self::MERGE | Self::REMOVE | Self::REFRESH | Self::DETACH)
    }

    const fn bit(cascade: CascadeType) -> u8 {
        match cascade {
            CascadeType::All => Self::all().0,
            CascadeType::Persist => Self::PERSIST,
            CascadeType::Merge => Self::MERGE,
            CascadeType::Remove => Self::REMOVE,
            CascadeType::Refresh => Self::REFRESH,
            CascadeType::Detach => Self::DETACH,
        }
    }

    /// Build from declared cascade types, expanding `ALL`.
    pub fn from_types(types: &[CascadeType]) -> Self {
        Self(types.iter().fold(0, |acc, t| acc | Self::bit(*t)))
    }

    pub const fn contains(self, cascade: CascadeType) -> bool {
        let bit = Self::bit(cascade);
        self.0 & bit == bit
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CascadeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (CascadeType::Persist, "PERSIST"),
            (CascadeType::Merge, "MERGE"),
            (CascadeType::Remove, "REMOVE"),
            (CascadeType::Refresh, "REFRESH"),
            (CascadeType::Detach, "DETACH"),
        ];
        f.debug_set()
            .entries(names.iter().filter(|(c, _)| self.contains(*c)).map(|(_, n)| n))
            .finish()
    }
}

/// One foreign-key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinColumn {
    /// Column holding the reference
    pub column: String,
    /// Identifier column it points at
    pub referenced_column: String,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
}

impl JoinColumn {
    pub fn new(column: impl Into<String>, referenced_column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            referenced_column: referenced_column.into(),
            nullable: true,
            insertable: true,
            updatable: true,
        }
    }
}

/// An auxiliary FK-only table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub name: String,
    /// Columns referencing the owning entity's identifier
    pub owner_columns: Vec<JoinColumn>,
    /// Columns referencing the target entity's identifier
    pub inverse_columns: Vec<JoinColumn>,
}

impl JoinTable {
    /// Every column of the table, owner columns first.
    pub fn columns(&self) -> impl Iterator<Item = &JoinColumn> {
        self.owner_columns.iter().chain(&self.inverse_columns)
    }
}

/// How an association is represented in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStrategy {
    /// Foreign key columns in the source table.
    SourceColumns(Vec<JoinColumn>),
    /// Foreign key columns in the target table pointing back at the source.
    TargetColumns(Vec<JoinColumn>),
    JoinTable(JoinTable),
    /// No join metadata; the opposite side owns the relationship.
    Inverse,
}

impl JoinStrategy {
    pub fn source_columns(&self) -> Option<&[JoinColumn]> {
        match self {
            JoinStrategy::SourceColumns(columns) => Some(columns),
            _ => None,
        }
    }

    pub fn join_table(&self) -> Option<&JoinTable> {
        match self {
            JoinStrategy::JoinTable(table) => Some(table),
            _ => None,
        }
    }
}

/// One sort key of an ordered collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    /// Attribute path on the target entity
    pub path: AttributePath,
    pub descending: bool,
}

/// How the elements of a collection are arranged when loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOrder {
    /// By target attribute values. No keys means by the target identifier.
    By(Vec<OrderKey>),
    /// By a position column written on flush.
    Column(String),
}

impl CollectionOrder {
    /// Parse an `OrderBy` list such as `"title, published DESC"`.
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let mut keys = Vec::new();
        for item in spec.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let mut words = item.split_whitespace();
            let (Some(path), direction, None) = (words.next(), words.next(), words.next()) else {
                return Err(format!("cannot parse order item '{item}'"));
            };
            let descending = match direction {
                None => false,
                Some(d) if d.eq_ignore_ascii_case("asc") => false,
                Some(d) if d.eq_ignore_ascii_case("desc") => true,
                Some(d) => return Err(format!("unknown sort direction '{d}'")),
            };
            keys.push(OrderKey {
                path: AttributePath::parse(path),
                descending,
            });
        }
        Ok(CollectionOrder::By(keys))
    }
}

/// Join metadata as declared, after precedence has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeclaredJoin {
    Columns(Vec<JoinColumnMetadata>),
    Table(JoinTableMetadata),
    Convention,
}

/// A resolved association.
///
/// The join strategy and the opposite side are filled in by the link phase
/// exactly once; both are readable through `&self` afterwards.
#[derive(Debug, Clone)]
pub struct AssociationMapping {
    pub(crate) path: AttributePath,
    pub(crate) kind: AssociationKind,
    pub(crate) target: String,
    pub(crate) fetch: FetchType,
    pub(crate) cascades: CascadeSet,
    pub(crate) orphan_removal: bool,
    pub(crate) mapped_by: Option<String>,
    pub(crate) order: Option<CollectionOrder>,
    pub(crate) declared: DeclaredJoin,
    pub(crate) join: OnceLock<JoinStrategy>,
    pub(crate) opposite: OnceLock<Option<AttributePath>>,
}

impl AssociationMapping {
    pub fn path(&self) -> &AttributePath {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.leaf()
    }

    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    pub fn cardinality(&self) -> Cardinality {
        if self.kind.is_plural() {
            Cardinality::Many
        } else {
            Cardinality::One
        }
    }

    /// Name of the target entity type.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn fetch(&self) -> FetchType {
        self.fetch
    }

    pub fn cascades(&self) -> CascadeSet {
        self.cascades
    }

    pub fn cascades_to(&self, cascade: CascadeType) -> bool {
        self.cascades.contains(cascade)
    }

    pub fn orphan_removal(&self) -> bool {
        self.orphan_removal
    }

    pub fn mapped_by(&self) -> Option<&str> {
        self.mapped_by.as_deref()
    }

    pub fn is_owner(&self) -> bool {
        self.mapped_by.is_none()
    }

    pub fn order(&self) -> Option<&CollectionOrder> {
        self.order.as_ref()
    }

    /// Position column maintained for this collection.
    pub fn order_column(&self) -> Option<&str> {
        match &self.order {
            Some(CollectionOrder::Column(column)) => Some(column),
            _ => None,
        }
    }

    /// Join strategy; `None` only before linking.
    pub fn join_strategy(&self) -> Option<&JoinStrategy> {
        self.join.get()
    }

    /// Path of the opposite attribute on the target type, if bidirectional.
    pub fn opposite(&self) -> Option<&AttributePath> {
        self.opposite.get().and_then(Option::as_ref)
    }

    pub fn is_linked(&self) -> bool {
        self.join.get().is_some() && self.opposite.get().is_some()
    }

    pub(crate) fn set_join(&self, entity: &str, strategy: JoinStrategy) -> Result<()> {
        self.join.set(strategy).map_err(|_| {
            MappingError::new(
                MappingErrorKind::AlreadyLinked,
                entity,
                "join strategy is already resolved",
            )
            .at(self.path.to_string())
            .into()
        })
    }

    pub(crate) fn set_opposite(&self, entity: &str, opposite: Option<AttributePath>) -> Result<()> {
        self.opposite.set(opposite).map_err(|_| {
            MappingError::new(
                MappingErrorKind::AlreadyLinked,
                entity,
                "opposite is already resolved",
            )
            .at(self.path.to_string())
            .into()
        })
    }

    /// The same mapping with empty link slots.
    pub(crate) fn unlinked(&self) -> Self {
        Self {
            join: OnceLock::new(),
            opposite: OnceLock::new(),
            ..self.clone()
        }
    }
}

impl PartialEq for AssociationMapping {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.kind == other.kind
            && self.target == other.target
            && self.fetch == other.fetch
            && self.cascades == other.cascades
            && self.orphan_removal == other.orphan_removal
            && self.mapped_by == other.mapped_by
            && self.order == other.order
            && self.declared == other.declared
            && self.join.get() == other.join.get()
            && self.opposite.get() == other.opposite.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> AssociationMapping {
        AssociationMapping {
            path: AttributePath::root("customer"),
            kind: AssociationKind::ManyToOne,
            target: "Customer".into(),
            fetch: FetchType::Eager,
            cascades: CascadeSet::none(),
            orphan_removal: false,
            mapped_by: None,
            order: None,
            declared: DeclaredJoin::Convention,
            join: OnceLock::new(),
            opposite: OnceLock::new(),
        }
    }

    #[test]
    fn all_expands_to_every_cascade() {
        let set = CascadeSet::from_types(&[CascadeType::All]);
        for c in [
            CascadeType::Persist,
            CascadeType::Merge,
            CascadeType::Remove,
            CascadeType::Refresh,
            CascadeType::Detach,
        ] {
            assert!(set.contains(c));
        }
        let persist = CascadeSet::from_types(&[CascadeType::Persist]);
        assert!(persist.contains(CascadeType::Persist));
        assert!(!persist.contains(CascadeType::Remove));
        assert!(!persist.contains(CascadeType::All));
    }

    #[test]
    fn order_lists_parse() {
        assert_eq!(
            CollectionOrder::parse("title, published DESC,rank asc").unwrap(),
            CollectionOrder::By(vec![
                OrderKey {
                    path: "title".into(),
                    descending: false
                },
                OrderKey {
                    path: "published".into(),
                    descending: true
                },
                OrderKey {
                    path: "rank".into(),
                    descending: false
                },
            ])
        );
        assert_eq!(CollectionOrder::parse("  ").unwrap(), CollectionOrder::By(Vec::new()));
        assert!(CollectionOrder::parse("title sideways").is_err());
        assert!(CollectionOrder::parse("title ASC NULLS").is_err());
    }

    #[test]
    fn link_slots_are_write_once() {
        let m = mapping();
        assert!(!m.is_linked());
        m.set_join("Order", JoinStrategy::SourceColumns(vec![JoinColumn::new("customer_id", "id")]))
            .unwrap();
        m.set_opposite("Order", None).unwrap();
        assert!(m.is_linked());

        let err = m.set_join("Order", JoinStrategy::Inverse).unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::AlreadyLinked));
        let err = m.set_opposite("Order", None).unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::AlreadyLinked));

        let fresh = m.unlinked();
        assert!(fresh.join_strategy().is_none());
        assert_ne!(fresh, m);
    }
}
