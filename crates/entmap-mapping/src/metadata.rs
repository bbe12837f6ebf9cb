//! Declarative metadata records.
//!
//! These are the plain records a metadata loader hands to the resolver. They
//! are deliberately dumb: no defaults are applied and nothing is validated
//! here beyond what serde enforces. The same records come out of
//! [`MetadataSet::from_json`] for file-sourced metadata and out of the builder
//! methods below for programmatic (annotation-style) metadata.

use entmap_core::Result;
use serde::{Deserialize, Serialize};

/// When an association is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchType {
    /// Loaded together with the owning instance.
    Eager,
    /// Loaded on first access.
    Lazy,
}

/// Operations propagated across an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CascadeType {
    /// Shorthand for every other variant.
    All,
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
}

/// How identifier values are produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationType {
    /// The application sets the identifier before `persist`.
    #[default]
    Assigned,
    /// The store assigns the key during insert.
    Identity,
    /// Drawn from a named sequence when the instance is persisted.
    Sequence { name: String },
}

/// Relational multiplicity as declared on the attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssociationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl AssociationKind {
    /// Whether the declaring side holds a collection.
    pub const fn is_plural(self) -> bool {
        matches!(self, AssociationKind::OneToMany | AssociationKind::ManyToMany)
    }
}

fn yes() -> bool {
    true
}

/// A foreign-key column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumnMetadata {
    /// Column name; defaults to `<attribute>_<referenced column>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Referenced identifier column on the other side.
    #[serde(default)]
    pub referenced_column: Option<String>,
    #[serde(default = "yes")]
    pub nullable: bool,
    #[serde(default = "yes")]
    pub insertable: bool,
    #[serde(default = "yes")]
    pub updatable: bool,
}

impl JoinColumnMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn references(mut self, column: impl Into<String>) -> Self {
        self.referenced_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn insertable(mut self, insertable: bool) -> Self {
        self.insertable = insertable;
        self
    }

    #[must_use]
    pub fn updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }
}

impl Default for JoinColumnMetadata {
    fn default() -> Self {
        Self {
            name: None,
            referenced_column: None,
            nullable: true,
            insertable: true,
            updatable: true,
        }
    }
}

/// A join-table declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinTableMetadata {
    #[serde(default)]
    pub name: Option<String>,
    /// Columns referencing the owning side.
    #[serde(default)]
    pub join_columns: Vec<JoinColumnMetadata>,
    /// Columns referencing the target side.
    #[serde(default)]
    pub inverse_join_columns: Vec<JoinColumnMetadata>,
}

impl JoinTableMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn join_column(mut self, column: JoinColumnMetadata) -> Self {
        self.join_columns.push(column);
        self
    }

    #[must_use]
    pub fn inverse_join_column(mut self, column: JoinColumnMetadata) -> Self {
        self.inverse_join_columns.push(column);
        self
    }
}

/// A scalar attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicMetadata {
    pub name: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default = "yes")]
    pub nullable: bool,
    #[serde(default = "yes")]
    pub insertable: bool,
    #[serde(default = "yes")]
    pub updatable: bool,
    #[serde(default)]
    pub id: bool,
    #[serde(default)]
    pub version: bool,
    #[serde(default)]
    pub generated: Option<GenerationType>,
}

impl BasicMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            nullable: true,
            insertable: true,
            updatable: true,
            id: false,
            version: false,
            generated: None,
        }
    }

    /// An identifier attribute.
    pub fn id(name: impl Into<String>) -> Self {
        Self {
            id: true,
            nullable: false,
            ..Self::new(name)
        }
    }

    /// A version attribute.
    pub fn version(name: impl Into<String>) -> Self {
        Self {
            version: true,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn insertable(mut self, insertable: bool) -> Self {
        self.insertable = insertable;
        self
    }

    #[must_use]
    pub fn updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    #[must_use]
    pub fn generated(mut self, generation: GenerationType) -> Self {
        self.generated = Some(generation);
        self
    }
}

/// A value object stored inline in the owner's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedMetadata {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeMetadata>,
}

impl EmbeddedMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn attribute(mut self, attribute: impl Into<AttributeMetadata>) -> Self {
        self.attributes.push(attribute.into());
        self
    }
}

/// A relationship to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationMetadata {
    pub name: String,
    pub kind: AssociationKind,
    #[serde(default)]
    pub target_entity: Option<String>,
    #[serde(default)]
    pub mapped_by: Option<String>,
    #[serde(default)]
    pub fetch: Option<FetchType>,
    #[serde(default)]
    pub cascades: Vec<CascadeType>,
    #[serde(default)]
    pub orphan_removal: bool,
    /// The `JoinColumns` list.
    #[serde(default)]
    pub join_columns: Vec<JoinColumnMetadata>,
    /// A lone `JoinColumn`.
    #[serde(default)]
    pub join_column: Option<JoinColumnMetadata>,
    #[serde(default)]
    pub join_table: Option<JoinTableMetadata>,
    /// `OrderBy`: comma-separated target attribute paths, each optionally
    /// followed by `ASC` or `DESC`. Empty orders by the target identifier.
    #[serde(default)]
    pub order_by: Option<String>,
    /// `OrderColumn`: column holding each element's position. Empty picks
    /// `<attribute>_order`.
    #[serde(default)]
    pub order_column: Option<String>,
}

impl AssociationMetadata {
    pub fn new(name: impl Into<String>, kind: AssociationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target_entity: Some(target.into()),
            mapped_by: None,
            fetch: None,
            cascades: Vec::new(),
            orphan_removal: false,
            join_columns: Vec::new(),
            join_column: None,
            join_table: None,
            order_by: None,
            order_column: None,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::ManyToOne, target)
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::OneToOne, target)
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::OneToMany, target)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::ManyToMany, target)
    }

    #[must_use]
    pub fn mapped_by(mut self, attribute: impl Into<String>) -> Self {
        self.mapped_by = Some(attribute.into());
        self
    }

    #[must_use]
    pub fn fetch(mut self, fetch: FetchType) -> Self {
        self.fetch = Some(fetch);
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeType) -> Self {
        self.cascades.push(cascade);
        self
    }

    #[must_use]
    pub fn orphan_removal(mut self, orphan_removal: bool) -> Self {
        self.orphan_removal = orphan_removal;
        self
    }

    #[must_use]
    pub fn join_column(mut self, column: JoinColumnMetadata) -> Self {
        self.join_column = Some(column);
        self
    }

    #[must_use]
    pub fn join_columns(mut self, columns: Vec<JoinColumnMetadata>) -> Self {
        self.join_columns = columns;
        self
    }

    #[must_use]
    pub fn join_table(mut self, table: JoinTableMetadata) -> Self {
        self.join_table = Some(table);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    #[must_use]
    pub fn order_column(mut self, column: impl Into<String>) -> Self {
        self.order_column = Some(column.into());
        self
    }

    /// Whether any join-column declaration is present.
    pub fn has_join_columns(&self) -> bool {
        !self.join_columns.is_empty() || self.join_column.is_some()
    }
}

/// One attribute of an entity or embeddable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mapping", rename_all = "snake_case")]
pub enum AttributeMetadata {
    Basic(BasicMetadata),
    Embedded(EmbeddedMetadata),
    Association(AssociationMetadata),
}

impl AttributeMetadata {
    pub fn name(&self) -> &str {
        match self {
            AttributeMetadata::Basic(b) => &b.name,
            AttributeMetadata::Embedded(e) => &e.name,
            AttributeMetadata::Association(a) => &a.name,
        }
    }
}

impl From<BasicMetadata> for AttributeMetadata {
    fn from(value: BasicMetadata) -> Self {
        AttributeMetadata::Basic(value)
    }
}

impl From<EmbeddedMetadata> for AttributeMetadata {
    fn from(value: EmbeddedMetadata) -> Self {
        AttributeMetadata::Embedded(value)
    }
}

impl From<AssociationMetadata> for AttributeMetadata {
    fn from(value: AssociationMetadata) -> Self {
        AttributeMetadata::Association(value)
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    /// Parent entity in a single-table hierarchy.
    #[serde(default)]
    pub parent: Option<String>,
    /// Discriminator column for the hierarchy (root only).
    #[serde(default)]
    pub discriminator_column: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeMetadata>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            parent: None,
            discriminator_column: None,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn discriminator_column(mut self, column: impl Into<String>) -> Self {
        self.discriminator_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn attribute(mut self, attribute: impl Into<AttributeMetadata>) -> Self {
        self.attributes.push(attribute.into());
        self
    }
}

/// Everything a persistence unit declares.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetadataSet {
    pub entities: Vec<EntityMetadata>,
}

impl MetadataSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entity(mut self, entity: EntityMetadata) -> Self {
        self.entities.push(entity);
        self
    }

    /// Parse a metadata document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn get(&self, name: &str) -> Option<&EntityMetadata> {
        self.entities.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_document_matches_builder_output() {
        let json = r#"{
            "entities": [{
                "name": "Order",
                "table": "orders",
                "attributes": [
                    { "mapping": "basic", "name": "id", "id": true, "nullable": false,
                      "generated": { "strategy": "SEQUENCE", "name": "order_seq" } },
                    { "mapping": "association", "name": "customer", "kind": "MANY_TO_ONE",
                      "target_entity": "Customer", "fetch": "LAZY", "cascades": ["PERSIST"],
                      "join_column": { "name": "customer_fk", "nullable": false } }
                ]
            }]
        }"#;

        let parsed = MetadataSet::from_json(json).unwrap();
        let built = MetadataSet::new().entity(
            EntityMetadata::new("Order")
                .table("orders")
                .attribute(BasicMetadata::id("id").generated(GenerationType::Sequence {
                    name: "order_seq".into(),
                }))
                .attribute(
                    AssociationMetadata::many_to_one("customer", "Customer")
                        .fetch(FetchType::Lazy)
                        .cascade(CascadeType::Persist)
                        .join_column(JoinColumnMetadata::named("customer_fk").nullable(false)),
                ),
        );
        assert_eq!(parsed, built);
    }

    #[test]
    fn malformed_document_is_a_serde_error() {
        let err = MetadataSet::from_json("{ \"entities\": 3 }").unwrap_err();
        assert!(matches!(err, entmap_core::Error::Serde(_)));
    }
}
