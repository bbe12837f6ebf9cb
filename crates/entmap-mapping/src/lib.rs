//! Mapping metadata, association resolution and the mapping graph.
//!
//! Metadata records ([`MetadataSet`]) go in, a linked and validated
//! [`MappingGraph`] comes out. The graph is immutable and meant to be shared
//! between persistence contexts through [`GraphCache`].

pub mod association;
pub mod entity;
pub mod graph;
pub mod metadata;
pub mod resolver;

pub use association::{
    AssociationMapping, Cardinality, CascadeSet, CollectionOrder, JoinColumn, JoinStrategy,
    JoinTable, OrderKey,
};
pub use entity::{
    AttributeMapping, AttributePath, BasicMapping, ColumnMapping, Discriminator,
    EmbeddedMapping, EntityType,
};
pub use graph::{GraphCache, MappingGraph, global_cache};
pub use metadata::{
    AssociationKind, AssociationMetadata, AttributeMetadata, BasicMetadata, CascadeType,
    EmbeddedMetadata, EntityMetadata, FetchType, GenerationType, JoinColumnMetadata,
    JoinTableMetadata, MetadataSet,
};
pub use resolver::{DEFAULT_DISCRIMINATOR_COLUMN, MappingResolver, resolve, resolve_attribute};
