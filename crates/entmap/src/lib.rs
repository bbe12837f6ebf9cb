//! entmap - entity mapping and persistence contexts for relational stores.
//!
//! entmap maps application objects onto tables through declarative metadata
//! and keeps them synchronised with a row source:
//!
//! - Metadata records (builder or JSON) resolved into a linked mapping graph
//! - Association join strategies: foreign-key columns, join tables, inverse sides
//! - Persistence contexts with an identity map, dirty tracking and cascades
//! - Flush ordering by foreign-key dependency, optimistic locking
//! - Single-table inheritance with polymorphic lookups
//!
//! # Quick Start
//!
//! ```ignore
//! use entmap::prelude::*;
//!
//! let metadata = MetadataSet::new()
//!     .entity(
//!         EntityMetadata::new("Customer")
//!             .attribute(BasicMetadata::id("id"))
//!             .attribute(BasicMetadata::new("name")),
//!     )
//!     .entity(
//!         EntityMetadata::new("Order")
//!             .attribute(BasicMetadata::id("id"))
//!             .attribute(AssociationMetadata::many_to_one("customer", "Customer")),
//!     );
//!
//! let factory = EntityManagerFactory::from_metadata("shop", &metadata, rows)?;
//! let mut ctx = factory.create_context();
//!
//! let ada = ObjectRef::new("Customer").with("id", 1i64).with("name", "Ada");
//! ctx.persist(&ada)?;
//! ctx.commit()?;
//! ```
//!
//! # Crates
//!
//! - `entmap-core`: values, rows, errors and the [`RowSource`] contract
//! - `entmap-mapping`: metadata records, resolver and [`MappingGraph`]
//! - `entmap-session`: [`PersistenceContext`] and flush machinery

pub mod factory;

pub use factory::EntityManagerFactory;

pub use entmap_core::{
    ColumnValues, CycleError, EntityId, Error, InsertResult, MappingError, MappingErrorKind,
    OptimisticLockError, Result, Row, RowSource, RowSourceError, RowSourceErrorKind, StateError,
    TypeError, Value,
};
pub use entmap_mapping::{
    AssociationKind, AssociationMapping, AssociationMetadata, AttributeMapping, AttributePath,
    BasicMetadata, Cardinality, CascadeType, EmbeddedMetadata, EntityMetadata, EntityType,
    FetchType, GenerationType, GraphCache, JoinColumnMetadata, JoinStrategy, JoinTableMetadata,
    MappingGraph, MappingResolver, MetadataSet, global_cache,
};
pub use entmap_session::{
    Change, ChangeSet, ContextConfig, FieldValue, FlushResult, InstanceState, ObjectRef,
    PersistenceContext, RowOperation,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AssociationMetadata,
        // Metadata
        BasicMetadata,
        CascadeType,
        // Context
        ContextConfig,
        EmbeddedMetadata,
        EntityId,
        EntityManagerFactory,
        EntityMetadata,
        // Errors
        Error,
        FetchType,
        FieldValue,
        GenerationType,
        InstanceState,
        JoinColumnMetadata,
        JoinTableMetadata,
        MappingResolver,
        MetadataSet,
        ObjectRef,
        PersistenceContext,
        Result,
        // Storage
        RowSource,
        Value,
    };
}
