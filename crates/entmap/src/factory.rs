//! Entity manager factory: one mapping graph plus one row source.
//!
//! # Example
//!
//! ```rust,ignore
//! use entmap::prelude::*;
//!
//! let factory = EntityManagerFactory::from_metadata("shop", &metadata, rows)?
//!     .with_config(ContextConfig::new().detach_on_commit(false));
//!
//! let mut ctx = factory.create_context();
//! ctx.persist(&customer)?;
//! ctx.commit()?;
//! ```

use entmap_core::{Result, RowSource};
use entmap_mapping::{MappingGraph, MappingResolver, MetadataSet, global_cache};
use entmap_session::{ContextConfig, PersistenceContext};
use std::sync::Arc;

/// Creates persistence contexts sharing a mapping graph and a row source.
#[derive(Debug)]
pub struct EntityManagerFactory<R: RowSource> {
    unit: String,
    graph: Arc<MappingGraph>,
    rows: Arc<R>,
    config: ContextConfig,
}

impl<R: RowSource> EntityManagerFactory<R> {
    /// Factory over an already resolved graph.
    pub fn new(unit: impl Into<String>, graph: Arc<MappingGraph>, rows: R) -> Self {
        Self {
            unit: unit.into(),
            graph,
            rows: Arc::new(rows),
            config: ContextConfig::default(),
        }
    }

    /// Resolve `metadata` for persistence unit `unit`, reusing the graph
    /// cached in the process-wide cache when the unit was resolved before.
    pub fn from_metadata(unit: &str, metadata: &MetadataSet, rows: R) -> Result<Self> {
        Self::from_resolver(unit, &MappingResolver::new(metadata), rows)
    }

    /// Like [`from_metadata`](Self::from_metadata), with resolver settings
    /// such as the default discriminator column. The settings only apply
    /// when `unit` is not cached yet.
    #[tracing::instrument(level = "debug", skip(resolver, rows))]
    pub fn from_resolver(unit: &str, resolver: &MappingResolver<'_>, rows: R) -> Result<Self> {
        let graph = global_cache().get_or_insert_with(unit, || resolver.resolve())?;
        Ok(Self::new(unit, graph, rows))
    }

    /// Like [`from_metadata`](Self::from_metadata), reading the metadata
    /// from a JSON document.
    pub fn from_json(unit: &str, json: &str, rows: R) -> Result<Self> {
        Self::from_metadata(unit, &MetadataSet::from_json(json)?, rows)
    }

    #[must_use]
    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn unit(&self) -> &str {
        &self.unit
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

    /// A fresh persistence context.
    pub fn create_context(&self) -> PersistenceContext<Arc<R>> {
        tracing::debug!(unit = %self.unit, "Creating persistence context");
        PersistenceContext::with_config(
            Arc::clone(&self.graph),
            Arc::clone(&self.rows),
            self.config.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_mapping::{BasicMetadata, EntityMetadata};
    use entmap_memory::MemoryRowSource;

    fn metadata() -> MetadataSet {
        MetadataSet::new().entity(
            EntityMetadata::new("Widget")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("label")),
        )
    }

    #[test]
    fn contexts_share_graph_and_row_source() {
        let factory =
            EntityManagerFactory::from_metadata("factory-share", &metadata(), MemoryRowSource::new())
                .unwrap();
        let a = factory.create_context();
        let b = factory.create_context();
        assert!(Arc::ptr_eq(a.graph(), b.graph()));
        assert!(Arc::ptr_eq(a.row_source(), b.row_source()));
        assert_eq!(factory.unit(), "factory-share");
    }

    #[test]
    fn units_are_resolved_once() {
        let first =
            EntityManagerFactory::from_metadata("factory-once", &metadata(), MemoryRowSource::new())
                .unwrap();
        // different metadata under the same unit name: the cached graph wins
        let second = EntityManagerFactory::from_metadata(
            "factory-once",
            &MetadataSet::new(),
            MemoryRowSource::new(),
        )
        .unwrap();
        assert!(Arc::ptr_eq(first.graph(), second.graph()));
        assert!(second.graph().get("Widget").is_some());
    }

    #[test]
    fn config_is_handed_to_contexts() {
        let factory =
            EntityManagerFactory::from_metadata("factory-config", &metadata(), MemoryRowSource::new())
                .unwrap()
                .with_config(ContextConfig::new().detach_on_commit(false));
        assert!(!factory.create_context().config().detach_on_commit);
    }

    #[test]
    fn resolver_settings_reach_the_graph() {
        let metadata = metadata().entity(
            EntityMetadata::new("Gadget")
                .extends("Widget")
                .attribute(BasicMetadata::new("battery")),
        );
        let resolver = MappingResolver::new(&metadata).discriminator_column("KIND");
        let factory =
            EntityManagerFactory::from_resolver("factory-resolver", &resolver, MemoryRowSource::new())
                .unwrap();
        let widget = factory.graph().entity("Widget").unwrap();
        assert_eq!(widget.discriminator().unwrap().column, "KIND");
    }
}
