//! The resolved mapping graph and the process-wide graph cache.

use crate::association::AssociationMapping;
use crate::entity::{AttributeMapping, EntityType};
use crate::metadata::MetadataSet;
use crate::resolver::MappingResolver;
use entmap_core::{Error, MappingErrorKind, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

/// Every entity type of a persistence unit, linked and validated.
///
/// Immutable once built; share it as `Arc<MappingGraph>`.
#[derive(Debug, PartialEq)]
pub struct MappingGraph {
    entities: BTreeMap<String, EntityType>,
}

impl MappingGraph {
    pub(crate) fn new(entities: BTreeMap<String, EntityType>) -> Self {
        Self { entities }
    }

    /// Resolve metadata with default settings.
    pub fn resolve(metadata: &MetadataSet) -> Result<Self> {
        MappingResolver::new(metadata).resolve()
    }

    pub fn get(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    /// Look up an entity type, failing with `UnresolvedTarget`.
    pub fn entity(&self, name: &str) -> Result<&EntityType> {
        self.get(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnresolvedTarget,
                name,
                "entity is not part of the mapping graph",
            )
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Whether `entity` is `ancestor` or inherits from it.
    pub fn is_assignable(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = Some(entity);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.get(name).and_then(EntityType::parent);
        }
        false
    }

    /// The concrete type of a row read through `entity`'s table.
    ///
    /// Falls back to `entity` itself when the discriminator is absent or names
    /// a type outside its hierarchy branch.
    pub fn concrete_type<'a>(
        &'a self,
        entity: &'a EntityType,
        discriminator: Option<&str>,
    ) -> &'a EntityType {
        discriminator
            .and_then(|value| self.get(value))
            .filter(|concrete| self.is_assignable(&concrete.name, &entity.name))
            .unwrap_or(entity)
    }

    /// The attribute on the other side of a bidirectional association.
    pub fn opposite<'a>(
        &'a self,
        mapping: &AssociationMapping,
    ) -> Option<(&'a EntityType, &'a AttributeMapping)> {
        let target = self.get(mapping.target())?;
        let attr = target.attribute(mapping.opposite()?)?;
        Some((target, attr))
    }

    /// The side whose join strategy drives row emission.
    ///
    /// Owning mappings are returned unchanged; inverse ones defer to their
    /// opposite.
    pub fn owning_side<'a>(
        &'a self,
        entity: &'a EntityType,
        mapping: &'a AssociationMapping,
    ) -> Option<(&'a EntityType, &'a AssociationMapping)> {
        if mapping.is_owner() {
            return Some((entity, mapping));
        }
        let (target, attr) = self.opposite(mapping)?;
        Some((target, attr.association()?))
    }
}

/// Memoised mapping graphs keyed by persistence-unit name.
#[derive(Debug, Default)]
pub struct GraphCache {
    graphs: Mutex<HashMap<String, Arc<MappingGraph>>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the graph for `unit`, resolving it on first request.
    ///
    /// The lock is held while resolving, so concurrent first requests for a
    /// unit resolve it once. A failed resolution is not cached.
    pub fn get_or_resolve<F>(&self, unit: &str, metadata: F) -> Result<Arc<MappingGraph>>
    where
        F: FnOnce() -> Result<MetadataSet>,
    {
        self.get_or_insert_with(unit, || MappingGraph::resolve(&metadata()?))
    }

    /// Like [`get_or_resolve`](Self::get_or_resolve), with a caller-supplied
    /// resolution step.
    #[tracing::instrument(level = "debug", skip(self, build))]
    pub fn get_or_insert_with<F>(&self, unit: &str, build: F) -> Result<Arc<MappingGraph>>
    where
        F: FnOnce() -> Result<MappingGraph>,
    {
        let mut graphs = self.graphs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(graph) = graphs.get(unit) {
            tracing::trace!(unit = %unit, "Mapping graph cache hit");
            return Ok(Arc::clone(graph));
        }

        let graph = Arc::new(build()?);
        graphs.insert(unit.to_string(), Arc::clone(&graph));
        tracing::debug!(unit = %unit, entities = graph.len(), "Mapping graph cached");
        Ok(graph)
    }

    pub fn get(&self, unit: &str) -> Option<Arc<MappingGraph>> {
        let graphs = self.graphs.lock().unwrap_or_else(|e| e.into_inner());
        graphs.get(unit).cloned()
    }

    /// Drop the cached graph of `unit`.
    pub fn evict(&self, unit: &str) -> Option<Arc<MappingGraph>> {
        let mut graphs = self.graphs.lock().unwrap_or_else(|e| e.into_inner());
        graphs.remove(unit)
    }

    pub fn len(&self) -> usize {
        self.graphs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide graph cache.
pub fn global_cache() -> &'static GraphCache {
    static CACHE: OnceLock<GraphCache> = OnceLock::new();
    CACHE.get_or_init(GraphCache::new)
}
