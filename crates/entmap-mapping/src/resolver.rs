//! Turns metadata records into a linked mapping graph.
//!
//! Resolution runs in two phases. The construct phase walks every entity's
//! metadata (parents first) and produces one [`AttributeMapping`] per
//! attribute, choosing the owning or inverse variant and applying join
//! precedence. The link phase runs once every entity type exists: it resolves
//! each association's opposite side and fixes its join strategy, synthesising
//! join columns and join tables by convention where nothing was declared.

use crate::association::{
    AssociationMapping, CascadeSet, CollectionOrder, DeclaredJoin, JoinColumn, JoinStrategy, JoinTable,
};
use crate::entity::{
    AttributeMapping, AttributePath, BasicMapping, ColumnMapping, Discriminator,
    EmbeddedMapping, EntityType,
};
use crate::graph::MappingGraph;
use crate::metadata::{
    AssociationKind, AssociationMetadata, AttributeMetadata, BasicMetadata, EntityMetadata,
    FetchType, GenerationType, JoinColumnMetadata, JoinTableMetadata, MetadataSet,
};
use entmap_core::{
    Error, MappingError, MappingErrorKind, Result, is_valid_identifier, to_snake_case,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

/// Default discriminator column of a single-table hierarchy.
pub const DEFAULT_DISCRIMINATOR_COLUMN: &str = "DTYPE";

fn invalid_identifier(entity: &str, attribute: Option<&AttributePath>, name: &str) -> Error {
    let err = MappingError::new(
        MappingErrorKind::InvalidIdentifier,
        entity,
        format!("'{name}' is not a valid SQL identifier"),
    );
    match attribute {
        Some(path) => err.at(path.to_string()).into(),
        None => err.into(),
    }
}

fn check_identifier(entity: &str, attribute: Option<&AttributePath>, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(invalid_identifier(entity, attribute, name))
    }
}

fn attr_error(
    kind: MappingErrorKind,
    entity: &str,
    path: &AttributePath,
    message: impl Into<String>,
) -> Error {
    MappingError::new(kind, entity, message)
        .at(path.to_string())
        .into()
}

/// Resolves a [`MetadataSet`] into a [`MappingGraph`].
#[derive(Debug)]
pub struct MappingResolver<'a> {
    metadata: &'a MetadataSet,
    discriminator_column: String,
}

impl<'a> MappingResolver<'a> {
    pub fn new(metadata: &'a MetadataSet) -> Self {
        Self {
            metadata,
            discriminator_column: DEFAULT_DISCRIMINATOR_COLUMN.to_string(),
        }
    }

    /// Discriminator column used when a hierarchy root does not declare one.
    #[must_use]
    pub fn discriminator_column(mut self, column: impl Into<String>) -> Self {
        self.discriminator_column = column.into();
        self
    }

    /// Run both phases and validate the result.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.metadata.entities.len()))]
    pub fn resolve(&self) -> Result<MappingGraph> {
        let index = self.index()?;

        let mut constructed = BTreeMap::new();
        for meta in &self.metadata.entities {
            self.construct(meta, &index, &mut constructed, &mut Vec::new())?;
        }
        self.assign_hierarchies(&index, &mut constructed)?;

        let graph = MappingGraph::new(constructed);
        link(&graph)?;
        validate_columns(&graph)?;
        validate_orders(&graph)?;

        tracing::debug!(entities = graph.len(), "Mapping graph resolved");
        Ok(graph)
    }

    fn index(&self) -> Result<HashMap<&'a str, &'a EntityMetadata>> {
        let mut index = HashMap::with_capacity(self.metadata.entities.len());
        for meta in &self.metadata.entities {
            if index.insert(meta.name.as_str(), meta).is_some() {
                return Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    &meta.name,
                    "entity is declared more than once",
                ));
            }
        }
        Ok(index)
    }

    /// Construct phase for one entity, parents first.
    fn construct(
        &self,
        meta: &EntityMetadata,
        index: &HashMap<&str, &EntityMetadata>,
        done: &mut BTreeMap<String, EntityType>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains_key(&meta.name) {
            return Ok(());
        }
        if stack.contains(&meta.name) {
            stack.push(meta.name.clone());
            return Err(Error::mapping(
                MappingErrorKind::Invalid,
                &meta.name,
                format!("inheritance cycle: {}", stack.join(" -> ")),
            ));
        }
        stack.push(meta.name.clone());

        let parent = match &meta.parent {
            Some(parent_name) => {
                let parent_meta = index.get(parent_name.as_str()).ok_or_else(|| {
                    Error::mapping(
                        MappingErrorKind::UnresolvedTarget,
                        &meta.name,
                        format!("parent entity '{parent_name}' is not declared"),
                    )
                })?;
                self.construct(parent_meta, index, done, stack)?;
                done.get(parent_name.as_str())
            }
            None => None,
        };

        let table = match (parent, &meta.table) {
            (Some(p), Some(t)) if *t != p.table => {
                return Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    &meta.name,
                    format!(
                        "table '{t}' differs from '{}'; a hierarchy shares one table",
                        p.table
                    ),
                ));
            }
            (Some(p), _) => p.table.clone(),
            (None, Some(t)) => t.clone(),
            (None, None) => to_snake_case(&meta.name),
        };
        check_identifier(&meta.name, None, &table)?;

        let mut attributes: Vec<AttributeMapping> = parent
            .map(|p| p.attributes.iter().map(unlinked).collect())
            .unwrap_or_default();
        let inherited = attributes.len();

        let mut path = VecDeque::new();
        for attr in &meta.attributes {
            if attributes.iter().any(|a| a.name() == attr.name()) {
                return Err(attr_error(
                    MappingErrorKind::Invalid,
                    &meta.name,
                    &AttributePath::root(attr.name()),
                    "attribute is declared more than once in the hierarchy",
                ));
            }
            attributes.push(resolve_attribute(&meta.name, attr, &mut path)?);
        }

        let entity = EntityType {
            name: meta.name.clone(),
            table,
            parent: meta.parent.clone(),
            root: parent.map_or_else(|| meta.name.clone(), |p| p.root.clone()),
            subtypes: Vec::new(),
            discriminator: None,
            attributes,
        };
        check_identifier_shape(&entity, inherited)?;

        tracing::trace!(
            entity = %entity.name,
            table = %entity.table,
            attributes = entity.attributes.len(),
            "Constructed entity type"
        );
        stack.pop();
        done.insert(meta.name.clone(), entity);
        Ok(())
    }

    fn assign_hierarchies(
        &self,
        index: &HashMap<&str, &EntityMetadata>,
        done: &mut BTreeMap<String, EntityType>,
    ) -> Result<()> {
        let mut descendants: HashMap<String, Vec<String>> = HashMap::new();
        for entity in done.values() {
            let mut ancestor = entity.parent.clone();
            while let Some(name) = ancestor {
                descendants
                    .entry(name.clone())
                    .or_default()
                    .push(entity.name.clone());
                ancestor = done.get(&name).and_then(|p| p.parent.clone());
            }
        }

        let names: Vec<String> = done.keys().cloned().collect();
        for name in names {
            let Some(entity) = done.get(&name) else {
                continue;
            };
            let root = entity.root.clone();
            let in_hierarchy = descendants.get(&root).is_some_and(|d| !d.is_empty());
            let column = index
                .get(root.as_str())
                .and_then(|m| m.discriminator_column.clone())
                .unwrap_or_else(|| self.discriminator_column.clone());
            if in_hierarchy {
                check_identifier(&name, None, &column)?;
            }

            if let Some(entity) = done.get_mut(&name) {
                let mut subtypes = descendants.get(&name).cloned().unwrap_or_default();
                subtypes.sort();
                entity.subtypes = subtypes;
                entity.discriminator = in_hierarchy.then(|| Discriminator {
                    column,
                    value: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Resolve metadata with the default discriminator column.
pub fn resolve(metadata: &MetadataSet) -> Result<MappingGraph> {
    MappingResolver::new(metadata).resolve()
}

fn unlinked(attr: &AttributeMapping) -> AttributeMapping {
    match attr {
        AttributeMapping::Basic(b) => AttributeMapping::Basic(b.clone()),
        AttributeMapping::Embedded(e) => AttributeMapping::Embedded(EmbeddedMapping {
            path: e.path.clone(),
            attributes: e.attributes.iter().map(unlinked).collect(),
        }),
        AttributeMapping::OwnerToOne(a) => AttributeMapping::OwnerToOne(a.unlinked()),
        AttributeMapping::OwnerToMany(a) => AttributeMapping::OwnerToMany(a.unlinked()),
        AttributeMapping::InverseToOne(a) => AttributeMapping::InverseToOne(a.unlinked()),
        AttributeMapping::InverseToMany(a) => AttributeMapping::InverseToMany(a.unlinked()),
    }
}

fn check_identifier_shape(entity: &EntityType, inherited: usize) -> Result<()> {
    let ids = entity.id_mappings();
    if ids.is_empty() {
        return Err(Error::mapping(
            MappingErrorKind::MissingIdentifier,
            &entity.name,
            "no identifier attribute",
        ));
    }
    if entity.parent.is_some() {
        let own_id = entity.attributes[inherited..]
            .iter()
            .flat_map(|a| {
                let mut leaves = Vec::new();
                collect_basics(a, &mut leaves);
                leaves
            })
            .find(|b| b.id);
        if let Some(id) = own_id {
            return Err(attr_error(
                MappingErrorKind::Invalid,
                &entity.name,
                &id.path,
                "the identifier is inherited and cannot be redeclared",
            ));
        }
    }
    if ids.len() > 1 {
        if let Some(generated) = ids
            .iter()
            .find(|b| b.generation != GenerationType::Assigned)
        {
            return Err(attr_error(
                MappingErrorKind::MissingIdentifier,
                &entity.name,
                &generated.path,
                "a generated identifier must be the only identifier attribute",
            ));
        }
    }

    let versions: Vec<&BasicMapping> = entity.basics().filter(|b| b.version).collect();
    if let [_, second, ..] = versions.as_slice() {
        return Err(attr_error(
            MappingErrorKind::DuplicateVersion,
            &entity.name,
            &second.path,
            "more than one version attribute",
        ));
    }
    Ok(())
}

fn collect_basics<'a>(attr: &'a AttributeMapping, out: &mut Vec<&'a BasicMapping>) {
    match attr {
        AttributeMapping::Basic(b) => out.push(b),
        AttributeMapping::Embedded(e) => {
            for child in &e.attributes {
                collect_basics(child, out);
            }
        }
        _ => {}
    }
}

/// Produce the mapping of one attribute.
///
/// `path` holds the names of the embedded attributes enclosing this one; it is
/// restored to its original contents before returning successfully.
pub fn resolve_attribute(
    entity: &str,
    meta: &AttributeMetadata,
    path: &mut VecDeque<String>,
) -> Result<AttributeMapping> {
    path.push_back(meta.name().to_string());
    let attr_path = AttributePath::new(path.iter().cloned().collect());

    let mapping = match meta {
        AttributeMetadata::Basic(basic) => resolve_basic(entity, basic, attr_path)?,
        AttributeMetadata::Embedded(embedded) => {
            if embedded.attributes.is_empty() {
                return Err(attr_error(
                    MappingErrorKind::Invalid,
                    entity,
                    &attr_path,
                    "embedded attribute declares no attributes",
                ));
            }
            let attributes = embedded
                .attributes
                .iter()
                .map(|child| resolve_attribute(entity, child, path))
                .collect::<Result<Vec<_>>>()?;
            AttributeMapping::Embedded(EmbeddedMapping {
                path: attr_path,
                attributes,
            })
        }
        AttributeMetadata::Association(assoc) => resolve_association(entity, assoc, attr_path)?,
    };

    path.pop_back();
    Ok(mapping)
}

fn resolve_basic(entity: &str, meta: &BasicMetadata, path: AttributePath) -> Result<AttributeMapping> {
    let column = meta.column.clone().unwrap_or_else(|| path.column_prefix());
    check_identifier(entity, Some(&path), &column)?;

    if meta.id && meta.version {
        return Err(attr_error(
            MappingErrorKind::Invalid,
            entity,
            &path,
            "an attribute cannot be both identifier and version",
        ));
    }
    let generation = meta.generated.clone().unwrap_or_default();
    if generation != GenerationType::Assigned && !meta.id {
        return Err(attr_error(
            MappingErrorKind::Invalid,
            entity,
            &path,
            "only identifier attributes can be generated",
        ));
    }
    if let GenerationType::Sequence { name } = &generation {
        check_identifier(entity, Some(&path), name)?;
    }

    Ok(AttributeMapping::Basic(BasicMapping {
        column: ColumnMapping {
            name: column,
            nullable: meta.nullable && !meta.id,
            insertable: meta.insertable,
            updatable: meta.updatable && !meta.id,
        },
        path,
        id: meta.id,
        version: meta.version,
        generation,
    }))
}

fn resolve_association(
    entity: &str,
    meta: &AssociationMetadata,
    path: AttributePath,
) -> Result<AttributeMapping> {
    let target = meta.target_entity.clone().ok_or_else(|| {
        attr_error(
            MappingErrorKind::UnresolvedTarget,
            entity,
            &path,
            "no target entity declared",
        )
    })?;

    if meta.has_join_columns() && meta.join_table.is_some() {
        return Err(attr_error(
            MappingErrorKind::AmbiguousJoin,
            entity,
            &path,
            "both join columns and a join table are declared",
        ));
    }

    let declared = if !meta.join_columns.is_empty() {
        DeclaredJoin::Columns(meta.join_columns.clone())
    } else if let Some(column) = &meta.join_column {
        DeclaredJoin::Columns(vec![column.clone()])
    } else if let Some(table) = &meta.join_table {
        DeclaredJoin::Table(table.clone())
    } else {
        DeclaredJoin::Convention
    };
    check_declared_names(entity, &path, &declared)?;

    if meta.orphan_removal
        && !matches!(meta.kind, AssociationKind::OneToOne | AssociationKind::OneToMany)
    {
        return Err(attr_error(
            MappingErrorKind::Invalid,
            entity,
            &path,
            "orphan removal applies to one-to-one and one-to-many associations",
        ));
    }

    if meta.mapped_by.is_some() {
        if meta.kind == AssociationKind::ManyToOne {
            return Err(attr_error(
                MappingErrorKind::InvalidMappedBy,
                entity,
                &path,
                "a many-to-one association is always the owning side",
            ));
        }
        if declared != DeclaredJoin::Convention {
            return Err(attr_error(
                MappingErrorKind::InvalidMappedBy,
                entity,
                &path,
                "the mappedBy side cannot declare join metadata",
            ));
        }
    }

    let order = resolve_order(entity, meta, &path)?;

    let fetch = meta.fetch.unwrap_or(if meta.kind.is_plural() {
        FetchType::Lazy
    } else {
        FetchType::Eager
    });

    let mapping = AssociationMapping {
        path,
        kind: meta.kind,
        target,
        fetch,
        cascades: CascadeSet::from_types(&meta.cascades),
        orphan_removal: meta.orphan_removal,
        mapped_by: meta.mapped_by.clone(),
        order,
        declared,
        join: OnceLock::new(),
        opposite: OnceLock::new(),
    };

    Ok(match (mapping.is_owner(), meta.kind.is_plural()) {
        (true, false) => AttributeMapping::OwnerToOne(mapping),
        (true, true) => AttributeMapping::OwnerToMany(mapping),
        (false, false) => AttributeMapping::InverseToOne(mapping),
        (false, true) => AttributeMapping::InverseToMany(mapping),
    })
}

/// `OrderBy` or `OrderColumn` of a collection-valued association.
fn resolve_order(
    entity: &str,
    meta: &AssociationMetadata,
    path: &AttributePath,
) -> Result<Option<CollectionOrder>> {
    if meta.order_by.is_none() && meta.order_column.is_none() {
        return Ok(None);
    }
    let invalid = |message: String| attr_error(MappingErrorKind::Invalid, entity, path, message);
    if !meta.kind.is_plural() {
        return Err(invalid(
            "ordering applies to collection-valued associations".to_string(),
        ));
    }
    match (&meta.order_by, &meta.order_column) {
        (Some(_), Some(_)) => Err(invalid(
            "OrderBy and OrderColumn cannot both be declared".to_string(),
        )),
        (Some(order_by), None) => CollectionOrder::parse(order_by).map(Some).map_err(invalid),
        (None, Some(column)) => {
            if meta.mapped_by.is_some() {
                return Err(attr_error(
                    MappingErrorKind::InvalidMappedBy,
                    entity,
                    path,
                    "the mappedBy side cannot declare an order column",
                ));
            }
            let column = if column.is_empty() {
                format!("{}_order", path.column_prefix())
            } else {
                column.clone()
            };
            check_identifier(entity, Some(path), &column)?;
            Ok(Some(CollectionOrder::Column(column)))
        }
        (None, None) => Ok(None),
    }
}

fn check_declared_names(entity: &str, path: &AttributePath, declared: &DeclaredJoin) -> Result<()> {
    let check_columns = |columns: &[JoinColumnMetadata]| -> Result<()> {
        for column in columns {
            for name in column.name.iter().chain(column.referenced_column.iter()) {
                check_identifier(entity, Some(path), name)?;
            }
        }
        Ok(())
    };
    match declared {
        DeclaredJoin::Columns(columns) => check_columns(columns),
        DeclaredJoin::Table(table) => {
            if let Some(name) = &table.name {
                check_identifier(entity, Some(path), name)?;
            }
            check_columns(&table.join_columns)?;
            check_columns(&table.inverse_join_columns)
        }
        DeclaredJoin::Convention => Ok(()),
    }
}

/// Link phase: resolve opposites and join strategies of every association.
///
/// Fails with `AlreadyLinked` when run twice over the same graph.
pub(crate) fn link(graph: &MappingGraph) -> Result<()> {
    for entity in graph.entities() {
        for attr in entity.associations() {
            match attr {
                AttributeMapping::OwnerToOne(a) | AttributeMapping::OwnerToMany(a) => {
                    link_owner(graph, entity, a)?;
                }
                AttributeMapping::InverseToOne(a) | AttributeMapping::InverseToMany(a) => {
                    link_inverse(graph, entity, a)?;
                }
                AttributeMapping::Basic(_) | AttributeMapping::Embedded(_) => {}
            }
        }
    }
    Ok(())
}

fn target_of<'g>(graph: &'g MappingGraph, entity: &EntityType, a: &AssociationMapping) -> Result<&'g EntityType> {
    graph.get(&a.target).ok_or_else(|| {
        attr_error(
            MappingErrorKind::UnresolvedTarget,
            &entity.name,
            &a.path,
            format!("target entity '{}' is not declared", a.target),
        )
    })
}

fn link_owner(graph: &MappingGraph, source: &EntityType, a: &AssociationMapping) -> Result<()> {
    let target = target_of(graph, source, a)?;
    let name = source.name.as_str();

    let owner_path = a.path.to_string();
    let opposite = target
        .associations()
        .into_iter()
        .filter(|attr| attr.is_inverse())
        .filter_map(AttributeMapping::association)
        .find(|inv| {
            inv.mapped_by.as_deref() == Some(owner_path.as_str())
                && graph.is_assignable(name, &inv.target)
        })
        .map(|inv| inv.path.clone());

    let strategy = match (&a.declared, a.kind) {
        (DeclaredJoin::Columns(_), AssociationKind::ManyToMany) => {
            return Err(attr_error(
                MappingErrorKind::InvalidJoinColumn,
                name,
                &a.path,
                "a many-to-many association needs a join table, not join columns",
            ));
        }
        (DeclaredJoin::Columns(columns), AssociationKind::OneToMany) => {
            JoinStrategy::TargetColumns(build_join_columns(
                name,
                &a.path,
                columns,
                &a.path.column_prefix(),
                source,
            )?)
        }
        (DeclaredJoin::Columns(columns), _) => JoinStrategy::SourceColumns(build_join_columns(
            name,
            &a.path,
            columns,
            &a.path.column_prefix(),
            target,
        )?),
        (DeclaredJoin::Table(table), _) => {
            JoinStrategy::JoinTable(build_join_table(source, a, target, Some(table))?)
        }
        (DeclaredJoin::Convention, AssociationKind::OneToMany | AssociationKind::ManyToMany) => {
            JoinStrategy::JoinTable(build_join_table(source, a, target, None)?)
        }
        (DeclaredJoin::Convention, _) => JoinStrategy::SourceColumns(build_join_columns(
            name,
            &a.path,
            &[],
            &a.path.column_prefix(),
            target,
        )?),
    };

    tracing::trace!(
        entity = %name,
        attribute = %a.path,
        target = %target.name,
        opposite = ?opposite,
        strategy = ?strategy,
        "Linked owning association"
    );
    a.set_opposite(name, opposite)?;
    a.set_join(name, strategy)
}

fn link_inverse(graph: &MappingGraph, source: &EntityType, a: &AssociationMapping) -> Result<()> {
    let target = target_of(graph, source, a)?;
    let name = source.name.as_str();
    let mapped_by = a.mapped_by.as_deref().unwrap_or_default();
    let opposite_path = AttributePath::parse(mapped_by);

    let fail = |message: String| attr_error(MappingErrorKind::InvalidMappedBy, name, &a.path, message);

    let opposite_attr = target.attribute(&opposite_path).ok_or_else(|| {
        fail(format!(
            "mappedBy names '{mapped_by}', which {} does not declare",
            target.name
        ))
    })?;
    let opposite = opposite_attr.association().ok_or_else(|| {
        fail(format!("{}.{mapped_by} is not an association", target.name))
    })?;
    if opposite_attr.is_inverse() {
        return Err(fail(format!(
            "{}.{mapped_by} is itself an inverse side",
            target.name
        )));
    }
    if !graph.is_assignable(name, &opposite.target) {
        return Err(fail(format!(
            "{}.{mapped_by} targets {}, not {name}",
            target.name, opposite.target
        )));
    }
    let compatible = matches!(
        (a.kind, opposite.kind),
        (AssociationKind::OneToMany, AssociationKind::ManyToOne)
            | (AssociationKind::OneToOne, AssociationKind::OneToOne)
            | (AssociationKind::ManyToMany, AssociationKind::ManyToMany)
    );
    if !compatible {
        return Err(fail(format!(
            "{:?} cannot be the inverse of {}.{mapped_by} ({:?})",
            a.kind, target.name, opposite.kind
        )));
    }

    tracing::trace!(entity = %name, attribute = %a.path, opposite = %opposite_path, "Linked inverse association");
    a.set_opposite(name, Some(opposite_path))?;
    a.set_join(name, JoinStrategy::Inverse)
}

/// Join columns pointing at `referenced`'s identifier.
fn build_join_columns(
    entity: &str,
    path: &AttributePath,
    declared: &[JoinColumnMetadata],
    prefix: &str,
    referenced: &EntityType,
) -> Result<Vec<JoinColumn>> {
    let ids = referenced.id_columns();
    if declared.is_empty() {
        return ids
            .iter()
            .map(|id| {
                let column = format!("{prefix}_{id}");
                check_identifier(entity, Some(path), &column)?;
                Ok(JoinColumn::new(column, *id))
            })
            .collect();
    }

    if declared.len() != ids.len() {
        return Err(attr_error(
            MappingErrorKind::InvalidJoinColumn,
            entity,
            path,
            format!(
                "{} join column(s) declared for the {}-column identifier of {}",
                declared.len(),
                ids.len(),
                referenced.name
            ),
        ));
    }

    declared
        .iter()
        .zip(&ids)
        .map(|(meta, id)| {
            let referenced_column = meta.referenced_column.as_deref().unwrap_or(id);
            if !ids.contains(&referenced_column) {
                return Err(attr_error(
                    MappingErrorKind::InvalidJoinColumn,
                    entity,
                    path,
                    format!(
                        "join column references '{referenced_column}', which is not an identifier column of {}",
                        referenced.name
                    ),
                ));
            }
            let column = meta
                .name
                .clone()
                .unwrap_or_else(|| format!("{prefix}_{referenced_column}"));
            Ok(JoinColumn {
                column,
                referenced_column: referenced_column.to_string(),
                nullable: meta.nullable,
                insertable: meta.insertable,
                updatable: meta.updatable,
            })
        })
        .collect()
}

fn build_join_table(
    source: &EntityType,
    a: &AssociationMapping,
    target: &EntityType,
    declared: Option<&JoinTableMetadata>,
) -> Result<JoinTable> {
    let name = declared
        .and_then(|t| t.name.clone())
        .unwrap_or_else(|| format!("{}_{}", source.table, target.table));
    check_identifier(&source.name, Some(&a.path), &name)?;

    // Owner columns are named after the hierarchy root so every member
    // agrees on the layout.
    let owner_prefix = to_snake_case(&source.root);
    let owner_columns = build_join_columns(
        &source.name,
        &a.path,
        declared.map_or(&[][..], |t| t.join_columns.as_slice()),
        &owner_prefix,
        source,
    )?;
    let inverse_columns = build_join_columns(
        &source.name,
        &a.path,
        declared.map_or(&[][..], |t| t.inverse_join_columns.as_slice()),
        &a.path.column_prefix(),
        target,
    )?;

    let mut seen = HashSet::new();
    for column in owner_columns.iter().chain(&inverse_columns) {
        if !seen.insert(column.column.as_str()) {
            return Err(attr_error(
                MappingErrorKind::DuplicateColumn,
                &source.name,
                &a.path,
                format!("join table '{name}' maps column '{}' twice", column.column),
            ));
        }
    }

    Ok(JoinTable {
        name,
        owner_columns,
        inverse_columns,
    })
}

/// Two writable mappings of one entity may not share a column.
fn validate_columns(graph: &MappingGraph) -> Result<()> {
    for entity in graph.entities() {
        let mut writers: HashMap<&str, String> = HashMap::new();
        if let Some(discriminator) = entity.discriminator() {
            writers.insert(discriminator.column.as_str(), "the discriminator".to_string());
        }
        for leaf in entity.leaves() {
            let columns: Vec<(&str, bool)> = match leaf {
                AttributeMapping::Basic(b) => vec![(
                    b.column.name.as_str(),
                    b.column.insertable || b.column.updatable,
                )],
                _ => leaf
                    .join_strategy()
                    .and_then(JoinStrategy::source_columns)
                    .map(|cols| {
                        cols.iter()
                            .map(|c| (c.column.as_str(), c.insertable || c.updatable))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            for (column, writable) in columns {
                if !writable {
                    continue;
                }
                if let Some(previous) = writers.insert(column, leaf.path().to_string()) {
                    return Err(attr_error(
                        MappingErrorKind::DuplicateColumn,
                        &entity.name,
                        leaf.path(),
                        format!("column '{column}' of '{}' is also written by {previous}", entity.table),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// `OrderBy` keys must name basic attributes of the target.
fn validate_orders(graph: &MappingGraph) -> Result<()> {
    for entity in graph.entities() {
        for attr in entity.associations() {
            let Some(assoc) = attr.association() else {
                continue;
            };
            let Some(CollectionOrder::By(keys)) = assoc.order() else {
                continue;
            };
            let target = target_of(graph, entity, assoc)?;
            if let Some(key) = keys
                .iter()
                .find(|k| !matches!(target.attribute(&k.path), Some(AttributeMapping::Basic(_))))
            {
                return Err(attr_error(
                    MappingErrorKind::Invalid,
                    &entity.name,
                    &assoc.path,
                    format!(
                        "order key '{}' is not a basic attribute of '{}'",
                        key.path, target.name
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CascadeType, EmbeddedMetadata};

    fn customer() -> EntityMetadata {
        EntityMetadata::new("Customer")
            .table("customers")
            .attribute(BasicMetadata::id("id"))
            .attribute(BasicMetadata::new("name"))
            .attribute(AssociationMetadata::one_to_many("orders", "Order").mapped_by("customer"))
    }

    fn order() -> EntityMetadata {
        EntityMetadata::new("Order")
            .table("orders")
            .attribute(BasicMetadata::id("id"))
            .attribute(BasicMetadata::version("version"))
            .attribute(
                AssociationMetadata::many_to_one("customer", "Customer")
                    .cascade(CascadeType::Persist),
            )
    }

    fn kind_of(result: Result<MappingGraph>) -> MappingErrorKind {
        result
            .unwrap_err()
            .mapping_kind()
            .unwrap_or(MappingErrorKind::Invalid)
    }

    #[test]
    fn bidirectional_pair_follows_conventions() {
        let graph = resolve(&MetadataSet::new().entity(customer()).entity(order())).unwrap();

        let order = graph.entity("Order").unwrap();
        let attr = order.attribute(&"customer".into()).unwrap();
        assert!(matches!(attr, AttributeMapping::OwnerToOne(_)));
        assert_eq!(attr.fetch(), FetchType::Eager);
        assert_eq!(
            attr.join_strategy(),
            Some(&JoinStrategy::SourceColumns(vec![JoinColumn::new("customer_id", "id")]))
        );
        assert_eq!(attr.opposite(), Some(&AttributePath::root("orders")));

        let customer = graph.entity("Customer").unwrap();
        let inverse = customer.attribute(&"orders".into()).unwrap();
        assert!(matches!(inverse, AttributeMapping::InverseToMany(_)));
        assert_eq!(inverse.fetch(), FetchType::Lazy);
        assert_eq!(inverse.join_strategy(), Some(&JoinStrategy::Inverse));

        // opposite of opposite is the attribute itself
        let (_, back) = graph.opposite(attr.association().unwrap()).unwrap();
        let (owner_type, owner) = graph.opposite(back.association().unwrap()).unwrap();
        assert_eq!(owner_type.name(), "Order");
        assert_eq!(owner.path(), attr.path());
    }

    #[test]
    fn many_to_many_synthesises_join_table() {
        let meta = MetadataSet::new()
            .entity(
                EntityMetadata::new("Student")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(AssociationMetadata::many_to_many("courses", "Course")),
            )
            .entity(
                EntityMetadata::new("Course")
                    .attribute(BasicMetadata::id("code"))
                    .attribute(
                        AssociationMetadata::many_to_many("students", "Student")
                            .mapped_by("courses"),
                    ),
            );
        let graph = resolve(&meta).unwrap();
        let courses = graph
            .entity("Student")
            .unwrap()
            .association(&"courses".into())
            .unwrap();
        let table = courses.join_strategy().unwrap().join_table().unwrap();
        assert_eq!(table.name, "student_course");
        assert_eq!(table.owner_columns, vec![JoinColumn::new("student_id", "id")]);
        assert_eq!(table.inverse_columns, vec![JoinColumn::new("courses_code", "code")]);
        assert_eq!(courses.opposite(), Some(&AttributePath::root("students")));
    }

    #[test]
    fn owning_one_to_many_without_opposite() {
        let line = EntityMetadata::new("Line").attribute(BasicMetadata::id("id"));
        let by_table = EntityMetadata::new("Invoice")
            .attribute(BasicMetadata::id("id"))
            .attribute(AssociationMetadata::one_to_many("lines", "Line"));
        let graph = resolve(&MetadataSet::new().entity(line.clone()).entity(by_table)).unwrap();
        let lines = graph.entity("Invoice").unwrap().association(&"lines".into()).unwrap();
        assert_eq!(lines.opposite(), None);
        assert_eq!(
            lines.join_strategy().unwrap().join_table().unwrap().name,
            "invoice_line"
        );

        let by_column = EntityMetadata::new("Invoice")
            .attribute(BasicMetadata::id("id"))
            .attribute(
                AssociationMetadata::one_to_many("lines", "Line")
                    .join_column(JoinColumnMetadata::named("invoice_id")),
            );
        let graph = resolve(&MetadataSet::new().entity(line).entity(by_column)).unwrap();
        let lines = graph.entity("Invoice").unwrap().association(&"lines".into()).unwrap();
        assert_eq!(
            lines.join_strategy(),
            Some(&JoinStrategy::TargetColumns(vec![JoinColumn::new("invoice_id", "id")]))
        );
    }

    #[test]
    fn join_column_list_takes_precedence_over_single_column() {
        let meta = MetadataSet::new().entity(customer()).entity(
            EntityMetadata::new("Order")
                .attribute(BasicMetadata::id("id"))
                .attribute(
                    AssociationMetadata::many_to_one("customer", "Customer")
                        .join_columns(vec![JoinColumnMetadata::named("buyer").nullable(false)])
                        .join_column(JoinColumnMetadata::named("ignored")),
                ),
        );
        let graph = resolve(&meta).unwrap();
        let columns = graph
            .entity("Order")
            .unwrap()
            .association(&"customer".into())
            .unwrap()
            .join_strategy()
            .unwrap()
            .source_columns()
            .unwrap()
            .to_vec();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].column, "buyer");
        assert!(!columns[0].nullable);
    }

    #[test]
    fn join_columns_and_join_table_are_ambiguous() {
        let meta = MetadataSet::new().entity(customer()).entity(
            EntityMetadata::new("Order")
                .attribute(BasicMetadata::id("id"))
                .attribute(
                    AssociationMetadata::many_to_one("customer", "Customer")
                        .join_column(JoinColumnMetadata::named("customer_fk"))
                        .join_table(JoinTableMetadata::named("order_customer")),
                ),
        );
        assert_eq!(kind_of(resolve(&meta)), MappingErrorKind::AmbiguousJoin);
    }

    #[test]
    fn mapped_by_must_name_an_owning_association_back_to_the_source() {
        let with_mapped_by = |mapped_by: &str| {
            MetadataSet::new().entity(order()).entity(
                EntityMetadata::new("Customer")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(BasicMetadata::new("name"))
                    .attribute(
                        AssociationMetadata::one_to_many("orders", "Order").mapped_by(mapped_by),
                    ),
            )
        };
        assert_eq!(
            kind_of(resolve(&with_mapped_by("missing"))),
            MappingErrorKind::InvalidMappedBy
        );
        assert_eq!(
            kind_of(resolve(&with_mapped_by("version"))),
            MappingErrorKind::InvalidMappedBy
        );

        let wrong_target = MetadataSet::new()
            .entity(customer())
            .entity(EntityMetadata::new("Shop").attribute(BasicMetadata::id("id")))
            .entity(
                EntityMetadata::new("Order")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(AssociationMetadata::many_to_one("customer", "Shop")),
            );
        assert_eq!(kind_of(resolve(&wrong_target)), MappingErrorKind::InvalidMappedBy);

        let both_inverse = MetadataSet::new()
            .entity(
                EntityMetadata::new("A")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(AssociationMetadata::one_to_one("b", "B").mapped_by("a")),
            )
            .entity(
                EntityMetadata::new("B")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(AssociationMetadata::one_to_one("a", "A").mapped_by("b")),
            );
        assert_eq!(kind_of(resolve(&both_inverse)), MappingErrorKind::InvalidMappedBy);
    }

    #[test]
    fn unresolved_names() {
        let meta = MetadataSet::new().entity(order());
        assert_eq!(kind_of(resolve(&meta)), MappingErrorKind::UnresolvedTarget);

        let orphan_child = MetadataSet::new().entity(EntityMetadata::new("Car").extends("Vehicle"));
        assert_eq!(kind_of(resolve(&orphan_child)), MappingErrorKind::UnresolvedTarget);
    }

    #[test]
    fn identifier_and_version_rules() {
        let no_id = MetadataSet::new().entity(EntityMetadata::new("Thing"));
        assert_eq!(kind_of(resolve(&no_id)), MappingErrorKind::MissingIdentifier);

        let generated_composite = MetadataSet::new().entity(
            EntityMetadata::new("Thing")
                .attribute(BasicMetadata::id("a").generated(GenerationType::Identity))
                .attribute(BasicMetadata::id("b")),
        );
        assert_eq!(
            kind_of(resolve(&generated_composite)),
            MappingErrorKind::MissingIdentifier
        );

        let two_versions = MetadataSet::new().entity(
            EntityMetadata::new("Thing")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::version("v1"))
                .attribute(BasicMetadata::version("v2")),
        );
        assert_eq!(kind_of(resolve(&two_versions)), MappingErrorKind::DuplicateVersion);
    }

    #[test]
    fn column_rules() {
        let bad_name = MetadataSet::new().entity(
            EntityMetadata::new("Thing")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("name").column("name; DROP TABLE x")),
        );
        assert_eq!(kind_of(resolve(&bad_name)), MappingErrorKind::InvalidIdentifier);

        let duplicate = MetadataSet::new().entity(
            EntityMetadata::new("Thing")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("a").column("shared"))
                .attribute(BasicMetadata::new("b").column("shared")),
        );
        assert_eq!(kind_of(resolve(&duplicate)), MappingErrorKind::DuplicateColumn);

        let read_only_copy = MetadataSet::new().entity(
            EntityMetadata::new("Thing")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("a").column("shared"))
                .attribute(
                    BasicMetadata::new("b")
                        .column("shared")
                        .insertable(false)
                        .updatable(false),
                ),
        );
        assert!(resolve(&read_only_copy).is_ok());
    }

    #[test]
    fn join_columns_must_match_target_identifier() {
        let referencing = |column: JoinColumnMetadata| {
            MetadataSet::new().entity(customer()).entity(
                EntityMetadata::new("Order")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(
                        AssociationMetadata::many_to_one("customer", "Customer")
                            .join_column(column),
                    ),
            )
        };
        assert_eq!(
            kind_of(resolve(&referencing(
                JoinColumnMetadata::named("customer_name").references("name")
            ))),
            MappingErrorKind::InvalidJoinColumn
        );

        let too_wide = MetadataSet::new().entity(customer()).entity(
            EntityMetadata::new("Order")
                .attribute(BasicMetadata::id("id"))
                .attribute(
                    AssociationMetadata::many_to_one("customer", "Customer").join_columns(vec![
                        JoinColumnMetadata::named("c1"),
                        JoinColumnMetadata::named("c2"),
                    ]),
                ),
        );
        assert_eq!(kind_of(resolve(&too_wide)), MappingErrorKind::InvalidJoinColumn);
    }

    #[test]
    fn resolution_is_idempotent_and_links_once() {
        let meta = MetadataSet::new().entity(customer()).entity(order());
        let first = resolve(&meta).unwrap();
        let second = resolve(&meta).unwrap();
        assert_eq!(first, second);

        let err = link(&first).unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::AlreadyLinked));
    }

    #[test]
    fn embedded_paths_prefix_columns() {
        let meta = MetadataSet::new()
            .entity(EntityMetadata::new("Country").attribute(BasicMetadata::id("code")))
            .entity(
                EntityMetadata::new("Person")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(
                        EmbeddedMetadata::new("address")
                            .attribute(BasicMetadata::new("city"))
                            .attribute(AssociationMetadata::many_to_one("country", "Country")),
                    ),
            );
        let graph = resolve(&meta).unwrap();
        let person = graph.entity("Person").unwrap();

        let city = person.attribute(&"address.city".into()).unwrap();
        assert_eq!(city.basic().unwrap().column.name, "address_city");
        let country = person.association(&"address.country".into()).unwrap();
        assert_eq!(
            country.join_strategy().unwrap().source_columns().unwrap()[0].column,
            "address_country_code"
        );
        assert!(person.attribute(&"city".into()).is_none());
    }

    #[test]
    fn resolve_attribute_restores_the_path() {
        let mut path = VecDeque::from(vec!["outer".to_string()]);
        let meta = AttributeMetadata::from(
            EmbeddedMetadata::new("inner").attribute(BasicMetadata::new("leaf")),
        );
        let mapping = resolve_attribute("Thing", &meta, &mut path).unwrap();
        assert_eq!(path, VecDeque::from(vec!["outer".to_string()]));
        let AttributeMapping::Embedded(embedded) = mapping else {
            panic!("expected an embedded mapping");
        };
        assert_eq!(embedded.attributes[0].path().to_string(), "outer.inner.leaf");
    }

    #[test]
    fn single_table_inheritance() {
        let meta = MetadataSet::new()
            .entity(
                EntityMetadata::new("Vehicle")
                    .table("vehicles")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(BasicMetadata::new("wheels")),
            )
            .entity(
                EntityMetadata::new("Truck")
                    .extends("Vehicle")
                    .attribute(BasicMetadata::new("payload")),
            );
        let graph = resolve(&meta).unwrap();
        let truck = graph.entity("Truck").unwrap();
        assert_eq!(truck.table(), "vehicles");
        assert_eq!(truck.root(), "Vehicle");
        let names: Vec<_> = truck.attributes().iter().map(AttributeMapping::name).collect();
        assert_eq!(names, vec!["id", "wheels", "payload"]);
        assert_eq!(truck.discriminator().unwrap().value, "Truck");

        let vehicle = graph.entity("Vehicle").unwrap();
        assert_eq!(vehicle.subtypes(), ["Truck".to_string()]);
        assert_eq!(vehicle.discriminator().unwrap().column, DEFAULT_DISCRIMINATOR_COLUMN);
        assert!(graph.is_assignable("Truck", "Vehicle"));
        assert!(!graph.is_assignable("Vehicle", "Truck"));
        assert_eq!(graph.concrete_type(vehicle, Some("Truck")).name(), "Truck");
    }

    #[test]
    fn collection_order_is_resolved_and_checked() {
        let line = EntityMetadata::new("Line")
            .attribute(BasicMetadata::id("id"))
            .attribute(BasicMetadata::new("amount"));
        let invoice = |lines: AssociationMetadata| {
            MetadataSet::new().entity(line.clone()).entity(
                EntityMetadata::new("Invoice")
                    .attribute(BasicMetadata::id("id"))
                    .attribute(lines),
            )
        };

        let graph =
            resolve(&invoice(AssociationMetadata::one_to_many("lines", "Line").order_column(""))).unwrap();
        let lines = graph.entity("Invoice").unwrap().association(&"lines".into()).unwrap();
        assert_eq!(lines.order_column(), Some("lines_order"));

        let graph = resolve(&invoice(
            AssociationMetadata::one_to_many("lines", "Line").order_by("amount DESC"),
        ))
        .unwrap();
        let lines = graph.entity("Invoice").unwrap().association(&"lines".into()).unwrap();
        assert_eq!(lines.order_column(), None);
        assert!(matches!(lines.order(), Some(CollectionOrder::By(keys)) if keys[0].descending));

        for bad in [
            AssociationMetadata::one_to_many("lines", "Line").order_by("missing"),
            AssociationMetadata::one_to_many("lines", "Line")
                .order_by("amount")
                .order_column("position"),
            AssociationMetadata::many_to_one("lines", "Line").order_column("position"),
        ] {
            let err = resolve(&invoice(bad)).unwrap_err();
            assert_eq!(err.mapping_kind(), Some(MappingErrorKind::Invalid));
        }
    }
}
