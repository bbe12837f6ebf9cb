mod common;

use common::{blog_graph, blog_metadata};
use entmap::prelude::*;
use entmap::{
    AttributeMapping, AttributePath, Cardinality, GraphCache, JoinStrategy, MappingErrorKind,
    MappingGraph,
};
use entmap_memory::MemoryRowSource;
use std::sync::Arc;

#[test]
fn resolving_the_same_metadata_twice_gives_equal_graphs() {
    let first = MappingGraph::resolve(&blog_metadata()).unwrap();
    let second = MappingGraph::resolve(&blog_metadata()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn opposite_of_opposite_is_the_original_attribute() {
    let graph = blog_graph();
    let post = graph.entity("Post").unwrap();
    let tags = post.association(&"tags".into()).unwrap();

    let (tag_type, posts) = graph.opposite(tags).unwrap();
    assert_eq!(tag_type.name(), "Tag");
    assert_eq!(posts.path(), &AttributePath::root("posts"));

    let (back_type, back) = graph.opposite(posts.association().unwrap()).unwrap();
    assert_eq!(back_type.name(), "Post");
    assert_eq!(back.path(), tags.path());
}

#[test]
fn mapped_by_side_defers_to_the_owner() {
    let graph = blog_graph();
    let tag = graph.entity("Tag").unwrap();
    let posts = tag.attribute(&"posts".into()).unwrap();
    assert!(matches!(posts, AttributeMapping::InverseToMany(_)));
    assert_eq!(posts.join_strategy(), Some(&JoinStrategy::Inverse));

    let (owner_type, owner) = graph.owning_side(tag, posts.association().unwrap()).unwrap();
    assert_eq!(owner_type.name(), "Post");
    assert_eq!(owner.name(), "tags");

    let table = owner.join_strategy().unwrap().join_table().unwrap();
    assert_eq!(table.name, "posts_tags");
    assert_eq!(table.owner_columns[0].column, "post_id");
    assert_eq!(table.inverse_columns[0].column, "tags_id");
}

#[test]
fn conventions_for_the_blog_model() {
    let graph = blog_graph();
    let post = graph.entity("Post").unwrap();

    let author = post.attribute(&"author".into()).unwrap();
    assert_eq!(author.fetch(), FetchType::Eager);
    assert_eq!(
        author.join_strategy().unwrap().source_columns().unwrap()[0].column,
        "author_id"
    );

    let comments = post.attribute(&"comments".into()).unwrap();
    assert_eq!(comments.cardinality(), Some(Cardinality::Many));
    assert_eq!(comments.fetch(), FetchType::Lazy);
    let Some(JoinStrategy::TargetColumns(columns)) = comments.join_strategy() else {
        panic!("comments should be mapped through a column on the target table");
    };
    assert_eq!(columns[0].column, "post_id");
    assert_eq!(columns[0].referenced_column, "id");
    assert!(comments.association().unwrap().orphan_removal());

    let version = post.version_mapping().unwrap();
    assert_eq!(version.column.name, "version");
    assert_eq!(post.id_columns(), vec!["id"]);
}

#[test]
fn unresolved_target_is_a_mapping_error() {
    let meta = MetadataSet::new().entity(
        EntityMetadata::new("Post")
            .attribute(BasicMetadata::id("id"))
            .attribute(AssociationMetadata::many_to_one("author", "Writer")),
    );
    let err = MappingGraph::resolve(&meta).unwrap_err();
    assert_eq!(err.mapping_kind(), Some(MappingErrorKind::UnresolvedTarget));
}

#[test]
fn json_metadata_drives_a_context() {
    let json = r#"{
        "entities": [
            {
                "name": "Customer",
                "table": "customers",
                "attributes": [
                    { "mapping": "basic", "name": "id", "id": true,
                      "generated": { "strategy": "SEQUENCE", "name": "customer_seq" } },
                    { "mapping": "basic", "name": "name" },
                    { "mapping": "association", "name": "orders", "kind": "ONE_TO_MANY",
                      "target_entity": "Order", "mapped_by": "customer" }
                ]
            },
            {
                "name": "Order",
                "table": "orders",
                "attributes": [
                    { "mapping": "basic", "name": "id", "id": true },
                    { "mapping": "association", "name": "customer", "kind": "MANY_TO_ONE",
                      "target_entity": "Customer", "cascades": ["PERSIST"],
                      "join_column": { "name": "customer_fk", "nullable": false } }
                ]
            }
        ]
    }"#;

    let factory =
        EntityManagerFactory::from_json("json-shop", json, MemoryRowSource::new()).unwrap();
    let mut ctx = factory.create_context();

    let customer = ObjectRef::new("Customer").with("name", "Ada");
    let order = ObjectRef::new("Order")
        .with("id", 7i64)
        .with("customer", customer.clone());
    ctx.persist(&order).unwrap();

    // sequence values are drawn at persist time
    assert_eq!(customer.value("id"), Value::BigInt(1));
    assert_eq!(ctx.state_of(&customer), Some(InstanceState::New));

    let result = ctx.commit().unwrap();
    assert_eq!(result.inserted, 2);
    let orders = factory.row_source().rows("orders");
    assert_eq!(orders[0].get_by_name("customer_fk"), Some(&Value::BigInt(1)));
    assert!(!orders[0].contains_column("customer_id"));
}

#[test]
fn graph_cache_resolves_each_unit_once() {
    let cache = GraphCache::new();
    let first = cache
        .get_or_resolve("blog", || Ok(blog_metadata()))
        .unwrap();
    let second = cache
        .get_or_resolve("blog", || panic!("already resolved"))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);

    // a failed resolution is not cached
    let broken = MetadataSet::new().entity(EntityMetadata::new("NoId"));
    assert!(cache.get_or_resolve("broken", || Ok(broken)).is_err());
    assert!(cache.get("broken").is_none());
}
