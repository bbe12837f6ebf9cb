#![allow(dead_code)]

use entmap::prelude::*;
use entmap::MappingGraph;
use entmap_memory::MemoryRowSource;
use std::sync::Arc;

/// Author 1-* Post (inverse `posts`), Post *-* Tag (owned by Post), Post 1-*
/// Comment through a `post_id` column on `comments`.
pub fn blog_metadata() -> MetadataSet {
    MetadataSet::new()
        .entity(
            EntityMetadata::new("Author")
                .table("authors")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("name"))
                .attribute(AssociationMetadata::one_to_many("posts", "Post").mapped_by("author")),
        )
        .entity(
            EntityMetadata::new("Post")
                .table("posts")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("title"))
                .attribute(BasicMetadata::version("version"))
                .attribute(
                    AssociationMetadata::many_to_one("author", "Author")
                        .cascade(CascadeType::Persist),
                )
                .attribute(
                    AssociationMetadata::many_to_many("tags", "Tag").cascade(CascadeType::Persist),
                )
                .attribute(
                    AssociationMetadata::one_to_many("comments", "Comment")
                        .join_column(JoinColumnMetadata::named("post_id"))
                        .cascade(CascadeType::All)
                        .orphan_removal(true),
                ),
        )
        .entity(
            EntityMetadata::new("Tag")
                .table("tags")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("label"))
                .attribute(AssociationMetadata::many_to_many("posts", "Post").mapped_by("tags")),
        )
        .entity(
            EntityMetadata::new("Comment")
                .table("comments")
                .attribute(BasicMetadata::id("id"))
                .attribute(BasicMetadata::new("body")),
        )
}

pub fn blog_graph() -> Arc<MappingGraph> {
    Arc::new(MappingGraph::resolve(&blog_metadata()).unwrap())
}

/// Author 1 wrote post 1 (version 1), tagged 10 and carrying comment 100.
pub fn seeded_blog() -> MemoryRowSource {
    MemoryRowSource::new()
        .with_primary_key("authors", &["id"])
        .with_primary_key("posts", &["id"])
        .with_primary_key("tags", &["id"])
        .with_primary_key("comments", &["id"])
        .seed(
            "authors",
            vec![vec![("id", Value::BigInt(1)), ("name", "Ada".into())]],
        )
        .seed(
            "posts",
            vec![vec![
                ("id", Value::BigInt(1)),
                ("title", "Hello".into()),
                ("version", Value::BigInt(1)),
                ("author_id", Value::BigInt(1)),
            ]],
        )
        .seed(
            "tags",
            vec![vec![("id", Value::BigInt(10)), ("label", "rust".into())]],
        )
        .seed(
            "posts_tags",
            vec![vec![("post_id", Value::BigInt(1)), ("tags_id", Value::BigInt(10))]],
        )
        .seed(
            "comments",
            vec![vec![
                ("id", Value::BigInt(100)),
                ("body", "nice".into()),
                ("post_id", Value::BigInt(1)),
            ]],
        )
}

pub fn blog_factory(unit: &str, rows: MemoryRowSource) -> EntityManagerFactory<MemoryRowSource> {
    EntityManagerFactory::from_metadata(unit, &blog_metadata(), rows).unwrap()
}
