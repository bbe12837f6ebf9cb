mod common;

use common::{blog_factory, seeded_blog};
use entmap::prelude::*;
use entmap_memory::{MemoryRowSource, Operation};

fn mutual(unit: &str, nullable: bool) -> EntityManagerFactory<MemoryRowSource> {
    let meta = MetadataSet::new()
        .entity(
            EntityMetadata::new("Alpha")
                .attribute(BasicMetadata::id("id"))
                .attribute(
                    AssociationMetadata::many_to_one("beta", "Beta")
                        .join_column(JoinColumnMetadata::named("beta_id").nullable(nullable))
                        .cascade(CascadeType::Persist),
                ),
        )
        .entity(
            EntityMetadata::new("Beta")
                .attribute(BasicMetadata::id("id"))
                .attribute(
                    AssociationMetadata::many_to_one("alpha", "Alpha")
                        .join_column(JoinColumnMetadata::named("alpha_id").nullable(nullable))
                        .cascade(CascadeType::Persist),
                ),
        );
    EntityManagerFactory::from_metadata(unit, &meta, MemoryRowSource::new()).unwrap()
}

fn linked_pair() -> (ObjectRef, ObjectRef) {
    let a = ObjectRef::new("Alpha").with("id", 1i64);
    let b = ObjectRef::new("Beta").with("id", 2i64).with("alpha", a.clone());
    a.set("beta", b.clone());
    (a, b)
}

#[test]
fn nullable_cycle_is_broken_with_a_follow_up_update() {
    let factory = mutual("ordering-nullable", true);
    let rows = factory.row_source();
    let mut ctx = factory.create_context();

    let (a, b) = linked_pair();
    ctx.persist(&a).unwrap();
    assert_eq!(ctx.state_of(&b), Some(InstanceState::New));

    let result = ctx.flush().unwrap();
    assert_eq!(
        serde_json::to_value(result).unwrap(),
        serde_json::json!({"inserted": 2, "updated": 1, "deleted": 0, "join_rows": 0})
    );

    let writes = rows.writes();
    assert!(matches!(&writes[0], Operation::Insert { table } if table == "alpha"));
    assert!(matches!(&writes[1], Operation::Insert { table } if table == "beta"));
    assert!(matches!(&writes[2], Operation::Update { table, affected: 1 } if table == "alpha"));

    let alpha = rows.rows("alpha");
    assert_eq!(alpha[0].get_by_name("beta_id"), Some(&Value::BigInt(2)));
    let beta = rows.rows("beta");
    assert_eq!(beta[0].get_by_name("alpha_id"), Some(&Value::BigInt(1)));

    assert_eq!(ctx.state_of(&a), Some(InstanceState::Managed));
    assert!(ctx.change_set(&a).unwrap().is_empty());
}

#[test]
fn non_nullable_cycle_fails_without_writing() {
    let factory = mutual("ordering-strict", false);
    let mut ctx = factory.create_context();

    let (a, b) = linked_pair();
    ctx.persist(&a).unwrap();

    let cycle = match ctx.flush() {
        Err(Error::CyclicDependency(cycle)) => cycle,
        other => panic!("expected a cycle error, got {other:?}"),
    };
    assert!(cycle.entities.contains(&"Alpha".to_string()));
    assert!(cycle.entities.contains(&"Beta".to_string()));

    assert_eq!(ctx.state_of(&a), Some(InstanceState::New));
    assert_eq!(ctx.state_of(&b), Some(InstanceState::New));
    assert!(factory.row_source().writes().is_empty());
}

#[test]
fn concurrent_update_is_an_optimistic_lock_failure() {
    let factory = blog_factory("ordering-stale", seeded_blog());
    let mut first = factory.create_context();
    let mut second = factory.create_context();

    let mine = first.find("Post", 1i64).unwrap().unwrap();
    let theirs = second.find("Post", 1i64).unwrap().unwrap();
    assert!(!mine.ptr_eq(&theirs));

    mine.set("title", "Mine");
    first.flush().unwrap();
    assert_eq!(mine.value("version"), Value::BigInt(2));

    theirs.set("title", "Theirs");
    let err = second.flush().unwrap_err();
    assert!(err.is_optimistic_lock());
    assert!(err.is_recoverable());
    let Error::OptimisticLock(stale) = err else {
        unreachable!();
    };
    assert_eq!(stale.table, "posts");
    assert_eq!(stale.id, vec![Value::BigInt(1)]);
    assert_eq!(stale.expected_version, Some(Value::BigInt(1)));

    // the losing context keeps its unflushed state
    assert_eq!(second.state_of(&theirs), Some(InstanceState::Managed));
    assert_eq!(theirs.value("version"), Value::BigInt(1));
    assert_eq!(second.change_set(&theirs).unwrap().len(), 1);

    let stored = factory.row_source().rows("posts");
    assert_eq!(stored[0].get_by_name("title"), Some(&Value::Text("Mine".into())));
}

#[test]
fn merging_a_stale_copy_is_rejected() {
    let factory = blog_factory("ordering-stale-merge", seeded_blog());
    let mut writer = factory.create_context();
    let post = writer.find("Post", 1i64).unwrap().unwrap();
    post.set("title", "Edited");
    writer.commit().unwrap();

    let copy = ObjectRef::new("Post")
        .with("id", 1i64)
        .with("title", "Stale edit")
        .with("version", 1i64);
    let mut ctx = factory.create_context();
    let err = ctx.merge(&copy).unwrap_err();
    assert!(err.is_optimistic_lock());
}

#[test]
fn failed_flush_leaves_instances_as_they_were() {
    let meta = MetadataSet::new()
        .entity(
            EntityMetadata::new("Ticket")
                .attribute(BasicMetadata::id("id").generated(GenerationType::Identity))
                .attribute(BasicMetadata::new("title"))
                .attribute(BasicMetadata::version("version")),
        )
        .entity(
            EntityMetadata::new("Attachment")
                .attribute(BasicMetadata::id("id"))
                .attribute(
                    AssociationMetadata::many_to_one("ticket", "Ticket")
                        .cascade(CascadeType::Persist),
                ),
        );
    let rows = MemoryRowSource::new().with_identity("ticket", "id");
    let factory = EntityManagerFactory::from_metadata("ordering-failure", &meta, rows).unwrap();
    let rows = factory.row_source();
    let mut ctx = factory.create_context();

    let ticket = ObjectRef::new("Ticket").with("title", "Broken build");
    let attachment = ObjectRef::new("Attachment")
        .with("id", 5i64)
        .with("ticket", ticket.clone());
    ctx.persist(&attachment).unwrap();

    rows.fail_on("attachment");
    let err = ctx.flush().unwrap_err();
    assert!(matches!(err, Error::RowSource(_)));
    assert!(!err.is_recoverable());

    // generated key and initial version were handed back
    assert!(ticket.value("id").is_null());
    assert!(ticket.value("version").is_null());
    assert_eq!(ctx.state_of(&ticket), Some(InstanceState::New));
    assert_eq!(ctx.state_of(&attachment), Some(InstanceState::New));

    rows.recover("attachment");
    let result = ctx.flush().unwrap();
    assert_eq!(result.inserted, 2);
    let id = ticket.value("id");
    assert!(!id.is_null());
    assert_eq!(ticket.value("version"), Value::BigInt(1));
    assert_eq!(ctx.state_of(&ticket), Some(InstanceState::Managed));

    let stored = rows.rows("attachment");
    assert_eq!(stored[0].get_by_name("ticket_id"), Some(&id));
}
