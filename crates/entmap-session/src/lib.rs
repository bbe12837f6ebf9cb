//! Persistence context and unit of work for entmap.
//!
//! `entmap-session` is the **runtime layer**. Given a resolved
//! [`MappingGraph`](entmap_mapping::MappingGraph) and a
//! [`RowSource`](entmap_core::RowSource), it tracks application objects and
//! turns their changes into row operations.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one object per (hierarchy root, identifier).
//! - **Change tracking**: snapshots taken at load or flush, diffed at flush.
//! - **Flush ordering**: inserts by foreign-key dependency, deletes in reverse,
//!   nullable cycles broken with a follow-up update.
//! - **Row emission**: base-table, join-table and target-row operations.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = PersistenceContext::new(graph, rows);
//!
//! let customer = ObjectRef::new("Customer").with("id", 1i64).with("name", "Ada");
//! ctx.persist(&customer)?;
//!
//! if let Some(order) = ctx.find("Order", 10i64)? {
//!     let owner = ctx.get(&order, "customer")?;
//! }
//!
//! ctx.commit()?;
//! ```

pub mod change_tracker;
pub mod context;
pub mod emitter;
pub mod flush;
pub mod identity_map;
pub mod managed;
pub mod object;

pub use change_tracker::{Change, ChangeSet, Snapshot, SnapshotValue};
pub use context::{ContextConfig, PersistenceContext};
pub use emitter::{Emitter, PlannedUpdate, RowOperation};
pub use flush::{DeferredLink, Dependency, FlushOrderer, FlushResult, InsertOrder};
pub use identity_map::IdentityMap;
pub use managed::{InstanceState, LazyKey, ManagedInstance, entity_id};
pub use object::{EntityObject, FieldValue, Fields, ObjectRef};
