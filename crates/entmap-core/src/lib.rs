//! Core types and traits for entmap.
//!
//! This crate provides the foundations every other layer builds on:
//!
//! - `Value` for dynamically-typed column values
//! - `Row` for relational rows handed back by a row source
//! - `RowSource` for the synchronous storage collaborator
//! - `Error` with the mapping / state / optimistic-lock taxonomy
//! - identifier validation and quoting helpers

pub mod error;
pub mod identifiers;
pub mod row;
pub mod row_source;
pub mod value;

pub use error::{
    CycleError, Error, MappingError, MappingErrorKind, OptimisticLockError, Result,
    RowSourceError, RowSourceErrorKind, StateError, TypeError,
};
pub use identifiers::{is_valid_identifier, quote_ident, to_snake_case};
pub use row::Row;
pub use row_source::{ColumnValues, InsertResult, RowSource};
pub use value::{EntityId, Value};
