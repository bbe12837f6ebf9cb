//! The row-source contract.
//!
//! A row source is the storage collaborator the persistence context talks to.
//! Calls are synchronous and may block; cancellation, timeouts and
//! transactions are the row source's own business. Errors come back
//! uninterpreted and are handed to the caller unchanged.

use crate::Result;
use crate::row::Row;
use crate::value::Value;

/// Ordered `(column, value)` pairs, used both for written values and for
/// equality predicates (all pairs AND-ed together).
pub type ColumnValues = Vec<(String, Value)>;

/// Outcome of a single-row insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResult {
    /// Number of rows written
    pub affected: u64,
    /// Key assigned by the store for identity-generated columns
    pub generated_key: Option<Value>,
}

impl InsertResult {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            generated_key: None,
        }
    }

    #[must_use]
    pub fn with_generated_key(mut self, key: Value) -> Self {
        self.generated_key = Some(key);
        self
    }
}

/// Storage collaborator executing row-level reads and writes.
pub trait RowSource {
    /// Fetch the single row of `table` matching every predicate pair.
    fn fetch_row(&self, table: &str, predicate: &[(String, Value)]) -> Result<Option<Row>>;

    /// Fetch every row of `table` matching every predicate pair.
    ///
    /// An empty predicate selects the whole table.
    fn fetch_rows(&self, table: &str, predicate: &[(String, Value)]) -> Result<Vec<Row>>;

    /// Insert one row.
    fn execute_insert(&self, table: &str, values: &[(String, Value)]) -> Result<InsertResult>;

    /// Update the rows matching `predicate`, returning the affected count.
    fn execute_update(
        &self,
        table: &str,
        values: &[(String, Value)],
        predicate: &[(String, Value)],
    ) -> Result<u64>;

    /// Delete the rows matching `predicate`, returning the affected count.
    fn execute_delete(&self, table: &str, predicate: &[(String, Value)]) -> Result<u64>;

    /// Next value of a named sequence.
    fn next_sequence_value(&self, sequence: &str) -> Result<Value>;
}

impl<R: RowSource + ?Sized> RowSource for &R {
    fn fetch_row(&self, table: &str, predicate: &[(String, Value)]) -> Result<Option<Row>> {
        (**self).fetch_row(table, predicate)
    }

    fn fetch_rows(&self, table: &str, predicate: &[(String, Value)]) -> Result<Vec<Row>> {
        (**self).fetch_rows(table, predicate)
    }

    fn execute_insert(&self, table: &str, values: &[(String, Value)]) -> Result<InsertResult> {
        (**self).execute_insert(table, values)
    }

    fn execute_update(
        &self,
        table: &str,
        values: &[(String, Value)],
        predicate: &[(String, Value)],
    ) -> Result<u64> {
        (**self).execute_update(table, values, predicate)
    }

    fn execute_delete(&self, table: &str, predicate: &[(String, Value)]) -> Result<u64> {
        (**self).execute_delete(table, predicate)
    }

    fn next_sequence_value(&self, sequence: &str) -> Result<Value> {
        (**self).next_sequence_value(sequence)
    }
}

impl<R: RowSource + ?Sized> RowSource for std::sync::Arc<R> {
    fn fetch_row(&self, table: &str, predicate: &[(String, Value)]) -> Result<Option<Row>> {
        (**self).fetch_row(table, predicate)
    }

    fn fetch_rows(&self, table: &str, predicate: &[(String, Value)]) -> Result<Vec<Row>> {
        (**self).fetch_rows(table, predicate)
    }

    fn execute_insert(&self, table: &str, values: &[(String, Value)]) -> Result<InsertResult> {
        (**self).execute_insert(table, values)
    }

    fn execute_update(
        &self,
        table: &str,
        values: &[(String, Value)],
        predicate: &[(String, Value)],
    ) -> Result<u64> {
        (**self).execute_update(table, values, predicate)
    }

    fn execute_delete(&self, table: &str, predicate: &[(String, Value)]) -> Result<u64> {
        (**self).execute_delete(table, predicate)
    }

    fn next_sequence_value(&self, sequence: &str) -> Result<Value> {
        (**self).next_sequence_value(sequence)
    }
}
