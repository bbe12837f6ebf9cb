//! In-memory row source for entmap.
//!
//! `entmap-memory` keeps tables as vectors of `(column, value)` rows behind a
//! mutex and implements [`RowSource`] over them. It has no schema: a column
//! missing from a row reads as NULL, and predicates compare with
//! [`Value::matches`] so integer widths do not matter.
//!
//! Beyond plain storage it can
//!
//! - assign identity keys (`with_identity`)
//! - reject duplicate primary keys (`with_primary_key`)
//! - fail every operation on a table (`fail_on`), for exercising rollback
//! - record every call in an operation log
//!
//! # Example
//!
//! ```ignore
//! let rows = MemoryRowSource::new()
//!     .with_identity("orders", "id")
//!     .seed("customers", vec![vec![("id", Value::BigInt(1)), ("name", "Ada".into())]]);
//! let ctx = PersistenceContext::new(graph, &rows);
//! ```

use entmap_core::{
    InsertResult, Result, Row, RowSource, RowSourceError, RowSourceErrorKind, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

type StoredRow = Vec<(String, Value)>;

/// One call received by a [`MemoryRowSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Fetch { table: String },
    Insert { table: String },
    Update { table: String, affected: u64 },
    Delete { table: String, affected: u64 },
    Sequence { name: String },
}

impl Operation {
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::Fetch { table }
            | Operation::Insert { table }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. } => Some(table),
            Operation::Sequence { .. } => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Insert { .. } | Operation::Update { .. } | Operation::Delete { .. }
        )
    }
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<StoredRow>,
    identity: Option<String>,
    next_identity: i64,
    primary_key: Vec<String>,
}

impl Table {
    fn matching(&self, predicate: &[(String, Value)]) -> impl Iterator<Item = &StoredRow> {
        self.rows.iter().filter(move |row| matches_predicate(row, predicate))
    }

    fn key_of<'a>(&self, row: &'a StoredRow) -> Vec<&'a Value> {
        self.primary_key
            .iter()
            .map(|c| column(row, c).unwrap_or(&Value::Null))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    sequences: HashMap<String, i64>,
    failing: BTreeSet<String>,
    log: Vec<Operation>,
}

impl Inner {
    fn check(&self, table: &str) -> Result<()> {
        if self.failing.contains(table) {
            return Err(RowSourceError::new(
                RowSourceErrorKind::Database,
                format!("injected failure on table '{table}'"),
            )
            .on_table(table)
            .into());
        }
        Ok(())
    }

    fn table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }
}

fn column<'a>(row: &'a StoredRow, name: &str) -> Option<&'a Value> {
    row.iter().find(|(c, _)| c == name).map(|(_, v)| v)
}

fn matches_predicate(row: &StoredRow, predicate: &[(String, Value)]) -> bool {
    predicate.iter().all(|(name, expected)| {
        column(row, name)
            .unwrap_or(&Value::Null)
            .matches(expected)
    })
}

fn set_column(row: &mut StoredRow, name: &str, value: Value) {
    match row.iter_mut().find(|(c, _)| c == name) {
        Some((_, slot)) => *slot = value,
        None => row.push((name.to_string(), value)),
    }
}

fn to_row(row: &StoredRow) -> Row {
    Row::from_pairs(row.iter().cloned())
}

/// A [`RowSource`] backed by in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryRowSource {
    inner: Mutex<Inner>,
}

impl MemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Let the store assign `column` of `table` on insert when it is NULL
    /// or absent. The column also becomes the primary key unless one was set.
    #[must_use]
    pub fn with_identity(self, table: &str, column: &str) -> Self {
        {
            let mut inner = self.lock();
            let table = inner.table(table);
            table.identity = Some(column.to_string());
            if table.primary_key.is_empty() {
                table.primary_key = vec![column.to_string()];
            }
        }
        self
    }

    /// Reject inserts duplicating the values of `columns`.
    #[must_use]
    pub fn with_primary_key(self, table: &str, columns: &[&str]) -> Self {
        self.lock().table(table).primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Add rows to `table` without going through the log.
    #[must_use]
    pub fn seed<S: Into<String>>(self, table: &str, rows: Vec<Vec<(S, Value)>>) -> Self {
        {
            let mut inner = self.lock();
            let table = inner.table(table);
            for row in rows {
                let row: StoredRow = row.into_iter().map(|(c, v)| (c.into(), v)).collect();
                if let Some(identity) = table.identity.as_deref() {
                    if let Some(id) = column(&row, identity).and_then(Value::as_i64) {
                        table.next_identity = table.next_identity.max(id);
                    }
                }
                table.rows.push(row);
            }
        }
        self
    }

    /// Make every later operation on `table` fail.
    pub fn fail_on(&self, table: &str) {
        self.lock().failing.insert(table.to_string());
    }

    /// Undo [`fail_on`](Self::fail_on).
    pub fn recover(&self, table: &str) {
        self.lock().failing.remove(table);
    }

    /// Current rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(to_row).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Every call received so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.clone()
    }

    /// Write operations (inserts, updates and deletes) received so far.
    pub fn writes(&self) -> Vec<Operation> {
        self.lock().log.iter().filter(|op| op.is_write()).cloned().collect()
    }

    /// Number of fetches issued against `table`.
    pub fn fetch_count(&self, table: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|op| matches!(op, Operation::Fetch { table: t } if t == table))
            .count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }
}

impl RowSource for MemoryRowSource {
    fn fetch_row(&self, table: &str, predicate: &[(String, Value)]) -> Result<Option<Row>> {
        let mut inner = self.lock();
        inner.check(table)?;
        inner.log.push(Operation::Fetch {
            table: table.to_string(),
        });
        Ok(inner
            .tables
            .get(table)
            .and_then(|t| t.matching(predicate).next())
            .map(to_row))
    }

    fn fetch_rows(&self, table: &str, predicate: &[(String, Value)]) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        inner.check(table)?;
        inner.log.push(Operation::Fetch {
            table: table.to_string(),
        });
        Ok(inner
            .tables
            .get(table)
            .map(|t| t.matching(predicate).map(to_row).collect())
            .unwrap_or_default())
    }

    fn execute_insert(&self, table: &str, values: &[(String, Value)]) -> Result<InsertResult> {
        let mut inner = self.lock();
        inner.check(table)?;
        let name = table;
        let table = inner.table(name);

        let mut row: StoredRow = values.to_vec();
        let mut generated = None;
        if let Some(identity) = table.identity.clone() {
            match column(&row, &identity).and_then(Value::as_i64) {
                Some(id) => table.next_identity = table.next_identity.max(id),
                None => {
                    table.next_identity += 1;
                    let key = Value::BigInt(table.next_identity);
                    set_column(&mut row, &identity, key.clone());
                    generated = Some(key);
                }
            }
        }

        if !table.primary_key.is_empty() {
            let key = table.key_of(&row);
            let duplicate = table.rows.iter().any(|existing| {
                table
                    .key_of(existing)
                    .iter()
                    .zip(&key)
                    .all(|(a, b)| a.matches(b))
            });
            if duplicate {
                return Err(RowSourceError::new(
                    RowSourceErrorKind::Constraint,
                    format!("duplicate primary key {key:?}"),
                )
                .on_table(name)
                .into());
            }
        }

        table.rows.push(row);
        inner.log.push(Operation::Insert {
            table: name.to_string(),
        });
        tracing::trace!(table = %name, "Inserted row");

        let result = InsertResult::affected(1);
        Ok(match generated {
            Some(key) => result.with_generated_key(key),
            None => result,
        })
    }

    fn execute_update(
        &self,
        table: &str,
        values: &[(String, Value)],
        predicate: &[(String, Value)],
    ) -> Result<u64> {
        let mut inner = self.lock();
        inner.check(table)?;
        let mut affected = 0;
        for row in &mut inner.table(table).rows {
            if matches_predicate(row, predicate) {
                for (name, value) in values {
                    set_column(row, name, value.clone());
                }
                affected += 1;
            }
        }
        inner.log.push(Operation::Update {
            table: table.to_string(),
            affected,
        });
        Ok(affected)
    }

    fn execute_delete(&self, table: &str, predicate: &[(String, Value)]) -> Result<u64> {
        let mut inner = self.lock();
        inner.check(table)?;
        let rows = &mut inner.table(table).rows;
        let before = rows.len();
        rows.retain(|row| !matches_predicate(row, predicate));
        let affected = u64::try_from(before - rows.len()).unwrap_or(u64::MAX);
        inner.log.push(Operation::Delete {
            table: table.to_string(),
            affected,
        });
        Ok(affected)
    }

    fn next_sequence_value(&self, sequence: &str) -> Result<Value> {
        let mut inner = self.lock();
        let next = inner.sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        let value = Value::BigInt(*next);
        inner.log.push(Operation::Sequence {
            name: sequence.to_string(),
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_core::Error;

    fn pred(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs
            .iter()
            .map(|(c, v)| ((*c).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn predicates_ignore_integer_width_and_missing_columns_read_null() {
        let rows = MemoryRowSource::new().seed(
            "orders",
            vec![
                vec![("id", Value::BigInt(1)), ("customer_id", Value::BigInt(7))],
                vec![("id", Value::BigInt(2))],
            ],
        );

        let found = rows
            .fetch_row("orders", &pred(&[("id", Value::Int(1))]))
            .unwrap()
            .unwrap();
        assert_eq!(found.get_by_name("customer_id"), Some(&Value::BigInt(7)));

        let orphans = rows
            .fetch_rows("orders", &pred(&[("customer_id", Value::Null)]))
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].get_by_name("id"), Some(&Value::BigInt(2)));
        assert_eq!(rows.fetch_count("orders"), 2);
    }

    #[test]
    fn identity_keys_are_generated() {
        let rows = MemoryRowSource::new()
            .with_identity("orders", "id")
            .seed("orders", vec![vec![("id", Value::BigInt(5))]]);

        let result = rows
            .execute_insert("orders", &pred(&[("total", Value::BigInt(3))]))
            .unwrap();
        assert_eq!(result.affected, 1);
        assert_eq!(result.generated_key, Some(Value::BigInt(6)));

        let explicit = rows
            .execute_insert("orders", &pred(&[("id", Value::BigInt(9))]))
            .unwrap();
        assert_eq!(explicit.generated_key, None);
        assert_eq!(rows.count("orders"), 3);
    }

    #[test]
    fn duplicate_primary_key_is_a_constraint_violation() {
        let rows = MemoryRowSource::new().with_primary_key("tags", &["name"]);
        rows.execute_insert("tags", &pred(&[("name", "rust".into())]))
            .unwrap();
        let err = rows
            .execute_insert("tags", &pred(&[("name", "rust".into())]))
            .unwrap_err();
        let Error::RowSource(err) = err else {
            panic!("expected a row-source error, got {err:?}");
        };
        assert!(err.is_constraint_violation());
        assert_eq!(err.table.as_deref(), Some("tags"));
    }

    #[test]
    fn update_and_delete_report_affected_rows() {
        let rows = MemoryRowSource::new().seed(
            "posts",
            vec![
                vec![("id", Value::BigInt(1)), ("version", Value::BigInt(1))],
                vec![("id", Value::BigInt(2)), ("version", Value::BigInt(1))],
            ],
        );

        let stale = rows
            .execute_update(
                "posts",
                &pred(&[("version", Value::BigInt(3))]),
                &pred(&[("id", Value::BigInt(1)), ("version", Value::BigInt(2))]),
            )
            .unwrap();
        assert_eq!(stale, 0);

        let updated = rows
            .execute_update(
                "posts",
                &pred(&[("version", Value::BigInt(2)), ("title", "hello".into())]),
                &pred(&[("id", Value::BigInt(1))]),
            )
            .unwrap();
        assert_eq!(updated, 1);
        let row = rows
            .fetch_row("posts", &pred(&[("id", Value::BigInt(1))]))
            .unwrap()
            .unwrap();
        assert_eq!(row.get_by_name("title"), Some(&Value::Text("hello".into())));

        assert_eq!(rows.execute_delete("posts", &[]).unwrap(), 2);
        assert_eq!(rows.count("posts"), 0);
        assert_eq!(rows.writes().len(), 3);
    }

    #[test]
    fn injected_failures_and_sequences() {
        let rows = MemoryRowSource::new();
        rows.fail_on("orders");
        assert!(matches!(
            rows.execute_insert("orders", &[]),
            Err(Error::RowSource(_))
        ));
        rows.recover("orders");
        assert!(rows.execute_insert("orders", &[]).is_ok());

        assert_eq!(rows.next_sequence_value("seq").unwrap(), Value::BigInt(1));
        assert_eq!(rows.next_sequence_value("seq").unwrap(), Value::BigInt(2));
        assert_eq!(rows.next_sequence_value("other").unwrap(), Value::BigInt(1));
    }
}
