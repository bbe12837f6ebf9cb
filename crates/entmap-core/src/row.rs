//! Rows handed back by a row source.

use crate::value::Value;
use std::fmt;

/// One stored row: column names paired with their values.
///
/// Lookups are by column name. A column the row source did not return is
/// absent, which is different from a column holding `Value::Null`.
#[derive(Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// # Panics
    ///
    /// Panics when `columns` and `values` differ in length.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "a row needs one value per column"
        );
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_by_name(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(&self.values)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_columns_differ_from_null() {
        let row = Row::from_pairs([("id", Value::BigInt(3)), ("nick", Value::Null)]);
        assert_eq!(row.get_by_name("id"), Some(&Value::BigInt(3)));
        assert_eq!(row.get_by_name("nick"), Some(&Value::Null));
        assert!(row.contains_column("nick"));
        assert_eq!(row.get_by_name("name"), None);
        assert!(!row.contains_column("name"));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn debug_lists_columns() {
        let row = Row::from_pairs([("id", Value::Int(1))]);
        assert_eq!(format!("{row:?}"), r#"{"id": Int(1)}"#);
        assert_eq!(row.columns(), ["id".to_string()]);
    }
}
