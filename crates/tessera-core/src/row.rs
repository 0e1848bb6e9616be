//! Database rows and statement results.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
///
/// This struct is wrapped in `Arc` so all rows from the same query share
/// the same column information.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a database query.
///
/// The store consumes rows positionally, in the order the compiled
/// statement listed its columns. Names are optional and only used for
/// diagnostics and name-based access.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl PartialEq for ColumnInfo {
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
    }
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create an anonymous positional row.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(ColumnInfo::default()),
        }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the number of values in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column index.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T>(&self, index: usize) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get(index).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!(
                    "index {} out of bounds (row has {} columns)",
                    index,
                    self.len()
                ),
                column: None,
            })
        })?;
        T::try_from(value.clone())
    }

    /// Are all values NULL? Outer joins produce such rows for missing sides.
    pub fn is_all_null(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }

    /// Iterate over the values in order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// The outcome of executing one statement.
///
/// Drivers fill in whatever they know: buffered rows for queries, an
/// affected row count for DML, and the generated identity for inserts.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    rows: VecDeque<Row>,
    rowcount: Option<u64>,
    last_insert_id: Option<i64>,
}

impl QueryResult {
    /// An empty result with no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A result carrying the given rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let rowcount = Some(rows.len() as u64);
        Self {
            rows: rows.into(),
            rowcount,
            last_insert_id: None,
        }
    }

    /// Set the affected row count.
    pub fn with_rowcount(mut self, rowcount: u64) -> Self {
        self.rowcount = Some(rowcount);
        self
    }

    /// Set the identity generated by an INSERT.
    pub fn with_last_insert_id(mut self, id: i64) -> Self {
        self.last_insert_id = Some(id);
        self
    }

    /// Affected or returned row count, when the driver reports one.
    pub fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    /// Identity generated by the last INSERT, when the driver reports one.
    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    /// Take the next row, if any.
    pub fn get_one(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Take all remaining rows.
    pub fn get_all(&mut self) -> Vec<Row> {
        self.rows.drain(..).collect()
    }
}

impl Iterator for QueryResult {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.get_one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_access_by_index_and_name() {
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(1), Value::Text("Ann".to_string())],
        );
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert_eq!(
            row.get_by_name("name"),
            Some(&Value::Text("Ann".to_string()))
        );
        let id: i64 = row.get_as(0).unwrap();
        assert_eq!(id, 1);
        assert!(row.get_as::<i64>(5).is_err());
    }

    #[test]
    fn all_null_detection() {
        assert!(Row::from_values(vec![Value::Null, Value::Null]).is_all_null());
        assert!(!Row::from_values(vec![Value::Null, Value::Int(1)]).is_all_null());
    }

    #[test]
    fn query_result_drains_in_order() {
        let mut result = QueryResult::from_rows(vec![
            Row::from_values(vec![Value::Int(1)]),
            Row::from_values(vec![Value::Int(2)]),
            Row::from_values(vec![Value::Int(3)]),
        ]);
        assert_eq!(result.rowcount(), Some(3));
        assert_eq!(result.get_one().unwrap().get(0), Some(&Value::Int(1)));
        let rest: Vec<Row> = result.get_all();
        assert_eq!(rest.len(), 2);
        assert!(result.get_one().is_none());
    }

    #[test]
    fn query_result_identity() {
        let result = QueryResult::empty().with_rowcount(1).with_last_insert_id(42);
        assert_eq!(result.last_insert_id(), Some(42));
        assert_eq!(result.rowcount(), Some(1));
    }
}
