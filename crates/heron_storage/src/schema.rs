//! Column-name schema attached to each collection.

use heron_common::{Datum, OwnedRow, RowId, StorageError};
use serde::{Deserialize, Serialize};

/// Ordered column names of a collection. Rows are positional; the
/// schema maps constraint and check-expression column names to value
/// indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<String>,
}

impl Schema {
    pub fn new<S: Into<String>>(columns: Vec<S>) -> Self {
        Schema {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Pull a named column out of a row, treating an out-of-range
    /// index as NULL. Unknown columns return `None`.
    pub fn value<'a>(&self, row: &'a OwnedRow, name: &str) -> Option<&'a Datum> {
        let idx = self.index_of(name)?;
        Some(row.get(idx).unwrap_or(&Datum::Null))
    }

    pub fn check_row(&self, row_id: RowId, row: &OwnedRow) -> Result<(), StorageError> {
        if row.len() != self.columns.len() {
            return Err(StorageError::SchemaMismatch {
                row_id,
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_lookup() {
        let schema = Schema::new(vec!["id", "email", "age"]);
        assert_eq!(schema.index_of("email"), Some(1));
        assert_eq!(schema.index_of("missing"), None);
        assert_eq!(schema.column_count(), 3);
    }

    #[test]
    fn test_check_row_arity() {
        let schema = Schema::new(vec!["id", "email"]);
        let row = OwnedRow::new(vec![Datum::Int64(1)]);
        assert!(schema.check_row(RowId(1), &row).is_err());
        let row = OwnedRow::new(vec![Datum::Int64(1), Datum::Text("a@b".into())]);
        assert!(schema.check_row(RowId(1), &row).is_ok());
    }
}
