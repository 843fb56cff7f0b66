use ndarray::{Array2, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TableError {
    #[error("column `{0}` not found")]
    ColumnNotFound(String),
    #[error("duplicate column name `{0}`")]
    DuplicateColumn(String),
    #[error("row {row} has {found} values, expected {expected}")]
    RowLengthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("data has {found} columns, expected {expected}")]
    ShapeMismatch { expected: usize, found: usize },
}

/// A tabular simulation output: rows are time steps or samples, columns are
/// named state variables.
///
/// Cells are real numbers; anything a backend could not interpret numerically
/// is stored as NaN and skipped by the KPI reductions.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    data: Array2<f64>,
}

impl Table {
    pub fn new(columns: Vec<String>, data: Array2<f64>) -> Result<Self, TableError> {
        check_unique(&columns)?;
        if data.ncols() != columns.len() {
            return Err(TableError::ShapeMismatch {
                expected: columns.len(),
                found: data.ncols(),
            });
        }
        Ok(Self { columns, data })
    }

    /// Build a table from row-major data.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self, TableError> {
        check_unique(&columns)?;

        let ncols = columns.len();
        let mut flat = Vec::with_capacity(rows.len() * ncols);
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != ncols {
                return Err(TableError::RowLengthMismatch {
                    row: idx,
                    expected: ncols,
                    found: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }

        // Shape is consistent with the checks above.
        let data = Array2::from_shape_vec((rows.len(), ncols), flat)
            .expect("row-major data does not match its own shape");

        Ok(Self { columns, data })
    }

    /// A table with the given columns and no rows.
    pub fn empty(columns: Vec<String>) -> Result<Self, TableError> {
        check_unique(&columns)?;
        let ncols = columns.len();
        let data = Array2::from_shape_vec((0, ncols), Vec::new())
            .expect("empty data does not match its own shape");
        Ok(Self { columns, data })
    }

    pub fn num_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, TableError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))?;
        Ok(self.data.column(idx))
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

fn check_unique(columns: &[String]) -> Result<(), TableError> {
    for (idx, name) in columns.iter().enumerate() {
        if columns[..idx].contains(name) {
            return Err(TableError::DuplicateColumn(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn test_from_rows() {
        let table = Table::from_rows(
            vec!["t".to_string(), "infected".to_string()],
            vec![vec![0.0, 10.0], vec![1.0, 50.0], vec![2.0, 30.0]],
        )
        .unwrap();

        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.num_columns(), 2);

        let infected = table.column("infected").unwrap();
        assert_approx_eq!(f64, infected[1], 50.0);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = Table::from_rows(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![0.0, 1.0], vec![2.0]],
        );
        assert_eq!(
            result.unwrap_err(),
            TableError::RowLengthMismatch {
                row: 1,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let result = Table::empty(vec!["a".to_string(), "a".to_string()]);
        assert_eq!(result.unwrap_err(), TableError::DuplicateColumn("a".to_string()));
    }

    #[test]
    fn test_missing_column() {
        let table = Table::empty(vec!["a".to_string()]).unwrap();
        assert_eq!(
            table.column("b").unwrap_err(),
            TableError::ColumnNotFound("b".to_string())
        );
    }
}
