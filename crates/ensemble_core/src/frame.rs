//! Column-oriented numeric table shared by the augmenter and every model family.
//!
//! Categorical columns are carried as numeric codes (for example `jyo_cd = 12`);
//! families read them through [`category_key`]. Missing values are `NaN`.

use crate::errors::{EnsembleError, Result};
use serde::{Deserialize, Serialize};

/// Named, ordered `f64` columns of equal length
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    n_rows: usize,
}

impl Frame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from `(name, values)` pairs
    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut frame = Frame::new();
        for (name, values) in columns {
            frame.insert_column(name, values)?;
        }
        Ok(frame)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Borrow a column by name
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.position(name).map(|idx| self.columns[idx].as_slice())
    }

    /// Insert a column, replacing any existing column with the same name.
    ///
    /// The first column fixes the row count of an empty frame.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if !self.names.is_empty() && values.len() != self.n_rows {
            return Err(EnsembleError::Configuration(format!(
                "column '{}' has {} rows, frame has {}",
                name,
                values.len(),
                self.n_rows
            )));
        }
        self.upsert(name, values);
        Ok(())
    }

    /// Insert without the length check; callers derive `values` from this frame.
    pub(crate) fn upsert(&mut self, name: String, values: Vec<f64>) {
        debug_assert!(self.names.is_empty() || values.len() == self.n_rows);
        if self.names.is_empty() {
            self.n_rows = values.len();
        }
        match self.position(&name) {
            Some(idx) => self.columns[idx] = values,
            None => {
                self.names.push(name);
                self.columns.push(values);
            }
        }
    }

    /// Required names that this frame does not carry, in the order given
    pub fn missing_columns(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.has_column(name))
            .cloned()
            .collect()
    }

    /// Borrow several columns in the given order
    pub fn columns_for(&self, names: &[String]) -> Result<Vec<&[f64]>> {
        let missing = self.missing_columns(names);
        if !missing.is_empty() {
            return Err(EnsembleError::FeatureMismatch { missing });
        }
        Ok(names
            .iter()
            .filter_map(|name| self.column(name))
            .collect())
    }

    /// Row-major copy of the given columns
    pub fn row_major(&self, names: &[String]) -> Result<Vec<Vec<f64>>> {
        let columns = self.columns_for(names)?;
        Ok((0..self.n_rows)
            .map(|row| columns.iter().map(|col| col[row]).collect())
            .collect())
    }

    /// New frame holding the given rows (in the given order, duplicates allowed)
    pub fn select_rows(&self, rows: &[usize]) -> Frame {
        Frame {
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|col| rows.iter().map(|&r| col[r]).collect())
                .collect(),
            n_rows: rows.len(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Integer category for a categorical cell; missing or non-finite cells share one key
pub fn category_key(value: f64) -> i64 {
    if value.is_finite() {
        value.round() as i64
    } else {
        i64::MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::from_columns(vec![
            ("a", vec![1.0, 2.0, 3.0]),
            ("b", vec![4.0, 5.0, 6.0]),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_columns_rejects_ragged_input() {
        let err = Frame::from_columns(vec![("a", vec![1.0, 2.0]), ("b", vec![1.0])]).unwrap_err();
        assert!(matches!(err, EnsembleError::Configuration(_)));
    }

    #[test]
    fn test_insert_replaces_existing_column() {
        let mut frame = sample();
        frame.insert_column("a", vec![9.0, 9.0, 9.0]).unwrap();
        assert_eq!(frame.n_cols(), 2);
        assert_eq!(frame.column("a"), Some(&[9.0, 9.0, 9.0][..]));
    }

    #[test]
    fn test_row_major_follows_requested_order() {
        let frame = sample();
        let rows = frame
            .row_major(&["b".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(rows[0], vec![4.0, 1.0]);
        assert_eq!(rows[2], vec![6.0, 3.0]);
    }

    #[test]
    fn test_missing_columns_reported() {
        let frame = sample();
        let err = frame
            .columns_for(&["a".to_string(), "zz".to_string()])
            .unwrap_err();
        match err {
            EnsembleError::FeatureMismatch { missing } => assert_eq!(missing, vec!["zz"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_select_rows_allows_duplicates() {
        let frame = sample();
        let picked = frame.select_rows(&[2, 2, 0]);
        assert_eq!(picked.n_rows(), 3);
        assert_eq!(picked.column("a"), Some(&[3.0, 3.0, 1.0][..]));
    }

    #[test]
    fn test_category_key_handles_missing() {
        assert_eq!(category_key(3.0), 3);
        assert_eq!(category_key(2.6), 3);
        assert_eq!(category_key(f64::NAN), i64::MIN);
    }
}
