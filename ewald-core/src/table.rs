//! Scan-wide metadata table.
//!
//! One row per arch id, one column per motor or counter name.

use crate::{Error, Result};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Row labels of a [`Series`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Index {
    Int(Vec<i64>),
    Str(Vec<String>),
}

impl Index {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A labelled column of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub index: Index,
    pub data: Array1<f64>,
}

impl Series {
    /// Builds a series; the index and data must have the same length.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] on a length mismatch.
    pub fn new(name: impl Into<String>, index: Index, data: Array1<f64>) -> Result<Self> {
        if index.len() != data.len() {
            return Err(Error::shape(&[index.len()], &[data.len()]));
        }
        Ok(Self {
            name: name.into(),
            index,
            data,
        })
    }

    /// Value at an integer label.
    #[must_use]
    pub fn get(&self, label: i64) -> Option<f64> {
        match &self.index {
            Index::Int(labels) => labels
                .iter()
                .position(|&l| l == label)
                .map(|pos| self.data[pos]),
            Index::Str(_) => None,
        }
    }
}

/// Table of scan metadata keyed by arch id.
///
/// Rows stay sorted by id; re-adding an existing id replaces its row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanTable {
    index: Vec<i64>,
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ScanTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembles a table from stored parts.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `data` is not `(index.len(), columns.len())`.
    pub fn from_parts(index: Vec<i64>, columns: Vec<String>, data: &Array2<f64>) -> Result<Self> {
        if data.dim() != (index.len(), columns.len()) {
            return Err(Error::shape(
                &[index.len(), columns.len()],
                &[data.nrows(), data.ncols()],
            ));
        }
        let mut table = Self {
            index: Vec::with_capacity(index.len()),
            columns,
            rows: Vec::with_capacity(data.nrows()),
        };
        for (id, row) in index.into_iter().zip(data.rows()) {
            table.upsert(id, row.to_vec());
        }
        Ok(table)
    }

    /// Row ids in ascending order.
    #[must_use]
    pub fn index(&self) -> &[i64] {
        &self.index
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Appends (or replaces) the row for `id`.
    ///
    /// The first row fixes the column set. Later rows must carry exactly the
    /// same keys.
    ///
    /// # Errors
    /// Returns [`Error::MismatchedColumns`] if the keys differ from the
    /// table's columns; the table is left unchanged.
    pub fn append_row(&mut self, id: i64, values: &BTreeMap<String, f64>) -> Result<()> {
        if self.columns.is_empty() && self.index.is_empty() {
            self.columns = values.keys().cloned().collect();
        }
        let matches = values.len() == self.columns.len()
            && self.columns.iter().all(|c| values.contains_key(c));
        if !matches {
            return Err(Error::MismatchedColumns {
                expected: self.columns.clone(),
                found: values.keys().cloned().collect(),
            });
        }
        let row = self.columns.iter().map(|c| values[c]).collect();
        self.upsert(id, row);
        Ok(())
    }

    /// Removes the row for `id`, returning whether it existed.
    pub fn remove(&mut self, id: i64) -> bool {
        match self.index.binary_search(&id) {
            Ok(pos) => {
                self.index.remove(pos);
                self.rows.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Value at `(id, column)`.
    #[must_use]
    pub fn loc(&self, id: i64, column: &str) -> Option<f64> {
        let row = self.index.binary_search(&id).ok()?;
        let col = self.columns.iter().position(|c| c == column)?;
        Some(self.rows[row][col])
    }

    /// The row for `id` as a key → value map.
    #[must_use]
    pub fn row(&self, id: i64) -> Option<BTreeMap<String, f64>> {
        let row = self.index.binary_search(&id).ok()?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(self.rows[row].iter().copied())
                .collect(),
        )
    }

    /// One column as a series indexed by arch id.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Series> {
        let col = self.columns.iter().position(|c| c == name)?;
        Some(Series {
            name: name.to_string(),
            index: Index::Int(self.index.clone()),
            data: self.rows.iter().map(|r| r[col]).collect(),
        })
    }

    /// Dense `(rows, columns)` values.
    #[must_use]
    pub fn to_array(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.index.len(), self.columns.len()));
        for (mut dst, src) in out.rows_mut().into_iter().zip(&self.rows) {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = s;
            }
        }
        out
    }

    /// Drops every row and the column set.
    pub fn clear(&mut self) {
        self.index.clear();
        self.columns.clear();
        self.rows.clear();
    }

    fn upsert(&mut self, id: i64, row: Vec<f64>) {
        match self.index.binary_search(&id) {
            Ok(pos) => self.rows[pos] = row,
            Err(pos) => {
                self.index.insert(pos, id);
                self.rows.insert(pos, row);
            }
        }
    }
}
