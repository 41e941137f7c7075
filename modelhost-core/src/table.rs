//! Column-oriented table used for features, predictions and transform output.
//!
//! Cells are `serde_json::Value`s so that numeric, textual and nested
//! (vector-database) predictions share one representation.

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::AdapterError;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// Named columns of equal length. `sparse` marks data that arrived (or must
/// leave) as a coordinate matrix.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    columns: Vec<Column>,
    #[serde(skip)]
    sparse: bool,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (name, values) in columns {
            table.push_column(name, values)?;
        }
        Ok(table)
    }

    /// Build a table from row-major data; every row must have one cell per name.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut columns: Vec<Vec<Value>> =
            names.iter().map(|_| Vec::with_capacity(rows.len())).collect();
        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != names.len() {
                return Err(AdapterError::shape(format!(
                    "row {index} has {} values but {} columns were declared",
                    row.len(),
                    names.len()
                )));
            }
            for (column, cell) in columns.iter_mut().zip(row) {
                column.push(cell);
            }
        }
        Self::from_columns(names.into_iter().zip(columns))
    }

    pub fn single(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            columns: vec![Column {
                name: name.into(),
                values,
            }],
            sparse: false,
        }
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(AdapterError::shape(format!("duplicate column name '{name}'")));
        }
        if let Some(first) = self.columns.first()
            && first.values.len() != values.len()
        {
            return Err(AdapterError::shape(format!(
                "column '{name}' has {} rows, expected {}",
                values.len(),
                first.values.len()
            )));
        }
        self.columns.push(Column { name, values });
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |column| column.values.len())
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.values.as_slice())
    }

    pub fn first_column(&self) -> Option<&Column> {
        self.columns.first()
    }

    /// Keep only `names`, in the given order.
    pub fn select(&self, names: &[&str]) -> Result<Self> {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let column = self
                .columns
                .iter()
                .find(|column| column.name == *name)
                .ok_or_else(|| AdapterError::shape(format!("column '{name}' not found")))?;
            selected.push(column.clone());
        }
        Ok(Self {
            columns: selected,
            sparse: self.sparse,
        })
    }

    pub fn drop_columns(&self, names: &[&str]) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .filter(|column| !names.contains(&column.name.as_str()))
                .cloned()
                .collect(),
            sparse: self.sparse,
        }
    }

    pub fn rename_column(&mut self, from: &str, to: impl Into<String>) -> Result<()> {
        let to = to.into();
        if from != to && self.contains(&to) {
            return Err(AdapterError::shape(format!("duplicate column name '{to}'")));
        }
        let column = self
            .columns
            .iter_mut()
            .find(|column| column.name == from)
            .ok_or_else(|| AdapterError::shape(format!("column '{from}' not found")))?;
        column.name = to;
        Ok(())
    }

    /// Column-wise concatenation. Names must be disjoint and row counts equal.
    pub fn join(&self, other: &Table) -> Result<Self> {
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.num_rows() != other.num_rows() {
            return Err(AdapterError::shape(format!(
                "cannot join tables with {} and {} rows",
                self.num_rows(),
                other.num_rows()
            )));
        }
        let mut joined = self.clone();
        for column in &other.columns {
            joined.push_column(column.name.clone(), column.values.clone())?;
        }
        Ok(joined)
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.num_rows())
            .map(|row| {
                self.columns
                    .iter()
                    .map(|column| column.values[row].clone())
                    .collect()
            })
            .collect()
    }

    /// One JSON object per row, keyed by column name.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        (0..self.num_rows())
            .map(|row| {
                self.columns
                    .iter()
                    .map(|column| (column.name.clone(), column.values[row].clone()))
                    .collect()
            })
            .collect()
    }

    /// True when every cell is a JSON number (an empty table counts as numeric).
    pub fn is_all_numeric(&self) -> bool {
        self.columns
            .iter()
            .all(|column| column.values.iter().all(Value::is_number))
    }

    /// Numeric view of one column; `None` if any cell is not a number.
    pub fn column_as_f64(&self, name: &str) -> Option<Vec<f64>> {
        self.column(name)?.iter().map(Value::as_f64).collect()
    }
}
