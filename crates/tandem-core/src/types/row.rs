//! Row-level request and result types

use std::collections::BTreeMap;

use bytes::Bytes;

/// A column, addressed by family and qualifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column {
    pub family: Bytes,
    pub qualifier: Bytes,
}

impl Column {
    pub fn new(family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }
}

/// A single value written to a column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column: Column,
    pub value: Bytes,
}

/// Read one row, optionally restricted to some columns
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Get {
    pub row: Bytes,
    /// Requested columns; empty means the whole row
    pub columns: Vec<Column>,
}

impl Get {
    pub fn new(row: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            columns: Vec::new(),
        }
    }

    pub fn add_column(mut self, family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        self.columns.push(Column::new(family, qualifier));
        self
    }

    /// Whether `column` is part of this read
    pub fn wants(&self, column: &Column) -> bool {
        self.columns.is_empty() || self.columns.contains(column)
    }
}

/// Write one or more cells of a row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Put {
    pub row: Bytes,
    pub cells: Vec<Cell>,
}

impl Put {
    pub fn new(row: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            cells: Vec::new(),
        }
    }

    pub fn add_column(
        mut self,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.cells.push(Cell {
            column: Column::new(family, qualifier),
            value: value.into(),
        });
        self
    }
}

/// Remove a row, or some columns of it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delete {
    pub row: Bytes,
    /// Columns to remove; empty removes the whole row
    pub columns: Vec<Column>,
}

impl Delete {
    pub fn new(row: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            columns: Vec::new(),
        }
    }

    pub fn add_column(mut self, family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        self.columns.push(Column::new(family, qualifier));
        self
    }
}

/// A write that can be part of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put(Put),
    Delete(Delete),
}

impl Mutation {
    pub fn row(&self) -> &Bytes {
        match self {
            Mutation::Put(put) => &put.row,
            Mutation::Delete(delete) => &delete.row,
        }
    }
}

impl From<Put> for Mutation {
    fn from(put: Put) -> Self {
        Mutation::Put(put)
    }
}

impl From<Delete> for Mutation {
    fn from(delete: Delete) -> Self {
        Mutation::Delete(delete)
    }
}

/// The cells returned for one row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowResult {
    pub row: Bytes,
    pub cells: BTreeMap<Column, Bytes>,
}

impl RowResult {
    /// A result for a row that does not exist
    pub fn empty(row: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn value(&self, family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Option<&Bytes> {
        self.cells.get(&Column::new(family, qualifier))
    }
}
