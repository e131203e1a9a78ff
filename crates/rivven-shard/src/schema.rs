//! Table schemas and row change events
//!
//! The copy/stream engine discovers tables on the source and hands them to the
//! orchestrator as a [`TableSchemaCache`]. Streamed changes are presented to
//! the row filter as [`RowEvent`]s.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema of a single source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Database (MySQL schema) the table lives in
    pub schema: String,
    /// Table name
    pub name: String,
    /// Column names in ordinal order
    pub columns: Vec<String>,
    /// Primary key column names in key order
    #[serde(default)]
    pub pk_columns: Vec<String>,
}

impl TableSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            pk_columns: Vec::new(),
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// `schema.table`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Column used to paginate the copy, the sole primary key column.
    pub fn pagination_column(&self) -> Option<&str> {
        match self.pk_columns.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }
}

/// Tables discovered on the source, keyed by `schema.table`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchemaCache {
    tables: BTreeMap<String, TableSchema>,
}

impl TableSchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables.insert(table.full_name(), table);
    }

    pub fn get(&self, schema: &str, table: &str) -> Option<&TableSchema> {
        self.tables.get(&format!("{}.{}", schema, table))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// All tables, ordered by full name.
    pub fn as_slice(&self) -> Vec<TableSchema> {
        self.tables.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl FromIterator<TableSchema> for TableSchemaCache {
    fn from_iter<T: IntoIterator<Item = TableSchema>>(iter: T) -> Self {
        let mut cache = Self::new();
        for table in iter {
            cache.insert(table);
        }
        cache
    }
}

/// Row operation carried by a binlog event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

/// A row change read from the source binlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowEvent {
    /// Database name
    pub database: String,
    /// Table name
    pub table: String,
    /// Operation type
    pub op: RowOp,
    /// Previous row state (for UPDATE/DELETE)
    pub before: Option<serde_json::Value>,
    /// Current row state (for INSERT/UPDATE)
    pub after: Option<serde_json::Value>,
}

impl RowEvent {
    /// Create a new INSERT event
    pub fn insert(
        database: impl Into<String>,
        table: impl Into<String>,
        after: serde_json::Value,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            op: RowOp::Insert,
            before: None,
            after: Some(after),
        }
    }

    /// Create a new UPDATE event
    pub fn update(
        database: impl Into<String>,
        table: impl Into<String>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            op: RowOp::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    /// Create a new DELETE event
    pub fn delete(
        database: impl Into<String>,
        table: impl Into<String>,
        before: serde_json::Value,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            op: RowOp::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// Value of `column` in the old row image.
    pub fn old_value(&self, column: &str) -> Option<&serde_json::Value> {
        self.before.as_ref().and_then(|row| row.get(column))
    }

    /// Value of `column` in the new row image.
    pub fn new_value(&self, column: &str) -> Option<&serde_json::Value> {
        self.after.as_ref().and_then(|row| row.get(column))
    }
}
