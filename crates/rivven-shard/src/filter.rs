//! Shard filters
//!
//! Two predicates decide what a migration moves:
//!
//! - [`TableFilter`] - which source databases and tables take part
//! - [`RowFilter`] - which rows of those tables belong to the shard, both for
//!   the paginated bulk copy and for streamed binlog events
//!
//! Both are built once from the [`ShardingConfig`] and live in a
//! [`FilterCell`] that the engine and the verifier share by reference. The
//! only later change is attaching the primary-key table set, which the cell
//! allows exactly once.
//!
//! # Example
//!
//! ```rust
//! use rivven_shard::{FilterCell, ShardingConfig};
//!
//! let mut config = ShardingConfig::new("shard_1", "shard_1_new", "tenant_id", 42);
//! config.ignored_tables = vec!["^_.*_gho$".to_string()];
//!
//! let filters = FilterCell::build(&config).unwrap();
//! assert!(filters.table_filter().is_ignored("_users_gho"));
//! ```

use crate::config::ShardingConfig;
use crate::error::{Result, ShardError};
use crate::schema::{RowEvent, TableSchema};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

/// A sharded table that references rows of a joined table.
///
/// Joined tables carry no sharding key of their own; a joined row belongs to
/// the shard when `join_column` of some shard row in `table_name` points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    pub table_name: String,
    pub join_column: String,
}

/// Parameterised select statement produced by [`RowFilter::build_select`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub sql: String,
    pub params: Vec<serde_json::Value>,
}

type PrimaryKeyTables = Arc<OnceLock<HashSet<String>>>;

/// Compile ignored-table patterns, failing on the first invalid one.
pub fn compile_regexps(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ShardError::Filter {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

fn quote_field(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_field(schema), quote_field(table))
}

/// Interpret a row value as a sharding value. MySQL drivers hand out large
/// integers as strings, so numeric strings are accepted too.
fn as_sharding_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Row predicate for the bulk copy and the binlog stream.
#[derive(Debug)]
pub struct RowFilter {
    sharding_key: String,
    sharding_value: i64,
    joined_tables: HashMap<String, Vec<JoinTable>>,
    primary_key_tables: PrimaryKeyTables,
}

impl RowFilter {
    pub fn sharding_key(&self) -> &str {
        &self.sharding_key
    }

    pub fn sharding_value(&self) -> i64 {
        self.sharding_value
    }

    fn is_primary_key_table(&self, table: &str) -> bool {
        self.primary_key_tables
            .get()
            .is_some_and(|tables| tables.contains(table))
    }

    /// Build the select for one batch of `table`, paginating on its single
    /// primary key column.
    ///
    /// - primary-key tables: the row whose key equals the sharding value
    /// - joined tables: rows referenced by the join columns of shard rows
    /// - everything else: rows whose sharding key equals the sharding value
    pub fn build_select(
        &self,
        columns: &[String],
        table: &TableSchema,
        last_pagination_key: u64,
        batch_size: u64,
    ) -> Result<SelectQuery> {
        let pagination = table.pagination_column().ok_or_else(|| {
            ShardError::config(format!(
                "table {} needs a single-column primary key to paginate on, found {:?}",
                table.full_name(),
                table.pk_columns
            ))
        })?;
        let pagination = quote_field(pagination);
        let selected = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote_field(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let from = quote_table(&table.schema, &table.name);
        let sharding_value = serde_json::Value::from(self.sharding_value);

        let (predicate, mut params) = if self.is_primary_key_table(&table.name) {
            (format!("{} = ?", pagination), vec![sharding_value])
        } else if let Some(joins) = self.joined_tables.get(&table.name) {
            let sharding_key = quote_field(&self.sharding_key);
            let subqueries: Vec<String> = joins
                .iter()
                .map(|join| {
                    format!(
                        "SELECT {} FROM {} WHERE {} = ?",
                        quote_field(&join.join_column),
                        quote_table(&table.schema, &join.table_name),
                        sharding_key
                    )
                })
                .collect();
            let params = vec![sharding_value; joins.len()];
            (
                format!("{} IN ({})", pagination, subqueries.join(" UNION DISTINCT ")),
                params,
            )
        } else {
            (
                format!("{} = ?", quote_field(&self.sharding_key)),
                vec![sharding_value],
            )
        };

        params.push(serde_json::Value::from(last_pagination_key));
        params.push(serde_json::Value::from(batch_size));

        Ok(SelectQuery {
            sql: format!(
                "SELECT {} FROM {} WHERE {} AND {} > ? ORDER BY {} LIMIT ?",
                selected, from, predicate, pagination, pagination
            ),
            params,
        })
    }

    /// Whether a streamed change belongs to the shard.
    ///
    /// Joined tables are never streamed; they are re-copied under the write
    /// lock. A change that moves a row between shards is an error.
    pub fn applicable_event(&self, event: &RowEvent, table: &TableSchema) -> Result<bool> {
        if self.joined_tables.contains_key(&event.table) {
            return Ok(false);
        }

        let column = if self.is_primary_key_table(&event.table) {
            match table.pagination_column() {
                Some(pk) => pk,
                None => return Ok(false),
            }
        } else if table.has_column(&self.sharding_key) {
            self.sharding_key.as_str()
        } else {
            return Ok(false);
        };

        let old = event.old_value(column);
        let new = event.new_value(column);

        if let (Some(old), Some(new)) = (old, new) {
            if as_sharding_value(old) != as_sharding_value(new) {
                return Err(ShardError::ShardingKeyChanged {
                    table: table.full_name(),
                    old: old.to_string(),
                    new: new.to_string(),
                });
            }
        }

        Ok([old, new]
            .into_iter()
            .flatten()
            .any(|value| as_sharding_value(value) == Some(self.sharding_value)))
    }
}

/// Database and table predicate.
#[derive(Debug)]
pub struct TableFilter {
    sharding_key: String,
    source_shard: String,
    joined_tables: HashSet<String>,
    ignored_tables: Vec<Regex>,
    primary_key_tables: PrimaryKeyTables,
}

impl TableFilter {
    pub fn source_shard(&self) -> &str {
        &self.source_shard
    }

    /// Only the source shard's database is ever migrated.
    pub fn applicable_databases(&self, _databases: &[String]) -> Vec<String> {
        vec![self.source_shard.clone()]
    }

    pub fn is_ignored(&self, table: &str) -> bool {
        self.ignored_tables.iter().any(|re| re.is_match(table))
    }

    /// Whether `table` takes part in the migration: not ignored, and either a
    /// primary-key table, a joined table, or carrying the sharding key.
    pub fn is_applicable(&self, table: &TableSchema) -> bool {
        if self.is_ignored(&table.name) {
            return false;
        }

        let primary_key_table = self
            .primary_key_tables
            .get()
            .is_some_and(|tables| tables.contains(&table.name));

        primary_key_table
            || self.joined_tables.contains(&table.name)
            || table.has_column(&self.sharding_key)
    }

    pub fn applicable_tables(&self, tables: &[TableSchema]) -> Vec<TableSchema> {
        tables
            .iter()
            .filter(|table| self.is_applicable(table))
            .cloned()
            .collect()
    }
}

/// Owner of the shared row and table filters.
#[derive(Debug)]
pub struct FilterCell {
    row: RowFilter,
    table: TableFilter,
    primary_key_tables: PrimaryKeyTables,
}

impl FilterCell {
    /// Build both filters from `config`. An invalid ignored-table pattern
    /// fails the whole build.
    pub fn build(config: &ShardingConfig) -> Result<Self> {
        let ignored_tables = compile_regexps(&config.ignored_tables)?;
        let primary_key_tables: PrimaryKeyTables = Arc::new(OnceLock::new());

        let row = RowFilter {
            sharding_key: config.sharding_key.clone(),
            sharding_value: config
                .sharding_value
                .ok_or_else(|| ShardError::validation("sharding_value is required"))?,
            joined_tables: config.joined_tables.clone(),
            primary_key_tables: Arc::clone(&primary_key_tables),
        };

        let table = TableFilter {
            sharding_key: config.sharding_key.clone(),
            source_shard: config.source_db.clone(),
            joined_tables: config.joined_tables.keys().cloned().collect(),
            ignored_tables,
            primary_key_tables: Arc::clone(&primary_key_tables),
        };

        Ok(Self {
            row,
            table,
            primary_key_tables,
        })
    }

    pub fn row_filter(&self) -> &RowFilter {
        &self.row
    }

    pub fn table_filter(&self) -> &TableFilter {
        &self.table
    }

    /// Attach the primary-key table set to both filters. Succeeds once.
    pub fn attach_primary_key_tables(&self, tables: HashSet<String>) -> Result<()> {
        self.primary_key_tables
            .set(tables)
            .map_err(|_| ShardError::invalid_state("primary key tables are already attached"))
    }

    pub fn primary_key_tables(&self) -> Option<&HashSet<String>> {
        self.primary_key_tables.get()
    }
}
