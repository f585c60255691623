//! The store adapter seam.
//!
//! The session never builds SQL itself: it hands table/column/value triples
//! to a [`StoreAdapter`] and gets back generated keys and affected-row
//! counts. `assyria-sqlite` provides the embedded implementation; session
//! tests use an in-memory recording adapter.

use crate::comb::next_comb;
use crate::error::Result;
use crate::row::Row;
use crate::value::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub rows_affected: u64,
    /// Store-assigned row id (meaningful for sequential keys).
    pub generated_key: i64,
}

/// A conjunction of `column = value` clauses for [`StoreAdapter::select_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<(String, Value)>,
}

impl Predicate {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            clauses: vec![(column.into(), value.into())],
        }
    }

    /// Add another `column = value` clause.
    #[must_use]
    pub fn and(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((column.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluate against a row; a column missing from the row never matches.
    ///
    /// NULL never equals anything, NULL included.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|(column, expected)| {
            row.get_by_name(column)
                .is_some_and(|actual| values_equal(actual, expected))
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.as_uuid(), b.as_uuid()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

/// Lazy, finite, non-restartable sequence of rows.
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<Row>> + 'a>;

/// Callback that receives every SQL statement before it is executed.
pub type StatementObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Executes writes and reads against the backing store.
///
/// Update and delete report affected rows instead of failing on zero: the
/// session turns a mismatch into a stale-state error with entity context.
#[allow(clippy::result_large_err)]
pub trait StoreAdapter {
    /// Insert one row. Columns and values are parallel slices.
    fn insert(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<InsertOutcome>;

    /// Update the row with the given key. Returns rows affected.
    fn update(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        columns: &[&str],
        values: &[Value],
    ) -> Result<u64>;

    /// Delete the row with the given key. Returns rows affected.
    fn delete(&self, table: &str, key_column: &str, key: &Value) -> Result<u64>;

    /// Fetch the row with the given key.
    fn select_by_key(&self, table: &str, key_column: &str, key: &Value) -> Result<Option<Row>>;

    /// Stream all rows of a table, optionally filtered.
    fn select_all<'a>(&'a self, table: &str, predicate: Option<&Predicate>)
    -> Result<RowStream<'a>>;

    /// Produce a fresh comb identifier.
    fn generate_comb_identifier(&self) -> Uuid {
        next_comb()
    }

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Run raw SQL (DDL, pragmas). Not used by the session itself.
    fn execute_raw(&self, sql: &str) -> Result<()>;
}

impl<S: StoreAdapter + ?Sized> StoreAdapter for Box<S> {
    fn insert(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<InsertOutcome> {
        (**self).insert(table, columns, values)
    }

    fn update(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        columns: &[&str],
        values: &[Value],
    ) -> Result<u64> {
        (**self).update(table, key_column, key, columns, values)
    }

    fn delete(&self, table: &str, key_column: &str, key: &Value) -> Result<u64> {
        (**self).delete(table, key_column, key)
    }

    fn select_by_key(&self, table: &str, key_column: &str, key: &Value) -> Result<Option<Row>> {
        (**self).select_by_key(table, key_column, key)
    }

    fn select_all<'a>(
        &'a self,
        table: &str,
        predicate: Option<&Predicate>,
    ) -> Result<RowStream<'a>> {
        (**self).select_all(table, predicate)
    }

    fn generate_comb_identifier(&self) -> Uuid {
        (**self).generate_comb_identifier()
    }

    fn begin(&self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }

    fn execute_raw(&self, sql: &str) -> Result<()> {
        (**self).execute_raw(sql)
    }
}
