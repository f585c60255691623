//! Flush planning and execution.
//!
//! A flush turns the session's pending work into an ordered list of store
//! writes:
//!
//! 1. inserts, parents before children;
//! 2. updates;
//! 3. deletes, children before parents;
//! 4. updates requested on instances that were already scheduled for
//!    deletion.
//!
//! Every update and delete must affect exactly one row. Any other count is
//! a stale-state error and stops the batch; writes already executed stay
//! executed.

use assyria_core::{
    Error, ErasedRef, MappingRegistry, Result, StaleStateError, StoreAdapter, Value,
};
use std::collections::HashMap;

/// A single store write.
#[derive(Clone)]
pub enum PendingOp {
    Insert {
        handle: ErasedRef,
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
    },
    Update {
        handle: ErasedRef,
        table: &'static str,
        key_column: &'static str,
        key: Value,
        columns: Vec<&'static str>,
        values: Vec<Value>,
    },
    Delete {
        handle: ErasedRef,
        table: &'static str,
        key_column: &'static str,
        key: Value,
    },
}

impl PendingOp {
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => *table,
        }
    }

    /// The instance this write belongs to.
    pub fn handle(&self) -> &ErasedRef {
        match self {
            PendingOp::Insert { handle, .. }
            | PendingOp::Update { handle, .. }
            | PendingOp::Delete { handle, .. } => handle,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }

    /// Dispatch this write and verify its row count.
    #[allow(clippy::result_large_err)]
    pub fn execute<S: StoreAdapter + ?Sized>(&self, store: &S) -> Result<()> {
        match self {
            PendingOp::Insert {
                table,
                columns,
                values,
                ..
            } => {
                tracing::trace!(table, columns = columns.len(), "Executing INSERT");
                store.insert(table, columns, values)?;
                Ok(())
            }
            PendingOp::Update {
                table,
                key_column,
                key,
                columns,
                values,
                ..
            } => {
                tracing::trace!(table, key = %key, columns = ?columns, "Executing UPDATE");
                let affected = store.update(table, key_column, key, columns, values)?;
                expect_one_row(*table, "update", affected)
            }
            PendingOp::Delete {
                table,
                key_column,
                key,
                ..
            } => {
                tracing::trace!(table, key = %key, "Executing DELETE");
                let affected = store.delete(table, key_column, key)?;
                expect_one_row(*table, "delete", affected)
            }
        }
    }
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PendingOp::Insert { .. } => "Insert",
            PendingOp::Update { .. } => "Update",
            PendingOp::Delete { .. } => "Delete",
        };
        f.debug_struct(kind)
            .field("table", &self.table())
            .field("key", &self.handle().key())
            .finish()
    }
}

#[allow(clippy::result_large_err)]
fn expect_one_row(table: &'static str, statement: &'static str, actual: u64) -> Result<()> {
    if actual == 1 {
        return Ok(());
    }
    tracing::warn!(
        table,
        statement,
        actual,
        expected = 1,
        "Unexpected row count, aborting flush"
    );
    Err(Error::StaleState(StaleStateError {
        entity: table,
        statement,
        expected: 1,
        actual,
    }))
}

/// Orders writes by foreign key dependencies between tables.
#[derive(Debug, Default, Clone)]
pub struct FlushOrderer {
    /// Table -> position in parent-first order.
    rank: HashMap<&'static str, usize>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank every registered table by the registry's creation order.
    ///
    /// A dependency cycle has no parent-first order; tables then rank by
    /// how many tables they reference.
    pub fn from_registry(registry: &MappingRegistry) -> Self {
        let rank = match registry.creation_order() {
            Ok(order) => order
                .into_iter()
                .enumerate()
                .map(|(i, table)| (table, i))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to reference counts for flush order");
                registry
                    .table_dependencies()
                    .into_iter()
                    .map(|(table, deps)| (table, deps.len()))
                    .collect()
            }
        };
        Self { rank }
    }

    /// Rank a table directly.
    pub fn register_table(&mut self, table: &'static str, rank: usize) {
        self.rank.insert(table, rank);
    }

    fn rank_of(&self, table: &str) -> usize {
        self.rank.get(table).copied().unwrap_or(0)
    }

    /// Group and sort writes into a plan.
    ///
    /// `post_delete` holds updates scheduled on removed instances; they run
    /// last. Sorting is stable, so writes against one table keep the order
    /// the session produced them in.
    pub fn order(&self, ops: Vec<PendingOp>, post_delete: Vec<PendingOp>) -> FlushPlan {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for op in ops {
            match op {
                PendingOp::Insert { .. } => inserts.push(op),
                PendingOp::Update { .. } => updates.push(op),
                PendingOp::Delete { .. } => deletes.push(op),
            }
        }

        inserts.sort_by_key(|op| self.rank_of(op.table()));
        deletes.sort_by_key(|op| std::cmp::Reverse(self.rank_of(op.table())));

        FlushPlan {
            inserts,
            updates,
            deletes,
            post_delete_updates: post_delete,
        }
    }
}

/// Ordered writes for one flush.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Parent-first.
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
    /// Child-first.
    pub deletes: Vec<PendingOp>,
    pub post_delete_updates: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len() + self.post_delete_updates.len()
    }

    /// Writes in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts
            .iter()
            .chain(&self.updates)
            .chain(&self.deletes)
            .chain(&self.post_delete_updates)
    }

    /// Execute the plan, calling `applied` after each successful write.
    ///
    /// Stops at the first failing write and returns its error.
    #[tracing::instrument(level = "debug", skip(self, store, applied))]
    #[allow(clippy::result_large_err)]
    pub fn execute<S: StoreAdapter + ?Sized>(
        &self,
        store: &S,
        mut applied: impl FnMut(&PendingOp),
    ) -> Result<FlushResult> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len() + self.post_delete_updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let mut result = FlushResult::new();
        for op in self.iter() {
            op.execute(store)?;
            match op {
                PendingOp::Insert { .. } => result.inserted += 1,
                PendingOp::Update { .. } => result.updated += 1,
                PendingOp::Delete { .. } => result.deleted += 1,
            }
            applied(op);
        }

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }
}

/// Rows written by one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assyria_core::{
        Entity, EntityRef, FieldInfo, FromValue, InsertOutcome, KeyStrategy, Predicate, Row,
        RowStream, SqlType,
    };
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Node {
        id: i64,
    }

    impl Entity for Node {
        const TABLE_NAME: &'static str = "nodes";
        const KEY_COLUMN: &'static str = "id";
        const KEY_STRATEGY: KeyStrategy = KeyStrategy::ClientAssigned;

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] =
                &[FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)];
            FIELDS
        }

        fn key(&self) -> Value {
            Value::BigInt(self.id)
        }

        fn set_key(&mut self, key: Value) -> Result<()> {
            self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
            Ok(())
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    /// Records statements; updates and deletes report `affected` rows.
    struct Recorder {
        log: Mutex<Vec<String>>,
        affected: u64,
    }

    impl Recorder {
        fn new(affected: u64) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                affected,
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl StoreAdapter for Recorder {
        fn insert(&self, table: &str, _: &[&str], _: &[Value]) -> Result<InsertOutcome> {
            self.log.lock().unwrap().push(format!("insert {table}"));
            Ok(InsertOutcome {
                rows_affected: 1,
                generated_key: 0,
            })
        }

        fn update(&self, table: &str, _: &str, _: &Value, _: &[&str], _: &[Value]) -> Result<u64> {
            self.log.lock().unwrap().push(format!("update {table}"));
            Ok(self.affected)
        }

        fn delete(&self, table: &str, _: &str, _: &Value) -> Result<u64> {
            self.log.lock().unwrap().push(format!("delete {table}"));
            Ok(self.affected)
        }

        fn select_by_key(&self, _: &str, _: &str, _: &Value) -> Result<Option<Row>> {
            Ok(None)
        }

        fn select_all<'a>(&'a self, _: &str, _: Option<&Predicate>) -> Result<RowStream<'a>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn begin(&self) -> Result<()> {
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            Ok(())
        }

        fn execute_raw(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn handle() -> ErasedRef {
        EntityRef::new(Node { id: 1 }).erased()
    }

    fn insert(table: &'static str) -> PendingOp {
        PendingOp::Insert {
            handle: handle(),
            table,
            columns: vec!["id"],
            values: vec![Value::BigInt(1)],
        }
    }

    fn update(table: &'static str) -> PendingOp {
        PendingOp::Update {
            handle: handle(),
            table,
            key_column: "id",
            key: Value::BigInt(1),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    fn delete(table: &'static str) -> PendingOp {
        PendingOp::Delete {
            handle: handle(),
            table,
            key_column: "id",
            key: Value::BigInt(1),
        }
    }

    fn orderer() -> FlushOrderer {
        let mut orderer = FlushOrderer::new();
        orderer.register_table("countries", 0);
        orderer.register_table("offices", 1);
        orderer.register_table("desks", 2);
        orderer
    }

    #[test]
    fn test_plan_order() {
        let plan = orderer().order(
            vec![
                delete("countries"),
                insert("desks"),
                update("offices"),
                delete("desks"),
                insert("countries"),
                insert("offices"),
            ],
            vec![update("countries")],
        );

        let recorder = Recorder::new(1);
        let result = plan.execute(&recorder, |_| {}).unwrap();

        assert_eq!(
            recorder.log(),
            vec![
                "insert countries",
                "insert offices",
                "insert desks",
                "update offices",
                "delete desks",
                "delete countries",
                "update countries",
            ]
        );
        assert_eq!(
            result,
            FlushResult {
                inserted: 3,
                updated: 2,
                deleted: 2
            }
        );
        assert_eq!(result.total(), 7);
    }

    #[test]
    fn test_zero_rows_is_stale_and_aborts() {
        let plan = orderer().order(
            vec![update("offices"), delete("countries"), insert("countries")],
            Vec::new(),
        );
        let recorder = Recorder::new(0);
        let mut applied = 0;

        let err = plan.execute(&recorder, |_| applied += 1).unwrap_err();

        assert!(err.is_stale_state());
        assert_eq!(
            err.to_string(),
            "Batch update returned unexpected row count from update; actual row count: 0; expected: 1"
        );
        // the insert ran and was applied; the delete never ran
        assert_eq!(applied, 1);
        assert_eq!(recorder.log(), vec!["insert countries", "update offices"]);
    }

    #[test]
    fn test_stale_delete_message() {
        let plan = orderer().order(vec![delete("offices")], Vec::new());
        let err = plan.execute(&Recorder::new(2), |_| {}).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Batch update returned unexpected row count from delete; actual row count: 2; expected: 1"
        );
    }

    #[test]
    fn test_empty_plan() {
        let plan = FlushPlan::new();
        assert!(plan.is_empty());
        assert_eq!(plan.execute(&Recorder::new(1), |_| {}).unwrap().total(), 0);
    }
}
