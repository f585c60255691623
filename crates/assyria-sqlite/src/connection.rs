//! SQLite store implementation.
//!
//! [`SqliteStore`] wraps one SQLite connection handle behind a mutex and
//! implements [`StoreAdapter`] by generating parameterized statements with
//! quoted identifiers. Every statement is passed to the optional
//! [`StatementObserver`] and logged at `debug` level before it runs.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::result_large_err)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use assyria_core::{
    ConnectionError, ConnectionErrorKind, Error, InsertOutcome, Predicate, Result, Row,
    RowStream, StatementObserver, StoreAdapter, StoreError, StoreErrorKind, TransactionError,
    TransactionErrorKind, Value, quote_ident, quote_list, row::ColumnInfo,
};
use std::ffi::{CStr, CString, c_int};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Configuration for opening a SQLite store.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Foreign key enforcement, applied with `PRAGMA foreign_keys` on open.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Multi-thread mode.
    pub no_mutex: bool,
    /// Serialized mode.
    pub full_mutex: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write access; the database must exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Read-write access, creating the database if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }

        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// Connection state guarded by the store mutex.
struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is only touched while the owning Mutex is held.
unsafe impl Send for SqliteInner {}

/// A SQLite-backed [`StoreAdapter`].
pub struct SqliteStore {
    inner: Mutex<SqliteInner>,
    path: String,
    observer: Option<StatementObserver>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl SqliteStore {
    /// Open a store with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: valid C string and out-pointer; the return code is checked
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: open_v2 hands back a handle even on failure; it
                // must still be closed
                unsafe {
                    let msg = ffi::last_error_message(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };

            tracing::warn!(path = %config.path, error = %msg, "Failed to open SQLite store");
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(
                    db,
                    c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX),
                );
            }
        }

        let store = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
            observer: None,
        };

        let foreign_keys = if config.foreign_keys { "ON" } else { "OFF" };
        store.execute_raw(&format!("PRAGMA foreign_keys = {}", foreign_keys))?;

        tracing::debug!(path = %config.path, "Opened SQLite store");
        Ok(store)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open (creating if needed) a database file.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path.as_ref().to_string_lossy()))
    }

    /// Database path as configured.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register (or clear) the statement observer.
    pub fn set_observer(&mut self, observer: Option<StatementObserver>) {
        self.observer = observer;
    }

    /// Builder-style observer registration.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    /// Row id of the most recent successful insert.
    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> u64 {
        let inner = self.lock();
        // SAFETY: db is valid
        changes_of(unsafe { ffi::sqlite3_changes(inner.db) })
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, sql: &str) {
        tracing::debug!(target: "assyria::sql", sql, "Executing statement");
        if let Some(observer) = &self.observer {
            observer(sql);
        }
    }

    /// Execute SQL text directly (DDL, pragmas, several statements).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.observe(sql);
        let inner = self.lock();
        let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;

        let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: all pointers are valid for the duration of the call
        let rc = unsafe {
            ffi::sqlite3_exec(inner.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg)
        };

        if rc != ffi::SQLITE_OK {
            let msg = if errmsg.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: errmsg was allocated by SQLite and is freed here
                unsafe {
                    let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                    ffi::sqlite3_free(errmsg.cast());
                    msg
                }
            };

            return Err(Error::Store(StoreError {
                kind: error_code_to_kind(rc),
                sql: Some(sql.to_string()),
                message: msg,
                source: None,
            }));
        }

        Ok(())
    }

    /// Prepare, bind and run a statement to completion; returns rows changed.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.observe(sql);
        let inner = self.lock();
        execute_locked(&inner, sql, params)
    }

    /// Prepare, bind and run a query, collecting every row.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.stream(sql, params)?.collect()
    }

    fn stream<'a>(&'a self, sql: &str, params: &[Value]) -> Result<SqliteRows<'a>> {
        self.observe(sql);
        let inner = self.lock();
        let stmt = prepare_stmt(inner.db, sql)?;
        bind_all(inner.db, stmt, sql, params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt) };
        let names = (0..col_count)
            .map(|i| {
                // SAFETY: stmt is valid and i < col_count
                unsafe { types::column_name(stmt, i) }.unwrap_or_else(|| format!("col{}", i))
            })
            .collect();
        drop(inner);

        Ok(SqliteRows {
            store: self,
            stmt,
            columns: Arc::new(ColumnInfo::new(names)),
            sql: sql.to_string(),
            done: false,
        })
    }

    fn finalize(&self, stmt: *mut ffi::sqlite3_stmt) {
        let _inner = self.lock();
        // SAFETY: stmt was prepared on this connection and is finalized once
        unsafe {
            ffi::sqlite3_finalize(stmt);
        }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            if inner.in_transaction {
                tracing::warn!(path = %self.path, "Closing SQLite store with an open transaction");
            }
            // SAFETY: db is valid and row streams borrow the store, so
            // every statement is finalized by now
            unsafe {
                ffi::sqlite3_close(inner.db);
            }
        }
    }
}

/// Lazily stepped result rows.
///
/// Each `next` steps the statement under the connection lock. The
/// statement is finalized when the rows are exhausted, on the first error,
/// or when the iterator is dropped; it is never reset.
pub struct SqliteRows<'a> {
    store: &'a SqliteStore,
    stmt: *mut ffi::sqlite3_stmt,
    columns: Arc<ColumnInfo>,
    sql: String,
    done: bool,
}

impl SqliteRows<'_> {
    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.store.finalize(self.stmt);
        }
    }
}

impl Iterator for SqliteRows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let step = {
            let inner = self.store.lock();
            // SAFETY: stmt is valid until finish() runs
            let rc = unsafe { ffi::sqlite3_step(self.stmt) };
            match rc {
                ffi::SQLITE_ROW => {
                    let count = self.columns.len() as c_int;
                    let values = (0..count)
                        // SAFETY: stmt is positioned on a row
                        .map(|i| unsafe { types::read_column(self.stmt, i) })
                        .collect();
                    Some(Ok(Row::with_columns(Arc::clone(&self.columns), values)))
                }
                ffi::SQLITE_DONE => None,
                _ => Some(Err(step_error(inner.db, &self.sql))),
            }
        };

        if !matches!(step, Some(Ok(_))) {
            self.finish();
        }
        step
    }
}

impl std::iter::FusedIterator for SqliteRows<'_> {}

impl Drop for SqliteRows<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl StoreAdapter for SqliteStore {
    fn insert(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<InsertOutcome> {
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                quote_list(columns.iter().copied()),
                placeholders(columns.len())
            )
        };

        self.observe(&sql);
        let inner = self.lock();
        let rows_affected = execute_locked(&inner, &sql, values)?;
        // SAFETY: db is valid; read under the same lock as the insert
        let generated_key = unsafe { ffi::sqlite3_last_insert_rowid(inner.db) };
        Ok(InsertOutcome {
            rows_affected,
            generated_key,
        })
    }

    fn update(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        columns: &[&str],
        values: &[Value],
    ) -> Result<u64> {
        let assignments = if columns.is_empty() {
            // nothing to change; still report whether the row exists
            format!("{0} = {0}", quote_ident(key_column))
        } else {
            columns
                .iter()
                .map(|column| format!("{} = ?", quote_ident(column)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table),
            assignments,
            quote_ident(key_column)
        );

        let mut params = Vec::with_capacity(values.len() + 1);
        params.extend_from_slice(values);
        params.push(key.clone());
        self.execute(&sql, &params)
    }

    fn delete(&self, table: &str, key_column: &str, key: &Value) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(key_column)
        );
        self.execute(&sql, std::slice::from_ref(key))
    }

    fn select_by_key(&self, table: &str, key_column: &str, key: &Value) -> Result<Option<Row>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(key_column)
        );
        let mut rows = self.stream(&sql, std::slice::from_ref(key))?;
        rows.next().transpose()
    }

    fn select_all<'a>(
        &'a self,
        table: &str,
        predicate: Option<&Predicate>,
    ) -> Result<RowStream<'a>> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(table));
        let mut params = Vec::new();
        if let Some(predicate) = predicate.filter(|p| !p.is_empty()) {
            let clauses = predicate
                .clauses()
                .iter()
                .map(|(column, value)| {
                    params.push(value.clone());
                    format!("{} = ?", quote_ident(column))
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&clauses);
        }
        let rows = self.stream(&sql, &params)?;
        Ok(Box::new(rows))
    }

    fn begin(&self) -> Result<()> {
        if self.lock().in_transaction {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "Already in a transaction".to_string(),
            }));
        }
        self.execute_raw("BEGIN IMMEDIATE")?;
        self.lock().in_transaction = true;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if !self.lock().in_transaction {
            return Err(not_in_transaction());
        }
        self.execute_raw("COMMIT")?;
        self.lock().in_transaction = false;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        if !self.lock().in_transaction {
            return Err(not_in_transaction());
        }
        // the transaction is over even if ROLLBACK reports an error
        let result = self.execute_raw("ROLLBACK");
        self.lock().in_transaction = false;
        result
    }

    fn execute_raw(&self, sql: &str) -> Result<()> {
        SqliteStore::execute_raw(self, sql)
    }
}

// Helper functions

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn changes_of(raw: c_int) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

fn not_in_transaction() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: "Not in a transaction".to_string(),
    })
}

fn null_byte_error(sql: &str) -> Error {
    Error::Store(StoreError {
        kind: StoreErrorKind::Syntax,
        sql: Some(sql.to_string()),
        message: "SQL contains null byte".to_string(),
        source: None,
    })
}

fn execute_locked(inner: &SqliteInner, sql: &str, params: &[Value]) -> Result<u64> {
    let stmt = prepare_stmt(inner.db, sql)?;
    bind_all(inner.db, stmt, sql, params)?;

    // SAFETY: stmt is valid
    let rc = unsafe { ffi::sqlite3_step(stmt) };
    let result = match rc {
        // SAFETY: db is valid
        ffi::SQLITE_DONE | ffi::SQLITE_ROW => Ok(changes_of(unsafe { ffi::sqlite3_changes(inner.db) })),
        _ => Err(step_error(inner.db, sql)),
    };

    // SAFETY: stmt is valid and not used afterwards
    unsafe { ffi::sqlite3_finalize(stmt) };
    result
}

fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: all pointers are valid
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };

    if rc != ffi::SQLITE_OK {
        return Err(step_error(db, sql));
    }

    Ok(stmt)
}

fn bind_all(
    db: *mut ffi::sqlite3,
    stmt: *mut ffi::sqlite3_stmt,
    sql: &str,
    params: &[Value],
) -> Result<()> {
    for (i, param) in params.iter().enumerate() {
        // SAFETY: stmt is valid, index is 1-based
        let rc = unsafe { types::bind_value(stmt, (i + 1) as c_int, param) };
        if rc != ffi::SQLITE_OK {
            // SAFETY: db is valid
            let msg = unsafe { ffi::last_error_message(db) };
            // SAFETY: stmt is valid and not used afterwards
            unsafe { ffi::sqlite3_finalize(stmt) };
            return Err(Error::Store(StoreError {
                kind: StoreErrorKind::Database,
                sql: Some(sql.to_string()),
                message: format!("Failed to bind parameter {}: {}", i + 1, msg),
                source: None,
            }));
        }
    }
    Ok(())
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (message, code) = unsafe { (ffi::last_error_message(db), ffi::sqlite3_errcode(db)) };

    Error::Store(StoreError {
        kind: error_code_to_kind(code),
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

fn error_code_to_kind(code: c_int) -> StoreErrorKind {
    // extended codes carry the primary code in the low byte
    match code & 0xFF {
        ffi::SQLITE_CONSTRAINT => StoreErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => StoreErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => StoreErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => StoreErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => StoreErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => StoreErrorKind::Cancelled,
        ffi::SQLITE_ERROR => StoreErrorKind::Syntax,
        _ => StoreErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn store_with_table() -> SqliteStore {
        let store = SqliteStore::open_memory().unwrap();
        store
            .execute_raw("CREATE TABLE test (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)")
            .unwrap();
        store
    }

    #[test]
    fn test_open_memory() {
        let store = SqliteStore::open_memory().unwrap();
        assert_eq!(store.path(), ":memory:");
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_insert_returns_rowid() {
        let store = store_with_table();
        let first = store
            .insert("test", &["name"], &[Value::Text("Zhu".to_string())])
            .unwrap();
        let second = store
            .insert("test", &["name"], &[Value::Text("Zhen".to_string())])
            .unwrap();

        assert_eq!(first.rows_affected, 1);
        assert_eq!(first.generated_key, 1);
        assert_eq!(second.generated_key, 2);
        assert_eq!(store.last_insert_rowid(), 2);
    }

    #[test]
    fn test_insert_default_values() {
        let store = store_with_table();
        let outcome = store.insert("test", &[], &[]).unwrap();
        assert_eq!(outcome.generated_key, 1);
    }

    #[test]
    fn test_update_and_delete_report_row_counts() {
        let store = store_with_table();
        store
            .insert("test", &["name"], &[Value::Text("Zhu".to_string())])
            .unwrap();

        let key = Value::BigInt(1);
        let updated = store
            .update("test", "id", &key, &["name"], &[Value::Text("Zhen".to_string())])
            .unwrap();
        assert_eq!(updated, 1);

        let missing = store
            .update(
                "test",
                "id",
                &Value::BigInt(99),
                &["name"],
                &[Value::Text("x".to_string())],
            )
            .unwrap();
        assert_eq!(missing, 0);

        assert_eq!(store.delete("test", "id", &key).unwrap(), 1);
        assert_eq!(store.delete("test", "id", &key).unwrap(), 0);
    }

    #[test]
    fn test_select_by_key() {
        let store = store_with_table();
        store
            .insert("test", &["name"], &[Value::Text("Zhu".to_string())])
            .unwrap();

        let row = store
            .select_by_key("test", "id", &Value::Int(1))
            .unwrap()
            .unwrap();
        assert_eq!(row.get_named::<i64>("id").unwrap(), 1);
        assert_eq!(row.get_named::<String>("name").unwrap(), "Zhu");
        assert!(
            store
                .select_by_key("test", "id", &Value::BigInt(2))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_select_all_streams_with_predicate() {
        let store = store_with_table();
        for name in ["a", "b", "a"] {
            store
                .insert("test", &["name"], &[Value::Text(name.to_string())])
                .unwrap();
        }

        let all: Vec<Row> = store
            .select_all("test", None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(all.len(), 3);

        let predicate = Predicate::eq("name", "a");
        let mut stream = store.select_all("test", Some(&predicate)).unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_dropping_partial_stream_finalizes() {
        let store = store_with_table();
        store
            .insert("test", &["name"], &[Value::Text("a".to_string())])
            .unwrap();
        store
            .insert("test", &["name"], &[Value::Text("b".to_string())])
            .unwrap();

        {
            let mut stream = store.select_all("test", None).unwrap();
            assert!(stream.next().is_some());
        }
        // a dangling statement would keep the table locked for DROP
        store.execute_raw("DROP TABLE test").unwrap();
    }

    #[test]
    fn test_uuid_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .execute_raw("CREATE TABLE emails (id BLOB PRIMARY KEY, address TEXT)")
            .unwrap();
        let id = assyria_core::next_comb();
        store
            .insert(
                "emails",
                &["id", "address"],
                &[Value::from(id), Value::from("a@b.c")],
            )
            .unwrap();

        let row = store
            .select_by_key("emails", "id", &Value::from(id))
            .unwrap()
            .unwrap();
        assert_eq!(row.get_named::<assyria_core::Uuid>("id").unwrap(), id);
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let store = store_with_table();
        store.begin().unwrap();
        assert!(store.in_transaction());
        assert!(store.begin().is_err());
        store
            .insert("test", &["name"], &[Value::Text("gone".to_string())])
            .unwrap();
        store.rollback().unwrap();

        assert!(!store.in_transaction());
        assert!(store.select_all("test", None).unwrap().next().is_none());
        assert!(matches!(
            store.commit(),
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                ..
            }))
        ));
    }

    #[test]
    fn test_transaction_commit_keeps_writes() {
        let store = store_with_table();
        store.begin().unwrap();
        store
            .insert("test", &["name"], &[Value::Text("kept".to_string())])
            .unwrap();
        store.commit().unwrap();
        assert_eq!(store.query("SELECT * FROM test", &[]).unwrap().len(), 1);
    }

    #[test]
    fn test_observer_sees_statements_in_order() {
        let seen = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let store = SqliteStore::open(&SqliteConfig::memory().foreign_keys(false))
            .unwrap()
            .with_observer(move |sql| sink.lock().unwrap().push(sql.to_string()));

        store
            .execute_raw("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        store
            .insert("test", &["name"], &[Value::Text("Zhu".to_string())])
            .unwrap();
        store.delete("test", "id", &Value::BigInt(1)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].starts_with("INSERT INTO \"test\" (\"name\") VALUES (?)"));
        assert_eq!(seen[2], "DELETE FROM \"test\" WHERE \"id\" = ?");
    }

    #[test]
    fn test_foreign_keys_pragma_follows_config() {
        let enforced = SqliteStore::open_memory().unwrap();
        let rows = enforced.query("PRAGMA foreign_keys", &[]).unwrap();
        assert_eq!(rows[0].get_named::<i64>("foreign_keys").unwrap(), 1);

        let relaxed = SqliteStore::open(&SqliteConfig::memory().foreign_keys(false)).unwrap();
        let rows = relaxed.query("PRAGMA foreign_keys", &[]).unwrap();
        assert_eq!(rows[0].get_named::<i64>("foreign_keys").unwrap(), 0);
    }

    #[test]
    fn test_constraint_violation_maps_kind() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .execute_raw(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));",
            )
            .unwrap();

        let err = store
            .insert("child", &["parent_id"], &[Value::BigInt(42)])
            .unwrap_err();
        match err {
            Error::Store(e) => assert!(e.is_constraint_violation()),
            other => panic!("expected store error, got {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_carries_sql() {
        let store = SqliteStore::open_memory().unwrap();
        let err = store.select_all("no_such_table", None).err().unwrap();
        assert_eq!(err.sql(), Some("SELECT * FROM \"no_such_table\""));
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::read_only().to_sqlite_flags();
        assert_eq!(flags & ffi::SQLITE_OPEN_READONLY, ffi::SQLITE_OPEN_READONLY);
        let default = OpenFlags::default().to_sqlite_flags();
        assert_ne!(default & ffi::SQLITE_OPEN_CREATE, 0);
    }
}
