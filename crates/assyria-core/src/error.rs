//! Error types for Assyria persistence operations.

use std::fmt;

/// The primary error type for all session, store and schema operations.
#[derive(Debug)]
pub enum Error {
    /// Opening or closing the backing store failed
    Connection(ConnectionError),
    /// The store adapter could not execute a statement
    Store(StoreError),
    /// Type conversion errors
    Type(TypeError),
    /// Operation attempted against an entity in a state that forbids it
    InvalidState(InvalidStateError),
    /// Two live instances claim the same key within one session
    AssociationConflict(AssociationConflictError),
    /// A flush-time update/delete affected an unexpected number of rows
    StaleState(StaleStateError),
    /// `load` found no row for the requested key
    ObjectNotFound(ObjectNotFoundError),
    /// Transaction boundary misuse
    Transaction(TransactionError),
    /// Entity mapping is invalid or the entity type is not registered
    Mapping(MappingError),
    /// Schema bootstrap errors
    Schema(SchemaError),
    /// I/O errors
    Io(std::io::Error),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the store
    Connect,
    /// Failed to release the store handle
    Close,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Syntax error in the generated statement
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied / read-only store
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Store is locked by another connection
    Busy,
    /// Interrupted
    Cancelled,
    /// Other store error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

/// The entity lifecycle operations the session exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Save,
    Persist,
    Update,
    SaveOrUpdate,
    Merge,
    Delete,
    Lock,
    Flush,
}

impl Operation {
    /// Lower-case operation name as used in error messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Persist => "persist",
            Operation::Update => "update",
            Operation::SaveOrUpdate => "save-or-update",
            Operation::Merge => "merge",
            Operation::Delete => "delete",
            Operation::Lock => "lock",
            Operation::Flush => "flush",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidStateError {
    pub operation: Operation,
    pub entity: &'static str,
    pub message: String,
}

impl InvalidStateError {
    pub fn new(operation: Operation, entity: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            entity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssociationConflictError {
    pub entity: &'static str,
    /// Display form of the conflicting key.
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct StaleStateError {
    pub entity: &'static str,
    /// `"update"` or `"delete"`.
    pub statement: &'static str,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone)]
pub struct ObjectNotFoundError {
    pub entity: &'static str,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// `begin_transaction` while one is already open
    AlreadyActive,
    /// `commit`/`rollback` without an open transaction
    NotActive,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub entity: String,
    pub message: String,
}

#[derive(Debug)]
pub struct SchemaError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Shorthand for an [`Error::InvalidState`].
    pub fn invalid_state(
        operation: Operation,
        entity: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Error::InvalidState(InvalidStateError::new(operation, entity, message))
    }

    /// Is this a stale-state (row count mismatch) error?
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    /// Is this an invalid lifecycle transition?
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    /// Is this a duplicate-instance conflict?
    pub fn is_association_conflict(&self) -> bool {
        matches!(self, Error::AssociationConflict(_))
    }

    /// Did the store itself fail to execute a statement?
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Connection(_) | Error::Io(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Store(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl StoreError {
    /// Is this a constraint violation (unique, foreign key, not null)?
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == StoreErrorKind::Constraint
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Store(e) => write!(f, "Store error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::InvalidState(e) => write!(f, "{}", e),
            Error::AssociationConflict(e) => write!(f, "{}", e),
            Error::StaleState(e) => write!(f, "{}", e),
            Error::ObjectNotFound(e) => write!(f, "{}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Schema(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Display for AssociationConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a different object with the same identifier value was already associated with the session: {}, of entity: {}",
            self.key, self.entity
        )
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch update returned unexpected row count from {}; actual row count: {}; expected: {}",
            self.statement, self.actual, self.expected
        )
    }
}

impl fmt::Display for ObjectNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No row with the given identifier exists: {}, of entity: {}",
            self.key, self.entity
        )
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.entity)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<InvalidStateError> for Error {
    fn from(err: InvalidStateError) -> Self {
        Error::InvalidState(err)
    }
}

impl From<AssociationConflictError> for Error {
    fn from(err: AssociationConflictError) -> Self {
        Error::AssociationConflict(err)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

/// Result type alias for Assyria operations.
pub type Result<T> = std::result::Result<T, Error>;
