//! Core types and traits for Assyria.
//!
//! This crate holds everything the persistence session and the store
//! adapters share:
//!
//! - `Entity` trait and `EntityRef` handles for mapped structs
//! - `MappingRegistry` with validated per-type descriptors
//! - `Value`/`Row` model exchanged with the store
//! - `StoreAdapter` trait implemented by backing stores
//! - comb identifier generation
//! - the `Error` taxonomy

pub mod comb;
pub mod entity;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod store;
pub mod types;
pub mod value;

pub use comb::{comb_prefix, comb_timestamp, next_comb};
pub use entity::{
    Entity, EntityRef, ErasedEntity, ErasedRef, KeyStrategy, WeakEntityRef, instance_addr,
    same_instance,
};
pub use error::{
    AssociationConflictError, ConnectionError, ConnectionErrorKind, Error, InvalidStateError,
    MappingError, ObjectNotFoundError, Operation, Result, SchemaError, StaleStateError,
    StoreError, StoreErrorKind, TransactionError, TransactionErrorKind, TypeError,
};
pub use field::FieldInfo;
pub use identifiers::{quote_ident, quote_list};
pub use registry::{EntityDescriptor, MappingRegistry, is_valid_identifier};
pub use relationship::{AssociationInfo, AssociationKind, Cascade, Related, RelatedMany};
pub use row::{ColumnInfo, FromValue, Row};
pub use store::{InsertOutcome, Predicate, RowStream, StatementObserver, StoreAdapter};
pub use types::SqlType;
pub use value::Value;

/// Re-exported so downstream crates name identifier types without a
/// direct dependency.
pub use uuid::Uuid;
