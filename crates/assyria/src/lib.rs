//! Assyria - a persistence session and unit of work over an embedded store.
//!
//! Assyria tracks entity instances through their lifecycle, keeps one
//! canonical in-memory instance per row, cascades saves along associations
//! and writes everything back in foreign key order when a session is
//! flushed:
//!
//! - Identity map per session
//! - Lifecycle checks (transient, persistent, detached, removed)
//! - Snapshot-based dirty checking
//! - Sequential, client-assigned and comb-guid keys
//! - Transactions that restore tracking state on rollback
//!
//! # Quick Start
//!
//! ```ignore
//! use assyria::prelude::*;
//!
//! let registry = Arc::new(
//!     MappingRegistry::new()
//!         .with::<Country>()?
//!         .with::<Office>()?,
//! );
//!
//! let factory = sqlite_session_factory(registry, SqliteConfig::file("app.db"));
//! recreate_schema(&factory)?;
//!
//! let mut session = factory.open_session()?;
//! let uk = EntityRef::new(Country::new("UK"));
//! session.begin_transaction()?;
//! session.save(&uk)?;
//! session.commit()?;
//! ```

pub mod factory;

pub use factory::{
    open_store, recreate_schema, sqlite_session_factory, sqlite_session_factory_with_observer,
};

pub use assyria_core::{
    AssociationInfo, AssociationKind, Cascade, Entity, EntityDescriptor, EntityRef,
    ErasedEntity, ErasedRef, Error, FieldInfo, FromValue, InsertOutcome, KeyStrategy,
    MappingRegistry, Operation, Predicate, Related, RelatedMany, Result, Row, RowStream, SqlType,
    StatementObserver, StoreAdapter, Uuid, Value, WeakEntityRef, next_comb,
};

pub use assyria_session::{
    EntityState, FlushMode, FlushResult, LockMode, PendingCounts, Session, SessionConfig,
    SessionDebugInfo, SessionEvent, SessionFactory,
};

pub use assyria_schema::{create_statements, drop_statements, recreate};

pub use assyria_sqlite::{OpenFlags, SqliteConfig, SqliteStore};

/// Everything needed to map entities and drive sessions.
pub mod prelude {
    pub use crate::{
        AssociationInfo, Cascade, Entity, EntityRef, EntityState, ErasedRef, Error, FieldInfo,
        FlushMode, FromValue, KeyStrategy, LockMode, MappingRegistry, Predicate, Related,
        RelatedMany, Result, Row, Session, SessionConfig, SessionFactory, SqlType, SqliteConfig,
        SqliteStore, StoreAdapter, Uuid, Value, recreate_schema, sqlite_session_factory,
    };
    pub use std::sync::Arc;
}
