//! SQLite-backed session factories.
//!
//! Every session opened from a factory gets its own [`SqliteStore`]
//! connection to the configured database, so sessions can run on different
//! threads against one file.

use assyria_core::{MappingRegistry, Result, StatementObserver, StoreAdapter};
use assyria_session::SessionFactory;
use assyria_sqlite::{SqliteConfig, SqliteStore};
use std::sync::Arc;

/// Factory whose sessions each open a fresh connection from `config`.
pub fn sqlite_session_factory(
    registry: Arc<MappingRegistry>,
    config: SqliteConfig,
) -> SessionFactory<SqliteStore> {
    tracing::debug!(path = %config.path, "Creating SQLite session factory");
    SessionFactory::new(registry, move || SqliteStore::open(&config))
}

/// Like [`sqlite_session_factory`], with `observer` receiving every SQL
/// statement any of its sessions execute.
pub fn sqlite_session_factory_with_observer(
    registry: Arc<MappingRegistry>,
    config: SqliteConfig,
    observer: StatementObserver,
) -> SessionFactory<SqliteStore> {
    SessionFactory::new(registry, move || {
        let mut store = SqliteStore::open(&config)?;
        store.set_observer(Some(Arc::clone(&observer)));
        Ok(store)
    })
}

/// Open a bare store, outside any session.
#[allow(clippy::result_large_err)]
pub fn open_store(config: &SqliteConfig) -> Result<SqliteStore> {
    SqliteStore::open(config)
}

/// Drop and recreate every table mapped in the factory's registry.
///
/// Runs on a connection of its own; existing data is destroyed.
#[allow(clippy::result_large_err)]
pub fn recreate_schema<S: StoreAdapter>(factory: &SessionFactory<S>) -> Result<()> {
    let session = factory.open_session()?;
    assyria_schema::recreate(session.store(), factory.registry())
}
