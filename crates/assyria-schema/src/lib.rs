//! Schema bootstrap for Assyria.
//!
//! Generates DDL from the mapping registry and (re)creates the backing
//! tables. Tables are created parents first and dropped children first so
//! foreign key constraints hold at every step.

pub mod create;

pub use create::{CreateTable, drop_table_sql};

use assyria_core::{Error, MappingRegistry, Result, SchemaError, StoreAdapter};

/// CREATE TABLE statements for every registered entity, parents first.
#[allow(clippy::result_large_err)]
pub fn create_statements(registry: &MappingRegistry) -> Result<Vec<String>> {
    registry
        .creation_order()?
        .into_iter()
        .filter_map(|table| registry.descriptor_for_table(table))
        .map(|descriptor| Ok(CreateTable::new(descriptor).build()))
        .collect()
}

/// DROP TABLE IF EXISTS statements for every registered entity, children
/// first.
#[allow(clippy::result_large_err)]
pub fn drop_statements(registry: &MappingRegistry) -> Result<Vec<String>> {
    let mut order = registry.creation_order()?;
    order.reverse();
    Ok(order
        .into_iter()
        .map(|table| drop_table_sql(table, true))
        .collect())
}

/// Drop and recreate every mapped table.
///
/// Existing data is destroyed. Failures are reported as schema errors
/// carrying the store error as their source.
#[allow(clippy::result_large_err)]
pub fn recreate<S: StoreAdapter + ?Sized>(store: &S, registry: &MappingRegistry) -> Result<()> {
    let drops = drop_statements(registry)?;
    let creates = create_statements(registry)?;

    tracing::info!(tables = creates.len(), "Recreating schema");

    for sql in drops.iter().chain(creates.iter()) {
        store.execute_raw(sql).map_err(|e| {
            Error::Schema(SchemaError {
                message: format!("schema bootstrap failed on: {}", sql),
                source: Some(Box::new(e)),
            })
        })?;
    }

    tracing::debug!("Schema recreated");
    Ok(())
}
