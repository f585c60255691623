//! Snapshot-based dirty checking.
//!
//! When an instance becomes persistent with a known store image (load,
//! insert, update, lock) its column values are serialized and kept. At
//! flush time the current values are serialized again and compared; any
//! difference schedules an update without an explicit call.

use assyria_core::{ErasedRef, Value, instance_addr};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Serialized column values of one instance at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    data: Vec<u8>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            taken_at: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

#[derive(Serialize)]
struct Image<'a> {
    columns: BTreeMap<&'static str, &'a Value>,
}

fn serialize_values(values: &[(&'static str, Value)]) -> Vec<u8> {
    let image = Image {
        columns: values.iter().map(|(column, value)| (*column, value)).collect(),
    };
    serde_json::to_vec(&image).unwrap_or_default()
}

/// Snapshots of tracked instances, keyed by instance address.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<usize, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current column values of `handle` as its clean image.
    #[tracing::instrument(level = "trace", skip(self, handle), fields(table = handle.table_name()))]
    pub fn snapshot(&mut self, handle: &ErasedRef) {
        let data = serialize_values(&handle.values());
        tracing::trace!(snapshot_bytes = data.len(), "Taking instance snapshot");
        self.snapshots
            .insert(instance_addr(handle), ObjectSnapshot::new(data));
    }

    /// Has the instance changed since its snapshot?
    ///
    /// An instance without a snapshot counts as dirty.
    #[tracing::instrument(level = "trace", skip(self, handle), fields(table = handle.table_name()))]
    pub fn is_dirty(&self, handle: &ErasedRef) -> bool {
        let Some(snapshot) = self.snapshots.get(&instance_addr(handle)) else {
            tracing::trace!(dirty = true, "No snapshot - treating as dirty");
            return true;
        };
        let dirty = serialize_values(&handle.values()) != snapshot.data;
        tracing::trace!(dirty = dirty, "Dirty check result");
        dirty
    }

    /// Columns whose value differs from the snapshot, in mapping order.
    pub fn changed_columns(&self, handle: &ErasedRef) -> Vec<&'static str> {
        let values = handle.values();
        let Some(snapshot) = self.snapshots.get(&instance_addr(handle)) else {
            return values.iter().map(|(column, _)| *column).collect();
        };

        let original: serde_json::Value =
            serde_json::from_slice(&snapshot.data).unwrap_or(serde_json::Value::Null);
        let original = original.get("columns");

        let changed: Vec<&'static str> = values
            .iter()
            .filter(|(column, value)| {
                let current = serde_json::to_value(value).ok();
                original.and_then(|o| o.get(*column)) != current.as_ref()
            })
            .map(|(column, _)| *column)
            .collect();

        tracing::debug!(
            table = handle.table_name(),
            changed_count = changed.len(),
            columns = ?changed,
            "Detected changed columns"
        );
        changed
    }

    pub fn has_snapshot(&self, handle: &ErasedRef) -> bool {
        self.snapshots.contains_key(&instance_addr(handle))
    }

    pub fn get_snapshot(&self, handle: &ErasedRef) -> Option<&ObjectSnapshot> {
        self.snapshots.get(&instance_addr(handle))
    }

    /// Forget the snapshot of one instance.
    pub fn forget(&mut self, handle: &ErasedRef) {
        self.snapshots.remove(&instance_addr(handle));
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
