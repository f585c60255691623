//! Identity Map: one live instance per (entity type, key) within a session.
//!
//! The map holds the canonical [`ErasedRef`] for every tracked row. Any
//! attempt to introduce a second instance for a key that is already mapped
//! fails with an association conflict instead of silently replacing the
//! tracked instance.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.track(user.erased())?;
//!
//! let found = map.lookup_typed::<User>(&Value::BigInt(1)).unwrap();
//! assert!(found.ptr_eq(&user));
//!
//! // a second instance with the same key is rejected
//! assert!(map.track(copy.erased()).unwrap_err().is_association_conflict());
//! ```

use assyria_core::{
    AssociationConflictError, Entity, EntityRef, Error, ErasedRef, Result, Value, instance_addr,
    same_instance,
};
use std::any::TypeId;
use std::collections::HashMap;
/// A key value normalized for identity comparisons.
///
/// Integer variants compare as `i64` and 16-byte blobs compare as UUIDs, so
/// a key read back from the store addresses the same entry as the key the
/// entity reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Bit pattern of the float.
    Double(u64),
    Text(String),
    Uuid([u8; 16]),
    Bytes(Vec<u8>),
}

impl KeyValue {
    pub fn normalize(value: &Value) -> Self {
        match value {
            Value::Null => KeyValue::Null,
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Int(v) => KeyValue::Integer(i64::from(*v)),
            Value::BigInt(v) => KeyValue::Integer(*v),
            Value::Double(f) => KeyValue::Double(f.to_bits()),
            Value::Text(s) => KeyValue::Text(s.clone()),
            Value::Uuid(bytes) => KeyValue::Uuid(*bytes),
            Value::Bytes(bytes) => match value.as_uuid() {
                Some(uuid) => KeyValue::Uuid(*uuid.as_bytes()),
                None => KeyValue::Bytes(bytes.clone()),
            },
        }
    }
}

/// Address of a row within a session: entity type plus normalized key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    type_id: TypeId,
    key: KeyValue,
}

impl EntityKey {
    pub fn new(type_id: TypeId, key: &Value) -> Self {
        Self {
            type_id,
            key: KeyValue::normalize(key),
        }
    }

    /// Key of a typed entity value.
    pub fn of<T: Entity>(key: &Value) -> Self {
        Self::new(TypeId::of::<T>(), key)
    }

    /// Key of the instance behind a handle, using its current key.
    pub fn for_handle(handle: &ErasedRef) -> Self {
        Self::new(handle.entity_type(), &handle.key())
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn key(&self) -> &KeyValue {
        &self.key
    }
}

/// Per-session map from row address to canonical instance.
///
/// Cloning the map clones the handles, not the instances; the session uses
/// this to checkpoint tracking state at transaction begin.
#[derive(Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, ErasedRef>,
    /// Instance address -> the key it was tracked under. Keys can change
    /// after tracking (a rollback clears generated keys), so removal goes
    /// through this index rather than the current key.
    by_instance: HashMap<usize, EntityKey>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if a different instance already maps to the handle's key.
    #[allow(clippy::result_large_err)]
    pub fn assert_unique(&self, handle: &ErasedRef) -> Result<()> {
        let key = handle.key();
        match self.entries.get(&EntityKey::new(handle.entity_type(), &key)) {
            Some(existing) if !same_instance(existing, handle) => {
                tracing::debug!(
                    table = handle.table_name(),
                    key = %key,
                    "Second instance for a tracked key"
                );
                Err(Error::AssociationConflict(AssociationConflictError {
                    entity: handle.table_name(),
                    key: key.to_string(),
                }))
            }
            _ => Ok(()),
        }
    }

    /// Make `handle` the canonical instance for its key.
    ///
    /// Tracking the same instance twice is a no-op; the handle is returned
    /// so callers can chain.
    #[allow(clippy::result_large_err)]
    pub fn track(&mut self, handle: ErasedRef) -> Result<ErasedRef> {
        self.assert_unique(&handle)?;
        let addr = instance_addr(&handle);
        let key = EntityKey::for_handle(&handle);

        if let Some(previous) = self.by_instance.insert(addr, key.clone()) {
            if previous != key {
                self.entries.remove(&previous);
            }
        }
        self.entries.insert(key, ErasedRef::clone(&handle));
        tracing::trace!(
            table = handle.table_name(),
            key = %handle.key(),
            tracked = self.entries.len(),
            "Tracking instance"
        );
        Ok(handle)
    }

    /// Canonical instance for a key, if any.
    pub fn lookup(&self, type_id: TypeId, key: &Value) -> Option<ErasedRef> {
        self.entries.get(&EntityKey::new(type_id, key)).cloned()
    }

    /// Typed variant of [`IdentityMap::lookup`].
    pub fn lookup_typed<T: Entity>(&self, key: &Value) -> Option<EntityRef<T>> {
        self.entries
            .get(&EntityKey::of::<T>(key))
            .and_then(EntityRef::from_erased)
    }

    /// Stop tracking an instance. Returns whether it was tracked.
    pub fn untrack(&mut self, handle: &ErasedRef) -> bool {
        let Some(key) = self.by_instance.remove(&instance_addr(handle)) else {
            return false;
        };
        if self
            .entries
            .get(&key)
            .is_some_and(|existing| same_instance(existing, handle))
        {
            self.entries.remove(&key);
        }
        true
    }

    /// Is this exact instance tracked?
    pub fn contains_instance(&self, handle: &ErasedRef) -> bool {
        self.by_instance.contains_key(&instance_addr(handle))
    }

    /// Is any instance tracked for this key?
    pub fn contains_key(&self, type_id: TypeId, key: &Value) -> bool {
        self.entries.contains_key(&EntityKey::new(type_id, key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_instance.clear();
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("tracked", &self.entries.len())
            .finish()
    }
}
