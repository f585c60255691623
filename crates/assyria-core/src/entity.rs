//! Entity trait and shared entity handles.
//!
//! An [`Entity`] is a plain struct with a static mapping description. The
//! session never owns entity values directly: it tracks [`EntityRef`]
//! handles (`Arc<RwLock<T>>`), so a mutation made through any clone of a
//! handle is what the next flush sees, and handle identity is instance
//! identity.

use crate::Result;
use crate::field::FieldInfo;
use crate::relationship::AssociationInfo;
use crate::row::Row;
use crate::value::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// How primary keys are produced for an entity type.
///
/// Fixed per type at mapping time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Numeric key assigned by the store when the row is inserted.
    Sequential,
    /// Key supplied by the caller before the entity is saved.
    ClientAssigned,
    /// Time-ordered 128-bit identifier generated on the client before insert.
    CombGuid,
}

impl KeyStrategy {
    /// Does the framework (store or client generator) produce the key?
    pub const fn is_generated(&self) -> bool {
        matches!(self, KeyStrategy::Sequential | KeyStrategy::CombGuid)
    }

    /// Must the insert be executed immediately to learn the key?
    pub const fn inserts_on_save(&self) -> bool {
        matches!(self, KeyStrategy::Sequential)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Sequential => "sequential",
            KeyStrategy::ClientAssigned => "client-assigned",
            KeyStrategy::CombGuid => "comb-guid",
        }
    }
}

/// A mapped entity type.
///
/// Implementations are written by hand: the consts and [`Entity::fields`]
/// are the static schema description, the methods convert between the
/// struct and store values.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct User { id: i64, name: String }
///
/// impl Entity for User {
///     const TABLE_NAME: &'static str = "users";
///     const KEY_COLUMN: &'static str = "id";
///     const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;
///
///     fn fields() -> &'static [FieldInfo] {
///         static FIELDS: &[FieldInfo] = &[
///             FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
///             FieldInfo::new("name", "name", SqlType::Text),
///         ];
///         FIELDS
///     }
///
///     fn key(&self) -> Value { Value::BigInt(self.id) }
///     fn set_key(&mut self, key: Value) -> Result<()> {
///         self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
///         Ok(())
///     }
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("name", Value::Text(self.name.clone()))]
///     }
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self { id: row.get_named("id")?, name: row.get_named("name")? })
///     }
/// }
/// ```
pub trait Entity: Clone + Send + Sync + 'static {
    /// The name of the backing table.
    const TABLE_NAME: &'static str;

    /// The primary key column.
    const KEY_COLUMN: &'static str;

    /// How keys are produced.
    const KEY_STRATEGY: KeyStrategy;

    /// Association bindings (empty by default).
    const ASSOCIATIONS: &'static [AssociationInfo] = &[];

    /// Column metadata, key column included.
    fn fields() -> &'static [FieldInfo];

    /// Current key value (an unset key reports `Null`, `0` or nil).
    fn key(&self) -> Value;

    /// Assign a key. `Value::Null` resets the key to its unset form.
    #[allow(clippy::result_large_err)]
    fn set_key(&mut self, key: Value) -> Result<()>;

    /// Non-key column values in write order.
    ///
    /// Owning-side associations contribute their foreign key column here;
    /// inverse collections contribute nothing.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Build an instance from a store row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Handles reachable through the named association.
    fn associated(&self, _association: &str) -> Vec<ErasedRef> {
        Vec::new()
    }

    /// Does this instance carry an assigned key?
    fn has_key(&self) -> bool {
        !self.key().is_unset_key()
    }
}

/// Shared handle to an entity instance.
pub struct EntityRef<T: Entity>(Arc<RwLock<T>>);

/// A non-owning handle, used by many-to-one back references.
pub type WeakEntityRef<T> = Weak<RwLock<T>>;

impl<T: Entity> EntityRef<T> {
    /// Wrap a new (typically transient) instance.
    pub fn new(entity: T) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Read access. A poisoned lock is recovered: entity values carry no
    /// invariants a panicking writer could have broken halfway.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current key of the instance.
    pub fn key(&self) -> Value {
        self.read().key()
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakEntityRef<T> {
        Arc::downgrade(&self.0)
    }

    pub fn upgrade(weak: &WeakEntityRef<T>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    /// Type-erased view of this handle sharing the same instance.
    pub fn erased(&self) -> ErasedRef {
        let arc: Arc<RwLock<T>> = Arc::clone(&self.0);
        arc
    }

    /// Recover a typed handle from an erased one.
    pub fn from_erased(erased: &ErasedRef) -> Option<Self> {
        Arc::clone(erased)
            .into_any()
            .downcast::<RwLock<T>>()
            .ok()
            .map(Self)
    }
}

impl<T: Entity> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Entity + fmt::Debug> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityRef").field(&*self.read()).finish()
    }
}

/// Object-safe view of a tracked entity, used where the session handles
/// instances of many types at once (flush plans, cascades).
pub trait ErasedEntity: Send + Sync {
    fn entity_type(&self) -> TypeId;
    fn table_name(&self) -> &'static str;
    fn key(&self) -> Value;
    #[allow(clippy::result_large_err)]
    fn assign_key(&self, key: Value) -> Result<()>;
    fn values(&self) -> Vec<(&'static str, Value)>;
    fn associated(&self, association: &str) -> Vec<ErasedRef>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Type-erased shared entity handle.
pub type ErasedRef = Arc<dyn ErasedEntity>;

impl fmt::Debug for dyn ErasedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedEntity")
            .field("table", &self.table_name())
            .field("key", &self.key())
            .finish()
    }
}

impl<T: Entity> ErasedEntity for RwLock<T> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn table_name(&self) -> &'static str {
        T::TABLE_NAME
    }

    fn key(&self) -> Value {
        self.read().unwrap_or_else(PoisonError::into_inner).key()
    }

    fn assign_key(&self, key: Value) -> Result<()> {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_key(key)
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        self.read().unwrap_or_else(PoisonError::into_inner).to_row()
    }

    fn associated(&self, association: &str) -> Vec<ErasedRef> {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .associated(association)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Address of the instance behind an erased handle; equal for every clone
/// (typed or erased) of the same handle.
pub fn instance_addr(handle: &ErasedRef) -> usize {
    Arc::as_ptr(handle).cast::<()>() as usize
}

/// Do two erased handles point at the same instance?
pub fn same_instance(a: &ErasedRef, b: &ErasedRef) -> bool {
    instance_addr(a) == instance_addr(b)
}
