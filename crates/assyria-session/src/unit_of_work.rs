//! Entity lifecycle states and the per-session record of pending work.
//!
//! [`transition`] is the lifecycle table: given an operation and the state
//! an entity is currently in, it either names what the session must do or
//! rejects the call. It is pure, so the session consults it before touching
//! any tracking state and a rejected call leaves everything unchanged.
//!
//! [`UnitOfWork`] records, for every tracked instance, its state and the
//! write the next flush owes the store, plus the snapshots used for dirty
//! checking.

use crate::change_tracker::ChangeTracker;
use assyria_core::{Error, ErasedRef, Operation, Result, instance_addr};
use std::collections::HashMap;

/// Lifecycle state of an entity relative to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// No store row and not tracked.
    Transient,
    /// Tracked; the row exists or is a pending insert.
    Persistent,
    /// Key assigned but not tracked by this session.
    Detached,
    /// Tracked and scheduled for deletion.
    Removed,
}

impl EntityState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityState::Transient => "transient",
            EntityState::Persistent => "persistent",
            EntityState::Detached => "detached",
            EntityState::Removed => "removed",
        }
    }

    /// Is the entity tracked by the session in this state?
    pub const fn is_tracked(&self) -> bool {
        matches!(self, EntityState::Persistent | EntityState::Removed)
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the session does for an accepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested state.
    NoOp,
    /// Assign or validate the key, track, insert.
    Insert,
    /// Track and schedule an update without checking the row exists.
    ScheduleUpdate,
    /// Track without scheduling a write; the current values become the
    /// clean image.
    Reattach,
    /// Keep the pending delete and run an update after it.
    UpdateAfterDelete,
    /// Mark removed and schedule the delete.
    MarkRemoved,
    /// Track, then mark removed.
    ReattachRemoved,
    /// Save a copy of the argument.
    MergeCopy,
    /// Copy the argument's values into the canonical instance.
    MergeInto,
}

fn deleted_instance(op: Operation, table: &'static str) -> Error {
    Error::invalid_state(
        op,
        table,
        format!("deleted instance passed to {}: {}", op.as_str(), table),
    )
}

/// Decide what `op` means for an entity in `state`.
///
/// Rejections are [`Error::InvalidState`]; messages name the mapped table.
#[allow(clippy::result_large_err)]
pub fn transition(op: Operation, state: EntityState, table: &'static str) -> Result<Transition> {
    use EntityState::{Detached, Persistent, Removed, Transient};

    let next = match (op, state) {
        (Operation::Save | Operation::Persist | Operation::SaveOrUpdate, Transient) => {
            Transition::Insert
        }
        (Operation::Save | Operation::Persist, Detached) => {
            return Err(Error::invalid_state(
                op,
                table,
                format!("detached entity passed to {}: {}", op.as_str(), table),
            ));
        }
        (Operation::SaveOrUpdate | Operation::Update, Detached) => Transition::ScheduleUpdate,
        (Operation::Update, Transient) => Transition::ScheduleUpdate,
        (Operation::Update, Removed) => Transition::UpdateAfterDelete,

        (Operation::Merge, Transient) => Transition::MergeCopy,
        (Operation::Merge, Detached) => Transition::MergeInto,

        (Operation::Delete, Transient) => {
            return Err(Error::invalid_state(
                op,
                table,
                format!("transient instance passed to delete: {}", table),
            ));
        }
        (Operation::Delete, Persistent) => Transition::MarkRemoved,
        (Operation::Delete, Detached) => Transition::ReattachRemoved,

        (Operation::Lock, Transient) => {
            return Err(Error::invalid_state(
                op,
                table,
                format!("cannot lock an unsaved transient instance: {}", table),
            ));
        }
        (Operation::Lock, Detached) => Transition::Reattach,

        (Operation::Flush, _) => {
            return Err(Error::invalid_state(
                op,
                table,
                format!("flush is not an entity operation: {}", table),
            ));
        }

        (_, Persistent) => Transition::NoOp,
        (_, Removed) => return Err(deleted_instance(op, table)),
    };

    tracing::trace!(
        operation = op.as_str(),
        state = state.as_str(),
        transition = ?next,
        table,
        "Lifecycle transition"
    );
    Ok(next)
}

/// The write a tracked instance owes the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWrite {
    /// Nothing scheduled; a dirty check may still produce an update.
    None,
    Insert,
    Update,
    Delete,
}

/// Session-side record of one tracked instance.
#[derive(Clone)]
pub struct TrackedEntity {
    pub handle: ErasedRef,
    pub state: EntityState,
    pub pending: PendingWrite,
    /// An update was requested after the delete was scheduled.
    pub update_after_delete: bool,
}

impl std::fmt::Debug for TrackedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntity")
            .field("table", &self.handle.table_name())
            .field("key", &self.handle.key())
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("update_after_delete", &self.update_after_delete)
            .finish()
    }
}

/// Tracked instances in registration order, with their snapshots.
///
/// Cloning copies the bookkeeping and shares the instances; the session
/// uses this as its transaction checkpoint.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    entries: HashMap<usize, TrackedEntity>,
    order: Vec<usize>,
    change_tracker: ChangeTracker,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `handle`, or replace its record if already tracked.
    pub fn register(&mut self, handle: ErasedRef, state: EntityState, pending: PendingWrite) {
        let addr = instance_addr(&handle);
        tracing::trace!(
            table = handle.table_name(),
            state = state.as_str(),
            pending = ?pending,
            "Registering instance"
        );
        let tracked = TrackedEntity {
            handle,
            state,
            pending,
            update_after_delete: false,
        };
        if self.entries.insert(addr, tracked).is_none() {
            self.order.push(addr);
        }
    }

    pub fn get(&self, handle: &ErasedRef) -> Option<&TrackedEntity> {
        self.entries.get(&instance_addr(handle))
    }

    pub fn get_mut(&mut self, handle: &ErasedRef) -> Option<&mut TrackedEntity> {
        self.entries.get_mut(&instance_addr(handle))
    }

    pub fn contains(&self, handle: &ErasedRef) -> bool {
        self.entries.contains_key(&instance_addr(handle))
    }

    pub fn state_of(&self, handle: &ErasedRef) -> Option<EntityState> {
        self.get(handle).map(|tracked| tracked.state)
    }

    /// Stop tracking an instance and drop its snapshot.
    pub fn remove(&mut self, handle: &ErasedRef) -> Option<TrackedEntity> {
        let addr = instance_addr(handle);
        let removed = self.entries.remove(&addr)?;
        self.order.retain(|a| *a != addr);
        self.change_tracker.forget(handle);
        Some(removed)
    }

    /// Tracked instances in the order they were registered.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.order.iter().filter_map(|addr| self.entries.get(addr))
    }

    /// Number of registrations so far; pass to
    /// [`registered_since`](Self::registered_since) to find later ones.
    pub fn registration_mark(&self) -> usize {
        self.order.len()
    }

    /// Instances registered after `mark`, oldest first. Only valid while
    /// nothing was removed in between.
    pub fn registered_since(&self, mark: usize) -> Vec<ErasedRef> {
        self.order
            .iter()
            .skip(mark)
            .filter_map(|addr| self.entries.get(addr))
            .map(|tracked| ErasedRef::clone(&tracked.handle))
            .collect()
    }

    /// Handles of all tracked instances, in registration order.
    pub fn handles(&self) -> Vec<ErasedRef> {
        self.iter().map(|tracked| ErasedRef::clone(&tracked.handle)).collect()
    }

    pub fn snapshot(&mut self, handle: &ErasedRef) {
        self.change_tracker.snapshot(handle);
    }

    /// Does a persistent instance need an update it was not asked for?
    pub fn is_dirty(&self, handle: &ErasedRef) -> bool {
        self.change_tracker.is_dirty(handle)
    }

    pub fn changed_columns(&self, handle: &ErasedRef) -> Vec<&'static str> {
        self.change_tracker.changed_columns(handle)
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.change_tracker
    }

    /// Does the next flush owe the store a write for this instance?
    pub fn owes_write(&self, handle: &ErasedRef) -> bool {
        self.get(handle)
            .is_some_and(|tracked| self.tracked_owes_write(tracked))
    }

    fn tracked_owes_write(&self, tracked: &TrackedEntity) -> bool {
        tracked.update_after_delete
            || match tracked.pending {
                PendingWrite::None => {
                    tracked.state == EntityState::Persistent
                        && self.change_tracker.is_dirty(&tracked.handle)
                }
                _ => true,
            }
    }

    /// Is any write pending at all?
    pub fn has_changes(&self) -> bool {
        self.iter().any(|tracked| self.tracked_owes_write(tracked))
    }

    /// Is any write pending against `table`?
    pub fn has_changes_for(&self, table: &str) -> bool {
        self.iter()
            .filter(|tracked| tracked.handle.table_name() == table)
            .any(|tracked| self.tracked_owes_write(tracked))
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for tracked in self.iter() {
            match tracked.pending {
                PendingWrite::Insert => counts.new += 1,
                PendingWrite::Update => counts.dirty += 1,
                PendingWrite::Delete => counts.deleted += 1,
                PendingWrite::None => {
                    if self.tracked_owes_write(tracked) {
                        counts.dirty += 1;
                    }
                }
            }
            if tracked.update_after_delete {
                counts.dirty += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.change_tracker.clear_all();
    }
}

/// Count of pending writes by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Instances pending INSERT.
    pub new: usize,
    /// Instances pending UPDATE (scheduled or dirty).
    pub dirty: usize,
    /// Instances pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assyria_core::{
        Entity, EntityRef, FieldInfo, FromValue, KeyStrategy, Row, SqlType, Value,
    };

    const T: &str = "users";

    fn rejected(op: Operation, state: EntityState) -> String {
        let err = transition(op, state, T).unwrap_err();
        assert!(err.is_invalid_state(), "{op} on {state} should be invalid state");
        err.to_string()
    }

    #[test]
    fn test_transient_column() {
        use EntityState::Transient;
        assert_eq!(transition(Operation::Save, Transient, T).unwrap(), Transition::Insert);
        assert_eq!(transition(Operation::Persist, Transient, T).unwrap(), Transition::Insert);
        assert_eq!(
            transition(Operation::SaveOrUpdate, Transient, T).unwrap(),
            Transition::Insert
        );
        assert_eq!(
            transition(Operation::Update, Transient, T).unwrap(),
            Transition::ScheduleUpdate
        );
        assert_eq!(
            transition(Operation::Merge, Transient, T).unwrap(),
            Transition::MergeCopy
        );
        assert_eq!(
            rejected(Operation::Delete, Transient),
            "transient instance passed to delete: users"
        );
        assert_eq!(
            rejected(Operation::Lock, Transient),
            "cannot lock an unsaved transient instance: users"
        );
    }

    #[test]
    fn test_persistent_column_is_noop() {
        for op in [
            Operation::Save,
            Operation::Persist,
            Operation::Update,
            Operation::SaveOrUpdate,
            Operation::Merge,
            Operation::Lock,
        ] {
            assert_eq!(
                transition(op, EntityState::Persistent, T).unwrap(),
                Transition::NoOp,
                "{op}"
            );
        }
        assert_eq!(
            transition(Operation::Delete, EntityState::Persistent, T).unwrap(),
            Transition::MarkRemoved
        );
    }

    #[test]
    fn test_detached_column() {
        use EntityState::Detached;
        assert_eq!(
            rejected(Operation::Save, Detached),
            "detached entity passed to save: users"
        );
        assert_eq!(
            rejected(Operation::Persist, Detached),
            "detached entity passed to persist: users"
        );
        assert_eq!(
            transition(Operation::Update, Detached, T).unwrap(),
            Transition::ScheduleUpdate
        );
        assert_eq!(
            transition(Operation::SaveOrUpdate, Detached, T).unwrap(),
            Transition::ScheduleUpdate
        );
        assert_eq!(
            transition(Operation::Merge, Detached, T).unwrap(),
            Transition::MergeInto
        );
        assert_eq!(
            transition(Operation::Delete, Detached, T).unwrap(),
            Transition::ReattachRemoved
        );
        assert_eq!(
            transition(Operation::Lock, Detached, T).unwrap(),
            Transition::Reattach
        );
    }

    #[test]
    fn test_removed_column() {
        use EntityState::Removed;
        assert_eq!(
            transition(Operation::Update, Removed, T).unwrap(),
            Transition::UpdateAfterDelete
        );
        assert_eq!(
            rejected(Operation::Delete, Removed),
            "deleted instance passed to delete: users"
        );
        assert_eq!(
            rejected(Operation::SaveOrUpdate, Removed),
            "deleted instance passed to save-or-update: users"
        );
        for op in [
            Operation::Save,
            Operation::Persist,
            Operation::Merge,
            Operation::Lock,
        ] {
            rejected(op, Removed);
        }
    }

    #[derive(Debug, Clone)]
    struct User {
        id: i64,
        name: String,
    }

    impl Entity for User {
        const TABLE_NAME: &'static str = "users";
        const KEY_COLUMN: &'static str = "id";
        const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
                FieldInfo::new("name", "name", SqlType::Text),
            ];
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
            vec![("name", Value::Text(self.name.clone()))]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
            })
        }
    }

    fn user(id: i64) -> EntityRef<User> {
        EntityRef::new(User {
            id,
            name: "Zhu".to_string(),
        })
    }

    #[test]
    fn test_pending_counts_and_dirty_detection() {
        let mut uow = UnitOfWork::new();
        let inserted = user(1);
        let loaded = user(2);
        let removed = user(3);

        uow.register(inserted.erased(), EntityState::Persistent, PendingWrite::Insert);
        uow.register(loaded.erased(), EntityState::Persistent, PendingWrite::None);
        uow.snapshot(&loaded.erased());
        uow.register(removed.erased(), EntityState::Removed, PendingWrite::Delete);

        assert_eq!(
            uow.pending_counts(),
            PendingCounts {
                new: 1,
                dirty: 0,
                deleted: 1
            }
        );

        loaded.write().name = "Zhen".to_string();
        assert_eq!(uow.pending_counts().dirty, 1);
        assert!(uow.has_changes_for("users"));
        assert!(!uow.has_changes_for("emails"));
        assert_eq!(uow.changed_columns(&loaded.erased()), vec!["name"]);
    }

    #[test]
    fn test_registration_order_and_removal() {
        let mut uow = UnitOfWork::new();
        let a = user(1);
        let b = user(2);
        let c = user(3);
        for u in [&a, &b, &c] {
            uow.register(u.erased(), EntityState::Persistent, PendingWrite::None);
        }
        // re-registering keeps the original position
        uow.register(a.erased(), EntityState::Removed, PendingWrite::Delete);

        assert!(uow.remove(&b.erased()).is_some());
        let keys: Vec<Value> = uow.iter().map(|t| t.handle.key()).collect();
        assert_eq!(keys, vec![Value::BigInt(1), Value::BigInt(3)]);
        assert_eq!(uow.state_of(&a.erased()), Some(EntityState::Removed));
        assert!(!uow.contains(&b.erased()));
    }

    #[test]
    fn test_registered_since_mark() {
        let mut uow = UnitOfWork::new();
        let a = user(1);
        let b = user(2);
        uow.register(a.erased(), EntityState::Persistent, PendingWrite::None);
        let mark = uow.registration_mark();

        uow.register(b.erased(), EntityState::Persistent, PendingWrite::Insert);
        uow.register(a.erased(), EntityState::Persistent, PendingWrite::Update);

        let added = uow.registered_since(mark);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].key(), Value::BigInt(2));
    }

    #[test]
    fn test_clone_is_a_checkpoint() {
        let mut uow = UnitOfWork::new();
        let a = user(1);
        uow.register(a.erased(), EntityState::Persistent, PendingWrite::None);
        let checkpoint = uow.clone();

        uow.get_mut(&a.erased()).unwrap().state = EntityState::Removed;
        uow.register(user(2).erased(), EntityState::Persistent, PendingWrite::Insert);

        assert_eq!(checkpoint.len(), 1);
        assert_eq!(checkpoint.state_of(&a.erased()), Some(EntityState::Persistent));
    }
}
