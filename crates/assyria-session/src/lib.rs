//! Session and Unit of Work for Assyria.
//!
//! `assyria-session` is the **unit-of-work layer**. A [`Session`] tracks the
//! lifecycle state of entity instances, keeps one canonical instance per
//! row, cascades saves along associations and synchronizes the tracked
//! object graph with a [`StoreAdapter`] when it is flushed.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per (entity type, key).
//! - **State tracking**: every operation is checked against the lifecycle
//!   table before anything changes.
//! - **Change tracking**: snapshots make mutations of persistent instances
//!   visible to the next flush without an explicit `update`.
//! - **Flush**: writes are ordered by foreign key dependencies and each
//!   update/delete must affect exactly one row.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no ambient "current session"; every
//!   operation is a method on the session it affects.
//! - **Manual flush by default**: [`FlushMode::Auto`] is opt-in.
//! - **Type erasure**: tracked instances are `Arc<dyn ErasedEntity>` so
//!   cascades and flush plans can mix entity types.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::open(store, registry);
//!
//! // sequential keys are known as soon as save returns
//! let id = session.save(&user)?;
//!
//! // loads go through the identity map
//! let same = session.load::<User>(id)?;
//! assert!(same.ptr_eq(&user));
//!
//! // mutations are picked up by dirty checking
//! user.write().name = "Zhen".to_string();
//! session.flush()?;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingOp};
pub use identity_map::{EntityKey, IdentityMap, KeyValue};
pub use unit_of_work::{
    EntityState, PendingCounts, PendingWrite, TrackedEntity, Transition, UnitOfWork, transition,
};

use assyria_core::{
    AssociationKind, Entity, EntityDescriptor, EntityRef, ErasedRef, Error, KeyStrategy,
    MappingError, MappingRegistry, ObjectNotFoundError, Operation, Predicate, Result, Row,
    StoreAdapter, TransactionError, TransactionErrorKind, Value, same_instance,
};
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Callbacks receive no arguments; returning `Err` aborts the operation
/// that fired them.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        if !callbacks.is_empty() {
            tracing::trace!(event = ?event, callbacks = callbacks.len(), "Firing session event");
        }
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Before flush computes its plan.
    BeforeFlush,
    /// After a flush wrote everything.
    AfterFlush,
    /// After the commit flush, before the store commits.
    BeforeCommit,
    /// After the store committed.
    AfterCommit,
    /// After rollback restored the checkpoint.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// When the session flushes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Only on [`Session::flush`] and [`Session::commit`].
    #[default]
    Manual,
    /// Also before a read against a table with pending writes.
    Auto,
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flush mode (builder pattern).
    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }
}

/// Lock modes accepted by [`Session::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Reattach only.
    #[default]
    None,
    /// Reattach and confirm the row still exists.
    Read,
}

/// Tracking state captured at `begin_transaction`.
struct Checkpoint {
    identity: IdentityMap,
    work: UnitOfWork,
    /// Instances whose key was generated inside the transaction.
    assigned_keys: Vec<ErasedRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CascadeSide {
    /// Many-to-one targets, saved before the entity itself.
    Parents,
    /// One-to-many members, saved after it.
    Children,
}

impl CascadeSide {
    fn covers(self, kind: AssociationKind) -> bool {
        match self {
            CascadeSide::Parents => kind == AssociationKind::ManyToOne,
            CascadeSide::Children => kind == AssociationKind::OneToMany,
        }
    }
}

#[allow(clippy::result_large_err)]
fn descriptor_of<'r>(
    registry: &'r MappingRegistry,
    handle: &ErasedRef,
) -> Result<&'r EntityDescriptor> {
    registry.descriptor_for(handle.entity_type()).ok_or_else(|| {
        Error::Mapping(MappingError {
            entity: handle.table_name().to_string(),
            message: "entity type is not registered".to_string(),
        })
    })
}

/// Column/value lists for an INSERT of `handle`.
fn insert_image(
    handle: &ErasedRef,
    descriptor: &EntityDescriptor,
    with_key: bool,
) -> (Vec<&'static str>, Vec<Value>) {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    if with_key {
        columns.push(descriptor.key_column);
        values.push(handle.key());
    }
    for (column, value) in handle.values() {
        columns.push(column);
        values.push(value);
    }
    (columns, values)
}

/// UPDATE of `handle`, restricted to `only` when given.
fn update_op(
    handle: &ErasedRef,
    descriptor: &EntityDescriptor,
    only: Option<&[&'static str]>,
) -> PendingOp {
    let (columns, values): (Vec<&'static str>, Vec<Value>) = handle
        .values()
        .into_iter()
        .filter(|(column, _)| only.is_none_or(|cols| cols.contains(column)))
        .unzip();
    PendingOp::Update {
        handle: ErasedRef::clone(handle),
        table: descriptor.table,
        key_column: descriptor.key_column,
        key: handle.key(),
        columns,
        values,
    }
}

/// Record the effect of a write that reached the store.
fn record_applied(identity: &mut IdentityMap, work: &mut UnitOfWork, op: &PendingOp) {
    match op {
        PendingOp::Insert { handle, .. } | PendingOp::Update { handle, .. } => {
            let Some(tracked) = work.get_mut(handle) else {
                return;
            };
            if tracked.state == EntityState::Removed {
                return;
            }
            tracked.pending = PendingWrite::None;
            work.snapshot(handle);
        }
        PendingOp::Delete { handle, .. } => {
            work.remove(handle);
            identity.untrack(handle);
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one store connection.
///
/// Single-threaded: every operation takes `&mut self`. Dropping a session
/// with an open transaction rolls the transaction back.
pub struct Session<S: StoreAdapter> {
    store: S,
    registry: Arc<MappingRegistry>,
    config: SessionConfig,
    orderer: FlushOrderer,
    identity: IdentityMap,
    work: UnitOfWork,
    transaction: Option<Checkpoint>,
    /// Instances given a generated key by the running operation.
    op_keys: Vec<ErasedRef>,
    event_callbacks: SessionEventCallbacks,
}

impl<S: StoreAdapter> Session<S> {
    /// Open a session with the default configuration.
    pub fn open(store: S, registry: Arc<MappingRegistry>) -> Self {
        Self::with_config(store, registry, SessionConfig::default())
    }

    pub fn with_config(store: S, registry: Arc<MappingRegistry>, config: SessionConfig) -> Self {
        tracing::debug!(
            entities = registry.len(),
            flush_mode = ?config.flush_mode,
            "Opening session"
        );
        Self {
            orderer: FlushOrderer::from_registry(&registry),
            store,
            registry,
            config,
            identity: IdentityMap::new(),
            work: UnitOfWork::new(),
            transaction: None,
            op_keys: Vec::new(),
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Close the session, rolling back an open transaction.
    ///
    /// Every tracked instance becomes detached.
    #[allow(clippy::result_large_err)]
    pub fn close(mut self) -> Result<()> {
        let result = if self.transaction.is_some() {
            self.rollback()
        } else {
            Ok(())
        };
        tracing::debug!(tracked = self.work.len(), "Closing session");
        self.identity.clear();
        self.work.clear();
        result
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before each flush. Returning `Err`
    /// aborts the flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit. Returning `Err` aborts
    /// the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Lifecycle Operations
    // ========================================================================

    /// Make a transient instance persistent and return its key.
    ///
    /// Sequential keys are inserted immediately; comb and client-assigned
    /// keys are inserted at the next flush. A no-op for an instance this
    /// session already tracks. Fails for a detached instance: use
    /// [`save_or_update`](Self::save_or_update) to reattach.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn save<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<Value> {
        let handle = entity.erased();
        self.guarded(|session| session.apply(&handle, Operation::Save))?;
        Ok(handle.key())
    }

    /// Like [`save`](Self::save) without returning the key.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn persist<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        self.guarded(|session| session.apply(&entity.erased(), Operation::Persist))
    }

    /// Schedule an update of the instance's row.
    ///
    /// The row is not checked before flush; a missing row surfaces as a
    /// stale-state error then.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn update<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        self.guarded(|session| session.apply(&entity.erased(), Operation::Update))
    }

    /// Save a transient instance or reattach a detached one for update.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn save_or_update<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        self.guarded(|session| session.apply(&entity.erased(), Operation::SaveOrUpdate))
    }

    /// Copy the instance's state onto the canonical persistent instance
    /// for its key and return that instance.
    ///
    /// The argument is never tracked by this call. A transient argument
    /// (or a detached one whose row no longer exists) produces a saved
    /// copy.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn merge<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<EntityRef<T>> {
        self.guarded(|session| session.merge_into(entity))
    }

    #[allow(clippy::result_large_err)]
    fn merge_into<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<EntityRef<T>> {
        let registry = Arc::clone(&self.registry);
        let descriptor = registry.descriptor::<T>()?;
        let handle = entity.erased();
        let state = self.resolve_state(&handle, descriptor)?;

        match transition(Operation::Merge, state, descriptor.table)? {
            Transition::MergeCopy => self.save_copy(entity),
            Transition::MergeInto => {
                let key = handle.key();
                let canonical = match self.identity.lookup_typed::<T>(&key) {
                    Some(tracked) => tracked,
                    None => match self.fetch::<T>(&key)? {
                        Some(loaded) => loaded,
                        None => {
                            tracing::debug!(key = %key, "Row is gone, saving a copy");
                            return self.save_copy(entity);
                        }
                    },
                };
                if self.work.state_of(&canonical.erased()) == Some(EntityState::Removed) {
                    return Err(Error::invalid_state(
                        Operation::Merge,
                        descriptor.table,
                        format!("deleted instance passed to merge: {}", descriptor.table),
                    ));
                }
                let values = entity.read().clone();
                *canonical.write() = values;
                tracing::debug!(key = %key, "Merged into canonical instance");
                Ok(canonical)
            }
            _ => Ok(entity.clone()),
        }
    }

    /// Mark an instance for deletion.
    ///
    /// A detached instance is reattached first. Deleting an instance whose
    /// insert is still pending cancels the insert.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn delete<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        self.apply(&entity.erased(), Operation::Delete)
    }

    /// Reattach a detached instance without reading it from the store.
    ///
    /// Its current values become the clean image, so only later mutations
    /// are flushed. With [`LockMode::Read`] a missing row fails the call
    /// and the instance stays detached.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn lock<T: Entity>(&mut self, entity: &EntityRef<T>, mode: LockMode) -> Result<()> {
        let handle = entity.erased();
        self.guarded(|session| {
            session.apply(&handle, Operation::Lock)?;
            if mode == LockMode::Read {
                let key = handle.key();
                if session
                    .store
                    .select_by_key(T::TABLE_NAME, T::KEY_COLUMN, &key)?
                    .is_none()
                {
                    return Err(Error::ObjectNotFound(ObjectNotFoundError {
                        entity: T::TABLE_NAME,
                        key: key.to_string(),
                    }));
                }
            }
            Ok(())
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The instance for `key`, or [`Error::ObjectNotFound`].
    #[tracing::instrument(level = "debug", skip(self, key), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn load<T: Entity>(&mut self, key: impl Into<Value>) -> Result<EntityRef<T>> {
        let key = key.into();
        self.get::<T>(key.clone())?.ok_or_else(|| {
            Error::ObjectNotFound(ObjectNotFoundError {
                entity: T::TABLE_NAME,
                key: key.to_string(),
            })
        })
    }

    /// The instance for `key`, if the row exists.
    ///
    /// A tracked instance is returned without touching the store; an
    /// instance scheduled for deletion reads as absent.
    #[tracing::instrument(level = "debug", skip(self, key), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn get<T: Entity>(&mut self, key: impl Into<Value>) -> Result<Option<EntityRef<T>>> {
        self.registry.descriptor::<T>()?;
        let key = key.into();

        if let Some(found) = self.identity.lookup_typed::<T>(&key) {
            if self.work.state_of(&found.erased()) == Some(EntityState::Removed) {
                tracing::debug!(key = %key, "Instance is scheduled for deletion");
                return Ok(None);
            }
            tracing::trace!(key = %key, "Identity map hit");
            return Ok(Some(found));
        }

        self.auto_flush(T::TABLE_NAME)?;
        self.fetch::<T>(&key)
    }

    /// All rows of `T`'s table matching `predicate`.
    ///
    /// Rows whose key is already tracked come back as the tracked instance;
    /// instances scheduled for deletion are skipped.
    #[tracing::instrument(level = "debug", skip(self, predicate), fields(table = T::TABLE_NAME))]
    #[allow(clippy::result_large_err)]
    pub fn query_all<T: Entity>(
        &mut self,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<EntityRef<T>>> {
        self.registry.descriptor::<T>()?;
        self.auto_flush(T::TABLE_NAME)?;

        let rows: Vec<Row> = self
            .store
            .select_all(T::TABLE_NAME, predicate)?
            .collect::<Result<_>>()?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.get_by_name(T::KEY_COLUMN).cloned().unwrap_or(Value::Null);
            if let Some(tracked) = self.identity.lookup_typed::<T>(&key) {
                if self.work.state_of(&tracked.erased()) != Some(EntityState::Removed) {
                    entities.push(tracked);
                }
                continue;
            }
            let entity = EntityRef::new(T::from_row(&row)?);
            self.attach_loaded(&entity.erased())?;
            entities.push(entity);
        }

        tracing::debug!(rows = entities.len(), "Query complete");
        Ok(entities)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Is this exact instance tracked by the session?
    pub fn contains<T: Entity>(&self, entity: &EntityRef<T>) -> bool {
        self.work.contains(&entity.erased())
    }

    /// Lifecycle state of the instance relative to this session.
    ///
    /// Client-assigned keys of untracked instances are looked up in the
    /// store to tell transient from detached.
    #[allow(clippy::result_large_err)]
    pub fn state_of<T: Entity>(&self, entity: &EntityRef<T>) -> Result<EntityState> {
        let descriptor = self.registry.descriptor::<T>()?;
        self.resolve_state(&entity.erased(), descriptor)
    }

    /// Does the next flush owe the store a write for this instance?
    pub fn is_dirty<T: Entity>(&self, entity: &EntityRef<T>) -> bool {
        self.work.owes_write(&entity.erased())
    }

    /// Detach one instance. Pending writes for it are discarded.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(table = T::TABLE_NAME))]
    pub fn evict<T: Entity>(&mut self, entity: &EntityRef<T>) -> bool {
        let handle = entity.erased();
        let tracked = self.work.remove(&handle).is_some();
        self.identity.untrack(&handle);
        tracked
    }

    /// Detach every instance. Pending writes are discarded.
    pub fn clear(&mut self) {
        tracing::debug!(tracked = self.work.len(), "Clearing session");
        self.identity.clear();
        self.work.clear();
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.work.pending_counts()
    }

    pub fn tracked_count(&self) -> usize {
        self.work.len()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let counts = self.pending_counts();
        SessionDebugInfo {
            tracked: self.tracked_count(),
            pending_new: counts.new,
            pending_delete: counts.deleted,
            pending_dirty: counts.dirty,
            in_transaction: self.in_transaction(),
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write all pending changes to the store.
    ///
    /// On error the writes executed so far stay executed and their state
    /// changes stay recorded; the session should be discarded.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;
        self.cascade_closure()?;
        let plan = self.plan()?;

        if plan.is_empty() {
            tracing::debug!("Nothing to flush");
        } else {
            let Self {
                store,
                identity,
                work,
                ..
            } = self;
            let result = plan.execute(&*store, |op| record_applied(identity, work, op))?;
            self.event_callbacks.fire(SessionEvent::AfterFlush)?;
            return Ok(result);
        }

        self.event_callbacks.fire(SessionEvent::AfterFlush)?;
        Ok(FlushResult::new())
    }

    #[allow(clippy::result_large_err)]
    fn auto_flush(&mut self, table: &str) -> Result<()> {
        if self.config.flush_mode == FlushMode::Auto && self.work.has_changes_for(table) {
            tracing::debug!(table, "Auto-flushing before read");
            self.flush()?;
        }
        Ok(())
    }

    /// Cascade save-update from every persistent instance, picking up
    /// associated instances attached since they were saved or loaded.
    #[allow(clippy::result_large_err)]
    fn cascade_closure(&mut self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        for handle in self.work.handles() {
            if self.work.state_of(&handle) != Some(EntityState::Persistent) {
                continue;
            }
            let descriptor = descriptor_of(&registry, &handle)?;
            if descriptor.save_update_cascades().next().is_none() {
                continue;
            }
            self.cascade_save_update(&handle, descriptor, CascadeSide::Parents)?;
            self.cascade_save_update(&handle, descriptor, CascadeSide::Children)?;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn plan(&self) -> Result<FlushPlan> {
        let mut ops = Vec::new();
        let mut post_delete = Vec::new();

        for tracked in self.work.iter() {
            let handle = &tracked.handle;
            let descriptor = descriptor_of(&self.registry, handle)?;

            match (tracked.state, tracked.pending) {
                (_, PendingWrite::Insert) => {
                    self.check_references(handle, descriptor, Operation::Flush)?;
                    let (columns, values) = insert_image(handle, descriptor, true);
                    ops.push(PendingOp::Insert {
                        handle: ErasedRef::clone(handle),
                        table: descriptor.table,
                        columns,
                        values,
                    });
                }
                (_, PendingWrite::Update) => {
                    self.check_references(handle, descriptor, Operation::Flush)?;
                    ops.push(update_op(handle, descriptor, None));
                }
                (_, PendingWrite::Delete) => ops.push(PendingOp::Delete {
                    handle: ErasedRef::clone(handle),
                    table: descriptor.table,
                    key_column: descriptor.key_column,
                    key: handle.key(),
                }),
                (EntityState::Persistent, PendingWrite::None) if self.work.is_dirty(handle) => {
                    self.check_references(handle, descriptor, Operation::Flush)?;
                    let changed = self.work.changed_columns(handle);
                    ops.push(update_op(handle, descriptor, Some(&changed)));
                }
                _ => {}
            }

            if tracked.update_after_delete {
                post_delete.push(update_op(handle, descriptor, None));
            }
        }

        Ok(self.orderer.order(ops, post_delete))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Start a store transaction and checkpoint the tracking state.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "a transaction is already active on this session".to_string(),
            }));
        }
        self.store.begin()?;
        self.transaction = Some(Checkpoint {
            identity: self.identity.clone(),
            work: self.work.clone(),
            assigned_keys: Vec::new(),
        });
        tracing::debug!(tracked = self.work.len(), "Transaction started");
        Ok(())
    }

    /// Flush, then commit the store transaction.
    ///
    /// Flushes in every flush mode. A failed flush leaves the transaction
    /// open.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn commit(&mut self) -> Result<()> {
        if self.transaction.is_none() {
            return Err(not_active("commit"));
        }
        self.flush()?;
        self.event_callbacks.fire(SessionEvent::BeforeCommit)?;
        self.store.commit()?;
        self.transaction = None;
        tracing::debug!("Transaction committed");
        self.event_callbacks.fire(SessionEvent::AfterCommit)
    }

    /// Roll back the store transaction and the tracking state.
    ///
    /// Keys generated inside the transaction are cleared, so instances
    /// first saved in it are transient again.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn rollback(&mut self) -> Result<()> {
        let Some(checkpoint) = self.transaction.take() else {
            return Err(not_active("rollback"));
        };
        let result = self.store.rollback();
        self.restore(checkpoint);
        result?;
        self.event_callbacks.fire(SessionEvent::AfterRollback)
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            identity,
            work,
            assigned_keys,
        } = checkpoint;

        for handle in &assigned_keys {
            if let Err(e) = handle.assign_key(Value::Null) {
                tracing::warn!(table = handle.table_name(), error = %e, "Could not clear key");
            }
        }
        self.identity = identity;
        self.work = work;
        tracing::debug!(
            cleared_keys = assigned_keys.len(),
            tracked = self.work.len(),
            "Restored pre-transaction tracking state"
        );
    }

    fn note_assigned_key(&mut self, handle: &ErasedRef) {
        self.op_keys.push(ErasedRef::clone(handle));
        if let Some(checkpoint) = &mut self.transaction {
            checkpoint.assigned_keys.push(ErasedRef::clone(handle));
        }
    }

    /// Run an operation that may start tracking instances. If it fails,
    /// every instance it registered is detached again and keys it generated
    /// for rows that were never written are cleared.
    #[allow(clippy::result_large_err)]
    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let mark = self.work.registration_mark();
        self.op_keys.clear();
        let result = f(self);
        if result.is_err() {
            self.unwind(mark);
        }
        self.op_keys.clear();
        result
    }

    fn unwind(&mut self, mark: usize) {
        let registered = self.work.registered_since(mark);
        for handle in registered.iter().rev() {
            let unwritten = self
                .work
                .get(handle)
                .is_some_and(|tracked| tracked.pending == PendingWrite::Insert);
            self.work.remove(handle);
            self.identity.untrack(handle);

            let generated_here = self.op_keys.iter().any(|h| same_instance(h, handle));
            if unwritten && generated_here {
                if let Err(e) = handle.assign_key(Value::Null) {
                    tracing::warn!(table = handle.table_name(), error = %e, "Could not clear key");
                }
            }
        }
        if !registered.is_empty() {
            tracing::debug!(
                detached = registered.len(),
                "Operation failed, detached the instances it registered"
            );
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn resolve_state(&self, handle: &ErasedRef, descriptor: &EntityDescriptor) -> Result<EntityState> {
        if let Some(state) = self.work.state_of(handle) {
            return Ok(state);
        }
        let key = handle.key();
        if key.is_unset_key() {
            return Ok(EntityState::Transient);
        }
        if self.identity.contains_key(descriptor.type_id, &key) {
            return Ok(EntityState::Detached);
        }
        match descriptor.key_strategy {
            KeyStrategy::ClientAssigned => {
                let exists = self
                    .store
                    .select_by_key(descriptor.table, descriptor.key_column, &key)?
                    .is_some();
                Ok(if exists {
                    EntityState::Detached
                } else {
                    EntityState::Transient
                })
            }
            KeyStrategy::Sequential | KeyStrategy::CombGuid => Ok(EntityState::Detached),
        }
    }

    /// Run `op` against a handle of any registered type.
    #[allow(clippy::result_large_err)]
    fn apply(&mut self, handle: &ErasedRef, op: Operation) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let descriptor = descriptor_of(&registry, handle)?;
        let state = self.resolve_state(handle, descriptor)?;

        match transition(op, state, descriptor.table)? {
            Transition::NoOp => Ok(()),
            Transition::Insert => self.insert_transient(handle, descriptor, op),
            Transition::ScheduleUpdate => {
                self.reattach(handle, descriptor, op, PendingWrite::Update)
            }
            Transition::Reattach => self.reattach(handle, descriptor, op, PendingWrite::None),
            Transition::UpdateAfterDelete => {
                if let Some(tracked) = self.work.get_mut(handle) {
                    tracked.update_after_delete = true;
                }
                Ok(())
            }
            Transition::MarkRemoved => self.mark_removed(handle, descriptor),
            Transition::ReattachRemoved => {
                self.reattach(handle, descriptor, op, PendingWrite::None)?;
                self.mark_removed(handle, descriptor)
            }
            Transition::MergeCopy | Transition::MergeInto => Err(Error::invalid_state(
                op,
                descriptor.table,
                format!("merge needs a typed handle: {}", descriptor.table),
            )),
        }
    }

    #[allow(clippy::result_large_err)]
    fn insert_transient(
        &mut self,
        handle: &ErasedRef,
        descriptor: &EntityDescriptor,
        op: Operation,
    ) -> Result<()> {
        self.cascade_save_update(handle, descriptor, CascadeSide::Parents)?;
        if self.work.contains(handle) {
            // reached again through a cascade cycle while saving its parents
            return Ok(());
        }

        match descriptor.key_strategy {
            KeyStrategy::Sequential => {
                self.check_references(handle, descriptor, op)?;
                self.insert_pending_parents(handle, descriptor, &mut Vec::new())?;
                let (columns, values) = insert_image(handle, descriptor, false);
                let outcome = self.store.insert(descriptor.table, &columns, &values)?;
                handle.assign_key(Value::BigInt(outcome.generated_key))?;
                self.note_assigned_key(handle);
                self.identity.track(ErasedRef::clone(handle))?;
                self.work.register(
                    ErasedRef::clone(handle),
                    EntityState::Persistent,
                    PendingWrite::None,
                );
                self.work.snapshot(handle);
            }
            KeyStrategy::CombGuid => {
                if handle.key().is_unset_key() {
                    handle.assign_key(Value::from(self.store.generate_comb_identifier()))?;
                    self.note_assigned_key(handle);
                }
                self.identity.track(ErasedRef::clone(handle))?;
                self.work.register(
                    ErasedRef::clone(handle),
                    EntityState::Persistent,
                    PendingWrite::Insert,
                );
            }
            KeyStrategy::ClientAssigned => {
                if handle.key().is_unset_key() {
                    return Err(Error::invalid_state(
                        op,
                        descriptor.table,
                        format!(
                            "identifier of an instance must be manually assigned before calling save: {}",
                            descriptor.table
                        ),
                    ));
                }
                self.identity.track(ErasedRef::clone(handle))?;
                self.work.register(
                    ErasedRef::clone(handle),
                    EntityState::Persistent,
                    PendingWrite::Insert,
                );
            }
        }

        tracing::debug!(
            key = %handle.key(),
            strategy = descriptor.key_strategy.as_str(),
            "Instance is now persistent"
        );
        self.cascade_save_update(handle, descriptor, CascadeSide::Children)
    }

    /// Write the pending inserts of `handle`'s many-to-one targets (and of
    /// theirs), so an immediate insert of `handle` finds its parent rows.
    #[allow(clippy::result_large_err)]
    fn insert_pending_parents(
        &mut self,
        handle: &ErasedRef,
        descriptor: &EntityDescriptor,
        visiting: &mut Vec<ErasedRef>,
    ) -> Result<()> {
        if visiting.iter().any(|seen| same_instance(seen, handle)) {
            return Ok(());
        }
        visiting.push(ErasedRef::clone(handle));

        let registry = Arc::clone(&self.registry);
        for association in descriptor.owning_associations() {
            for target in handle.associated(association.name) {
                let target_descriptor = descriptor_of(&registry, &target)?;
                if !self.owes_insert(&target) {
                    continue;
                }
                self.insert_pending_parents(&target, target_descriptor, visiting)?;
                // a cycle may have written it already
                if !self.owes_insert(&target) {
                    continue;
                }
                self.check_references(&target, target_descriptor, Operation::Flush)?;
                let (columns, values) = insert_image(&target, target_descriptor, true);
                let op = PendingOp::Insert {
                    handle: ErasedRef::clone(&target),
                    table: target_descriptor.table,
                    columns,
                    values,
                };
                tracing::debug!(
                    table = target_descriptor.table,
                    key = %target.key(),
                    "Inserting pending parent ahead of its child"
                );
                op.execute(&self.store)?;
                record_applied(&mut self.identity, &mut self.work, &op);
            }
        }
        Ok(())
    }

    fn owes_insert(&self, handle: &ErasedRef) -> bool {
        self.work
            .get(handle)
            .is_some_and(|tracked| tracked.pending == PendingWrite::Insert)
    }

    #[allow(clippy::result_large_err)]
    fn reattach(
        &mut self,
        handle: &ErasedRef,
        descriptor: &EntityDescriptor,
        op: Operation,
        pending: PendingWrite,
    ) -> Result<()> {
        self.identity.track(ErasedRef::clone(handle))?;
        self.work
            .register(ErasedRef::clone(handle), EntityState::Persistent, pending);
        if pending == PendingWrite::None {
            self.work.snapshot(handle);
        }
        tracing::debug!(key = %handle.key(), pending = ?pending, "Reattached instance");

        if matches!(op, Operation::Update | Operation::SaveOrUpdate) {
            self.cascade_save_update(handle, descriptor, CascadeSide::Parents)?;
            self.cascade_save_update(handle, descriptor, CascadeSide::Children)?;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn mark_removed(&mut self, handle: &ErasedRef, descriptor: &EntityDescriptor) -> Result<()> {
        let Some(tracked) = self.work.get_mut(handle) else {
            return Ok(());
        };
        let was_pending_insert = tracked.pending == PendingWrite::Insert;
        tracked.state = EntityState::Removed;
        tracked.pending = PendingWrite::Delete;
        tracked.update_after_delete = false;

        let registry = Arc::clone(&self.registry);
        for association in descriptor.delete_cascades() {
            for target in handle.associated(association.name) {
                let target_descriptor = descriptor_of(&registry, &target)?;
                match self.resolve_state(&target, target_descriptor)? {
                    EntityState::Persistent | EntityState::Detached => {
                        self.apply(&target, Operation::Delete)?;
                    }
                    EntityState::Transient | EntityState::Removed => {}
                }
            }
        }

        if was_pending_insert {
            self.work.remove(handle);
            self.identity.untrack(handle);
            tracing::debug!(key = %handle.key(), "Cancelled pending insert");
        } else {
            tracing::debug!(key = %handle.key(), "Scheduled delete");
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn cascade_save_update(
        &mut self,
        handle: &ErasedRef,
        descriptor: &EntityDescriptor,
        side: CascadeSide,
    ) -> Result<()> {
        let targets: Vec<ErasedRef> = descriptor
            .save_update_cascades()
            .filter(|association| side.covers(association.kind))
            .flat_map(|association| handle.associated(association.name))
            .collect();

        for target in targets {
            tracing::trace!(
                from = descriptor.table,
                to = target.table_name(),
                side = ?side,
                "Cascading save-update"
            );
            self.apply(&target, Operation::SaveOrUpdate)?;
        }
        Ok(())
    }

    /// Fail if a many-to-one reference points at an instance that has no
    /// key yet and is not tracked.
    #[allow(clippy::result_large_err)]
    fn check_references(
        &self,
        handle: &ErasedRef,
        descriptor: &EntityDescriptor,
        op: Operation,
    ) -> Result<()> {
        for association in descriptor.owning_associations() {
            for target in handle.associated(association.name) {
                if target.key().is_unset_key() && !self.work.contains(&target) {
                    return Err(Error::invalid_state(
                        op,
                        descriptor.table,
                        format!(
                            "object references an unsaved transient instance - save the transient instance before flushing: {}",
                            association.target_table
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Read one row and track the resulting instance.
    #[allow(clippy::result_large_err)]
    fn fetch<T: Entity>(&mut self, key: &Value) -> Result<Option<EntityRef<T>>> {
        let Some(row) = self.store.select_by_key(T::TABLE_NAME, T::KEY_COLUMN, key)? else {
            tracing::debug!(key = %key, "No row for key");
            return Ok(None);
        };
        let entity = EntityRef::new(T::from_row(&row)?);
        self.attach_loaded(&entity.erased())?;
        Ok(Some(entity))
    }

    #[allow(clippy::result_large_err)]
    fn attach_loaded(&mut self, handle: &ErasedRef) -> Result<()> {
        self.identity.track(ErasedRef::clone(handle))?;
        self.work.register(
            ErasedRef::clone(handle),
            EntityState::Persistent,
            PendingWrite::None,
        );
        self.work.snapshot(handle);
        Ok(())
    }

    /// Save a fresh copy of `entity`; generated keys are not copied.
    #[allow(clippy::result_large_err)]
    fn save_copy<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<EntityRef<T>> {
        let copy = EntityRef::new(entity.read().clone());
        if T::KEY_STRATEGY.is_generated() {
            copy.write().set_key(Value::Null)?;
        }
        self.apply(&copy.erased(), Operation::Save)?;
        Ok(copy)
    }
}

impl<S: StoreAdapter> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(checkpoint) = self.transaction.take() {
            tracing::warn!("Session dropped with an open transaction, rolling back");
            if let Err(e) = self.store.rollback() {
                tracing::warn!(error = %e, "Implicit rollback failed");
            }
            self.restore(checkpoint);
        }
    }
}

impl<S: StoreAdapter> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tracked", &self.work.len())
            .field("in_transaction", &self.in_transaction())
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

fn not_active(operation: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("cannot {} without an active transaction", operation),
    })
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Total tracked instances.
    pub tracked: usize,
    /// Instances pending INSERT.
    pub pending_new: usize,
    /// Instances pending DELETE.
    pub pending_delete: usize,
    /// Instances pending UPDATE.
    pub pending_dirty: usize,
    pub in_transaction: bool,
}

// ============================================================================
// Session Factory
// ============================================================================

type StoreOpener<S> = Box<dyn Fn() -> Result<S> + Send + Sync>;

/// Opens sessions that share one registry and configuration; each session
/// gets its own store connection from the opener.
pub struct SessionFactory<S: StoreAdapter> {
    registry: Arc<MappingRegistry>,
    config: SessionConfig,
    opener: StoreOpener<S>,
}

impl<S: StoreAdapter> SessionFactory<S> {
    pub fn new(
        registry: Arc<MappingRegistry>,
        opener: impl Fn() -> Result<S> + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry,
            config: SessionConfig::default(),
            opener: Box::new(opener),
        }
    }

    /// Configuration for sessions opened from now on.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[allow(clippy::result_large_err)]
    pub fn open_session(&self) -> Result<Session<S>> {
        let store = (self.opener)()?;
        Ok(Session::with_config(
            store,
            Arc::clone(&self.registry),
            self.config.clone(),
        ))
    }
}

impl<S: StoreAdapter> std::fmt::Debug for SessionFactory<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
