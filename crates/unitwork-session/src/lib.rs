//! Session and unit of work for unitwork.
//!
//! `unitwork-session` is the **persistence context**. Within one session it
//! keeps a single in-memory instance per database row, detects which managed
//! instances changed since they were loaded, and turns those changes into an
//! ordered batch of INSERT / UPDATE / DELETE statements at flush time.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: two loads of one key return the same `Arc`.
//! - **Dirty checking**: loaded snapshots are compared column by column.
//! - **Cascades**: persist, remove, merge, refresh and detach follow
//!   associations according to their [`CascadeStyle`](unitwork_core::CascadeStyle).
//! - **Orphan removal**: elements dropped from an orphan-removal association
//!   are deleted unless re-associated before flush.
//! - **Auto-flush**: queries see pending changes to the tables they touch.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn);
//!
//! let team = entity_ref(Team::new(1, "Avengers"));
//! session.persist(&team)?;
//!
//! if let Outcome::Ok(Some(hero)) = session.get::<Hero>(&cx, 7_i64).await {
//!     write_lock(&hero).name = "Thor".into();
//! }
//!
//! // INSERT for the team, versioned UPDATE for the hero, then COMMIT.
//! session.commit(&cx).await
//! ```

pub mod action_queue;
pub mod cascade;
pub mod config;
pub mod context;
pub mod flush;
pub mod query;

#[cfg(test)]
mod test_support;

pub use action_queue::{
    ActionQueue, CollectionAction, CollectionActionKind, CollectionOp, DeleteAction,
    InsertAction, PendingCounts, UpdateAction, VersionCheck,
};
pub use config::{FlushMode, SessionConfig};
pub use context::{
    CollectionEntry, CollectionKey, ElementState, EntityEntry, EntityStatus, PersistenceContext,
};
pub use flush::{FlushPlan, FlushStats, OrderedInserts, PreparedInsert};
pub use query::{Query, extract_tables};

use asupersync::{Cx, Outcome};
use context::{association_keys, natural_key_of};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    AssociationInfo, AssociationKind, CascadeAction, Connection, Dialect, Entity, EntityKey,
    EntityRef, Error, FieldInfo, Result, Row, SessionError, SessionErrorKind, SharedEntity,
    TypeError, Value, downcast, entity_ref, field_for_column, holds_instance, instance_id,
    natural_id_columns, read_lock, same_instance, share,
};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` will abort the operation (e.g., prevent commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
///
/// These are fired at key points in the session lifecycle:
/// before/after flush, commit, and rollback.
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
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes and executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Statistics
// ============================================================================

/// Snapshot of what a session holds and has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Managed entity entries.
    pub entities: usize,
    /// Association snapshots held.
    pub collections: usize,
    /// Queued actions per category.
    pub pending: PendingCounts,
    /// Flushes that executed at least one statement.
    pub flushes: usize,
    /// Of those, flushes triggered by a query.
    pub auto_flushes: usize,
    /// Statements executed by flushes and bulk updates.
    pub statements: usize,
    /// Entities materialized from rows.
    pub entities_loaded: usize,
    /// Queries issued through the session.
    pub queries: usize,
    /// Natural-id lookups answered without a query.
    pub natural_id_hits: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// A flush failed part way; only rollback and close are allowed.
    Unusable,
    Closed,
}

/// What triggered a removal; decides where its DELETE is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// `remove` called by the application.
    Requested,
    /// Reached through a remove cascade while preparing a flush.
    Cascaded { early: bool },
    /// Dropped from an orphan-removal collection.
    CollectionOrphan,
    /// Replaced in an orphan-removal to-one association.
    ReplacedOrphan,
}

impl Removal {
    fn is_orphan(self) -> bool {
        matches!(self, Removal::CollectionOrphan | Removal::ReplacedOrphan)
    }

    /// Replaced to-one orphans, and everything cascaded from them, are
    /// deleted before inserts.
    fn runs_early(self) -> bool {
        matches!(
            self,
            Removal::ReplacedOrphan | Removal::Cascaded { early: true }
        )
    }

    /// The removal applied to rows reached by cascading from this one.
    fn cascaded(self) -> Removal {
        match self {
            Removal::Requested => Removal::Requested,
            other => Removal::Cascaded {
                early: other.runs_early(),
            },
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn entity_error(kind: SessionErrorKind, key: &EntityKey, message: impl Into<String>) -> Error {
    Error::Session(
        SessionError::new(kind, message)
            .entity(key.entity())
            .identifier(key.id_string()),
    )
}

fn unknown_association(entity: &'static str, role: &str) -> Error {
    Error::Session(
        SessionError::new(
            SessionErrorKind::UnknownAssociation,
            format!("no association named '{role}' of the requested shape"),
        )
        .entity(entity),
    )
}

fn type_mismatch<M: Entity>(key: &EntityKey) -> Error {
    Error::Type(TypeError {
        expected: M::ENTITY_NAME,
        actual: key.entity().to_string(),
        column: None,
        rust_type: Some(std::any::type_name::<M>()),
    })
}

/// First identifier value; associations use single-column keys.
fn owner_value(key: &EntityKey) -> Value {
    key.id().first().cloned().unwrap_or(Value::Null)
}

fn column_list(dialect: Dialect, fields: &[FieldInfo]) -> String {
    fields
        .iter()
        .map(|f| dialect.quote_identifier(f.column_name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_by_key_sql(dialect: Dialect, table: &str, fields: &[FieldInfo], key: &[&str]) -> String {
    let predicate = key
        .iter()
        .enumerate()
        .map(|(i, col)| {
            format!(
                "{} = {}",
                dialect.quote_identifier(col),
                dialect.placeholder(i + 1)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT {} FROM {} WHERE {}",
        column_list(dialect, fields),
        dialect.quote_identifier(table),
        predicate
    )
}

fn select_in_sql(
    dialect: Dialect,
    table: &str,
    fields: &[FieldInfo],
    key: &str,
    count: usize,
) -> String {
    let placeholders: Vec<String> = (1..=count).map(|i| dialect.placeholder(i)).collect();
    format!(
        "SELECT {} FROM {} WHERE {} IN ({})",
        column_list(dialect, fields),
        dialect.quote_identifier(table),
        dialect.quote_identifier(key),
        placeholders.join(", ")
    )
}

/// Columns of a managed entry whose current value differs from the loaded one.
///
/// Key, version and non-updatable columns are never dirty. Without a loaded
/// snapshot every remaining column is.
fn dirty_columns_of(entry: &EntityEntry, row: &[(&'static str, Value)]) -> Vec<&'static str> {
    let instance = &entry.instance;
    let fields = instance.fields();
    let pk = instance.primary_key_columns();
    let version_column = instance.version_column();
    row.iter()
        .filter(|(column, _)| Some(*column) != version_column && !pk.contains(column))
        .filter(|(column, _)| field_for_column(fields, column).is_none_or(|f| f.updatable))
        .filter(|(column, value)| {
            entry
                .loaded_value(column)
                .is_none_or(|loaded| !loaded.same_identity(value))
        })
        .map(|(column, _)| *column)
        .collect()
}

fn same_members(a: &[EntityKey], b: &[EntityKey]) -> bool {
    a.len() == b.len() && a.iter().all(|k| b.contains(k))
}

fn link_op(info: &AssociationInfo, owner: &Value, element: &EntityKey) -> Option<CollectionOp> {
    let element = element.id().first()?.clone();
    match (info.kind, info.link_table, info.remote_key) {
        (AssociationKind::ManyToMany, Some(link), _) => Some(CollectionOp::InsertLink {
            table: link.table_name,
            local_column: link.local_column,
            local_value: owner.clone(),
            remote_column: link.remote_column,
            remote_value: element,
        }),
        (AssociationKind::OneToMany, _, Some(fk)) => Some(CollectionOp::SetForeignKey {
            table: info.target_table,
            fk_column: fk,
            owner_value: owner.clone(),
            key_column: info.target_key,
            element_value: element,
        }),
        _ => None,
    }
}

fn unlink_op(info: &AssociationInfo, owner: &Value, element: &EntityKey) -> Option<CollectionOp> {
    let element = element.id().first()?.clone();
    match (info.kind, info.link_table, info.remote_key) {
        (AssociationKind::ManyToMany, Some(link), _) => Some(CollectionOp::DeleteLink {
            table: link.table_name,
            local_column: link.local_column,
            local_value: owner.clone(),
            remote_column: link.remote_column,
            remote_value: element,
        }),
        (AssociationKind::OneToMany, _, Some(fk)) => Some(CollectionOp::ClearForeignKey {
            table: info.target_table,
            fk_column: fk,
            key_column: info.target_key,
            element_value: element,
        }),
        _ => None,
    }
}

fn removal_op(info: &AssociationInfo, owner: &Value) -> Option<CollectionOp> {
    match (info.kind, info.link_table, info.remote_key) {
        (AssociationKind::ManyToMany, Some(link), _) => Some(CollectionOp::DeleteAllLinks {
            table: link.table_name,
            local_column: link.local_column,
            local_value: owner.clone(),
        }),
        (AssociationKind::OneToMany, _, Some(fk)) => Some(CollectionOp::ClearForeignKeys {
            table: info.target_table,
            fk_column: fk,
            owner_value: owner.clone(),
        }),
        _ => None,
    }
}

/// DELETE for a managed entry, with the version it was loaded at and the
/// rows it references (loaded and current foreign keys).
fn delete_action(entry: &EntityEntry, orphan: bool, early: bool, from_flush: bool) -> DeleteAction {
    let instance = &entry.instance;
    let mut references: Vec<EntityKey> = Vec::new();
    for info in instance.associations().iter().filter(|a| a.owns_foreign_key()) {
        let loaded = info
            .local_key
            .and_then(|col| entry.loaded_value(col))
            .filter(|v| !v.is_null())
            .map(|fk| EntityKey::new(info.target_entity, vec![fk.clone()]));
        let current = association_keys(instance, info).unwrap_or_default();
        for key in loaded.into_iter().chain(current) {
            if !references.contains(&key) {
                references.push(key);
            }
        }
    }
    let version = instance.version_column().and_then(|col| {
        entry
            .version
            .clone()
            .filter(|v| !v.is_null())
            .map(|v| (col, v))
    });
    DeleteAction {
        key: entry.key.clone(),
        entity: instance.entity_name(),
        table: instance.table_name(),
        pk_columns: instance.primary_key_columns(),
        version,
        references,
        orphan,
        early,
        from_flush,
        seq: entry.seq,
    }
}

/// DELETE for a row known only by key (not loaded into the session).
fn key_only_delete(
    key: EntityKey,
    info: &'static AssociationInfo,
    references: Vec<EntityKey>,
    orphan: bool,
    seq: u64,
) -> DeleteAction {
    DeleteAction {
        key,
        entity: info.target_entity,
        table: info.target_table,
        pk_columns: std::slice::from_ref(&info.target_key),
        version: None,
        references,
        orphan,
        early: orphan && !info.kind.is_collection(),
        from_flush: true,
        seq,
    }
}

/// Capture an insert's column values from the instance.
///
/// A NULL version is seeded with the first version value.
fn prepare_insert(action: &InsertAction) -> Result<PreparedInsert> {
    let instance = &action.instance;
    let fields = instance.fields();
    let version_column = instance.version_column();
    let mut columns = Vec::new();
    let mut values = Vec::new();
    let mut version = None;
    for (column, value) in instance.row() {
        if field_for_column(fields, column).is_some_and(|f| !f.insertable) {
            continue;
        }
        let value = if Some(column) == version_column {
            let seeded = if value.is_null() {
                value.next_version()?
            } else {
                value
            };
            version = Some((column, seeded.clone()));
            seeded
        } else {
            value
        };
        columns.push(column);
        values.push(value);
    }
    let mut depends_on = Vec::new();
    let mut nullable_depends_on = Vec::new();
    for info in instance.associations().iter().filter(|a| a.owns_foreign_key()) {
        let targets = association_keys(instance, info).unwrap_or_default();
        let nullable = info
            .local_key
            .filter(|col| columns.contains(col))
            .filter(|col| field_for_column(fields, col).is_some_and(|f| f.nullable));
        match nullable {
            Some(column) => nullable_depends_on.extend(targets.into_iter().map(|k| (k, column))),
            None => depends_on.extend(targets),
        }
    }
    Ok(PreparedInsert {
        key: action.key.clone(),
        entity: action.entity,
        table: action.table,
        pk_columns: instance.primary_key_columns(),
        columns,
        values,
        version,
        depends_on,
        nullable_depends_on,
        seq: action.seq,
    })
}

fn check_merge_version(
    source: &SharedEntity,
    key: &EntityKey,
    current: Option<&Value>,
) -> Result<()> {
    let Some(column) = source.version_column() else {
        return Ok(());
    };
    let Some(current) = current.filter(|v| !v.is_null()) else {
        return Ok(());
    };
    let offered = source
        .row()
        .into_iter()
        .find(|(c, _)| *c == column)
        .map(|(_, v)| v);
    match offered {
        Some(offered) if !offered.is_null() && !offered.same_identity(current) => Err(entity_error(
            SessionErrorKind::OptimisticLock,
            key,
            format!("detached instance is stale: version {offered}, current {current}"),
        )),
        _ => Ok(()),
    }
}

// ============================================================================
// Session
// ============================================================================

/// The persistence context bound to one connection.
///
/// All mutating operations take `&mut self`; one session is driven by one
/// logical thread. Entity handles it returns are `Arc<RwLock<M>>` and may be
/// read and written freely between session calls.
pub struct Session<C: Connection> {
    /// The database connection.
    connection: C,
    /// Configuration.
    config: SessionConfig,
    /// Identity map and per-entity bookkeeping.
    context: PersistenceContext,
    /// Pending writes.
    actions: ActionQueue,
    state: SessionState,
    /// Whether we're in a transaction.
    in_transaction: bool,
    /// Keys marked removed by the flush being prepared (orphans and their cascades).
    flush_removed: Vec<EntityKey>,
    /// Session-level event callbacks.
    event_callbacks: SessionEventCallbacks,
    stats: SessionStats,
}

impl<C: Connection> Session<C> {
    /// Create a new session from an existing connection.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        Self {
            connection,
            config,
            context: PersistenceContext::new(),
            actions: ActionQueue::new(),
            state: SessionState::Open,
            in_transaction: false,
            flush_removed: Vec::new(),
            event_callbacks: SessionEventCallbacks::default(),
            stats: SessionStats::default(),
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.config.flush_mode = mode;
    }

    /// The persistence context, for inspection.
    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// False after a failed flush or once closed.
    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Unusable => Err(Error::session(
                SessionErrorKind::SessionUnusable,
                "a previous flush failed; roll back and discard this session",
            )),
            SessionState::Closed => Err(Error::session(
                SessionErrorKind::Closed,
                "session is closed",
            )),
        }
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Make a transient instance managed and schedule its insert.
    ///
    /// Cascades `Persist`. Persisting a managed instance only cascades;
    /// persisting a removed one cancels the removal.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = M::ENTITY_NAME))]
    pub fn persist<M: Entity>(&mut self, entity: &EntityRef<M>) -> Result<()> {
        self.ensure_open()?;
        let root = share(entity);
        self.persist_one(&root)?;
        for target in cascade::reachable(std::slice::from_ref(&root), CascadeAction::Persist) {
            self.persist_one(&target)?;
        }
        Ok(())
    }

    fn persist_one(&mut self, instance: &SharedEntity) -> Result<()> {
        if let Some(key) = self.context.key_of(instance).cloned() {
            self.rescue(&key);
            return Ok(());
        }
        let key = instance.key();
        key.require_id()?;
        if self.context.contains_key(&key) {
            return Err(entity_error(
                SessionErrorKind::NonUniqueObject,
                &key,
                "a different instance with the same identifier is already associated \
                 with the session",
            ));
        }
        if self.context.is_detached(&key) {
            return Err(entity_error(
                SessionErrorKind::Detached,
                &key,
                "detached entity passed to persist; use merge",
            ));
        }
        tracing::debug!(key = %key, "Scheduling insert");
        self.schedule_insert(key, Arc::clone(instance));
        Ok(())
    }

    fn schedule_insert(&mut self, key: EntityKey, instance: SharedEntity) {
        let entry = self
            .context
            .add_entry(key.clone(), Arc::clone(&instance), None, false, false);
        let seq = entry.seq;
        self.actions.add_insert(InsertAction {
            key,
            entity: instance.entity_name(),
            table: instance.table_name(),
            instance,
            seq,
        });
    }

    /// Undo a pending removal.
    fn rescue(&mut self, key: &EntityKey) {
        let Some(entry) = self.context.entry_mut(key) else {
            return;
        };
        if !entry.removed {
            return;
        }
        entry.removed = false;
        entry.orphan = false;
        if entry.exists_in_database {
            self.actions.unschedule_deletion(key);
        } else {
            self.actions.add_insert(InsertAction {
                key: key.clone(),
                entity: entry.instance.entity_name(),
                table: entry.instance.table_name(),
                instance: Arc::clone(&entry.instance),
                seq: entry.seq,
            });
        }
        self.flush_removed.retain(|k| k != key);
        self.context.record_natural_id(key);
        tracing::debug!(key = %key, "Removal cancelled");
    }

    /// Schedule a managed instance for deletion.
    ///
    /// Cascades `Remove`. A pending insert is cancelled outright. Removing a
    /// transient instance does nothing; removing a detached one fails.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = M::ENTITY_NAME))]
    pub fn remove<M: Entity>(&mut self, entity: &EntityRef<M>) -> Result<()> {
        self.ensure_open()?;
        let root = share(entity);
        let Some(key) = self.context.key_of(&root).cloned() else {
            let key = root.key();
            if self.context.contains_key(&key) || self.context.is_detached(&key) {
                return Err(entity_error(
                    SessionErrorKind::Detached,
                    &key,
                    "detached entity passed to remove",
                ));
            }
            tracing::debug!(key = %key, "Ignoring remove of transient instance");
            return Ok(());
        };
        self.remove_cascade(&key, &root, Removal::Requested);
        Ok(())
    }

    fn remove_cascade(&mut self, key: &EntityKey, root: &SharedEntity, removal: Removal) {
        if self.context.entry(key).is_none_or(|e| e.removed) {
            return;
        }
        let cascaded = removal.cascaded();
        for target in cascade::reachable(std::slice::from_ref(root), CascadeAction::Remove) {
            if let Some(child) = self.context.key_of(&target).cloned() {
                self.remove_one(&child, cascaded);
            }
        }
        self.remove_one(key, removal);
    }

    fn remove_one(&mut self, key: &EntityKey, removal: Removal) {
        let Some(entry) = self.context.entry_mut(key) else {
            return;
        };
        if entry.removed {
            return;
        }
        let orphan = removal.is_orphan();
        entry.removed = true;
        entry.orphan = orphan;
        let from_flush = removal != Removal::Requested;
        if from_flush {
            self.flush_removed.push(key.clone());
        }
        if entry.exists_in_database {
            let early = removal.runs_early();
            self.actions
                .add_delete(delete_action(entry, orphan, early, from_flush));
        } else {
            self.actions.unschedule_insert(key);
        }
        self.context.forget_natural_id(key);
        tracing::debug!(key = %key, orphan, "Scheduled removal");
    }

    /// Key of a managed, non-removed instance.
    fn managed_key(&self, instance: &SharedEntity) -> Result<EntityKey> {
        match self.context.entry_of(instance) {
            Some(entry) if entry.removed => Err(entity_error(
                SessionErrorKind::ObjectDeleted,
                &entry.key,
                "entity is scheduled for removal",
            )),
            Some(entry) => Ok(entry.key.clone()),
            None => Err(entity_error(
                SessionErrorKind::Detached,
                &instance.key(),
                "instance is not managed by this session",
            )),
        }
    }

    /// Get an entity by primary key.
    ///
    /// Checks the identity map first; otherwise loads the row.
    pub async fn get<M: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef<M>>, Error> {
        self.find::<M>(cx, vec![id.into()]).await
    }

    /// Get an entity by (possibly composite) primary key.
    ///
    /// Returns `None` for a key scheduled for removal.
    #[tracing::instrument(level = "debug", skip(self, cx, id), fields(entity = M::ENTITY_NAME))]
    pub async fn find<M: Entity>(
        &mut self,
        cx: &Cx,
        id: Vec<Value>,
    ) -> Outcome<Option<EntityRef<M>>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let key = EntityKey::new(M::ENTITY_NAME, id);
        if let Some(entry) = self.context.entry(&key) {
            if entry.removed {
                return Outcome::Ok(None);
            }
            return match downcast::<M>(&entry.instance) {
                Some(handle) => Outcome::Ok(Some(handle)),
                None => Outcome::Err(type_mismatch::<M>(&key)),
            };
        }

        let row = match self
            .load_row(cx, M::TABLE_NAME, M::fields(), M::PRIMARY_KEY, key.id())
            .await
        {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match row {
            None => Outcome::Ok(None),
            Some(row) => match self.register_loaded::<M>(&row) {
                Ok(handle) => Outcome::Ok(Some(handle)),
                Err(e) => Outcome::Err(e),
            },
        }
    }

    /// Identity-map lookup only; never touches the database.
    pub fn get_reference<M: Entity>(&self, id: impl Into<Value>) -> Option<EntityRef<M>> {
        let key = EntityKey::for_id::<M>(id);
        self.context
            .entry(&key)
            .filter(|e| !e.removed)
            .and_then(|e| downcast::<M>(&e.instance))
    }

    /// Look an entity up by its natural identifier.
    ///
    /// Values follow the declaration order of the natural-id columns. A
    /// managed instance indexed under them is returned without a query. An
    /// instance whose natural id changed in memory is re-indexed and the
    /// row is selected instead, auto-flushing first when the table has
    /// pending changes.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, natural_id),
        fields(entity = M::ENTITY_NAME)
    )]
    pub async fn find_by_natural_id<M: Entity>(
        &mut self,
        cx: &Cx,
        natural_id: Vec<Value>,
    ) -> Outcome<Option<EntityRef<M>>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let columns = natural_id_columns(M::fields());
        if columns.is_empty() || columns.len() != natural_id.len() {
            return Outcome::Err(Error::Session(
                SessionError::new(
                    SessionErrorKind::MissingIdentifier,
                    format!(
                        "expected {} natural-id values, got {}",
                        columns.len(),
                        natural_id.len()
                    ),
                )
                .entity(M::ENTITY_NAME),
            ));
        }
        let natural = EntityKey::new(M::ENTITY_NAME, natural_id);

        if let Some(key) = self.context.resolve_natural_id(&natural).cloned() {
            if let Some(entry) = self.context.entry(&key) {
                if natural_key_of(&entry.instance).as_ref() == Some(&natural) {
                    let handle = downcast::<M>(&entry.instance);
                    let removed = entry.removed;
                    self.stats.natural_id_hits += 1;
                    tracing::trace!(
                        natural = %natural,
                        key = %key,
                        "Natural id resolved in session"
                    );
                    return match handle {
                        Some(_) if removed => Outcome::Ok(None),
                        Some(handle) => Outcome::Ok(Some(handle)),
                        None => Outcome::Err(type_mismatch::<M>(&key)),
                    };
                }
            }
            self.context.record_natural_id(&key);
        }

        let dialect = self.connection.dialect();
        let sql = select_by_key_sql(dialect, M::TABLE_NAME, M::fields(), &columns);
        let query = Query::new(sql).params(natural.id().to_vec());
        let spaces = BTreeSet::from([M::TABLE_NAME.to_string()]);
        let rows = match self.query_with_spaces(cx, &query, &spaces).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = rows.first() else {
            return Outcome::Ok(None);
        };
        match self.register_loaded::<M>(row) {
            Ok(handle) => {
                let removed = self
                    .context
                    .entry_of(&share(&handle))
                    .is_some_and(|e| e.removed);
                Outcome::Ok((!removed).then_some(handle))
            }
            Err(e) => Outcome::Err(e),
        }
    }

    async fn load_row(
        &self,
        cx: &Cx,
        table: &'static str,
        fields: &'static [FieldInfo],
        key_columns: &'static [&'static str],
        id: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        let sql = select_by_key_sql(self.connection.dialect(), table, fields, key_columns);
        tracing::trace!(sql = %sql, "Load SQL");
        match self.connection.query(cx, &sql, id).await {
            Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Route a loaded row through the identity map. An instance already
    /// managed under the row's key wins over the row's contents.
    fn register_loaded<M: Entity>(&mut self, row: &Row) -> Result<EntityRef<M>> {
        let entity = M::from_row(row)?;
        let key = EntityKey::of(&entity);
        if let Some(entry) = self.context.entry(&key) {
            return downcast::<M>(&entry.instance).ok_or_else(|| type_mismatch::<M>(&key));
        }
        let loaded_state = entity.to_row();
        let handle = entity_ref(entity);
        self.context.add_entry(
            key.clone(),
            share(&handle),
            Some(loaded_state),
            true,
            self.config.default_read_only,
        );
        self.stats.entities_loaded += 1;
        tracing::trace!(key = %key, "Registered loaded entity");
        Ok(handle)
    }

    /// Copy the state of a detached instance onto the managed one.
    ///
    /// With `load`, an instance not yet in the session is loaded first (and
    /// persisted as a new copy when its row does not exist). Without it, the
    /// copy is attached as existing and fully updated on flush. Cascades
    /// `Merge`, then rewires association handles to managed instances.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = M::ENTITY_NAME))]
    pub async fn merge<M: Entity>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef<M>,
        load: bool,
    ) -> Outcome<EntityRef<M>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let root = share(entity);
        let managed = match self.merge_graph(cx, root, load).await {
            Outcome::Ok(m) => m,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match downcast::<M>(&managed) {
            Some(handle) => Outcome::Ok(handle),
            None => Outcome::Err(type_mismatch::<M>(&managed.key())),
        }
    }

    async fn merge_graph(
        &mut self,
        cx: &Cx,
        root: SharedEntity,
        load: bool,
    ) -> Outcome<SharedEntity, Error> {
        let mut merged: HashMap<usize, SharedEntity> = HashMap::new();
        let mut order: Vec<SharedEntity> = Vec::new();
        let mut worklist = vec![Arc::clone(&root)];

        while let Some(source) = worklist.pop() {
            let source_id = instance_id(&source);
            if merged.contains_key(&source_id) {
                continue;
            }
            let managed = match self.merge_one(cx, &source, load).await {
                Outcome::Ok(m) => m,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            for info in source.associations() {
                if !cascade::cascades(info, CascadeAction::Merge) {
                    continue;
                }
                if let Some(view) = source.association(info.name) {
                    worklist.extend(
                        view.targets
                            .into_iter()
                            .filter(|t| !merged.contains_key(&instance_id(t))),
                    );
                }
            }
            merged.insert(source_id, Arc::clone(&managed));
            order.push(managed);
        }

        for managed in &order {
            if let Err(e) = self.rewire(managed, &merged) {
                return Outcome::Err(e);
            }
        }
        tracing::debug!(count = order.len(), "Merged object graph");

        match merged.get(&instance_id(&root)) {
            Some(managed) => Outcome::Ok(Arc::clone(managed)),
            None => Outcome::Err(Error::Custom("merge lost its root instance".to_string())),
        }
    }

    async fn merge_one(
        &mut self,
        cx: &Cx,
        source: &SharedEntity,
        load: bool,
    ) -> Outcome<SharedEntity, Error> {
        if let Some(entry) = self.context.entry_of(source) {
            if entry.removed {
                return Outcome::Err(entity_error(
                    SessionErrorKind::ObjectDeleted,
                    &entry.key,
                    "merge of an entity scheduled for removal",
                ));
            }
            return Outcome::Ok(Arc::clone(&entry.instance));
        }

        let key = source.key();
        if let Err(e) = key.require_id() {
            return Outcome::Err(e);
        }

        if let Some(entry) = self.context.entry(&key) {
            if entry.removed {
                return Outcome::Err(entity_error(
                    SessionErrorKind::ObjectDeleted,
                    &key,
                    "merge of an entity scheduled for removal",
                ));
            }
            let managed = Arc::clone(&entry.instance);
            if let Err(e) = check_merge_version(source, &key, entry.version.as_ref()) {
                return Outcome::Err(e);
            }
            managed.copy_state_from(&**source);
            return match self.ensure_collection_baselines(cx, &key, &managed).await {
                Outcome::Ok(()) => Outcome::Ok(managed),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            };
        }

        if self.context.was_deleted(&key) {
            return Outcome::Err(entity_error(
                SessionErrorKind::ObjectDeleted,
                &key,
                "entity was deleted in this session",
            ));
        }

        if !load {
            let managed = source.duplicate();
            self.context.add_entry(
                key.clone(),
                Arc::clone(&managed),
                None,
                true,
                self.config.default_read_only,
            );
            // Initialized collections are taken as the database contents.
            for info in managed.associations() {
                if !info.kind.is_collection() {
                    continue;
                }
                if let Some(keys) = association_keys(&managed, info) {
                    self.context.set_collection_snapshot(key.clone(), info, keys);
                }
            }
            tracing::debug!(key = %key, "Attached merged copy without loading");
            return Outcome::Ok(managed);
        }

        let row = match self
            .load_row(
                cx,
                source.table_name(),
                source.fields(),
                source.primary_key_columns(),
                key.id(),
            )
            .await
        {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let managed = source.duplicate();
        let Some(row) = row else {
            tracing::debug!(key = %key, "Merged entity has no row; persisting a copy");
            self.schedule_insert(key, Arc::clone(&managed));
            return Outcome::Ok(managed);
        };

        if let Err(e) = managed.apply_row(&row) {
            return Outcome::Err(e);
        }
        let loaded = managed.row();
        let entry = self.context.add_entry(
            key.clone(),
            Arc::clone(&managed),
            Some(loaded),
            true,
            self.config.default_read_only,
        );
        let version = entry.version.clone();
        self.stats.entities_loaded += 1;
        if let Err(e) = check_merge_version(source, &key, version.as_ref()) {
            return Outcome::Err(e);
        }
        managed.copy_state_from(&**source);
        match self.ensure_collection_baselines(cx, &key, &managed).await {
            Outcome::Ok(()) => Outcome::Ok(managed),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Point associations of a merged instance at managed instances.
    fn rewire(&self, managed: &SharedEntity, merged: &HashMap<usize, SharedEntity>) -> Result<()> {
        for info in managed.associations() {
            let Some(view) = managed.association(info.name) else {
                continue;
            };
            if view.targets.is_empty() {
                continue;
            }
            let mut changed = false;
            let targets: Vec<SharedEntity> = view
                .targets
                .into_iter()
                .map(|target| {
                    let replacement = merged.get(&instance_id(&target)).cloned().or_else(|| {
                        if self.context.key_of(&target).is_some() {
                            return None;
                        }
                        self.context
                            .entry(&target.key())
                            .map(|e| Arc::clone(&e.instance))
                    });
                    match replacement {
                        Some(r) if !same_instance(&r, &target) => {
                            changed = true;
                            r
                        }
                        _ => target,
                    }
                })
                .collect();
            if changed {
                managed.set_association_targets(info.name, targets)?;
            }
        }
        Ok(())
    }

    /// Load the database contents of initialized collections that have no
    /// snapshot yet, so flush can diff them.
    async fn ensure_collection_baselines(
        &mut self,
        cx: &Cx,
        key: &EntityKey,
        instance: &SharedEntity,
    ) -> Outcome<(), Error> {
        for info in instance.associations().iter().filter(|a| a.kind.is_collection()) {
            if self
                .context
                .collection(&CollectionKey::new(key.clone(), info.name))
                .is_some()
            {
                continue;
            }
            if !instance
                .association(info.name)
                .is_some_and(|v| v.initialized)
            {
                continue;
            }
            let keys = match self.load_collection_keys(cx, info, key).await {
                Outcome::Ok(keys) => keys,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            self.context.set_collection_snapshot(key.clone(), info, keys);
        }
        Outcome::Ok(())
    }

    /// Element keys of a collection as stored in the database.
    async fn load_collection_keys(
        &self,
        cx: &Cx,
        info: &'static AssociationInfo,
        owner: &EntityKey,
    ) -> Outcome<Vec<EntityKey>, Error> {
        let dialect = self.connection.dialect();
        let q = |name: &str| dialect.quote_identifier(name);
        let sql = match (info.kind, info.link_table, info.remote_key) {
            (AssociationKind::ManyToMany, Some(link), _) => format!(
                "SELECT {} FROM {} WHERE {} = {}",
                q(link.remote_column),
                q(link.table_name),
                q(link.local_column),
                dialect.placeholder(1)
            ),
            (AssociationKind::OneToMany, _, Some(fk)) => format!(
                "SELECT {} FROM {} WHERE {} = {}",
                q(info.target_key),
                q(info.target_table),
                q(fk),
                dialect.placeholder(1)
            ),
            _ => return Outcome::Err(unknown_association(owner.entity(), info.name)),
        };
        tracing::trace!(sql = %sql, role = info.name, "Collection key SQL");
        match self.connection.query(cx, &sql, &[owner_value(owner)]).await {
            Outcome::Ok(rows) => Outcome::Ok(
                rows.iter()
                    .filter_map(|row| row.get(0).cloned())
                    .filter(|v| !v.is_null())
                    .map(|v| EntityKey::new(info.target_entity, vec![v]))
                    .collect(),
            ),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Reload a managed instance from its row, discarding in-memory changes.
    ///
    /// Cascades `Refresh` first. Collections come back uninitialized.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = M::ENTITY_NAME))]
    pub async fn refresh<M: Entity>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef<M>,
    ) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let root = share(entity);
        let key = match self.managed_key(&root) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };

        let mut keys: Vec<EntityKey> = Vec::new();
        for target in cascade::reachable(std::slice::from_ref(&root), CascadeAction::Refresh) {
            match self.context.entry_of(&target) {
                Some(entry) if !entry.removed && entry.exists_in_database => {
                    keys.push(entry.key.clone());
                }
                _ => {}
            }
        }
        keys.push(key);

        for key in keys {
            match self.refresh_one(cx, &key).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn refresh_one(&mut self, cx: &Cx, key: &EntityKey) -> Outcome<(), Error> {
        let Some(instance) = self.context.entry(key).map(|e| Arc::clone(&e.instance)) else {
            return Outcome::Ok(());
        };
        let row = match self
            .load_row(
                cx,
                instance.table_name(),
                instance.fields(),
                instance.primary_key_columns(),
                key.id(),
            )
            .await
        {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = row else {
            return Outcome::Err(entity_error(
                SessionErrorKind::ObjectNotFound,
                key,
                "row no longer exists",
            ));
        };
        if let Err(e) = instance.apply_row(&row) {
            return Outcome::Err(e);
        }
        let loaded = instance.row();
        let version = instance
            .version_column()
            .and_then(|col| loaded.iter().find(|(c, _)| *c == col))
            .map(|(_, v)| v.clone());
        if let Some(entry) = self.context.entry_mut(key) {
            entry.loaded_state = Some(loaded);
            entry.version = version;
            entry.exists_in_database = true;
        }
        self.context.drop_collections_of(key);
        self.context.snapshot_associations(key);
        self.context.record_natural_id(key);
        tracing::debug!(key = %key, "Refreshed entity");
        Outcome::Ok(())
    }

    /// Stop tracking an instance (cascades `Detach`). Its pending actions are dropped.
    pub fn evict<M: Entity>(&mut self, entity: &EntityRef<M>) -> Result<()> {
        self.ensure_open()?;
        let root = share(entity);
        let Some(key) = self.context.key_of(&root).cloned() else {
            return Ok(());
        };
        let mut keys = vec![key];
        for target in cascade::reachable(std::slice::from_ref(&root), CascadeAction::Detach) {
            if let Some(k) = self.context.key_of(&target) {
                keys.push(k.clone());
            }
        }
        for key in keys {
            self.actions.unschedule_insert(&key);
            self.actions.unschedule_deletion(&key);
            self.flush_removed.retain(|k| k != &key);
            self.context.detach(&key);
            tracing::debug!(key = %key, "Evicted entity");
        }
        Ok(())
    }

    /// Detach every instance and drop all pending actions.
    pub fn clear(&mut self) {
        self.actions.clear();
        self.flush_removed.clear();
        self.context.clear();
        tracing::debug!("Session cleared");
    }

    /// Mark an instance read-only (never dirty-checked) or modifiable again.
    ///
    /// Turning read-only off takes the current state as the new snapshot.
    pub fn set_read_only<M: Entity>(
        &mut self,
        entity: &EntityRef<M>,
        read_only: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let key = self.managed_key(&share(entity))?;
        if let Some(entry) = self.context.entry_mut(&key) {
            if entry.read_only && !read_only && entry.exists_in_database {
                entry.loaded_state = Some(entry.instance.row());
            }
            entry.read_only = read_only;
        }
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Is this exact instance managed and not scheduled for removal?
    pub fn contains<M: Entity>(&self, entity: &EntityRef<M>) -> bool {
        self.context
            .entry_of(&share(entity))
            .is_some_and(|e| !e.removed)
    }

    /// Lifecycle state of an instance relative to this session.
    pub fn status<M: Entity>(&self, entity: &EntityRef<M>) -> EntityStatus {
        let shared = share(entity);
        if let Some(entry) = self.context.entry_of(&shared) {
            return entry.status();
        }
        let key = shared.key();
        if self.context.contains_key(&key) || self.context.is_detached(&key) {
            EntityStatus::Detached
        } else {
            EntityStatus::Transient
        }
    }

    /// Would a flush now write anything?
    pub fn is_dirty(&self) -> bool {
        if self.actions.are_insertions_or_deletions_queued() {
            return true;
        }
        self.context.entries().filter(|e| !e.removed).any(|entry| {
            let columns_changed = !entry.read_only
                && entry.exists_in_database
                && !dirty_columns_of(entry, &entry.instance.row()).is_empty();
            columns_changed
                || entry.instance.associations().iter().any(|info| {
                    let Some(current) = association_keys(&entry.instance, info) else {
                        return false;
                    };
                    self.context
                        .collection(&CollectionKey::new(entry.key.clone(), info.name))
                        .is_some_and(|c| !same_members(&c.snapshot, &current))
                })
        })
    }

    /// Columns of a managed instance that differ from its loaded state.
    pub fn dirty_columns<M: Entity>(&self, entity: &EntityRef<M>) -> Vec<&'static str> {
        match self.context.entry_of(&share(entity)) {
            Some(entry) if !entry.removed && !entry.read_only && entry.exists_in_database => {
                dirty_columns_of(entry, &entry.instance.row())
            }
            _ => Vec::new(),
        }
    }

    /// State of `element` relative to `owner`'s association `role`.
    pub fn association_state<M: Entity, T: Entity>(
        &self,
        owner: &EntityRef<M>,
        role: &str,
        element: &EntityRef<T>,
    ) -> Result<ElementState> {
        let owner = share(owner);
        let element = share(element);
        let Some(info) = owner.association_info(role) else {
            return Err(unknown_association(M::ENTITY_NAME, role));
        };
        let Some(view) = owner.association(role) else {
            return Err(unknown_association(M::ENTITY_NAME, role));
        };
        let element_key = element.key();

        if holds_instance(&view.targets, &element) {
            return Ok(ElementState::Associated);
        }
        let fk_matches = view.targets.is_empty()
            && view.foreign_id.as_ref().is_some_and(|fk| {
                element_key
                    .id()
                    .first()
                    .is_some_and(|id| id.same_identity(fk))
            });
        if !info.kind.is_collection() && fk_matches {
            return Ok(ElementState::Associated);
        }
        if self.context.was_deleted(&element_key) {
            return Ok(ElementState::Removed);
        }
        let in_snapshot = self
            .context
            .key_of(&owner)
            .and_then(|k| self.context.collection(&CollectionKey::new(k.clone(), info.name)))
            .is_some_and(|c| c.snapshot.contains(&element_key));
        if in_snapshot && info.cascade.orphan_removal && !self.held_keys().contains(&element_key) {
            return Ok(ElementState::DisassociatedPendingRemoval);
        }
        Ok(ElementState::NotYetAssociated)
    }

    /// Keys currently referenced by any association of a live instance.
    fn held_keys(&self) -> HashSet<EntityKey> {
        let mut held = HashSet::new();
        for (_, instance) in self.context.live_instances() {
            for info in instance.associations() {
                if let Some(keys) = association_keys(&instance, info) {
                    held.extend(keys);
                }
            }
        }
        held
    }

    /// Counts of queued actions.
    pub fn pending_counts(&self) -> PendingCounts {
        self.actions.counts()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            entities: self.context.len(),
            collections: self.context.collection_count(),
            pending: self.actions.counts(),
            ..self.stats
        }
    }

    // ========================================================================
    // Lazy Loading
    // ========================================================================

    /// Load an uninitialized collection of a managed owner.
    ///
    /// Elements already managed are reused; the rest are loaded and
    /// registered. An initialized collection is returned without SQL.
    #[tracing::instrument(level = "debug", skip(self, cx, owner), fields(entity = M::ENTITY_NAME))]
    pub async fn initialize_collection<M: Entity, T: Entity>(
        &mut self,
        cx: &Cx,
        owner: &EntityRef<M>,
        role: &str,
    ) -> Outcome<Vec<EntityRef<T>>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let shared = share(owner);
        let key = match self.managed_key(&shared) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };
        let Some(info) = M::association_info(role)
            .filter(|i| i.kind.is_collection() && i.target_entity == T::ENTITY_NAME)
        else {
            return Outcome::Err(unknown_association(M::ENTITY_NAME, role));
        };
        let Some(view) = shared.association(role) else {
            return Outcome::Err(unknown_association(M::ENTITY_NAME, role));
        };
        if view.initialized {
            return Outcome::Ok(view.targets.iter().filter_map(downcast::<T>).collect());
        }

        let keys = match self.load_collection_keys(cx, info, &key).await {
            Outcome::Ok(keys) => keys,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut handles: HashMap<EntityKey, EntityRef<T>> = HashMap::new();
        let mut missing: Vec<Value> = Vec::new();
        for element in &keys {
            match self.context.entry(element) {
                Some(entry) => match downcast::<T>(&entry.instance) {
                    Some(handle) => {
                        handles.insert(element.clone(), handle);
                    }
                    None => return Outcome::Err(type_mismatch::<T>(element)),
                },
                None => missing.push(owner_value(element)),
            }
        }

        for chunk in missing.chunks(self.config.effective_batch_size()) {
            let sql = select_in_sql(
                self.connection.dialect(),
                T::TABLE_NAME,
                T::fields(),
                info.target_key,
                chunk.len(),
            );
            tracing::trace!(sql = %sql, "Collection load SQL");
            let rows = match self.connection.query(cx, &sql, chunk).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            for row in &rows {
                match self.register_loaded::<T>(row) {
                    Ok(handle) => {
                        let element = EntityKey::of(&*read_lock(&handle));
                        handles.insert(element, handle);
                    }
                    Err(e) => return Outcome::Err(e),
                }
            }
        }

        let elements: Vec<EntityRef<T>> = keys
            .iter()
            .filter_map(|k| handles.get(k).cloned())
            .collect();
        let targets = elements.iter().map(share).collect();
        if let Err(e) = shared.set_association_targets(info.name, targets) {
            return Outcome::Err(e);
        }
        let snapshot = elements
            .iter()
            .map(|h| EntityKey::of(&*read_lock(h)))
            .collect();
        self.context.set_collection_snapshot(key, info, snapshot);
        tracing::debug!(role = info.name, count = elements.len(), "Initialized collection");
        Outcome::Ok(elements)
    }

    /// Resolve an id-only to-one association of a managed owner.
    pub async fn resolve<M: Entity, T: Entity>(
        &mut self,
        cx: &Cx,
        owner: &EntityRef<M>,
        role: &str,
    ) -> Outcome<Option<EntityRef<T>>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let shared = share(owner);
        if let Err(e) = self.managed_key(&shared) {
            return Outcome::Err(e);
        }
        let Some(info) = M::association_info(role)
            .filter(|i| !i.kind.is_collection() && i.target_entity == T::ENTITY_NAME)
        else {
            return Outcome::Err(unknown_association(M::ENTITY_NAME, role));
        };
        let Some(view) = shared.association(role) else {
            return Outcome::Err(unknown_association(M::ENTITY_NAME, role));
        };
        if let Some(target) = view.targets.first() {
            return Outcome::Ok(downcast::<T>(target));
        }
        let Some(fk) = view.foreign_id.filter(|v| !v.is_null()) else {
            return Outcome::Ok(None);
        };

        let target_key = EntityKey::new(T::ENTITY_NAME, vec![fk]);
        let handle = match self.context.entry(&target_key) {
            Some(entry) if entry.removed => {
                return Outcome::Err(entity_error(
                    SessionErrorKind::ObjectDeleted,
                    &target_key,
                    "referenced entity is scheduled for removal",
                ));
            }
            Some(entry) => match downcast::<T>(&entry.instance) {
                Some(handle) => handle,
                None => return Outcome::Err(type_mismatch::<T>(&target_key)),
            },
            None => match self.find::<T>(cx, target_key.id().to_vec()).await {
                Outcome::Ok(Some(handle)) => handle,
                Outcome::Ok(None) => {
                    return Outcome::Err(entity_error(
                        SessionErrorKind::ObjectNotFound,
                        &target_key,
                        "referenced row does not exist",
                    ));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
        };
        if let Err(e) = shared.set_association_targets(info.name, vec![share(&handle)]) {
            return Outcome::Err(e);
        }
        Outcome::Ok(Some(handle))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query returning entities, routing each row through the identity map.
    ///
    /// Auto-flushes first when the query's tables (plus `M`'s table) have
    /// pending changes.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(entity = M::ENTITY_NAME))]
    pub async fn query<M: Entity>(
        &mut self,
        cx: &Cx,
        query: Query,
    ) -> Outcome<Vec<EntityRef<M>>, Error> {
        let mut spaces = query.query_spaces();
        spaces.insert(M::TABLE_NAME.to_string());
        let rows = match self.query_with_spaces(cx, &query, &spaces).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.register_loaded::<M>(row) {
                Ok(handle) => result.push(handle),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(result)
    }

    /// Run a query returning raw rows, auto-flushing first when needed.
    pub async fn query_rows(&mut self, cx: &Cx, query: Query) -> Outcome<Vec<Row>, Error> {
        let spaces = query.query_spaces();
        self.query_with_spaces(cx, &query, &spaces).await
    }

    async fn query_with_spaces(
        &mut self,
        cx: &Cx,
        query: &Query,
        spaces: &BTreeSet<String>,
    ) -> Outcome<Vec<Row>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        match self.auto_flush_if_required(cx, spaces).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.stats.queries += 1;
        tracing::trace!(sql = %query.sql(), "Query SQL");
        self.connection
            .query(cx, query.sql(), query.parameters())
            .await
    }

    /// Execute a bulk statement, auto-flushing first when needed.
    ///
    /// Managed instances are not updated to reflect the statement.
    pub async fn execute_update(&mut self, cx: &Cx, query: Query) -> Outcome<u64, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let spaces = query.query_spaces();
        match self.auto_flush_if_required(cx, &spaces).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.config.auto_begin && !self.in_transaction {
            match self.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        tracing::debug!(sql = %query.sql(), "Executing bulk statement");
        match self
            .connection
            .execute(cx, query.sql(), query.parameters())
            .await
        {
            Outcome::Ok(n) => {
                self.stats.statements += 1;
                Outcome::Ok(n)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Flush before a query if the flush mode and the query's spaces require it.
    ///
    /// In `Auto` mode the flush is prepared in memory; if nothing queued
    /// touches `spaces` the computed actions are discarded and no SQL is
    /// issued. Returns whether a flush ran.
    #[tracing::instrument(level = "debug", skip(self, cx, spaces))]
    async fn auto_flush_if_required(
        &mut self,
        cx: &Cx,
        spaces: &BTreeSet<String>,
    ) -> Outcome<bool, Error> {
        match self.config.flush_mode {
            FlushMode::Commit | FlushMode::Manual => return Outcome::Ok(false),
            FlushMode::Always => {
                return match self.flush(cx).await {
                    Outcome::Ok(stats) => Outcome::Ok(!stats.is_empty()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                };
            }
            FlushMode::Auto => {}
        }

        match self.prepare_flush(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.revert_flush_computed();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.revert_flush_computed();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.revert_flush_computed();
                return Outcome::Panicked(p);
            }
        }

        if !self.actions.are_tables_to_be_updated(spaces) {
            self.revert_flush_computed();
            tracing::debug!(spaces = ?spaces, "Auto-flush not required");
            return Outcome::Ok(false);
        }

        tracing::debug!(
            spaces = ?spaces,
            pending = self.actions.counts().total(),
            "Auto-flushing before query"
        );
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            self.revert_flush_computed();
            return Outcome::Err(e);
        }
        match self.execute_flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        self.stats.auto_flushes += 1;
        Outcome::Ok(true)
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Flush pending changes to the database.
    ///
    /// This executes INSERT, UPDATE, and DELETE statements but does NOT commit.
    /// A failure while executing leaves the session unusable.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushStats, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }

        // Fire before_flush event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        match self.prepare_flush(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.revert_flush_computed();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.revert_flush_computed();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.revert_flush_computed();
                return Outcome::Panicked(p);
            }
        }

        let stats = match self.execute_flush(cx).await {
            Outcome::Ok(stats) => stats,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        // Fire after_flush event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }

        Outcome::Ok(stats)
    }

    /// Compute everything a flush writes, in memory.
    ///
    /// 1. resolve remove-cascades through uninitialized collections
    /// 2. cascade persist from every live instance
    /// 3. dirty-check columns into updates
    /// 4. diff associations into collection actions and orphan candidates
    /// 5. remove orphans that were not re-associated
    /// 6. queue collection removals of removed owners
    /// 7. reject references to transient instances
    async fn prepare_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.resolve_lazy_removals(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.cascade_on_flush() {
            return Outcome::Err(e);
        }
        if let Err(e) = self.schedule_updates() {
            return Outcome::Err(e);
        }
        let orphans = self.schedule_collection_actions();
        self.remove_orphans(orphans);
        self.schedule_collection_removals();
        if let Err(e) = self.check_transient_references() {
            return Outcome::Err(e);
        }
        tracing::debug!(pending = ?self.actions.counts(), "Flush prepared");
        Outcome::Ok(())
    }

    /// Removed owners whose remove-cascading collections were never loaded:
    /// load the element keys and remove those elements too.
    async fn resolve_lazy_removals(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut resolved: HashSet<CollectionKey> = HashSet::new();
        loop {
            let pending: Vec<(EntityKey, u64, &'static AssociationInfo)> = self
                .context
                .entries()
                .filter(|e| e.removed && e.exists_in_database)
                .flat_map(|e| {
                    e.instance
                        .associations()
                        .iter()
                        .filter(|info| {
                            info.kind.is_collection()
                                && cascade::cascades(info, CascadeAction::Remove)
                                && e.instance
                                    .association(info.name)
                                    .is_some_and(|v| !v.initialized)
                        })
                        .map(|info| (e.key.clone(), e.seq, info))
                        .collect::<Vec<_>>()
                })
                .filter(|(key, _, info)| {
                    !resolved.contains(&CollectionKey::new(key.clone(), info.name))
                })
                .collect();
            if pending.is_empty() {
                return Outcome::Ok(());
            }

            for (owner, seq, info) in pending {
                resolved.insert(CollectionKey::new(owner.clone(), info.name));
                let keys = match self.load_collection_keys(cx, info, &owner).await {
                    Outcome::Ok(keys) => keys,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                tracing::debug!(
                    owner = %owner,
                    role = info.name,
                    count = keys.len(),
                    "Cascading remove through unloaded collection"
                );
                for key in keys {
                    match self.context.entry(&key).map(|e| Arc::clone(&e.instance)) {
                        Some(instance) => {
                            self.remove_cascade(&key, &instance, Removal::Cascaded { early: false })
                        }
                        None if self.context.was_deleted(&key) => {}
                        None => self.actions.add_delete(key_only_delete(
                            key,
                            info,
                            vec![owner.clone()],
                            false,
                            seq,
                        )),
                    }
                }
            }
        }
    }

    /// Persist transient instances reachable through persist-cascading associations.
    fn cascade_on_flush(&mut self) -> Result<()> {
        let roots: Vec<SharedEntity> = self
            .context
            .live_instances()
            .into_iter()
            .map(|(_, instance)| instance)
            .collect();
        for target in cascade::reachable(&roots, CascadeAction::PersistOnFlush) {
            match self.context.entry_of(&target).map(|e| e.removed) {
                Some(false) => {}
                Some(true) => {
                    return Err(entity_error(
                        SessionErrorKind::ObjectDeleted,
                        &target.key(),
                        "removed entity would be re-saved by cascade; remove it from associations",
                    ));
                }
                None => self.persist_one(&target)?,
            }
        }
        Ok(())
    }

    fn schedule_updates(&mut self) -> Result<()> {
        let mut updates = Vec::new();
        for entry in self.context.entries() {
            if entry.removed || entry.read_only || !entry.exists_in_database {
                continue;
            }
            let row = entry.instance.row();
            let columns = dirty_columns_of(entry, &row);
            if columns.is_empty() {
                continue;
            }
            let version = match (
                entry.instance.version_column(),
                entry.version.as_ref().filter(|v| !v.is_null()),
            ) {
                (Some(column), Some(current)) => Some(VersionCheck {
                    column,
                    current: current.clone(),
                    next: current.next_version()?,
                }),
                _ => None,
            };
            let values = columns
                .iter()
                .filter_map(|col| row.iter().find(|(c, _)| c == col).map(|(_, v)| v.clone()))
                .collect();
            tracing::trace!(key = %entry.key, columns = ?columns, "Entity is dirty");
            updates.push(UpdateAction {
                key: entry.key.clone(),
                entity: entry.instance.entity_name(),
                table: entry.instance.table_name(),
                pk_columns: entry.instance.primary_key_columns(),
                columns,
                values,
                version,
                seq: entry.seq,
            });
        }
        for update in updates {
            self.actions.add_update(update);
        }
        Ok(())
    }

    /// Diff association contents against their snapshots.
    ///
    /// Returns elements dropped from orphan-removal associations.
    fn schedule_collection_actions(&mut self) -> Vec<(EntityKey, &'static AssociationInfo)> {
        let mut orphans = Vec::new();
        let mut actions = Vec::new();
        for (owner, instance) in self.context.live_instances() {
            let exists = self
                .context
                .entry(&owner)
                .is_some_and(|e| e.exists_in_database);
            for info in instance.associations() {
                let Some(current) = association_keys(&instance, info) else {
                    continue;
                };
                let Some(snapshot) = self
                    .context
                    .collection(&CollectionKey::new(owner.clone(), info.name))
                else {
                    let tracked = info.maintains_rows() || info.cascade.orphan_removal;
                    if info.kind.is_collection() && tracked {
                        tracing::warn!(
                            owner = %owner,
                            role = info.name,
                            "Skipping association without a loaded baseline"
                        );
                    }
                    continue;
                };
                let removed: Vec<EntityKey> = snapshot
                    .snapshot
                    .iter()
                    .filter(|k| !current.contains(k))
                    .cloned()
                    .collect();
                let added: Vec<EntityKey> = current
                    .iter()
                    .filter(|k| !snapshot.snapshot.contains(k))
                    .cloned()
                    .collect();

                if info.cascade.orphan_removal {
                    orphans.extend(removed.iter().map(|k| (k.clone(), info)));
                }
                if !info.maintains_rows() || (removed.is_empty() && added.is_empty()) {
                    continue;
                }

                let owner_id = owner_value(&owner);
                let mut ops: Vec<CollectionOp> = Vec::new();
                if exists {
                    ops.extend(removed.iter().filter_map(|k| unlink_op(info, &owner_id, k)));
                }
                ops.extend(added.iter().filter_map(|k| link_op(info, &owner_id, k)));
                actions.push(CollectionAction {
                    kind: if exists {
                        CollectionActionKind::Update
                    } else {
                        CollectionActionKind::Recreate
                    },
                    owner: owner.clone(),
                    role: info.name,
                    ops,
                });
            }
        }
        for action in actions {
            self.actions.add_collection_action(action);
        }
        orphans
    }

    fn remove_orphans(&mut self, candidates: Vec<(EntityKey, &'static AssociationInfo)>) {
        if candidates.is_empty() {
            return;
        }
        let held = self.held_keys();
        for (key, info) in candidates {
            if held.contains(&key) {
                tracing::debug!(key = %key, "Orphan re-associated; keeping it");
                continue;
            }
            match self
                .context
                .entry(&key)
                .map(|e| (Arc::clone(&e.instance), e.removed, e.seq))
            {
                Some((_, true, _)) => {}
                Some((instance, false, _)) => {
                    tracing::debug!(key = %key, role = info.name, "Removing orphan");
                    let removal = if info.kind.is_collection() {
                        Removal::CollectionOrphan
                    } else {
                        Removal::ReplacedOrphan
                    };
                    self.remove_cascade(&key, &instance, removal);
                }
                None if self.context.was_deleted(&key) => {}
                None => {
                    tracing::debug!(key = %key, role = info.name, "Removing unloaded orphan");
                    self.actions
                        .add_delete(key_only_delete(key, info, Vec::new(), true, 0));
                }
            }
        }
    }

    fn schedule_collection_removals(&mut self) {
        let mut actions = Vec::new();
        for entry in self
            .context
            .entries()
            .filter(|e| e.removed && e.exists_in_database)
        {
            let owner_id = owner_value(&entry.key);
            for info in entry.instance.associations().iter().filter(|a| a.maintains_rows()) {
                if let Some(op) = removal_op(info, &owner_id) {
                    actions.push(CollectionAction {
                        kind: CollectionActionKind::Removal,
                        owner: entry.key.clone(),
                        role: info.name,
                        ops: vec![op],
                    });
                }
            }
        }
        for action in actions {
            self.actions.add_collection_action(action);
        }
    }

    /// Every association that writes a reference must point at a row that
    /// exists or is about to be inserted.
    fn check_transient_references(&self) -> Result<()> {
        for entry in self.context.entries().filter(|e| !e.removed) {
            for info in entry
                .instance
                .associations()
                .iter()
                .filter(|a| a.owns_foreign_key() || a.maintains_rows())
            {
                let Some(view) = entry.instance.association(info.name) else {
                    continue;
                };
                for target in &view.targets {
                    if self.context.key_of(target).is_some() {
                        continue;
                    }
                    let key = target.key();
                    if self.context.contains_key(&key) || self.context.is_detached(&key) {
                        continue;
                    }
                    return Err(entity_error(
                        SessionErrorKind::TransientReference,
                        &entry.key,
                        format!(
                            "association '{}' references unsaved transient instance {key}; \
                             persist it or cascade persist",
                            info.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Undo what `prepare_flush` computed: flush-scheduled removals become
    /// live again and computed actions are dropped.
    fn revert_flush_computed(&mut self) {
        let mut reverted = self.actions.clear_from_flush_needed_check();
        reverted.append(&mut self.flush_removed);
        for key in reverted {
            let Some(entry) = self.context.entry_mut(&key) else {
                continue;
            };
            if !entry.removed {
                continue;
            }
            entry.removed = false;
            entry.orphan = false;
            if !entry.exists_in_database {
                self.actions.add_insert(InsertAction {
                    key: key.clone(),
                    entity: entry.instance.entity_name(),
                    table: entry.instance.table_name(),
                    instance: Arc::clone(&entry.instance),
                    seq: entry.seq,
                });
            }
            self.context.record_natural_id(&key);
        }
    }

    fn build_plan(&self) -> Result<FlushPlan> {
        let mut inserts = Vec::with_capacity(self.actions.insertions.len());
        for action in &self.actions.insertions {
            inserts.push(prepare_insert(action)?);
        }
        let ordered = flush::order_inserts(inserts, self.config.order_inserts)?;
        // Link rows of rows deleted ahead of inserts must go ahead of them too.
        let (orphan_collection_removals, collection_removals): (Vec<_>, Vec<_>) = self
            .actions
            .collection_removals
            .iter()
            .cloned()
            .partition(|a| self.actions.orphan_removals.iter().any(|d| d.key == a.owner));
        Ok(FlushPlan {
            orphan_collection_removals,
            orphan_removals: flush::order_deletes(self.actions.orphan_removals.clone())?,
            inserts: ordered.inserts,
            deferred_foreign_keys: ordered.deferred,
            updates: flush::order_updates(self.actions.updates.clone(), self.config.order_updates),
            collection_removals,
            collection_updates: self.actions.collection_updates.clone(),
            collection_creations: self.actions.collection_creations.clone(),
            deletes: flush::order_deletes(self.actions.deletions.clone())?,
        })
    }

    /// Execute the queued actions and bring the context in line with the database.
    async fn execute_flush(&mut self, cx: &Cx) -> Outcome<FlushStats, Error> {
        if !self.actions.has_any_queued_actions() {
            self.post_flush(&FlushPlan::new());
            return Outcome::Ok(FlushStats::default());
        }

        let plan = match self.build_plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.revert_flush_computed();
                return Outcome::Err(e);
            }
        };

        // Auto-begin transaction if configured
        if self.config.auto_begin && !self.in_transaction {
            match self.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.revert_flush_computed();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.revert_flush_computed();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.revert_flush_computed();
                    return Outcome::Panicked(p);
                }
            }
        }

        let stats = match plan.execute(cx, &self.connection, &self.config).await {
            Outcome::Ok(stats) => stats,
            Outcome::Err(e) => {
                tracing::error!(error = %e, "Flush failed; session is no longer usable");
                self.state = SessionState::Unusable;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.state = SessionState::Unusable;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.state = SessionState::Unusable;
                return Outcome::Panicked(p);
            }
        };

        self.post_flush(&plan);
        self.stats.flushes += 1;
        self.stats.statements += stats.statements;
        Outcome::Ok(stats)
    }

    fn post_flush(&mut self, plan: &FlushPlan) {
        for insert in &plan.inserts {
            if let Some(entry) = self.context.entry_mut(&insert.key) {
                entry.exists_in_database = true;
                if let Some((_, version)) = &insert.version {
                    entry.instance.set_version(version);
                    entry.version = Some(version.clone());
                }
                entry.loaded_state = Some(entry.instance.row());
            }
        }
        for update in &plan.updates {
            if let Some(entry) = self.context.entry_mut(&update.key) {
                if let Some(check) = &update.version {
                    entry.instance.set_version(&check.next);
                    entry.version = Some(check.next.clone());
                }
                entry.loaded_state = Some(entry.instance.row());
            }
            self.context.record_natural_id(&update.key);
        }

        let removed: Vec<EntityKey> = self
            .context
            .entries()
            .filter(|e| e.removed)
            .map(|e| e.key.clone())
            .collect();
        for key in &removed {
            self.context.forget_deleted(key);
        }

        for (key, _) in self.context.live_instances() {
            self.context.snapshot_associations(&key);
        }
        self.actions.clear();
        self.flush_removed.clear();
        tracing::debug!(forgotten = removed.len(), "Post-flush bookkeeping complete");
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction. Entry state is recorded so rollback can restore it.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if self.in_transaction {
            return Outcome::Ok(());
        }

        match self.connection.begin(cx).await {
            Outcome::Ok(()) => {
                self.in_transaction = true;
                self.context.begin_transaction();
                tracing::debug!("Transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the current transaction, flushing first unless the flush mode is `Manual`.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }

        // Flush any pending changes first
        if self.config.flush_mode.flushes_on_commit() {
            match self.flush(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // Fire before_commit event (can abort)
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if self.in_transaction {
            match self.connection.commit(cx).await {
                Outcome::Ok(()) => {
                    self.in_transaction = false;
                    self.context.end_transaction();
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        tracing::debug!("Transaction committed");

        // Fire after_commit event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Rollback the current transaction.
    ///
    /// Pending actions are discarded, entities persisted since the
    /// transaction began are dropped, removed entities are managed again and
    /// every entity gets its pre-transaction state back. A session made
    /// unusable by a failed flush stays unusable.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == SessionState::Closed {
            return Outcome::Err(Error::session(SessionErrorKind::Closed, "session is closed"));
        }
        if self.in_transaction {
            match self.connection.rollback(cx).await {
                Outcome::Ok(()) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.actions.clear();
        self.flush_removed.clear();
        let (restored, dropped) = if self.context.in_transaction() {
            self.context.rollback_transaction()
        } else {
            self.context.discard_changes()
        };
        tracing::info!(restored, dropped, "Session rolled back");

        // Fire after_rollback event
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Close the session, rolling back any open transaction.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == SessionState::Closed {
            return Outcome::Ok(());
        }
        let rollback = if self.in_transaction {
            self.connection.rollback(cx).await
        } else {
            Outcome::Ok(())
        };
        self.in_transaction = false;
        self.actions.clear();
        self.flush_removed.clear();
        self.context.clear();
        self.state = SessionState::Closed;
        tracing::debug!("Session closed");
        rollback
    }
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction)
            .field("context", &self.context)
            .field("pending", &self.actions.counts())
            .field("config", &self.config)
            .finish()
    }
}
