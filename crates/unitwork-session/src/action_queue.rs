//! The action queue: pending writes, grouped by category.
//!
//! Categories execute in a fixed order on flush:
//!
//! 1. orphans replaced in to-one associations
//! 2. entity insertions
//! 3. entity updates
//! 4. collection removals
//! 5. collection updates
//! 6. collection recreations
//! 7. entity deletions
//!
//! Orphans dropped from collections are ordinary deletions: their link rows
//! and cascaded children must go first. Only a to-one orphan, whose
//! replacement may reuse a unique foreign key, is deleted ahead of inserts.
//!
//! Insertions and caller-requested deletions are queued when `persist` and
//! `remove` are called. Updates, collection actions and orphan removals are
//! computed by each flush and can be discarded again by
//! [`ActionQueue::clear_from_flush_needed_check`] when an auto-flush check
//! finds nothing relevant to the query.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use unitwork_core::{Dialect, EntityKey, SharedEntity, Value};

/// A scheduled INSERT. Column values are read from the instance at flush time.
#[derive(Clone)]
pub struct InsertAction {
    pub key: EntityKey,
    pub entity: &'static str,
    pub table: &'static str,
    pub instance: SharedEntity,
    pub seq: u64,
}

impl std::fmt::Debug for InsertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertAction")
            .field("key", &self.key)
            .field("table", &self.table)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Optimistic-lock predicate of an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub column: &'static str,
    pub current: Value,
    pub next: Value,
}

/// A computed UPDATE carrying only the changed columns.
#[derive(Debug, Clone)]
pub struct UpdateAction {
    pub key: EntityKey,
    pub entity: &'static str,
    pub table: &'static str,
    pub pk_columns: &'static [&'static str],
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
    pub version: Option<VersionCheck>,
    pub seq: u64,
}

/// A scheduled DELETE.
#[derive(Debug, Clone)]
pub struct DeleteAction {
    pub key: EntityKey,
    pub entity: &'static str,
    pub table: &'static str,
    pub pk_columns: &'static [&'static str],
    /// Version predicate (column, expected value).
    pub version: Option<(&'static str, Value)>,
    /// Keys of entities this row references through foreign keys.
    pub references: Vec<EntityKey>,
    /// Scheduled by orphan processing.
    pub orphan: bool,
    /// Runs ahead of inserts (a to-one orphan or a row cascaded from one).
    pub early: bool,
    /// Scheduled by the current flush rather than by `remove`.
    pub from_flush: bool,
    pub seq: u64,
}

/// Which collection category an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionActionKind {
    /// The owner is deleted; its rows in the association table go.
    Removal,
    /// Elements were added or removed.
    Update,
    /// The owner is new; all current elements are written.
    Recreate,
}

/// One statement written on behalf of a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOp {
    InsertLink {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
        remote_column: &'static str,
        remote_value: Value,
    },
    DeleteLink {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
        remote_column: &'static str,
        remote_value: Value,
    },
    DeleteAllLinks {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
    },
    /// Point an element's foreign key at the owner (unidirectional one-to-many).
    SetForeignKey {
        table: &'static str,
        fk_column: &'static str,
        owner_value: Value,
        key_column: &'static str,
        element_value: Value,
    },
    /// Null one element's foreign key.
    ClearForeignKey {
        table: &'static str,
        fk_column: &'static str,
        key_column: &'static str,
        element_value: Value,
    },
    /// Null every foreign key pointing at the owner.
    ClearForeignKeys {
        table: &'static str,
        fk_column: &'static str,
        owner_value: Value,
    },
}

impl CollectionOp {
    pub fn table(&self) -> &'static str {
        match self {
            CollectionOp::InsertLink { table, .. }
            | CollectionOp::DeleteLink { table, .. }
            | CollectionOp::DeleteAllLinks { table, .. }
            | CollectionOp::SetForeignKey { table, .. }
            | CollectionOp::ClearForeignKey { table, .. }
            | CollectionOp::ClearForeignKeys { table, .. } => table,
        }
    }

    /// Render the statement and its parameters.
    pub fn to_sql(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let q = |name: &str| dialect.quote_identifier(name);
        let p = |i: usize| dialect.placeholder(i);
        match self {
            CollectionOp::InsertLink {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => (
                format!(
                    "INSERT INTO {} ({}, {}) VALUES ({}, {})",
                    q(table),
                    q(local_column),
                    q(remote_column),
                    p(1),
                    p(2)
                ),
                vec![local_value.clone(), remote_value.clone()],
            ),
            CollectionOp::DeleteLink {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => (
                format!(
                    "DELETE FROM {} WHERE {} = {} AND {} = {}",
                    q(table),
                    q(local_column),
                    p(1),
                    q(remote_column),
                    p(2)
                ),
                vec![local_value.clone(), remote_value.clone()],
            ),
            CollectionOp::DeleteAllLinks {
                table,
                local_column,
                local_value,
            } => (
                format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(table),
                    q(local_column),
                    p(1)
                ),
                vec![local_value.clone()],
            ),
            CollectionOp::SetForeignKey {
                table,
                fk_column,
                owner_value,
                key_column,
                element_value,
            } => (
                format!(
                    "UPDATE {} SET {} = {} WHERE {} = {}",
                    q(table),
                    q(fk_column),
                    p(1),
                    q(key_column),
                    p(2)
                ),
                vec![owner_value.clone(), element_value.clone()],
            ),
            CollectionOp::ClearForeignKey {
                table,
                fk_column,
                key_column,
                element_value,
            } => (
                format!(
                    "UPDATE {} SET {} = NULL WHERE {} = {}",
                    q(table),
                    q(fk_column),
                    q(key_column),
                    p(1)
                ),
                vec![element_value.clone()],
            ),
            CollectionOp::ClearForeignKeys {
                table,
                fk_column,
                owner_value,
            } => (
                format!(
                    "UPDATE {} SET {} = NULL WHERE {} = {}",
                    q(table),
                    q(fk_column),
                    q(fk_column),
                    p(1)
                ),
                vec![owner_value.clone()],
            ),
        }
    }
}

/// Writes for one (owner, role) association.
#[derive(Debug, Clone)]
pub struct CollectionAction {
    pub kind: CollectionActionKind,
    pub owner: EntityKey,
    pub role: &'static str,
    pub ops: Vec<CollectionOp>,
}

impl CollectionAction {
    fn touches(&self, spaces: &BTreeSet<String>) -> bool {
        self.ops.iter().any(|op| spaces.contains(op.table()))
    }
}

/// Number of queued actions per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub orphan_removals: usize,
    pub insertions: usize,
    pub updates: usize,
    pub collection_removals: usize,
    pub collection_updates: usize,
    pub collection_creations: usize,
    pub deletions: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.orphan_removals
            + self.insertions
            + self.updates
            + self.collection_removals
            + self.collection_updates
            + self.collection_creations
            + self.deletions
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Pending actions of one session.
#[derive(Debug, Default)]
pub struct ActionQueue {
    pub(crate) orphan_removals: Vec<DeleteAction>,
    pub(crate) insertions: Vec<InsertAction>,
    pub(crate) updates: Vec<UpdateAction>,
    pub(crate) collection_removals: Vec<CollectionAction>,
    pub(crate) collection_updates: Vec<CollectionAction>,
    pub(crate) collection_creations: Vec<CollectionAction>,
    pub(crate) deletions: Vec<DeleteAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_insert(&mut self, action: InsertAction) {
        if !self.is_insert_scheduled(&action.key) {
            self.insertions.push(action);
        }
    }

    pub fn add_update(&mut self, action: UpdateAction) {
        self.updates.push(action);
    }

    /// Queue a deletion; early ones go to the orphan-removal category.
    pub fn add_delete(&mut self, action: DeleteAction) {
        if self.is_delete_scheduled(&action.key) {
            return;
        }
        if action.early {
            self.orphan_removals.push(action);
        } else {
            self.deletions.push(action);
        }
    }

    pub fn add_collection_action(&mut self, action: CollectionAction) {
        if action.ops.is_empty() {
            return;
        }
        match action.kind {
            CollectionActionKind::Removal => self.collection_removals.push(action),
            CollectionActionKind::Update => self.collection_updates.push(action),
            CollectionActionKind::Recreate => self.collection_creations.push(action),
        }
    }

    pub fn is_insert_scheduled(&self, key: &EntityKey) -> bool {
        self.insertions.iter().any(|a| &a.key == key)
    }

    pub fn is_delete_scheduled(&self, key: &EntityKey) -> bool {
        self.deletions
            .iter()
            .chain(&self.orphan_removals)
            .any(|a| &a.key == key)
    }

    /// Drop a pending insert. Returns whether one was queued.
    pub fn unschedule_insert(&mut self, key: &EntityKey) -> bool {
        let before = self.insertions.len();
        self.insertions.retain(|a| &a.key != key);
        self.insertions.len() != before
    }

    /// Drop a pending deletion (the entity was persisted again).
    pub fn unschedule_deletion(&mut self, key: &EntityKey) -> bool {
        let before = self.deletions.len() + self.orphan_removals.len();
        self.deletions.retain(|a| &a.key != key);
        self.orphan_removals.retain(|a| &a.key != key);
        self.deletions.len() + self.orphan_removals.len() != before
    }

    pub fn has_any_queued_actions(&self) -> bool {
        !self.counts().is_empty()
    }

    pub fn are_insertions_or_deletions_queued(&self) -> bool {
        !self.insertions.is_empty()
            || !self.deletions.is_empty()
            || !self.orphan_removals.is_empty()
    }

    /// Do any queued actions write one of these tables?
    ///
    /// An empty set means the spaces are unknown, which overlaps everything.
    pub fn are_tables_to_be_updated(&self, spaces: &BTreeSet<String>) -> bool {
        if spaces.is_empty() {
            return self.has_any_queued_actions();
        }
        let hit = |table: &str| spaces.contains(table);
        self.orphan_removals.iter().any(|a| hit(a.table))
            || self.insertions.iter().any(|a| hit(a.table))
            || self.updates.iter().any(|a| hit(a.table))
            || self.deletions.iter().any(|a| hit(a.table))
            || self
                .collection_removals
                .iter()
                .chain(&self.collection_updates)
                .chain(&self.collection_creations)
                .any(|a| a.touches(spaces))
    }

    /// Discard what the flush computed: updates, collection actions,
    /// orphan removals and deletions cascaded from them.
    ///
    /// Returns the keys whose flush-scheduled removal was dropped, so the
    /// caller can mark them live again.
    pub fn clear_from_flush_needed_check(&mut self) -> Vec<EntityKey> {
        self.updates.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
        let mut reverted: Vec<EntityKey> =
            self.orphan_removals.drain(..).map(|a| a.key).collect();
        let (flush_deletes, kept): (Vec<DeleteAction>, Vec<DeleteAction>) =
            self.deletions.drain(..).partition(|a| a.from_flush);
        self.deletions = kept;
        reverted.extend(flush_deletes.into_iter().map(|a| a.key));
        reverted
    }

    /// Drop every pending action.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn counts(&self) -> PendingCounts {
        PendingCounts {
            orphan_removals: self.orphan_removals.len(),
            insertions: self.insertions.len(),
            updates: self.updates.len(),
            collection_removals: self.collection_removals.len(),
            collection_updates: self.collection_updates.len(),
            collection_creations: self.collection_creations.len(),
            deletions: self.deletions.len(),
        }
    }
}
