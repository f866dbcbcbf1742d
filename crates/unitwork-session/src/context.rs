//! The persistence context: identity map, entity entries and collection entries.
//!
//! Every managed instance has exactly one [`EntityEntry`], keyed by its
//! [`EntityKey`]. A second index maps instance addresses back to keys so a
//! handle passed in by the caller can be classified without trusting its
//! current identifier.
//!
//! Entities that declare natural-id columns are also indexed by those
//! values. The index only ever points at managed entries; it is refreshed
//! on load, insert and flush and dropped with the entry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use unitwork_core::{
    AssociationInfo, EntityKey, Row, SharedEntity, Value, instance_id, natural_id_columns,
    same_instance,
};

/// Column values captured at load or last flush.
pub type Snapshot = Vec<(&'static str, Value)>;

/// Lifecycle state of an instance as seen by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Not associated with the session and not known to exist.
    Transient,
    /// Tracked and dirty-checked.
    Managed,
    /// Tracked, never dirty-checked.
    ReadOnly,
    /// Scheduled for deletion (or discarded, if never inserted).
    Removed,
    /// Was managed by this session; its row exists but changes are not tracked.
    Detached,
}

/// State of an element relative to one owner's association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementState {
    NotYetAssociated,
    Associated,
    /// Removed from an orphan-removal association; deleted on flush unless re-associated.
    DisassociatedPendingRemoval,
    /// Deleted by a flush.
    Removed,
}

/// Entry state saved when a transaction starts, restored on rollback.
#[derive(Debug, Clone)]
pub struct TxBaseline {
    pub loaded_state: Option<Snapshot>,
    pub version: Option<Value>,
    pub exists_in_database: bool,
}

/// Bookkeeping for one managed instance.
pub struct EntityEntry {
    pub key: EntityKey,
    pub instance: SharedEntity,
    pub removed: bool,
    /// Removed by orphan processing rather than by the caller.
    pub orphan: bool,
    pub read_only: bool,
    /// None when the state in the database is unknown (merged without load).
    pub loaded_state: Option<Snapshot>,
    pub version: Option<Value>,
    pub exists_in_database: bool,
    /// Registration order, used to keep action order stable.
    pub seq: u64,
    pub baseline: Option<TxBaseline>,
}

impl EntityEntry {
    pub fn status(&self) -> EntityStatus {
        if self.removed {
            EntityStatus::Removed
        } else if self.read_only {
            EntityStatus::ReadOnly
        } else {
            EntityStatus::Managed
        }
    }

    /// Not scheduled for removal.
    pub fn is_live(&self) -> bool {
        !self.removed
    }

    /// Value of a column in the loaded snapshot.
    pub fn loaded_value(&self, column: &str) -> Option<&Value> {
        self.loaded_state
            .as_ref()?
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v)
    }

    fn capture_baseline(&mut self) {
        self.baseline = Some(TxBaseline {
            loaded_state: self.loaded_state.clone(),
            version: self.version.clone(),
            exists_in_database: self.exists_in_database,
        });
    }
}

impl std::fmt::Debug for EntityEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityEntry")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("exists_in_database", &self.exists_in_database)
            .field("version", &self.version)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Identity of one association of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub owner: EntityKey,
    pub role: &'static str,
}

impl CollectionKey {
    pub fn new(owner: EntityKey, role: &'static str) -> Self {
        Self { owner, role }
    }
}

/// Element keys of an association as of load or last flush.
///
/// Only associations whose contents are known have an entry; a lazy
/// collection gets one when it is initialized.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub info: &'static AssociationInfo,
    pub snapshot: Vec<EntityKey>,
}

/// Keys an association currently refers to.
///
/// Returns `None` for an uninitialized collection. An unresolved to-one
/// yields the key its foreign key names.
pub fn association_keys(instance: &SharedEntity, info: &AssociationInfo) -> Option<Vec<EntityKey>> {
    let view = instance.association(info.name)?;
    if info.kind.is_collection() {
        if !view.initialized {
            return None;
        }
        return Some(view.targets.iter().map(|t| t.key()).collect());
    }
    if let Some(target) = view.targets.first() {
        return Some(vec![target.key()]);
    }
    Some(
        view.foreign_id
            .filter(|id| !id.is_null())
            .map(|id| vec![EntityKey::new(info.target_entity, vec![id])])
            .unwrap_or_default(),
    )
}

/// Natural identifier of an instance, keyed like an entity.
///
/// `None` when the type declares no natural-id columns or one of them is null.
pub fn natural_key_of(instance: &SharedEntity) -> Option<EntityKey> {
    let columns = natural_id_columns(instance.fields());
    if columns.is_empty() {
        return None;
    }
    let row = instance.row();
    let values = columns
        .iter()
        .map(|col| {
            row.iter()
                .find(|(c, _)| c == col)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_null())
        })
        .collect::<Option<Vec<Value>>>()?;
    Some(EntityKey::new(instance.entity_name(), values))
}

type BuriedEntry = (EntityEntry, Vec<(CollectionKey, CollectionEntry)>);

/// The identity map plus per-entity and per-association bookkeeping.
#[derive(Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityKey, EntityEntry>,
    by_instance: HashMap<usize, EntityKey>,
    collections: HashMap<CollectionKey, CollectionEntry>,
    /// Keys known to exist in the database whose instances were detached.
    detached: HashSet<EntityKey>,
    /// Keys deleted by a flush of this session.
    deleted: HashSet<EntityKey>,
    /// Entries deleted by a flush inside the current transaction.
    buried: Vec<BuriedEntry>,
    /// Natural identifier to primary key, per entity type.
    natural_ids: HashMap<EntityKey, EntityKey>,
    /// Reverse of `natural_ids`.
    natural_id_of: HashMap<EntityKey, EntityKey>,
    in_transaction: bool,
    next_seq: u64,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance.
    ///
    /// The caller has already checked that `key` is free. Association
    /// snapshots are seeded from the instance: to-ones always, collections
    /// only for entities that do not exist yet (their baseline is empty).
    pub fn add_entry(
        &mut self,
        key: EntityKey,
        instance: SharedEntity,
        loaded_state: Option<Snapshot>,
        exists_in_database: bool,
        read_only: bool,
    ) -> &mut EntityEntry {
        let natural = natural_key_of(&instance);
        let row = instance.row();
        let version = instance
            .version_column()
            .and_then(|col| row.iter().find(|(c, _)| *c == col))
            .map(|(_, v)| v.clone());

        for info in instance.associations() {
            let collection_key = CollectionKey::new(key.clone(), info.name);
            if info.kind.is_collection() {
                if !exists_in_database {
                    self.collections.insert(
                        collection_key,
                        CollectionEntry {
                            info,
                            snapshot: Vec::new(),
                        },
                    );
                }
            } else if let Some(keys) = association_keys(&instance, info) {
                self.collections.insert(
                    collection_key,
                    CollectionEntry {
                        info,
                        snapshot: keys,
                    },
                );
            }
        }

        self.detached.remove(&key);
        self.deleted.remove(&key);
        self.by_instance.insert(instance_id(&instance), key.clone());
        self.next_seq += 1;
        let mut entry = EntityEntry {
            key: key.clone(),
            instance,
            removed: false,
            orphan: false,
            read_only,
            loaded_state,
            version,
            exists_in_database,
            seq: self.next_seq,
            baseline: None,
        };
        if self.in_transaction && exists_in_database {
            entry.capture_baseline();
        }
        self.index_natural_id(&key, natural);
        self.entries.entry(key).insert_entry(entry).into_mut()
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub fn entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    /// Key under which this exact instance is managed.
    pub fn key_of(&self, instance: &SharedEntity) -> Option<&EntityKey> {
        let key = self.by_instance.get(&instance_id(instance))?;
        let entry = self.entries.get(key)?;
        same_instance(&entry.instance, instance).then_some(key)
    }

    /// Entry for this exact instance.
    pub fn entry_of(&self, instance: &SharedEntity) -> Option<&EntityEntry> {
        let key = self.key_of(instance)?;
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_detached(&self, key: &EntityKey) -> bool {
        self.detached.contains(key)
    }

    pub fn was_deleted(&self, key: &EntityKey) -> bool {
        self.deleted.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut EntityEntry> {
        self.entries.values_mut()
    }

    /// Keys of all entries, in registration order.
    pub fn keys_in_order(&self) -> Vec<EntityKey> {
        let mut keyed: Vec<(u64, &EntityKey)> =
            self.entries.values().map(|e| (e.seq, &e.key)).collect();
        keyed.sort_by_key(|(seq, _)| *seq);
        keyed.into_iter().map(|(_, k)| k.clone()).collect()
    }

    /// Instances not scheduled for removal, in registration order.
    pub fn live_instances(&self) -> Vec<(EntityKey, SharedEntity)> {
        self.keys_in_order()
            .into_iter()
            .filter_map(|k| {
                let entry = self.entries.get(&k)?;
                entry
                    .is_live()
                    .then(|| (k.clone(), std::sync::Arc::clone(&entry.instance)))
            })
            .collect()
    }

    pub fn collection(&self, key: &CollectionKey) -> Option<&CollectionEntry> {
        self.collections.get(key)
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Record the element keys of an association.
    pub fn set_collection_snapshot(
        &mut self,
        owner: EntityKey,
        info: &'static AssociationInfo,
        snapshot: Vec<EntityKey>,
    ) {
        self.collections.insert(
            CollectionKey::new(owner, info.name),
            CollectionEntry { info, snapshot },
        );
    }

    pub fn drop_collection(&mut self, key: &CollectionKey) {
        self.collections.remove(key);
    }

    /// Drop collection entries of an owner that are not to-ones.
    pub fn drop_collections_of(&mut self, owner: &EntityKey) {
        self.collections
            .retain(|k, c| &k.owner != owner || !c.info.kind.is_collection());
    }

    /// Refresh every association snapshot of an owner from its current state.
    pub fn snapshot_associations(&mut self, owner: &EntityKey) {
        let Some(entry) = self.entries.get(owner) else {
            return;
        };
        let instance = std::sync::Arc::clone(&entry.instance);
        for info in instance.associations() {
            if let Some(keys) = association_keys(&instance, info) {
                self.set_collection_snapshot(owner.clone(), info, keys);
            }
        }
    }

    /// Primary key of the managed entity with this natural identifier.
    pub fn resolve_natural_id(&self, natural: &EntityKey) -> Option<&EntityKey> {
        self.natural_ids.get(natural)
    }

    /// Re-index an entry under its current natural-id values.
    pub fn record_natural_id(&mut self, key: &EntityKey) {
        let Some(entry) = self.entries.get(key) else {
            return;
        };
        let natural = natural_key_of(&entry.instance);
        self.index_natural_id(key, natural);
    }

    /// Drop the natural-id mapping of an entry.
    pub fn forget_natural_id(&mut self, key: &EntityKey) {
        let Some(natural) = self.natural_id_of.remove(key) else {
            return;
        };
        if self.natural_ids.get(&natural) == Some(key) {
            self.natural_ids.remove(&natural);
        }
    }

    pub fn natural_id_count(&self) -> usize {
        self.natural_ids.len()
    }

    fn index_natural_id(&mut self, key: &EntityKey, natural: Option<EntityKey>) {
        self.forget_natural_id(key);
        if let Some(natural) = natural {
            self.natural_ids.insert(natural.clone(), key.clone());
            self.natural_id_of.insert(key.clone(), natural);
        }
    }

    /// Unregister an entry and its association entries.
    pub fn remove_entry(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        let entry = self.entries.remove(key)?;
        self.forget_natural_id(key);
        self.by_instance.remove(&instance_id(&entry.instance));
        self.collections.retain(|k, _| &k.owner != key);
        Some(entry)
    }

    /// Stop tracking an instance; it becomes detached if its row exists.
    pub fn detach(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        let entry = self.remove_entry(key)?;
        if entry.exists_in_database {
            self.detached.insert(key.clone());
        }
        Some(entry)
    }

    /// Drop an entry whose row a flush deleted (or whose insert was discarded).
    pub fn forget_deleted(&mut self, key: &EntityKey) {
        let collections: Vec<(CollectionKey, CollectionEntry)> = self
            .collections
            .iter()
            .filter(|(k, _)| &k.owner == key)
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        let Some(entry) = self.remove_entry(key) else {
            return;
        };
        self.detached.remove(key);
        if entry.exists_in_database {
            self.deleted.insert(key.clone());
        }
        if self.in_transaction && entry.baseline.is_some() {
            self.buried.push((entry, collections));
        }
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        let keys: Vec<EntityKey> = self.entries.keys().cloned().collect();
        for key in keys {
            self.detach(&key);
        }
        self.collections.clear();
        self.buried.clear();
        self.natural_ids.clear();
        self.natural_id_of.clear();
    }

    /// Record the state every entry must return to on rollback.
    pub fn begin_transaction(&mut self) {
        self.in_transaction = true;
        for entry in self.entries.values_mut() {
            if entry.exists_in_database {
                entry.capture_baseline();
            }
        }
    }

    /// The transaction committed; the current state is the new baseline.
    pub fn end_transaction(&mut self) {
        self.in_transaction = false;
        self.buried.clear();
        for entry in self.entries.values_mut() {
            entry.baseline = None;
        }
    }

    /// Return to the state recorded when the transaction started.
    ///
    /// Entries created during the transaction (or never inserted) are
    /// dropped. Entries deleted or removed are restored, and every restored
    /// instance gets its baseline column state back. Collections come back
    /// uninitialized. Returns `(restored, dropped)`.
    pub fn rollback_transaction(&mut self) -> (usize, usize) {
        let mut restored = 0;
        let mut dropped = 0;

        for key in self.keys_in_order() {
            let keep = self
                .entries
                .get(&key)
                .and_then(|e| e.baseline.as_ref())
                .is_some_and(|b| b.exists_in_database);
            if !keep {
                self.remove_entry(&key);
                dropped += 1;
                continue;
            }
            self.restore_entry(&key);
            restored += 1;
        }

        let buried = std::mem::take(&mut self.buried);
        for (entry, collections) in buried {
            if self.entries.contains_key(&entry.key) {
                continue;
            }
            let key = entry.key.clone();
            self.deleted.remove(&key);
            self.by_instance
                .insert(instance_id(&entry.instance), key.clone());
            self.entries.insert(key.clone(), entry);
            for (k, c) in collections {
                if !c.info.kind.is_collection() {
                    self.collections.insert(k, c);
                }
            }
            self.restore_entry(&key);
            restored += 1;
        }

        self.in_transaction = false;
        for entry in self.entries.values_mut() {
            entry.baseline = None;
        }
        (restored, dropped)
    }

    /// Outside a transaction: drop unsaved entries and return every other
    /// entry to its last loaded state.
    pub fn discard_changes(&mut self) -> (usize, usize) {
        self.begin_transaction();
        self.rollback_transaction()
    }

    fn restore_entry(&mut self, key: &EntityKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let Some(baseline) = entry.baseline.clone() else {
            return;
        };
        entry.removed = false;
        entry.orphan = false;
        entry.exists_in_database = baseline.exists_in_database;
        entry.version = baseline.version;
        entry.loaded_state = baseline.loaded_state;
        let instance = std::sync::Arc::clone(&entry.instance);
        if let Some(state) = &entry.loaded_state {
            let row = Row::from_pairs(state);
            if let Err(e) = instance.apply_row(&row) {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Failed to restore entity state on rollback"
                );
            }
        }
        self.drop_collections_of(key);
        self.snapshot_associations(key);
        self.record_natural_id(key);
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("entries", &self.entries.len())
            .field("collections", &self.collections.len())
            .field("detached", &self.detached.len())
            .field("natural_ids", &self.natural_ids.len())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
