//! Association metadata and association holders.
//!
//! Associations are described statically (`AssociationInfo`) and held at
//! runtime by [`ToOne`] and [`ToMany`]. Both holders store shared entity
//! handles, so an object graph navigated through them always reaches the
//! same instances the persistence context tracks.

use crate::Result;
use crate::entity::Entity;
use crate::error::{Error, SessionError, SessionErrorKind};
use crate::handle::{EntityRef, SharedEntity, downcast, read_lock, share, same_instance};
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The shape of an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssociationKind {
    /// Many-to-one: many `Hero`s belong to one `Team`.
    #[default]
    ManyToOne,
    /// One-to-one: `Hero` has one `Profile`.
    OneToOne,
    /// One-to-many: one `Team` has many `Hero`s.
    OneToMany,
    /// Many-to-many: `Hero`s have many `Power`s via a link table.
    ManyToMany,
}

impl AssociationKind {
    /// Whether the association holds a collection.
    pub const fn is_collection(self) -> bool {
        matches!(self, AssociationKind::OneToMany | AssociationKind::ManyToMany)
    }
}

/// Operations that may propagate across an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeAction {
    /// `persist` at call time.
    Persist,
    /// Re-run of persist cascades at flush time.
    PersistOnFlush,
    Merge,
    Remove,
    Refresh,
    Detach,
}

/// Which operations cascade from the owner to the associated entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStyle {
    pub persist: bool,
    pub merge: bool,
    pub remove: bool,
    pub refresh: bool,
    pub detach: bool,
    /// Delete elements that are disassociated from the owner.
    pub orphan_removal: bool,
}

impl CascadeStyle {
    pub const NONE: Self = Self {
        persist: false,
        merge: false,
        remove: false,
        refresh: false,
        detach: false,
        orphan_removal: false,
    };
    pub const PERSIST: Self = Self::NONE.with_persist(true);
    pub const MERGE: Self = Self::NONE.with_merge(true);
    pub const REMOVE: Self = Self::NONE.with_remove(true);
    pub const ALL: Self = Self {
        persist: true,
        merge: true,
        remove: true,
        refresh: true,
        detach: true,
        orphan_removal: false,
    };
    pub const ALL_DELETE_ORPHAN: Self = Self::ALL.with_orphan_removal(true);

    pub const fn with_persist(mut self, value: bool) -> Self {
        self.persist = value;
        self
    }

    pub const fn with_merge(mut self, value: bool) -> Self {
        self.merge = value;
        self
    }

    pub const fn with_remove(mut self, value: bool) -> Self {
        self.remove = value;
        self
    }

    pub const fn with_refresh(mut self, value: bool) -> Self {
        self.refresh = value;
        self
    }

    pub const fn with_detach(mut self, value: bool) -> Self {
        self.detach = value;
        self
    }

    pub const fn with_orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Does this style propagate the given action?
    pub const fn includes(self, action: CascadeAction) -> bool {
        match action {
            CascadeAction::Persist | CascadeAction::PersistOnFlush => self.persist,
            CascadeAction::Merge => self.merge,
            CascadeAction::Remove => self.remove,
            CascadeAction::Refresh => self.refresh,
            CascadeAction::Detach => self.detach,
        }
    }
}

/// Information about a link table backing a many-to-many association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"hero_powers"`).
    pub table_name: &'static str,
    /// Column in the link table pointing to the owner (e.g., `"hero_id"`).
    pub local_column: &'static str,
    /// Column in the link table pointing to the element (e.g., `"power_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }
}

/// Resolved mapping metadata for one association of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Association (field) name, also the collection role.
    pub name: &'static str,
    /// Entity name of the associated type.
    pub target_entity: &'static str,
    /// Table of the associated type.
    pub target_table: &'static str,
    /// Primary key column of the associated type.
    pub target_key: &'static str,
    pub kind: AssociationKind,
    /// Foreign key column on the owner's table (owning to-one side).
    pub local_key: Option<&'static str>,
    /// Foreign key column on the target's table (one-to-many, inverse one-to-one).
    pub remote_key: Option<&'static str>,
    /// Link table (many-to-many).
    pub link_table: Option<LinkTableInfo>,
    /// Name of the association on the target that owns this relationship.
    /// Inverse associations never write rows themselves.
    pub mapped_by: Option<&'static str>,
    pub cascade: CascadeStyle,
}

impl AssociationInfo {
    /// Create a new association with required fields.
    #[must_use]
    pub const fn new(
        name: &'static str,
        target_entity: &'static str,
        target_table: &'static str,
        kind: AssociationKind,
    ) -> Self {
        Self {
            name,
            target_entity,
            target_table,
            target_key: "id",
            kind,
            local_key: None,
            remote_key: None,
            link_table: None,
            mapped_by: None,
            cascade: CascadeStyle::NONE,
        }
    }

    #[must_use]
    pub const fn target_key(mut self, column: &'static str) -> Self {
        self.target_key = column;
        self
    }

    #[must_use]
    pub const fn local_key(mut self, column: &'static str) -> Self {
        self.local_key = Some(column);
        self
    }

    #[must_use]
    pub const fn remote_key(mut self, column: &'static str) -> Self {
        self.remote_key = Some(column);
        self
    }

    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    #[must_use]
    pub const fn mapped_by(mut self, name: &'static str) -> Self {
        self.mapped_by = Some(name);
        self
    }

    #[must_use]
    pub const fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Inverse side of a bidirectional association.
    pub const fn is_inverse(&self) -> bool {
        self.mapped_by.is_some()
    }

    /// The owner row carries the foreign key (owning to-one).
    pub const fn owns_foreign_key(&self) -> bool {
        !self.kind.is_collection() && self.local_key.is_some()
    }

    /// The association maintains rows outside the owner's table on flush.
    pub const fn maintains_rows(&self) -> bool {
        self.kind.is_collection() && !self.is_inverse()
    }

    /// The table whose rows this association writes when it changes.
    pub fn affected_table(&self) -> Option<&'static str> {
        if !self.maintains_rows() {
            return None;
        }
        match (self.kind, self.link_table) {
            (AssociationKind::ManyToMany, Some(link)) => Some(link.table_name),
            (AssociationKind::OneToMany, _) => Some(self.target_table),
            _ => None,
        }
    }
}

/// Type-erased view of an association holder, used by the engine to walk
/// object graphs without knowing the concrete target type.
pub trait AssociationValue: Send + Sync {
    /// Whether the association's contents are in memory.
    fn is_initialized(&self) -> bool;

    /// Handles currently held (empty when uninitialized).
    fn targets(&self) -> Vec<SharedEntity>;

    /// Foreign key of an unresolved to-one.
    fn foreign_id(&self) -> Option<Value>;

    /// Replace the held handles. Fails when a handle has the wrong type.
    fn set_targets(&mut self, targets: Vec<SharedEntity>) -> Result<()>;

    /// Drop in-memory contents, keeping only what a fresh load would know.
    ///
    /// `foreign_id` is the identifier of a resolved to-one target, read by
    /// the caller; collections ignore it.
    fn uninitialize(&mut self, foreign_id: Value);

    /// Overwrite with another holder of the same concrete type.
    fn assign_from(&mut self, other: &dyn AssociationValue) -> bool;

    fn as_any(&self) -> &dyn Any;
}

fn wrong_target(expected: &'static str, got: &SharedEntity) -> Error {
    Error::Session(SessionError::new(
        SessionErrorKind::UnknownAssociation,
        format!(
            "association expects {} but was given {}",
            expected,
            got.entity_name()
        ),
    ))
}

/// A single associated entity (many-to-one or one-to-one).
///
/// Three states:
/// - **Empty**: no association (null foreign key)
/// - **Unresolved**: foreign key known, instance not loaded
/// - **Resolved**: holds the shared handle
pub enum ToOne<C: Entity> {
    Empty,
    Unresolved(Value),
    Resolved(EntityRef<C>),
}

impl<C: Entity> ToOne<C> {
    /// Create an empty association.
    #[must_use]
    pub const fn empty() -> Self {
        ToOne::Empty
    }

    /// Create from a foreign key value; NULL yields an empty association.
    #[must_use]
    pub fn from_id(id: impl Into<Value>) -> Self {
        let id = id.into();
        if id.is_null() {
            ToOne::Empty
        } else {
            ToOne::Unresolved(id)
        }
    }

    /// Point at a shared handle.
    #[must_use]
    pub fn to(target: &EntityRef<C>) -> Self {
        ToOne::Resolved(Arc::clone(target))
    }

    /// The resolved handle, if any.
    pub fn get(&self) -> Option<&EntityRef<C>> {
        match self {
            ToOne::Resolved(r) => Some(r),
            _ => None,
        }
    }

    pub fn set(&mut self, target: &EntityRef<C>) {
        *self = ToOne::Resolved(Arc::clone(target));
    }

    pub fn clear(&mut self) {
        *self = ToOne::Empty;
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ToOne::Empty)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ToOne::Resolved(_))
    }

    /// The foreign key value this association stands for.
    ///
    /// Reads the target's first identifier column when resolved.
    pub fn id_value(&self) -> Value {
        match self {
            ToOne::Empty => Value::Null,
            ToOne::Unresolved(id) => id.clone(),
            ToOne::Resolved(r) => read_lock(r)
                .primary_key_value()
                .into_iter()
                .next()
                .unwrap_or(Value::Null),
        }
    }
}

impl<C: Entity> Default for ToOne<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: Entity> Clone for ToOne<C> {
    fn clone(&self) -> Self {
        match self {
            ToOne::Empty => ToOne::Empty,
            ToOne::Unresolved(id) => ToOne::Unresolved(id.clone()),
            ToOne::Resolved(r) => ToOne::Resolved(Arc::clone(r)),
        }
    }
}

impl<C: Entity> fmt::Debug for ToOne<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToOne::Empty => write!(f, "ToOne<{}>(empty)", C::ENTITY_NAME),
            ToOne::Unresolved(id) => write!(f, "ToOne<{}>(unresolved {})", C::ENTITY_NAME, id),
            ToOne::Resolved(_) => write!(f, "ToOne<{}>(resolved)", C::ENTITY_NAME),
        }
    }
}

impl<C: Entity> AssociationValue for ToOne<C> {
    fn is_initialized(&self) -> bool {
        !matches!(self, ToOne::Unresolved(_))
    }

    fn targets(&self) -> Vec<SharedEntity> {
        match self {
            ToOne::Resolved(r) => vec![share(r)],
            _ => Vec::new(),
        }
    }

    fn foreign_id(&self) -> Option<Value> {
        match self {
            ToOne::Unresolved(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn set_targets(&mut self, targets: Vec<SharedEntity>) -> Result<()> {
        let Some(first) = targets.into_iter().next() else {
            *self = ToOne::Empty;
            return Ok(());
        };
        let target = downcast::<C>(&first).ok_or_else(|| wrong_target(C::ENTITY_NAME, &first))?;
        *self = ToOne::Resolved(target);
        Ok(())
    }

    fn uninitialize(&mut self, foreign_id: Value) {
        if self.is_resolved() {
            *self = ToOne::from_id(foreign_id);
        }
    }

    fn assign_from(&mut self, other: &dyn AssociationValue) -> bool {
        match other.as_any().downcast_ref::<ToOne<C>>() {
            Some(o) => {
                *self = o.clone();
                true
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A collection of associated entities (one-to-many or many-to-many).
///
/// An uninitialized collection (as produced by `from_row`) is never
/// dirty-checked; it must be initialized through the session first.
pub struct ToMany<C: Entity> {
    items: Option<Vec<EntityRef<C>>>,
}

impl<C: Entity> ToMany<C> {
    /// An initialized, empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Some(Vec::new()),
        }
    }

    /// A lazily loaded collection whose contents are not in memory.
    #[must_use]
    pub fn uninitialized() -> Self {
        Self { items: None }
    }

    /// An initialized collection holding the given handles.
    #[must_use]
    pub fn from_refs(items: impl IntoIterator<Item = EntityRef<C>>) -> Self {
        Self {
            items: Some(items.into_iter().collect()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.items.is_some()
    }

    /// The held handles (None when uninitialized).
    pub fn get(&self) -> Option<&[EntityRef<C>]> {
        self.items.as_deref()
    }

    /// Iterate over held handles (nothing when uninitialized).
    pub fn iter(&self) -> impl Iterator<Item = &EntityRef<C>> {
        self.items.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.items.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an element. An uninitialized collection becomes initialized with it.
    pub fn push(&mut self, item: &EntityRef<C>) {
        self.items
            .get_or_insert_with(Vec::new)
            .push(Arc::clone(item));
    }

    /// Remove an element by instance identity. Returns whether it was present.
    pub fn remove(&mut self, item: &EntityRef<C>) -> bool {
        let Some(items) = self.items.as_mut() else {
            return false;
        };
        let before = items.len();
        items.retain(|r| !Arc::ptr_eq(r, item));
        items.len() != before
    }

    /// Whether this instance is held.
    pub fn contains(&self, item: &EntityRef<C>) -> bool {
        self.iter().any(|r| Arc::ptr_eq(r, item))
    }

    /// Remove every element, leaving an initialized empty collection.
    pub fn clear(&mut self) {
        self.items = Some(Vec::new());
    }
}

impl<C: Entity> Default for ToMany<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Entity> Clone for ToMany<C> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.as_ref().map(|v| v.iter().map(Arc::clone).collect()),
        }
    }
}

impl<C: Entity> fmt::Debug for ToMany<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.items {
            Some(items) => write!(f, "ToMany<{}>(len {})", C::ENTITY_NAME, items.len()),
            None => write!(f, "ToMany<{}>(uninitialized)", C::ENTITY_NAME),
        }
    }
}

impl<C: Entity> AssociationValue for ToMany<C> {
    fn is_initialized(&self) -> bool {
        self.items.is_some()
    }

    fn targets(&self) -> Vec<SharedEntity> {
        self.iter().map(share).collect()
    }

    fn foreign_id(&self) -> Option<Value> {
        None
    }

    fn set_targets(&mut self, targets: Vec<SharedEntity>) -> Result<()> {
        let mut items = Vec::with_capacity(targets.len());
        for t in &targets {
            let typed = downcast::<C>(t).ok_or_else(|| wrong_target(C::ENTITY_NAME, t))?;
            if !items.iter().any(|r: &EntityRef<C>| Arc::ptr_eq(r, &typed)) {
                items.push(typed);
            }
        }
        self.items = Some(items);
        Ok(())
    }

    fn uninitialize(&mut self, _foreign_id: Value) {
        self.items = None;
    }

    fn assign_from(&mut self, other: &dyn AssociationValue) -> bool {
        match other.as_any().downcast_ref::<ToMany<C>>() {
            Some(o) => {
                *self = o.clone();
                true
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Does `targets` hold this exact instance?
pub fn holds_instance(targets: &[SharedEntity], candidate: &SharedEntity) -> bool {
    targets.iter().any(|t| same_instance(t, candidate))
}
