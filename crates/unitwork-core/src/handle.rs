//! Shared entity handles.
//!
//! Managed entities live behind `Arc<RwLock<M>>`. The persistence context
//! hands out clones of the same `Arc` for the same row, so identity is
//! pointer identity. [`AnyEntity`] erases the concrete type so the engine
//! can keep heterogeneous entities in one identity map and walk associations
//! between them.
//!
//! Locking discipline: no method here holds a write lock on one entity
//! while locking another. State is cloned out, the guard dropped, then
//! related entities are touched. Reading a row may read-lock to-one targets
//! to derive foreign keys.

use crate::association::AssociationInfo;
use crate::entity::{Entity, EntityKey};
use crate::field::FieldInfo;
use crate::row::Row;
use crate::value::Value;
use crate::{Error, Result, SessionError, SessionErrorKind};
use std::any::Any;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to a typed entity instance.
pub type EntityRef<M> = Arc<RwLock<M>>;

/// Type-erased shared handle.
pub type SharedEntity = Arc<dyn AnyEntity>;

/// Wrap a value in a fresh shared handle.
pub fn entity_ref<M: Entity>(entity: M) -> EntityRef<M> {
    Arc::new(RwLock::new(entity))
}

/// Erase the type of a handle. The result points at the same instance.
pub fn share<M: Entity>(entity: &EntityRef<M>) -> SharedEntity {
    Arc::clone(entity) as SharedEntity
}

/// Recover the typed handle, if `entity` is an `M`.
pub fn downcast<M: Entity>(entity: &SharedEntity) -> Option<EntityRef<M>> {
    Arc::clone(entity).into_any().downcast::<RwLock<M>>().ok()
}

/// Address of the instance behind a handle.
pub fn instance_id(entity: &SharedEntity) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Address of the instance behind a typed handle; matches [`instance_id`].
pub fn typed_instance_id<M: Entity>(entity: &EntityRef<M>) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Do both handles point at the same instance?
pub fn same_instance(a: &SharedEntity, b: &SharedEntity) -> bool {
    instance_id(a) == instance_id(b)
}

/// Read-lock an entity, recovering from poisoning.
pub fn read_lock<M>(entity: &RwLock<M>) -> RwLockReadGuard<'_, M> {
    entity.read().unwrap_or_else(|e| e.into_inner())
}

/// Write-lock an entity, recovering from poisoning.
pub fn write_lock<M>(entity: &RwLock<M>) -> RwLockWriteGuard<'_, M> {
    entity.write().unwrap_or_else(|e| e.into_inner())
}

/// Contents of one association at a point in time.
#[derive(Clone, Default)]
pub struct AssociationView {
    /// False for lazy collections and unresolved to-ones.
    pub initialized: bool,
    pub targets: Vec<SharedEntity>,
    /// Foreign key of an unresolved to-one.
    pub foreign_id: Option<Value>,
}

impl std::fmt::Debug for AssociationView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationView")
            .field("initialized", &self.initialized)
            .field("targets", &self.targets.len())
            .field("foreign_id", &self.foreign_id)
            .finish()
    }
}

/// Object-safe view of a managed entity instance.
pub trait AnyEntity: Send + Sync + 'static {
    fn entity_name(&self) -> &'static str;
    fn table_name(&self) -> &'static str;
    fn primary_key_columns(&self) -> &'static [&'static str];
    fn version_column(&self) -> Option<&'static str>;
    fn fields(&self) -> &'static [FieldInfo];
    fn associations(&self) -> &'static [AssociationInfo];

    /// Metadata for one association.
    fn association_info(&self, role: &str) -> Option<&'static AssociationInfo> {
        self.associations().iter().find(|a| a.name == role)
    }

    /// Current identity.
    fn key(&self) -> EntityKey;

    /// Current column state.
    fn row(&self) -> Vec<(&'static str, Value)>;

    /// Current contents of an association.
    fn association(&self, role: &str) -> Option<AssociationView>;

    /// Replace the contents of an association.
    fn set_association_targets(&self, role: &str, targets: Vec<SharedEntity>) -> Result<()>;

    /// Reset an association to what a fresh load would hold.
    fn uninitialize_association(&self, role: &str);

    /// Write back a version assigned by flush.
    fn set_version(&self, version: &Value);

    /// Copy state from another instance of the same type.
    ///
    /// Collections that are uninitialized in `source` keep their current
    /// contents. Returns false when `source` is a different entity type.
    fn copy_state_from(&self, source: &dyn AnyEntity) -> bool;

    /// Overwrite state from a freshly read row.
    ///
    /// Resolved to-one handles whose identifier still matches the row are
    /// kept; collections come back uninitialized.
    fn apply_row(&self, row: &Row) -> Result<()>;

    /// A new, unshared instance with the same state.
    fn duplicate(&self) -> SharedEntity;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

fn unknown_association(entity: &'static str, role: &str) -> Error {
    Error::Session(
        SessionError::new(
            SessionErrorKind::UnknownAssociation,
            format!("no association named '{role}'"),
        )
        .entity(entity),
    )
}

impl<M: Entity> AnyEntity for RwLock<M> {
    fn entity_name(&self) -> &'static str {
        M::ENTITY_NAME
    }

    fn table_name(&self) -> &'static str {
        M::TABLE_NAME
    }

    fn primary_key_columns(&self) -> &'static [&'static str] {
        M::PRIMARY_KEY
    }

    fn version_column(&self) -> Option<&'static str> {
        M::version_column()
    }

    fn fields(&self) -> &'static [FieldInfo] {
        M::fields()
    }

    fn associations(&self) -> &'static [AssociationInfo] {
        M::associations()
    }

    fn key(&self) -> EntityKey {
        EntityKey::of(&*read_lock(self))
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        read_lock(self).to_row()
    }

    fn association(&self, role: &str) -> Option<AssociationView> {
        let guard = read_lock(self);
        let holder = guard.association(role)?;
        Some(AssociationView {
            initialized: holder.is_initialized(),
            targets: holder.targets(),
            foreign_id: holder.foreign_id(),
        })
    }

    fn set_association_targets(&self, role: &str, targets: Vec<SharedEntity>) -> Result<()> {
        let mut guard = write_lock(self);
        match guard.association_mut(role) {
            Some(holder) => holder.set_targets(targets),
            None => Err(unknown_association(M::ENTITY_NAME, role)),
        }
    }

    fn uninitialize_association(&self, role: &str) {
        // A to-one keeps its foreign key; read it before taking our own guard.
        let foreign_id = AnyEntity::association(self, role)
            .and_then(|view| view.targets.into_iter().next())
            .and_then(|target| target.key().id().first().cloned())
            .unwrap_or(Value::Null);
        if let Some(holder) = write_lock(self).association_mut(role) {
            holder.uninitialize(foreign_id);
        }
    }

    fn set_version(&self, version: &Value) {
        write_lock(self).set_version(version);
    }

    fn copy_state_from(&self, source: &dyn AnyEntity) -> bool {
        let Some(source) = source.as_any().downcast_ref::<RwLock<M>>() else {
            return false;
        };
        if std::ptr::eq(source, self) {
            return true;
        }
        let mut next = read_lock(source).clone();
        let mut guard = write_lock(self);
        for info in M::associations().iter().filter(|a| a.kind.is_collection()) {
            let source_initialized = next
                .association(info.name)
                .is_some_and(|h| h.is_initialized());
            if source_initialized {
                continue;
            }
            if let (Some(current), Some(target)) = (
                guard.association(info.name),
                next.association_mut(info.name),
            ) {
                target.assign_from(current);
            }
        }
        *guard = next;
        true
    }

    fn apply_row(&self, row: &Row) -> Result<()> {
        let mut fresh = M::from_row(row)?;
        let current: Vec<(&'static str, Vec<SharedEntity>)> = {
            let guard = read_lock(self);
            M::associations()
                .iter()
                .filter(|a| !a.kind.is_collection())
                .filter_map(|a| guard.association(a.name).map(|h| (a.name, h.targets())))
                .collect()
        };
        for (role, targets) in current {
            let Some(target) = targets.into_iter().next() else {
                continue;
            };
            let target_id = target.key().id().first().cloned();
            let Some(holder) = fresh.association_mut(role) else {
                continue;
            };
            let same = match (holder.foreign_id(), target_id) {
                (Some(fk), Some(id)) => fk.same_identity(&id),
                _ => false,
            };
            if same {
                holder.set_targets(vec![target])?;
            }
        }
        *write_lock(self) = fresh;
        Ok(())
    }

    fn duplicate(&self) -> SharedEntity {
        let copy = read_lock(self).clone();
        Arc::new(RwLock::new(copy))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
