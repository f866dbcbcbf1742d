//! The `Entity` trait and entity identity.
//!
//! An entity is a mapped struct whose rows live in one table. The trait
//! exposes the resolved mapping metadata (table, key columns, fields,
//! associations) plus state access (`to_row` / `from_row`), which is all the
//! persistence context needs to track, dirty-check and flush it.

use crate::association::{AssociationInfo, AssociationValue};
use crate::field::FieldInfo;
use crate::row::Row;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A mapped entity type.
///
/// Identifiers are assigned by the application: `primary_key_value` must be
/// non-null before the entity is persisted.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone)]
/// struct Team { id: i64, name: String, heroes: ToMany<Hero> }
///
/// impl Entity for Team {
///     const ENTITY_NAME: &'static str = "Team";
///     const TABLE_NAME: &'static str = "teams";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///     // fields(), to_row(), from_row(), primary_key_value(), association()...
/// }
/// ```
pub trait Entity: Clone + Send + Sync + Sized + 'static {
    /// Logical entity name used in keys, logs and errors.
    const ENTITY_NAME: &'static str;

    /// The table this entity is stored in.
    const TABLE_NAME: &'static str;

    /// Primary key column names, in identifier order.
    const PRIMARY_KEY: &'static [&'static str];

    /// Column metadata.
    fn fields() -> &'static [FieldInfo];

    /// Association metadata.
    fn associations() -> &'static [AssociationInfo] {
        &[]
    }

    /// Current column state, including foreign keys derived from to-one associations.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Hydrate from a database row. Associations come back unresolved.
    fn from_row(row: &Row) -> Result<Self>;

    /// Identifier values, in `PRIMARY_KEY` order.
    fn primary_key_value(&self) -> Vec<Value>;

    /// Receive the version assigned by a flush. Unversioned entities ignore it.
    fn set_version(&mut self, _version: &Value) {}

    /// Access an association holder by name.
    fn association(&self, _name: &str) -> Option<&dyn AssociationValue> {
        None
    }

    /// Mutable access to an association holder by name.
    fn association_mut(&mut self, _name: &str) -> Option<&mut dyn AssociationValue> {
        None
    }

    /// The optimistic-lock version column, if any field is flagged as one.
    fn version_column() -> Option<&'static str> {
        Self::fields()
            .iter()
            .find(|f| f.version)
            .map(|f| f.column_name)
    }

    /// Look up association metadata by name.
    fn association_info(name: &str) -> Option<&'static AssociationInfo> {
        Self::associations().iter().find(|a| a.name == name)
    }
}

/// Identity of a row within a persistence context: entity name plus identifier.
///
/// The identifier hash is computed once at construction; equality still
/// compares the full identifier values so hash collisions cannot alias rows.
#[derive(Clone)]
pub struct EntityKey {
    entity: &'static str,
    id: Vec<Value>,
    id_hash: u64,
}

impl EntityKey {
    /// Create a key from an entity name and identifier values.
    pub fn new(entity: &'static str, id: Vec<Value>) -> Self {
        let id_hash = hash_values(&id);
        Self {
            entity,
            id,
            id_hash,
        }
    }

    /// Key of an entity instance.
    pub fn of<M: Entity>(entity: &M) -> Self {
        Self::new(M::ENTITY_NAME, entity.primary_key_value())
    }

    /// Key for an entity type and a single-column identifier.
    pub fn for_id<M: Entity>(id: impl Into<Value>) -> Self {
        Self::new(M::ENTITY_NAME, vec![id.into()])
    }

    /// The entity name.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// The identifier values.
    pub fn id(&self) -> &[Value] {
        &self.id
    }

    /// Hash of the identifier values.
    pub fn id_hash(&self) -> u64 {
        self.id_hash
    }

    /// True when any identifier component is NULL.
    pub fn has_null_id(&self) -> bool {
        self.id.is_empty() || self.id.iter().any(Value::is_null)
    }

    /// Fail with `MissingIdentifier` when the identifier is NULL.
    pub fn require_id(&self) -> Result<()> {
        if self.has_null_id() {
            return Err(Error::Session(
                crate::SessionError::new(
                    crate::SessionErrorKind::MissingIdentifier,
                    "entity has no identifier; assign one before persisting",
                )
                .entity(self.entity),
            ));
        }
        Ok(())
    }

    /// Render the identifier for messages.
    pub fn id_string(&self) -> String {
        match self.id.as_slice() {
            [single] => single.to_string(),
            many => {
                let parts: Vec<String> = many.iter().map(ToString::to_string).collect();
                format!("({})", parts.join(", "))
            }
        }
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.id_hash == other.id_hash
            && self.id.len() == other.id.len()
            && self
                .id
                .iter()
                .zip(&other.id)
                .all(|(a, b)| a.same_identity(b))
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id_hash.hash(state);
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id_string())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id_string())
    }
}

/// Hash a slice of values for use as an identifier hash.
pub fn hash_values(values: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    values.len().hash(&mut hasher);
    for v in values {
        v.hash_into(&mut hasher);
    }
    hasher.finish()
}
