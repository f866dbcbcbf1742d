//! Core types and traits for the unitwork persistence engine.
//!
//! This crate provides the foundational abstractions the session builds on:
//!
//! - `Entity` trait and `EntityKey` identity for mapped structs
//! - `ToOne` / `ToMany` association holders and their metadata
//! - `AnyEntity` type-erased shared handles
//! - `Connection` trait for database access
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome};

pub mod association;
pub mod connection;
pub mod entity;
pub mod error;
pub mod field;
pub mod handle;
pub mod row;
pub mod types;
pub mod value;

pub use association::{
    AssociationInfo, AssociationKind, AssociationValue, CascadeAction, CascadeStyle,
    LinkTableInfo, ToMany, ToOne, holds_instance,
};
pub use connection::{Connection, Dialect};
pub use entity::{Entity, EntityKey, hash_values};
pub use error::{
    Error, QueryError, QueryErrorKind, Result, SessionError, SessionErrorKind, TypeError,
};
pub use field::{FieldInfo, field_for_column, natural_id_columns};
pub use handle::{
    AnyEntity, AssociationView, EntityRef, SharedEntity, downcast, entity_ref, instance_id,
    read_lock, same_instance, share, typed_instance_id, write_lock,
};
pub use row::{FromValue, Row};
pub use types::SqlType;
pub use value::Value;
