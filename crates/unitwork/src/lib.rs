//! unitwork - a persistence context and unit of work for Rust.
//!
//! A [`Session`] tracks every entity it loads or persists, keeps one shared
//! handle per database row, and writes all pending changes in a single,
//! dependency-ordered flush:
//!
//! - Identity map: one `Arc<RwLock<M>>` per primary key per session
//! - Dirty checking against the loaded snapshot, with optimistic versioning
//! - Cascading persist, merge, remove, refresh and detach over associations
//! - Orphan removal for collections that own their elements
//! - Auto-flush before queries whose tables have pending changes
//! - Rollback that restores both the database and the in-memory graph
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! async fn rename(cx: &Cx, conn: impl Connection) -> Result<()> {
//!     let mut session = Session::new(conn);
//!
//!     let team = match session.get::<Team>(cx, 1_i64).await {
//!         Outcome::Ok(Some(team)) => team,
//!         Outcome::Ok(None) => return Ok(()),
//!         Outcome::Err(e) => return Err(e),
//!         _ => return Ok(()),
//!     };
//!     write_lock(&team).name = "New Avengers".to_string();
//!
//!     // One versioned UPDATE, then COMMIT.
//!     match session.commit(cx).await {
//!         Outcome::Ok(()) => Ok(()),
//!         Outcome::Err(e) => Err(e),
//!         _ => Ok(()),
//!     }
//! }
//! ```
//!
//! Entities implement [`Entity`] by hand: column metadata, row conversion and
//! named access to their [`ToOne`] / [`ToMany`] association holders.

// Re-export all public types from sub-crates
pub use unitwork_core::{
    AnyEntity,
    AssociationInfo,
    AssociationKind,
    AssociationValue,
    // asupersync re-exports
    Budget,
    CascadeAction,
    CascadeStyle,
    Connection,
    Cx,
    Dialect,
    // Core types
    Entity,
    EntityKey,
    EntityRef,
    Error,
    FieldInfo,
    LinkTableInfo,
    Outcome,
    Result,
    Row,
    SessionError,
    SessionErrorKind,
    SharedEntity,
    SqlType,
    ToMany,
    ToOne,
    Value,
    entity_ref,
    read_lock,
    share,
    write_lock,
};

pub use unitwork_session::{
    ElementState, EntityStatus, FlushMode, FlushStats, PendingCounts, Query, Session,
    SessionConfig, SessionEvent, SessionStats,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use unitwork::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AssociationInfo,
        AssociationKind,
        CascadeStyle,
        // Core traits and types
        Connection,
        Cx,
        Entity,
        EntityRef,
        Error,
        FieldInfo,
        LinkTableInfo,
        Outcome,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        SqlType,
        ToMany,
        ToOne,
        Value,
        entity_ref,
        read_lock,
        write_lock,
    };
}
