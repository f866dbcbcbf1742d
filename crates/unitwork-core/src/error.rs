//! Error types for unitwork operations.

use std::fmt;

/// The primary error type for all unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// A statement failed inside the database
    Query(QueryError),
    /// A column value could not be converted
    Type(TypeError),
    /// Persistence-context errors (identity, state, ordering, locking)
    Session(SessionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// JSON column (de)serialization failed
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// A failure reported by the database for one statement.
#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    Syntax,
    /// Unique, foreign key or check violation
    Constraint,
    /// Table or column not found
    NotFound,
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    Timeout,
    /// Anything the driver could not classify
    Database,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

/// An error raised by the persistence context itself.
#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    /// Entity name involved, when known.
    pub entity: Option<&'static str>,
    /// Rendered identifier of the entity involved, when known.
    pub identifier: Option<String>,
    pub message: String,
}

/// Classification of persistence-context failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// Version mismatch on a versioned UPDATE or DELETE.
    OptimisticLock,
    /// Unexpected affected-row count on an unversioned UPDATE or DELETE.
    StaleState,
    /// A second instance was offered for an identity already in the context.
    NonUniqueObject,
    /// The operation targets an entity scheduled for removal.
    ObjectDeleted,
    /// The operation requires a managed entity but got a detached one.
    Detached,
    /// The row backing a managed entity no longer exists.
    ObjectNotFound,
    /// Flush reached an unsaved transient entity through a non-cascading association.
    TransientReference,
    /// Pending inserts or deletes reference each other in a cycle.
    CycleDetected,
    /// The entity's identifier is null.
    MissingIdentifier,
    /// A named association does not exist or has the wrong shape.
    UnknownAssociation,
    /// A previous flush failed; the session must be rolled back and discarded.
    SessionUnusable,
    /// The session has been closed.
    Closed,
}

impl SessionErrorKind {
    /// Short machine-friendly name for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionErrorKind::OptimisticLock => "optimistic_lock",
            SessionErrorKind::StaleState => "stale_state",
            SessionErrorKind::NonUniqueObject => "non_unique_object",
            SessionErrorKind::ObjectDeleted => "object_deleted",
            SessionErrorKind::Detached => "detached",
            SessionErrorKind::ObjectNotFound => "object_not_found",
            SessionErrorKind::TransientReference => "transient_reference",
            SessionErrorKind::CycleDetected => "cycle_detected",
            SessionErrorKind::MissingIdentifier => "missing_identifier",
            SessionErrorKind::UnknownAssociation => "unknown_association",
            SessionErrorKind::SessionUnusable => "session_unusable",
            SessionErrorKind::Closed => "closed",
        }
    }
}

impl SessionError {
    /// Create a session error with no entity attached.
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            identifier: None,
            message: message.into(),
        }
    }

    /// Attach the entity name.
    #[must_use]
    pub fn entity(mut self, entity: &'static str) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attach a rendered identifier.
    #[must_use]
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

impl Error {
    /// Shorthand for building a [`Error::Session`].
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Error::Session(SessionError::new(kind, message))
    }

    /// The session error kind, if this is a persistence-context error.
    pub fn session_kind(&self) -> Option<SessionErrorKind> {
        match self {
            Error::Session(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Deadlocks, serialization failures and timeouts may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Did a concurrent writer win (optimistic lock or stale row count)?
    pub fn is_optimistic_lock_failure(&self) -> bool {
        matches!(
            self.session_kind(),
            Some(SessionErrorKind::OptimisticLock | SessionErrorKind::StaleState)
        )
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// The statement that failed, if the driver reported it.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {e}"),
            Error::Type(e) => match &e.column {
                Some(col) => write!(
                    f,
                    "Type error in column '{col}': expected {}, found {}",
                    e.expected, e.actual
                ),
                None => write!(f, "Type error: expected {}, found {}", e.expected, e.actual),
            },
            Error::Session(e) => write!(f, "Session error: {e}"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {msg}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Session(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(sqlstate) => write!(f, "{} (SQLSTATE {sqlstate})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        match (self.entity, &self.identifier) {
            (Some(entity), Some(id)) => write!(f, " ({entity}#{id})"),
            (Some(entity), None) => write!(f, " ({entity})"),
            _ => Ok(()),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for unitwork operations.
pub type Result<T> = std::result::Result<T, Error>;
