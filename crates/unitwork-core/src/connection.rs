//! Database connection abstraction.
//!
//! The persistence engine talks to the database only through [`Connection`]:
//! row-returning queries, affected-row statements, and the transaction
//! boundary. Every call takes a `Cx` so cancellation and budgets flow from the
//! caller's asupersync region.

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// SQL dialect used when rendering statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }
}

/// A database connection capable of executing statements.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
/// Transaction control defaults to plain `BEGIN` / `COMMIT` / `ROLLBACK`
/// statements sent through [`execute`](Connection::execute).
///
/// # Example
///
/// ```rust,ignore
/// let id = [Value::BigInt(1)];
/// let rows = conn.query(&cx, "SELECT * FROM \"teams\" WHERE \"id\" = $1", &id).await;
/// let affected = conn.execute(&cx, "DELETE FROM \"teams\" WHERE \"id\" = $1", &id).await;
/// ```
pub trait Connection: Send + Sync {
    /// The dialect statements should be rendered in.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Start a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move { self.execute(cx, "BEGIN", &[]).await.map(|_| ()) }
    }

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move { self.execute(cx, "COMMIT", &[]).await.map(|_| ()) }
    }

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move { self.execute(cx, "ROLLBACK", &[]).await.map(|_| ()) }
    }
}
