//! In-memory database and entity fixtures for session integration tests.
//!
//! `FakeDb` understands the statement shapes the session renders for the
//! Postgres dialect: key and `IN`-list selects, multi-row inserts, updates
//! with an optional version predicate, and deletes. A select may name more
//! tables after the first, comma-separated; only the first is read. It enforces primary keys
//! and foreign keys so a badly ordered flush fails the way a real database
//! would.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use unitwork_core::{
    AssociationInfo, AssociationKind, AssociationValue, CascadeStyle, Connection, Entity,
    EntityRef, Error, FieldInfo, LinkTableInfo, QueryError, QueryErrorKind, Result, Row, SqlType,
    ToMany, ToOne, Value, entity_ref,
};

/// Run a test body on a fresh current-thread runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

// ============================================================================
// Fake database
// ============================================================================

pub type Record = BTreeMap<String, Value>;

struct TableDef {
    name: &'static str,
    key: Option<&'static str>,
    /// (column, referenced table); references always target `id`.
    references: &'static [(&'static str, &'static str)],
}

const SCHEMA: &[TableDef] = &[
    TableDef {
        name: "teams",
        key: Some("id"),
        references: &[],
    },
    TableDef {
        name: "heroes",
        key: Some("id"),
        references: &[("team_id", "teams")],
    },
    TableDef {
        name: "powers",
        key: Some("id"),
        references: &[],
    },
    TableDef {
        name: "hero_powers",
        key: None,
        references: &[("hero_id", "heroes"), ("power_id", "powers")],
    },
    TableDef {
        name: "libraries",
        key: Some("id"),
        references: &[],
    },
    TableDef {
        name: "books",
        key: Some("id"),
        references: &[("library_id", "libraries")],
    },
    TableDef {
        name: "people",
        key: Some("id"),
        references: &[("partner_id", "people")],
    },
    TableDef {
        name: "badges",
        key: Some("id"),
        references: &[("holder_id", "holders")],
    },
    TableDef {
        name: "holders",
        key: Some("id"),
        references: &[("badge_id", "badges")],
    },
];

fn table_def(name: &str) -> Option<&'static TableDef> {
    SCHEMA.iter().find(|t| t.name == name)
}

#[derive(Debug, Default)]
pub struct DbState {
    tables: BTreeMap<String, Vec<Record>>,
    snapshot: Option<BTreeMap<String, Vec<Record>>>,
    /// Every statement seen, queries included.
    pub log: Vec<String>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Fail any statement containing this text.
    pub fail_on: Option<String>,
}

/// A shared in-memory database. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<DbState>>,
}

enum Cond {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Cond {
    fn matches(&self, record: &Record) -> bool {
        let same = |column: &str, expected: &Value| {
            record
                .get(column)
                .is_some_and(|v| !v.is_null() && v.same_identity(expected))
        };
        match self {
            Cond::Eq(column, value) => same(column, value),
            Cond::In(column, values) => values.iter().any(|v| same(column, v)),
        }
    }
}

fn syntax(sql: &str, message: &str) -> Error {
    Error::Query(
        QueryError::new(QueryErrorKind::Syntax, message)
            .with_sql(sql)
            .with_sqlstate("42601"),
    )
}

fn constraint(sql: &str, sqlstate: &str, message: String) -> Error {
    Error::Query(
        QueryError::new(QueryErrorKind::Constraint, message)
            .with_sql(sql)
            .with_sqlstate(sqlstate),
    )
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid test regex")
}

fn ident(token: &str) -> String {
    token.trim().trim_matches('"').to_string()
}

fn bound(token: &str, params: &[Value], sql: &str) -> Result<Value> {
    let token = token.trim();
    if token == "NULL" {
        return Ok(Value::Null);
    }
    token
        .strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| params.get(n - 1).cloned())
        .ok_or_else(|| syntax(sql, &format!("bad parameter {token}")))
}

fn parse_where(clause: &str, params: &[Value], sql: &str) -> Result<Vec<Cond>> {
    let eq = regex(r#"^"(\w+)" = (\$\d+)$"#);
    let in_list = regex(r#"^"(\w+)" IN \((.*)\)$"#);
    clause
        .split(" AND ")
        .map(|part| {
            let part = part.trim();
            if let Some(caps) = in_list.captures(part) {
                let values = caps[2]
                    .split(", ")
                    .map(|t| bound(t, params, sql))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Cond::In(caps[1].to_string(), values))
            } else if let Some(caps) = eq.captures(part) {
                Ok(Cond::Eq(caps[1].to_string(), bound(&caps[2], params, sql)?))
            } else {
                Err(syntax(sql, &format!("unsupported predicate: {part}")))
            }
        })
        .collect()
}

impl DbState {
    fn rows(&self, table: &str) -> &[Record] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    fn key_exists(&self, table: &str, id: &Value) -> bool {
        self.rows(table)
            .iter()
            .any(|r| r.get("id").is_some_and(|v| v.same_identity(id)))
    }

    /// Foreign keys of `record` must hit an existing row, or a row written
    /// earlier by the same statement (`pending`, all in `table`).
    fn check_references(
        &self,
        sql: &str,
        table: &str,
        record: &Record,
        pending: &[Record],
    ) -> Result<()> {
        let Some(def) = table_def(table) else {
            return Ok(());
        };
        for (column, target) in def.references {
            let Some(value) = record.get(*column).filter(|v| !v.is_null()) else {
                continue;
            };
            let in_statement = *target == table
                && pending
                    .iter()
                    .any(|r| r.get("id").is_some_and(|v| v.same_identity(value)));
            if !in_statement && !self.key_exists(target, value) {
                return Err(constraint(
                    sql,
                    "23503",
                    format!("{table}.{column} = {value} has no row in {target}"),
                ));
            }
        }
        Ok(())
    }

    fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let re = regex(r#"(?s)^SELECT (.+?) FROM "(\w+)"(?:, "\w+")*(?: WHERE (.+))?$"#);
        let caps = re.captures(sql).ok_or_else(|| syntax(sql, "unsupported SELECT"))?;
        let columns: Vec<String> = caps[1].split(", ").map(ident).collect();
        let conds = match caps.get(3) {
            Some(clause) => parse_where(clause.as_str(), params, sql)?,
            None => Vec::new(),
        };
        Ok(self
            .rows(&caps[2])
            .iter()
            .filter(|r| conds.iter().all(|c| c.matches(r)))
            .map(|r| {
                let values = columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                Row::new(columns.clone(), values)
            })
            .collect())
    }

    fn insert(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let re = regex(r#"^INSERT INTO "(\w+)" \((.+?)\) VALUES (.+)$"#);
        let caps = re.captures(sql).ok_or_else(|| syntax(sql, "unsupported INSERT"))?;
        let table = caps[1].to_string();
        let columns: Vec<String> = caps[2].split(", ").map(ident).collect();
        if columns.is_empty() || params.len() % columns.len() != 0 {
            return Err(syntax(sql, "parameter count does not match columns"));
        }

        let mut new_rows: Vec<Record> = Vec::new();
        for chunk in params.chunks(columns.len()) {
            let record: Record = columns.iter().cloned().zip(chunk.iter().cloned()).collect();
            self.check_references(sql, &table, &record, &new_rows)?;
            let duplicate = |existing: &Record| match table_def(&table).and_then(|d| d.key) {
                Some(key) => existing
                    .get(key)
                    .zip(record.get(key))
                    .is_some_and(|(a, b)| a.same_identity(b)),
                None => existing == &record,
            };
            if self.rows(&table).iter().any(duplicate) || new_rows.iter().any(duplicate) {
                return Err(constraint(
                    sql,
                    "23505",
                    format!("duplicate key in {table}"),
                ));
            }
            new_rows.push(record);
        }
        let count = new_rows.len() as u64;
        self.tables.entry(table).or_default().extend(new_rows);
        Ok(count)
    }

    fn update(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let re = regex(r#"^UPDATE "(\w+)" SET (.+?) WHERE (.+)$"#);
        let caps = re.captures(sql).ok_or_else(|| syntax(sql, "unsupported UPDATE"))?;
        let table = caps[1].to_string();
        let assignment = regex(r#"^"(\w+)" = (\$\d+|NULL)$"#);
        let mut sets: Vec<(String, Value)> = Vec::new();
        for part in caps[2].split(", ") {
            let a = assignment
                .captures(part.trim())
                .ok_or_else(|| syntax(sql, "unsupported assignment"))?;
            sets.push((a[1].to_string(), bound(&a[2], params, sql)?));
        }
        let conds = parse_where(&caps[3], params, sql)?;

        let mut updated: Vec<(usize, Record)> = Vec::new();
        for (i, record) in self.rows(&table).iter().enumerate() {
            if !conds.iter().all(|c| c.matches(record)) {
                continue;
            }
            let mut next = record.clone();
            for (column, value) in &sets {
                next.insert(column.clone(), value.clone());
            }
            self.check_references(sql, &table, &next, &[])?;
            updated.push((i, next));
        }
        let count = updated.len() as u64;
        if let Some(rows) = self.tables.get_mut(&table) {
            for (i, next) in updated {
                rows[i] = next;
            }
        }
        Ok(count)
    }

    fn delete(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let re = regex(r#"^DELETE FROM "(\w+)" WHERE (.+)$"#);
        let caps = re.captures(sql).ok_or_else(|| syntax(sql, "unsupported DELETE"))?;
        let table = caps[1].to_string();
        let conds = parse_where(&caps[2], params, sql)?;

        let doomed: Vec<Value> = self
            .rows(&table)
            .iter()
            .filter(|r| conds.iter().all(|c| c.matches(r)))
            .filter_map(|r| r.get("id").cloned())
            .collect();
        for def in SCHEMA {
            for (column, target) in def.references {
                if *target != table {
                    continue;
                }
                let referenced = self.rows(def.name).iter().any(|r| {
                    let this_row_goes = def.name == table && conds.iter().all(|c| c.matches(r));
                    !this_row_goes
                        && r.get(*column)
                            .is_some_and(|v| doomed.iter().any(|d| d.same_identity(v)))
                });
                if referenced {
                    return Err(constraint(
                        sql,
                        "23503",
                        format!("{table} row is still referenced from {}.{column}", def.name),
                    ));
                }
            }
        }

        let Some(rows) = self.tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !conds.iter().all(|c| c.matches(r)));
        Ok((before - rows.len()) as u64)
    }

    fn run(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.log.push(sql.to_string());
        if self.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            return Err(Error::Query(
                QueryError::new(QueryErrorKind::Database, "injected failure").with_sql(sql),
            ));
        }
        if sql.starts_with("INSERT") {
            self.insert(sql, params)
        } else if sql.starts_with("UPDATE") {
            self.update(sql, params)
        } else if sql.starts_with("DELETE") {
            self.delete(sql, params)
        } else {
            Err(syntax(sql, "unsupported statement"))
        }
    }
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Insert a row directly, bypassing constraints and the log.
    pub fn seed(&self, table: &str, row: &[(&str, Value)]) {
        let record: Record = row
            .iter()
            .map(|(c, v)| ((*c).to_string(), v.clone()))
            .collect();
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    /// Change a column of a row directly, as another transaction would.
    pub fn set(&self, table: &str, id: i64, column: &str, value: Value) {
        let mut state = self.lock();
        if let Some(rows) = state.tables.get_mut(table) {
            for r in rows.iter_mut() {
                if r.get("id").is_some_and(|v| v.same_identity(&Value::BigInt(id))) {
                    r.insert(column.to_string(), value.clone());
                }
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock().rows(table).to_vec()
    }

    pub fn row(&self, table: &str, id: i64) -> Option<Record> {
        self.lock()
            .rows(table)
            .iter()
            .find(|r| r.get("id").is_some_and(|v| v.same_identity(&Value::BigInt(id))))
            .cloned()
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().rows(table).len()
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Logged statements starting with `prefix`.
    pub fn statements(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|s| s.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn fail_on(&self, fragment: &str) {
        self.lock().fail_on = Some(fragment.to_string());
    }

    pub fn transactions(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (state.begins, state.commits, state.rollbacks)
    }
}

impl Connection for FakeDb {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = {
            let mut state = self.lock();
            state.log.push(sql.to_string());
            state.select(sql, params)
        };
        async move {
            match result {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.lock().run(sql, params);
        async move {
            match result {
                Ok(n) => Outcome::Ok(n),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        {
            let mut state = self.lock();
            state.begins += 1;
            state.snapshot = Some(state.tables.clone());
        }
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        {
            let mut state = self.lock();
            state.commits += 1;
            state.snapshot = None;
        }
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        {
            let mut state = self.lock();
            state.rollbacks += 1;
            if let Some(snapshot) = state.snapshot.take() {
                state.tables = snapshot;
            }
        }
        async { Outcome::Ok(()) }
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub heroes: ToMany<Hero>,
}

#[derive(Debug, Clone)]
pub struct Hero {
    pub id: i64,
    pub name: String,
    pub team: ToOne<Team>,
    pub powers: ToMany<Power>,
}

#[derive(Debug, Clone)]
pub struct Power {
    pub id: i64,
    pub name: String,
}

/// Owns a unidirectional one-to-many: the books table carries `library_id`
/// but `Book` has no field for it.
#[derive(Debug, Clone)]
pub struct Library {
    pub id: i64,
    pub name: String,
    pub books: ToMany<Book>,
}

#[derive(Debug, Clone)]
pub struct Book {
    pub id: i64,
    pub title: String,
}

/// References another person through a nullable foreign key.
#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub partner: ToOne<Person>,
}

/// `Badge` and `Holder` reference each other through non-null foreign keys.
#[derive(Debug, Clone)]
pub struct Badge {
    pub id: i64,
    pub holder: ToOne<Holder>,
}

#[derive(Debug, Clone)]
pub struct Holder {
    pub id: i64,
    pub badge: ToOne<Badge>,
}

const TEAM_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text),
    FieldInfo::new("version", "version", SqlType::BigInt).version(true),
];

const TEAM_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "heroes",
    "Hero",
    "heroes",
    AssociationKind::OneToMany,
)
.remote_key("team_id")
.mapped_by("team")
.cascade(CascadeStyle::ALL_DELETE_ORPHAN)];

const HERO_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text),
    FieldInfo::new("team_id", "team_id", SqlType::BigInt)
        .nullable(true)
        .foreign_key("teams.id"),
];

const HERO_ASSOCIATIONS: &[AssociationInfo] = &[
    AssociationInfo::new("team", "Team", "teams", AssociationKind::ManyToOne)
        .local_key("team_id")
        .cascade(CascadeStyle::PERSIST),
    AssociationInfo::new("powers", "Power", "powers", AssociationKind::ManyToMany)
        .link_table(LinkTableInfo::new("hero_powers", "hero_id", "power_id")),
];

const POWER_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text).natural_id(true),
];

const LIBRARY_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text),
];

const LIBRARY_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "books",
    "Book",
    "books",
    AssociationKind::OneToMany,
)
.remote_key("library_id")
.cascade(CascadeStyle::ALL_DELETE_ORPHAN)];

const BOOK_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("title", "title", SqlType::Text),
];

const PERSON_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text),
    FieldInfo::new("partner_id", "partner_id", SqlType::BigInt)
        .nullable(true)
        .foreign_key("people.id"),
];

const PERSON_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "partner",
    "Person",
    "people",
    AssociationKind::ManyToOne,
)
.local_key("partner_id")
.cascade(CascadeStyle::PERSIST)];

const BADGE_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("holder_id", "holder_id", SqlType::BigInt).foreign_key("holders.id"),
];

const BADGE_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "holder",
    "Holder",
    "holders",
    AssociationKind::OneToOne,
)
.local_key("holder_id")
.cascade(CascadeStyle::PERSIST)];

const HOLDER_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("badge_id", "badge_id", SqlType::BigInt).foreign_key("badges.id"),
];

const HOLDER_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "badge",
    "Badge",
    "badges",
    AssociationKind::OneToOne,
)
.local_key("badge_id")
.cascade(CascadeStyle::PERSIST)];

impl Entity for Team {
    const ENTITY_NAME: &'static str = "Team";
    const TABLE_NAME: &'static str = "teams";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        TEAM_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        TEAM_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("version", Value::BigInt(self.version)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Team {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            version: row.get_named("version")?,
            heroes: ToMany::uninitialized(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn set_version(&mut self, version: &Value) {
        if let Some(v) = version.as_i64() {
            self.version = v;
        }
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "heroes" => Some(&self.heroes),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "heroes" => Some(&mut self.heroes),
            _ => None,
        }
    }
}

impl Entity for Hero {
    const ENTITY_NAME: &'static str = "Hero";
    const TABLE_NAME: &'static str = "heroes";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        HERO_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        HERO_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("team_id", self.team.id_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Hero {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team: ToOne::from_id(row.get_named::<Value>("team_id")?),
            powers: ToMany::uninitialized(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "team" => Some(&self.team),
            "powers" => Some(&self.powers),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "team" => Some(&mut self.team),
            "powers" => Some(&mut self.powers),
            _ => None,
        }
    }
}

impl Entity for Power {
    const ENTITY_NAME: &'static str = "Power";
    const TABLE_NAME: &'static str = "powers";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        POWER_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Power {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

impl Entity for Library {
    const ENTITY_NAME: &'static str = "Library";
    const TABLE_NAME: &'static str = "libraries";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        LIBRARY_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        LIBRARY_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Library {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            books: ToMany::uninitialized(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "books" => Some(&self.books),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "books" => Some(&mut self.books),
            _ => None,
        }
    }
}

impl Entity for Book {
    const ENTITY_NAME: &'static str = "Book";
    const TABLE_NAME: &'static str = "books";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        BOOK_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("title", Value::Text(self.title.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Book {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

impl Entity for Person {
    const ENTITY_NAME: &'static str = "Person";
    const TABLE_NAME: &'static str = "people";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        PERSON_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        PERSON_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("partner_id", self.partner.id_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Person {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            partner: ToOne::from_id(row.get_named::<Value>("partner_id")?),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "partner" => Some(&self.partner),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "partner" => Some(&mut self.partner),
            _ => None,
        }
    }
}

impl Entity for Badge {
    const ENTITY_NAME: &'static str = "Badge";
    const TABLE_NAME: &'static str = "badges";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        BADGE_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        BADGE_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("holder_id", self.holder.id_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Badge {
            id: row.get_named("id")?,
            holder: ToOne::from_id(row.get_named::<Value>("holder_id")?),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "holder" => Some(&self.holder),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "holder" => Some(&mut self.holder),
            _ => None,
        }
    }
}

impl Entity for Holder {
    const ENTITY_NAME: &'static str = "Holder";
    const TABLE_NAME: &'static str = "holders";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        HOLDER_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        HOLDER_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("badge_id", self.badge.id_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Holder {
            id: row.get_named("id")?,
            badge: ToOne::from_id(row.get_named::<Value>("badge_id")?),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "badge" => Some(&self.badge),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "badge" => Some(&mut self.badge),
            _ => None,
        }
    }
}

pub fn team(id: i64, name: &str) -> EntityRef<Team> {
    entity_ref(Team {
        id,
        name: name.to_string(),
        version: 0,
        heroes: ToMany::new(),
    })
}

pub fn hero(id: i64, name: &str) -> EntityRef<Hero> {
    entity_ref(Hero {
        id,
        name: name.to_string(),
        team: ToOne::empty(),
        powers: ToMany::new(),
    })
}

pub fn power(id: i64, name: &str) -> EntityRef<Power> {
    entity_ref(Power {
        id,
        name: name.to_string(),
    })
}

pub fn library(id: i64, name: &str) -> EntityRef<Library> {
    entity_ref(Library {
        id,
        name: name.to_string(),
        books: ToMany::new(),
    })
}

pub fn book(id: i64, title: &str) -> EntityRef<Book> {
    entity_ref(Book {
        id,
        title: title.to_string(),
    })
}

pub fn person(id: i64, name: &str) -> EntityRef<Person> {
    entity_ref(Person {
        id,
        name: name.to_string(),
        partner: ToOne::empty(),
    })
}

pub fn badge(id: i64) -> EntityRef<Badge> {
    entity_ref(Badge {
        id,
        holder: ToOne::empty(),
    })
}

pub fn holder(id: i64) -> EntityRef<Holder> {
    entity_ref(Holder {
        id,
        badge: ToOne::empty(),
    })
}

// ============================================================================
// Seed helpers
// ============================================================================

pub fn seed_team(db: &FakeDb, id: i64, name: &str, version: i64) {
    db.seed(
        "teams",
        &[
            ("id", Value::BigInt(id)),
            ("name", Value::Text(name.to_string())),
            ("version", Value::BigInt(version)),
        ],
    );
}

pub fn seed_hero(db: &FakeDb, id: i64, name: &str, team_id: Option<i64>) {
    db.seed(
        "heroes",
        &[
            ("id", Value::BigInt(id)),
            ("name", Value::Text(name.to_string())),
            ("team_id", team_id.map_or(Value::Null, Value::BigInt)),
        ],
    );
}

pub fn seed_power(db: &FakeDb, id: i64, name: &str) {
    db.seed(
        "powers",
        &[
            ("id", Value::BigInt(id)),
            ("name", Value::Text(name.to_string())),
        ],
    );
}

pub fn seed_link(db: &FakeDb, hero_id: i64, power_id: i64) {
    db.seed(
        "hero_powers",
        &[
            ("hero_id", Value::BigInt(hero_id)),
            ("power_id", Value::BigInt(power_id)),
        ],
    );
}

pub fn seed_library(db: &FakeDb, id: i64, name: &str) {
    db.seed(
        "libraries",
        &[
            ("id", Value::BigInt(id)),
            ("name", Value::Text(name.to_string())),
        ],
    );
}

pub fn seed_book(db: &FakeDb, id: i64, title: &str, library_id: Option<i64>) {
    db.seed(
        "books",
        &[
            ("id", Value::BigInt(id)),
            ("title", Value::Text(title.to_string())),
            ("library_id", library_id.map_or(Value::Null, Value::BigInt)),
        ],
    );
}
