//! Flush ordering and execution.
//!
//! The session turns its action queue into a [`FlushPlan`]:
//! - inserts are topologically sorted so referenced rows are written first;
//!   a cycle through a nullable foreign key is broken by inserting NULL and
//!   setting the key once every row of the cycle exists
//! - deletes run in reverse dependency order (referencing rows go first)
//! - updates are optionally sorted by table and primary key
//!
//! Execution follows the fixed category order of the action queue and stops
//! at the first failure. Inserts and unversioned single-key deletes are
//! batched per table up to the configured batch size.

use crate::action_queue::{CollectionAction, DeleteAction, UpdateAction};
use crate::config::SessionConfig;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use unitwork_core::{
    Connection, Dialect, EntityKey, Error, Result, SessionError, SessionErrorKind, Value,
};

/// An insert with its column values captured at flush time.
#[derive(Debug, Clone)]
pub struct PreparedInsert {
    pub key: EntityKey,
    pub entity: &'static str,
    pub table: &'static str,
    pub pk_columns: &'static [&'static str],
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
    /// Version column and the value written for it.
    pub version: Option<(&'static str, Value)>,
    /// Keys of other rows this row references through non-null foreign keys.
    pub depends_on: Vec<EntityKey>,
    /// References through nullable foreign key columns, with the column.
    pub nullable_depends_on: Vec<(EntityKey, &'static str)>,
    pub seq: u64,
}

/// Inserts in execution order.
#[derive(Debug, Default)]
pub struct OrderedInserts {
    pub inserts: Vec<PreparedInsert>,
    /// Foreign keys inserted as NULL to break a cycle, set right after the inserts.
    pub deferred: Vec<UpdateAction>,
}

/// Statistics of one executed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub orphans_removed: usize,
    pub collection_statements: usize,
    /// Statements sent to the database.
    pub statements: usize,
    pub elapsed_ms: u64,
}

impl FlushStats {
    /// Rows written through entity actions.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.orphans_removed
    }

    pub fn is_empty(&self) -> bool {
        self.statements == 0
    }
}

/// A fully ordered set of statements ready to execute.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Link rows and child foreign keys of early orphans.
    pub orphan_collection_removals: Vec<CollectionAction>,
    pub orphan_removals: Vec<DeleteAction>,
    pub inserts: Vec<PreparedInsert>,
    pub deferred_foreign_keys: Vec<UpdateAction>,
    pub updates: Vec<UpdateAction>,
    pub collection_removals: Vec<CollectionAction>,
    pub collection_updates: Vec<CollectionAction>,
    pub collection_creations: Vec<CollectionAction>,
    pub deletes: Vec<DeleteAction>,
}

fn cycle_error(keys: &[&EntityKey]) -> Error {
    let names: Vec<String> = keys.iter().map(ToString::to_string).collect();
    Error::Session(SessionError::new(
        SessionErrorKind::CycleDetected,
        format!("foreign key cycle between pending rows: {}", names.join(", ")),
    ))
}

/// Order indices so that for every edge `a -> b`, `a` comes first.
///
/// Among ready items the lowest `seq` wins, except that with `group` an item
/// of the same entity as the previous one is preferred. Returns the order and
/// the indices a cycle kept from being emitted.
fn topo_order<T>(
    items: &[T],
    edges: &[(usize, usize)],
    entity: impl Fn(&T) -> &'static str,
    seq: impl Fn(&T) -> u64,
    group: bool,
) -> (Vec<usize>, Vec<usize>) {
    let n = items.len();
    let mut indegree = vec![0usize; n];
    let successors = successor_lists(n, edges);
    for next in &successors {
        for &s in next {
            indegree[s] += 1;
        }
    }

    let mut emitted = vec![false; n];
    let mut order: Vec<usize> = Vec::with_capacity(n);
    let mut last_entity: Option<&'static str> = None;

    while order.len() < n {
        let pick = (0..n)
            .filter(|&i| !emitted[i] && indegree[i] == 0)
            .min_by(|&a, &b| {
                let same = |i: usize| group && last_entity == Some(entity(&items[i]));
                match (same(a), same(b)) {
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    _ => seq(&items[a]).cmp(&seq(&items[b])),
                }
            });
        let Some(next) = pick else {
            break;
        };
        emitted[next] = true;
        last_entity = Some(entity(&items[next]));
        for &s in &successors[next] {
            indegree[s] -= 1;
        }
        order.push(next);
    }

    let stuck = (0..n).filter(|&i| !emitted[i]).collect();
    (order, stuck)
}

fn successor_lists(n: usize, edges: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(from, to) in edges {
        if from != to && !successors[from].contains(&to) {
            successors[from].push(to);
        }
    }
    successors
}

fn take_in_order<T>(items: Vec<T>, order: Vec<usize>) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Order `items` by [`topo_order`], failing on a cycle.
fn kahn<T>(
    items: Vec<T>,
    edges: &[(usize, usize)],
    entity: impl Fn(&T) -> &'static str,
    seq: impl Fn(&T) -> u64,
    key: impl Fn(&T) -> &EntityKey,
    group: bool,
) -> Result<Vec<T>> {
    let (order, stuck) = topo_order(&items, edges, entity, seq, group);
    if !stuck.is_empty() {
        let keys: Vec<&EntityKey> = stuck.iter().map(|&i| key(&items[i])).collect();
        return Err(cycle_error(&keys));
    }
    Ok(take_in_order(items, order))
}

/// Can `to` be reached from `from` following `edges`?
fn reaches(edges: &[(usize, usize)], n: usize, from: usize, to: usize) -> bool {
    let successors = successor_lists(n, edges);
    let mut seen = vec![false; n];
    let mut stack = vec![from];
    while let Some(i) = stack.pop() {
        if i == to {
            return true;
        }
        if std::mem::replace(&mut seen[i], true) {
            continue;
        }
        stack.extend(successors[i].iter().copied());
    }
    false
}

fn index_by_key<'a>(keys: impl Iterator<Item = &'a EntityKey>) -> HashMap<&'a EntityKey, usize> {
    keys.enumerate().map(|(i, k)| (k, i)).collect()
}

/// A dependency between two pending inserts: `before` is referenced by
/// `after`, through `column` when that column is nullable.
#[derive(Debug, Clone, Copy)]
struct InsertEdge {
    before: usize,
    after: usize,
    column: Option<&'static str>,
}

fn insert_edges(inserts: &[PreparedInsert]) -> Vec<InsertEdge> {
    let index = index_by_key(inserts.iter().map(|i| &i.key));
    let mut edges = Vec::new();
    for (after, insert) in inserts.iter().enumerate() {
        for dep in &insert.depends_on {
            if let Some(&before) = index.get(dep) {
                edges.push(InsertEdge {
                    before,
                    after,
                    column: None,
                });
            }
        }
        for (dep, column) in &insert.nullable_depends_on {
            if let Some(&before) = index.get(dep) {
                edges.push(InsertEdge {
                    before,
                    after,
                    column: Some(*column),
                });
            }
        }
    }
    edges
}

/// Write NULL for `column` in the insert and return the UPDATE that sets it afterwards.
fn defer_foreign_key(insert: &mut PreparedInsert, column: &'static str) -> Option<UpdateAction> {
    let pos = insert.columns.iter().position(|c| *c == column)?;
    let value = std::mem::replace(&mut insert.values[pos], Value::Null);
    if value.is_null() {
        return None;
    }
    Some(UpdateAction {
        key: insert.key.clone(),
        entity: insert.entity,
        table: insert.table,
        pk_columns: insert.pk_columns,
        columns: vec![column],
        values: vec![value],
        version: None,
        seq: insert.seq,
    })
}

/// Sort inserts so that every row is written after the pending rows it references.
///
/// A cycle is broken at a nullable foreign key: the later-persisted row is
/// inserted with NULL and the key is set by a follow-up UPDATE. A cycle made
/// only of non-null foreign keys is an error.
pub fn order_inserts(
    mut inserts: Vec<PreparedInsert>,
    group_by_entity: bool,
) -> Result<OrderedInserts> {
    let n = inserts.len();
    let mut edges = insert_edges(&inserts);
    let mut deferred = Vec::new();
    loop {
        let plain: Vec<(usize, usize)> = edges.iter().map(|e| (e.before, e.after)).collect();
        let (order, stuck) =
            topo_order(&inserts, &plain, |i| i.entity, |i| i.seq, group_by_entity);
        if stuck.is_empty() {
            return Ok(OrderedInserts {
                inserts: take_in_order(inserts, order),
                deferred,
            });
        }

        let breakable = edges
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.column.is_some()
                    && stuck.contains(&e.before)
                    && stuck.contains(&e.after)
                    && reaches(&plain, n, e.after, e.before)
            })
            .max_by_key(|(_, e)| inserts[e.after].seq)
            .map(|(pos, _)| pos);
        let Some(pos) = breakable else {
            let keys: Vec<&EntityKey> = stuck.iter().map(|&i| &inserts[i].key).collect();
            return Err(cycle_error(&keys));
        };
        let edge = edges.remove(pos);
        if let Some(column) = edge.column {
            tracing::debug!(
                key = %inserts[edge.after].key,
                column,
                "Breaking insert cycle at nullable foreign key"
            );
            deferred.extend(defer_foreign_key(&mut inserts[edge.after], column));
        }
    }
}

/// Sort deletes so that every row is deleted before the pending rows it references.
pub fn order_deletes(deletes: Vec<DeleteAction>) -> Result<Vec<DeleteAction>> {
    let edges: Vec<(usize, usize)> = {
        let index = index_by_key(deletes.iter().map(|d| &d.key));
        deletes
            .iter()
            .enumerate()
            .flat_map(|(i, delete)| {
                delete
                    .references
                    .iter()
                    .filter_map(|r| index.get(r).map(|&target| (i, target)))
                    .collect::<Vec<_>>()
            })
            .collect()
    };
    kahn(deletes, &edges, |d| d.entity, |d| d.seq, |d| &d.key, true)
}

fn compare_ids(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x.to_string().cmp(&y.to_string()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Sort updates by table, then primary key, when `sort` is set.
pub fn order_updates(mut updates: Vec<UpdateAction>, sort: bool) -> Vec<UpdateAction> {
    if sort {
        updates.sort_by(|a, b| {
            a.table
                .cmp(b.table)
                .then_with(|| compare_ids(a.key.id(), b.key.id()))
        });
    } else {
        updates.sort_by_key(|u| u.seq);
    }
    updates
}

fn row_count_error(
    versioned: bool,
    entity: &'static str,
    key: &EntityKey,
    expected: u64,
    actual: u64,
) -> Error {
    let kind = if versioned {
        SessionErrorKind::OptimisticLock
    } else {
        SessionErrorKind::StaleState
    };
    Error::Session(
        SessionError::new(
            kind,
            format!(
                "row was updated or deleted by another transaction \
                 (expected {expected} row(s), affected {actual})"
            ),
        )
        .entity(entity)
        .identifier(key.id_string()),
    )
}

fn where_pk(dialect: Dialect, columns: &[&str], first_param: usize) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            format!(
                "{} = {}",
                dialect.quote_identifier(col),
                dialect.placeholder(first_param + i)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Render a multi-row INSERT for inserts that share a table and column list.
pub fn insert_sql(dialect: Dialect, batch: &[&PreparedInsert]) -> (String, Vec<Value>) {
    let Some(first) = batch.first() else {
        return (String::new(), Vec::new());
    };
    let col_list = first
        .columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        dialect.quote_identifier(first.table),
        col_list
    );
    let mut params = Vec::new();
    let mut param_idx = 1;
    for (i, insert) in batch.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        let placeholders: Vec<String> = insert
            .values
            .iter()
            .map(|_| {
                let p = dialect.placeholder(param_idx);
                param_idx += 1;
                p
            })
            .collect();
        sql.push('(');
        sql.push_str(&placeholders.join(", "));
        sql.push(')');
        params.extend(insert.values.iter().cloned());
    }
    (sql, params)
}

/// Render a single-row UPDATE with its optional version predicate.
pub fn update_sql(dialect: Dialect, update: &UpdateAction) -> (String, Vec<Value>) {
    let mut params: Vec<Value> = update.values.clone();
    let mut assignments: Vec<String> = update
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            format!(
                "{} = {}",
                dialect.quote_identifier(col),
                dialect.placeholder(i + 1)
            )
        })
        .collect();
    if let Some(check) = &update.version {
        params.push(check.next.clone());
        assignments.push(format!(
            "{} = {}",
            dialect.quote_identifier(check.column),
            dialect.placeholder(params.len())
        ));
    }
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {}",
        dialect.quote_identifier(update.table),
        assignments.join(", "),
        where_pk(dialect, update.pk_columns, params.len() + 1)
    );
    params.extend(update.key.id().iter().cloned());
    if let Some(check) = &update.version {
        params.push(check.current.clone());
        sql.push_str(&format!(
            " AND {} = {}",
            dialect.quote_identifier(check.column),
            dialect.placeholder(params.len())
        ));
    }
    (sql, params)
}

/// Render a single-row DELETE with its optional version predicate.
pub fn delete_sql(dialect: Dialect, delete: &DeleteAction) -> (String, Vec<Value>) {
    let mut params: Vec<Value> = delete.key.id().to_vec();
    let mut sql = format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote_identifier(delete.table),
        where_pk(dialect, delete.pk_columns, 1)
    );
    if let Some((column, current)) = &delete.version {
        params.push(current.clone());
        sql.push_str(&format!(
            " AND {} = {}",
            dialect.quote_identifier(column),
            dialect.placeholder(params.len())
        ));
    }
    (sql, params)
}

/// Render an `IN`-list DELETE for unversioned single-key rows of one table.
pub fn delete_in_sql(dialect: Dialect, batch: &[&DeleteAction]) -> (String, Vec<Value>) {
    let Some(first) = batch.first() else {
        return (String::new(), Vec::new());
    };
    let params: Vec<Value> = batch
        .iter()
        .filter_map(|d| d.key.id().first().cloned())
        .collect();
    let placeholders: Vec<String> = (1..=params.len()).map(|i| dialect.placeholder(i)).collect();
    let pk = first.pk_columns.first().copied().unwrap_or("id");
    (
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            dialect.quote_identifier(first.table),
            dialect.quote_identifier(pk),
            placeholders.join(", ")
        ),
        params,
    )
}

fn batchable_delete(delete: &DeleteAction) -> bool {
    delete.version.is_none() && delete.pk_columns.len() == 1
}

impl FlushPlan {
    /// Create an empty flush plan.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of actions in the plan.
    pub fn len(&self) -> usize {
        self.orphan_collection_removals.len()
            + self.orphan_removals.len()
            + self.inserts.len()
            + self.deferred_foreign_keys.len()
            + self.updates.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.collection_creations.len()
            + self.deletes.len()
    }

    /// Execute the plan against the database.
    #[tracing::instrument(level = "info", skip(self, cx, conn, config))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        config: &SessionConfig,
    ) -> Outcome<FlushStats, Error> {
        tracing::info!(
            orphan_removals = self.orphan_removals.len(),
            inserts = self.inserts.len(),
            deferred_foreign_keys = self.deferred_foreign_keys.len(),
            updates = self.updates.len(),
            collection_actions = self.collection_removals.len()
                + self.collection_updates.len()
                + self.collection_creations.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut stats = FlushStats::default();
        let dialect = conn.dialect();

        // 1. Orphans replaced in to-one associations, after their link rows
        match Self::execute_collection_actions(cx, conn, dialect, &self.orphan_collection_removals)
            .await
        {
            Outcome::Ok(count) => {
                stats.collection_statements += count;
                stats.statements += count;
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match Self::execute_deletes(cx, conn, dialect, config, &self.orphan_removals, &mut stats)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        // 2. Inserts (batched by table)
        for batch in Self::batch_inserts(&self.inserts, config.effective_batch_size()) {
            let (sql, params) = insert_sql(dialect, &batch);
            tracing::debug!(table = batch[0].table, count = batch.len(), "Executing insert batch");
            tracing::trace!(sql = %sql, "Insert SQL");
            match conn.execute(cx, &sql, &params).await {
                Outcome::Ok(_) => {
                    stats.inserted += batch.len();
                    stats.statements += 1;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // Foreign keys held back to break insert cycles
        for update in &self.deferred_foreign_keys {
            match Self::execute_update(cx, conn, dialect, config, update).await {
                Outcome::Ok(()) => stats.statements += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 3. Updates (one at a time - different columns may be dirty)
        for update in &self.updates {
            match Self::execute_update(cx, conn, dialect, config, update).await {
                Outcome::Ok(()) => {
                    stats.updated += 1;
                    stats.statements += 1;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 4-6. Collection removals, updates, recreations
        for actions in [
            &self.collection_removals,
            &self.collection_updates,
            &self.collection_creations,
        ] {
            match Self::execute_collection_actions(cx, conn, dialect, actions).await {
                Outcome::Ok(count) => {
                    stats.collection_statements += count;
                    stats.statements += count;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 7. Deletes
        match Self::execute_deletes(cx, conn, dialect, config, &self.deletes, &mut stats).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        stats.elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            elapsed_ms = stats.elapsed_ms,
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            orphans_removed = stats.orphans_removed,
            statements = stats.statements,
            "Flush complete"
        );

        Outcome::Ok(stats)
    }

    /// Group consecutive inserts with the same table and columns, up to `max` rows.
    fn batch_inserts(inserts: &[PreparedInsert], max: usize) -> Vec<Vec<&PreparedInsert>> {
        let mut batches: Vec<Vec<&PreparedInsert>> = Vec::new();
        for insert in inserts {
            match batches.last_mut() {
                Some(batch)
                    if batch.len() < max
                        && batch[0].table == insert.table
                        && batch[0].columns == insert.columns =>
                {
                    batch.push(insert);
                }
                _ => batches.push(vec![insert]),
            }
        }
        batches
    }

    /// Group consecutive batchable deletes of one table, up to `max` rows.
    fn batch_deletes(deletes: &[DeleteAction], max: usize) -> Vec<Vec<&DeleteAction>> {
        let mut batches: Vec<Vec<&DeleteAction>> = Vec::new();
        for delete in deletes {
            match batches.last_mut() {
                Some(batch)
                    if batch.len() < max
                        && batchable_delete(delete)
                        && batchable_delete(batch[0])
                        && batch[0].table == delete.table =>
                {
                    batch.push(delete);
                }
                _ => batches.push(vec![delete]),
            }
        }
        batches
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute_deletes<C: Connection>(
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        config: &SessionConfig,
        deletes: &[DeleteAction],
        stats: &mut FlushStats,
    ) -> Outcome<(), Error> {
        for batch in Self::batch_deletes(deletes, config.effective_batch_size()) {
            let first = batch[0];
            if first.pk_columns.is_empty() {
                tracing::warn!(
                    table = first.table,
                    "Skipping DELETE for table without primary key - cannot identify rows"
                );
                continue;
            }
            let (sql, params) = if batch.len() > 1 || batchable_delete(first) {
                delete_in_sql(dialect, &batch)
            } else {
                delete_sql(dialect, first)
            };
            tracing::debug!(table = first.table, count = batch.len(), "Executing delete batch");
            tracing::trace!(sql = %sql, "Delete SQL");
            let affected = match conn.execute(cx, &sql, &params).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            stats.statements += 1;
            let expected = batch.len() as u64;
            let versioned = first.version.is_some();
            if affected != expected && (versioned || config.check_row_counts) {
                return Outcome::Err(row_count_error(
                    versioned,
                    first.entity,
                    &first.key,
                    expected,
                    affected,
                ));
            }
            let orphans = batch.iter().filter(|d| d.orphan).count();
            stats.orphans_removed += orphans;
            stats.deleted += batch.len() - orphans;
        }
        Outcome::Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = update.table))]
    async fn execute_update<C: Connection>(
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        config: &SessionConfig,
        update: &UpdateAction,
    ) -> Outcome<(), Error> {
        if update.pk_columns.is_empty() {
            tracing::warn!(
                table = update.table,
                "Skipping UPDATE for row without primary key - cannot identify row"
            );
            return Outcome::Ok(());
        }

        tracing::debug!(
            entity = update.entity,
            columns = ?update.columns,
            versioned = update.version.is_some(),
            "Executing update"
        );

        let (sql, params) = update_sql(dialect, update);
        tracing::trace!(sql = %sql, "Update SQL");
        let affected = match conn.execute(cx, &sql, &params).await {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let versioned = update.version.is_some();
        if affected != 1 && (versioned || config.check_row_counts) {
            return Outcome::Err(row_count_error(
                versioned,
                update.entity,
                &update.key,
                1,
                affected,
            ));
        }
        Outcome::Ok(())
    }

    async fn execute_collection_actions<C: Connection>(
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        actions: &[CollectionAction],
    ) -> Outcome<usize, Error> {
        let mut count = 0;
        for action in actions {
            tracing::debug!(
                owner = %action.owner,
                role = action.role,
                kind = ?action.kind,
                ops = action.ops.len(),
                "Executing collection action"
            );
            for op in &action.ops {
                let (sql, params) = op.to_sql(dialect);
                tracing::trace!(sql = %sql, "Collection SQL");
                match conn.execute(cx, &sql, &params).await {
                    Outcome::Ok(_) => count += 1,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        Outcome::Ok(count)
    }
}
