//! LC-004: Persistent parameter store on SQLite.
//!
//! Holds groups, group dependency edges, parameters, and parameterized
//! exchanges. Every mutation runs in one transaction; amounts are written
//! together with the group's freshness flip, so a reader never sees a
//! partially committed batch.
//!
//! Expiring a group also expires every group that transitively depends on it.
//! Committing recomputed amounts marks the group's exchanges pending; the flag
//! clears only once those exchanges have been written to the content graph.

use super::error::{EngineError, Result};
use super::formula::{self, Formula};
use super::types::*;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info, warn};

/// Default number of rows per bulk insert statement.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    id    INTEGER PRIMARY KEY,
    name  TEXT NOT NULL UNIQUE,
    kind  TEXT NOT NULL,
    fresh INTEGER NOT NULL DEFAULT 0,
    exchanges_pending INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS group_dependencies (
    dependent INTEGER NOT NULL REFERENCES groups(id),
    dependee  INTEGER NOT NULL REFERENCES groups(id),
    PRIMARY KEY (dependent, dependee)
);
CREATE TABLE IF NOT EXISTS parameters (
    id       INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL REFERENCES groups(id),
    name     TEXT NOT NULL,
    formula  TEXT,
    amount   REAL NOT NULL DEFAULT 0,
    data     TEXT NOT NULL DEFAULT '{}',
    UNIQUE (group_id, name)
);
CREATE TABLE IF NOT EXISTS parameterized_exchanges (
    id       INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL REFERENCES groups(id),
    exchange INTEGER NOT NULL UNIQUE,
    formula  TEXT NOT NULL
);
"#;

const PARAMETER_COLUMNS: &str =
    "p.id, g.name, p.name, p.formula, p.amount, p.data FROM parameters p JOIN groups g ON g.id = p.group_id";

/// SQLite-backed store. One logical writer at a time.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    chunk_size: usize,
}

impl Store {
    /// Open (or create) a store file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Set the bulk-insert chunk size (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Fetch a group by name, creating it (expired) if absent.
    pub fn get_or_create_group(&mut self, name: &str, kind: GroupKind) -> Result<Group> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        // Only the reserved name may be a project group
        if kind == GroupKind::Project && name != PROJECT_GROUP {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        if kind != GroupKind::Project && name == PROJECT_GROUP {
            return Err(EngineError::KindMismatch {
                group: name.to_string(),
                existing: GroupKind::Project.to_string(),
                requested: kind.to_string(),
            });
        }
        if let Some(group) = query_group(&self.conn, name)? {
            if group.kind != kind {
                return Err(EngineError::KindMismatch {
                    group: name.to_string(),
                    existing: group.kind.to_string(),
                    requested: kind.to_string(),
                });
            }
            return Ok(group);
        }
        self.conn.execute(
            "INSERT INTO groups (name, kind, fresh) VALUES (?1, ?2, 0)",
            params![name, kind.as_str()],
        )?;
        debug!(group = name, %kind, "group created");
        require_group(&self.conn, name)
    }

    /// The project-wide group.
    pub fn project_group(&mut self) -> Result<Group> {
        self.get_or_create_group(PROJECT_GROUP, GroupKind::Project)
    }

    /// Group for a named dataset; depends on the project group.
    pub fn database_group(&mut self, database: &str) -> Result<Group> {
        self.project_group()?;
        let group = self.get_or_create_group(database, GroupKind::Database)?;
        self.add_dependency(database, PROJECT_GROUP)?;
        self.require_group(&group.name)
    }

    /// Group for a named process; depends on its dataset's group.
    pub fn activity_group(&mut self, name: &str, database: &str) -> Result<Group> {
        self.database_group(database)?;
        self.get_or_create_group(name, GroupKind::Activity)?;
        self.add_dependency(name, database)?;
        self.require_group(name)
    }

    /// Group fed by an outside caller; depends on `parent` (default: project).
    pub fn external_group(&mut self, name: &str, parent: Option<&str>) -> Result<Group> {
        let parent = match parent {
            Some(p) => p.to_string(),
            None => self.project_group()?.name,
        };
        self.require_group(&parent)?;
        self.get_or_create_group(name, GroupKind::ExternalInput)?;
        self.add_dependency(name, &parent)?;
        self.require_group(name)
    }

    pub fn group(&self, name: &str) -> Result<Option<Group>> {
        query_group(&self.conn, name)
    }

    /// Fetch a group or fail with `UnknownGroup`.
    pub fn require_group(&self, name: &str) -> Result<Group> {
        require_group(&self.conn, name)
    }

    /// All groups in creation order.
    pub fn groups(&self) -> Result<Vec<Group>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, kind, fresh FROM groups ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, name, kind, fresh)| {
                Ok(Group {
                    id,
                    name,
                    kind: kind.parse()?,
                    fresh,
                })
            })
            .collect()
    }

    pub fn is_fresh(&self, name: &str) -> Result<bool> {
        Ok(self.require_group(name)?.fresh)
    }

    /// Mark a group and all its transitive dependents expired.
    pub fn expire(&mut self, name: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        expire_cascade(&tx, name)?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a single group fresh. Refused while any dependee is expired.
    pub fn freshen(&mut self, name: &str) -> Result<()> {
        let group = self.require_group(name)?;
        for dependee in self.dependees(name)? {
            if !self.is_fresh(&dependee)? {
                return Err(EngineError::StaleDependee {
                    group: name.to_string(),
                    dependee,
                });
            }
        }
        self.conn
            .execute("UPDATE groups SET fresh = 1 WHERE id = ?1", params![group.id])?;
        Ok(())
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    /// Record that `dependent` reads values from `dependee`.
    pub fn add_dependency(&mut self, dependent: &str, dependee: &str) -> Result<()> {
        let from = self.require_group(dependent)?;
        let to = self.require_group(dependee)?;
        if !from.kind.may_depend_on(to.kind) {
            return Err(EngineError::InvalidDependency {
                dependent: dependent.to_string(),
                dependee: dependee.to_string(),
                reason: format!("{} group cannot depend on {} group", from.kind, to.kind),
            });
        }
        if from.id == to.id {
            return Err(EngineError::DependencyCycle(vec![dependent.to_string()]));
        }

        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM group_dependencies WHERE dependent = ?1 AND dependee = ?2",
                params![from.id, to.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(());
        }

        let upstream = transitive(&self.conn, dependee, direct_dependees)?;
        if upstream.contains(dependent) {
            let downstream = transitive(&self.conn, dependent, direct_dependents)?;
            let mut members: Vec<String> = upstream.intersection(&downstream).cloned().collect();
            members.push(dependent.to_string());
            members.push(dependee.to_string());
            members.sort();
            members.dedup();
            return Err(EngineError::DependencyCycle(members));
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO group_dependencies (dependent, dependee) VALUES (?1, ?2)",
            params![from.id, to.id],
        )?;
        expire_cascade(&tx, dependent)?;
        tx.commit()?;
        debug!(dependent, dependee, "group dependency added");
        Ok(())
    }

    /// Every dependency edge.
    pub fn dependencies(&self) -> Result<Vec<GroupDependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.name, b.name FROM group_dependencies d
             JOIN groups a ON a.id = d.dependent
             JOIN groups b ON b.id = d.dependee
             ORDER BY a.name, b.name",
        )?;
        let edges = stmt
            .query_map([], |row| {
                Ok(GroupDependency {
                    dependent: row.get(0)?,
                    dependee: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Groups `name` reads from directly.
    pub fn dependees(&self, name: &str) -> Result<Vec<String>> {
        direct_dependees(&self.conn, name)
    }

    /// Groups reading from `name` directly.
    pub fn dependents(&self, name: &str) -> Result<Vec<String>> {
        direct_dependents(&self.conn, name)
    }

    /// Every group that reads from `name`, directly or through other groups.
    pub fn transitive_dependents(&self, name: &str) -> Result<BTreeSet<String>> {
        transitive(&self.conn, name, direct_dependents)
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    /// Parameters of a group in insertion order.
    pub fn parameters(&self, group: &str) -> Result<Vec<Parameter>> {
        self.require_group(group)?;
        read_parameters(
            &self.conn,
            &format!("SELECT {} WHERE g.name = ?1 ORDER BY p.id", PARAMETER_COLUMNS),
            params![group],
        )
    }

    pub fn parameter(&self, group: &str, name: &str) -> Result<Option<Parameter>> {
        Ok(read_parameters(
            &self.conn,
            &format!("SELECT {} WHERE g.name = ?1 AND p.name = ?2", PARAMETER_COLUMNS),
            params![group, name],
        )?
        .into_iter()
        .next())
    }

    /// Every parameter in the store.
    pub fn all_parameters(&self) -> Result<Vec<Parameter>> {
        read_parameters(
            &self.conn,
            &format!("SELECT {} ORDER BY g.id, p.id", PARAMETER_COLUMNS),
            [],
        )
    }

    /// `{name: parameter}` for a group.
    pub fn load(&self, group: &str) -> Result<indexmap::IndexMap<String, Parameter>> {
        Ok(self
            .parameters(group)?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect())
    }

    /// `{name: amount}` for a group, optionally restricted to `only`.
    pub fn static_amounts(&self, group: &str, only: Option<&BTreeSet<String>>) -> Result<Amounts> {
        Ok(self
            .parameters(group)?
            .into_iter()
            .filter(|p| only.is_none_or(|names| names.contains(&p.name)))
            .map(|p| (p.name, p.amount))
            .collect())
    }

    /// Replace a batch of parameters in `group` atomically, then expire it.
    ///
    /// Fails before touching the store on repeated names, invalid names or
    /// formulas, and (without `overwrite`) on names already present. On a
    /// storage failure nothing from the batch is visible and the group is
    /// left expired.
    pub fn bulk_replace(
        &mut self,
        group: &str,
        records: Vec<ParameterRecord>,
        overwrite: bool,
    ) -> Result<usize> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for record in &records {
            *seen.entry(record.name.as_str()).or_default() += 1;
        }
        let mut duplicates: Vec<String> = seen
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(name, _)| name.to_string())
            .collect();
        if !duplicates.is_empty() {
            duplicates.sort();
            return Err(EngineError::DuplicateName(duplicates));
        }

        let target = self.require_group(group)?;
        for record in &records {
            if !formula::is_valid_parameter_name(&record.name) {
                return Err(EngineError::InvalidName(record.name.clone()));
            }
            if let Some(ref f) = record.formula {
                Formula::parse(f)?;
            }
        }

        if !overwrite {
            let existing: BTreeSet<String> =
                self.parameters(group)?.into_iter().map(|p| p.name).collect();
            let clashes: Vec<String> = records
                .iter()
                .filter(|r| existing.contains(&r.name))
                .map(|r| r.name.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if !clashes.is_empty() {
                return Err(EngineError::NameExists(clashes));
            }
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            rows.push([
                Value::Integer(target.id),
                Value::Text(record.name.clone()),
                record
                    .formula
                    .clone()
                    .map_or(Value::Null, Value::Text),
                Value::Real(record.amount.unwrap_or(0.0)),
                Value::Text(encode_extra(&record.data)?),
            ]);
        }

        let outcome = self.write_batch(group, target.id, &records, &rows);
        match outcome {
            Ok(()) => {
                info!(group, count = records.len(), "parameters ingested");
                Ok(records.len())
            }
            Err(e) => {
                warn!(group, error = %e, "bulk ingestion rolled back");
                if let Err(expire_err) = self.expire(group) {
                    warn!(group, error = %expire_err, "could not expire group after rollback");
                }
                Err(e)
            }
        }
    }

    fn write_batch(
        &mut self,
        group: &str,
        group_id: i64,
        records: &[ParameterRecord],
        rows: &[[Value; 5]],
    ) -> Result<()> {
        let chunk_size = self.chunk_size;
        let tx = self.conn.transaction()?;
        {
            let mut delete =
                tx.prepare("DELETE FROM parameters WHERE group_id = ?1 AND name = ?2")?;
            for record in records {
                delete.execute(params![group_id, record.name])?;
            }
        }
        for (idx, chunk) in rows.chunks(chunk_size).enumerate() {
            let placeholders = vec!["(?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO parameters (group_id, name, formula, amount, data) VALUES {}",
                placeholders
            );
            tx.execute(&sql, params_from_iter(chunk.iter().flatten()))?;
            debug!(group, chunk = idx, rows = chunk.len(), "chunk inserted");
        }
        expire_cascade(&tx, group)?;
        tx.commit()?;
        Ok(())
    }

    /// Write recomputed amounts and freshen the group in one transaction.
    pub fn update_amounts(&mut self, group: &str, amounts: &Amounts) -> Result<()> {
        let target = self.require_group(group)?;
        let tx = self.conn.transaction()?;
        {
            let mut update = tx
                .prepare("UPDATE parameters SET amount = ?1 WHERE group_id = ?2 AND name = ?3")?;
            for (name, amount) in amounts {
                if update.execute(params![amount, target.id, name])? == 0 {
                    return Err(EngineError::UnknownParameter {
                        group: group.to_string(),
                        name: name.clone(),
                    });
                }
            }
        }
        tx.execute(
            "UPDATE groups SET fresh = 1, exchanges_pending = 1 WHERE id = ?1",
            params![target.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fresh groups whose recomputed amounts have not reached the content graph yet.
    pub fn exchanges_pending(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM groups WHERE fresh = 1 AND exchanges_pending = 1")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(names)
    }

    /// Record that a group's exchanges have been written.
    pub fn clear_exchanges_pending(&mut self, name: &str) -> Result<()> {
        let group = self.require_group(name)?;
        self.conn.execute(
            "UPDATE groups SET exchanges_pending = 0 WHERE id = ?1",
            params![group.id],
        )?;
        Ok(())
    }

    /// Set literal amounts, creating missing parameters, then expire the group.
    ///
    /// Refuses to overwrite a parameter whose amount comes from a formula.
    pub fn upsert_amounts(&mut self, group: &str, amounts: &Amounts) -> Result<()> {
        let target = self.require_group(group)?;
        let tx = self.conn.transaction()?;
        for (name, amount) in amounts {
            let current: Option<Option<String>> = tx
                .query_row(
                    "SELECT formula FROM parameters WHERE group_id = ?1 AND name = ?2",
                    params![target.id, name],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(Some(_)) => {
                    return Err(EngineError::DerivedParameter {
                        group: group.to_string(),
                        name: name.clone(),
                    })
                }
                Some(None) => {
                    tx.execute(
                        "UPDATE parameters SET amount = ?1 WHERE group_id = ?2 AND name = ?3",
                        params![amount, target.id, name],
                    )?;
                }
                None => {
                    if !formula::is_valid_parameter_name(name) {
                        return Err(EngineError::InvalidName(name.clone()));
                    }
                    tx.execute(
                        "INSERT INTO parameters (group_id, name, amount) VALUES (?1, ?2, ?3)",
                        params![target.id, name, amount],
                    )?;
                }
            }
        }
        expire_cascade(&tx, group)?;
        tx.commit()?;
        Ok(())
    }

    /// Replace a parameter's formula (`None` makes it a literal), then expire.
    pub fn set_formula(&mut self, group: &str, name: &str, formula: Option<&str>) -> Result<()> {
        if let Some(f) = formula {
            Formula::parse(f)?;
        }
        let target = self.require_group(group)?;
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE parameters SET formula = ?1 WHERE group_id = ?2 AND name = ?3",
            params![formula, target.id, name],
        )?;
        if changed == 0 {
            return Err(EngineError::UnknownParameter {
                group: group.to_string(),
                name: name.to_string(),
            });
        }
        expire_cascade(&tx, group)?;
        tx.commit()?;
        Ok(())
    }

    /// Set one literal amount on an existing parameter, then expire.
    pub fn set_amount(&mut self, group: &str, name: &str, amount: f64) -> Result<()> {
        let target = self.require_group(group)?;
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE parameters SET amount = ?1 WHERE group_id = ?2 AND name = ?3",
            params![amount, target.id, name],
        )?;
        if changed == 0 {
            return Err(EngineError::UnknownParameter {
                group: group.to_string(),
                name: name.to_string(),
            });
        }
        expire_cascade(&tx, group)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every parameter of a group, then expire it.
    pub fn clear_group(&mut self, group: &str) -> Result<usize> {
        let target = self.require_group(group)?;
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM parameters WHERE group_id = ?1", params![target.id])?;
        expire_cascade(&tx, group)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Rewrite every formula that references `old` as a whole symbol so it
    /// references `new`, restricted to groups accepted by `predicate`.
    /// Returns the affected groups, which are expired.
    pub fn rewrite_formulas<F>(&mut self, old: &str, new: &str, predicate: F) -> Result<Vec<String>>
    where
        F: Fn(&Group) -> bool,
    {
        let tx = self.conn.transaction()?;
        let affected = rewrite_formulas_in(&tx, old, new, &predicate)?;
        tx.commit()?;
        Ok(affected)
    }

    // ========================================================================
    // Parameterized exchanges
    // ========================================================================

    /// Bind an exchange amount to a formula evaluated in `group`, then expire it.
    pub fn add_parameterized_exchange(
        &mut self,
        group: &str,
        exchange: ExchangeRef,
        formula: &str,
    ) -> Result<()> {
        self.replace_exchanges(group, &[exchange], &[(exchange, formula.to_string())])
    }

    /// Drop bindings for `remove` and insert `add`, in one transaction.
    pub fn replace_exchanges(
        &mut self,
        group: &str,
        remove: &[ExchangeRef],
        add: &[(ExchangeRef, String)],
    ) -> Result<()> {
        for (_, f) in add {
            Formula::parse(f)?;
        }
        let target = self.require_group(group)?;
        let tx = self.conn.transaction()?;
        {
            let mut delete =
                tx.prepare("DELETE FROM parameterized_exchanges WHERE exchange = ?1")?;
            for exchange in remove.iter().chain(add.iter().map(|(e, _)| e)) {
                delete.execute(params![exchange.0])?;
            }
            let mut insert = tx.prepare(
                "INSERT INTO parameterized_exchanges (group_id, exchange, formula) VALUES (?1, ?2, ?3)",
            )?;
            for (exchange, f) in add {
                insert.execute(params![target.id, exchange.0, f])?;
            }
        }
        expire_cascade(&tx, group)?;
        tx.commit()?;
        Ok(())
    }

    pub fn parameterized_exchanges(&self, group: &str) -> Result<Vec<ParameterizedExchange>> {
        self.require_group(group)?;
        read_exchanges(
            &self.conn,
            "SELECT x.id, g.name, x.exchange, x.formula FROM parameterized_exchanges x
             JOIN groups g ON g.id = x.group_id WHERE g.name = ?1 ORDER BY x.exchange",
            params![group],
        )
    }

    pub fn all_parameterized_exchanges(&self) -> Result<Vec<ParameterizedExchange>> {
        read_exchanges(
            &self.conn,
            "SELECT x.id, g.name, x.exchange, x.formula FROM parameterized_exchanges x
             JOIN groups g ON g.id = x.group_id ORDER BY g.id, x.exchange",
            [],
        )
    }
}

// ============================================================================
// Connection-level helpers (usable inside a caller's transaction)
// ============================================================================

pub(crate) fn query_group(conn: &Connection, name: &str) -> Result<Option<Group>> {
    let row = conn
        .query_row(
            "SELECT id, name, kind, fresh FROM groups WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(id, name, kind, fresh)| {
        Ok(Group {
            id,
            name,
            kind: kind.parse()?,
            fresh,
        })
    })
    .transpose()
}

pub(crate) fn require_group(conn: &Connection, name: &str) -> Result<Group> {
    query_group(conn, name)?.ok_or_else(|| EngineError::UnknownGroup(name.to_string()))
}

fn direct_dependees(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT b.name FROM group_dependencies d
         JOIN groups a ON a.id = d.dependent
         JOIN groups b ON b.id = d.dependee
         WHERE a.name = ?1 ORDER BY b.name",
    )?;
    let names = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

fn direct_dependents(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT a.name FROM group_dependencies d
         JOIN groups a ON a.id = d.dependent
         JOIN groups b ON b.id = d.dependee
         WHERE b.name = ?1 ORDER BY a.name",
    )?;
    let names = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

/// Breadth-first closure over `step`, excluding `start` itself.
fn transitive(
    conn: &Connection,
    start: &str,
    step: fn(&Connection, &str) -> Result<Vec<String>>,
) -> Result<BTreeSet<String>> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        for next in step(conn, &current)? {
            if next != start && seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    Ok(seen)
}

/// Expire `name` and every transitive dependent. Returns the groups touched.
pub(crate) fn expire_cascade(conn: &Connection, name: &str) -> Result<Vec<String>> {
    require_group(conn, name)?;
    let mut touched = vec![name.to_string()];
    touched.extend(transitive(conn, name, direct_dependents)?);
    let mut stmt = conn.prepare("UPDATE groups SET fresh = 0 WHERE name = ?1")?;
    for group in &touched {
        stmt.execute(params![group])?;
    }
    debug!(group = name, cascade = touched.len() - 1, "group expired");
    Ok(touched)
}

pub(crate) fn rename_parameter_in(
    conn: &Connection,
    group: &str,
    old: &str,
    new: &str,
) -> Result<()> {
    let target = require_group(conn, group)?;
    let changed = conn.execute(
        "UPDATE parameters SET name = ?1 WHERE group_id = ?2 AND name = ?3",
        params![new, target.id, old],
    )?;
    if changed == 0 {
        return Err(EngineError::UnknownParameter {
            group: group.to_string(),
            name: old.to_string(),
        });
    }
    expire_cascade(conn, group)?;
    Ok(())
}

pub(crate) fn delete_parameter_in(conn: &Connection, group: &str, name: &str) -> Result<()> {
    let target = require_group(conn, group)?;
    let changed = conn.execute(
        "DELETE FROM parameters WHERE group_id = ?1 AND name = ?2",
        params![target.id, name],
    )?;
    if changed == 0 {
        return Err(EngineError::UnknownParameter {
            group: group.to_string(),
            name: name.to_string(),
        });
    }
    expire_cascade(conn, group)?;
    Ok(())
}

pub(crate) fn rewrite_formulas_in(
    conn: &Connection,
    old: &str,
    new: &str,
    predicate: &dyn Fn(&Group) -> bool,
) -> Result<Vec<String>> {
    let mut affected = BTreeSet::new();

    let candidates = read_parameters(
        conn,
        &format!(
            "SELECT {} WHERE p.formula IS NOT NULL AND instr(p.formula, ?1) > 0",
            PARAMETER_COLUMNS
        ),
        params![old],
    )?;
    for param in candidates {
        let Some(ref source) = param.formula else {
            continue;
        };
        if !formula::references(source, old)? {
            continue;
        }
        let group = require_group(conn, &param.group)?;
        if !predicate(&group) {
            continue;
        }
        let rewritten = formula::rename_symbol(source, old, new)?;
        conn.execute(
            "UPDATE parameters SET formula = ?1 WHERE id = ?2",
            params![rewritten, param.id],
        )?;
        affected.insert(param.group);
    }

    let exchanges = read_exchanges(
        conn,
        "SELECT x.id, g.name, x.exchange, x.formula FROM parameterized_exchanges x
         JOIN groups g ON g.id = x.group_id WHERE instr(x.formula, ?1) > 0",
        params![old],
    )?;
    for binding in exchanges {
        if !formula::references(&binding.formula, old)? {
            continue;
        }
        let group = require_group(conn, &binding.group)?;
        if !predicate(&group) {
            continue;
        }
        let rewritten = formula::rename_symbol(&binding.formula, old, new)?;
        conn.execute(
            "UPDATE parameterized_exchanges SET formula = ?1 WHERE id = ?2",
            params![rewritten, binding.id],
        )?;
        affected.insert(binding.group);
    }

    for group in &affected {
        expire_cascade(conn, group)?;
    }
    debug!(old, new, groups = affected.len(), "formulas rewritten");
    Ok(affected.into_iter().collect())
}

fn read_parameters<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Parameter>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, group, name, formula, amount, data)| {
            Ok(Parameter {
                id,
                group,
                name,
                formula,
                amount,
                data: decode_extra(&data)?,
            })
        })
        .collect()
}

fn read_exchanges<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ParameterizedExchange>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(ParameterizedExchange {
                id: row.get(0)?,
                group: row.get(1)?,
                exchange: ExchangeRef(row.get(2)?),
                formula: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
