// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog entries and the vocabulary used to route them.
//!
//! A raw MongoDB oplog document looks like:
//!
//! ```text
//! { ts: Timestamp(1700000000, 1), op: "i", ns: "db1.foo", o: { _id: 1, x: 1 } }
//! { ts: ..., op: "u", ns: "db1.foo", o: { $set: { x: 2 } }, o2: { _id: 1 } }
//! { ts: ..., op: "d", ns: "db1.foo", o: { _id: 1 } }
//! ```
//!
//! Only `i`, `u` and `d` entries become [`LogEntry`] values. No-ops (`n`) and
//! commands (`c`) are recognised so the reader can advance past them, but
//! never dispatched.
//!
//! # Update Diffs
//!
//! Servers from 5.0 on record updates as `{ $v: 2, diff: { ... } }`. The
//! diff is rewritten into `$set` / `$unset` modifiers with dotted paths so
//! that destinations and the origin-tag logic only ever see classic update
//! documents. Array resizes (`l`) cannot be expressed that way and are
//! reported as parse errors.

use crate::checkpoint::Checkpoint;
use crate::error::{ReplicationError, Result};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of write recorded in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub const ALL: [OpKind; 3] = [OpKind::Insert, OpKind::Update, OpKind::Delete];

    /// Parse an oplog `op` code.
    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'i' => Some(OpKind::Insert),
            'u' => Some(OpKind::Update),
            'd' => Some(OpKind::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> char {
        match self {
            OpKind::Insert => 'i',
            OpKind::Update => 'u',
            OpKind::Delete => 'd',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            OpKind::Insert => 0b001,
            OpKind::Update => 0b010,
            OpKind::Delete => 0b100,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-empty set of operation kinds, written as a code string like `"iud"`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpSet(u8);

impl OpSet {
    /// Inserts, updates and deletes.
    pub const ALL: OpSet = OpSet(0b111);

    /// Parse a code string. Order and repetition don't matter.
    pub fn parse(codes: &str) -> Result<Self> {
        let mut bits = 0u8;
        for c in codes.chars() {
            let op = OpKind::from_code(c).ok_or_else(|| {
                ReplicationError::Config(format!(
                    "unknown operation code '{}' in '{}' (expected i, u or d)",
                    c, codes
                ))
            })?;
            bits |= op.bit();
        }
        if bits == 0 {
            return Err(ReplicationError::Config(
                "operation set must not be empty".to_string(),
            ));
        }
        Ok(OpSet(bits))
    }

    pub fn only(op: OpKind) -> Self {
        OpSet(op.bit())
    }

    pub fn contains(&self, op: OpKind) -> bool {
        self.0 & op.bit() != 0
    }

    /// Members in `i`, `u`, `d` order.
    pub fn iter(&self) -> impl Iterator<Item = OpKind> + '_ {
        OpKind::ALL.into_iter().filter(move |op| self.contains(*op))
    }
}

impl Default for OpSet {
    fn default() -> Self {
        OpSet::ALL
    }
}

impl fmt::Display for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in self.iter() {
            write!(f, "{}", op.code())?;
        }
        Ok(())
    }
}

impl fmt::Debug for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpSet({})", self)
    }
}

impl TryFrom<String> for OpSet {
    type Error = ReplicationError;

    fn try_from(s: String) -> Result<Self> {
        OpSet::parse(&s)
    }
}

impl From<OpSet> for String {
    fn from(ops: OpSet) -> String {
        ops.to_string()
    }
}

/// A `database.collection` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Parse `"db.collection"`. The collection part may itself contain dots.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                database: db.to_string(),
                collection: coll.to_string(),
            }),
            _ => Err(ReplicationError::Config(format!(
                "invalid namespace '{}': expected <database>.<collection>",
                s
            ))),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl TryFrom<String> for Namespace {
    type Error = ReplicationError;

    fn try_from(s: String) -> Result<Self> {
        Namespace::parse(&s)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> String {
        ns.to_string()
    }
}

/// One write read from a source oplog.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Position of this entry in the source oplog.
    pub position: Checkpoint,
    pub op: OpKind,
    pub namespace: Namespace,
    /// Inserted document, update document, or delete match spec.
    pub document: Document,
    /// Match spec of an update (`o2`).
    pub match_spec: Option<Document>,
    /// Whether an update was an upsert (`b`).
    pub upsert: bool,
}

impl LogEntry {
    pub fn insert(position: Checkpoint, namespace: Namespace, document: Document) -> Self {
        Self {
            position,
            op: OpKind::Insert,
            namespace,
            document,
            match_spec: None,
            upsert: false,
        }
    }

    pub fn update(
        position: Checkpoint,
        namespace: Namespace,
        match_spec: Document,
        update: Document,
        upsert: bool,
    ) -> Self {
        Self {
            position,
            op: OpKind::Update,
            namespace,
            document: update,
            match_spec: Some(match_spec),
            upsert,
        }
    }

    pub fn delete(position: Checkpoint, namespace: Namespace, match_spec: Document) -> Self {
        Self {
            position,
            op: OpKind::Delete,
            namespace,
            document: match_spec,
            match_spec: None,
            upsert: false,
        }
    }

    /// Parse a raw oplog document.
    ///
    /// Returns `Ok(None)` for entries that are not inserts, updates or deletes.
    pub fn from_oplog(raw: &Document) -> Result<Option<Self>> {
        let position = oplog_position(raw)?;
        let code = raw
            .get_str("op")
            .map_err(|_| ReplicationError::EntryParse("missing field: op".to_string()))?;

        let Some(op) = single_op_code(code) else {
            return Ok(None);
        };

        let ns = raw
            .get_str("ns")
            .map_err(|_| ReplicationError::EntryParse("missing field: ns".to_string()))?;
        let namespace = Namespace::parse(ns)
            .map_err(|_| ReplicationError::EntryParse(format!("invalid ns '{}'", ns)))?;
        let document = raw
            .get_document("o")
            .map_err(|_| ReplicationError::EntryParse("missing field: o".to_string()))?
            .clone();

        let entry = match op {
            OpKind::Insert => LogEntry::insert(position, namespace, document),
            OpKind::Delete => LogEntry::delete(position, namespace, document),
            OpKind::Update => {
                let match_spec = raw
                    .get_document("o2")
                    .map_err(|_| {
                        ReplicationError::EntryParse("update without field: o2".to_string())
                    })?
                    .clone();
                let upsert = raw.get_bool("b").unwrap_or(false);
                LogEntry::update(position, namespace, match_spec, normalize_update(document)?, upsert)
            }
        };
        Ok(Some(entry))
    }
}

/// An insert, update or delete in the oplog that could not be turned into a
/// [`LogEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnparsedEntry {
    pub position: Checkpoint,
    /// `None` when the entry's `ns` is missing or invalid.
    pub namespace: Option<Namespace>,
    pub op: Option<OpKind>,
    pub reason: String,
}

impl UnparsedEntry {
    /// Salvage what can be read from a raw entry that failed to parse.
    pub fn from_raw(raw: &Document, position: Checkpoint, error: ReplicationError) -> Self {
        let reason = match error {
            ReplicationError::EntryParse(message) => message,
            other => other.to_string(),
        };
        Self {
            position,
            namespace: raw.get_str("ns").ok().and_then(|ns| Namespace::parse(ns).ok()),
            op: raw.get_str("op").ok().and_then(single_op_code),
            reason,
        }
    }
}

fn single_op_code(code: &str) -> Option<OpKind> {
    let mut chars = code.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => OpKind::from_code(c),
        _ => None,
    }
}

/// Read the `ts` field of a raw oplog document.
pub fn oplog_position(raw: &Document) -> Result<Checkpoint> {
    raw.get_timestamp("ts")
        .map(Checkpoint::from)
        .map_err(|_| ReplicationError::EntryParse("missing field: ts".to_string()))
}

/// Rewrite a logged update into classic form.
///
/// `$v: 2` diffs become `$set` / `$unset`; a leftover `$v` marker on
/// modifier updates is dropped; replacements pass through.
pub fn normalize_update(mut update: Document) -> Result<Document> {
    let version = match update.get("$v") {
        Some(Bson::Int32(v)) => Some(i64::from(*v)),
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Double(v)) => Some(*v as i64),
        _ => None,
    };

    match version {
        Some(2) => {
            let diff = update.get_document("diff").map_err(|_| {
                ReplicationError::EntryParse("$v:2 update without diff".to_string())
            })?;
            let mut set = Document::new();
            let mut unset = Document::new();
            diff_to_modifiers(diff, "", &mut set, &mut unset)?;

            let mut out = Document::new();
            if !set.is_empty() || unset.is_empty() {
                out.insert("$set", set);
            }
            if !unset.is_empty() {
                out.insert("$unset", unset);
            }
            Ok(out)
        }
        Some(_) => {
            update.remove("$v");
            Ok(update)
        }
        None => Ok(update),
    }
}

fn diff_to_modifiers(
    diff: &Document,
    prefix: &str,
    set: &mut Document,
    unset: &mut Document,
) -> Result<()> {
    let sub_doc = |v: &Bson, key: &str| -> Result<Document> {
        match v {
            Bson::Document(d) => Ok(d.clone()),
            _ => Err(ReplicationError::EntryParse(format!(
                "diff field '{}' is not a document",
                key
            ))),
        }
    };

    let is_array_diff = matches!(diff.get("a"), Some(Bson::Boolean(true)));

    for (key, value) in diff {
        if is_array_diff {
            match key.as_str() {
                "a" => continue,
                "l" => {
                    return Err(ReplicationError::EntryParse(format!(
                        "array resize at '{}' cannot be replicated as $set",
                        prefix.trim_end_matches('.')
                    )))
                }
                _ => {}
            }
            let (kind, index) = key.split_at(1);
            if index.parse::<usize>().is_err() {
                return Err(ReplicationError::EntryParse(format!(
                    "unexpected array diff key '{}'",
                    key
                )));
            }
            match kind {
                "u" => {
                    set.insert(format!("{}{}", prefix, index), value.clone());
                }
                "s" => {
                    let nested = sub_doc(value, key)?;
                    diff_to_modifiers(&nested, &format!("{}{}.", prefix, index), set, unset)?;
                }
                _ => {
                    return Err(ReplicationError::EntryParse(format!(
                        "unexpected array diff key '{}'",
                        key
                    )))
                }
            }
            continue;
        }

        match key.as_str() {
            "u" | "i" => {
                for (field, v) in sub_doc(value, key)? {
                    set.insert(format!("{}{}", prefix, field), v);
                }
            }
            "d" => {
                for (field, _) in sub_doc(value, key)? {
                    unset.insert(format!("{}{}", prefix, field), Bson::Int32(1));
                }
            }
            k if k.len() > 1 && k.starts_with('s') => {
                let nested = sub_doc(value, key)?;
                diff_to_modifiers(&nested, &format!("{}{}.", prefix, &k[1..]), set, unset)?;
            }
            other => {
                return Err(ReplicationError::EntryParse(format!(
                    "unexpected diff key '{}'",
                    other
                )))
            }
        }
    }
    Ok(())
}
