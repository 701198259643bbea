//! Index Manager (C4). Standard and unique indexes, each a
//! `BTreeMap` keyed on a comparable scalar so range-seeded lookups ($gt/$gte/
//! $lt/$lte) work, with an ordered `Vec<String>` of ids per key for non-unique
//! indexes and the docs that share an (intentionally) collisionable key.

use crate::core::document::Doc;
use crate::core::errors::{Error, Result};
use crate::core::filter::{FieldCond, Op};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A scalar JSON value wrapped for `Ord`. Documents whose indexed field is
/// missing, null, or a non-scalar (array/object) are excluded from the index
/// entirely — they can never participate in an index-assisted lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl IndexKey {
    pub fn from_value(v: &Value) -> Option<IndexKey> {
        match v {
            Value::Number(n) => n.as_f64().map(IndexKey::Num),
            Value::String(s) => Some(IndexKey::Str(s.clone())),
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            _ => None,
        }
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Num(a), IndexKey::Num(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (IndexKey::Str(a), IndexKey::Str(b)) => a.cmp(b),
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            // Cross-type comparisons only matter for ordering within the map;
            // pick a stable arbitrary rank so the BTreeMap invariant holds.
            (IndexKey::Num(_), _) => Ordering::Less,
            (IndexKey::Bool(_), IndexKey::Num(_)) => Ordering::Greater,
            (IndexKey::Bool(_), _) => Ordering::Less,
            (IndexKey::Str(_), _) => Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Standard,
    Unique,
}

#[derive(Debug)]
pub struct Index {
    pub field: String,
    pub kind: IndexKind,
    entries: BTreeMap<IndexKey, Vec<String>>,
}

impl Index {
    fn new(field: String, kind: IndexKind) -> Index {
        Index {
            field,
            kind,
            entries: BTreeMap::new(),
        }
    }

    fn key_for(&self, doc: &Doc) -> Option<IndexKey> {
        doc.get(&self.field).and_then(IndexKey::from_value)
    }

    /// Returns the id already present, if this is a unique index and occupied.
    fn conflicting_id(&self, key: &IndexKey) -> Option<&str> {
        if self.kind != IndexKind::Unique {
            return None;
        }
        self.entries.get(key).and_then(|ids| ids.first()).map(|s| s.as_str())
    }

    fn insert(&mut self, doc: &Doc, id: &str) -> Result<()> {
        let key = match self.key_for(doc) {
            Some(k) => k,
            None => return Ok(()),
        };
        if let Some(existing) = self.conflicting_id(&key) {
            if existing != id {
                return Err(Error::UniqueConstraint {
                    field: self.field.clone(),
                    value: format!("{:?}", key),
                });
            }
        }
        let ids = self.entries.entry(key).or_default();
        if !ids.iter().any(|x| x == id) {
            ids.push(id.to_string());
        }
        Ok(())
    }

    fn remove(&mut self, doc: &Doc, id: &str) {
        if let Some(key) = self.key_for(doc) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.retain(|x| x != id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn find_eq(&self, value: &Value) -> Option<Vec<String>> {
        let key = IndexKey::from_value(value)?;
        self.entries.get(&key).cloned()
    }

    fn find_range(&self, cond: &FieldCond) -> Option<Vec<String>> {
        let ops = match cond {
            FieldCond::Ops(ops) => ops,
            FieldCond::Eq(v) => return self.find_eq(v),
        };

        let mut lower: Option<(IndexKey, bool)> = None; // (bound, inclusive)
        let mut upper: Option<(IndexKey, bool)> = None;
        let mut has_range_op = false;
        for op in ops {
            match op {
                Op::Gt(v) => {
                    lower = Some((IndexKey::from_value(v)?, false));
                    has_range_op = true;
                }
                Op::Gte(v) => {
                    lower = Some((IndexKey::from_value(v)?, true));
                    has_range_op = true;
                }
                Op::Lt(v) => {
                    upper = Some((IndexKey::from_value(v)?, false));
                    has_range_op = true;
                }
                Op::Lte(v) => {
                    upper = Some((IndexKey::from_value(v)?, true));
                    has_range_op = true;
                }
                // Any other operator present means the index alone can't answer
                // this condition fully; the caller still applies the full filter.
                _ => {}
            }
        }
        if !has_range_op {
            return None;
        }

        let mut out = Vec::new();
        for (k, ids) in self.entries.range(..) {
            if let Some((ref bound, inclusive)) = lower {
                match k.partial_cmp(bound) {
                    Some(Ordering::Less) => continue,
                    Some(Ordering::Equal) if !inclusive => continue,
                    None => continue,
                    _ => {}
                }
            }
            if let Some((ref bound, inclusive)) = upper {
                match k.partial_cmp(bound) {
                    Some(Ordering::Greater) => continue,
                    Some(Ordering::Equal) if !inclusive => continue,
                    None => continue,
                    _ => {}
                }
            }
            out.extend(ids.iter().cloned());
        }
        Some(out)
    }
}

/// Owns every index for one collection, keyed by field name.
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: std::collections::HashMap<String, Index>,
}

impl IndexManager {
    pub fn new() -> IndexManager {
        IndexManager {
            indexes: std::collections::HashMap::new(),
        }
    }

    pub fn has(&self, field: &str) -> bool {
        self.indexes.contains_key(field)
    }

    pub fn kind_of(&self, field: &str) -> Option<IndexKind> {
        self.indexes.get(field).map(|i| i.kind)
    }

    /// Idempotent: creating the same field/uniqueness pair again is a no-op.
    /// Creating it with a different uniqueness setting without dropping first
    /// is a conflict.
    pub fn create_index(&mut self, field: &str, unique: bool, docs: &std::collections::HashMap<String, Doc>) -> Result<()> {
        let kind = if unique { IndexKind::Unique } else { IndexKind::Standard };
        if let Some(existing) = self.indexes.get(field) {
            if existing.kind == kind {
                return Ok(());
            }
            return Err(Error::IndexUniquenessConflict {
                field: field.to_string(),
            });
        }

        let mut index = Index::new(field.to_string(), kind);
        for (id, doc) in docs {
            index.insert(doc, id)?;
        }
        self.indexes.insert(field.to_string(), index);
        Ok(())
    }

    pub fn drop_index(&mut self, field: &str) {
        self.indexes.remove(field);
    }

    pub fn after_insert(&mut self, doc: &Doc, id: &str) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.insert(doc, id)?;
        }
        Ok(())
    }

    pub fn after_remove(&mut self, doc: &Doc, id: &str) {
        for index in self.indexes.values_mut() {
            index.remove(doc, id);
        }
    }

    pub fn after_update(&mut self, old: &Doc, new: &Doc, id: &str) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.remove(old, id);
        }
        for index in self.indexes.values_mut() {
            index.insert(new, id)?;
        }
        Ok(())
    }

    pub fn rebuild_from_data(&mut self, docs: &std::collections::HashMap<String, Doc>) -> Result<()> {
        for index in self.indexes.values_mut() {
            *index = Index::new(index.field.clone(), index.kind);
        }
        for (id, doc) in docs {
            for index in self.indexes.values_mut() {
                index.insert(doc, id)?;
            }
        }
        Ok(())
    }

    pub fn find_one_id_by_eq(&self, field: &str, value: &Value) -> Option<String> {
        self.indexes.get(field).and_then(|i| i.find_eq(value)).and_then(|ids| ids.into_iter().next())
    }

    pub fn find_ids_by_eq(&self, field: &str, value: &Value) -> Option<Vec<String>> {
        self.indexes.get(field).and_then(|i| i.find_eq(value))
    }

    pub fn find_ids_by_cond(&self, field: &str, cond: &FieldCond) -> Option<Vec<String>> {
        self.indexes.get(field).and_then(|i| i.find_range(cond))
    }

    /// Fields carrying a unique index, for batch-insert dedupe (the
    /// `insertMany` pre-check, which must also catch collisions within the batch).
    pub fn unique_fields(&self) -> Vec<String> {
        self.indexes
            .values()
            .filter(|i| i.kind == IndexKind::Unique)
            .map(|i| i.field.clone())
            .collect()
    }

    /// Dry-run uniqueness check for a document that doesn't exist yet under any
    /// id: any live occupant of the indexed value is necessarily a conflict.
    /// Used ahead of WAL append so a rejected insert never reaches the log.
    pub fn check_new(&self, doc: &Doc) -> Result<()> {
        for index in self.indexes.values() {
            if index.kind != IndexKind::Unique {
                continue;
            }
            if let Some(key) = index.key_for(doc) {
                if index.entries.contains_key(&key) {
                    return Err(Error::UniqueConstraint {
                        field: index.field.clone(),
                        value: format!("{:?}", key),
                    });
                }
            }
        }
        Ok(())
    }

    /// `(field, is_unique)` for every index, sorted by field name, for
    /// `getIndexes()`/`stats()`.
    pub fn list(&self) -> Vec<(String, bool)> {
        let mut out: Vec<(String, bool)> = self
            .indexes
            .values()
            .map(|i| (i.field.clone(), i.kind == IndexKind::Unique))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
