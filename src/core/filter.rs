//! The declarative filter language. Ad-hoc filter objects become a tagged
//! sum type: `Filter = Eq(v) | Op(map) | And([Filter]) | Or([Filter])`.

use crate::core::document::Doc;
use crate::core::errors::*;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum FieldCond {
    Eq(Value),
    Ops(Vec<Op>),
}

#[derive(Debug, Clone)]
pub enum Op {
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex { pattern: String, options: Option<String> },
    /// An operator this engine doesn't recognize. Unknown operators make the
    /// record not match — they never raise.
    Unknown,
}

#[derive(Debug, Clone)]
pub enum Filter {
    /// A conjunction of top-level filter entries (including `$and`/`$or` branches).
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field(String, FieldCond),
    /// Always matches — the empty filter `{}`.
    MatchAll,
}

/// A predicate function, the other half of "query is either a predicate
/// function or a filter object". `Send + Sync + 'static` so a
/// predicate can cross into a collection's write-queue task (`updateMany`/
/// `removeMany`) as readily as a read.
pub type PredicateFn = dyn Fn(&Doc) -> bool + Send + Sync + 'static;

#[derive(Clone)]
pub enum Query {
    Filter(Filter),
    Predicate(Arc<PredicateFn>),
}

impl Query {
    pub fn matches(&self, doc: &Doc) -> bool {
        match self {
            Query::Filter(f) => f.eval(doc),
            Query::Predicate(p) => p(doc),
        }
    }

    pub fn from_value(v: &Value) -> Result<Query> {
        Ok(Query::Filter(Filter::parse(v)?))
    }

    pub fn predicate(f: impl Fn(&Doc) -> bool + Send + Sync + 'static) -> Query {
        Query::Predicate(Arc::new(f))
    }

    /// Index-assisted lookup only applies to declarative filters; a predicate
    /// always falls back to a full scan.
    pub fn top_level_field_conds(&self) -> Vec<(&str, &FieldCond)> {
        match self {
            Query::Filter(f) => f.top_level_field_conds(),
            Query::Predicate(_) => Vec::new(),
        }
    }
}

impl Filter {
    pub fn parse(v: &Value) -> Result<Filter> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("filter must be an object".to_string()))?;

        if obj.is_empty() {
            return Ok(Filter::MatchAll);
        }

        let mut conjuncts = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            match key.as_str() {
                "$and" => {
                    let arr = value.as_array().ok_or_else(|| {
                        Error::InvalidArgument("$and requires an array of filters".to_string())
                    })?;
                    let sub: Result<Vec<Filter>> = arr.iter().map(Filter::parse).collect();
                    conjuncts.push(Filter::And(sub?));
                }
                "$or" => {
                    let arr = value.as_array().ok_or_else(|| {
                        Error::InvalidArgument("$or requires an array of filters".to_string())
                    })?;
                    let sub: Result<Vec<Filter>> = arr.iter().map(Filter::parse).collect();
                    conjuncts.push(Filter::Or(sub?));
                }
                field => {
                    conjuncts.push(Filter::Field(field.to_string(), parse_field_cond(value)));
                }
            }
        }

        if conjuncts.len() == 1 {
            Ok(conjuncts.into_iter().next().unwrap())
        } else {
            Ok(Filter::And(conjuncts))
        }
    }

    pub fn eval(&self, doc: &Doc) -> bool {
        match self {
            Filter::MatchAll => true,
            Filter::And(fs) => fs.iter().all(|f| f.eval(doc)),
            Filter::Or(fs) => fs.iter().any(|f| f.eval(doc)),
            Filter::Field(field, cond) => eval_field(doc, field, cond),
        }
    }

    /// Top-level field conditions directly AND-composed at this filter's root,
    /// used for index-assisted lookup. Entries nested inside
    /// `$and`/`$or` are intentionally excluded — only conditions directly on
    /// the filter object are eligible to seed an index lookup.
    pub fn top_level_field_conds(&self) -> Vec<(&str, &FieldCond)> {
        match self {
            Filter::Field(f, c) => vec![(f.as_str(), c)],
            Filter::And(fs) => fs
                .iter()
                .filter_map(|f| match f {
                    Filter::Field(field, cond) => Some((field.as_str(), cond)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn parse_field_cond(value: &Value) -> FieldCond {
    match value.as_object() {
        Some(map) if map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => {
            let mut ops = Vec::with_capacity(map.len());
            let mut regex_options: Option<String> = None;
            if let Some(Value::String(s)) = map.get("$options") {
                regex_options = Some(s.clone());
            }
            for (op, arg) in map {
                let parsed = match op.as_str() {
                    "$gt" => Op::Gt(arg.clone()),
                    "$gte" => Op::Gte(arg.clone()),
                    "$lt" => Op::Lt(arg.clone()),
                    "$lte" => Op::Lte(arg.clone()),
                    "$ne" => Op::Ne(arg.clone()),
                    "$in" => Op::In(arg.as_array().cloned().unwrap_or_default()),
                    "$nin" => Op::Nin(arg.as_array().cloned().unwrap_or_default()),
                    "$exists" => Op::Exists(arg.as_bool().unwrap_or(true)),
                    "$regex" => Op::Regex {
                        pattern: arg.as_str().unwrap_or_default().to_string(),
                        options: regex_options.clone(),
                    },
                    "$options" => continue,
                    _ => Op::Unknown,
                };
                ops.push(parsed);
            }
            FieldCond::Ops(ops)
        }
        // A plain object value (no `$`-prefixed keys) is an equality match
        // against that literal object, same as any other scalar.
        _ => FieldCond::Eq(value.clone()),
    }
}

fn eval_field(doc: &Doc, field: &str, cond: &FieldCond) -> bool {
    let actual = doc.get(field);
    match cond {
        FieldCond::Eq(expected) => actual.map(|a| a == expected).unwrap_or(false),
        FieldCond::Ops(ops) => ops.iter().all(|op| eval_op(actual, op)),
    }
}

fn eval_op(actual: Option<&Value>, op: &Op) -> bool {
    match op {
        Op::Gt(v) => compare(actual, v) == Some(Ordering::Greater),
        Op::Gte(v) => matches!(compare(actual, v), Some(Ordering::Greater) | Some(Ordering::Equal)),
        Op::Lt(v) => compare(actual, v) == Some(Ordering::Less),
        Op::Lte(v) => matches!(compare(actual, v), Some(Ordering::Less) | Some(Ordering::Equal)),
        Op::Ne(v) => actual.map(|a| a != v).unwrap_or(true),
        Op::In(values) => membership(actual, values, true),
        Op::Nin(values) => membership(actual, values, false),
        Op::Exists(expected) => actual.is_some() == *expected,
        Op::Regex { pattern, options } => eval_regex(actual, pattern, options.as_deref()),
        Op::Unknown => false,
    }
}

/// `$in`/`$nin`: if the document's field is an array, membership is set
/// intersection (any overlap counts for `$in`); otherwise plain equality
/// against one of the candidate values.
fn membership(actual: Option<&Value>, values: &[Value], want_in: bool) -> bool {
    let is_in = match actual {
        Some(Value::Array(arr)) => arr.iter().any(|a| values.contains(a)),
        Some(v) => values.contains(v),
        None => false,
    };
    is_in == want_in
}

fn eval_regex(actual: Option<&Value>, pattern: &str, options: Option<&str>) -> bool {
    let s = match actual {
        Some(Value::String(s)) => s,
        _ => return false,
    };
    let case_insensitive = options.map(|o| o.contains('i')).unwrap_or(false);
    let built = if case_insensitive {
        regex::RegexBuilder::new(pattern).case_insensitive(true).build()
    } else {
        regex::Regex::new(pattern).map_err(|e| e.into())
    };
    match built {
        Ok(re) => re.is_match(s),
        Err(_) => false,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
