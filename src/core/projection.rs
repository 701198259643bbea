//! Projections: `{field: 1}` includes, `{field: 0}` excludes.
//! Mixing the two — other than `_id: 0` alongside inclusions — is an error.

use crate::core::constants::FIELD_ID;
use crate::core::document::Doc;
use crate::core::errors::{Error, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub enum Projection {
    Include(Vec<String>, bool), // fields, keep_id
    Exclude(Vec<String>),
    None,
}

impl Projection {
    pub fn parse(v: Option<&Value>) -> Result<Projection> {
        let v = match v {
            None => return Ok(Projection::None),
            Some(v) => v,
        };
        let obj = v
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("projection must be an object".to_string()))?;
        if obj.is_empty() {
            return Ok(Projection::None);
        }

        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for (field, flag) in obj {
            let truthy = match flag {
                Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(true),
                Value::Bool(b) => *b,
                _ => {
                    return Err(Error::InvalidArgument(
                        "projection values must be 0 or 1".to_string(),
                    ))
                }
            };
            if truthy {
                includes.push(field.clone());
            } else {
                excludes.push(field.clone());
            }
        }

        if includes.is_empty() {
            return Ok(Projection::Exclude(excludes));
        }

        // `_id: 0` is the one allowed exception alongside inclusions.
        let stray_excludes: Vec<&String> = excludes.iter().filter(|f| f.as_str() != FIELD_ID).collect();
        if !stray_excludes.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot mix inclusion and exclusion in a projection (except _id: 0)".to_string(),
            ));
        }
        let keep_id = !excludes.iter().any(|f| f == FIELD_ID);
        Ok(Projection::Include(includes, keep_id))
    }

    pub fn apply(&self, doc: &Doc) -> Doc {
        match self {
            Projection::None => doc.clone(),
            Projection::Exclude(fields) => {
                let mut out = doc.clone();
                for f in fields {
                    out.remove(f);
                }
                out
            }
            Projection::Include(fields, keep_id) => {
                let mut out = Map::new();
                if *keep_id {
                    if let Some(id) = doc.get(FIELD_ID) {
                        out.insert(FIELD_ID.to_string(), id.clone());
                    }
                }
                for f in fields {
                    if let Some(v) = doc.get(f) {
                        out.insert(f.clone(), v.clone());
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Doc {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn no_projection_returns_clone() {
        let p = Projection::parse(None).unwrap();
        let d = doc(json!({"a": 1, "b": 2}));
        assert_eq!(p.apply(&d), d);
    }

    #[test]
    fn inclusion_keeps_id_by_default() {
        let p = Projection::parse(Some(&json!({"name": 1}))).unwrap();
        let d = doc(json!({"_id": "x", "name": "a", "age": 2}));
        let out = p.apply(&d);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("name").unwrap(), "a");
        assert_eq!(out.get("_id").unwrap(), "x");
    }

    #[test]
    fn inclusion_with_id_zero_drops_id() {
        let p = Projection::parse(Some(&json!({"name": 1, "_id": 0}))).unwrap();
        let d = doc(json!({"_id": "x", "name": "a"}));
        let out = p.apply(&d);
        assert!(!out.contains_key("_id"));
        assert_eq!(out.get("name").unwrap(), "a");
    }

    #[test]
    fn exclusion_removes_named_fields() {
        let p = Projection::parse(Some(&json!({"secret": 0}))).unwrap();
        let d = doc(json!({"_id": "x", "secret": "s", "name": "a"}));
        let out = p.apply(&d);
        assert!(!out.contains_key("secret"));
        assert_eq!(out.get("name").unwrap(), "a");
    }

    #[test]
    fn mixing_inclusion_and_exclusion_errors() {
        let err = Projection::parse(Some(&json!({"a": 1, "b": 0})));
        assert!(err.is_err());
    }
}
