//! Update specs: dynamic update objects become a tagged sum type,
//! `Update = Replace(doc) | Ops([UpdateOp])`. All operators are shallow.

use crate::core::document::Doc;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    Inc(String, f64),
    Push { field: String, values: Vec<Value> },
    Pull(String, Value),
}

#[derive(Debug, Clone)]
pub enum UpdateSpec {
    /// Full replacement; `_id`/`createdAt` are preserved by the caller regardless.
    Replace(Doc),
    Ops(Vec<UpdateOp>),
}

impl UpdateSpec {
    /// An update with no `$`-prefixed top-level keys is a full replacement;
    /// otherwise every top-level key must be a recognized operator.
    pub fn parse(v: &Value) -> crate::core::errors::Result<UpdateSpec> {
        use crate::core::errors::Error;
        let obj = v
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("update must be an object".to_string()))?;

        let has_operators = obj.keys().any(|k| k.starts_with('$'));
        if !has_operators {
            return Ok(UpdateSpec::Replace(obj.clone()));
        }

        let mut ops = Vec::new();
        for (op, arg) in obj {
            let arg_obj = arg.as_object().ok_or_else(|| {
                Error::InvalidArgument(format!("{} requires an object argument", op))
            })?;
            match op.as_str() {
                "$set" => {
                    for (field, value) in arg_obj {
                        ops.push(UpdateOp::Set(field.clone(), value.clone()));
                    }
                }
                "$unset" => {
                    for field in arg_obj.keys() {
                        ops.push(UpdateOp::Unset(field.clone()));
                    }
                }
                "$inc" => {
                    for (field, value) in arg_obj {
                        let delta = value.as_f64().ok_or_else(|| {
                            Error::InvalidArgument(format!("$inc.{} must be numeric", field))
                        })?;
                        ops.push(UpdateOp::Inc(field.clone(), delta));
                    }
                }
                "$push" => {
                    for (field, value) in arg_obj {
                        let values = match value.as_object().and_then(|o| o.get("$each")) {
                            Some(Value::Array(items)) => items.clone(),
                            _ => vec![value.clone()],
                        };
                        ops.push(UpdateOp::Push {
                            field: field.clone(),
                            values,
                        });
                    }
                }
                "$pull" => {
                    for (field, value) in arg_obj {
                        ops.push(UpdateOp::Pull(field.clone(), value.clone()));
                    }
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown update operator '{}'",
                        other
                    )))
                }
            }
        }
        Ok(UpdateSpec::Ops(ops))
    }

    /// Renders this spec down to a single shallow-merge patch document, the
    /// form the WAL's UPDATE record and `Collection::update` both apply.
    pub fn to_patch(&self, existing: &Doc) -> Doc {
        match self {
            // A bare replacement drops every existing field the replacement
            // doesn't carry (aside from `_id`/`createdAt`, which always survive).
            // The shallow-merge patch applier only ever sets or deletes keys, so
            // "drop" here means mapping the absent key to `Value::Null`.
            UpdateSpec::Replace(doc) => {
                let mut patch = doc.clone();
                for key in existing.keys() {
                    if key == crate::core::constants::FIELD_ID
                        || key == crate::core::constants::FIELD_CREATED_AT
                    {
                        continue;
                    }
                    if !doc.contains_key(key) {
                        patch.insert(key.clone(), Value::Null);
                    }
                }
                patch
            }
            UpdateSpec::Ops(ops) => {
                let mut patch = Doc::new();
                let mut working = existing.clone();
                for op in ops {
                    apply_op(&mut working, &mut patch, op);
                }
                patch
            }
        }
    }
}

fn apply_op(working: &mut Doc, patch: &mut Doc, op: &UpdateOp) {
    match op {
        UpdateOp::Set(field, value) => {
            working.insert(field.clone(), value.clone());
            patch.insert(field.clone(), value.clone());
        }
        UpdateOp::Unset(field) => {
            working.remove(field);
            patch.insert(field.clone(), Value::Null);
        }
        UpdateOp::Inc(field, delta) => {
            let current = working.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let next = current + delta;
            let value = serde_json::Number::from_f64(next)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            working.insert(field.clone(), value.clone());
            patch.insert(field.clone(), value);
        }
        UpdateOp::Push { field, values } => {
            let mut arr = working
                .get(field)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            arr.extend(values.clone());
            let value = Value::Array(arr);
            working.insert(field.clone(), value.clone());
            patch.insert(field.clone(), value);
        }
        UpdateOp::Pull(field, target) => {
            let arr = working
                .get(field)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let filtered: Vec<Value> = arr.into_iter().filter(|v| v != target).collect();
            let value = Value::Array(filtered);
            working.insert(field.clone(), value.clone());
            patch.insert(field.clone(), value);
        }
    }
}

/// WAL's `UPDATE` record patch deletes a key when the patch maps it to `null`
/// produced by `$unset`; this applies that convention on top of a plain
/// shallow merge (`Value::Null` entries are removed rather than stored).
pub fn apply_patch_with_unset(existing: &mut Doc, patch: &Doc) {
    for (k, v) in patch {
        if k == crate::core::constants::FIELD_ID || k == crate::core::constants::FIELD_CREATED_AT {
            continue;
        }
        if v.is_null() {
            existing.remove(k);
        } else {
            existing.insert(k.clone(), v.clone());
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
    fn full_replacement_when_no_operators() {
        let spec = UpdateSpec::parse(&json!({"name": "bob"})).unwrap();
        assert!(matches!(spec, UpdateSpec::Replace(_)));
    }

    #[test]
    fn replace_patch_drops_fields_missing_from_the_replacement() {
        let existing = doc(json!({"_id": "1", "createdAt": "t0", "name": "a", "age": 30}));
        let spec = UpdateSpec::parse(&json!({"name": "b"})).unwrap();
        let patch = spec.to_patch(&existing);

        let mut applied = existing.clone();
        apply_patch_with_unset(&mut applied, &patch);

        assert_eq!(applied.get("name").unwrap(), "b");
        assert!(!applied.contains_key("age"));
        assert_eq!(applied.get("_id").unwrap(), "1");
        assert_eq!(applied.get("createdAt").unwrap(), "t0");
    }

    #[test]
    fn set_and_inc() {
        let existing = doc(json!({"count": 5, "name": "a"}));
        let spec = UpdateSpec::parse(&json!({"$set": {"name": "b"}, "$inc": {"count": 3}})).unwrap();
        let patch = spec.to_patch(&existing);
        assert_eq!(patch.get("name").unwrap(), "b");
        assert_eq!(patch.get("count").unwrap(), &json!(8.0));
    }

    #[test]
    fn push_with_each() {
        let existing = doc(json!({"tags": ["a"]}));
        let spec = UpdateSpec::parse(&json!({"$push": {"tags": {"$each": ["b", "c"]}}})).unwrap();
        let patch = spec.to_patch(&existing);
        assert_eq!(patch.get("tags").unwrap(), &json!(["a", "b", "c"]));
    }

    #[test]
    fn pull_removes_equal_elements() {
        let existing = doc(json!({"tags": ["a", "b", "a"]}));
        let spec = UpdateSpec::parse(&json!({"$pull": {"tags": "a"}})).unwrap();
        let patch = spec.to_patch(&existing);
        assert_eq!(patch.get("tags").unwrap(), &json!(["b"]));
    }

    #[test]
    fn unset_marks_null_in_patch() {
        let existing = doc(json!({"name": "a", "extra": 1}));
        let spec = UpdateSpec::parse(&json!({"$unset": {"extra": ""}})).unwrap();
        let patch = spec.to_patch(&existing);
        assert!(patch.get("extra").unwrap().is_null());

        let mut applied = existing.clone();
        apply_patch_with_unset(&mut applied, &patch);
        assert!(!applied.contains_key("extra"));
    }

    #[test]
    fn apply_patch_never_moves_id_or_created_at() {
        let mut existing = doc(json!({"_id": "1", "createdAt": "t0", "name": "old"}));
        let patch = doc(json!({"_id": "evil", "createdAt": "t1", "name": "new"}));
        apply_patch_with_unset(&mut existing, &patch);
        assert_eq!(existing.get("_id").unwrap(), "1");
        assert_eq!(existing.get("createdAt").unwrap(), "t0");
        assert_eq!(existing.get("name").unwrap(), "new");
    }

    #[test]
    fn apply_patch_is_not_deep() {
        let mut existing = doc(json!({"nested": {"a": 1, "b": 2}}));
        let patch = doc(json!({"nested": {"b": 3}}));
        apply_patch_with_unset(&mut existing, &patch);
        assert_eq!(existing.get("nested").unwrap(), &json!({"b": 3}));
    }
}
