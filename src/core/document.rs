//! Document helpers: the reserved-field contract (`_id`/`createdAt`/`updatedAt`),
//! TTL liveness, and the shallow-merge semantics WAL replay depends on bit-for-bit.

use crate::core::constants::*;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub type Doc = Map<String, Value>;

/// Generates a fresh document id. Default is RFC 4122 v4, matching spec's documented
/// default `idGenerator`; callers needing a custom generator supply one through
/// `CollectionOptions::id_generator`.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stamps `_id` (if absent), `createdAt`, `updatedAt` onto a fresh document.
/// `id_generator` is called only when the caller didn't supply `_id`.
pub fn stamp_new(mut doc: Doc, id_generator: &dyn Fn() -> String) -> Doc {
    let id = match doc.get(FIELD_ID) {
        Some(Value::String(s)) => s.clone(),
        _ => {
            let id = id_generator();
            doc.insert(FIELD_ID.to_string(), Value::String(id.clone()));
            id
        }
    };
    doc.insert(FIELD_ID.to_string(), Value::String(id));
    let ts = now_rfc3339();
    doc.entry(FIELD_CREATED_AT.to_string())
        .or_insert_with(|| Value::String(ts.clone()));
    doc.insert(FIELD_UPDATED_AT.to_string(), Value::String(ts));
    doc
}

/// Parses a value as an absolute epoch-millisecond timestamp. Accepts a JSON
/// number (epoch ms) or an RFC 3339 string; anything else is "invalid".
pub(crate) fn parse_timestamp_millis(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis()),
        _ => None,
    }
}

/// `isAlive`: false iff the document carries a *valid* past `expireAt`, or a
/// numeric `ttl` interpreted relative to `createdAt` that has elapsed. Invalid
/// or absent TTL fields mean the document lives — the defensive default.
pub fn is_alive(doc: &Doc, now_ms: i64) -> bool {
    if let Some(expire_at) = doc.get(FIELD_EXPIRE_AT) {
        if let Some(ms) = parse_timestamp_millis(expire_at) {
            return ms > now_ms;
        }
        // invalid expireAt: ignored, document lives
        return true;
    }

    if let Some(ttl) = doc.get(FIELD_TTL) {
        let ttl_ms = match ttl {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        };
        if let Some(ttl_ms) = ttl_ms {
            let created_ms = doc
                .get(FIELD_CREATED_AT)
                .and_then(parse_timestamp_millis)
                .unwrap_or(now_ms);
            return created_ms + ttl_ms > now_ms;
        }
        return true;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Doc {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn stamp_new_assigns_id_and_timestamps() {
        let doc = obj(json!({"name": "a"}));
        let stamped = stamp_new(doc, &generate_id);
        assert!(stamped.get(FIELD_ID).unwrap().is_string());
        assert!(stamped.get(FIELD_CREATED_AT).unwrap().is_string());
        assert!(stamped.get(FIELD_UPDATED_AT).unwrap().is_string());
    }

    #[test]
    fn stamp_new_preserves_caller_id() {
        let doc = obj(json!({"_id": "fixed"}));
        let stamped = stamp_new(doc, &generate_id);
        assert_eq!(stamped.get(FIELD_ID).unwrap(), "fixed");
    }

    #[test]
    fn ttl_edge_cases() {
        let now = 1_000_000_i64;
        let a = obj(json!({"_id": "a", "expireAt": now - 1}));
        let b = obj(json!({"_id": "b", "ttl": 0, "createdAt": (now - 1).to_string()}));
        let c = obj(json!({"_id": "c", "expireAt": "not-a-date"}));
        let d = obj(json!({"_id": "d"}));

        assert!(!is_alive(&a, now));
        assert!(is_alive(&c, now));
        assert!(is_alive(&d, now));
        // b's createdAt isn't RFC3339, so it can't be parsed and falls back to `now`;
        // a relative TTL of 0 against `now` has already elapsed.
        assert!(!is_alive(&b, now));
    }

    #[test]
    fn ttl_absent_lives_forever() {
        let doc = obj(json!({"_id": "x"}));
        assert!(is_alive(&doc, i64::MAX));
    }
}
