//! Generic JSON merge patches (RFC 7386): two-way diff, three-way
//! resolution and application. Lists are always replaced wholesale.

use keel_core::doc::{deep_eq, strip_nulls};
use serde_json::{Map, Value};

/// RFC 7386 patch turning `original` into `modified`.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(om), Value::Object(mm)) => Value::Object(diff(om, mm)),
        (o, m) if deep_eq(o, m) => Value::Object(Map::new()),
        (_, m) => m.clone(),
    }
}

/// What `modified` sets or drops relative to `original`. Deletions are `null`
/// and only come from keys `original` holds; a `null` in `modified` for a key
/// `original` lacks sets nothing.
pub(crate) fn diff(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, mv) in modified {
        match (original.get(k), mv) {
            (Some(ov), _) if deep_eq(ov, mv) => {}
            (None, Value::Null) => {}
            (Some(_), Value::Null) => { out.insert(k.clone(), Value::Null); }
            (Some(Value::Object(om)), Value::Object(mm)) => {
                let sub = diff(om, mm);
                if !sub.is_empty() { out.insert(k.clone(), Value::Object(sub)); }
            }
            _ => { out.insert(k.clone(), strip_nulls(mv)); }
        }
    }
    for k in original.keys() {
        if !modified.contains_key(k) {
            out.insert(k.clone(), Value::Null);
        }
    }
    out
}

/// Three-way merge patch: the changes between `original` and `modified`,
/// minus whatever `current` already agrees with.
pub fn three_way(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    current: &Map<String, Value>,
) -> Map<String, Value> {
    resolve(&diff(original, modified), Some(current))
}

fn resolve(delta: &Map<String, Value>, current: Option<&Map<String, Value>>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, dv) in delta {
        let cur = current.and_then(|c| c.get(k));
        match dv {
            Value::Null => {
                if cur.map_or(false, |c| !c.is_null()) {
                    out.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(dm) => match cur {
                Some(Value::Object(cm)) => {
                    let sub = resolve(dm, Some(cm));
                    if !sub.is_empty() { out.insert(k.clone(), Value::Object(sub)); }
                }
                // nothing to merge into: deletions are moot, the rest lands as-is
                _ => { out.insert(k.clone(), strip_nulls(dv)); }
            },
            other => {
                if !cur.map_or(false, |c| deep_eq(c, other)) {
                    out.insert(k.clone(), other.clone());
                }
            }
        }
    }
    out
}

/// Apply an RFC 7386 patch in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(pm) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(tm) = target {
        for (k, pv) in pm {
            if pv.is_null() {
                tm.shift_remove(k);
            } else {
                apply_merge_patch(tm.entry(k.clone()).or_insert(Value::Null), pv);
            }
        }
    }
}
