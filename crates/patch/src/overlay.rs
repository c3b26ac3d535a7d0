//! Overlay copy: last-resort "overwrite what I know, keep what I don't".
//!
//! Lists are matched by position, never by identity. Extra target elements
//! survive, extra source elements are appended.

use serde_json::{Map, Value};

/// Copy every key of `source` onto `target` in place.
pub fn copy(source: &Map<String, Value>, target: &mut Map<String, Value>) {
    for (k, sv) in source {
        match target.get_mut(k) {
            Some(tv) => copy_value(sv, tv),
            None => { target.insert(k.clone(), sv.clone()); }
        }
    }
}

/// Overlay one node onto another.
pub fn copy_value(source: &Value, target: &mut Value) {
    match (source, target) {
        (Value::Object(sm), Value::Object(tm)) => copy(sm, tm),
        (Value::Array(sa), Value::Array(ta)) => {
            for (i, sv) in sa.iter().enumerate() {
                match ta.get_mut(i) {
                    Some(tv) => copy_value(sv, tv),
                    None => ta.push(sv.clone()),
                }
            }
        }
        (sv, tv) => *tv = sv.clone(),
    }
}
