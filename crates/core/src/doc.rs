//! Document helpers over `serde_json::Value` (built with `preserve_order`).

use serde_json::{Map, Value};

/// Deep structural equality. Numbers compare by value so `2` and `2.0` match,
/// but a number never equals a string. Map key order is irrelevant.
pub fn deep_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(am), Value::Object(bm)) => {
            am.len() == bm.len()
                && am.iter().all(|(k, av)| bm.get(k).map_or(false, |bv| deep_eq(av, bv)))
        }
        (Value::Array(aa), Value::Array(ba)) => {
            aa.len() == ba.len() && aa.iter().zip(ba.iter()).all(|(x, y)| deep_eq(x, y))
        }
        (Value::Number(an), Value::Number(bn)) => {
            if an == bn { return true; }
            match (an.as_i64(), bn.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => match (an.as_f64(), bn.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            }
        }
        _ => a == b,
    }
}

/// Walk `path` through nested maps.
pub fn get_path<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = v;
    for seg in path {
        cur = cur.as_object()?.get(*seg)?;
    }
    Some(cur)
}

/// Mutable map at `path`, creating (or replacing non-map values with) empty maps on the way.
/// Returns `None` only when `v` itself is not an object.
pub fn ensure_map_path<'a>(v: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let mut cur = v.as_object_mut()?;
    for seg in path {
        let entry = cur.entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cur = entry.as_object_mut()?;
    }
    Some(cur)
}

/// Remove `key` keeping the order of the remaining entries.
pub fn remove_key(map: &mut Map<String, Value>, key: &str) -> Option<Value> {
    map.shift_remove(key)
}

/// Drop `path`'s last segment from the nested map it lives in; prunes nothing else.
pub fn remove_path(v: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut cur = v.as_object_mut()?;
    for seg in parents {
        cur = cur.get_mut(*seg)?.as_object_mut()?;
    }
    remove_key(cur, last)
}

/// True once the node count of `v` reaches `max`. Stops walking early.
pub fn node_budget_exceeded(v: &Value, max: usize) -> bool {
    fn walk(v: &Value, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Value::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Value::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Recursively drop `null` members of maps. Used when a delta lands on a
/// path where there is nothing left to delete.
pub fn strip_nulls(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, vv) in map {
                if vv.is_null() { continue; }
                out.insert(k.clone(), strip_nulls(vv));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
