//! Schema-aware three-way merge.
//!
//! Lists with a declared merge key are diffed element by element; an element
//! to drop is written as `{<key>: <value>, "$patch": "delete"}`. Fields with
//! replace strategy are emitted whole, maps marked `"$patch": "replace"`.
//! Added list elements are appended after the surviving live elements.

use keel_core::doc::deep_eq;
use serde_json::{Map, Value};

use crate::schema::FieldMeta;

pub const DIRECTIVE: &str = "$patch";
const DELETE: &str = "delete";
const REPLACE: &str = "replace";

fn child<'a>(meta: Option<&'a FieldMeta>, key: &str) -> Option<&'a FieldMeta> {
    meta.and_then(|m| m.field(key))
}

fn merge_key(meta: Option<&FieldMeta>) -> Option<&str> {
    meta.and_then(|m| m.list_merge_key())
}

fn is_replace(meta: Option<&FieldMeta>) -> bool {
    meta.map_or(false, |m| m.is_replace())
}

fn directive(m: &Map<String, Value>) -> Option<&str> {
    m.get(DIRECTIVE).and_then(|v| v.as_str())
}

fn all_keyed(items: &[Value], key: &str) -> bool {
    items.iter().all(|e| e.get(key).map_or(false, |v| !v.is_null()))
}

fn key_matches(e: &Value, key: &str, kv: &Value) -> bool {
    e.get(key).map_or(false, |v| deep_eq(v, kv))
}

fn find_by_key<'a>(items: &'a [Value], key: &str, kv: &Value) -> Option<&'a Value> {
    items.iter().find(|e| key_matches(e, key, kv))
}

/// Element entry with the merge key first.
fn keyed_entry(key: &str, kv: &Value, rest: Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert(key.to_string(), kv.clone());
    out.extend(rest);
    Value::Object(out)
}

/// A value new to the delta, with replace markers set where metadata asks.
/// Null fields set nothing and are dropped.
fn fresh(v: &Value, meta: Option<&FieldMeta>) -> Value {
    match v {
        Value::Object(m) => {
            let mut out = Map::new();
            for (k, vv) in m {
                if vv.is_null() { continue; }
                out.insert(k.clone(), fresh(vv, child(meta, k)));
            }
            if is_replace(meta) {
                out.insert(DIRECTIVE.to_string(), Value::String(REPLACE.to_string()));
            }
            Value::Object(out)
        }
        Value::Array(items) if merge_key(meta).is_some() => {
            Value::Array(items.iter().map(|e| fresh(e, meta)).collect())
        }
        other => other.clone(),
    }
}

/// Directive-free copy, for comparing a delta value against live state.
fn strip_directives(v: &Value) -> Value {
    match v {
        Value::Object(m) => Value::Object(
            m.iter()
                .filter(|(k, _)| k.as_str() != DIRECTIVE)
                .map(|(k, vv)| (k.clone(), strip_directives(vv)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}

/// Changes from `original` to `modified` under `meta`.
pub fn diff(original: &Map<String, Value>, modified: &Map<String, Value>, meta: Option<&FieldMeta>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, mv) in modified {
        let fm = child(meta, k);
        let Some(ov) = original.get(k) else {
            if !mv.is_null() { out.insert(k.clone(), fresh(mv, fm)); }
            continue;
        };
        if deep_eq(ov, mv) { continue; }
        match (ov, mv) {
            (Value::Object(om), Value::Object(mm)) if !is_replace(fm) => {
                let sub = diff(om, mm, fm);
                if !sub.is_empty() { out.insert(k.clone(), Value::Object(sub)); }
            }
            (Value::Array(oa), Value::Array(ma)) => match merge_key(fm) {
                Some(key) if all_keyed(oa, key) && all_keyed(ma, key) => {
                    let items = diff_list(oa, ma, key, fm);
                    if !items.is_empty() { out.insert(k.clone(), Value::Array(items)); }
                }
                _ => { out.insert(k.clone(), mv.clone()); }
            },
            _ => { out.insert(k.clone(), fresh(mv, fm)); }
        }
    }
    for k in original.keys() {
        if !modified.contains_key(k) {
            out.insert(k.clone(), Value::Null);
        }
    }
    out
}

fn diff_list(original: &[Value], modified: &[Value], key: &str, meta: Option<&FieldMeta>) -> Vec<Value> {
    let mut out = Vec::new();
    for m in modified {
        let kv = &m[key];
        match (find_by_key(original, key, kv), m) {
            (Some(Value::Object(om)), Value::Object(mm)) => {
                let sub = diff(om, mm, meta);
                if !sub.is_empty() { out.push(keyed_entry(key, kv, sub)); }
            }
            _ => out.push(fresh(m, meta)),
        }
    }
    for o in original {
        let kv = &o[key];
        if find_by_key(modified, key, kv).is_none() {
            out.push(delete_marker(key, kv));
        }
    }
    out
}

fn delete_marker(key: &str, kv: &Value) -> Value {
    let mut rest = Map::new();
    rest.insert(DIRECTIVE.to_string(), Value::String(DELETE.to_string()));
    keyed_entry(key, kv, rest)
}

/// Drop the parts of `delta` that `current` already satisfies.
pub fn resolve(delta: &Map<String, Value>, current: Option<&Map<String, Value>>, meta: Option<&FieldMeta>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, dv) in delta {
        if k == DIRECTIVE { continue; }
        let fm = child(meta, k);
        let cur = current.and_then(|c| c.get(k));
        match dv {
            Value::Null => {
                if cur.map_or(false, |c| !c.is_null()) {
                    out.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(dm) if directive(dm) == Some(REPLACE) => {
                if !cur.map_or(false, |c| deep_eq(c, &strip_directives(dv))) {
                    out.insert(k.clone(), dv.clone());
                }
            }
            Value::Object(dm) => match cur {
                Some(Value::Object(cm)) => {
                    let sub = resolve(dm, Some(cm), fm);
                    if !sub.is_empty() { out.insert(k.clone(), Value::Object(sub)); }
                }
                _ => {
                    if let Some(fresh) = landing(dv) { out.insert(k.clone(), fresh); }
                }
            },
            Value::Array(da) => match (merge_key(fm), cur) {
                (Some(key), Some(Value::Array(ca))) if all_keyed(da, key) => {
                    let items = resolve_list(da, ca, key, fm);
                    if !items.is_empty() { out.insert(k.clone(), Value::Array(items)); }
                }
                (Some(key), None | Some(Value::Null)) if all_keyed(da, key) => {
                    if let Some(fresh) = landing(dv) { out.insert(k.clone(), fresh); }
                }
                _ => {
                    if !cur.map_or(false, |c| deep_eq(c, &strip_directives(dv))) {
                        out.insert(k.clone(), dv.clone());
                    }
                }
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

fn resolve_list(delta: &[Value], current: &[Value], key: &str, meta: Option<&FieldMeta>) -> Vec<Value> {
    let mut out = Vec::new();
    for d in delta {
        let kv = &d[key];
        let cur = find_by_key(current, key, kv);
        let Value::Object(dm) = d else { continue };
        if directive(dm) == Some(DELETE) {
            if cur.is_some() { out.push(d.clone()); }
            continue;
        }
        match cur {
            Some(Value::Object(cm)) => {
                let sub = resolve(dm, Some(cm), meta);
                if !sub.is_empty() { out.push(keyed_entry(key, kv, sub)); }
            }
            _ => {
                if let Some(fresh) = landing(d) { out.push(fresh); }
            }
        }
    }
    out
}

/// A delta value landing where `current` has nothing to merge into:
/// deletions are moot. `None` when nothing but deletions remain.
fn landing(v: &Value) -> Option<Value> {
    match v {
        Value::Null => None,
        Value::Object(m) if directive(m) == Some(DELETE) => None,
        Value::Object(m) => {
            let mut out = Map::new();
            for (k, vv) in m {
                if k == DIRECTIVE {
                    out.insert(k.clone(), vv.clone());
                } else if let Some(x) = landing(vv) {
                    out.insert(k.clone(), x);
                }
            }
            let had_fields = m.keys().any(|k| k != DIRECTIVE);
            let has_fields = out.keys().any(|k| k != DIRECTIVE);
            if had_fields && !has_fields { None } else { Some(Value::Object(out)) }
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|e| e.as_object().and_then(directive) != Some(DELETE))
                .cloned()
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

/// Three-way strategic patch.
pub fn three_way(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    current: &Map<String, Value>,
    meta: &FieldMeta,
) -> Map<String, Value> {
    resolve(&diff(original, modified, Some(meta)), Some(current), Some(meta))
}

/// Apply a strategic patch in place, honouring merge keys and directives.
pub fn apply(target: &mut Value, patch: &Value, meta: Option<&FieldMeta>) {
    let Value::Object(pm) = patch else {
        *target = patch.clone();
        return;
    };
    if directive(pm) == Some(REPLACE) || !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(tm) = target else { return };
    for (k, pv) in pm {
        if k == DIRECTIVE { continue; }
        let fm = child(meta, k);
        match pv {
            Value::Null => { tm.shift_remove(k); }
            Value::Array(items) => match merge_key(fm) {
                Some(key) if all_keyed(items, key) => {
                    let slot = tm.entry(k.clone()).or_insert_with(|| Value::Array(Vec::new()));
                    if !slot.is_array() {
                        *slot = Value::Array(Vec::new());
                    }
                    if let Value::Array(list) = slot {
                        apply_list(list, items, key, fm);
                    }
                }
                _ => { tm.insert(k.clone(), pv.clone()); }
            },
            _ => apply(tm.entry(k.clone()).or_insert(Value::Null), pv, fm),
        }
    }
}

fn apply_list(list: &mut Vec<Value>, items: &[Value], key: &str, meta: Option<&FieldMeta>) {
    for item in items {
        let kv = &item[key];
        if item.as_object().and_then(directive) == Some(DELETE) {
            list.retain(|e| !key_matches(e, key, kv));
            continue;
        }
        match list.iter_mut().find(|e| key_matches(e, key, kv)) {
            Some(existing) => apply(existing, item, meta),
            None => {
                let mut added = Value::Null;
                apply(&mut added, item, meta);
                list.push(added);
            }
        }
    }
}
