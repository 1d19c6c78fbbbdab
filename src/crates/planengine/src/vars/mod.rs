//! Variable store: the VM's key -> value map with per-key reference counts
//! and `${name}` / `${name.sub}` interpolation.
//!
//! Grounded on `original_source/app/services/variable_manager.py`: same
//! operations, same single-pass interpolation, same "missing name is not an
//! error" semantics. The Python original re-`eval`s the interpolated string
//! to coerce back to a typed literal; there is no safe Rust equivalent, so
//! this port always returns the substituted string (documented in
//! DESIGN.md).

use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

fn ref_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(\w+)(?:\.\w+)?\}").expect("static regex"))
}

/// Thread-safe key/value store with reference counting, used as the VM's
/// variable space.
#[derive(Debug, Default)]
pub struct VariableStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Value>,
    refs: HashMap<String, i64>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, replacing any prior value and ref count.
    pub fn set(&self, name: &str, value: Value, refs: i64) {
        let mut inner = self.inner.lock().expect("variable store poisoned");
        inner.values.insert(name.to_string(), value);
        inner.refs.insert(name.to_string(), refs);
    }

    /// Fetch a value by name. Absent names yield `None`, never an error.
    pub fn get(&self, name: &str) -> Option<Value> {
        let inner = self.inner.lock().expect("variable store poisoned");
        inner.values.get(name).cloned()
    }

    /// Override a variable's reference count outright.
    pub fn set_reference_count(&self, name: &str, n: i64) {
        let mut inner = self.inner.lock().expect("variable store poisoned");
        inner.refs.insert(name.to_string(), n);
    }

    /// Decrement a variable's reference count by one. Never deletes here;
    /// callers must invoke [`garbage_collect`](Self::garbage_collect).
    pub fn decrease_ref_count(&self, name: &str) {
        let mut inner = self.inner.lock().expect("variable store poisoned");
        if let Some(count) = inner.refs.get_mut(name) {
            *count -= 1;
        }
    }

    /// Delete every variable whose reference count is `<= 0`.
    pub fn garbage_collect(&self) {
        let mut inner = self.inner.lock().expect("variable store poisoned");
        let dead: Vec<String> = inner
            .refs
            .iter()
            .filter(|(_, count)| **count <= 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            inner.values.remove(&name);
            inner.refs.remove(&name);
        }
    }

    /// Snapshot of all current values.
    pub fn get_all(&self) -> HashMap<String, Value> {
        let inner = self.inner.lock().expect("variable store poisoned");
        inner.values.clone()
    }

    /// Snapshot of all current reference counts.
    pub fn get_all_refs(&self) -> HashMap<String, i64> {
        let inner = self.inner.lock().expect("variable store poisoned");
        inner.refs.clone()
    }

    /// Replace the entire store with `values`/`refs` (used for state load).
    pub fn set_all(&self, values: HashMap<String, Value>, refs: HashMap<String, i64>) {
        let mut inner = self.inner.lock().expect("variable store poisoned");
        inner.values = values;
        inner.refs = refs;
    }

    /// Substitute every `${name}` / `${name.sub}` occurrence in `text` with
    /// the stringified value, in a single left-to-right pass. Non-string
    /// input is returned unchanged.
    pub fn interpolate(&self, text: &Value) -> Value {
        let Value::String(s) = text else {
            return text.clone();
        };
        let inner = self.inner.lock().expect("variable store poisoned");
        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in ref_pattern().captures_iter(s) {
            let whole = caps.get(0).expect("capture group 0 always matches");
            out.push_str(&s[last..whole.start()]);
            let name = &caps[1];
            match inner.values.get(name) {
                Some(value) => out.push_str(&stringify(value)),
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Value::String(out)
    }

    /// Top-level variable names referenced via `${name}` / `${name.sub}`.
    pub fn find_refs(&self, text: &Value) -> HashSet<String> {
        let Value::String(s) = text else {
            return HashSet::new();
        };
        ref_pattern()
            .captures_iter(s)
            .map(|c| c[1].to_string())
            .collect()
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_roundtrip() {
        let store = VariableStore::new();
        store.set("x", json!("hello"), 1);
        assert_eq!(store.get("x"), Some(json!("hello")));
    }

    #[test]
    fn get_missing_is_none_not_error() {
        let store = VariableStore::new();
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn garbage_collect_removes_nonpositive_refs() {
        let store = VariableStore::new();
        store.set("a", json!(1), 1);
        store.set("b", json!(2), 0);
        store.decrease_ref_count("a");
        store.garbage_collect();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), None);
    }

    #[test]
    fn interpolate_substitutes_in_one_pass() {
        let store = VariableStore::new();
        store.set("name", json!("world"), 1);
        let out = store.interpolate(&json!("hello ${name}!"));
        assert_eq!(out, json!("hello world!"));
    }

    #[test]
    fn interpolate_subkey_uses_top_level_value() {
        let store = VariableStore::new();
        store.set("user", json!({"name": "ada"}), 1);
        let out = store.interpolate(&json!("hi ${user.name}"));
        // stringified value of the whole `user` object, since the store
        // does not drill into sub-keys when producing literal text.
        assert!(out.as_str().unwrap().starts_with("hi "));
    }

    #[test]
    fn interpolate_non_string_passthrough() {
        let store = VariableStore::new();
        let out = store.interpolate(&json!(42));
        assert_eq!(out, json!(42));
    }

    #[test]
    fn interpolate_unknown_var_left_untouched() {
        let store = VariableStore::new();
        let out = store.interpolate(&json!("value: ${missing}"));
        assert_eq!(out, json!("value: ${missing}"));
    }

    #[test]
    fn find_refs_returns_top_level_names() {
        let store = VariableStore::new();
        let refs = store.find_refs(&json!("${a} and ${b.c} and ${a}"));
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("a"));
        assert!(refs.contains("b"));
    }

    #[test]
    fn find_refs_after_interpolate_is_subset() {
        let store = VariableStore::new();
        store.set("a", json!("${b}"), 1);
        let text = json!("${a} ${b}");
        let before = store.find_refs(&text);
        let interpolated = store.interpolate(&text);
        let after = store.find_refs(&interpolated);
        assert!(after.is_subset(&before) || after == before);
    }
}
