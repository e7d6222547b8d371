// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! The nested key/value scope in which macros are resolved.
//!
//! Values live under dotted string keys in insertion order. Setting a
//! nested value at `K` also projects every reachable field flat:
//! `K.field`, `K.<index>` or `K.<child-name>` for sequences, recursively,
//! so `${node.host}` works no matter how deep the spec file nests.

use crate::error::Result;
use crate::expr::{self, ExprValue};
use crate::util::value_to_string;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex_lite::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, warn};

lazy_static! {
    static ref RE_MACRO: Regex = Regex::new(r"\$\{([^}]+)\}").unwrap();
    // Unknown macros are reported once per process, not once per render
    static ref WARNED: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Fixed-point substitution gives up after this many passes; a context that
/// still changes is mutually recursive.
const MAX_RENDER_PASSES: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: IndexMap<String, Value>,
    defines: HashSet<String>,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// Deep copy that may be mutated independently of its parent.
    pub fn fork(&self) -> Context {
        self.clone()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(value_to_string)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set a value and its flat projections.
    pub fn set(&mut self, name: &str, value: Value) {
        match &value {
            Value::Mapping(map) => {
                for (k, v) in map {
                    if let Some(k) = k.as_str() {
                        self.set(&format!("{}.{}", name, k), v.clone());
                    }
                }
            }
            Value::Sequence(seq) => {
                for (i, v) in seq.iter().enumerate() {
                    let child_name = v
                        .as_mapping()
                        .and_then(|m| crate::util::mget_str(m, "name"))
                        .map(str::to_string);
                    match child_name {
                        Some(n) => self.set(&format!("{}.{}", name, n), v.clone()),
                        None => self.set(&format!("{}.{}", name, i), v.clone()),
                    }
                }
            }
            _ => {}
        }
        self.values.insert(name.to_string(), value);
    }

    /// Merge every entry of a mapping at the top level.
    pub fn update(&mut self, map: &Mapping) {
        for (k, v) in map {
            if let Some(k) = k.as_str() {
                self.set(k, v.clone());
            }
        }
    }

    /// Merge a `define:` block, remembering the names so that unresolved
    /// macros over them stay silent.
    pub fn update_defines(&mut self, map: &Mapping) {
        for (k, v) in map {
            if let Some(k) = k.as_str() {
                self.defines.insert(k.to_string());
                self.set(k, v.clone());
            }
        }
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.contains(name)
    }

    fn lookup_expr(&self, name: &str) -> Option<ExprValue> {
        match self.get(name)? {
            Value::Number(n) => Some(ExprValue::Num(n.as_f64()?)),
            Value::String(s) => Some(ExprValue::from_scalar(s)),
            Value::Bool(b) => Some(ExprValue::Num(if *b { 1.0 } else { 0.0 })),
            _ => None,
        }
    }

    /// Resolve one `${...}` body. `apply_defaults` is only turned on once a
    /// pass made no progress, so a key set late still wins over its default.
    fn resolve(&self, expr: &str, apply_defaults: bool) -> Option<String> {
        let expr = expr.trim();
        if expr::is_identifier(expr) {
            return self.get(expr).map(value_to_string);
        }
        if let Some((key, default)) = expr.split_once('|') {
            let key = key.trim();
            if expr::is_identifier(key) {
                if let Some(v) = self.get(key) {
                    return Some(value_to_string(v));
                }
                if apply_defaults {
                    return Some(default.trim().to_string());
                }
                return None;
            }
        }
        match expr::eval(expr, &|name| self.lookup_expr(name)) {
            Ok(v) => Some(v.render()),
            Err(_) => None,
        }
    }

    fn replace_str(&self, text: &str, apply_defaults: bool, changed: &mut bool) -> String {
        RE_MACRO
            .replace_all(text, |caps: &regex_lite::Captures| {
                match self.resolve(&caps[1], apply_defaults) {
                    Some(replacement) => {
                        *changed = true;
                        replacement
                    }
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn replace_value(&self, value: &mut Value, apply_defaults: bool, changed: &mut bool) {
        match value {
            Value::String(s) => {
                let replaced = self.replace_str(s, apply_defaults, changed);
                if replaced != *s {
                    *s = replaced;
                }
            }
            Value::Sequence(seq) => {
                for v in seq {
                    self.replace_value(v, apply_defaults, changed);
                }
            }
            Value::Mapping(map) => {
                for (_, v) in map.iter_mut() {
                    self.replace_value(v, apply_defaults, changed);
                }
            }
            _ => {}
        }
    }

    /// Substitute macros to a fixed point and return the rendered context.
    /// Keys that stay unresolved keep their literal `${...}` text; unknown
    /// ones are reported once.
    pub fn render(&self) -> Context {
        let mut current = self.clone();
        for _pass in 0..MAX_RENDER_PASSES {
            let snapshot = current.clone();
            let mut changed = false;
            for (_, v) in current.values.iter_mut() {
                snapshot.replace_value(v, false, &mut changed);
            }
            if !changed {
                let mut defaulted = false;
                for (_, v) in current.values.iter_mut() {
                    snapshot.replace_value(v, true, &mut defaulted);
                }
                if !defaulted {
                    current.report_unresolved();
                    return current;
                }
            }
        }
        warn!("Macro substitution did not converge after {} passes", MAX_RENDER_PASSES);
        current.report_unresolved();
        current
    }

    fn report_unresolved(&self) {
        for (key, value) in &self.values {
            self.scan_unresolved(key, value);
        }
    }

    fn scan_unresolved(&self, key: &str, value: &Value) {
        match value {
            Value::String(s) => {
                for caps in RE_MACRO.captures_iter(s) {
                    let expr = caps[1].trim().to_string();
                    let name = expr.split('|').next().unwrap_or(&expr).trim();
                    if self.is_defined(name) {
                        debug!("Macro '${{{}}}' in '{}' is declared but unset", expr, key);
                    } else if WARNED.lock().unwrap().insert(expr.clone()) {
                        warn!("Could not resolve macro '${{{}}}' in '{}'", expr, key);
                    }
                }
            }
            Value::Sequence(seq) => {
                for v in seq {
                    self.scan_unresolved(key, v);
                }
            }
            Value::Mapping(map) => {
                for (_, v) in map {
                    self.scan_unresolved(key, v);
                }
            }
            _ => {}
        }
    }

    /// The flat `(key, value)` pairs of the current test-case assignment.
    pub fn curr_values(&self) -> Vec<(String, String)> {
        match self.get("curr") {
            Some(Value::Mapping(map)) => map
                .iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), value_to_string(v))))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn mapping(&self, key: &str) -> Option<&Mapping> {
        self.get(key).and_then(|v| v.as_mapping())
    }

    pub fn sequence(&self, key: &str) -> Option<&Vec<Value>> {
        self.get(key).and_then(|v| v.as_sequence())
    }

    pub fn time_value(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            Some(v) => crate::util::time2sec(v),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn ctx(pairs: &[(&str, &str)]) -> Context {
        let mut c = Context::new();
        for (k, v) in pairs {
            c.set(k, yaml(v));
        }
        c
    }

    #[test]
    fn flat_projection_reaches_nested_fields() {
        let mut c = Context::new();
        c.set("node", yaml("{host: example.org, access: [{class: ssh, username: bench}]}"));
        assert_eq!(c.get_str("node.host"), Some("example.org"));
        assert_eq!(c.get_str("node.access.0.class"), Some("ssh"));
        assert_eq!(c.get_str("node.access.0.username"), Some("bench"));
    }

    #[test]
    fn named_sequence_elements_project_by_name() {
        let mut c = Context::new();
        c.set("app.files", yaml("[{name: cfg, contents: hello}]"));
        assert_eq!(c.get_str("app.files.cfg.contents"), Some("hello"));
    }

    #[test]
    fn fork_is_independent() {
        let parent = ctx(&[("a", "1")]);
        let mut child = parent.fork();
        child.set("a", yaml("2"));
        assert_eq!(parent.get_string("a").as_deref(), Some("1"));
        assert_eq!(child.get_string("a").as_deref(), Some("2"));
    }

    #[test]
    fn render_replaces_known_keys() {
        let c = ctx(&[("host", "example.org"), ("target", "'ssh ${host}'")]);
        let r = c.render();
        assert_eq!(r.get_str("target"), Some("ssh example.org"));
    }

    #[test]
    fn render_is_iterative() {
        let c = ctx(&[
            ("a", "'${b}-x'"),
            ("b", "'${c}'"),
            ("c", "leaf"),
        ]);
        let r = c.render();
        assert_eq!(r.get_str("a"), Some("leaf-x"));
    }

    #[test]
    fn render_is_idempotent() {
        let c = ctx(&[("a", "'${b}'"), ("b", "v")]);
        let once = c.render();
        let twice = once.render();
        assert_eq!(once.get_str("a"), twice.get_str("a"));
    }

    #[test]
    fn defaults_apply_only_when_missing() {
        let c = ctx(&[("present", "yes"), ("s", "'${present|no}-${absent|fallback}'")]);
        let r = c.render();
        assert_eq!(r.get_str("s"), Some("yes-fallback"));
    }

    #[test]
    fn unknown_macros_stay_literal() {
        let c = ctx(&[("s", "'${nobody.knows}'")]);
        let r = c.render();
        assert_eq!(r.get_str("s"), Some("${nobody.knows}"));
    }

    #[test]
    fn arithmetic_macros() {
        let c = ctx(&[("n", "4"), ("s", "'${n * 2 + 1}'")]);
        let r = c.render();
        assert_eq!(r.get_str("s"), Some("9"));
    }

    #[test]
    fn renders_inside_sequences_and_mappings() {
        let c = ctx(&[("v", "7"), ("m", "{args: ['-n', '${v}'], nested: {x: '${v}'}}")]);
        let r = c.render();
        assert_eq!(r.get_str("m.args.1"), Some("7"));
        assert_eq!(r.get_str("m.nested.x"), Some("7"));
    }
}
