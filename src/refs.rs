//! `@ref` parsing and resolution.
//!
//! Grammar:
//! ```text
//! ref  := '@' ('input' path? | 'item' path? | stepName path?)
//! path := ('.' ident | '.' index)+
//! ident := [A-Za-z_][A-Za-z0-9_]*
//! index := [0-9]+
//! ```
//!
//! A value that is *exactly* a single `@ref` substitutes the typed value
//! it resolves to; any other string has every `@ref` substring
//! interpolated as text. `@` characters not forming a valid ref are left
//! untouched.

use crate::types::{Condition, ConditionOperator, RefContext};
use serde_json::Value;
use std::collections::HashSet;

/// One segment of a resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    Index(usize),
}

/// The root a ref resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RefRoot {
    Input,
    Item,
    Step(String),
}

/// A fully parsed `@ref` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRef {
    root: RefRoot,
    path: Vec<PathSegment>,
}

/// A structured resolution failure — traversal hit a null/primitive, or a
/// step/root name had no matching value.
#[derive(Debug, Clone)]
pub struct RefResolutionError {
    pub r#ref: String,
    pub reason: String,
}

/// Parse one `@ref` starting at byte offset 0 of `s`. Returns the parsed
/// ref plus how many bytes of `s` it consumed, or `None` if `s` doesn't
/// start with a valid ref.
fn parse_ref_at(s: &str) -> Option<(ParsedRef, usize)> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'@') {
        return None;
    }
    let mut pos = 1;

    // root identifier: [A-Za-z_][A-Za-z0-9_]*
    let root_start = pos;
    if pos >= bytes.len() || !is_ident_start(bytes[pos]) {
        return None;
    }
    pos += 1;
    while pos < bytes.len() && is_ident_continue(bytes[pos]) {
        pos += 1;
    }
    let root_name = &s[root_start..pos];

    let root = match root_name {
        "input" => RefRoot::Input,
        "item" => RefRoot::Item,
        other => RefRoot::Step(other.to_string()),
    };

    let mut path = Vec::new();
    loop {
        if pos >= bytes.len() || bytes[pos] != b'.' {
            break;
        }
        let dot_pos = pos;
        pos += 1;

        if pos < bytes.len() && bytes[pos].is_ascii_digit() {
            let seg_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            let idx: usize = s[seg_start..pos].parse().unwrap_or(0);
            path.push(PathSegment::Index(idx));
        } else if pos < bytes.len() && is_ident_start(bytes[pos]) {
            let seg_start = pos;
            pos += 1;
            while pos < bytes.len() && is_ident_continue(bytes[pos]) {
                pos += 1;
            }
            path.push(PathSegment::Field(s[seg_start..pos].to_string()));
        } else {
            // trailing dot with no valid segment — not part of the ref
            pos = dot_pos;
            break;
        }
    }

    Some((ParsedRef { root, path }, pos))
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parse a string that is expected to be exactly one `@ref` (no surrounding
/// text). Returns `None` if it isn't.
pub fn parse_whole_ref(s: &str) -> Option<ParsedRef> {
    let (parsed, consumed) = parse_ref_at(s)?;
    if consumed == s.len() { Some(parsed) } else { None }
}

/// Find every `@ref` occurrence within a string, each paired with its exact
/// source substring.
fn find_refs(s: &str) -> Vec<(String, ParsedRef)> {
    let mut out = Vec::new();
    let mut search_from = 0usize;
    while let Some(rel) = s[search_from..].find('@') {
        let at = search_from + rel;
        if let Some((parsed, consumed)) = parse_ref_at(&s[at..]) {
            out.push((s[at..at + consumed].to_string(), parsed));
            search_from = at + consumed.max(1);
        } else {
            search_from = at + 1;
        }
    }
    out
}

fn traverse<'a>(
    root_value: &'a Value,
    path: &[PathSegment],
) -> Result<&'a Value, String> {
    let mut current = root_value;
    for (i, seg) in path.iter().enumerate() {
        match (current, seg) {
            (Value::Object(map), PathSegment::Field(name)) => {
                current = map
                    .get(name)
                    .ok_or_else(|| format!("no field `{name}` at path segment {i}"))?;
            }
            (Value::Array(arr), PathSegment::Index(idx)) => {
                current = arr
                    .get(*idx)
                    .ok_or_else(|| format!("index {idx} out of bounds at path segment {i}"))?;
            }
            (Value::Null, _) | (Value::Bool(_), _) | (Value::Number(_), _) | (Value::String(_), _) => {
                return Err(format!("cannot traverse into a scalar at path segment {i}"));
            }
            (Value::Object(_), PathSegment::Index(_)) => {
                return Err(format!("expected an array index but found an object at path segment {i}"));
            }
            (Value::Array(_), PathSegment::Field(_)) => {
                return Err(format!("expected a field name but found an array at path segment {i}"));
            }
        }
    }
    Ok(current)
}

fn root_value<'a>(root: &RefRoot, ctx: &'a RefContext) -> Result<&'a Value, String> {
    match root {
        RefRoot::Input => Ok(&ctx.workflow_input),
        RefRoot::Item => ctx.item.as_ref().ok_or_else(|| "no `@item` in this context".to_string()),
        RefRoot::Step(name) => ctx
            .step_outputs
            .get(name)
            .ok_or_else(|| format!("no completed step named `{name}`")),
    }
}

fn resolve_parsed<'a>(parsed: &ParsedRef, ctx: &'a RefContext) -> Result<&'a Value, String> {
    let root = root_value(&parsed.root, ctx)?;
    traverse(root, &parsed.path)
}

/// Render a resolved value as interpolated text (used when a ref appears
/// as a substring of a larger string, rather than the whole value).
fn interpolate_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

/// Resolve every `@ref` found anywhere within `input` (recursing through
/// arrays/objects). Best-effort: unresolvable refs are reported in the
/// returned error list but don't stop resolution of the rest of the value.
pub fn resolve_all_refs(input: &Value, ctx: &RefContext) -> (Value, Vec<RefResolutionError>) {
    let mut errors = Vec::new();
    let resolved = resolve_value(input, ctx, &mut errors);
    (resolved, errors)
}

fn resolve_value(input: &Value, ctx: &RefContext, errors: &mut Vec<RefResolutionError>) -> Value {
    match input {
        Value::String(s) => resolve_string(s, ctx, errors),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| resolve_value(v, ctx, errors)).collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx, errors)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, ctx: &RefContext, errors: &mut Vec<RefResolutionError>) -> Value {
    if let Some(parsed) = parse_whole_ref(s) {
        return match resolve_parsed(&parsed, ctx) {
            Ok(v) => v.clone(),
            Err(reason) => {
                errors.push(RefResolutionError { r#ref: s.to_string(), reason });
                Value::Null
            }
        };
    }

    let refs = find_refs(s);
    if refs.is_empty() {
        return Value::String(s.to_string());
    }

    let mut out = String::new();
    let mut last_end = 0usize;
    for (raw, parsed) in refs {
        let Some(start) = s[last_end..].find(&raw).map(|p| p + last_end) else {
            continue;
        };
        out.push_str(&s[last_end..start]);
        match resolve_parsed(&parsed, ctx) {
            Ok(v) => out.push_str(&interpolate_text(v)),
            Err(reason) => {
                errors.push(RefResolutionError { r#ref: raw.clone(), reason });
            }
        }
        last_end = start + raw.len();
    }
    out.push_str(&s[last_end..]);
    Value::String(out)
}

/// Collect the set of distinct `@ref` source substrings appearing anywhere
/// in `input`.
pub fn extract_refs(input: &Value) -> HashSet<String> {
    let mut set = HashSet::new();
    collect_refs(input, &mut set);
    set
}

fn collect_refs(input: &Value, set: &mut HashSet<String>) {
    match input {
        Value::String(s) => {
            for (raw, _) in find_refs(s) {
                set.insert(raw);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, set)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, set)),
        _ => {}
    }
}

/// Step names (excluding the built-in `input`/`item`/`index` roots) that a
/// ref string depends on. Used by the DAG analyzer to build dependency
/// edges.
pub fn step_dependency(r#ref: &str) -> Option<String> {
    let parsed = parse_whole_ref(r#ref).or_else(|| {
        find_refs(r#ref).into_iter().next().map(|(_, p)| p)
    })?;
    match parsed.root {
        RefRoot::Step(name) => Some(name),
        _ => None,
    }
}

/// Outcome of evaluating a `Condition`.
pub struct ConditionOutcome {
    pub satisfied: bool,
    pub error: Option<RefResolutionError>,
}

/// Evaluate a branch condition. A missing left-hand ref yields
/// `satisfied = false` plus an error — callers (the Executor) treat
/// evaluation errors as "do not skip" (fail open on predicates), so this
/// return shape keeps both pieces of information available.
pub fn evaluate_condition(cond: &Condition, ctx: &RefContext) -> ConditionOutcome {
    let parsed = match parse_whole_ref(&cond.r#ref) {
        Some(p) => p,
        None => {
            return ConditionOutcome {
                satisfied: false,
                error: Some(RefResolutionError {
                    r#ref: cond.r#ref.clone(),
                    reason: "not a valid @ref expression".to_string(),
                }),
            };
        }
    };

    let left = match resolve_parsed(&parsed, ctx) {
        Ok(v) => v,
        Err(reason) => {
            return ConditionOutcome {
                satisfied: false,
                error: Some(RefResolutionError { r#ref: cond.r#ref.clone(), reason }),
            };
        }
    };

    let satisfied = compare(left, &cond.value, cond.operator);
    ConditionOutcome { satisfied, error: None }
}

fn compare(left: &Value, right: &Value, op: ConditionOperator) -> bool {
    match op {
        ConditionOperator::Eq => left == right,
        ConditionOperator::Ne => left != right,
        ConditionOperator::Gt | ConditionOperator::Gte | ConditionOperator::Lt | ConditionOperator::Lte => {
            match (as_f64(left), as_f64(right)) {
                (Some(l), Some(r)) => apply_ordering(l.partial_cmp(&r), op),
                _ => {
                    let l = interpolate_text(left);
                    let r = interpolate_text(right);
                    apply_ordering(l.partial_cmp(&r), op)
                }
            }
        }
    }
}

fn apply_ordering(ord: Option<std::cmp::Ordering>, op: ConditionOperator) -> bool {
    use std::cmp::Ordering::*;
    match (ord, op) {
        (Some(Greater), ConditionOperator::Gt) => true,
        (Some(Equal) | Some(Greater), ConditionOperator::Gte) => true,
        (Some(Less), ConditionOperator::Lt) => true,
        (Some(Equal) | Some(Less), ConditionOperator::Lte) => true,
        _ => false,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RefContext {
        let mut step_outputs = std::collections::HashMap::new();
        step_outputs.insert("a".to_string(), json!({"x": 1, "list": [10, 20]}));
        RefContext {
            step_outputs,
            workflow_input: json!({"seed": 42, "name": "ok"}),
            item: Some(json!({"n": 7})),
            index: Some(2),
        }
    }

    #[test]
    fn whole_ref_substitutes_typed_value() {
        let (resolved, errors) = resolve_all_refs(&json!("@a.x"), &ctx());
        assert!(errors.is_empty());
        assert_eq!(resolved, json!(1));
    }

    #[test]
    fn whole_ref_into_array_index() {
        let (resolved, errors) = resolve_all_refs(&json!("@a.list.1"), &ctx());
        assert!(errors.is_empty());
        assert_eq!(resolved, json!(20));
    }

    #[test]
    fn interpolates_within_larger_string() {
        let (resolved, errors) = resolve_all_refs(&json!("hello @input.name, x=@a.x!"), &ctx());
        assert!(errors.is_empty());
        assert_eq!(resolved, json!("hello ok, x=1!"));
    }

    #[test]
    fn non_matching_at_is_preserved() {
        let (resolved, errors) = resolve_all_refs(&json!("user@example.com"), &ctx());
        // `@example` parses as a ref to a nonexistent step "example" with a
        // trailing `.com` path segment, so this documents the edge case:
        // any `@ident` substring is a candidate ref by grammar, and an
        // unresolvable one surfaces as an error rather than silently
        // passing through.
        assert_eq!(errors.len(), 1);
        assert!(matches!(resolved, Value::String(_)));
    }

    #[test]
    fn missing_step_is_a_resolution_error() {
        let (resolved, errors) = resolve_all_refs(&json!("@missing.x"), &ctx());
        assert_eq!(resolved, Value::Null);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].r#ref, "@missing.x");
    }

    #[test]
    fn recurses_into_nested_structures() {
        let input = json!({"a": ["@a.x", {"b": "@input.seed"}]});
        let (resolved, errors) = resolve_all_refs(&input, &ctx());
        assert!(errors.is_empty());
        assert_eq!(resolved, json!({"a": [1, {"b": 42}]}));
    }

    #[test]
    fn extract_refs_dedupes() {
        let input = json!(["@a.x", "@a.x", "@input.seed"]);
        let set = extract_refs(&input);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn step_dependency_ignores_builtins() {
        assert_eq!(step_dependency("@input.x"), None);
        assert_eq!(step_dependency("@item.x"), None);
        assert_eq!(step_dependency("@a.x"), Some("a".to_string()));
    }

    #[test]
    fn condition_eq_default_operator() {
        let cond = Condition {
            r#ref: "@a.x".to_string(),
            operator: ConditionOperator::Eq,
            value: json!(1),
        };
        let outcome = evaluate_condition(&cond, &ctx());
        assert!(outcome.satisfied);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn condition_missing_ref_fails_open_to_not_satisfied() {
        let cond = Condition {
            r#ref: "@missing.x".to_string(),
            operator: ConditionOperator::Eq,
            value: json!(1),
        };
        let outcome = evaluate_condition(&cond, &ctx());
        assert!(!outcome.satisfied);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn condition_numeric_ordering() {
        let cond = Condition {
            r#ref: "@a.x".to_string(),
            operator: ConditionOperator::Lt,
            value: json!(5),
        };
        assert!(evaluate_condition(&cond, &ctx()).satisfied);
    }

    #[test]
    fn resolve_all_refs_identity_for_no_at_input() {
        let input = json!({"a": 1, "b": [true, null, "plain text"]});
        let (resolved, errors) = resolve_all_refs(&input, &ctx());
        assert!(errors.is_empty());
        assert_eq!(resolved, input);
    }
}
