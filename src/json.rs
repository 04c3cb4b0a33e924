//! Helpers for working with untyped QMP JSON payloads.

use serde_json::Value;

/// Structural match: every key of `template` must be present in `candidate`
/// with a (recursively) equal value. Non-object nodes compare by equality.
///
/// This is the one comparison the daemon relies on for event filtering and
/// yank-target selection.
pub fn object_matches(template: &Value, candidate: &Value) -> bool {
    match (template, candidate) {
        (Value::Object(template), Value::Object(candidate)) => template
            .iter()
            .all(|(key, value)| match candidate.get(key) {
                Some(other) => object_matches(value, other),
                None => false,
            }),
        _ => template == candidate,
    }
}

/// True if `candidate` structurally matches any selector in `matches`.
pub fn object_matches_match_array(candidate: &Value, matches: &Value) -> bool {
    matches
        .as_array()
        .map(|selectors| selectors.iter().any(|sel| object_matches(sel, candidate)))
        .unwrap_or(false)
}

pub fn has_member(node: &Value, member: &str) -> bool {
    node.get(member).is_some()
}

pub fn member_str<'a>(node: &'a Value, member: &str) -> Option<&'a str> {
    node.get(member)?.as_str()
}

pub fn member_member_str<'a>(node: &'a Value, outer: &str, inner: &str) -> Option<&'a str> {
    node.get(outer)?.get(inner)?.as_str()
}
