//! Tool-call argument canonicalization.
//!
//! `function.arguments` must always be a valid JSON string on the way out,
//! no matter whether the upstream produced an object, a malformed string,
//! or nothing at all.

use serde_json::Value;

/// Canonicalize an extracted `arguments` node to a JSON string.
pub fn canonicalize(node: Option<&Value>) -> String {
    match node {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => canonicalize_str(s),
        Some(v) => v.to_string(),
    }
}

fn canonicalize_str(s: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(s) {
        return v.to_string();
    }
    let repaired = repair_control_chars(s);
    if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
        return v.to_string();
    }
    serde_json::json!({ "input": s }).to_string()
}

/// Escape raw `\n` / `\r` / `\t` occurring *inside* string literals.
///
/// Walks the text tracking in-string and escape state; characters outside
/// string literals are left alone (bare whitespace is legal there).
pub fn repair_control_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut in_string = false;
    let mut escape = false;
    for c in s.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escape {
            out.push(c);
            escape = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escape = true;
            }
            '"' => {
                out.push(c);
                in_string = false;
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
