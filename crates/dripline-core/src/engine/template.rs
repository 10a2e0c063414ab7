//! Variable substitution for message content and external-call templates.
//!
//! Supports `{{field}}` tokens (whitespace inside the braces is ignored).
//! Lookup order: the subject's `email`, then subject attributes, then the
//! enrollment's accumulated variables. Both attribute and variable lookups
//! accept dotted paths into nested objects (e.g. `{{lookup.status}}`).
//! Unknown references are left as-is, not errors.

use serde_json::{Map, Value};

use dripline_types::subject::Subject;

/// Resolve every `{{field}}` token in `input`.
pub fn resolve_template(
    input: &str,
    subject: &Subject,
    variables: &Map<String, Value>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let token = after[..end].trim();
                match lookup(token, subject, variables) {
                    Some(value) => out.push_str(&value_to_string(&value)),
                    None => {
                        // Leave the unresolved token in place.
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unmatched opener; emit it literally and stop scanning.
                out.push_str("{{");
                rest = after;
                break;
            }
        }
    }

    out.push_str(rest);
    out
}

fn lookup(token: &str, subject: &Subject, variables: &Map<String, Value>) -> Option<Value> {
    if token.is_empty() {
        return None;
    }
    if token == "email" {
        // The one field every subject carries outside the attribute map.
        return Some(Value::String(subject.email.clone()));
    }
    path_lookup(&subject.attributes, token)
        .or_else(|| path_lookup(variables, token))
        .cloned()
}

/// Walk a dotted path through nested JSON objects.
///
/// Also shared by the Variable condition source (`variables.lookup.status`
/// style paths).
pub fn path_lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = root.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Render a JSON value for interpolation into text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn subject_with(attributes: Value) -> Subject {
        let now = Utc::now();
        Subject {
            id: Uuid::now_v7(),
            email: "ada@example.com".to_string(),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            tags: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn substitutes_email_from_subject() {
        let subject = subject_with(json!({}));
        let vars = Map::new();
        assert_eq!(
            resolve_template("to: {{email}}", &subject, &vars),
            "to: ada@example.com"
        );
    }

    #[test]
    fn substitutes_subject_attributes() {
        let subject = subject_with(json!({ "first_name": "Ada", "plan": "pro" }));
        let vars = Map::new();
        assert_eq!(
            resolve_template("Hi {{first_name}}, enjoy {{ plan }}!", &subject, &vars),
            "Hi Ada, enjoy pro!"
        );
    }

    #[test]
    fn substitutes_variables_with_dotted_paths() {
        let subject = subject_with(json!({}));
        let mut vars = Map::new();
        vars.insert("lookup".to_string(), json!({ "status": 200 }));
        assert_eq!(
            resolve_template("status={{lookup.status}}", &subject, &vars),
            "status=200"
        );
    }

    #[test]
    fn attributes_win_over_variables() {
        let subject = subject_with(json!({ "city": "London" }));
        let mut vars = Map::new();
        vars.insert("city".to_string(), json!("Paris"));
        assert_eq!(resolve_template("{{city}}", &subject, &vars), "London");
    }

    #[test]
    fn unknown_tokens_left_in_place() {
        let subject = subject_with(json!({}));
        let vars = Map::new();
        assert_eq!(
            resolve_template("Hello {{nobody}}", &subject, &vars),
            "Hello {{nobody}}"
        );
    }

    #[test]
    fn unmatched_opener_is_literal() {
        let subject = subject_with(json!({ "a": 1 }));
        let vars = Map::new();
        assert_eq!(resolve_template("oops {{a", &subject, &vars), "oops {{a");
    }

    #[test]
    fn null_renders_empty() {
        let subject = subject_with(json!({ "gone": null }));
        let vars = Map::new();
        assert_eq!(resolve_template("[{{gone}}]", &subject, &vars), "[]");
    }

    #[test]
    fn path_lookup_walks_nested_objects() {
        let mut root = Map::new();
        root.insert("a".to_string(), json!({ "b": { "c": "deep" } }));
        assert_eq!(path_lookup(&root, "a.b.c"), Some(&json!("deep")));
        assert_eq!(path_lookup(&root, "a.b.missing"), None);
        assert_eq!(path_lookup(&root, "a.b"), Some(&json!({ "c": "deep" })));
    }
}
