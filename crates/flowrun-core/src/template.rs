//! `${name}` placeholder substitution over JSON parameter values.

use serde_json::Value;

use crate::types::Variables;

/// A rendered value plus the placeholders that could not be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub value: Value,
    pub unresolved: Vec<String>,
}

/// Look up a possibly dotted name (`a.b.0`) in the variables.
pub fn lookup<'a>(vars: &'a Variables, name: &str) -> Option<&'a Value> {
    let mut parts = name.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render every string leaf of `value`, recursing through arrays and objects.
///
/// A string consisting of exactly one placeholder is replaced by the
/// variable's value with its JSON type intact. Unresolved placeholders are
/// left in place.
pub fn render(value: &Value, vars: &Variables) -> Rendered {
    let mut unresolved = Vec::new();
    let value = render_value(value, vars, &mut unresolved);
    unresolved.dedup();
    Rendered { value, unresolved }
}

/// Render a single string into text.
pub fn render_str(input: &str, vars: &Variables) -> (String, Vec<String>) {
    let mut unresolved = Vec::new();
    let text = substitute(input, vars, &mut unresolved);
    (text, unresolved)
}

fn render_value(value: &Value, vars: &Variables, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = sole_placeholder(s) {
                if let Some(v) = lookup(vars, name) {
                    return v.clone();
                }
            }
            Value::String(substitute(s, vars, unresolved))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, vars, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains('}') || inner.contains("${") {
        return None;
    }
    Some(inner.trim())
}

fn substitute(input: &str, vars: &Variables, unresolved: &mut Vec<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if !closed {
                result.push_str("${");
                result.push_str(&name);
                continue;
            }
            match lookup(vars, name.trim()) {
                Some(Value::String(s)) => result.push_str(s),
                Some(other) => result.push_str(&other.to_string()),
                None => {
                    if !unresolved.contains(&name) {
                        unresolved.push(name.clone());
                    }
                    result.push_str(&format!("${{{}}}", name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.insert("topic".into(), json!("rust"));
        v.insert("count".into(), json!(3));
        v.insert("user".into(), json!({"name": "ada", "tags": ["x", "y"]}));
        v
    }

    #[test]
    fn test_interpolates_strings() {
        let (text, missing) = render_str("write about ${topic} x${count}", &vars());
        assert_eq!(text, "write about rust x3");
        assert!(missing.is_empty());
    }

    #[test]
    fn test_sole_placeholder_keeps_type() {
        let r = render(&json!({"n": "${count}", "u": "${user}"}), &vars());
        assert_eq!(r.value["n"], json!(3));
        assert_eq!(r.value["u"]["name"], "ada");
    }

    #[test]
    fn test_dotted_lookup() {
        let r = render(&json!(["${user.name}", "${user.tags.1}"]), &vars());
        assert_eq!(r.value, json!(["ada", "y"]));
    }

    #[test]
    fn test_unresolved_stays_literal() {
        let r = render(
            &json!({"a": "${missing}", "b": "hi ${missing} ${topic}"}),
            &vars(),
        );
        assert_eq!(r.value["a"], "${missing}");
        assert_eq!(r.value["b"], "hi ${missing} rust");
        assert_eq!(r.unresolved, vec!["missing"]);
    }

    #[test]
    fn test_unterminated_placeholder() {
        let (text, missing) = render_str("cost ${", &vars());
        assert_eq!(text, "cost ${");
        assert!(missing.is_empty());
    }
}
