//! `${...}` reference substitution.
//!
//! The same engine serves two moments: configuration load time (references
//! into the `env` map) and request time (references into the request
//! context, e.g. `${url.pathname}` in an upstream address template or a
//! log-line format). A reference the resolver does not know stays verbatim
//! so a later pass can pick it up.

use serde_json::Value;

const PREFIX: &str = "${";
const SUFFIX: char = '}';

/// Replace every resolvable `${name}` in `input`. Unresolved references are
/// left in place.
pub fn replace_str(input: &str, resolve: &dyn Fn(&str) -> Option<String>) -> String {
    replace_inner(input, resolve, None)
}

/// Replace every `${name}` in `input`, substituting `fallback` for
/// references the resolver does not know. Used for log lines, where a
/// missing field renders as `-` rather than template noise.
pub fn replace_str_or(
    input: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
    fallback: &str,
) -> String {
    replace_inner(input, resolve, Some(fallback))
}

fn replace_inner(
    input: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
    fallback: Option<&str>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(PREFIX) {
        let after = &rest[start + PREFIX.len()..];
        let Some(end) = after.find(SUFFIX) else {
            break;
        };
        let name = &after[..end];
        out.push_str(&rest[..start]);
        match resolve(name).or_else(|| fallback.map(str::to_string)) {
            Some(value) => out.push_str(&value),
            None => {
                // Keep the reference verbatim.
                out.push_str(PREFIX);
                out.push_str(name);
                out.push(SUFFIX);
            }
        }
        rest = &after[end + SUFFIX.len_utf8()..];
    }
    out.push_str(rest);
    out
}

/// Walk a JSON tree, replacing references inside every string value.
pub fn replace_value(value: &mut Value, resolve: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => {
            let replaced = replace_str(s, resolve);
            if replaced != *s {
                *s = replaced;
            }
        }
        Value::Array(items) => {
            for item in items {
                replace_value(item, resolve);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                replace_value(item, resolve);
            }
        }
        _ => {}
    }
}

/// Look up a dotted path (`env.hostname`) inside a JSON tree.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Render a scalar JSON value the way it should appear inside a string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "env.hostname" => Some("gateway.test".into()),
            "env.port" => Some("8080".into()),
            _ => None,
        }
    }

    #[test]
    fn single_reference_is_replaced() {
        assert_eq!(replace_str("${env.hostname}", &env), "gateway.test");
    }

    #[test]
    fn references_embed_in_text() {
        assert_eq!(
            replace_str("https://${env.hostname}:${env.port}/x", &env),
            "https://gateway.test:8080/x"
        );
    }

    #[test]
    fn unknown_references_stay_verbatim() {
        assert_eq!(
            replace_str("keep ${url.pathname} for later", &env),
            "keep ${url.pathname} for later"
        );
    }

    #[test]
    fn unknown_references_take_the_fallback_when_given() {
        assert_eq!(replace_str_or("got ${nope}", &env, "-"), "got -");
    }

    #[test]
    fn unterminated_reference_is_left_alone() {
        assert_eq!(replace_str("oops ${env.hostname", &env), "oops ${env.hostname");
    }

    #[test]
    fn whole_tree_replacement() {
        let mut value = serde_json::json!({
            "a": "${env.hostname}",
            "b": [{"c": "x-${env.port}"}],
            "d": 5
        });
        replace_value(&mut value, &env);
        assert_eq!(
            value,
            serde_json::json!({"a": "gateway.test", "b": [{"c": "x-8080"}], "d": 5})
        );
    }

    #[test]
    fn dotted_lookup() {
        let root = serde_json::json!({"env": {"nested": {"x": 1}}});
        assert_eq!(
            lookup_path(&root, "env.nested.x"),
            Some(&serde_json::json!(1))
        );
        assert_eq!(lookup_path(&root, "env.missing"), None);
    }
}
