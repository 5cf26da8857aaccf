//! Environment-variable overrides for the config tree.
//!
//! Uppercase variables with a `__` delimiter map onto nested config keys:
//! `CONCURRENCY__PIPELINE=50` sets `concurrency.pipeline`. Segments are
//! lowercased, so single underscores survive inside a key
//! (`PLUGIN__RUNTIME_WS_URL` targets `plugin.runtime_ws_url`).
//!
//! Only scalar targets are overridden; objects and arrays are left alone
//! and must be edited through the file. Coercion follows the existing
//! value's type: bool accepts `true|1|yes|on` (any case), numbers parse or
//! fall back to the raw string.

use serde_json::Value;

/// Apply overrides from an environment iterator onto a JSON config tree.
///
/// Applying the same environment twice is idempotent.
pub fn apply_env_overrides<I>(tree: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, raw) in vars {
        if !name.contains("__") {
            continue;
        }
        let segments: Vec<String> = name.split("__").map(|s| s.to_ascii_lowercase()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            continue;
        }
        override_path(tree, &segments, &raw);
    }
}

fn override_path(tree: &mut Value, segments: &[String], raw: &str) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = tree;
    for segment in parents {
        match node.get_mut(segment) {
            Some(next) => node = next,
            // Only existing paths are overridden; unknown keys are not created.
            None => return,
        }
    }

    let Some(existing) = node.get(last) else {
        return;
    };
    if existing.is_object() || existing.is_array() {
        tracing::debug!(key = %segments.join("."), "env override skipped non-scalar target");
        return;
    }

    let coerced = coerce(existing, raw);
    if let Some(obj) = node.as_object_mut() {
        obj.insert(last.clone(), coerced);
    }
}

/// Coerce `raw` following the type of the value currently in the tree.
fn coerce(existing: &Value, raw: &str) -> Value {
    match existing {
        Value::Bool(_) => Value::Bool(matches!(
            raw.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )),
        Value::Number(n) => {
            if n.is_f64() {
                raw.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(raw.to_string()))
            } else {
                raw.parse::<i64>()
                    .map(|v| Value::Number(v.into()))
                    .unwrap_or_else(|_| Value::String(raw.to_string()))
            }
        }
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn simple_int_override() {
        let mut tree = json!({"api": {"port": 5300}});
        apply_env_overrides(&mut tree, vars(&[("API__PORT", "8080")]));
        assert_eq!(tree["api"]["port"], json!(8080));
    }

    #[test]
    fn nested_override_leaves_siblings() {
        let mut tree = json!({"concurrency": {"pipeline": 20, "session": 1}});
        apply_env_overrides(&mut tree, vars(&[("CONCURRENCY__PIPELINE", "50")]));
        assert_eq!(tree["concurrency"]["pipeline"], json!(50));
        assert_eq!(tree["concurrency"]["session"], json!(1));
    }

    #[test]
    fn deep_nesting_and_strings() {
        let mut tree = json!({"system": {"jwt": {"expire": 604800, "secret": ""}}});
        apply_env_overrides(
            &mut tree,
            vars(&[
                ("SYSTEM__JWT__EXPIRE", "86400"),
                ("SYSTEM__JWT__SECRET", "my_secret_key"),
            ]),
        );
        assert_eq!(tree["system"]["jwt"]["expire"], json!(86400));
        assert_eq!(tree["system"]["jwt"]["secret"], json!("my_secret_key"));
    }

    #[test]
    fn underscore_inside_key_segment() {
        let mut tree = json!({"plugin": {"runtime_ws_url": "ws://localhost:5400/control/ws"}});
        apply_env_overrides(
            &mut tree,
            vars(&[("PLUGIN__RUNTIME_WS_URL", "ws://newhost:6000/ws")]),
        );
        assert_eq!(tree["plugin"]["runtime_ws_url"], json!("ws://newhost:6000/ws"));
    }

    #[test]
    fn bool_coercion_variants() {
        let mut tree = json!({"plugin": {"enable": true, "enable_marketplace": false}});
        apply_env_overrides(
            &mut tree,
            vars(&[
                ("PLUGIN__ENABLE", "false"),
                ("PLUGIN__ENABLE_MARKETPLACE", "YES"),
            ]),
        );
        assert_eq!(tree["plugin"]["enable"], json!(false));
        assert_eq!(tree["plugin"]["enable_marketplace"], json!(true));
    }

    #[test]
    fn dict_targets_ignored() {
        let mut tree = json!({"database": {"use": "sqlite", "sqlite": {"path": "data/app.db"}}});
        apply_env_overrides(&mut tree, vars(&[("DATABASE__SQLITE", "new_value")]));
        assert!(tree["database"]["sqlite"].is_object());
        assert_eq!(tree["database"]["sqlite"]["path"], json!("data/app.db"));
    }

    #[test]
    fn unknown_keys_not_created() {
        let mut tree = json!({"api": {"port": 1}});
        apply_env_overrides(&mut tree, vars(&[("NOPE__MISSING", "x")]));
        assert!(tree.get("nope").is_none());
    }

    #[test]
    fn unparsable_number_falls_back_to_string() {
        let mut tree = json!({"api": {"port": 5300}});
        apply_env_overrides(&mut tree, vars(&[("API__PORT", "not-a-number")]));
        assert_eq!(tree["api"]["port"], json!("not-a-number"));
    }

    #[test]
    fn idempotent_for_same_environment() {
        let mut tree = json!({"api": {"port": 5300}, "plugin": {"enable": false}});
        let env = vars(&[("API__PORT", "9000"), ("PLUGIN__ENABLE", "on")]);
        apply_env_overrides(&mut tree, env.clone());
        let snapshot = tree.clone();
        apply_env_overrides(&mut tree, env);
        assert_eq!(tree, snapshot);
    }

    #[test]
    fn float_coercion_keeps_float_type() {
        let mut tree = json!({"output": {"force_delay": {"min": 0.5}}});
        apply_env_overrides(&mut tree, vars(&[("OUTPUT__FORCE_DELAY__MIN", "1.5")]));
        assert_eq!(tree["output"]["force_delay"]["min"], json!(1.5));
    }
}
