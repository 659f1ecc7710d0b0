//! Runner inputs: extra variables and the private data directory layout.

use crate::controller::kind::ResourceKind;
use kube::api::DynamicObject;
use serde_json::{Map, Value, json};
use std::path::Path;

/// Inventory used for every run; automation talks to the cluster, not to hosts
const INVENTORY: &str =
    "localhost ansible_connection=local ansible_python_interpreter=\"{{ansible_playbook_python}}\"\n";

/// Build the extra variables for a run against `obj`.
///
/// The resource `spec` goes on top level (keys snake_cased when `snake_case` is set), the
/// object metadata under `ansible_operator_meta`, the raw object and spec under
/// `_{group}_{kind}` and `_{group}_{kind}_spec`, and finally `vars`, which
/// wins over everything else.
pub fn extra_vars(
    obj: &DynamicObject,
    kind: &ResourceKind,
    snake_case: bool,
    vars: &Map<String, Value>,
) -> Result<Map<String, Value>, serde_json::Error> {
    let spec = obj.data.get("spec").cloned().unwrap_or(Value::Object(Map::new()));
    let mut extra = Map::new();

    let parameters = if snake_case {
        snake_case_keys(spec.clone())
    } else {
        spec.clone()
    };
    if let Value::Object(parameters) = parameters {
        extra.extend(parameters);
    }

    extra.insert(
        "ansible_operator_meta".to_string(),
        json!({
            "name": obj.metadata.name.clone().unwrap_or_default(),
            "namespace": obj.metadata.namespace.clone().unwrap_or_default(),
        }),
    );

    let object_key = object_key(kind);
    extra.insert(format!("{object_key}_spec"), spec);
    extra.insert(object_key, serde_json::to_value(obj)?);

    for (key, value) in vars {
        extra.insert(key.clone(), value.clone());
    }
    Ok(extra)
}

/// `_cache_example_com_memcached` for `Memcached.cache.example.com`
#[must_use]
pub fn object_key(kind: &ResourceKind) -> String {
    format!(
        "_{}_{}",
        kind.group.replace(['.', '-'], "_"),
        kind.kind.to_lowercase()
    )
}

/// Convert every object key in `value` to snake_case, recursively
#[must_use]
pub fn snake_case_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (to_snake_case(&k), snake_case_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(snake_case_keys).collect()),
        other => other,
    }
}

/// `someURLPath` → `some_url_path`, `HTTPServer` → `http_server`
#[must_use]
pub fn to_snake_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            out.push('_');
            continue;
        }
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let after_word = prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit());
            let acronym_end = prev.is_some_and(char::is_uppercase)
                && next.is_some_and(char::is_lowercase);
            if (after_word || acronym_end) && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Lay out `env/extravars` and `inventory/hosts` under `dir`
pub fn write_private_data_dir(dir: &Path, extra_vars: &Map<String, Value>) -> std::io::Result<()> {
    let env_dir = dir.join("env");
    let inventory_dir = dir.join("inventory");
    std::fs::create_dir_all(&env_dir)?;
    std::fs::create_dir_all(&inventory_dir)?;

    let extra_vars = serde_json::to_vec(extra_vars).map_err(std::io::Error::other)?;
    std::fs::write(env_dir.join("extravars"), extra_vars)?;
    std::fs::write(inventory_dir.join("hosts"), INVENTORY)?;
    Ok(())
}
