//! Config validation - warns about unknown fields

use serde_json::{Map, Value};
use tracing::warn;

/// One accepted key: a plain value, or a section with its own keys
enum Key {
    Value(&'static str),
    Section(&'static str, &'static [Key]),
}

impl Key {
    fn name(&self) -> &'static str {
        match self {
            Key::Value(name) | Key::Section(name, _) => name,
        }
    }
}

const RETRY: &[Key] = &[
    Key::Value("intervalMs"),
    Key::Value("maxAttempts"),
    Key::Value("backoffFactor"),
    Key::Value("maxIntervalMs"),
];

const CONNECTION: &[Key] = &[
    Key::Value("maxMessageSize"),
    Key::Value("pongWaitMs"),
    Key::Value("sendTimeoutMs"),
    Key::Section("retry", RETRY),
];

const HUB: &[Key] = &[Key::Value("commandCapacity"), Key::Value("requestCapacity")];

const ROOT: &[Key] = &[
    Key::Section("connection", CONNECTION),
    Key::Section("hub", HUB),
];

/// Validate JSON config and warn about unknown fields.
pub fn warn_unknown_fields(content: &str, config_name: &str) {
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(content) else {
        return;
    };

    let mut unknown = Vec::new();
    collect_unknown(&root, ROOT, &mut Vec::new(), &mut unknown);
    for path in unknown {
        warn!("Unknown config field in {config_name}: {path}");
    }
}

/// Push the dotted path of every key in `object` that `schema` does not
/// name, descending into known sections that hold objects.
fn collect_unknown<'a>(
    object: &'a Map<String, Value>,
    schema: &[Key],
    path: &mut Vec<&'a str>,
    unknown: &mut Vec<String>,
) {
    for (name, value) in object {
        path.push(name.as_str());
        match schema.iter().find(|key| key.name() == name) {
            None => unknown.push(path.join(".")),
            Some(Key::Section(_, keys)) => {
                if let Value::Object(section) = value {
                    collect_unknown(section, keys, path, unknown);
                }
            }
            Some(Key::Value(_)) => {}
        }
        path.pop();
    }
}
