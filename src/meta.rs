//! Environment metadata capture.
//!
//! A trial manifest carries a snapshot of the environment it ran in: host
//! facts, process facts, and git facts. Providers are named with dotted keys
//! (`"git.commit"`) that expand into a nested JSON object. A provider that
//! fails is skipped with a warning; metadata capture never fails a trial.

use std::collections::BTreeMap;
use std::process::Command;

use serde_json::{json, Value};
use tracing::{debug, warn};

/// A single metadata provider: a dotted key plus a fallible producer.
pub type MetaProvider = fn() -> Option<Value>;

/// Default provider set: system, process, and git facts.
#[must_use]
pub fn default_providers() -> Vec<(&'static str, MetaProvider)> {
    vec![
        ("system.os", || Some(json!(std::env::consts::OS))),
        ("system.arch", || Some(json!(std::env::consts::ARCH))),
        ("system.host", host_name),
        ("system.user", || {
            std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok()
                .map(Value::from)
        }),
        ("system.cwd", || {
            std::env::current_dir()
                .ok()
                .map(|p| Value::from(p.to_string_lossy().into_owned()))
        }),
        ("process.pid", || Some(json!(std::process::id()))),
        ("package.version", || {
            Some(json!(env!("CARGO_PKG_VERSION")))
        }),
        ("git.commit", || git_output(&["rev-parse", "HEAD"])),
        ("git.branch", || git_output(&["branch", "--show-current"])),
        ("git.describe", || {
            git_output(&["describe", "--dirty", "--tags", "--long", "--always"])
        }),
    ]
}

/// Capture metadata from the given providers into one nested JSON object.
///
/// Dotted keys nest: `"git.commit"` lands at `meta["git"]["commit"]`.
#[must_use]
pub fn capture_meta(providers: &[(&str, MetaProvider)]) -> Value {
    let mut meta = BTreeMap::new();
    for (key, provider) in providers {
        debug!(key, "capture metadata");
        let Some(value) = provider() else {
            warn!(key, "metadata provider yielded nothing, skipping");
            continue;
        };
        insert_dotted(&mut meta, key, value);
    }
    to_value(meta)
}

/// Capture metadata from the default provider set.
#[must_use]
pub fn capture_default_meta() -> Value {
    capture_meta(&default_providers())
}

fn insert_dotted(meta: &mut BTreeMap<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            meta.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = meta
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(map) = slot {
                let mut nested: BTreeMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                insert_dotted(&mut nested, rest, value);
                *slot = to_value(nested);
            }
        }
    }
}

fn to_value(map: BTreeMap<String, Value>) -> Value {
    Value::Object(map.into_iter().collect())
}

fn host_name() -> Option<Value> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| shell_output("hostname", &[]))
        .map(Value::from)
}

fn git_output(args: &[&str]) -> Option<Value> {
    shell_output("git", args).map(Value::from)
}

fn shell_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
