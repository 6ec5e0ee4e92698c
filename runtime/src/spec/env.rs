//! Environment merging.

use std::collections::HashMap;

/// Standard PATH for images that declare no environment.
pub const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Merge `overrides` into `defaults`, keyed by variable name.
///
/// `KEY=VALUE` replaces the slot for `KEY` in place, or appends when the
/// key is new. A bare `KEY` removes that slot. Removed slots are dropped
/// at the end, so relative order is kept.
pub fn replace_or_append_env(defaults: &[String], overrides: &[String]) -> Vec<String> {
    let mut slots: Vec<Option<String>> = Vec::with_capacity(defaults.len() + overrides.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in defaults {
        index.insert(env_key(entry).to_string(), slots.len());
        slots.push(Some(entry.clone()));
    }

    for value in overrides {
        if !value.contains('=') {
            if let Some(&i) = index.get(value.as_str()) {
                slots[i] = None;
            }
            continue;
        }

        match index.get(env_key(value)) {
            Some(&i) => slots[i] = Some(value.clone()),
            None => {
                index.insert(env_key(value).to_string(), slots.len());
                slots.push(Some(value.clone()));
            }
        }
    }

    slots.into_iter().flatten().collect()
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}
