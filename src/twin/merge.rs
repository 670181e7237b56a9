//! Patch merge engine
//!
//! Last-writer-wins per leaf key. `null` removes a key, objects merge
//! recursively with the same rule at every depth, anything else (arrays
//! included) replaces the existing value.

use chrono::Utc;
use serde_json::Value;

use super::types::{Patch, Properties, Section, Twin};

/// Merge `entries` into `target` in place
pub fn merge_into(target: &mut Properties, entries: &Properties) {
    for (key, value) in entries {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => match target.get_mut(key) {
                Some(Value::Object(existing)) => merge_into(existing, nested),
                _ => {
                    target.insert(key.clone(), Value::Object(strip_deletes(nested)));
                }
            },
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Apply a patch to its section and bump that section's version.
///
/// Application is unconditional: a patch that changes nothing still
/// produces a new version. Callers hold the device lock.
pub fn apply(twin: &mut Twin, patch: &Patch) -> u64 {
    let now = Utc::now();
    match patch.section {
        Section::Reported => {
            merge_into(&mut twin.reported, &patch.entries);
            twin.reported_version += 1;
            twin.reported_updated_at = Some(now);
            twin.reported_version
        }
        Section::Desired => {
            merge_into(&mut twin.desired, &patch.entries);
            twin.desired_version += 1;
            twin.desired_updated_at = Some(now);
            twin.desired_version
        }
    }
}

/// Copy of an inserted subtree without delete-markers
fn strip_deletes(map: &Properties) -> Properties {
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::Object(nested) => (k.clone(), Value::Object(strip_deletes(nested))),
            other => (k.clone(), other.clone()),
        })
        .collect()
}
