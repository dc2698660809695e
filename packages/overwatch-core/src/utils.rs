//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deep-merges `overlay` into `base` for JSON objects.
///
/// Object values merge recursively; any other value in `overlay` replaces the
/// corresponding value in `base`. Used for config-node attachment, where the
/// config node's payload takes precedence over the sink node's own config.
pub fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(
                    base_map.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }

    #[test]
    fn deep_merge_overlay_wins_on_scalars() {
        let mut base = json!({"confidence": 0.5, "classes": [0, 1]});
        deep_merge(&mut base, &json!({"confidence": 0.8}));
        assert_eq!(base, json!({"confidence": 0.8, "classes": [0, 1]}));
    }

    #[test]
    fn deep_merge_recurses_into_objects() {
        let mut base = json!({"outer": {"a": 1, "b": 2}});
        deep_merge(&mut base, &json!({"outer": {"b": 3, "c": 4}}));
        assert_eq!(base, json!({"outer": {"a": 1, "b": 3, "c": 4}}));
    }

    #[test]
    fn deep_merge_replaces_mismatched_kinds() {
        let mut base = json!({"zone": [1, 2]});
        deep_merge(&mut base, &json!({"zone": {"kind": "poly"}}));
        assert_eq!(base, json!({"zone": {"kind": "poly"}}));
    }
}
