//! Per-node-type config schemas.
//!
//! Every node type has a fixed key set; unknown keys are rejected. The
//! checks here are pure and accumulate human-readable messages, which the
//! validator attaches to the owning node.

use serde_json::{Map, Value};

use super::NodeKind;

type Object = Map<String, Value>;

/// Validates a node's config against its type's schema.
///
/// Returns all problems found; an empty vector means the config is valid.
#[must_use]
pub fn validate_node_config(kind: NodeKind, config: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(object) = config.as_object() else {
        if !config.is_null() {
            errors.push("config must be an object".to_string());
        } else if requires_config(kind) {
            errors.push("config is required for this node type".to_string());
        }
        return errors;
    };

    match kind {
        NodeKind::Camera => camera_schema(object, &mut errors),
        NodeKind::VideoInput => video_input_schema(object, &mut errors),
        NodeKind::Youtube => youtube_schema(object, &mut errors),
        NodeKind::Model => model_schema(object, &mut errors),
        NodeKind::Zone => zone_schema(object, &mut errors),
        NodeKind::DetectionFilter => detection_filter_schema(object, &mut errors),
        NodeKind::ParkingViolation => parking_schema(object, &mut errors),
        NodeKind::DayNightDetector => day_night_schema(object, &mut errors),
        NodeKind::AudioExtractor => audio_extractor_schema(object, &mut errors),
        NodeKind::AudioAi => audio_ai_schema(object, &mut errors),
        NodeKind::AudioVu => audio_vu_schema(object, &mut errors),
        NodeKind::Action => action_schema(object, &mut errors),
        NodeKind::LinkIn => link_in_schema(object, &mut errors),
        NodeKind::LinkOut => link_out_schema(object, &mut errors),
        NodeKind::LinkCall => link_call_schema(object, &mut errors),
        NodeKind::Catch => catch_schema(object, &mut errors),
        // The config node's payload is a schema fragment merged into its
        // sinks; any object is acceptable.
        NodeKind::Config => {}
        NodeKind::DataPreview | NodeKind::Debug => {
            reject_unknown_keys(object, &["label"], &mut errors);
            optional_string(object, "label", &mut errors);
        }
    }

    errors
}

fn requires_config(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Camera
            | NodeKind::VideoInput
            | NodeKind::Youtube
            | NodeKind::Model
            | NodeKind::Zone
            | NodeKind::ParkingViolation
            | NodeKind::Action
            | NodeKind::AudioAi
            | NodeKind::LinkIn
            | NodeKind::LinkOut
            | NodeKind::LinkCall
            | NodeKind::Catch
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-type schemas
// ─────────────────────────────────────────────────────────────────────────────

fn camera_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["cameraId", "fps", "quality", "skipSimilar"], errors);
    required_string(config, "cameraId", errors);
    optional_int_range(config, "fps", 1, 30, errors);
    optional_enum(config, "quality", &["low", "med", "high"], errors);
    optional_bool(config, "skipSimilar", errors);
}

fn video_input_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["url", "fps", "quality"], errors);
    if required_string(config, "url", errors) {
        check_url(config, "url", errors);
    }
    optional_int_range(config, "fps", 1, 30, errors);
    optional_enum(config, "quality", &["low", "med", "high"], errors);
}

fn youtube_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["url", "fps", "quality"], errors);
    if required_string(config, "url", errors) {
        check_url(config, "url", errors);
    }
    optional_int_range(config, "fps", 1, 30, errors);
    optional_enum(config, "quality", &["low", "med", "high"], errors);
}

fn model_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(
        config,
        &["modelId", "confidence", "classes", "iou", "maxDetections", "fps", "batchSize"],
        errors,
    );
    required_string(config, "modelId", errors);
    required_unit_range(config, "confidence", errors);
    required_int_array(config, "classes", errors);
    optional_unit_range(config, "iou", errors);
    optional_int_min(config, "maxDetections", 1, errors);
    optional_int_min(config, "fps", 1, errors);
    optional_int_min(config, "batchSize", 1, errors);
}

fn zone_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(
        config,
        &["polygon", "filterType", "label", "cooldownSec", "dwellSec", "anchor"],
        errors,
    );
    required_polygon(config, "polygon", errors);
    required_enum(config, "filterType", &["include", "exclude"], errors);
    optional_string(config, "label", errors);
    optional_int_min(config, "cooldownSec", 0, errors);
    optional_int_min(config, "dwellSec", 0, errors);
    optional_enum(config, "anchor", &["center", "footpoint"], errors);
}

fn detection_filter_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(
        config,
        &["classes", "minConfidence", "count", "scope"],
        errors,
    );
    if config.contains_key("classes") {
        required_int_array(config, "classes", errors);
    }
    optional_unit_range(config, "minConfidence", errors);

    if let Some(count) = config.get("count") {
        match count.as_object() {
            Some(count_obj) => {
                reject_unknown_keys_at(count_obj, &["op", "value"], "count", errors);
                optional_enum(count_obj, "op", &["gte", "lte", "eq"], errors);
                if count_obj.get("value").and_then(Value::as_u64).is_none() {
                    errors.push("count.value must be a non-negative integer".to_string());
                }
            }
            None => errors.push("count must be an object {op, value}".to_string()),
        }

        // Count semantics across frames are ambiguous without a declared
        // scope; the config must say which it means.
        match config.get("scope") {
            None => errors.push(
                "count filtering requires scope: \"per_frame\" or {\"window\": ms}".to_string(),
            ),
            Some(Value::String(s)) if s == "per_frame" => {}
            Some(Value::Object(scope_obj)) => {
                reject_unknown_keys_at(scope_obj, &["window"], "scope", errors);
                if scope_obj.get("window").and_then(Value::as_u64).map_or(true, |w| w == 0) {
                    errors.push("scope.window must be a positive duration in ms".to_string());
                }
            }
            Some(_) => {
                errors.push("scope must be \"per_frame\" or {\"window\": ms}".to_string());
            }
        }
    } else if let Some(scope) = config.get("scope") {
        // Scope without count is tolerated if well-formed.
        let ok = matches!(scope, Value::String(s) if s == "per_frame")
            || matches!(scope, Value::Object(o) if o.get("window").and_then(Value::as_u64).is_some_and(|w| w > 0));
        if !ok {
            errors.push("scope must be \"per_frame\" or {\"window\": ms}".to_string());
        }
    }
}

fn parking_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["polygon", "dwellSec", "label"], errors);
    required_polygon(config, "polygon", errors);
    if config.get("dwellSec").and_then(Value::as_u64).map_or(true, |v| v == 0) {
        errors.push("dwellSec must be a positive integer".to_string());
    }
    optional_string(config, "label", errors);
}

fn day_night_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(
        config,
        &["intervalSec", "dayThreshold", "nightThreshold"],
        errors,
    );
    optional_int_min(config, "intervalSec", 1, errors);
    optional_int_range(config, "dayThreshold", 0, 255, errors);
    optional_int_range(config, "nightThreshold", 0, 255, errors);
    if let (Some(day), Some(night)) = (
        config.get("dayThreshold").and_then(Value::as_i64),
        config.get("nightThreshold").and_then(Value::as_i64),
    ) {
        if night >= day {
            errors.push("nightThreshold must be below dayThreshold".to_string());
        }
    }
}

fn audio_extractor_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["sampleRate", "channels", "bufferSec"], errors);
    if let Some(rate) = config.get("sampleRate") {
        const RATES: [u64; 5] = [8_000, 16_000, 22_050, 44_100, 48_000];
        if rate.as_u64().map_or(true, |r| !RATES.contains(&r)) {
            errors.push("sampleRate must be one of 8000, 16000, 22050, 44100, 48000".to_string());
        }
    }
    if let Some(channels) = config.get("channels") {
        if channels.as_u64().map_or(true, |c| c != 1 && c != 2) {
            errors.push("channels must be 1 or 2".to_string());
        }
    }
    optional_int_range(config, "bufferSec", 1, 60, errors);
}

fn audio_ai_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(
        config,
        &["modelId", "language", "keywords", "confidence", "bufferSec"],
        errors,
    );
    required_string(config, "modelId", errors);
    optional_string(config, "language", errors);
    if let Some(keywords) = config.get("keywords") {
        let ok = keywords
            .as_array()
            .is_some_and(|a| a.iter().all(Value::is_string));
        if !ok {
            errors.push("keywords must be an array of strings".to_string());
        }
    }
    optional_unit_range(config, "confidence", errors);
    if let Some(buffer) = config.get("bufferSec") {
        if buffer.as_f64().map_or(true, |b| b <= 0.0) {
            errors.push("bufferSec must be a positive number".to_string());
        }
    }
}

fn audio_vu_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(
        config,
        &["threshold", "hysteresisDb", "edge", "intervalMs"],
        errors,
    );
    if let Some(threshold) = config.get("threshold") {
        if threshold.as_f64().is_none() {
            errors.push("threshold must be a number (dBFS)".to_string());
        }
    }
    if let Some(hysteresis) = config.get("hysteresisDb") {
        if hysteresis.as_f64().map_or(true, |h| h <= 0.0) {
            errors.push("hysteresisDb must be a positive number".to_string());
        }
    }
    optional_enum(config, "edge", &["rising", "falling", "continuous"], errors);
    optional_int_min(config, "intervalMs", 1, errors);
}

fn action_schema(config: &Object, errors: &mut Vec<String>) {
    let Some(action) = config.get("action").and_then(Value::as_str) else {
        errors.push(
            "action is required: one of email, webhook, record, alert, snapshot, log".to_string(),
        );
        return;
    };

    match action {
        "email" => {
            reject_unknown_keys(
                config,
                &["action", "to", "cc", "subject", "includeSnapshot", "includeDetections"],
                errors,
            );
            if required_string(config, "to", errors) {
                check_email(config.get("to").and_then(Value::as_str).unwrap_or(""), "to", errors);
            }
            if let Some(cc) = config.get("cc") {
                match cc.as_array() {
                    Some(list) => {
                        for (i, addr) in list.iter().enumerate() {
                            match addr.as_str() {
                                Some(s) => check_email(s, &format!("cc[{i}]"), errors),
                                None => errors.push(format!("cc[{i}] must be a string")),
                            }
                        }
                    }
                    None => errors.push("cc must be an array of email addresses".to_string()),
                }
            }
            optional_string(config, "subject", errors);
            optional_bool(config, "includeSnapshot", errors);
            optional_bool(config, "includeDetections", errors);
        }
        "webhook" => {
            reject_unknown_keys(
                config,
                &["action", "url", "method", "headers", "timeoutSec", "retries", "secretKey"],
                errors,
            );
            if required_string(config, "url", errors) {
                check_url(config, "url", errors);
            }
            optional_enum(config, "method", &["POST", "PUT"], errors);
            if let Some(headers) = config.get("headers") {
                let ok = headers
                    .as_object()
                    .is_some_and(|o| o.values().all(Value::is_string));
                if !ok {
                    errors.push("headers must be a string-to-string map".to_string());
                }
            }
            optional_int_range(config, "timeoutSec", 1, 60, errors);
            optional_int_range(config, "retries", 0, 5, errors);
            optional_string(config, "secretKey", errors);
        }
        "record" => {
            reject_unknown_keys(
                config,
                &["action", "durationSec", "preBufferSec", "postBufferSec", "format", "quality"],
                errors,
            );
            optional_int_range(config, "durationSec", 1, 300, errors);
            optional_int_range(config, "preBufferSec", 0, 60, errors);
            optional_int_range(config, "postBufferSec", 0, 60, errors);
            optional_enum(config, "format", &["mp4", "mkv"], errors);
            optional_enum(config, "quality", &["low", "med", "high"], errors);
        }
        "alert" => {
            reject_unknown_keys(config, &["action", "severity", "notify", "message"], errors);
            required_enum(config, "severity", &["info", "warning", "critical"], errors);
            if let Some(notify) = config.get("notify") {
                let ok = notify
                    .as_array()
                    .is_some_and(|a| a.iter().all(Value::is_string));
                if !ok {
                    errors.push("notify must be an array of strings".to_string());
                }
            }
            optional_string(config, "message", errors);
        }
        "snapshot" => {
            reject_unknown_keys(
                config,
                &["action", "drawBoxes", "drawZones", "format", "quality"],
                errors,
            );
            optional_bool(config, "drawBoxes", errors);
            optional_bool(config, "drawZones", errors);
            optional_enum(config, "format", &["jpg", "png"], errors);
            optional_int_range(config, "quality", 1, 100, errors);
        }
        "log" => {
            reject_unknown_keys(config, &["action", "label"], errors);
            optional_string(config, "label", errors);
        }
        other => errors.push(format!(
            "unknown action \"{other}\": expected email, webhook, record, alert, snapshot or log"
        )),
    }
}

fn link_in_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["name"], errors);
    required_string(config, "name", errors);
}

fn link_out_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["name", "mode"], errors);
    required_string(config, "name", errors);
    optional_enum(config, "mode", &["send", "return"], errors);
}

fn link_call_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["target", "params"], errors);
    required_string(config, "target", errors);
    if let Some(params) = config.get("params") {
        if !params.is_object() {
            errors.push("params must be an object".to_string());
        }
    }
}

fn catch_schema(config: &Object, errors: &mut Vec<String>) {
    reject_unknown_keys(config, &["scope", "nodeIds"], errors);
    required_enum(config, "scope", &["all", "specific"], errors);
    let specific = config.get("scope").and_then(Value::as_str) == Some("specific");
    match config.get("nodeIds") {
        Some(ids) => {
            let ok = ids.as_array().is_some_and(|a| a.iter().all(Value::is_string));
            if !ok {
                errors.push("nodeIds must be an array of node id strings".to_string());
            }
        }
        None if specific => {
            errors.push("scope \"specific\" requires nodeIds".to_string());
        }
        None => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared checks
// ─────────────────────────────────────────────────────────────────────────────

fn reject_unknown_keys(config: &Object, allowed: &[&str], errors: &mut Vec<String>) {
    for key in config.keys() {
        if !allowed.contains(&key.as_str()) {
            errors.push(format!("unknown key \"{key}\""));
        }
    }
}

fn reject_unknown_keys_at(config: &Object, allowed: &[&str], at: &str, errors: &mut Vec<String>) {
    for key in config.keys() {
        if !allowed.contains(&key.as_str()) {
            errors.push(format!("unknown key \"{at}.{key}\""));
        }
    }
}

fn required_string(config: &Object, key: &str, errors: &mut Vec<String>) -> bool {
    match config.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => true,
        Some(_) => {
            errors.push(format!("{key} must not be empty"));
            false
        }
        None => {
            errors.push(format!("{key} is required and must be a string"));
            false
        }
    }
}

fn optional_string(config: &Object, key: &str, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        if !value.is_string() {
            errors.push(format!("{key} must be a string"));
        }
    }
}

fn optional_bool(config: &Object, key: &str, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        if !value.is_boolean() {
            errors.push(format!("{key} must be a boolean"));
        }
    }
}

fn required_enum(config: &Object, key: &str, allowed: &[&str], errors: &mut Vec<String>) {
    match config.get(key).and_then(Value::as_str) {
        Some(s) if allowed.contains(&s) => {}
        Some(s) => errors.push(format!("{key} must be one of {allowed:?}, got \"{s}\"")),
        None => errors.push(format!("{key} is required: one of {allowed:?}")),
    }
}

fn optional_enum(config: &Object, key: &str, allowed: &[&str], errors: &mut Vec<String>) {
    if config.contains_key(key) {
        required_enum(config, key, allowed, errors);
    }
}

fn optional_int_range(config: &Object, key: &str, min: i64, max: i64, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        match value.as_i64() {
            Some(v) if (min..=max).contains(&v) => {}
            _ => errors.push(format!("{key} must be an integer in {min}..={max}")),
        }
    }
}

fn optional_int_min(config: &Object, key: &str, min: i64, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        match value.as_i64() {
            Some(v) if v >= min => {}
            _ => errors.push(format!("{key} must be an integer >= {min}")),
        }
    }
}

fn required_unit_range(config: &Object, key: &str, errors: &mut Vec<String>) {
    match config.get(key).and_then(Value::as_f64) {
        Some(v) if (0.0..=1.0).contains(&v) => {}
        _ => errors.push(format!("{key} is required and must be within 0..=1")),
    }
}

fn optional_unit_range(config: &Object, key: &str, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        match value.as_f64() {
            Some(v) if (0.0..=1.0).contains(&v) => {}
            _ => errors.push(format!("{key} must be within 0..=1")),
        }
    }
}

fn required_int_array(config: &Object, key: &str, errors: &mut Vec<String>) {
    let ok = config
        .get(key)
        .and_then(Value::as_array)
        .is_some_and(|a| a.iter().all(|v| v.as_u64().is_some()));
    if !ok {
        errors.push(format!("{key} must be an array of non-negative integers"));
    }
}

fn required_polygon(config: &Object, key: &str, errors: &mut Vec<String>) {
    let Some(points) = config.get(key).and_then(Value::as_array) else {
        errors.push(format!("{key} is required and must be an array of [x, y] points"));
        return;
    };
    if points.len() < 3 {
        errors.push(format!("{key} must have at least 3 points"));
        return;
    }
    for (i, point) in points.iter().enumerate() {
        let ok = point
            .as_array()
            .is_some_and(|p| p.len() == 2 && p.iter().all(|c| c.as_f64().is_some()));
        if !ok {
            errors.push(format!("{key}[{i}] must be a [number, number] pair"));
        }
    }
}

fn check_url(config: &Object, key: &str, errors: &mut Vec<String>) {
    let Some(raw) = config.get(key).and_then(Value::as_str) else {
        return;
    };
    match reqwest::Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "rtsp" | "file" | "synthetic") => {}
        Ok(url) => errors.push(format!("{key} has unsupported scheme \"{}\"", url.scheme())),
        Err(err) => errors.push(format!("{key} is not a well-formed URL: {err}")),
    }
}

fn check_email(address: &str, key: &str, errors: &mut Vec<String>) {
    let well_formed = address
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !well_formed {
        errors.push(format!("{key} must be an email address, got \"{address}\""));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camera_config_accepts_documented_keys() {
        let errors = validate_node_config(
            NodeKind::Camera,
            &json!({"cameraId": "gate", "fps": 15, "quality": "high", "skipSimilar": true}),
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let errors = validate_node_config(
            NodeKind::Camera,
            &json!({"cameraId": "gate", "resolution": "4k"}),
        );
        assert_eq!(errors, vec!["unknown key \"resolution\""]);
    }

    #[test]
    fn model_requires_integer_classes() {
        let errors = validate_node_config(
            NodeKind::Model,
            &json!({"modelId": "yolo", "confidence": 0.5, "classes": ["person"]}),
        );
        assert!(errors.iter().any(|e| e.contains("classes")));
    }

    #[test]
    fn model_confidence_must_be_unit_range() {
        let errors = validate_node_config(
            NodeKind::Model,
            &json!({"modelId": "yolo", "confidence": 1.5, "classes": [0]}),
        );
        assert!(errors.iter().any(|e| e.contains("confidence")));
    }

    #[test]
    fn zone_polygon_needs_three_points() {
        let errors = validate_node_config(
            NodeKind::Zone,
            &json!({"polygon": [[0, 0], [10, 0]], "filterType": "include"}),
        );
        assert!(errors.iter().any(|e| e.contains("at least 3")));
    }

    #[test]
    fn detection_filter_count_without_scope_is_rejected() {
        let errors = validate_node_config(
            NodeKind::DetectionFilter,
            &json!({"count": {"op": "gte", "value": 3}}),
        );
        assert!(errors.iter().any(|e| e.contains("scope")));

        let ok = validate_node_config(
            NodeKind::DetectionFilter,
            &json!({"count": {"op": "gte", "value": 3}, "scope": {"window": 5000}}),
        );
        assert!(ok.is_empty(), "{ok:?}");

        let ok = validate_node_config(
            NodeKind::DetectionFilter,
            &json!({"count": {"value": 1}, "scope": "per_frame"}),
        );
        assert!(ok.is_empty(), "{ok:?}");
    }

    #[test]
    fn webhook_requires_well_formed_url() {
        let errors = validate_node_config(
            NodeKind::Action,
            &json!({"action": "webhook", "url": "not a url"}),
        );
        assert!(errors.iter().any(|e| e.contains("url")));

        let ok = validate_node_config(
            NodeKind::Action,
            &json!({"action": "webhook", "url": "https://hooks.example.com/x",
                    "method": "PUT", "timeoutSec": 30, "retries": 2}),
        );
        assert!(ok.is_empty(), "{ok:?}");
    }

    #[test]
    fn email_action_validates_addresses() {
        let errors = validate_node_config(
            NodeKind::Action,
            &json!({"action": "email", "to": "not-an-address"}),
        );
        assert!(errors.iter().any(|e| e.contains("email address")));
    }

    #[test]
    fn catch_specific_requires_node_ids() {
        let errors = validate_node_config(NodeKind::Catch, &json!({"scope": "specific"}));
        assert!(errors.iter().any(|e| e.contains("nodeIds")));

        let ok = validate_node_config(
            NodeKind::Catch,
            &json!({"scope": "specific", "nodeIds": ["det-1"]}),
        );
        assert!(ok.is_empty(), "{ok:?}");
    }

    #[test]
    fn audio_extractor_rejects_odd_sample_rates() {
        let errors =
            validate_node_config(NodeKind::AudioExtractor, &json!({"sampleRate": 11_025}));
        assert!(errors.iter().any(|e| e.contains("sampleRate")));
    }

    #[test]
    fn config_node_payload_is_free_form() {
        let ok = validate_node_config(NodeKind::Config, &json!({"confidence": 0.9, "iou": 0.5}));
        assert!(ok.is_empty());
    }

    #[test]
    fn missing_required_config_is_reported() {
        let errors = validate_node_config(NodeKind::Model, &serde_json::Value::Null);
        assert_eq!(errors, vec!["config is required for this node type".to_string()]);
    }
}
