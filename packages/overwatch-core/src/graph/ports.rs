//! Static port compatibility registry.
//!
//! Which node outputs may connect to which inputs is a fixed table, not
//! configuration. A connection is valid when the payload type produced by
//! `(source_kind, source_handle)` is accepted by `(target_kind, target_handle)`.

use super::{EdgeKind, NodeKind};

/// What a port carries. Link and catch ports are wildcards: they relay
/// whatever payload reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPayload {
    Typed(EdgeKind),
    Any,
}

impl PortPayload {
    fn accepts(self, produced: PortPayload) -> bool {
        match (self, produced) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Typed(a), Self::Typed(b)) => a == b,
        }
    }
}

/// Payload produced by an output port, or `None` if the port does not exist.
#[must_use]
pub fn output_payload(kind: NodeKind, handle: &str) -> Option<PortPayload> {
    use NodeKind::{
        AudioAi, AudioExtractor, AudioVu, Camera, Catch, DayNightDetector, DetectionFilter,
        LinkCall, LinkIn, Model, ParkingViolation, VideoInput, Youtube, Zone,
    };
    match (kind, handle) {
        (Camera | VideoInput | Youtube, "out") => Some(PortPayload::Typed(EdgeKind::Video)),
        (Model, "out") => Some(PortPayload::Typed(EdgeKind::Detections)),
        (Zone, "out") => Some(PortPayload::Typed(EdgeKind::Detections)),
        (DetectionFilter, "out") => Some(PortPayload::Typed(EdgeKind::Detections)),
        (ParkingViolation, "out") => Some(PortPayload::Typed(EdgeKind::Detections)),
        (DayNightDetector, "out") => Some(PortPayload::Typed(EdgeKind::Detections)),
        (AudioExtractor, "out") => Some(PortPayload::Typed(EdgeKind::Audio)),
        (AudioAi, "out") => Some(PortPayload::Typed(EdgeKind::AudioData)),
        (AudioVu, "out") => Some(PortPayload::Typed(EdgeKind::AudioData)),
        (NodeKind::Config, "out") => Some(PortPayload::Typed(EdgeKind::Config)),
        (LinkIn, "out") => Some(PortPayload::Any),
        (LinkCall, "out") => Some(PortPayload::Any),
        (Catch, "out") => Some(PortPayload::Any),
        _ => None,
    }
}

/// Payloads accepted by an input port, or `None` if the port does not exist.
#[must_use]
pub fn input_accepts(kind: NodeKind, handle: &str) -> Option<&'static [PortPayload]> {
    use NodeKind::{
        Action, AudioAi, AudioExtractor, AudioVu, DataPreview, DayNightDetector, DetectionFilter,
        LinkCall, LinkOut, Model, ParkingViolation, Zone,
    };

    const VIDEO: &[PortPayload] = &[PortPayload::Typed(EdgeKind::Video)];
    const DETECTIONS: &[PortPayload] = &[PortPayload::Typed(EdgeKind::Detections)];
    const AUDIO: &[PortPayload] = &[PortPayload::Typed(EdgeKind::Audio)];
    const CONFIG: &[PortPayload] = &[PortPayload::Typed(EdgeKind::Config)];
    const ACTION_IN: &[PortPayload] = &[
        PortPayload::Typed(EdgeKind::Detections),
        PortPayload::Typed(EdgeKind::AudioData),
    ];
    const PREVIEW_IN: &[PortPayload] = &[
        PortPayload::Typed(EdgeKind::Video),
        PortPayload::Typed(EdgeKind::Detections),
        PortPayload::Typed(EdgeKind::AudioData),
        PortPayload::Typed(EdgeKind::Debug),
    ];
    const ANY: &[PortPayload] = &[PortPayload::Any];

    match (kind, handle) {
        (Model, "input") => Some(VIDEO),
        (Model, "config") => Some(CONFIG),
        (Zone, "input") => Some(DETECTIONS),
        (Zone, "config") => Some(CONFIG),
        (DetectionFilter, "input") => Some(DETECTIONS),
        (ParkingViolation, "input") => Some(VIDEO),
        (ParkingViolation, "detections") => Some(DETECTIONS),
        (DayNightDetector, "input") => Some(VIDEO),
        (AudioExtractor, "input") => Some(VIDEO),
        (AudioExtractor, "config") => Some(CONFIG),
        (AudioAi, "input") => Some(AUDIO),
        (AudioAi, "config") => Some(CONFIG),
        (AudioVu, "input") => Some(AUDIO),
        (AudioVu, "config") => Some(CONFIG),
        (Action, "input") => Some(ACTION_IN),
        (Action, "config") => Some(CONFIG),
        (DataPreview | NodeKind::Debug, "input") => Some(PREVIEW_IN),
        (LinkOut, "input") => Some(ANY),
        (LinkCall, "input") => Some(ANY),
        _ => None,
    }
}

/// Whether a `(source, handle) -> (target, handle)` connection is permitted.
#[must_use]
pub fn compatible(
    source_kind: NodeKind,
    source_handle: &str,
    target_kind: NodeKind,
    target_handle: &str,
) -> bool {
    let Some(produced) = output_payload(source_kind, source_handle) else {
        return false;
    };
    let Some(accepted) = input_accepts(target_kind, target_handle) else {
        return false;
    };
    accepted.iter().any(|a| a.accepts(produced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_feeds_model_input() {
        assert!(compatible(NodeKind::Camera, "out", NodeKind::Model, "input"));
    }

    #[test]
    fn detections_do_not_feed_model_input() {
        assert!(!compatible(NodeKind::Model, "out", NodeKind::Model, "input"));
    }

    #[test]
    fn model_output_feeds_zone_filter_action_and_previews() {
        for (kind, handle) in [
            (NodeKind::Zone, "input"),
            (NodeKind::DetectionFilter, "input"),
            (NodeKind::Action, "input"),
            (NodeKind::Debug, "input"),
            (NodeKind::DataPreview, "input"),
        ] {
            assert!(
                compatible(NodeKind::Model, "out", kind, handle),
                "detections -> {kind:?}.{handle}"
            );
        }
    }

    #[test]
    fn config_attaches_only_to_config_ports() {
        assert!(compatible(NodeKind::Config, "out", NodeKind::Model, "config"));
        assert!(compatible(NodeKind::Config, "out", NodeKind::Action, "config"));
        assert!(compatible(NodeKind::Config, "out", NodeKind::Zone, "config"));
        assert!(compatible(NodeKind::Config, "out", NodeKind::AudioAi, "config"));
        assert!(!compatible(NodeKind::Config, "out", NodeKind::Model, "input"));
    }

    #[test]
    fn audio_chain_is_typed() {
        assert!(compatible(NodeKind::Camera, "out", NodeKind::AudioExtractor, "input"));
        assert!(compatible(NodeKind::AudioExtractor, "out", NodeKind::AudioAi, "input"));
        assert!(compatible(NodeKind::AudioVu, "out", NodeKind::Action, "input"));
        assert!(!compatible(NodeKind::AudioExtractor, "out", NodeKind::Model, "input"));
    }

    #[test]
    fn catch_routes_to_actions() {
        assert!(compatible(NodeKind::Catch, "out", NodeKind::Action, "input"));
        assert!(compatible(NodeKind::Model, "out", NodeKind::LinkOut, "input"));
        assert!(compatible(NodeKind::LinkIn, "out", NodeKind::Zone, "input"));
    }

    #[test]
    fn unknown_handles_are_invalid() {
        assert!(!compatible(NodeKind::Camera, "sideband", NodeKind::Model, "input"));
        assert!(!compatible(NodeKind::Camera, "out", NodeKind::Model, "sideband"));
    }
}
