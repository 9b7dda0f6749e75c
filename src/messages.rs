//! Wire formats for the bidirectional channel.
//!
//! Inbound frames are keyed on a `type` string; a frame with no `type`
//! but a `states`/`events` body is a reaction sample. Unknown tags are
//! surfaced as [`ClientFrame::Unknown`] so the connection can log and
//! skip them without tearing anything down.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The experiment group assigned when the handshake does not declare one.
pub const DEFAULT_EXPERIMENT_GROUP: &str = "control2";
/// Only connections in this group may inject `manual_effect` frames.
pub const DEBUG_EXPERIMENT_GROUP: &str = "debug";
/// Groups the frontend is expected to declare. Anything else is accepted
/// but logged, since the user row stores whatever the client sent.
pub const KNOWN_EXPERIMENT_GROUPS: [&str; 4] = ["experiment", "control1", "control2", "debug"];

/// Every `type` tag the demultiplexer recognizes, in one place.
pub const KNOWN_TAGS: [&str; 10] = [
    "reaction",
    "video_play",
    "video_pause",
    "video_seek",
    "time_sync_request",
    "time_sync_response",
    "video_url_selected",
    "session_create",
    "session_completed",
    "manual_effect",
];

// ============================================
// Reaction sample payloads
// ============================================

/// Boolean state reactions for one client-second. Unknown names in the
/// incoming map are ignored; missing names default to false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateFlags {
    pub is_smiling: bool,
    pub is_surprised: bool,
    pub is_concentrating: bool,
    pub is_hand_up: bool,
}

/// Event-count reactions for one client-second. Missing names default to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventCounts {
    pub nod: u32,
    pub shake_head: u32,
    pub sway_vertical: u32,
    pub sway_horizontal: u32,
    pub cheer: u32,
    pub clap: u32,
}

/// One per-second reaction summary as sent by a client. The `userId` and
/// `timestamp` fields are recorded for debugging only; identity comes from
/// the connection and timing from the server clock.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReactionFrame {
    pub user_id: Option<String>,
    pub timestamp: Option<i64>,
    pub states: StateFlags,
    pub events: EventCounts,
    pub video_time: Option<f64>,
    pub session_id: Option<String>,
}

// ============================================
// Control frames (client → server)
// ============================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    #[serde(rename_all = "camelCase")]
    VideoPlay {
        #[serde(default)]
        current_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    VideoPause {
        #[serde(default)]
        current_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    VideoSeek {
        #[serde(default)]
        current_time: f64,
    },
    TimeSyncRequest,
    #[serde(rename_all = "camelCase")]
    TimeSyncResponse {
        requester_id: String,
        #[serde(default)]
        current_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    VideoUrlSelected { video_id: String },
    #[serde(rename_all = "camelCase")]
    SessionCreate {
        session_id: String,
        video_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionCompleted { session_id: String },
    #[serde(rename_all = "camelCase")]
    ManualEffect {
        effect_type: String,
        #[serde(default = "default_manual_intensity")]
        intensity: f64,
        #[serde(default = "default_manual_duration")]
        duration_ms: i64,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        video_time: Option<f64>,
    },
}

fn default_manual_intensity() -> f64 {
    1.0
}

fn default_manual_duration() -> i64 {
    2000
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Reaction(ReactionFrame),
    Control(ControlFrame),
    /// Recognized JSON object with an unknown tag; carried for the warning.
    Unknown(String),
}

/// Why an inbound frame could not be decoded. Syntax errors are protocol
/// violations and close the connection; schema errors are logged and the
/// frame is skipped.
#[derive(Debug)]
pub enum FrameError {
    Syntax(String),
    Schema(String),
}

/// Decode one text frame per the demux rules: `type` wins; no `type` with
/// a `states`/`events` body is a reaction sample.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::Syntax(format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(FrameError::Syntax("frame is not a JSON object".to_string()));
    }

    match value.get("type").and_then(Value::as_str) {
        None => {
            if value.get("states").is_some() || value.get("events").is_some() {
                let frame = serde_json::from_value::<ReactionFrame>(value)
                    .map_err(|e| FrameError::Schema(format!("bad reaction sample: {e}")))?;
                Ok(ClientFrame::Reaction(frame))
            } else {
                Ok(ClientFrame::Unknown("<untyped>".to_string()))
            }
        }
        Some("reaction") => {
            let frame = serde_json::from_value::<ReactionFrame>(value)
                .map_err(|e| FrameError::Schema(format!("bad reaction sample: {e}")))?;
            Ok(ClientFrame::Reaction(frame))
        }
        Some(tag) if KNOWN_TAGS.contains(&tag) => {
            let tag = tag.to_string();
            let frame = serde_json::from_value::<ControlFrame>(value)
                .map_err(|e| FrameError::Schema(format!("bad {tag} frame: {e}")))?;
            Ok(ClientFrame::Control(frame))
        }
        Some(other) => Ok(ClientFrame::Unknown(other.to_string())),
    }
}

// ============================================
// Handshake
// ============================================

/// First frame on a fresh connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub user_id: String,
    #[serde(default)]
    pub experiment_group: Option<String>,
    #[serde(default)]
    pub is_host: bool,
}

pub fn decode_handshake(text: &str) -> Result<Handshake, String> {
    let handshake: Handshake =
        serde_json::from_str(text).map_err(|e| format!("malformed handshake: {e}"))?;
    if handshake.user_id.trim().is_empty() {
        return Err("handshake userId must be a non-empty string".to_string());
    }
    Ok(handshake)
}

// ============================================
// Effects
// ============================================

/// The finite set of visual effects the frontend can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    Sparkle,
    Wave,
    Excitement,
    Bounce,
    Cheer,
    Shimmer,
    Focus,
    Groove,
    ClappingIcons,
}

impl EffectType {
    pub fn name(&self) -> &'static str {
        match self {
            EffectType::Sparkle => "sparkle",
            EffectType::Wave => "wave",
            EffectType::Excitement => "excitement",
            EffectType::Bounce => "bounce",
            EffectType::Cheer => "cheer",
            EffectType::Shimmer => "shimmer",
            EffectType::Focus => "focus",
            EffectType::Groove => "groove",
            EffectType::ClappingIcons => "clapping_icons",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sparkle" => Some(EffectType::Sparkle),
            "wave" => Some(EffectType::Wave),
            "excitement" => Some(EffectType::Excitement),
            "bounce" => Some(EffectType::Bounce),
            "cheer" => Some(EffectType::Cheer),
            "shimmer" => Some(EffectType::Shimmer),
            "focus" => Some(EffectType::Focus),
            "groove" => Some(EffectType::Groove),
            "clapping_icons" => Some(EffectType::ClappingIcons),
            _ => None,
        }
    }
}

/// Fraction of active users who held each state at least once in their
/// current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatioState {
    pub is_smiling: f64,
    pub is_surprised: f64,
    pub is_concentrating: f64,
    pub is_hand_up: f64,
}

/// Events per user per second across the active set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDensity {
    pub nod: f64,
    pub shake_head: f64,
    pub sway_vertical: f64,
    pub sway_horizontal: f64,
    pub cheer: f64,
    pub clap: f64,
}

/// The numbers behind an effect decision, attached to broadcast effect
/// frames for testing and analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectDebug {
    pub active_users: usize,
    pub ratio_state: RatioState,
    pub density_event: EventDensity,
}

// ============================================
// Server → client frames
// ============================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        user_id: String,
        experiment_group: String,
        is_host: bool,
        message: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Effect {
        effect_type: EffectType,
        intensity: f64,
        duration_ms: i64,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        debug: Option<EffectDebug>,
    },
    #[serde(rename_all = "camelCase")]
    VideoPlay { current_time: f64, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    VideoPause { current_time: f64, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    VideoSeek { current_time: f64, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    TimeSyncRequest { requester_id: String },
    #[serde(rename_all = "camelCase")]
    TimeSyncResponse { current_time: f64 },
    #[serde(rename_all = "camelCase")]
    VideoUrlSelected { video_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_frame_with_states_is_a_reaction() {
        let text = r#"{"userId":"u-1","timestamp":1700000000000,
            "states":{"isSmiling":true,"isSurprised":false},
            "events":{"nod":1,"clap":2},
            "videoTime":12.5,"sessionId":"u-1_1700000000000"}"#;
        match decode_client_frame(text).unwrap() {
            ClientFrame::Reaction(r) => {
                assert!(r.states.is_smiling);
                assert!(!r.states.is_hand_up);
                assert_eq!(r.events.nod, 1);
                assert_eq!(r.events.clap, 2);
                assert_eq!(r.events.shake_head, 0);
                assert_eq!(r.video_time, Some(12.5));
                assert_eq!(r.session_id.as_deref(), Some("u-1_1700000000000"));
            }
            other => panic!("expected reaction, got {other:?}"),
        }
    }

    #[test]
    fn explicit_reaction_tag_is_a_reaction() {
        let text = r#"{"type":"reaction","states":{"isHandUp":true},"events":{}}"#;
        match decode_client_frame(text).unwrap() {
            ClientFrame::Reaction(r) => assert!(r.states.is_hand_up),
            other => panic!("expected reaction, got {other:?}"),
        }
    }

    #[test]
    fn unknown_state_and_event_names_are_ignored() {
        let text = r#"{"states":{"isSmiling":true,"isLevitating":true},
            "events":{"nod":3,"teleport":9}}"#;
        match decode_client_frame(text).unwrap() {
            ClientFrame::Reaction(r) => {
                assert!(r.states.is_smiling);
                assert_eq!(r.events.nod, 3);
            }
            other => panic!("expected reaction, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_reported_not_rejected() {
        let text = r#"{"type":"emoji_burst","count":9}"#;
        match decode_client_frame(text).unwrap() {
            ClientFrame::Unknown(tag) => assert_eq!(tag, "emoji_burst"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn untyped_frame_without_reaction_body_is_unknown() {
        match decode_client_frame(r#"{"hello":"world"}"#).unwrap() {
            ClientFrame::Unknown(tag) => assert_eq!(tag, "<untyped>"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_a_syntax_error() {
        match decode_client_frame("not json") {
            Err(FrameError::Syntax(_)) => {}
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn known_tag_with_bad_fields_is_a_schema_error() {
        let text = r#"{"type":"time_sync_response","requesterId":42}"#;
        match decode_client_frame(text) {
            Err(FrameError::Schema(_)) => {}
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn control_frames_decode() {
        match decode_client_frame(r#"{"type":"video_play","currentTime":42.0,"timestamp":1}"#)
            .unwrap()
        {
            ClientFrame::Control(ControlFrame::VideoPlay { current_time }) => {
                assert_eq!(current_time, 42.0);
            }
            other => panic!("expected video_play, got {other:?}"),
        }
        match decode_client_frame(r#"{"type":"time_sync_request"}"#).unwrap() {
            ClientFrame::Control(ControlFrame::TimeSyncRequest) => {}
            other => panic!("expected time_sync_request, got {other:?}"),
        }
    }

    #[test]
    fn handshake_defaults_apply() {
        let hs = decode_handshake(r#"{"userId":"u-1"}"#).unwrap();
        assert_eq!(hs.user_id, "u-1");
        assert_eq!(hs.experiment_group, None);
        assert!(!hs.is_host);
    }

    #[test]
    fn handshake_requires_nonempty_user_id() {
        assert!(decode_handshake(r#"{"userId":""}"#).is_err());
        assert!(decode_handshake(r#"{"isHost":true}"#).is_err());
        assert!(decode_handshake("garbage").is_err());
    }

    #[test]
    fn effect_type_names_round_trip() {
        for name in [
            "sparkle",
            "wave",
            "excitement",
            "bounce",
            "cheer",
            "shimmer",
            "focus",
            "groove",
            "clapping_icons",
        ] {
            let effect = EffectType::from_name(name).unwrap();
            assert_eq!(effect.name(), name);
        }
        assert!(EffectType::from_name("confetti").is_none());
    }

    #[test]
    fn effect_frame_serializes_with_camel_case_fields() {
        let frame = ServerFrame::Effect {
            effect_type: EffectType::ClappingIcons,
            intensity: 0.62,
            duration_ms: 2000,
            timestamp: 1700000000000,
            debug: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"effect""#));
        assert!(json.contains(r#""effectType":"clapping_icons""#));
        assert!(json.contains(r#""durationMs":2000"#));
        assert!(!json.contains("debug"));
    }
}
