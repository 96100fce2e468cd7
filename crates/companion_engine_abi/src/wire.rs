//! Line-oriented JSON contract spoken with the engine module.
//!
//! Every message crossing the boundary is a single-line JSON object. The
//! module answers with zero or more objects separated by newlines.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::payload::{EngineConfig, StoryEvent, VisionSnapshot, WorldDelta};
use crate::EngineError;

pub const OUTPUT_ENGINE_READY: &str = "engine_ready";
pub const OUTPUT_MOD_ACTION: &str = "mod_action";
pub const OUTPUT_UTTERANCE: &str = "utterance";
pub const OUTPUT_STORY_EVENT: &str = "story_event";
pub const OUTPUT_ERROR: &str = "error";

pub const ERROR_NOT_INITIALIZED: &str = "not_initialized";
pub const ERROR_SESSION_NOT_FOUND: &str = "session_not_found";
pub const ERROR_INVALID_PAYLOAD: &str = "invalid_payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorldChange,
}

/// Messages the host sends into the module.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage<'a> {
    Init {
        session_id: &'a str,
        character_card: &'a JsonValue,
        config: &'a EngineConfig,
        vision: &'a VisionSnapshot,
        story_history: &'a [StoryEvent],
    },
    Event {
        kind: EventKind,
        data: &'a WorldDelta,
    },
    PlayerMessage {
        player_id: &'a str,
        text: &'a str,
    },
}

impl InboundMessage<'_> {
    pub fn to_line(&self) -> Result<String, EngineError> {
        serde_json::to_string(self)
            .map_err(|err| EngineError::invalid_output(format!("encode inbound message: {err}")))
    }
}

/// One JSON object emitted by the module, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputEvent(JsonMap<String, JsonValue>);

impl OutputEvent {
    pub fn parse_line(line: &str) -> Result<Self, EngineError> {
        match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(EngineError::invalid_output(format!(
                "output line is not a JSON object: {other}"
            ))),
            Err(err) => Err(EngineError::invalid_output(format!(
                "output line is not JSON: {err}"
            ))),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let mut map = JsonMap::new();
        map.insert("type".to_string(), JsonValue::from(OUTPUT_ERROR));
        map.insert("code".to_string(), JsonValue::from(code));
        map.insert("message".to_string(), JsonValue::from(message.into()));
        Self(map)
    }

    pub fn from_engine_error(err: &EngineError) -> Self {
        Self::error(err.code(), err.to_string())
    }

    /// The `type` tag of the event, if the module set one.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(JsonValue::as_str)
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind() == Some(kind)
    }

    /// The `code` of an `error` event.
    pub fn error_code(&self) -> Option<&str> {
        if !self.is_kind(OUTPUT_ERROR) {
            return None;
        }
        self.0.get("code").and_then(JsonValue::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl From<JsonMap<String, JsonValue>> for OutputEvent {
    fn from(map: JsonMap<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// Parses the lines returned by a module call, skipping blank lines.
pub fn parse_output_lines<S: AsRef<str>>(lines: &[S]) -> Result<Vec<OutputEvent>, EngineError> {
    lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| !line.trim().is_empty())
        .map(OutputEvent::parse_line)
        .collect()
}

/// Splits a decoded module buffer into its non-empty lines.
pub fn split_output_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn world_change_is_wrapped_as_event() {
        let delta = WorldDelta::from_value(&json!({"tick": 7, "timestamp_ms": 1})).unwrap();
        let line = InboundMessage::Event {
            kind: EventKind::WorldChange,
            data: &delta,
        }
        .to_line()
        .unwrap();
        let value: JsonValue = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["kind"], "world_change");
        assert_eq!(value["data"]["tick"], 7);
        assert_eq!(value["data"]["blocks"], json!([]));
    }

    #[test]
    fn player_message_stays_on_one_line() {
        let line = InboundMessage::PlayerMessage {
            player_id: "steve",
            text: "first line\nsecond line",
        }
        .to_line()
        .unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with("{\"type\":\"player_message\""));
    }

    #[test]
    fn parse_output_lines_skips_blank_lines() {
        let lines = vec![
            "{\"type\":\"engine_ready\"}".to_string(),
            "   ".to_string(),
            "{\"type\":\"utterance\",\"text\":\"hi\"}".to_string(),
        ];
        let events = parse_output_lines(&lines).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_kind(OUTPUT_ENGINE_READY));
        assert_eq!(events[1].get("text"), Some(&json!("hi")));
    }

    #[test]
    fn parse_output_lines_rejects_non_objects() {
        let err = parse_output_lines(&["[1,2]"]).unwrap_err();
        assert_eq!(err.code(), "invalid_output");
    }

    #[test]
    fn split_output_lines_drops_empty_lines() {
        let lines = split_output_lines("{\"a\":1}\n\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn error_event_carries_code_and_message() {
        let event = OutputEvent::error(ERROR_NOT_INITIALIZED, "session not initialized");
        assert_eq!(event.error_code(), Some(ERROR_NOT_INITIALIZED));
        assert_eq!(
            event.into_value(),
            json!({"type": "error", "code": "not_initialized", "message": "session not initialized"})
        );
    }
}
