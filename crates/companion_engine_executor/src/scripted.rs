use companion_engine_abi::{EngineError, EngineInstance, EngineRuntime};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Responder = dyn Fn(&str) -> Result<Vec<String>, EngineError> + Send + Sync;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    released: AtomicUsize,
}

/// In-process runtime whose instances answer every line through a shared
/// responder. Counts instance creation and release so callers can check for
/// leaked instances.
#[derive(Clone)]
pub struct ScriptedRuntime {
    responder: Arc<Responder>,
    counters: Arc<Counters>,
    create_error: Option<EngineError>,
}

impl fmt::Debug for ScriptedRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRuntime")
            .field("created", &self.created())
            .field("released", &self.released())
            .field("create_error", &self.create_error)
            .finish()
    }
}

impl ScriptedRuntime {
    pub fn new(
        responder: impl Fn(&str) -> Result<Vec<String>, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            counters: Arc::new(Counters::default()),
            create_error: None,
        }
    }

    /// A small companion script:
    /// - `init` answers `engine_ready` with the history length and vision tick it saw
    /// - `event` answers a `mod_action`, a `story_event` and an `utterance`
    /// - `player_message` answers an `utterance` quoting the text
    /// - `tick` answers a `tick` event
    pub fn companion() -> Self {
        Self::new(companion_script)
    }

    /// Every `create_instance` call fails with `error`.
    pub fn with_create_error(mut self, error: EngineError) -> Self {
        self.create_error = Some(error);
        self
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.released())
    }
}

impl EngineRuntime for ScriptedRuntime {
    fn create_instance(&self, config_json: &str) -> Result<Box<dyn EngineInstance>, EngineError> {
        if let Some(error) = &self.create_error {
            return Err(error.clone());
        }
        if config_json.is_empty() {
            return Err(EngineError::trap("engine_new", "empty engine config"));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInstance {
            responder: Arc::clone(&self.responder),
            counters: Arc::clone(&self.counters),
            live: true,
        }))
    }
}

pub struct ScriptedInstance {
    responder: Arc<Responder>,
    counters: Arc<Counters>,
    live: bool,
}

impl fmt::Debug for ScriptedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedInstance")
            .field("live", &self.live)
            .finish()
    }
}

impl EngineInstance for ScriptedInstance {
    fn process(&mut self, input_json: &str) -> Result<Vec<String>, EngineError> {
        if !self.live {
            return Err(EngineError::HandleReleased);
        }
        (self.responder)(input_json)
    }

    fn tick(&mut self, elapsed_ms: u64) -> Result<Vec<String>, EngineError> {
        if !self.live {
            return Err(EngineError::HandleReleased);
        }
        let line = json!({"type": "tick", "elapsed_ms": elapsed_ms}).to_string();
        (self.responder)(&line)
    }

    fn release(&mut self) -> Result<(), EngineError> {
        if self.live {
            self.live = false;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for ScriptedInstance {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn companion_script(input: &str) -> Result<Vec<String>, EngineError> {
    let message: JsonValue = serde_json::from_str(input)
        .map_err(|err| EngineError::trap("engine_process", format!("bad input: {err}")))?;
    let outputs = match message.get("type").and_then(JsonValue::as_str) {
        Some("init") => {
            let history_len = message
                .get("story_history")
                .and_then(JsonValue::as_array)
                .map_or(0, Vec::len);
            let vision_tick = message
                .get("vision")
                .and_then(|vision| vision.get("tick"))
                .cloned()
                .unwrap_or(JsonValue::Null);
            vec![json!({
                "type": "engine_ready",
                "session_id": message.get("session_id").cloned().unwrap_or(JsonValue::Null),
                "history_len": history_len,
                "vision_tick": vision_tick,
            })]
        }
        Some("event") => {
            let tick = message
                .get("data")
                .and_then(|data| data.get("tick"))
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
            vec![
                json!({"type": "mod_action", "action": "look_at", "target": "player", "tick": tick}),
                json!({
                    "type": "story_event",
                    "kind": "observation",
                    "summary": format!("world changed at tick {tick}"),
                }),
                json!({"type": "utterance", "text": "I see it."}),
            ]
        }
        Some("player_message") => {
            let text = message
                .get("text")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            vec![json!({"type": "utterance", "text": format!("you said: {text}")})]
        }
        Some("tick") => vec![json!({
            "type": "tick",
            "elapsed_ms": message.get("elapsed_ms").cloned().unwrap_or(JsonValue::Null),
        })],
        _ => Vec::new(),
    };
    Ok(outputs.iter().map(JsonValue::to_string).collect())
}
