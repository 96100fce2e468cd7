//! A single engine session.
//!
//! The session owns at most one live engine instance. It turns domain
//! payloads into wire messages, tracks readiness and activity, and writes the
//! vision and story side effects of world updates to the stores.

use companion_engine_abi::{
    normalize_character_card, now_unix_ms, parse_output_lines, EngineConfig, EngineError,
    EngineInstance, EngineRuntime, EventKind, InboundMessage, OutputEvent, StoryEvent,
    VisionSnapshot, WorldDelta, ERROR_INVALID_PAYLOAD, ERROR_NOT_INITIALIZED, OUTPUT_MOD_ACTION,
    OUTPUT_STORY_EVENT, OUTPUT_UTTERANCE,
};
use companion_engine_store::{StoryStore, VisionStore};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Instant;

use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

pub struct EngineSession {
    session_id: String,
    character_id: String,
    state: SessionState,
    instance: Option<Box<dyn EngineInstance>>,
    last_active: Instant,
    history_limit: usize,
    ready_events: Vec<OutputEvent>,
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("session_id", &self.session_id)
            .field("character_id", &self.character_id)
            .field("state", &self.state)
            .field("has_instance", &self.instance.is_some())
            .field("last_active", &self.last_active)
            .finish()
    }
}

fn not_initialized() -> Vec<OutputEvent> {
    vec![OutputEvent::error(
        ERROR_NOT_INITIALIZED,
        "session is not initialized",
    )]
}

type BoxedInstance = Box<dyn EngineInstance>;

async fn run_blocking<F>(
    mut instance: BoxedInstance,
    call: F,
) -> Result<(BoxedInstance, Result<Vec<String>, EngineError>), tokio::task::JoinError>
where
    F: FnOnce(&mut dyn EngineInstance) -> Result<Vec<String>, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let lines = call(instance.as_mut());
        (instance, lines)
    })
    .await
}

impl EngineSession {
    pub fn new(session_id: impl Into<String>, character_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            character_id: character_id.into(),
            state: SessionState::Uninitialized,
            instance: None,
            last_active: Instant::now(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            ready_events: Vec::new(),
        }
    }

    /// Number of story events replayed into `init`.
    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && self.instance.is_some()
    }

    pub fn has_live_instance(&self) -> bool {
        self.instance
            .as_ref()
            .is_some_and(|instance| instance.is_live())
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Events the module emitted in answer to the most recent `init`.
    pub fn ready_events(&self) -> &[OutputEvent] {
        &self.ready_events
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Creates a fresh instance and sends it `init` with the persisted
    /// snapshot and story history. Any instance held from an earlier
    /// initialization is released first.
    pub async fn initialize(
        &mut self,
        runtime: &dyn EngineRuntime,
        vision_store: &dyn VisionStore,
        story_store: &dyn StoryStore,
        character_card: &JsonValue,
        config: &JsonValue,
    ) -> Result<Vec<OutputEvent>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed {
                session_id: self.session_id.clone(),
            });
        }
        self.release_instance();
        self.state = SessionState::Initializing;

        match self
            .start_instance(runtime, vision_store, story_store, character_card, config)
            .await
        {
            Ok((instance, outputs)) => {
                self.instance = Some(instance);
                self.state = SessionState::Ready;
                self.ready_events = outputs.clone();
                self.touch();
                tracing::info!(
                    session_id = %self.session_id,
                    character_id = %self.character_id,
                    outputs = outputs.len(),
                    "engine session initialized"
                );
                Ok(outputs)
            }
            Err(err) => {
                self.state = SessionState::Uninitialized;
                tracing::warn!(
                    session_id = %self.session_id,
                    character_id = %self.character_id,
                    error = %err,
                    "engine session initialization failed"
                );
                Err(err)
            }
        }
    }

    async fn start_instance(
        &mut self,
        runtime: &dyn EngineRuntime,
        vision_store: &dyn VisionStore,
        story_store: &dyn StoryStore,
        character_card: &JsonValue,
        config: &JsonValue,
    ) -> Result<(Box<dyn EngineInstance>, Vec<OutputEvent>), SessionError> {
        let config = EngineConfig::from_value(config)
            .map_err(|err| SessionError::invalid_payload("config", err))?;
        let config_json = serde_json::to_string(&config)
            .map_err(|err| SessionError::invalid_payload("config", err))?;
        let character_card = normalize_character_card(character_card, &self.character_id);

        let vision = match vision_store.load(&self.session_id).await? {
            Some(stored) => VisionSnapshot::from_value(&stored).unwrap_or_else(|err| {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "stored vision snapshot is malformed, starting from defaults"
                );
                VisionSnapshot::default()
            }),
            None => VisionSnapshot::default(),
        };
        let mut story_history = story_store
            .load_history(&self.session_id, self.history_limit)
            .await?;
        story_history.reverse();

        let init_line = InboundMessage::Init {
            session_id: &self.session_id,
            character_card: &character_card,
            config: &config,
            vision: &vision,
            story_history: &story_history,
        }
        .to_line()?;

        let instance = runtime.create_instance(&config_json)?;
        let (mut instance, lines) =
            run_blocking(instance, move |instance| instance.process(&init_line))
                .await
                .map_err(|err| EngineError::trap("process", format!("engine call aborted: {err}")))?;
        match lines.and_then(|lines| parse_output_lines(&lines)) {
            Ok(outputs) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    history = story_history.len(),
                    vision_tick = ?vision.tick,
                    "engine init sent"
                );
                Ok((instance, outputs))
            }
            Err(err) => {
                if let Err(release_err) = instance.release() {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %release_err,
                        "release after failed init failed"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Forwards a world delta. Only `mod_action` and `utterance` outputs are
    /// returned; `story_event` outputs are appended to the story log and a
    /// carried vision block replaces the stored snapshot.
    pub async fn on_world_diff(
        &mut self,
        vision_store: &dyn VisionStore,
        story_store: &dyn StoryStore,
        diff: &JsonValue,
    ) -> Result<Vec<OutputEvent>, SessionError> {
        if !self.is_ready() {
            return Ok(not_initialized());
        }
        self.touch();

        let delta = match WorldDelta::from_value(diff) {
            Ok(delta) => delta,
            Err(err) => {
                return Ok(vec![OutputEvent::error(
                    ERROR_INVALID_PAYLOAD,
                    format!("invalid world delta: {err}"),
                )])
            }
        };
        let message = InboundMessage::Event {
            kind: EventKind::WorldChange,
            data: &delta,
        };
        let outputs = match self.send(&message).await {
            Ok(outputs) => outputs,
            Err(err) => return Ok(vec![OutputEvent::from_engine_error(&err)]),
        };

        if let Some(vision) = &delta.vision {
            let tick = delta.snapshot_tick();
            vision_store
                .save(&self.session_id, &vision.to_value(), tick)
                .await?;
            tracing::debug!(session_id = %self.session_id, tick, "vision snapshot saved");
        }

        let now_ms = now_unix_ms();
        let mut results = Vec::new();
        for (index, output) in outputs.into_iter().enumerate() {
            if output.is_kind(OUTPUT_STORY_EVENT) {
                let event = StoryEvent::from_output(&self.session_id, index, &output, now_ms);
                story_store.append(&self.session_id, &event).await?;
                tracing::debug!(session_id = %self.session_id, story_id = %event.id, "story event appended");
            } else if output.is_kind(OUTPUT_MOD_ACTION) || output.is_kind(OUTPUT_UTTERANCE) {
                results.push(output);
            }
        }
        Ok(results)
    }

    /// Forwards player text and returns the module's outputs unfiltered.
    pub async fn on_player_message(&mut self, player_id: &str, text: &str) -> Vec<OutputEvent> {
        if !self.is_ready() {
            return not_initialized();
        }
        self.touch();
        let message = InboundMessage::PlayerMessage { player_id, text };
        self.send(&message)
            .await
            .unwrap_or_else(|err| vec![OutputEvent::from_engine_error(&err)])
    }

    /// Advances the engine clock by `elapsed_ms`.
    pub async fn on_tick(&mut self, elapsed_ms: u64) -> Vec<OutputEvent> {
        if !self.is_ready() {
            return not_initialized();
        }
        self.touch();
        self.call_engine("tick", move |instance| instance.tick(elapsed_ms))
            .await
            .unwrap_or_else(|err| vec![OutputEvent::from_engine_error(&err)])
    }

    async fn send(
        &mut self,
        message: &InboundMessage<'_>,
    ) -> Result<Vec<OutputEvent>, EngineError> {
        let line = message.to_line()?;
        self.call_engine("process", move |instance| instance.process(&line))
            .await
    }

    /// Runs one module call on the blocking pool. The instance moves into
    /// the call and back; if the call is lost the session drops to
    /// `Uninitialized` and the instance is released by its `Drop`.
    async fn call_engine<F>(
        &mut self,
        entrypoint: &'static str,
        call: F,
    ) -> Result<Vec<OutputEvent>, EngineError>
    where
        F: FnOnce(&mut dyn EngineInstance) -> Result<Vec<String>, EngineError> + Send + 'static,
    {
        let Some(instance) = self.instance.take() else {
            return Err(EngineError::HandleReleased);
        };
        let outputs = match run_blocking(instance, call).await {
            Ok((instance, lines)) => {
                self.instance = Some(instance);
                lines.and_then(|lines| parse_output_lines(&lines))
            }
            Err(err) => {
                self.state = SessionState::Uninitialized;
                Err(EngineError::trap(
                    entrypoint,
                    format!("engine call aborted: {err}"),
                ))
            }
        };
        self.log_engine_failure(entrypoint, outputs)
    }

    fn log_engine_failure(
        &self,
        entrypoint: &str,
        outputs: Result<Vec<OutputEvent>, EngineError>,
    ) -> Result<Vec<OutputEvent>, EngineError> {
        if let Err(err) = &outputs {
            tracing::warn!(
                session_id = %self.session_id,
                entrypoint,
                code = err.code(),
                error = %err,
                "engine call failed"
            );
        }
        outputs
    }

    /// Releases the instance and marks the session closed. Safe to call
    /// more than once.
    pub fn close(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Closed;
        let Some(mut instance) = self.instance.take() else {
            return Ok(());
        };
        instance.release()?;
        tracing::info!(session_id = %self.session_id, "engine session closed");
        Ok(())
    }

    fn release_instance(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            if let Err(err) = instance.release() {
                tracing::warn!(session_id = %self.session_id, error = %err, "engine release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_engine_executor::ScriptedRuntime;
    use companion_engine_store::{InMemoryStoryStore, InMemoryVisionStore};
    use serde_json::json;

    async fn ready_session(
        runtime: &ScriptedRuntime,
        vision: &InMemoryVisionStore,
        story: &InMemoryStoryStore,
    ) -> EngineSession {
        let mut session = EngineSession::new("S1", "char_1");
        session
            .initialize(runtime, vision, story, &json!({}), &json!({}))
            .await
            .expect("initialize");
        session
    }

    #[tokio::test]
    async fn calls_before_initialize_return_one_not_initialized_event() {
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = EngineSession::new("S1", "char_1");

        let outputs = session
            .on_world_diff(&vision, &story, &json!({"vision": {}, "tick": 1000}))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].error_code(), Some(ERROR_NOT_INITIALIZED));

        let outputs = session.on_player_message("p1", "hello").await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].error_code(), Some(ERROR_NOT_INITIALIZED));
        assert_eq!(session.on_tick(16).await[0].error_code(), Some(ERROR_NOT_INITIALIZED));

        assert!(vision.is_empty().await);
        assert_eq!(story.event_count("S1").await, 0);
    }

    #[tokio::test]
    async fn initialize_sends_normalized_init_and_becomes_ready() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = EngineSession::new("S1", "char_1");

        let outputs = session
            .initialize(&runtime, &vision, &story, &json!({"name": "Ari"}), &JsonValue::Null)
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.has_live_instance());
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_kind("engine_ready"));
        assert_eq!(outputs[0].get("session_id"), Some(&json!("S1")));
        assert_eq!(session.ready_events(), outputs.as_slice());
        assert_eq!(runtime.created(), 1);
    }

    #[tokio::test]
    async fn world_diff_filters_outputs_and_persists_side_effects() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        let outputs = session
            .on_world_diff(&vision, &story, &json!({"vision": {}, "tick": 1000}))
            .await
            .unwrap();

        let kinds: Vec<&str> = outputs.iter().filter_map(OutputEvent::kind).collect();
        assert_eq!(kinds, vec!["mod_action", "utterance"]);
        assert_eq!(vision.tick_of("S1").await, Some(1000));
        assert_eq!(story.event_count("S1").await, 1);

        let history = story.load_history("S1", 10).await.unwrap();
        assert_eq!(history[0].kind, "observation");
        assert_eq!(history[0].summary, "world changed at tick 1000");
        assert!(history[0].id.starts_with("story-"));
    }

    #[tokio::test]
    async fn world_diff_without_vision_keeps_stored_snapshot() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        session
            .on_world_diff(&vision, &story, &json!({"tick": 5}))
            .await
            .unwrap();
        assert!(vision.is_empty().await);
    }

    #[tokio::test]
    async fn vision_tick_falls_back_to_snapshot_tick_then_zero() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        session
            .on_world_diff(&vision, &story, &json!({"vision": {"tick": 77}}))
            .await
            .unwrap();
        assert_eq!(vision.tick_of("S1").await, Some(77));

        session
            .on_world_diff(&vision, &story, &json!({"vision": {}}))
            .await
            .unwrap();
        assert_eq!(vision.tick_of("S1").await, Some(0));
    }

    #[tokio::test]
    async fn malformed_world_diff_is_an_invalid_payload_event() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        let outputs = session
            .on_world_diff(&vision, &story, &json!({"tick": "soon"}))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].error_code(), Some(ERROR_INVALID_PAYLOAD));
        assert_eq!(story.event_count("S1").await, 0);
    }

    #[tokio::test]
    async fn engine_failure_becomes_error_event_without_persistence() {
        let runtime = ScriptedRuntime::new(|input: &str| {
            if input.contains("\"init\"") {
                Ok(vec![r#"{"type":"engine_ready"}"#.to_string()])
            } else {
                Err(EngineError::trap("engine_process", "boom"))
            }
        });
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        let outputs = session
            .on_world_diff(&vision, &story, &json!({"vision": {}, "tick": 3}))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].error_code(), Some("engine_trap"));
        assert!(vision.is_empty().await);
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn player_message_returns_raw_outputs() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        let outputs = session.on_player_message("p1", "hi").await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].get("text"), Some(&json!("you said: hi")));

        let ticked = session.on_tick(50).await;
        assert_eq!(ticked[0].get("elapsed_ms"), Some(&json!(50)));
    }

    #[tokio::test]
    async fn history_is_replayed_oldest_first_and_bounded() {
        let runtime = ScriptedRuntime::new(|input: &str| {
            let message: JsonValue = serde_json::from_str(input).unwrap();
            let ids: Vec<JsonValue> = message["story_history"]
                .as_array()
                .map(|events| events.iter().map(|event| event["id"].clone()).collect())
                .unwrap_or_default();
            Ok(vec![json!({"type": "engine_ready", "ids": ids}).to_string()])
        });
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        for index in 0..4 {
            story
                .append("S1", &StoryEvent::new(format!("e{index}"), index, "event", ""))
                .await
                .unwrap();
        }

        let mut session = EngineSession::new("S1", "char_1").with_history_limit(3);
        let outputs = session
            .initialize(&runtime, &vision, &story, &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(outputs[0].get("ids"), Some(&json!(["e1", "e2", "e3"])));
    }

    #[tokio::test]
    async fn failed_init_releases_instance_and_stays_uninitialized() {
        let runtime = ScriptedRuntime::new(|_: &str| Err(EngineError::trap("engine_process", "init rejected")));
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = EngineSession::new("S1", "char_1");

        let err = session
            .initialize(&runtime, &vision, &story, &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Engine(EngineError::Instantiation { .. })));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_instance_creation() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = EngineSession::new("S1", "char_1");

        let err = session
            .initialize(&runtime, &vision, &story, &json!({}), &json!({"enable_kv_cache": "yes"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload { field: "config", .. }));
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(runtime.live(), 0);
        assert_eq!(
            session.on_player_message("p1", "hi").await[0].error_code(),
            Some(ERROR_NOT_INITIALIZED)
        );

        let err = session
            .initialize(&runtime, &vision, &story, &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed { .. }));
    }

    #[tokio::test]
    async fn reinitialize_replaces_the_instance() {
        let runtime = ScriptedRuntime::companion();
        let vision = InMemoryVisionStore::new();
        let story = InMemoryStoryStore::new();
        let mut session = ready_session(&runtime, &vision, &story).await;

        session
            .initialize(&runtime, &vision, &story, &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(runtime.created(), 2);
        assert_eq!(runtime.live(), 1);
    }
}
