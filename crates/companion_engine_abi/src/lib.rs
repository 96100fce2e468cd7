//! Host/engine contract: wire messages, domain payloads and the runtime seam.

mod error;
pub mod payload;
pub mod wire;

pub use error::EngineError;
pub use payload::{
    normalize_character_card, now_unix_ms, EngineConfig, Environment, SamplingConfig, StoryEvent,
    VisionSnapshot, WorldDelta, DEFAULT_BIOME, DEFAULT_LLM_MODEL, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE, DEFAULT_TIME_OF_DAY, DEFAULT_TOP_P, DEFAULT_WEATHER,
};
pub use wire::{
    parse_output_lines, split_output_lines, EventKind, InboundMessage, OutputEvent,
    ERROR_INVALID_PAYLOAD, ERROR_NOT_INITIALIZED, ERROR_SESSION_NOT_FOUND, OUTPUT_ENGINE_READY,
    OUTPUT_ERROR, OUTPUT_MOD_ACTION, OUTPUT_STORY_EVENT, OUTPUT_UTTERANCE,
};

/// One live engine instance. Calls on a single instance must not overlap.
pub trait EngineInstance: Send {
    /// Sends one JSON line to the `process` entry point and returns the
    /// non-empty output lines.
    fn process(&mut self, input_json: &str) -> Result<Vec<String>, EngineError>;

    fn tick(&mut self, elapsed_ms: u64) -> Result<Vec<String>, EngineError>;

    /// Drops the module-side instance. Releasing twice is a no-op.
    fn release(&mut self) -> Result<(), EngineError>;

    fn is_live(&self) -> bool;
}

/// Factory for isolated engine instances backed by one loaded module.
pub trait EngineRuntime: Send + Sync {
    fn create_instance(&self, config_json: &str) -> Result<Box<dyn EngineInstance>, EngineError>;
}
