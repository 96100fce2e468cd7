//! Domain payloads and their normalization into the module's wire schema.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::wire::OutputEvent;

pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 256;
pub const DEFAULT_TIME_OF_DAY: i64 = 6000;
pub const DEFAULT_WEATHER: &str = "clear";
pub const DEFAULT_BIOME: &str = "minecraft:plains";
pub const DEFAULT_STORY_KIND: &str = "event";
pub const DEFAULT_CARD_VERSION: &str = "1.0";

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn empty_list() -> JsonValue {
    JsonValue::Array(Vec::new())
}

fn list_or_empty<'de, D>(deserializer: D) -> Result<JsonValue, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<JsonValue>::deserialize(deserializer)?
        .filter(|value| !value.is_null())
        .unwrap_or_else(empty_list))
}

fn timestamp_or_now<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or_else(now_unix_ms))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Generates a field deserializer that maps `null` to the field's default.
macro_rules! null_as {
    ($name:ident, $ty:ty, $default:path) => {
        fn $name<'de, D>(deserializer: D) -> Result<$ty, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<$ty>::deserialize(deserializer)?.unwrap_or_else($default))
        }
    };
}

null_as!(temperature_or_default, f64, default_temperature);
null_as!(top_p_or_default, f64, default_top_p);
null_as!(max_tokens_or_default, u32, default_max_tokens);
null_as!(true_or_default, bool, default_true);
null_as!(llm_model_or_default, String, default_llm_model);
null_as!(time_of_day_or_default, i64, default_time_of_day);
null_as!(weather_or_default, String, default_weather);
null_as!(biome_or_default, String, default_biome);

/// Treats `null` the same as an empty object so callers may omit a payload.
fn object_or_empty(value: &JsonValue) -> JsonValue {
    if value.is_null() {
        JsonValue::Object(JsonMap::new())
    } else {
        value.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature", deserialize_with = "temperature_or_default")]
    pub temperature: f64,
    #[serde(default = "default_top_p", deserialize_with = "top_p_or_default")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens", deserialize_with = "max_tokens_or_default")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_true() -> bool {
    true
}

fn default_llm_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Engine configuration after defaults are applied. Unknown keys pass through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_llm_model", deserialize_with = "llm_model_or_default")]
    pub llm_model: String,
    #[serde(default = "default_true", deserialize_with = "true_or_default")]
    pub enable_kv_cache: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sampling: SamplingConfig,
    #[serde(default = "default_true", deserialize_with = "true_or_default")]
    pub emit_vision_snapshot: bool,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_model: default_llm_model(),
            enable_kv_cache: true,
            sampling: SamplingConfig::default(),
            emit_vision_snapshot: true,
            extra: JsonMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_value(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(object_or_empty(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default = "default_time_of_day", deserialize_with = "time_of_day_or_default")]
    pub time_of_day: i64,
    #[serde(default = "default_weather", deserialize_with = "weather_or_default")]
    pub weather: String,
    #[serde(default = "default_biome", deserialize_with = "biome_or_default")]
    pub biome: String,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

fn default_time_of_day() -> i64 {
    DEFAULT_TIME_OF_DAY
}

fn default_weather() -> String {
    DEFAULT_WEATHER.to_string()
}

fn default_biome() -> String {
    DEFAULT_BIOME.to_string()
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            time_of_day: DEFAULT_TIME_OF_DAY,
            weather: default_weather(),
            biome: default_biome(),
            extra: JsonMap::new(),
        }
    }
}

/// Latest observable state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
    #[serde(default = "empty_list", deserialize_with = "list_or_empty")]
    pub entities: JsonValue,
    #[serde(default = "empty_list", deserialize_with = "list_or_empty")]
    pub blocks: JsonValue,
    #[serde(default, deserialize_with = "null_as_default")]
    pub environment: Environment,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Default for VisionSnapshot {
    fn default() -> Self {
        Self {
            tick: None,
            entities: empty_list(),
            blocks: empty_list(),
            environment: Environment::default(),
            extra: JsonMap::new(),
        }
    }
}

impl VisionSnapshot {
    pub fn from_value(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(object_or_empty(value))
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| JsonValue::Object(JsonMap::new()))
    }
}

/// Incremental change in the simulated world since the previous observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
    #[serde(default = "now_unix_ms", deserialize_with = "timestamp_or_now")]
    pub timestamp_ms: i64,
    #[serde(default = "empty_list", deserialize_with = "list_or_empty")]
    pub blocks: JsonValue,
    #[serde(default = "empty_list", deserialize_with = "list_or_empty")]
    pub entities: JsonValue,
    #[serde(default = "empty_list", deserialize_with = "list_or_empty")]
    pub player_actions: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<VisionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl WorldDelta {
    pub fn from_value(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(object_or_empty(value))
    }

    /// Tick under which the carried vision block is persisted: the delta's own
    /// tick, else the vision block's tick, else zero.
    pub fn snapshot_tick(&self) -> u64 {
        self.tick
            .or_else(|| self.vision.as_ref().and_then(|vision| vision.tick))
            .unwrap_or(0)
    }
}

/// Immutable narrative record appended to a session's story log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryEvent {
    pub id: String,
    pub timestamp: i64,
    pub kind: String,
    pub summary: String,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl StoryEvent {
    pub fn new(
        id: impl Into<String>,
        timestamp: i64,
        kind: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            kind: kind.into(),
            summary: summary.into(),
            extra: JsonMap::new(),
        }
    }

    /// Builds the persisted record for a `story_event` output. `index` is the
    /// position of the output within its batch and only feeds id derivation.
    pub fn from_output(session_id: &str, index: usize, output: &OutputEvent, now_ms: i64) -> Self {
        let fields = output.as_map();
        let timestamp = fields
            .get("timestamp")
            .and_then(JsonValue::as_i64)
            .unwrap_or(now_ms);
        let summary = fields
            .get("summary")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = fields
            .get("kind")
            .and_then(JsonValue::as_str)
            .filter(|kind| !kind.is_empty())
            .unwrap_or(DEFAULT_STORY_KIND)
            .to_string();
        let id = fields
            .get("id")
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derive_story_id(session_id, timestamp, index, &summary));

        let extra = fields
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    "type" | "id" | "timestamp" | "kind" | "summary"
                )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            id,
            timestamp,
            kind,
            summary,
            extra,
        }
    }
}

fn derive_story_id(session_id: &str, timestamp: i64, index: usize, summary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{session_id}\n{timestamp}\n{index}\n{summary}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("story-{}", &digest[..16])
}

/// Fills the identity fields of a character card. A card without a
/// `metadata` block gets one inferred from its id and name.
pub fn normalize_character_card(card: &JsonValue, character_id: &str) -> JsonValue {
    let mut card = match card {
        JsonValue::Object(map) => map.clone(),
        _ => JsonMap::new(),
    };

    let id = card
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
        .unwrap_or(character_id)
        .to_string();
    card.insert("id".to_string(), JsonValue::from(id.clone()));

    if !card.get("metadata").is_some_and(JsonValue::is_object) {
        let name = card
            .get("name")
            .and_then(JsonValue::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(&id)
            .to_string();
        let mut metadata = JsonMap::new();
        metadata.insert("id".to_string(), JsonValue::from(id));
        metadata.insert("name".to_string(), JsonValue::from(name));
        metadata.insert("version".to_string(), JsonValue::from(DEFAULT_CARD_VERSION));
        card.insert("metadata".to_string(), JsonValue::Object(metadata));
    }

    JsonValue::Object(card)
}
