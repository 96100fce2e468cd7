//! Host runtime for the companion engine module: per-session engine
//! lifecycle, world/player/tick routing and vision/story persistence.

mod config;
mod error;
mod logging;
mod manager;
mod session;

pub use config::{
    HostConfig, HostConfigError, DEFAULT_CONFIG_FILE_NAME, DEFAULT_DATA_DIR,
    DEFAULT_HISTORY_LIMIT, DEFAULT_IDLE_TIMEOUT_SECS, ENV_DATA_DIR, ENV_HISTORY_LIMIT,
    ENV_IDLE_TIMEOUT_SECS, ENV_LOG_FILE, ENV_LOG_LEVEL, ENV_MAX_OUTPUT_BYTES, ENV_WASM_PATH,
};
pub use error::SessionError;
pub use logging::{init_tracing, LoggingError, DEFAULT_LOG_LEVEL};
pub use manager::{EngineSessionManager, SharedSession};
pub use session::{EngineSession, SessionState};

pub use companion_engine_abi as abi;
pub use companion_engine_executor as executor;
pub use companion_engine_store as store;
