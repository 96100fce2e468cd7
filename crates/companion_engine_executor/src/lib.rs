//! Execution backends for the engine module.

use companion_engine_abi::EngineError;
use std::ops::Range;
use std::path::PathBuf;

#[cfg(feature = "wasmtime")]
mod bridge;
mod scripted;

#[cfg(feature = "wasmtime")]
pub use bridge::{EngineHandle, ModuleMemoryBridge};
pub use scripted::{ScriptedInstance, ScriptedRuntime};

pub const DEFAULT_MODULE_PATH: &str = "wasm/llmnemeust_bg.wasm";
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 4 * 1024 * 1024;

/// Export names the bridge binds on every instance. Defaults follow the
/// wasm-bindgen naming of the engine build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportNames {
    pub constructor: String,
    pub process: String,
    pub tick: String,
    pub malloc: String,
    pub free: String,
    pub drop: String,
    pub memory: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            constructor: "engine_new".to_string(),
            process: "engine_process".to_string(),
            tick: "engine_tick".to_string(),
            malloc: "__wbindgen_malloc".to_string(),
            free: "__wbindgen_free".to_string(),
            drop: "__wbg_engine_free".to_string(),
            memory: "memory".to_string(),
        }
    }
}

/// Configuration for loading the engine module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub module_path: PathBuf,
    pub exports: ExportNames,
    pub max_output_bytes: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            module_path: PathBuf::from(DEFAULT_MODULE_PATH),
            exports: ExportNames::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Converts a `(ptr, len)` request into a byte range of a linear memory of
/// `memory_size` bytes, rejecting anything that does not fit.
#[cfg_attr(not(feature = "wasmtime"), allow(dead_code))]
pub(crate) fn checked_range(ptr: i64, len: u64, memory_size: u64) -> Result<Range<usize>, EngineError> {
    let out_of_bounds = || EngineError::MemoryBounds {
        ptr,
        len,
        memory_size,
    };
    let start = u64::try_from(ptr).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > memory_size {
        return Err(out_of_bounds());
    }
    let start = usize::try_from(start).map_err(|_| out_of_bounds())?;
    let end = usize::try_from(end).map_err(|_| out_of_bounds())?;
    Ok(start..end)
}

/// wasm32 addresses are unsigned even though they travel as `i32`.
#[cfg_attr(not(feature = "wasmtime"), allow(dead_code))]
pub(crate) fn wasm_addr(raw: i32) -> i64 {
    i64::from(raw as u32)
}
