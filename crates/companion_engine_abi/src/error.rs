use thiserror::Error;

/// Failure raised by the module bridge or a runtime implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The module file is missing or malformed, or it could not be linked.
    #[error("module load failed ({path}): {message}")]
    ModuleLoad { path: String, message: String },
    /// The module trapped (or raised through the host throw hook) while running an export.
    #[error("module trapped in {entrypoint}: {message}")]
    Instantiation { entrypoint: String, message: String },
    #[error("memory access out of bounds: ptr={ptr} len={len} memory_size={memory_size}")]
    MemoryBounds {
        ptr: i64,
        len: u64,
        memory_size: u64,
    },
    #[error("engine handle used after release")]
    HandleReleased,
    #[error("invalid module output: {message}")]
    InvalidOutput { message: String },
}

impl EngineError {
    /// Stable code carried by the `error` output event that surfaces this failure.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ModuleLoad { .. } => "module_load_failed",
            EngineError::Instantiation { .. } => "engine_trap",
            EngineError::MemoryBounds { .. } => "memory_bounds",
            EngineError::HandleReleased => "handle_released",
            EngineError::InvalidOutput { .. } => "invalid_output",
        }
    }

    pub fn module_load(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ModuleLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn trap(entrypoint: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Instantiation {
            entrypoint: entrypoint.into(),
            message: message.into(),
        }
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        EngineError::InvalidOutput {
            message: message.into(),
        }
    }
}
