use companion_engine_abi::{split_output_lines, EngineError, EngineInstance, EngineRuntime};
use std::fmt;
use std::fs;
use wasmtime::{
    Caller, Engine, Extern, ExternType, Func, FuncType, Instance, Memory, Module, Store, Trap,
    TypedFunc, Val, ValType,
};

use crate::{checked_range, wasm_addr, BridgeConfig};

/// Per-store host state. The throw import records its message here so the
/// caller can report it instead of the trap backtrace.
#[derive(Debug, Default)]
struct HostState {
    last_throw: Option<String>,
}

/// How an entry point hands back its `(ptr, len)` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultAbi {
    Multi,
    PackedI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarKind {
    I32,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    fn of(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(Self::I32),
            ValType::I64 => Some(Self::I64),
            ValType::F32 => Some(Self::F32),
            ValType::F64 => Some(Self::F64),
            _ => None,
        }
    }

    fn elapsed(self, elapsed_ms: u64) -> Val {
        match self {
            Self::I32 => Val::I32(i32::try_from(elapsed_ms).unwrap_or(i32::MAX)),
            Self::I64 => Val::I64(i64::try_from(elapsed_ms).unwrap_or(i64::MAX)),
            Self::F32 => Val::F32((elapsed_ms as f32).to_bits()),
            Self::F64 => Val::F64((elapsed_ms as f64).to_bits()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostImport {
    Throw,
    Noop,
}

impl HostImport {
    fn resolve(name: &str, ty: &FuncType) -> Option<Self> {
        let params: Vec<ValType> = ty.params().collect();
        let no_results = ty.results().len() == 0;
        let throw_shape = no_results && matches!(params.as_slice(), [ValType::I32, ValType::I32]);
        let noop_shape = no_results && params.is_empty();

        if name.contains("throw") && throw_shape {
            return Some(Self::Throw);
        }
        if (name.contains("externref") || name.contains("init")) && noop_shape {
            return Some(Self::Noop);
        }
        if throw_shape {
            Some(Self::Throw)
        } else if noop_shape {
            Some(Self::Noop)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct EntryPoint {
    name: String,
    func: Func,
    abi: ResultAbi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Live { engine_ptr: i32 },
    Released,
}

/// A compiled engine module. Each instance created from it gets its own
/// store and linear memory.
#[derive(Clone)]
pub struct ModuleMemoryBridge {
    config: BridgeConfig,
    engine: Engine,
    module: Module,
}

impl fmt::Debug for ModuleMemoryBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleMemoryBridge")
            .field("config", &self.config)
            .finish()
    }
}

impl ModuleMemoryBridge {
    /// Reads and compiles the module at `config.module_path`.
    pub fn load(config: BridgeConfig) -> Result<Self, EngineError> {
        let path = config.module_path.display().to_string();
        if !config.module_path.is_file() {
            return Err(EngineError::module_load(path, "module file not found"));
        }
        let bytes = fs::read(&config.module_path)
            .map_err(|err| EngineError::module_load(&path, format!("read failed: {err}")))?;
        Self::from_bytes(config, &bytes)
    }

    pub fn from_bytes(config: BridgeConfig, bytes: &[u8]) -> Result<Self, EngineError> {
        let path = config.module_path.display().to_string();
        let mut engine_config = wasmtime::Config::new();
        engine_config.wasm_multi_value(true);
        engine_config.wasm_reference_types(true);
        engine_config.wasm_threads(false);
        let engine = Engine::new(&engine_config)
            .map_err(|err| EngineError::module_load(&path, format!("engine init failed: {err}")))?;
        let module = Module::new(&engine, bytes)
            .map_err(|err| EngineError::module_load(&path, format!("compile failed: {err}")))?;
        tracing::info!(module = %path, imports = module.imports().len(), "engine module loaded");
        Ok(Self {
            config,
            engine,
            module,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn module_path(&self) -> String {
        self.config.module_path.display().to_string()
    }

    /// Instantiates the module, writes `config_json` into the new memory and
    /// runs the constructor export.
    pub fn create_instance(&self, config_json: &str) -> Result<EngineHandle, EngineError> {
        let path = self.module_path();
        let exports = &self.config.exports;
        let mut store = Store::new(&self.engine, HostState::default());
        let imports = self.link_imports(&mut store)?;
        let instance = Instance::new(&mut store, &self.module, &imports)
            .map_err(|err| {
                EngineError::module_load(&path, format!("instantiation failed: {err}"))
            })?;

        let memory = instance
            .get_memory(&mut store, exports.memory.as_str())
            .ok_or_else(|| {
                EngineError::module_load(&path, format!("missing {} export", exports.memory))
            })?;
        let constructor =
            typed_export::<(i32, i32), i32>(&mut store, &instance, &exports.constructor, &path)?;
        let malloc =
            typed_export::<(i32, i32), i32>(&mut store, &instance, &exports.malloc, &path)?;
        let free =
            typed_export::<(i32, i32, i32), ()>(&mut store, &instance, &exports.free, &path)?;
        let drop_fn =
            typed_export::<(i32, i32), ()>(&mut store, &instance, &exports.drop, &path)?;

        let (process, process_args) =
            resolve_entry(&mut store, &instance, &exports.process, &path)?;
        if !matches!(process_args.as_slice(), [ValType::I32, ValType::I32]) {
            return Err(EngineError::module_load(
                &path,
                format!("{} must take (self, ptr, len)", exports.process),
            ));
        }
        let (tick, tick_args) = resolve_entry(&mut store, &instance, &exports.tick, &path)?;
        let tick_arg = match tick_args.as_slice() {
            [ty] => ScalarKind::of(ty),
            _ => None,
        }
        .ok_or_else(|| {
            EngineError::module_load(
                &path,
                format!("{} must take (self, elapsed) with a numeric elapsed", exports.tick),
            )
        })?;

        let mut handle = EngineHandle {
            store,
            instance,
            memory,
            process,
            tick,
            tick_arg,
            malloc,
            free,
            drop_fn,
            state: HandleState::Released,
            max_output_bytes: self.config.max_output_bytes,
            malloc_name: exports.malloc.clone(),
            free_name: exports.free.clone(),
            drop_name: exports.drop.clone(),
        };

        let (config_ptr, config_len) = handle.write_utf8(config_json)?;
        handle.store.data_mut().last_throw = None;
        let engine_ptr = constructor
            .call(&mut handle.store, (config_ptr, config_len))
            .map_err(|err| handle.map_call_error(&exports.constructor, err))?;
        if engine_ptr == 0 {
            return Err(EngineError::trap(
                &exports.constructor,
                "constructor returned a null instance pointer",
            ));
        }
        handle.state = HandleState::Live { engine_ptr };
        tracing::debug!(module = %path, engine_ptr, "engine instance created");
        Ok(handle)
    }

    /// Builds the positional import list for one store.
    fn link_imports(&self, store: &mut Store<HostState>) -> Result<Vec<Extern>, EngineError> {
        let mut externs = Vec::new();
        for import in self.module.imports() {
            let unsupported = || {
                EngineError::module_load(
                    self.module_path(),
                    format!("unsupported import {}.{}", import.module(), import.name()),
                )
            };
            let ExternType::Func(ty) = import.ty() else {
                return Err(unsupported());
            };
            let func = match HostImport::resolve(import.name(), &ty).ok_or_else(unsupported)? {
                HostImport::Throw => {
                    let memory_name = self.config.exports.memory.clone();
                    Func::wrap(
                        &mut *store,
                        move |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                            let message = read_throw_message(&mut caller, &memory_name, ptr, len);
                            caller.data_mut().last_throw = Some(message.clone());
                            Err(wasmtime::Error::msg(message))
                        },
                    )
                }
                HostImport::Noop => Func::wrap(&mut *store, || {}),
            };
            externs.push(func.into());
        }
        Ok(externs)
    }
}

impl EngineRuntime for ModuleMemoryBridge {
    fn create_instance(&self, config_json: &str) -> Result<Box<dyn EngineInstance>, EngineError> {
        ModuleMemoryBridge::create_instance(self, config_json)
            .map(|handle| Box::new(handle) as Box<dyn EngineInstance>)
    }
}

fn typed_export<Params, Results>(
    store: &mut Store<HostState>,
    instance: &Instance,
    name: &str,
    path: &str,
) -> Result<TypedFunc<Params, Results>, EngineError>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(&mut *store, name)
        .map_err(|err| EngineError::module_load(path, format!("export {name}: {err}")))
}

/// Looks up an entry point and works out its result convention. Returns the
/// parameter types that follow the instance pointer.
fn resolve_entry(
    store: &mut Store<HostState>,
    instance: &Instance,
    name: &str,
    path: &str,
) -> Result<(EntryPoint, Vec<ValType>), EngineError> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| EngineError::module_load(path, format!("missing {name} export")))?;
    let ty = func.ty(&*store);
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    let abi = match results.as_slice() {
        [ValType::I32, ValType::I32] => ResultAbi::Multi,
        [ValType::I64] => ResultAbi::PackedI64,
        _ => {
            return Err(EngineError::module_load(
                path,
                format!("{name} has an unsupported result signature"),
            ))
        }
    };
    let Some((ValType::I32, args)) = params.split_first() else {
        return Err(EngineError::module_load(
            path,
            format!("{name} is missing its instance pointer parameter"),
        ));
    };
    let args = args.to_vec();
    Ok((
        EntryPoint {
            name: name.to_string(),
            func,
            abi,
        },
        args,
    ))
}

fn read_throw_message(
    caller: &mut Caller<'_, HostState>,
    memory_name: &str,
    ptr: i32,
    len: i32,
) -> String {
    let Some(memory) = caller.get_export(memory_name).and_then(Extern::into_memory) else {
        return "module raised an error".to_string();
    };
    let data = memory.data(&*caller);
    match checked_range(wasm_addr(ptr), u64::from(len as u32), data.len() as u64) {
        Ok(range) => String::from_utf8_lossy(&data[range]).into_owned(),
        Err(_) => "module raised an error (message out of bounds)".to_string(),
    }
}

/// One live module instance: its store, memory and bound exports.
///
/// The instance pointer only moves from live to released. Every call after
/// release fails with [`EngineError::HandleReleased`].
pub struct EngineHandle {
    store: Store<HostState>,
    #[cfg_attr(not(test), allow(dead_code))]
    instance: Instance,
    memory: Memory,
    process: EntryPoint,
    tick: EntryPoint,
    tick_arg: ScalarKind,
    malloc: TypedFunc<(i32, i32), i32>,
    free: TypedFunc<(i32, i32, i32), ()>,
    drop_fn: TypedFunc<(i32, i32), ()>,
    state: HandleState,
    max_output_bytes: u64,
    malloc_name: String,
    free_name: String,
    drop_name: String,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &self.state)
            .field("process_abi", &self.process.abi)
            .field("tick_abi", &self.tick.abi)
            .finish()
    }
}

impl EngineHandle {
    pub fn is_live(&self) -> bool {
        matches!(self.state, HandleState::Live { .. })
    }

    fn engine_ptr(&self) -> Result<i32, EngineError> {
        match self.state {
            HandleState::Live { engine_ptr } => Ok(engine_ptr),
            HandleState::Released => Err(EngineError::HandleReleased),
        }
    }

    pub fn process(&mut self, input_json: &str) -> Result<Vec<String>, EngineError> {
        self.engine_ptr()?;
        let (ptr, len) = self.write_utf8(input_json)?;
        let entry = self.process.clone();
        self.invoke(&entry, &[Val::I32(ptr), Val::I32(len)])
    }

    pub fn tick(&mut self, elapsed_ms: u64) -> Result<Vec<String>, EngineError> {
        self.engine_ptr()?;
        let entry = self.tick.clone();
        let elapsed = self.tick_arg.elapsed(elapsed_ms);
        self.invoke(&entry, &[elapsed])
    }

    /// Calls the drop export once. Later calls do nothing.
    pub fn release(&mut self) -> Result<(), EngineError> {
        let HandleState::Live { engine_ptr } = self.state else {
            return Ok(());
        };
        self.state = HandleState::Released;
        self.store.data_mut().last_throw = None;
        let drop_name = self.drop_name.clone();
        self.drop_fn
            .call(&mut self.store, (engine_ptr, 1))
            .map_err(|err| self.map_call_error(&drop_name, err))?;
        tracing::debug!(engine_ptr, "engine instance released");
        Ok(())
    }

    /// Calls `entry` with the instance pointer and `args`, then decodes and
    /// frees the returned buffer.
    fn invoke(&mut self, entry: &EntryPoint, args: &[Val]) -> Result<Vec<String>, EngineError> {
        let engine_ptr = self.engine_ptr()?;
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Val::I32(engine_ptr));
        params.extend_from_slice(args);

        let result_count = match entry.abi {
            ResultAbi::Multi => 2,
            ResultAbi::PackedI64 => 1,
        };
        let mut results = vec![Val::I32(0); result_count];
        self.store.data_mut().last_throw = None;
        entry
            .func
            .call(&mut self.store, &params, &mut results)
            .map_err(|err| self.map_call_error(&entry.name, err))?;

        let (ptr, len) = match entry.abi {
            ResultAbi::PackedI64 => {
                let packed = results.first().and_then(Val::i64).ok_or_else(|| {
                    EngineError::invalid_output(format!("{} returned no i64", entry.name))
                })? as u64;
                ((packed & 0xffff_ffff) as u32 as i32, (packed >> 32) as u32 as i32)
            }
            ResultAbi::Multi => {
                let ptr = results.first().and_then(Val::i32);
                let len = results.get(1).and_then(Val::i32);
                match (ptr, len) {
                    (Some(ptr), Some(len)) => (ptr, len),
                    _ => {
                        return Err(EngineError::invalid_output(format!(
                            "{} did not return a (ptr, len) pair",
                            entry.name
                        )))
                    }
                }
            }
        };

        let mut buffer = ResultBuffer {
            store: &mut self.store,
            memory: self.memory,
            free: self.free.clone(),
            free_name: &self.free_name,
            ptr,
            len,
            freed: false,
        };
        let decoded = buffer.read_utf8(self.max_output_bytes);
        let released = buffer.release();
        let output = decoded?;
        released?;
        Ok(split_output_lines(&output))
    }

    fn malloc_raw(&mut self, size: i32, align: i32) -> Result<i32, EngineError> {
        self.store.data_mut().last_throw = None;
        let malloc_name = self.malloc_name.clone();
        self.malloc
            .call(&mut self.store, (size, align))
            .map_err(|err| self.map_call_error(&malloc_name, err))
    }

    /// Copies `text` into a fresh module allocation.
    fn write_utf8(&mut self, text: &str) -> Result<(i32, i32), EngineError> {
        let bytes = text.as_bytes();
        let memory_size = self.memory.data_size(&self.store) as u64;
        let len = i32::try_from(bytes.len()).map_err(|_| EngineError::MemoryBounds {
            ptr: 0,
            len: bytes.len() as u64,
            memory_size,
        })?;
        let ptr = self.malloc_raw(len, 1)?;
        if !bytes.is_empty() {
            let memory_size = self.memory.data_size(&self.store) as u64;
            let range = checked_range(wasm_addr(ptr), bytes.len() as u64, memory_size)?;
            self.memory.data_mut(&mut self.store)[range].copy_from_slice(bytes);
        }
        Ok((ptr, len))
    }

    fn map_call_error(&mut self, entrypoint: &str, err: wasmtime::Error) -> EngineError {
        if let Some(message) = self.store.data_mut().last_throw.take() {
            return EngineError::trap(entrypoint, message);
        }
        if let Some(trap) = err.downcast_ref::<Trap>() {
            return EngineError::trap(entrypoint, trap.to_string());
        }
        EngineError::trap(entrypoint, err.to_string())
    }

    #[cfg(test)]
    fn exported_i32(&mut self, name: &str) -> Option<i32> {
        self.instance
            .get_global(&mut self.store, name)
            .and_then(|global| global.get(&mut self.store).i32())
    }
}

impl EngineInstance for EngineHandle {
    fn process(&mut self, input_json: &str) -> Result<Vec<String>, EngineError> {
        EngineHandle::process(self, input_json)
    }

    fn tick(&mut self, elapsed_ms: u64) -> Result<Vec<String>, EngineError> {
        EngineHandle::tick(self, elapsed_ms)
    }

    fn release(&mut self) -> Result<(), EngineError> {
        EngineHandle::release(self)
    }

    fn is_live(&self) -> bool {
        EngineHandle::is_live(self)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "engine instance release failed on drop");
        }
    }
}

/// A result buffer owned by the module until the host frees it. Dropping
/// the guard frees the buffer if `release` was never reached.
struct ResultBuffer<'a> {
    store: &'a mut Store<HostState>,
    memory: Memory,
    free: TypedFunc<(i32, i32, i32), ()>,
    free_name: &'a str,
    ptr: i32,
    len: i32,
    freed: bool,
}

impl ResultBuffer<'_> {
    fn read_utf8(&self, max_output_bytes: u64) -> Result<String, EngineError> {
        let len = u64::from(self.len as u32);
        if len > max_output_bytes {
            return Err(EngineError::invalid_output(format!(
                "output of {len} bytes exceeds limit of {max_output_bytes}"
            )));
        }
        if len == 0 {
            return Ok(String::new());
        }
        let data = self.memory.data(&*self.store);
        let range = checked_range(wasm_addr(self.ptr), len, data.len() as u64)?;
        String::from_utf8(data[range].to_vec())
            .map_err(|err| EngineError::invalid_output(format!("output is not UTF-8: {err}")))
    }

    fn release(&mut self) -> Result<(), EngineError> {
        if self.freed {
            return Ok(());
        }
        self.freed = true;
        self.free
            .call(&mut *self.store, (self.ptr, self.len, 1))
            .map_err(|err| EngineError::trap(self.free_name, err.to_string()))
    }
}

impl Drop for ResultBuffer<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, ptr = self.ptr, "result buffer free failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MOCK_ENGINE: &str = include_str!("../testdata/mock_engine.wat");

    fn mock_bridge(config: BridgeConfig) -> ModuleMemoryBridge {
        let wasm = wat::parse_str(MOCK_ENGINE).expect("parse mock engine");
        ModuleMemoryBridge::from_bytes(config, &wasm).expect("load mock engine")
    }

    fn mock_instance(config: BridgeConfig) -> EngineHandle {
        mock_bridge(config)
            .create_instance("{}")
            .expect("create instance")
    }

    fn frees(handle: &mut EngineHandle) -> i32 {
        handle.exported_i32("frees").expect("frees global")
    }

    fn live_engines(handle: &mut EngineHandle) -> i32 {
        handle.exported_i32("live_engines").expect("live_engines global")
    }

    #[test]
    fn create_then_release_is_idempotent() {
        let mut handle = mock_instance(BridgeConfig::default());
        assert!(handle.is_live());
        assert_eq!(live_engines(&mut handle), 1);

        handle.release().unwrap();
        handle.release().unwrap();
        assert!(!handle.is_live());
        assert_eq!(live_engines(&mut handle), 0);
    }

    #[test]
    fn calls_after_release_are_rejected() {
        let mut handle = mock_instance(BridgeConfig::default());
        handle.release().unwrap();
        assert_eq!(
            handle.process(r#"{"type":"init"}"#).unwrap_err(),
            EngineError::HandleReleased
        );
        assert_eq!(handle.tick(16).unwrap_err(), EngineError::HandleReleased);
    }

    #[test]
    fn process_decodes_and_frees_result_once() {
        let mut handle = mock_instance(BridgeConfig::default());
        let lines = handle.process(r#"{"type":"init","session_id":"S1"}"#).unwrap();
        assert_eq!(lines, vec![r#"{"type":"engine_ready"}"#.to_string()]);
        assert_eq!(frees(&mut handle), 1);
    }

    #[test]
    fn process_splits_lines_and_drops_blank_ones() {
        let mut handle = mock_instance(BridgeConfig::default());
        let lines = handle
            .process(r#"{"type":"event","kind":"world_change","data":{}}"#)
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("mod_action"));
        assert!(lines[1].contains("story_event"));
        assert!(lines[2].contains("utterance"));
    }

    #[test]
    fn host_throw_surfaces_module_message() {
        let mut handle = mock_instance(BridgeConfig::default());
        let err = handle.process("!boom").unwrap_err();
        assert_eq!(
            err,
            EngineError::Instantiation {
                entrypoint: "engine_process".to_string(),
                message: "engine rejected input".to_string(),
            }
        );
        assert_eq!(frees(&mut handle), 0);
    }

    #[test]
    fn invalid_utf8_output_is_rejected_and_still_freed() {
        let mut handle = mock_instance(BridgeConfig::default());
        let err = handle.process("~").unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput { .. }));
        assert_eq!(frees(&mut handle), 1);
    }

    #[test]
    fn out_of_bounds_output_is_rejected_and_still_freed() {
        let mut handle = mock_instance(BridgeConfig::default());
        let err = handle.process("^").unwrap_err();
        assert!(matches!(
            err,
            EngineError::MemoryBounds {
                ptr: 70000,
                len: 10,
                ..
            }
        ));
        assert_eq!(frees(&mut handle), 1);
    }

    #[test]
    fn oversized_output_is_rejected_and_still_freed() {
        let mut handle = mock_instance(BridgeConfig {
            max_output_bytes: 8,
            ..BridgeConfig::default()
        });
        let err = handle.process(r#"{"type":"init"}"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput { .. }));
        assert_eq!(frees(&mut handle), 1);
    }

    #[test]
    fn tick_unpacks_i64_results() {
        let mut handle = mock_instance(BridgeConfig::default());
        assert_eq!(handle.tick(16).unwrap(), vec![r#"{"type":"tick"}"#.to_string()]);
    }

    #[test]
    fn empty_config_traps_in_constructor() {
        let bridge = mock_bridge(BridgeConfig::default());
        let err = bridge.create_instance("").unwrap_err();
        assert_eq!(
            err,
            EngineError::Instantiation {
                entrypoint: "engine_new".to_string(),
                message: "empty engine config".to_string(),
            }
        );
    }

    #[test]
    fn instances_do_not_share_memory() {
        let bridge = mock_bridge(BridgeConfig::default());
        let mut first = bridge.create_instance("{}").unwrap();
        let mut second = bridge.create_instance("{}").unwrap();

        first.process(r#"{"type":"init"}"#).unwrap();
        assert_eq!(frees(&mut first), 1);
        assert_eq!(frees(&mut second), 0);
    }

    #[test]
    fn missing_module_file_is_a_load_error() {
        let err = ModuleMemoryBridge::load(BridgeConfig {
            module_path: PathBuf::from("/nonexistent/engine.wasm"),
            ..BridgeConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), "module_load_failed");
    }

    #[test]
    fn malformed_module_is_a_load_error() {
        let err = ModuleMemoryBridge::from_bytes(BridgeConfig::default(), &[0x01, 0x02, 0x03])
            .unwrap_err();
        assert!(matches!(err, EngineError::ModuleLoad { .. }));
    }

    #[test]
    fn unknown_import_is_a_load_error() {
        let wasm = wat::parse_str(r#"(module (import "env" "clock" (func (param i64))))"#)
            .expect("parse module");
        let bridge = ModuleMemoryBridge::from_bytes(BridgeConfig::default(), &wasm).unwrap();
        let err = bridge.create_instance("{}").unwrap_err();
        match err {
            EngineError::ModuleLoad { message, .. } => {
                assert!(message.contains("env.clock"), "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn host_imports_resolve_by_name_then_shape() {
        let throw_ty = FuncType::new(
            &Engine::default(),
            [ValType::I32, ValType::I32],
            Vec::<ValType>::new(),
        );
        let noop_ty = FuncType::new(&Engine::default(), Vec::<ValType>::new(), Vec::new());
        assert_eq!(
            HostImport::resolve("__wbindgen_throw", &throw_ty),
            Some(HostImport::Throw)
        );
        assert_eq!(
            HostImport::resolve("__wbindgen_throw", &noop_ty),
            Some(HostImport::Noop)
        );
        assert_eq!(
            HostImport::resolve("__wbg_init_error_hook", &throw_ty),
            Some(HostImport::Throw)
        );
        let clock_ty = FuncType::new(&Engine::default(), Vec::<ValType>::new(), [ValType::F64]);
        assert_eq!(HostImport::resolve("__wbg_init_clock", &clock_ty), None);
        assert_eq!(
            HostImport::resolve("__wbindgen_init_externref_table", &noop_ty),
            Some(HostImport::Noop)
        );
        assert_eq!(HostImport::resolve("__wbg_raise", &throw_ty), Some(HostImport::Throw));
        assert_eq!(HostImport::resolve("__wbg_start", &noop_ty), Some(HostImport::Noop));
    }

    #[test]
    fn tick_argument_follows_the_declared_type() {
        assert_eq!(ScalarKind::of(&ValType::I32), Some(ScalarKind::I32));
        assert_eq!(ScalarKind::of(&ValType::F64), Some(ScalarKind::F64));
        assert_eq!(ScalarKind::of(&ValType::V128), None);

        assert_eq!(ScalarKind::I32.elapsed(16).i32(), Some(16));
        assert_eq!(ScalarKind::I32.elapsed(u64::MAX).i32(), Some(i32::MAX));
        assert_eq!(
            ScalarKind::I32.elapsed(i32::MAX as u64 + 1).i32(),
            Some(i32::MAX)
        );
        assert_eq!(ScalarKind::I64.elapsed(5_000).i64(), Some(5_000));
        assert_eq!(ScalarKind::I64.elapsed(u64::MAX).i64(), Some(i64::MAX));
        assert_eq!(ScalarKind::F32.elapsed(250).f32(), Some(250.0));
        assert_eq!(ScalarKind::F64.elapsed(1_000).f64(), Some(1_000.0));
    }
}
