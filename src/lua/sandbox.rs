//! Sandbox engine
//!
//! A [`LuaSandbox`] owns one interpreter, its governor and the registry of
//! host callables exposed to it. Every guest invocation goes through
//! [`SandboxCore::call_guest`], which arms the governor, converts values at the
//! boundary and classifies failures.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use mlua::{ChunkMode, Function, HookTriggers, Lua, MultiValue, RegistryKey, Table, Value, VmState};
use tracing::debug;
use uuid::Uuid;

use super::convert::Marshaller;
use super::error::{capture_trace, record_from_error, record_from_value, ErrorKind, FatalSignal, StackFrame};
use super::function::{dispatch_host, FunctionHandle, HostFunction};
use super::governor::{Governor, GovernorPhase, ResourceBudget};
use super::library::{self, Internals};
use super::memory::AllocWatch;
use super::profiler::{function_id, ProfileEntry, Profiler, ProfilerUnits};
use super::value::HostValue;
use super::GuestValue;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};

/// Wrap an interpreter error as a guest error
pub(crate) fn guest_error(err: mlua::Error) -> SandboxError {
    SandboxError::Guest(record_from_error(&err))
}

/// Interpreter and bridge versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// The interpreter's `_VERSION`, e.g. "Lua 5.4"
    pub interpreter: String,

    /// Version of this crate
    pub bridge: String,
}

#[derive(Default)]
pub(crate) struct WrapperRegistry {
    /// Host callable identity to its guest trampoline
    by_callable: HashMap<usize, RegistryKey>,

    /// Guest trampoline identity to the host callable it runs
    by_pointer: HashMap<usize, HostFunction>,
}

pub(crate) struct SandboxCore {
    pub(crate) id: Uuid,
    pub(crate) config: SandboxConfig,
    pub(crate) governor: Rc<Governor>,
    profiler: Rc<RefCell<Profiler>>,
    trace_slot: Rc<RefCell<Vec<StackFrame>>>,
    wrappers: RefCell<WrapperRegistry>,
    interpreter_version: String,
    internals: Internals,
    // Dropped last: everything above may hold references into it
    pub(crate) lua: Lua,
}

impl SandboxCore {
    fn new(config: SandboxConfig) -> Result<Rc<Self>> {
        config
            .validate()
            .map_err(|err| SandboxError::InvalidArgument(err.to_string()))?;

        let id = Uuid::new_v4();
        let lua = library::create_state();
        let interpreter_version: String = lua.globals().raw_get("_VERSION").map_err(guest_error)?;

        let allocations = AllocWatch::install(&lua).map_err(guest_error)?;
        let governor = Rc::new(Governor::new(id, allocations));
        let profiler = Rc::new(RefCell::new(Profiler::default()));
        let trace_slot = Rc::new(RefCell::new(Vec::new()));
        let internals =
            library::install(&lua, &config, Rc::clone(&governor), Rc::clone(&trace_slot)).map_err(guest_error)?;

        let hook_governor = Rc::clone(&governor);
        let hook_profiler = Rc::clone(&profiler);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(config.hook_interval),
            move |lua, debug| {
                hook_governor.note_memory(lua.used_memory());
                let ticks = hook_governor.take_profiler_ticks();
                if ticks > 0 {
                    hook_profiler.borrow_mut().record(function_id(&debug), ticks);
                }
                if let Some(record) = hook_governor.breach(|| capture_trace(lua, 0)) {
                    return Err(FatalSignal::raise(record));
                }
                Ok(VmState::Continue)
            },
        );

        let core = Rc::new(SandboxCore {
            id,
            config,
            governor,
            profiler,
            trace_slot,
            wrappers: RefCell::new(WrapperRegistry::default()),
            interpreter_version,
            internals,
            lua,
        });

        if core.config.memory_limit > 0 {
            core.set_memory_limit(core.config.memory_limit)?;
        }
        core.governor
            .set_cpu_limits(core.config.cpu_limit, core.config.emergency_cpu_limit)?;
        if let Some(period) = core.config.profiler_period {
            core.enable_profiler(period)?;
        }

        debug!(sandbox = %core.id, version = %core.interpreter_version, "sandbox created");
        Ok(core)
    }

    pub(crate) fn memory_usage(&self) -> usize {
        let used = self.lua.used_memory();
        self.governor.note_memory(used);
        used
    }

    pub(crate) fn note_memory(&self) {
        self.governor.note_memory(self.lua.used_memory());
    }

    fn set_memory_limit(&self, limit: usize) -> Result<()> {
        if limit > 0 {
            self.lua.gc_collect().map_err(guest_error)?;
            let used = self.lua.used_memory();
            if used > limit {
                return Err(SandboxError::InvalidArgument(format!(
                    "memory limit of {} bytes is below current usage of {} bytes",
                    limit, used
                )));
            }
        }
        self.lua.set_memory_limit(limit).map_err(guest_error)?;
        self.governor.set_memory_limit(limit);
        debug!(sandbox = %self.id, limit, "memory limit set");
        Ok(())
    }

    fn enable_profiler(&self, period: Duration) -> Result<bool> {
        if period.is_zero() {
            self.disable_profiler()?;
            return Ok(false);
        }
        self.profiler.borrow_mut().enable(period);
        self.governor.set_profiler_period(Some(period))?;
        Ok(true)
    }

    fn disable_profiler(&self) -> Result<()> {
        self.profiler.borrow_mut().disable();
        self.governor.set_profiler_period(None)
    }

    /// Credit pending profiler samples to the function named by `name`
    pub(crate) fn attribute_samples(&self, name: impl FnOnce() -> String) {
        let ticks = self.governor.take_profiler_ticks();
        if ticks > 0 {
            self.profiler.borrow_mut().record(name(), ticks);
        }
    }

    /// Run a guest function under the governor and convert its results. A
    /// breach of the window wins over whatever the guest returned.
    pub(crate) fn call_guest(self: &Rc<Self>, func: &Function, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let guard = self.governor.begin()?;
        let outcome = self.call_in_window(func, args);
        if let Err(SandboxError::Guest(record)) = &outcome {
            self.governor.note_breach(record.clone());
        }
        let breach = guard.finish();
        self.note_memory();

        match breach {
            Some(record) => {
                if record.kind == ErrorKind::Timeout || record.kind == ErrorKind::EmergencyTimeout {
                    debug!(sandbox = %self.id, kind = %record.kind, "guest call timed out");
                }
                Err(record.into())
            }
            None => outcome,
        }
    }

    fn call_in_window(self: &Rc<Self>, func: &Function, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let guest_args = Marshaller::new(self).to_guest_many(args)?;
        let results = self.protected_call(func, guest_args)?;
        Marshaller::new(self).to_host_many(results)
    }

    /// Call through the original `xpcall` so that any error value, not just
    /// strings, comes back intact along with the guest stack
    fn protected_call(&self, func: &Function, args: Vec<Value>) -> Result<Vec<Value>> {
        self.trace_slot.borrow_mut().clear();

        let mut call_args = Vec::with_capacity(args.len() + 2);
        call_args.push(Value::Function(func.clone()));
        call_args.push(Value::Function(self.internals.trace_handler.clone()));
        call_args.extend(args);

        let results: MultiValue = self
            .internals
            .raw_xpcall
            .call(MultiValue::from_vec(call_args))
            .map_err(guest_error)?;
        let mut results = results.into_iter();
        match results.next() {
            Some(Value::Boolean(true)) => Ok(results.collect()),
            _ => {
                let error = results.next().unwrap_or(Value::Nil);
                let trace = std::mem::take(&mut *self.trace_slot.borrow_mut());
                Err(record_from_value(error, trace).into())
            }
        }
    }

    /// Look up a global function by dotted path without running metamethods
    fn find_function(&self, name: &str) -> Result<Option<Function>> {
        let mut current = Value::Table(self.lua.globals());
        for part in name.split('.') {
            let Value::Table(table) = current else {
                return Ok(None);
            };
            current = table.raw_get(part).map_err(guest_error)?;
        }
        match current {
            Value::Function(func) => Ok(Some(func)),
            _ => Ok(None),
        }
    }

    pub(crate) fn call_global(self: &Rc<Self>, name: &str, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let func = self
            .find_function(name)?
            .ok_or_else(|| SandboxError::FunctionNotFound(name.to_string()))?;
        self.call_guest(&func, args)
    }

    /// Guest trampoline for a host callable; the same callable always gets
    /// the same trampoline
    pub(crate) fn wrap_host(self: &Rc<Self>, func: &HostFunction) -> mlua::Result<Function> {
        if let Some(key) = self.wrappers.borrow().by_callable.get(&func.identity()) {
            return self.lua.registry_value(key);
        }

        let weak = Rc::downgrade(self);
        let callable = func.clone();
        let dispatch = self.lua.create_function(move |lua, args: MultiValue| {
            let core = weak
                .upgrade()
                .ok_or_else(|| mlua::Error::runtime("the sandbox has been destroyed"))?;
            dispatch_host(&core, lua, &callable, args)
        })?;
        let trampoline: Function = self.internals.wrap_host.call(dispatch)?;

        let key = self.lua.create_registry_value(trampoline.clone())?;
        let mut wrappers = self.wrappers.borrow_mut();
        wrappers.by_callable.insert(func.identity(), key);
        wrappers
            .by_pointer
            .insert(trampoline.to_pointer() as usize, func.clone());
        Ok(trampoline)
    }

    pub(crate) fn host_function_at(&self, pointer: usize) -> Option<HostFunction> {
        self.wrappers.borrow().by_pointer.get(&pointer).cloned()
    }

    /// Reject functions whose upvalues would not survive a dump and reload
    pub(crate) fn check_upvalues(&self, func: &Function) -> Result<()> {
        let mut index = 1;
        loop {
            let (name, _): (Value, Value) = self
                .internals
                .getupvalue
                .call((func.clone(), index))
                .map_err(guest_error)?;
            let Value::String(name) = name else {
                return Ok(());
            };
            let name = name.to_string_lossy().to_string();
            if index != 1 || name != "_ENV" {
                return Err(SandboxError::NotSerializable(format!(
                    "function has upvalue '{}' that cannot be serialized",
                    name
                )));
            }
            index += 1;
        }
    }
}

impl Drop for SandboxCore {
    fn drop(&mut self) {
        debug!(sandbox = %self.id, "sandbox destroyed");
    }
}

/// A Lua interpreter running under resource limits.
///
/// Not `Send`: one sandbox serves one logical thread. Host callbacks may call
/// back into the sandbox; such nested calls share the outer call's budget.
pub struct LuaSandbox {
    core: Rc<SandboxCore>,
}

impl LuaSandbox {
    /// Sandbox with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(SandboxConfig::default())
    }

    pub fn with_config(config: SandboxConfig) -> Result<Self> {
        Ok(LuaSandbox {
            core: SandboxCore::new(config)?,
        })
    }

    /// Instance id, as used in log events
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.core.config
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo {
            interpreter: self.core.interpreter_version.clone(),
            bridge: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Compile (or, with `binary`, deserialize) a chunk without running it
    pub fn load(&self, code: &[u8], chunk_name: &str, binary: bool) -> Result<FunctionHandle> {
        if chunk_name.contains('\0') {
            return Err(SandboxError::InvalidArgument(
                "chunk name must not contain NUL bytes".to_string(),
            ));
        }
        let mode = if binary { ChunkMode::Binary } else { ChunkMode::Text };
        let loaded = self
            .core
            .lua
            .load(code)
            .set_name(chunk_name)
            .set_mode(mode)
            .into_function();
        self.core.note_memory();
        let func = loaded.map_err(guest_error)?;
        FunctionHandle::from_guest(&self.core, func).map_err(guest_error)
    }

    pub fn load_string(&self, code: impl AsRef<[u8]>, chunk_name: &str) -> Result<FunctionHandle> {
        self.load(code.as_ref(), chunk_name, false)
    }

    /// Load the output of [`FunctionHandle::serialize`]
    pub fn load_binary(&self, code: &[u8], chunk_name: &str) -> Result<FunctionHandle> {
        self.load(code, chunk_name, true)
    }

    /// Memory ceiling in bytes; 0 removes it. Fails if the interpreter already
    /// uses more than `bytes` after a full collection.
    pub fn set_memory_limit(&self, bytes: usize) -> Result<()> {
        self.core.set_memory_limit(bytes)
    }

    pub fn memory_usage(&self) -> usize {
        self.core.memory_usage()
    }

    pub fn peak_memory_usage(&self) -> usize {
        self.core.note_memory();
        self.core.governor.peak_memory()
    }

    /// Normal and emergency CPU limits. `None` or zero disables a limit.
    pub fn set_cpu_limit(&self, normal: Option<Duration>, emergency: Option<Duration>) -> Result<()> {
        self.core.governor.set_cpu_limits(normal, emergency)
    }

    pub fn cpu_usage(&self) -> Duration {
        self.core.governor.cpu_usage()
    }

    /// Stop charging CPU time to the guest. Only has an effect while a guest
    /// call is in flight, i.e. from a host callback.
    pub fn pause_usage_timer(&self) -> bool {
        self.core.governor.pause()
    }

    pub fn unpause_usage_timer(&self) -> bool {
        self.core.governor.unpause()
    }

    pub fn budget(&self) -> ResourceBudget {
        self.core.governor.budget(self.core.lua.used_memory())
    }

    pub fn governor_phase(&self) -> GovernorPhase {
        self.core.governor.phase()
    }

    /// Start sampling every `period`; a zero period disables the profiler.
    /// Returns whether the profiler is now running.
    pub fn enable_profiler(&self, period: Duration) -> Result<bool> {
        self.core.enable_profiler(period)
    }

    pub fn disable_profiler(&self) -> Result<()> {
        self.core.disable_profiler()
    }

    pub fn profiler_function_report(&self, units: ProfilerUnits) -> Vec<ProfileEntry> {
        self.core.profiler.borrow().report(units)
    }

    /// Call a global guest function; `name` may be a dotted path like `a.b.c`
    pub fn call_function(&self, name: &str, args: &[HostValue]) -> Result<Vec<HostValue>> {
        self.core.call_global(name, args)
    }

    /// Make a host callable available to guest code as a function value
    pub fn wrap_host_function(&self, func: HostFunction) -> Result<FunctionHandle> {
        let trampoline = self.core.wrap_host(&func).map_err(guest_error)?;
        FunctionHandle::from_guest(&self.core, trampoline).map_err(guest_error)
    }

    /// Install host callables as fields of the global table `name`, creating
    /// it if needed
    pub fn register_library<I, K>(&self, name: &str, functions: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, HostFunction)>,
        K: AsRef<str>,
    {
        let lua = &self.core.lua;
        let globals = lua.globals();
        let library: Table = match globals.raw_get::<Value>(name).map_err(guest_error)? {
            Value::Table(table) => table,
            _ => {
                let table = lua.create_table().map_err(guest_error)?;
                globals.raw_set(name, table.clone()).map_err(guest_error)?;
                table
            }
        };
        for (field, func) in functions {
            let trampoline = self.core.wrap_host(&func).map_err(guest_error)?;
            library
                .raw_set(field.as_ref(), trampoline)
                .map_err(guest_error)?;
        }
        Ok(())
    }

    /// Convert a host value into the guest domain
    pub fn to_guest(&self, value: &HostValue) -> Result<GuestValue> {
        Marshaller::new(&self.core).to_guest(value)
    }

    /// Convert a guest value into the host domain. Iteration metamethods run
    /// under the CPU limits.
    pub fn to_host(&self, value: GuestValue) -> Result<HostValue> {
        let guard = self.core.governor.begin()?;
        let converted = Marshaller::new(&self.core).to_host(value);
        match guard.finish() {
            Some(record) => Err(record.into()),
            None => converted,
        }
    }
}

impl std::fmt::Debug for LuaSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaSandbox")
            .field("id", &self.core.id)
            .field("phase", &self.core.governor.phase())
            .finish()
    }
}
