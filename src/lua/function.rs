//! Function bridge
//!
//! Host callables become guest functions through a trampoline; guest
//! functions reach the host as [`FunctionHandle`]s.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

use mlua::{Function, Lua, MultiValue, RegistryKey, Value};
use tracing::warn;
use uuid::Uuid;

use super::convert::Marshaller;
use super::error::{capture_trace, fatal_record, ErrorKind, ErrorRecord, FatalSignal};
use super::sandbox::{guest_error, SandboxCore};
use super::value::HostValue;
use crate::error::{CallbackError, MarshalError, SandboxError};

type Callback = dyn Fn(&CallContext<'_>, &[HostValue]) -> Result<Vec<HostValue>, CallbackError>;

/// A host callable that guest code can invoke
#[derive(Clone)]
pub struct HostFunction {
    name: Rc<str>,
    callback: Rc<Callback>,
}

impl HostFunction {
    /// Wrap a closure. `name` shows up in error messages and profiler reports.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&CallContext<'_>, &[HostValue]) -> Result<Vec<HostValue>, CallbackError> + 'static,
    {
        HostFunction {
            name: Rc::from(name.into()),
            callback: Rc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.callback) as *const () as usize
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostFunction").field(&self.name).finish()
    }
}

/// What a host callable can do with the sandbox that invoked it
pub struct CallContext<'a> {
    core: &'a Rc<SandboxCore>,
    function: &'a str,
}

impl CallContext<'_> {
    /// Name the callable was registered under
    pub fn function_name(&self) -> &str {
        self.function
    }

    /// Stop charging CPU time to the guest until `unpause_usage_timer` or
    /// until control returns to guest code
    pub fn pause_usage_timer(&self) -> bool {
        self.core.governor.pause()
    }

    pub fn unpause_usage_timer(&self) -> bool {
        self.core.governor.unpause()
    }

    pub fn cpu_usage(&self) -> Duration {
        self.core.governor.cpu_usage()
    }

    pub fn memory_usage(&self) -> usize {
        self.core.memory_usage()
    }

    /// Call a guest global (dotted names allowed) within the current budget
    pub fn call_function(&self, name: &str, args: &[HostValue]) -> Result<Vec<HostValue>, SandboxError> {
        self.core.call_global(name, args)
    }
}

/// Where a function handle's function came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionOrigin {
    /// Defined by guest code
    Guest,

    /// Trampoline around the named host callable
    Host(String),
}

/// Host-side handle to a function living in a sandbox
#[derive(Clone)]
pub struct FunctionHandle {
    inner: Rc<HandleInner>,
}

struct HandleInner {
    sandbox: Weak<SandboxCore>,
    sandbox_id: Uuid,
    key: RegistryKey,
    /// Interpreter identity of the function
    pointer: usize,
    origin: FunctionOrigin,
}

impl FunctionHandle {
    pub(crate) fn from_guest(core: &Rc<SandboxCore>, func: Function) -> mlua::Result<Self> {
        let pointer = func.to_pointer() as usize;
        let origin = match core.host_function_at(pointer) {
            Some(host) => FunctionOrigin::Host(host.name().to_string()),
            None => FunctionOrigin::Guest,
        };
        let key = core.lua.create_registry_value(func)?;
        Ok(FunctionHandle {
            inner: Rc::new(HandleInner {
                sandbox: Rc::downgrade(core),
                sandbox_id: core.id,
                key,
                pointer,
                origin,
            }),
        })
    }

    /// The function itself, provided `core` is the sandbox that owns it
    pub(crate) fn function(&self, core: &SandboxCore) -> Result<Function, SandboxError> {
        if core.id != self.inner.sandbox_id {
            return Err(MarshalError::Unsupported("function belonging to another sandbox".to_string()).into());
        }
        core.lua.registry_value(&self.inner.key).map_err(guest_error)
    }

    fn core(&self) -> Result<Rc<SandboxCore>, SandboxError> {
        self.inner.sandbox.upgrade().ok_or(SandboxError::Destroyed)
    }

    /// Call the function under the owning sandbox's limits
    pub fn call(&self, args: &[HostValue]) -> Result<Vec<HostValue>, SandboxError> {
        let core = self.core()?;
        let func = self.function(&core)?;
        core.call_guest(&func, args)
    }

    /// Precompiled form of the function, loadable with `LuaSandbox::load_binary`.
    ///
    /// Fails for wrapped host callables, native functions, and functions with
    /// upvalues other than the global environment in first position.
    pub fn serialize(&self) -> Result<Vec<u8>, SandboxError> {
        if let FunctionOrigin::Host(name) = &self.inner.origin {
            return Err(SandboxError::NotSerializable(format!("'{}' wraps a host function", name)));
        }
        let core = self.core()?;
        let func = self.function(&core)?;
        if func.info().what == "C" {
            return Err(SandboxError::NotSerializable("native function".to_string()));
        }
        core.check_upvalues(&func)?;
        Ok(func.dump(false))
    }

    /// Same as [`FunctionHandle::serialize`]
    pub fn dump(&self) -> Result<Vec<u8>, SandboxError> {
        self.serialize()
    }

    pub fn origin(&self) -> &FunctionOrigin {
        &self.inner.origin
    }

    pub fn is_host(&self) -> bool {
        matches!(self.inner.origin, FunctionOrigin::Host(_))
    }

    /// Id of the sandbox that owns the function
    pub fn sandbox_id(&self) -> Uuid {
        self.inner.sandbox_id
    }
}

impl PartialEq for FunctionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.sandbox_id == other.inner.sandbox_id && self.inner.pointer == other.inner.pointer
    }
}

impl Eq for FunctionHandle {}

impl Hash for FunctionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.sandbox_id.hash(state);
        self.inner.pointer.hash(state);
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("sandbox", &self.inner.sandbox_id)
            .field("pointer", &format_args!("{:#x}", self.inner.pointer))
            .field("origin", &self.inner.origin)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn success(values: Vec<Value>) -> MultiValue {
    let mut out = Vec::with_capacity(values.len() + 1);
    out.push(Value::Boolean(true));
    out.extend(values);
    MultiValue::from_vec(out)
}

fn runtime_failure(lua: &Lua, message: &str) -> mlua::Result<MultiValue> {
    Ok(MultiValue::from_vec(vec![
        Value::Boolean(false),
        Value::String(lua.create_string(message)?),
    ]))
}

/// Trampoline body. Returns `(true, results...)`, or `(false, message)` for
/// errors the guest may catch; non-catchable failures are raised directly.
pub(crate) fn dispatch_host(
    core: &Rc<SandboxCore>,
    lua: &Lua,
    func: &HostFunction,
    args: MultiValue,
) -> mlua::Result<MultiValue> {
    if let Some(record) = core.governor.breach(|| capture_trace(lua, 1)) {
        return Err(FatalSignal::raise(record));
    }
    core.note_memory();
    core.attribute_samples(|| {
        // Level 1 is the trampoline's own glue; level 2 is the guest caller
        lua.inspect_stack(2)
            .map(|debug| super::profiler::function_id(&debug))
            .unwrap_or_else(|| "?".to_string())
    });

    let host_args = match Marshaller::new(core).to_host_many(args) {
        Ok(values) => values,
        Err(SandboxError::Guest(record)) if record.kind.is_fatal() => {
            core.governor.note_breach(record.clone());
            return Err(FatalSignal::raise(record));
        }
        Err(err) => return runtime_failure(lua, &format!("bad argument to '{}': {}", func.name(), err)),
    };

    let ctx = CallContext {
        core,
        function: func.name(),
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (func.callback)(&ctx, &host_args)));
    core.governor.unpause();
    core.attribute_samples(|| func.name().to_string());
    core.note_memory();

    let result = match outcome {
        Ok(Ok(values)) => match Marshaller::new(core).to_guest_many(&values) {
            Ok(values) => Ok(success(values)),
            Err(SandboxError::Guest(record)) if record.kind.is_fatal() => Err(FatalSignal::raise(record)),
            Err(err) => runtime_failure(lua, &format!("cannot return value from '{}': {}", func.name(), err)),
        },
        Ok(Err(CallbackError::Runtime(message))) => runtime_failure(lua, &message),
        Ok(Err(CallbackError::Fault(message))) => {
            warn!(sandbox = %core.id, function = func.name(), %message, "host function fault");
            let record = ErrorRecord::new(ErrorKind::Fatal, format!("{}: {}", func.name(), message))
                .with_trace(capture_trace(lua, 1));
            Err(FatalSignal::raise(record))
        }
        Ok(Err(CallbackError::Sandbox(SandboxError::Guest(record)))) if record.kind.is_fatal() => {
            Err(FatalSignal::raise(record))
        }
        Ok(Err(CallbackError::Sandbox(err))) => runtime_failure(lua, &err.to_string()),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(sandbox = %core.id, function = func.name(), %message, "host function panicked");
            let record = ErrorRecord::new(
                ErrorKind::Fatal,
                format!("host function '{}' panicked: {}", func.name(), message),
            )
            .with_trace(capture_trace(lua, 1));
            Err(FatalSignal::raise(record))
        }
    };

    if let Err(err) = &result {
        if let Some(record) = fatal_record(err) {
            core.governor.note_breach(record.clone());
        }
    }
    if let Some(record) = core.governor.breach(|| capture_trace(lua, 1)) {
        return Err(FatalSignal::raise(record));
    }
    result
}
