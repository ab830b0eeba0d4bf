//! Guest environment
//!
//! Builds the interpreter state the guest sees: a reduced standard library,
//! `pcall`/`xpcall` that cannot intercept non-catchable errors, a `tostring`
//! that does not leak heap addresses, per-sandbox seeded random numbers, an
//! `os.clock` driven by the governor, and finally the global whitelist.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::error::{capture_trace, fatal_kind_of_value, record_from_value, FatalSignal, StackFrame, INTERNAL_CHUNK_NAME};
use super::governor::Governor;
use crate::config::SandboxConfig;

/// Globals a guest can see unless configured otherwise
pub const DEFAULT_ALLOWED_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "_G",
    "_VERSION",
    "math",
    "os",
    "string",
    "table",
    "debug",
    "utf8",
];

/// Lua glue installed before any guest code runs. Receives the original
/// functions it wraps; the guest never gets to see those.
const BOOTSTRAP: &str = r#"
local raw_pcall, raw_xpcall, check_fatal, raw_tostring, raw_getmetatable = ...
local error, type, rawget = error, type, rawget

-- check_fatal returns the error to re-raise when the window has a breach or
-- the error itself may not be caught, and nil otherwise
local function rethrow(ok, ...)
    local fatal
    if ok then
        fatal = check_fatal(nil)
    else
        fatal = check_fatal((...))
    end
    if fatal ~= nil then
        error(fatal, 0)
    end
    return ok, ...
end

local function pcall(f, ...)
    return rethrow(raw_pcall(f, ...))
end

local function xpcall(f, handler, ...)
    if type(handler) ~= "function" then
        error("bad argument #2 to 'xpcall' (function expected)", 2)
    end
    return rethrow(raw_xpcall(f, function(e)
        local fatal = check_fatal(e)
        if fatal ~= nil then
            return fatal
        end
        return handler(e)
    end, ...))
end

local function tostring(v)
    local t = type(v)
    if t == "string" or t == "number" or t == "boolean" or t == "nil" then
        return raw_tostring(v)
    end
    local mt = raw_getmetatable(v)
    if type(mt) == "table" and rawget(mt, "__tostring") ~= nil then
        return raw_tostring(v)
    end
    return t
end

local function unwrap(ok, ...)
    if ok then
        return ...
    end
    error((...), 0)
end

local function wrap_host(dispatch)
    return function(...)
        return unwrap(dispatch(...))
    end
end

return pcall, xpcall, tostring, wrap_host
"#;

/// Functions the sandbox keeps for itself
pub(crate) struct Internals {
    /// Original `xpcall`, used for host-initiated calls
    pub raw_xpcall: Function,

    /// Message handler that records the guest stack
    pub trace_handler: Function,

    /// Original `debug.getupvalue`, used to vet functions before dumping
    pub getupvalue: Function,

    /// Turns a `(ok, ...)` dispatcher into a guest function raising string errors
    pub wrap_host: Function,
}

/// Fresh interpreter with the libraries the guest may use
pub(crate) fn create_state() -> Lua {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::OS | StdLib::DEBUG | StdLib::UTF8;
    // SAFETY: the debug library is loaded only to keep `getupvalue` and
    // `getmetatable` for internal use; `install` removes it from the guest's
    // view except for `debug.traceback`.
    unsafe { Lua::unsafe_new_with(libs, LuaOptions::new()) }
}

/// Prepare the guest environment
pub(crate) fn install(
    lua: &Lua,
    config: &SandboxConfig,
    governor: Rc<Governor>,
    trace_slot: Rc<RefCell<Vec<StackFrame>>>,
) -> mlua::Result<Internals> {
    let globals = lua.globals();
    let raw_pcall: Function = globals.raw_get("pcall")?;
    let raw_xpcall: Function = globals.raw_get("xpcall")?;
    let raw_tostring: Function = globals.raw_get("tostring")?;
    let debug: Table = globals.raw_get("debug")?;
    let getupvalue: Function = debug.raw_get("getupvalue")?;
    let raw_getmetatable: Function = debug.raw_get("getmetatable")?;

    let fatal_governor = Rc::clone(&governor);
    let check_fatal = lua.create_function(move |lua, error: Value| {
        if let Some(record) = fatal_governor.breach(|| capture_trace(lua, 1)) {
            return Ok(Value::Error(Box::new(FatalSignal::raise(record))));
        }
        if fatal_kind_of_value(&error).is_none() {
            return Ok(Value::Nil);
        }
        fatal_governor.note_breach(record_from_value(error.clone(), capture_trace(lua, 1)));
        Ok(error)
    })?;
    let (pcall, xpcall, tostring, wrap_host): (Function, Function, Function, Function) = lua
        .load(BOOTSTRAP)
        .set_name(INTERNAL_CHUNK_NAME)
        .call((raw_pcall, raw_xpcall.clone(), check_fatal, raw_tostring, raw_getmetatable))?;

    let slot = Rc::clone(&trace_slot);
    let trace_handler = lua.create_function(move |lua, error: Value| {
        *slot.borrow_mut() = capture_trace(lua, 1);
        Ok(error)
    })?;

    keep_only(&debug, &["traceback"])?;

    if let Some(string) = globals.raw_get::<Option<Table>>("string")? {
        string.raw_set("dump", Value::Nil)?;
    }

    if let Some(os) = globals.raw_get::<Option<Table>>("os")? {
        keep_only(&os, &["date", "difftime", "time"])?;
        let clock_governor = Rc::clone(&governor);
        let clock = host_library_function(lua, &wrap_host, move |_, _| {
            let seconds = clock_governor.cpu_usage().as_secs_f64();
            Ok(vec![Value::Number((seconds * 50_000.0).round() / 50_000.0)])
        })?;
        os.raw_set("clock", clock)?;
    }

    if let Some(math) = globals.raw_get::<Option<Table>>("math")? {
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(config.random_seed)));
        let random_rng = Rc::clone(&rng);
        let random = host_library_function(lua, &wrap_host, move |lua, args| {
            math_random(lua, &mut random_rng.borrow_mut(), args)
        })?;
        let randomseed = host_library_function(lua, &wrap_host, move |lua, args| {
            math_randomseed(lua, &mut rng.borrow_mut(), args)
        })?;
        math.raw_set("random", random)?;
        math.raw_set("randomseed", randomseed)?;
    }

    globals.raw_set("pcall", pcall)?;
    globals.raw_set("xpcall", xpcall)?;
    globals.raw_set("tostring", tostring)?;

    apply_whitelist(&globals, &config.allowed_globals)?;

    Ok(Internals {
        raw_xpcall,
        trace_handler,
        getupvalue,
        wrap_host,
    })
}

/// Remove every field of `table` not named in `keep`
fn keep_only(table: &Table, keep: &[&str]) -> mlua::Result<()> {
    let mut doomed = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, _) = pair?;
        let kept = match &key {
            Value::String(name) => name.to_str().map_or(false, |name| keep.contains(&&*name)),
            _ => false,
        };
        if !kept {
            doomed.push(key);
        }
    }
    for key in doomed {
        table.raw_set(key, Value::Nil)?;
    }
    Ok(())
}

fn apply_whitelist(globals: &Table, allowed: &BTreeSet<String>) -> mlua::Result<()> {
    let mut doomed = Vec::new();
    for pair in globals.pairs::<Value, Value>() {
        let (key, _) = pair?;
        let kept = match &key {
            Value::String(name) => name.to_str().map_or(false, |name| allowed.contains(&*name)),
            _ => false,
        };
        if !kept {
            doomed.push(key);
        }
    }
    for key in doomed {
        globals.raw_set(key, Value::Nil)?;
    }
    Ok(())
}

/// Library function implemented in Rust whose failures reach the guest as
/// plain string errors, like the built-in library's do
fn host_library_function<F>(lua: &Lua, wrap_host: &Function, func: F) -> mlua::Result<Function>
where
    F: Fn(&Lua, MultiValue) -> Result<Vec<Value>, String> + 'static,
{
    let dispatch = lua.create_function(move |lua, args: MultiValue| {
        let mut out = Vec::new();
        match func(lua, args) {
            Ok(values) => {
                out.push(Value::Boolean(true));
                out.extend(values);
            }
            Err(message) => {
                out.push(Value::Boolean(false));
                out.push(Value::String(lua.create_string(&message)?));
            }
        }
        Ok(MultiValue::from_vec(out))
    })?;
    wrap_host.call(dispatch)
}

fn integer_arg(lua: &Lua, value: &Value, position: usize, function: &str) -> Result<i64, String> {
    if let Ok(Some(n)) = lua.coerce_integer(value.clone()) {
        return Ok(n);
    }
    let problem = match lua.coerce_number(value.clone()) {
        Ok(Some(_)) => "number has no integer representation".to_string(),
        _ => format!("number expected, got {}", value.type_name()),
    };
    Err(format!("bad argument #{} to '{}' ({})", position, function, problem))
}

fn math_random(lua: &Lua, rng: &mut StdRng, args: MultiValue) -> Result<Vec<Value>, String> {
    let args: Vec<Value> = args.into_iter().collect();
    let value = match args.len() {
        0 => Value::Number(rng.gen::<f64>()),
        1 => {
            let high = integer_arg(lua, &args[0], 1, "random")?;
            if high == 0 {
                Value::Integer(rng.gen::<i64>())
            } else if high < 1 {
                return Err("bad argument #1 to 'random' (interval is empty)".to_string());
            } else {
                Value::Integer(rng.gen_range(1..=high))
            }
        }
        2 => {
            let low = integer_arg(lua, &args[0], 1, "random")?;
            let high = integer_arg(lua, &args[1], 2, "random")?;
            if low > high {
                return Err("bad argument #2 to 'random' (interval is empty)".to_string());
            }
            Value::Integer(rng.gen_range(low..=high))
        }
        _ => return Err("wrong number of arguments".to_string()),
    };
    Ok(vec![value])
}

fn math_randomseed(lua: &Lua, rng: &mut StdRng, args: MultiValue) -> Result<Vec<Value>, String> {
    let seed = match args.into_iter().next() {
        None | Some(Value::Nil) => None,
        Some(value) => match lua.coerce_integer(value.clone()) {
            Ok(Some(n)) => Some(n as u64),
            _ => match lua.coerce_number(value.clone()) {
                Ok(Some(x)) => Some(x.to_bits()),
                _ => {
                    return Err(format!(
                        "bad argument #1 to 'randomseed' (number expected, got {})",
                        value.type_name()
                    ))
                }
            },
        },
    };
    *rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Ok(Vec::new())
}
