//! Loading, calling and the guest environment

use luasandbox::lua::{ErrorKind, FrameKind, HostValue, LuaSandbox};
use luasandbox::{SandboxConfig, SandboxError};

fn eval(sandbox: &LuaSandbox, code: &str) -> Result<Vec<HostValue>, SandboxError> {
    sandbox.load_string(code, "=test")?.call(&[])
}

#[test]
fn test_load_and_call() {
    let sandbox = LuaSandbox::new().unwrap();
    let chunk = sandbox.load_string("local a, b = ... return a + b, a .. b", "=sum").unwrap();
    assert_eq!(
        chunk.call(&[HostValue::Int(1), HostValue::Int(2)]).unwrap(),
        vec![HostValue::Int(3), HostValue::from("12")]
    );
}

#[test]
fn test_syntax_errors() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = sandbox.load_string("return +", "=broken").unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Syntax));
    assert!(err.to_string().contains("broken:1:"));

    // Text is not a valid binary chunk
    let err = sandbox.load_binary(b"return 1", "=text").unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Syntax));
}

#[test]
fn test_chunk_name_with_nul_is_rejected() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = sandbox.load_string("return 1", "bad\0name").unwrap_err();
    assert!(matches!(err, SandboxError::InvalidArgument(_)));
}

#[test]
fn test_runtime_error_record() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = eval(
        &sandbox,
        r#"
        local function inner() error("boom") end
        local function outer() inner() end
        outer()
        "#,
    )
    .unwrap_err();

    let record = err.record().unwrap();
    assert_eq!(record.kind, ErrorKind::Runtime);
    assert!(record.is_catchable());
    assert_eq!(record.message, "test:2: boom");
    assert!(record.trace.iter().any(|frame| frame.function.as_deref() == Some("inner")));
    assert!(record.trace.iter().any(|frame| frame.kind == FrameKind::Main));
    assert!(record.traceback().starts_with("stack traceback:"));
}

#[test]
fn test_non_string_errors() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = eval(&sandbox, "error(42)").unwrap_err();
    assert_eq!(err.record().unwrap().message, "42");

    let values = eval(&sandbox, "return pcall(error, {code = 7})").unwrap();
    assert_eq!(values[0], HostValue::Bool(false));
    assert!(values[1].as_array().is_some());
}

#[test]
fn test_error_in_error_handler() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = eval(
        &sandbox,
        "return xpcall(function() error('a') end, function() error('b') end)",
    )
    .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ErrorInError));
}

#[test]
fn test_call_function() {
    let sandbox = LuaSandbox::new().unwrap();
    eval(
        &sandbox,
        "function greet(name) return 'hi ' .. name end lib = {inner = {answer = function() return 42 end}}",
    )
    .unwrap();

    assert_eq!(
        sandbox.call_function("greet", &[HostValue::from("bob")]).unwrap(),
        vec![HostValue::from("hi bob")]
    );
    assert_eq!(sandbox.call_function("lib.inner.answer", &[]).unwrap(), vec![HostValue::Int(42)]);

    for missing in ["nope", "lib.nope", "greet.field", "lib.inner"] {
        assert!(
            matches!(sandbox.call_function(missing, &[]), Err(SandboxError::FunctionNotFound(_))),
            "{}",
            missing
        );
    }
}

#[test]
fn test_hidden_globals() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(
        &sandbox,
        "return load, loadstring, dofile, require, io, collectgarbage, string.dump, os.execute, os.getenv, debug.getinfo",
    )
    .unwrap();
    assert_eq!(values.len(), 10);
    assert!(values.iter().all(HostValue::is_null), "{:?}", values);

    let values = eval(&sandbox, "return type(os.time), type(debug.traceback), type(string.format)").unwrap();
    assert_eq!(
        values,
        vec![HostValue::from("function"), HostValue::from("function"), HostValue::from("function")]
    );
}

#[test]
fn test_global_whitelist_is_configurable() {
    let mut config = SandboxConfig::default();
    config.allowed_globals.remove("os");
    let sandbox = LuaSandbox::with_config(config).unwrap();
    assert_eq!(eval(&sandbox, "return os").unwrap(), vec![HostValue::Null]);
}

#[test]
fn test_tostring_hides_addresses() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(
        &sandbox,
        r#"return tostring({}), tostring(print or tostring), tostring(12), tostring(setmetatable({}, {__tostring = function() return 'custom' end}))"#,
    )
    .unwrap();
    assert_eq!(
        values,
        vec![
            HostValue::from("table"),
            HostValue::from("function"),
            HostValue::from("12"),
            HostValue::from("custom"),
        ]
    );
}

#[test]
fn test_random_is_seeded_per_sandbox() {
    let config = SandboxConfig {
        random_seed: 1234,
        ..SandboxConfig::default()
    };
    let code = "local t = {} for i = 1, 5 do t[i] = math.random(1, 1000000) end return t";
    let first = eval(&LuaSandbox::with_config(config.clone()).unwrap(), code).unwrap();
    let second = eval(&LuaSandbox::with_config(config).unwrap(), code).unwrap();
    assert_eq!(first, second);

    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, "math.randomseed(9) local a = math.random() math.randomseed(9) return a == math.random(), math.random(3)").unwrap();
    assert_eq!(values[0], HostValue::Bool(true));
    assert!(matches!(values[1], HostValue::Int(n) if (1..=3).contains(&n)));

    let err = eval(&sandbox, "return math.random(5, 1)").unwrap_err();
    assert!(err.to_string().contains("interval is empty"));
}

#[test]
fn test_version_info() {
    let sandbox = LuaSandbox::new().unwrap();
    let info = sandbox.version_info();
    assert_eq!(info.interpreter, "Lua 5.4");
    assert_eq!(info.bridge, env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_sandboxes_are_isolated() {
    let first = LuaSandbox::new().unwrap();
    let second = LuaSandbox::new().unwrap();
    eval(&first, "shared = 1").unwrap();
    assert_eq!(eval(&second, "return shared").unwrap(), vec![HostValue::Null]);
    assert_ne!(first.id(), second.id());
}
