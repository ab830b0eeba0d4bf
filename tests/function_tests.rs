//! Host functions in the guest, guest functions in the host

use std::cell::Cell;
use std::rc::Rc;

use luasandbox::lua::{ErrorKind, FunctionOrigin, HostFunction, HostValue, LuaSandbox};
use luasandbox::{CallbackError, SandboxError};

fn adder() -> HostFunction {
    HostFunction::new("add", |_, args| {
        let sum = args.iter().filter_map(HostValue::as_int).sum::<i64>();
        Ok(vec![HostValue::Int(sum)])
    })
}

fn eval(sandbox: &LuaSandbox, code: &str) -> Result<Vec<HostValue>, SandboxError> {
    sandbox.load_string(code, "=test")?.call(&[])
}

#[test]
fn test_register_library() {
    let sandbox = LuaSandbox::new().unwrap();
    sandbox
        .register_library(
            "host",
            [
                ("add", adder()),
                (
                    "pair",
                    HostFunction::new("pair", |_, _| Ok(vec![HostValue::from("a"), HostValue::from("b")])),
                ),
            ],
        )
        .unwrap();

    assert_eq!(eval(&sandbox, "return host.add(1, 2, 3)").unwrap(), vec![HostValue::Int(6)]);
    assert_eq!(
        eval(&sandbox, "return select('#', host.pair())").unwrap(),
        vec![HostValue::Int(2)]
    );
}

#[test]
fn test_host_runtime_errors_are_catchable() {
    let sandbox = LuaSandbox::new().unwrap();
    sandbox
        .register_library(
            "host",
            [("fail", HostFunction::new("fail", |_, _| Err(CallbackError::runtime("nope"))))],
        )
        .unwrap();

    let values = eval(&sandbox, "return pcall(host.fail)").unwrap();
    assert_eq!(values, vec![HostValue::Bool(false), HostValue::from("nope")]);

    let err = eval(&sandbox, "host.fail()").unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Runtime));
    assert_eq!(err.record().unwrap().message, "nope");
}

#[test]
fn test_host_faults_are_fatal() {
    let sandbox = LuaSandbox::new().unwrap();
    sandbox
        .register_library(
            "host",
            [
                ("fault", HostFunction::new("fault", |_, _| Err(CallbackError::fault("disk on fire")))),
                ("panic", HostFunction::new("panic", |_, _| panic!("unreachable state"))),
            ],
        )
        .unwrap();

    let err = eval(&sandbox, "return pcall(host.fault)").unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Fatal));
    assert!(err.to_string().contains("disk on fire"));

    let err = eval(&sandbox, "return pcall(host.panic)").unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Fatal));
    assert!(err.to_string().contains("unreachable state"));

    // The sandbox stays usable
    assert_eq!(eval(&sandbox, "return 1").unwrap(), vec![HostValue::Int(1)]);
}

#[test]
fn test_guest_function_handles() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, "return function(a, b) return b, a end").unwrap();
    let swap = values[0].as_function().unwrap();

    assert_eq!(swap.origin(), &FunctionOrigin::Guest);
    assert_eq!(swap.sandbox_id(), sandbox.id());
    assert_eq!(
        swap.call(&[HostValue::Int(1), HostValue::Int(2)]).unwrap(),
        vec![HostValue::Int(2), HostValue::Int(1)]
    );
}

#[test]
fn test_host_function_identity_is_stable() {
    let sandbox = LuaSandbox::new().unwrap();
    let add = adder();
    let first = sandbox.wrap_host_function(add.clone()).unwrap();
    let second = sandbox.wrap_host_function(add.clone()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.origin(), &FunctionOrigin::Host("add".to_string()));

    let identity = sandbox.load_string("return ...", "=identity").unwrap();
    let values = identity.call(&[HostValue::Callable(add)]).unwrap();
    assert_eq!(values[0].as_function(), Some(&first));

    // Calling the handle runs the host function
    assert_eq!(first.call(&[HostValue::Int(2), HostValue::Int(3)]).unwrap(), vec![HostValue::Int(5)]);
}

#[test]
fn test_guest_function_identity_is_stable() {
    let sandbox = LuaSandbox::new().unwrap();
    eval(&sandbox, "local function f() return 1 end function get() return f end").unwrap();

    let first = sandbox.call_function("get", &[]).unwrap();
    let second = sandbox.call_function("get", &[]).unwrap();
    assert!(first[0].as_function().is_some());
    assert_eq!(first[0].as_function(), second[0].as_function());

    let other = eval(&sandbox, "return function() return 1 end").unwrap();
    assert_ne!(first[0].as_function(), other[0].as_function());
}

#[test]
fn test_callback_reenters_sandbox() {
    let sandbox = LuaSandbox::new().unwrap();
    sandbox
        .register_library(
            "host",
            [(
                "twice",
                HostFunction::new("twice", |ctx, args| {
                    let once = ctx.call_function("double", args)?;
                    Ok(ctx.call_function("double", &once)?)
                }),
            )],
        )
        .unwrap();

    eval(&sandbox, "function double(x) return x * 2 end").unwrap();
    assert_eq!(
        sandbox.call_function("host.twice", &[HostValue::Int(5)]).unwrap(),
        vec![HostValue::Int(20)]
    );
}

#[test]
fn test_callback_receives_guest_functions() {
    let sandbox = LuaSandbox::new().unwrap();
    let seen = Rc::new(Cell::new(0));
    let counter = Rc::clone(&seen);
    sandbox
        .register_library(
            "host",
            [(
                "apply",
                HostFunction::new("apply", move |_, args| {
                    counter.set(counter.get() + 1);
                    let func = args[0]
                        .as_function()
                        .ok_or_else(|| CallbackError::runtime("function expected"))?;
                    Ok(func.call(&args[1..])?)
                }),
            )],
        )
        .unwrap();

    let values = eval(&sandbox, "return host.apply(function(x) return x .. '!' end, 'hey')").unwrap();
    assert_eq!(values, vec![HostValue::from("hey!")]);
    assert_eq!(seen.get(), 1);

    let values = eval(&sandbox, "return pcall(host.apply, 42)").unwrap();
    assert_eq!(values, vec![HostValue::Bool(false), HostValue::from("function expected")]);
}

#[test]
fn test_serialize_and_reload() {
    let sandbox = LuaSandbox::new().unwrap();
    let double = sandbox.load_string("local x = ... return x * 2", "=double").unwrap();

    let bytes = double.serialize().unwrap();
    assert_eq!(bytes, double.dump().unwrap());

    let other = LuaSandbox::new().unwrap();
    let reloaded = other.load_binary(&bytes, "=double").unwrap();
    assert_eq!(reloaded.call(&[HostValue::Int(21)]).unwrap(), vec![HostValue::Int(42)]);
}

#[test]
fn test_serialize_rejections() {
    let sandbox = LuaSandbox::new().unwrap();

    let values = eval(&sandbox, "local n = 1 return function() return n end").unwrap();
    let closure = values[0].as_function().unwrap();
    assert!(matches!(closure.serialize(), Err(SandboxError::NotSerializable(_))));

    let values = eval(&sandbox, "return function() return string.len('abc') end").unwrap();
    assert!(values[0].as_function().unwrap().serialize().is_ok());

    let wrapped = sandbox.wrap_host_function(adder()).unwrap();
    assert!(matches!(wrapped.serialize(), Err(SandboxError::NotSerializable(_))));

    let values = eval(&sandbox, "return select").unwrap();
    assert!(matches!(
        values[0].as_function().unwrap().serialize(),
        Err(SandboxError::NotSerializable(_))
    ));
}

#[test]
fn test_handles_outliving_sandbox() {
    let sandbox = LuaSandbox::new().unwrap();
    let func = sandbox.load_string("return 1", "=one").unwrap();
    drop(sandbox);
    assert!(matches!(func.call(&[]), Err(SandboxError::Destroyed)));
}

#[test]
fn test_foreign_handles_are_rejected() {
    let first = LuaSandbox::new().unwrap();
    let second = LuaSandbox::new().unwrap();
    let func = first.load_string("return 1", "=one").unwrap();
    let identity = second.load_string("return ...", "=identity").unwrap();
    assert!(identity.call(&[HostValue::Function(func)]).is_err());
}
