//! Value conversion between host and guest

use luasandbox::lua::{ArrayKey, GuestValue, HostArray, HostValue, LuaSandbox};
use luasandbox::{MarshalError, SandboxError};

fn eval(sandbox: &LuaSandbox, code: &str) -> Result<Vec<HostValue>, SandboxError> {
    sandbox.load_string(code, "=test")?.call(&[])
}

#[test]
fn test_scalars() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, "return nil, true, 42, 'hi', 0.5").unwrap();
    assert_eq!(
        values,
        vec![
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Int(42),
            HostValue::from("hi"),
            HostValue::Float(0.5),
        ]
    );
}

#[test]
fn test_no_results() {
    let sandbox = LuaSandbox::new().unwrap();
    assert!(eval(&sandbox, "local x = 1").unwrap().is_empty());
}

#[test]
fn test_integral_floats_become_integers() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, "return 3.0, 2^53, 2^63, 1/0, -1/0, 0/0").unwrap();
    assert_eq!(values[0], HostValue::Int(3));
    assert_eq!(values[1], HostValue::Int(1 << 53));
    assert_eq!(values[2], HostValue::Float(2f64.powi(63)));
    assert_eq!(values[3], HostValue::Float(f64::INFINITY));
    assert_eq!(values[4], HostValue::Float(f64::NEG_INFINITY));
    assert!(matches!(values[5], HostValue::Float(x) if x.is_nan()));
}

#[test]
fn test_strings_are_bytes() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, r#"return "\0\255abc""#).unwrap();
    assert_eq!(values[0].as_bytes(), Some(&b"\x00\xffabc"[..]));

    let func = sandbox.load_string("return #(...)", "=len").unwrap();
    let values = func.call(&[HostValue::from(&b"\xfe\x00"[..])]).unwrap();
    assert_eq!(values, vec![HostValue::Int(2)]);
}

#[test]
fn test_table_to_array() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, "return {10, 20, name = 'x', [1.5] = true, ['7'] = 'seven'}").unwrap();
    let array = values[0].as_array().unwrap();

    assert_eq!(array.len(), 5);
    // Sequences keep their 1-based keys
    assert_eq!(array.get(&ArrayKey::Int(1)), Some(HostValue::Int(10)));
    assert_eq!(array.get(&ArrayKey::Int(2)), Some(HostValue::Int(20)));
    assert_eq!(array.get(&ArrayKey::from("name")), Some(HostValue::from("x")));
    assert_eq!(array.get(&ArrayKey::from("1.5")), Some(HostValue::Bool(true)));
    assert_eq!(array.get(&ArrayKey::Int(7)), Some(HostValue::from("seven")));
}

#[test]
fn test_array_to_table() {
    let sandbox = LuaSandbox::new().unwrap();
    let func = sandbox
        .load_string("local t = ... return t[0], t[1], t.key, t['5']", "=index")
        .unwrap();
    let array = HostArray::from_list([HostValue::from("zero"), HostValue::from("one")]);
    array.insert(ArrayKey::from("key"), HostValue::Int(9));
    array.insert(ArrayKey::from("5"), HostValue::Bool(false));

    let values = func.call(&[array.into()]).unwrap();
    assert_eq!(
        values,
        vec![
            HostValue::from("zero"),
            HostValue::from("one"),
            HostValue::Int(9),
            // "5" is a canonical integer key on the host side
            HostValue::Null,
        ]
    );
}

#[test]
fn test_key_collision() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = eval(&sandbox, "return {[0] = 'a', ['0'] = 'b'}").unwrap_err();
    assert!(matches!(err, SandboxError::Marshal(MarshalError::KeyCollision(ref key)) if key == "0"));

    let err = eval(&sandbox, "return {[true] = 1}").unwrap_err();
    assert!(matches!(err, SandboxError::Marshal(MarshalError::Unsupported(_))));
}

#[test]
fn test_close_float_keys_stay_distinct() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(&sandbox, "return {[0.1] = 'a', [0.10000000000000002] = 'b', [2.5] = 'c'}").unwrap();
    let array = values[0].as_array().unwrap();
    assert_eq!(array.len(), 3);
    assert_eq!(array.get(&ArrayKey::from("0.1")), Some(HostValue::from("a")));
    assert_eq!(array.get(&ArrayKey::from("2.5")), Some(HostValue::from("c")));

    // Floats past the exact integer range, as produced by an iterator
    let values = eval(
        &sandbox,
        r#"
        local keys = {2^53 + 2.0, 2^53 + 4.0}
        return setmetatable({}, {__pairs = function(t)
            local i = 0
            return function()
                i = i + 1
                if keys[i] then return keys[i], i end
            end, t, nil
        end})
        "#,
    )
    .unwrap();
    assert_eq!(values[0].as_array().unwrap().len(), 2);
}

#[test]
fn test_guest_cycles_are_rejected() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = eval(&sandbox, "local t = {} t.inner = {outer = t} return t").unwrap_err();
    assert!(matches!(err, SandboxError::Marshal(MarshalError::CyclicValue)));

    // Shared, acyclic substructures are fine
    let values = eval(&sandbox, "local s = {1} return {a = s, b = s}").unwrap();
    let array = values[0].as_array().unwrap();
    assert_eq!(array.get(&ArrayKey::from("a")), array.get(&ArrayKey::from("b")));
}

#[test]
fn test_host_cycles_are_rejected() {
    let sandbox = LuaSandbox::new().unwrap();
    let array = HostArray::new();
    array.insert(ArrayKey::from("me"), HostValue::Array(array.clone()));

    let err = sandbox.to_guest(&HostValue::Array(array.clone())).unwrap_err();
    assert!(matches!(err, SandboxError::Marshal(MarshalError::CyclicValue)));

    // Break the cycle so the Rc can be freed
    array.remove(&ArrayKey::from("me"));
}

#[test]
fn test_pairs_metamethod_is_honored() {
    let sandbox = LuaSandbox::new().unwrap();
    let values = eval(
        &sandbox,
        r#"
        local hidden = {a = 1, b = 2}
        return setmetatable({}, {
            __pairs = function(t)
                return next, hidden, nil
            end,
            __index = function() return 'ignored' end,
        })
        "#,
    )
    .unwrap();
    let array = values[0].as_array().unwrap();
    assert_eq!(array.len(), 2);
    assert_eq!(array.get(&ArrayKey::from("a")), Some(HostValue::Int(1)));
    assert_eq!(array.get(&ArrayKey::from("b")), Some(HostValue::Int(2)));
}

#[test]
fn test_references_are_dereferenced() {
    let sandbox = LuaSandbox::new().unwrap();
    let func = sandbox.load_string("local x = ... return x + 1", "=inc").unwrap();
    let reference = HostValue::reference(HostValue::Int(41));
    assert_eq!(func.call(&[reference]).unwrap(), vec![HostValue::Int(42)]);
}

#[test]
fn test_opaque_objects_are_unsupported() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = sandbox.to_guest(&HostValue::Opaque("DateTime".to_string())).unwrap_err();
    assert!(matches!(err, SandboxError::Marshal(MarshalError::Unsupported(_))));
}

#[test]
fn test_direct_conversion() {
    let sandbox = LuaSandbox::new().unwrap();
    let guest = sandbox.to_guest(&HostValue::from(vec![HostValue::Int(1), HostValue::from("two")])).unwrap();
    assert!(matches!(guest, GuestValue::Table(_)));

    let back = sandbox.to_host(guest).unwrap();
    let array = back.as_array().unwrap();
    assert_eq!(array.get(&ArrayKey::Int(1)), Some(HostValue::from("two")));
}

#[test]
fn test_conversion_depth_limit() {
    let sandbox = LuaSandbox::new().unwrap();
    let err = eval(
        &sandbox,
        "local t = {} local cur = t for i = 1, 300 do cur.next = {} cur = cur.next end return t",
    )
    .unwrap_err();
    assert!(matches!(err, SandboxError::Marshal(MarshalError::TooDeep(256))));
}
