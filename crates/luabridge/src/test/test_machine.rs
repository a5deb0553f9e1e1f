// LuaMachine end-to-end tests
use crate::blon::encode_raw_value;
use crate::lua_vm::{LoadMode, LuaApi, VmStatus, registered_count};
use crate::{
    LibraryModule, Lua53, LuaError, LuaMachine, LuaNativeFunction, LuaTable, LuaValue,
    MachineOptions, args, lib_module,
};

fn machine() -> LuaMachine {
    LuaMachine::new(MachineOptions::default()).unwrap()
}

fn add() -> LuaNativeFunction {
    LuaNativeFunction::wrap(|args| Ok(args![args.get_integer(0)? + args.get_integer(1)?]))
}

#[test]
fn test_add_round_trip() {
    let mut machine = machine();
    machine.register_function("add", add()).unwrap();
    let results = machine.do_string("return add(2, 3)", "=add").unwrap();
    assert_eq!(results, args![5]);
    assert_eq!(encode_raw_value(results.first()).unwrap(), vec![5, 5]);

    // The same function called straight from the host.
    let add = machine.get_global("add").unwrap();
    assert!(matches!(add, LuaValue::NativeFunction(_)));
    assert_eq!(machine.call(add, args![40, 2]).unwrap(), args![42]);
}

#[test]
fn test_arithmetic_in_scripts() {
    let mut machine = machine();
    assert_eq!(machine.do_string("return 1 + 2", "=sum").unwrap(), args![3]);
    assert_eq!(machine.do_string("return 7 // 2, 7 / 2", "=div").unwrap(), args![3, 3.5]);
    assert_eq!(
        machine.do_string("return string.format('%d-%s', 4, 'x')", "=fmt").unwrap(),
        args!["4-x"]
    );
}

#[test]
fn test_globals_round_trip() {
    let mut machine = machine();
    machine.set_global("answer", 42).unwrap();
    machine.register_global("name", "bridge").unwrap();
    let config = LuaTable::from_pairs([("depth", 3), ("width", 4)]).unwrap();
    machine.set_global("config", config.clone()).unwrap();

    assert_eq!(machine.get_global("answer").unwrap(), LuaValue::Integer(42));
    assert_eq!(machine.get_global("name").unwrap(), LuaValue::from("bridge"));
    assert!(machine.get_global("missing").unwrap().is_nil());
    let back = machine.get_global("config").unwrap();
    assert!(back.deep_equals(&LuaValue::from(config)));

    let results = machine
        .do_string("return config.depth * config.width", "=area")
        .unwrap();
    assert_eq!(results, args![12]);
}

#[test]
fn test_do_string_returns_all_results() {
    let mut machine = machine();
    let results = machine
        .do_string("return 1, 2.5, 'three', true, nil", "=many")
        .unwrap();
    assert_eq!(results, args![1, 2.5, "three", true, LuaValue::Nil]);
    assert!(machine.do_string("local x = 1", "=silent").unwrap().is_empty());
}

#[test]
fn test_chunk_arguments() {
    let mut machine = machine();
    let chunk = machine.load("local a, b = ...\nreturn a .. b", "=join").unwrap();
    assert_eq!(machine.call(chunk.clone(), args!["ab", "cd"]).unwrap(), args!["abcd"]);
    assert_eq!(machine.call(chunk, args![1, 2]).unwrap(), args!["12"]);
}

#[test]
fn test_syntax_error() {
    let mut machine = machine();
    let err = machine.do_string("local x = 1\nreturn x +", "=bad").unwrap_err();
    match &err {
        LuaError::Syntax(message) => assert!(message.starts_with("bad:2:"), "{}", message),
        other => panic!("expected a syntax error, got {:?}", other),
    }
    assert!(err.to_string().starts_with("syntax error: bad:2:"));
    assert!(matches!(machine.load("goto nowhere", "=bad"), Err(LuaError::Syntax(_))));
}

#[test]
fn test_runtime_error_carries_position() {
    let mut machine = machine();
    let err = machine
        .do_string("local s = 'x'\nreturn 1 + {}", "=calc")
        .unwrap_err();
    assert!(
        err.to_string()
            .starts_with("calc:2: attempt to perform arithmetic on a table value"),
        "{}",
        err
    );
    let err = machine.do_string("\nnothing()", "=nil").unwrap_err();
    assert!(
        err.to_string().starts_with("nil:2: attempt to call a nil value"),
        "{}",
        err
    );
}

#[test]
fn test_error_values_keep_their_type() {
    let mut machine = machine();
    let err = machine.do_string("error({ code = 7 })", "=raise").unwrap_err();
    let LuaError::Script(value) = &err else {
        panic!("expected a script error, got {:?}", err);
    };
    let table = value.as_table().unwrap();
    assert_eq!(table.get("code"), LuaValue::Integer(7));
    assert_eq!(err.to_string(), "(error object is a table value)");

    let err = machine.do_string("error(404)", "=code").unwrap_err();
    assert!(matches!(err, LuaError::Script(LuaValue::Integer(404))));
}

#[test]
fn test_host_errors_reach_scripts() {
    let mut machine = machine();
    machine
        .register_function(
            "strict",
            LuaNativeFunction::wrap(|args| Ok(args![args.get_integer(0)?])),
        )
        .unwrap();
    let results = machine.do_string("return pcall(strict, 'x')", "=strict").unwrap();
    assert_eq!(
        results,
        args![false, "bad argument #1 (integer expected, got string)"]
    );
}

#[test]
fn test_panicking_callback_becomes_error() {
    let mut machine = machine();
    let angry = LuaNativeFunction::wrap(|_| -> Result<crate::LuaArgs, LuaError> {
        panic!("host bug")
    });
    let err = machine.call(angry, args![]).unwrap_err();
    assert_eq!(err.to_string(), "native function panicked: host bug");
    // Still usable afterwards.
    assert_eq!(machine.do_string("return 1", "=ok").unwrap(), args![1]);
}

#[test]
fn test_register_table_and_library() {
    let mut machine = machine();
    let neg = LuaNativeFunction::wrap(|a| Ok(args![-a.get_integer(0)?]));
    machine
        .register_table("math2", [("add", add()), ("neg", neg)])
        .unwrap();
    let module = lib_module!("text", {
        "upper" => |a: crate::LuaArgs| Ok(args![a.get_string(0)?.to_uppercase()]),
    })
    .with_value("version", 3);
    assert_eq!(module.len(), 2);
    machine.register_library(&module).unwrap();
    machine
        .register_library(&LibraryModule::new("_G").with_value("DEBUG", false))
        .unwrap();

    let source = r#"
        return math2.add(1, 2), math2.neg(5), text.upper("abc"), text.version, DEBUG
    "#;
    let results = machine.do_string(source, "=libs").unwrap();
    assert_eq!(results, args![3, -5, "ABC", 3, false]);
}

#[test]
fn test_host_file_access_is_closed() {
    let mut machine = machine();
    let results = machine
        .do_string("return io, os, dofile, loadfile, require, debug", "=sandbox")
        .unwrap();
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(LuaValue::is_nil));
}

#[test]
fn test_bytecode_rejected_unless_allowed() {
    let mut vm = Lua53::new().unwrap();
    assert_eq!(vm.load(b"return 3", "=dumped", LoadMode::Text), VmStatus::Ok);
    let binary = vm.dump(-1).unwrap();
    assert_eq!(binary[0], 0x1b);

    let mut machine = machine();
    assert!(!machine.allow_bytecode_loading());
    match machine.load(&binary, "=binary") {
        Err(LuaError::Syntax(message)) => assert!(message.contains("binary chunk"), "{}", message),
        other => panic!("expected a syntax error, got {:?}", other.map(|_| ())),
    }

    machine.set_allow_bytecode_loading(true);
    let f = machine.load(&binary, "=binary").unwrap();
    assert_eq!(machine.call(f, args![]).unwrap(), args![3]);
}

#[test]
fn test_load_global() {
    let mut machine = machine();
    let source = "return load('return 40 + 2')()";
    assert_eq!(machine.do_string(source, "=text").unwrap(), args![42]);

    let source = "return load(string.dump(function() return 1 end))";
    let results = machine.do_string(source, "=binary").unwrap();
    assert!(results.get(0).is_nil());
    assert!(results.get_string(1).unwrap().contains("attempt to load a binary chunk"));

    let options = MachineOptions::default().with_bytecode_loading(true);
    let mut permissive = LuaMachine::new(options).unwrap();
    let results = permissive.do_string(source, "=binary").unwrap();
    assert!(matches!(results.get(0), LuaValue::Function(_)));

    let err = machine.do_string("load(1)", "=arg").unwrap_err();
    assert_eq!(
        err.to_string(),
        "bad argument #1 to 'load' (string expected, got number)"
    );
}

#[test]
fn test_close_and_use_after_close() {
    let before = registered_count();
    let mut machine = machine();
    assert_eq!(registered_count(), before + 1);
    machine.close().unwrap();
    assert!(machine.is_closed());
    assert_eq!(registered_count(), before);
    assert!(matches!(machine.close(), Err(LuaError::MachineClosed)));
    assert!(matches!(machine.get_global("x"), Err(LuaError::MachineClosed)));
    assert!(matches!(machine.do_string("return 1", "=late"), Err(LuaError::MachineClosed)));
}

#[test]
fn test_drop_unregisters_machine() {
    let before = registered_count();
    {
        let _a = machine();
        let _b = machine();
        assert_eq!(registered_count(), before + 2);
    }
    assert_eq!(registered_count(), before);
}

#[test]
fn test_functions_do_not_cross_machines() {
    let mut first = machine();
    let mut second = machine();
    let f = first.load("return 1", "=one").unwrap();
    assert_ne!(f.machine(), second.handle());
    assert!(matches!(second.call(f, args![]), Err(LuaError::Marshal(_))));
}

#[test]
fn test_cyclic_host_table_keeps_cycle_in_vm() {
    let mut machine = machine();
    let t = LuaTable::new();
    t.set("name", "loop").unwrap();
    t.set("me", t.clone()).unwrap();
    machine.set_global("t", t.clone()).unwrap();
    let results = machine.do_string("return t.me.me.name, t.me == t", "=cycle").unwrap();
    assert_eq!(results, args!["loop", true]);
    t.clear();
}

#[test]
fn test_deeply_nested_tables_are_refused() {
    let mut machine = machine();
    machine
        .do_string("local t = {}\nfor i = 1, 1000 do t = { t } end\ndeep = t", "=deep")
        .unwrap();
    assert!(matches!(machine.get_global("deep"), Err(LuaError::Marshal(_))));
    // The session unwound cleanly.
    assert_eq!(machine.do_string("return #deep", "=len").unwrap(), args![1]);

    let mut nested = LuaTable::new();
    for _ in 0..1000 {
        let outer = LuaTable::new();
        outer.set(1, nested).unwrap();
        nested = outer;
    }
    assert!(matches!(machine.set_global("host", nested), Err(LuaError::Marshal(_))));

    machine
        .do_string("local t = {}\nfor i = 1, 50 do t = { t } end\nshallow = t", "=shallow")
        .unwrap();
    assert!(matches!(machine.get_global("shallow").unwrap(), LuaValue::Table(_)));
}
