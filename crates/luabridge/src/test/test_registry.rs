// Object registry: ids, anchoring and release
use std::any::Any;
use std::rc::Rc;

use crate::{LuaMachine, LuaNativeFunction, LuaObject, LuaValue, MachineOptions, ReleaseQueue, args};

struct Token(&'static str);

impl LuaObject for Token {
    fn type_name(&self) -> &'static str {
        "Token"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn token(name: &'static str) -> LuaValue {
    LuaValue::from(Rc::new(Token(name)) as Rc<dyn LuaObject>)
}

fn machine() -> LuaMachine {
    LuaMachine::new(MachineOptions::default()).unwrap()
}

#[test]
fn test_same_object_same_id() {
    let mut machine = machine();
    let value = token("a");
    let first = machine.anchor(&value, false).unwrap();
    let second = machine.anchor(&value, false).unwrap();
    assert_eq!(first, second);
    assert!(first >= 1);

    let other = machine.anchor(&token("b"), false).unwrap();
    assert!(other > first);
}

#[test]
fn test_ids_are_not_reused() {
    let mut machine = machine();
    let value = token("a");
    let id = machine.anchor(&value, true).unwrap();
    machine.release(id);
    machine.collect_garbage().unwrap();
    assert!(machine.resolve(id).is_none());

    let again = machine.anchor(&value, true).unwrap();
    assert!(again > id);
    let resolved = machine.resolve(again).unwrap();
    assert_eq!(resolved.downcast_object::<Token>().map(|t| t.0), Some("a"));
}

#[test]
fn test_unreferenced_proxy_is_collected() {
    let mut machine = machine();
    let id = machine.anchor(&token("gone"), false).unwrap();
    assert!(machine.resolve(id).is_some());
    assert!(machine.collect_garbage().unwrap() >= 1);
    assert!(machine.resolve(id).is_none());
}

#[test]
fn test_release_from_another_thread() {
    let mut machine = machine();
    let id = machine.pin(&token("shared")).unwrap();
    let queue = machine.release_queue();
    std::thread::spawn(move || queue.release(id)).join().unwrap();
    assert_eq!(machine.release_queue().len(), 1);
    machine.collect_garbage().unwrap();
    assert!(machine.resolve(id).is_none());
    assert!(machine.release_queue().is_empty());
}

#[test]
fn test_release_queue_crosses_threads() {
    fn shareable<T: Send + Sync>() {}
    shareable::<ReleaseQueue>();
}

#[test]
fn test_native_functions_are_anchored_once() {
    let mut machine = machine();
    let f = LuaNativeFunction::wrap(|_| Ok(args![1]));
    let value = LuaValue::from(f.clone());
    let id = machine.pin(&value).unwrap();
    machine.set_global("f", f.clone()).unwrap();
    assert_eq!(machine.anchor(&value, false).unwrap(), id);
    assert_eq!(machine.resolve(id), Some(value));
}

#[test]
fn test_function_handles_release_on_drop() {
    let mut machine = machine();
    let f = machine.load("return 1", "=one").unwrap();
    let id = f.id();
    let live = machine.live_objects();
    assert!(machine.resolve(id).is_some());

    drop(f);
    assert_eq!(machine.release_queue().len(), 1);
    machine.collect_garbage().unwrap();
    assert!(machine.resolve(id).is_none());
    assert_eq!(machine.live_objects(), live - 1);
}

#[test]
fn test_live_handle_blocks_release() {
    let mut machine = machine();
    let f = machine.load("return 7", "=seven").unwrap();
    machine.release(f.id());
    machine.collect_garbage().unwrap();
    assert!(machine.resolve(f.id()).is_some());
    assert_eq!(machine.call(f, args![]).unwrap(), args![7]);
}

#[test]
fn test_same_vm_function_same_handle() {
    let mut machine = machine();
    machine
        .do_string("function f() return 1 end", "=def")
        .unwrap();
    let a = machine.get_global("f").unwrap();
    let b = machine.get_global("f").unwrap();
    assert_eq!(a, b);
    assert_eq!(
        a.as_function().map(|f| f.id()),
        b.as_function().map(|f| f.id())
    );
}

#[test]
fn test_cyclic_vm_table_reads_back_with_nil() {
    let mut machine = machine();
    let source = r#"
        t = { name = "loop" }
        t.me = t
    "#;
    machine.do_string(source, "=cycle").unwrap();
    let back = machine.get_global("t").unwrap();
    let table = back.as_table().unwrap();
    assert_eq!(table.get("name"), LuaValue::from("loop"));
    assert!(table.get("me").is_nil());
}

#[test]
fn test_shared_vm_subtable_reads_back_shared() {
    let mut machine = machine();
    let source = r#"
        local inner = { x = 1 }
        return { a = inner, b = inner }
    "#;
    let results = machine.do_string(source, "=shared").unwrap();
    let outer = results.get_table(0).unwrap();
    let (a, b) = (outer.get("a"), outer.get("b"));
    assert_eq!(a.as_table().map(|t| t.addr()), b.as_table().map(|t| t.addr()));
    assert_eq!(a.as_table().unwrap().get("x"), LuaValue::Integer(1));
}
