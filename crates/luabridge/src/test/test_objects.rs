// Host objects exposed to scripts
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use crate::{
    CallOutcome, LuaArgs, LuaError, LuaMachine, LuaNativeFunction, LuaObject, LuaResult, LuaValue,
    MachineOptions, args,
};

#[derive(Default)]
struct Counter {
    value: Cell<i64>,
    drops: Option<Rc<Cell<u32>>>,
}

impl Drop for Counter {
    fn drop(&mut self) {
        if let Some(drops) = &self.drops {
            drops.set(drops.get() + 1);
        }
    }
}

impl LuaObject for Counter {
    fn type_name(&self) -> &'static str {
        "Counter"
    }

    fn method_names(&self) -> &'static [&'static str] {
        &["inc", "get", "fail"]
    }

    fn call_method(&self, name: &str, args: LuaArgs) -> LuaResult<CallOutcome> {
        match name {
            "inc" => {
                let by = args.get_optional_integer(0, 1)?;
                self.value.set(self.value.get() + by);
                Ok(args![self.value.get()].into())
            }
            "get" => Ok(args![self.value.get()].into()),
            "fail" => Err(LuaError::runtime("counter jammed")),
            other => Err(LuaError::runtime(format!("no method {}", other))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn setup() -> (LuaMachine, Rc<Counter>, LuaValue) {
    let mut machine = LuaMachine::new(MachineOptions::default()).unwrap();
    let counter = Rc::new(Counter::default());
    let object: Rc<dyn LuaObject> = counter.clone();
    let value = LuaValue::from(object);
    machine.set_global("counter", value.clone()).unwrap();
    (machine, counter, value)
}

#[test]
fn test_methods_from_script() {
    let (mut machine, counter, _) = setup();
    let source = r#"
        local first = counter:inc(5)
        counter:inc()
        return first, counter:get()
    "#;
    let results = machine.do_string(source, "=methods").unwrap();
    assert_eq!(results, args![5, 6]);
    assert_eq!(counter.value.get(), 6);
}

#[test]
fn test_method_errors() {
    let (mut machine, _, _) = setup();
    let err = machine
        .do_string("counter:fail()", "=fail")
        .unwrap_err();
    assert_eq!(err.to_string(), "counter jammed");

    let err = machine.do_string("\ncounter:reset()", "=reset").unwrap_err();
    assert!(
        err.to_string().starts_with("reset:2: attempt to call a nil value"),
        "{}",
        err
    );

    let err = machine
        .do_string("counter.inc(1)", "=receiver")
        .unwrap_err();
    assert_eq!(err.to_string(), "bad argument #1 to 'inc' (object expected)");
}

#[test]
fn test_object_identity_survives_round_trip() {
    let (mut machine, counter, _) = setup();
    let back = machine.get_global("counter").unwrap();
    let inner = back.downcast_object::<Counter>().unwrap();
    assert!(std::ptr::eq(inner, Rc::as_ptr(&counter)));
    assert_eq!(back.type_name(), "userdata");
}

#[test]
fn test_get_object_in_native_function() {
    let (mut machine, _, _) = setup();
    let peek = LuaNativeFunction::wrap(|args| {
        let counter = args.get_object::<Counter>(0)?;
        Ok(args![counter.value.get() + 100])
    });
    machine.register_function("peek", peek).unwrap();
    let results = machine
        .do_string("return peek(counter)", "=peek")
        .unwrap();
    assert_eq!(results, args![100]);

    let err = machine
        .do_string("return peek(3)", "=peek")
        .unwrap_err();
    assert_eq!(err.to_string(), "bad argument #1 (Counter expected, got number)");
}

#[test]
fn test_released_object_is_disconnected() {
    let (mut machine, _, value) = setup();
    let id = machine.anchor(&value, false).unwrap();
    assert!(machine.resolve(id).is_some());
    machine.release(id);

    let err = machine
        .do_string("return counter:get()", "=stale")
        .unwrap_err();
    assert!(matches!(err, LuaError::Script(_)));
    assert_eq!(err.to_string(), "attempt to use a disconnected Counter");
    assert!(machine.resolve(id).is_none());
    // The stale proxy reads back as nothing.
    assert!(machine.get_global("counter").unwrap().is_nil());

    // Handing the object over again registers it afresh.
    machine.set_global("counter", value.clone()).unwrap();
    let fresh = machine.anchor(&value, false).unwrap();
    assert!(fresh > id);
    let results = machine
        .do_string("return counter:get()", "=fresh")
        .unwrap();
    assert_eq!(results, args![0]);
}

#[test]
fn test_pinned_object_outlives_scripts() {
    let (mut machine, _, _) = setup();
    let drops = Rc::new(Cell::new(0));
    let loose = Rc::new(Counter {
        value: Cell::new(0),
        drops: Some(drops.clone()),
    });
    let value = LuaValue::from(loose as Rc<dyn LuaObject>);

    let id = machine.pin(&value).unwrap();
    drop(value);
    machine.collect_garbage().unwrap();
    assert!(machine.resolve(id).is_some());
    assert_eq!(drops.get(), 0);

    let value = machine.resolve(id).unwrap();
    assert!(machine.unpin(&value).unwrap());
    drop(value);
    assert_eq!(machine.collect_garbage().unwrap(), 1);
    assert!(machine.resolve(id).is_none());
    assert_eq!(drops.get(), 1);

    let never = LuaValue::from(Rc::new(Counter::default()) as Rc<dyn LuaObject>);
    assert!(!machine.unpin(&never).unwrap());
}

#[test]
fn test_script_created_objects_are_freed() {
    let mut machine = LuaMachine::new(MachineOptions::default()).unwrap();
    let drops = Rc::new(Cell::new(0));
    let counter_drops = drops.clone();
    let make = LuaNativeFunction::wrap(move |_| {
        let counter = Counter {
            value: Cell::new(41),
            drops: Some(counter_drops.clone()),
        };
        Ok(args![Rc::new(counter) as Rc<dyn LuaObject>])
    });
    machine.register_function("make", make).unwrap();
    let results = machine
        .do_string("return make():inc()", "=make")
        .unwrap();
    assert_eq!(results, args![42]);
    assert_eq!(drops.get(), 0);

    machine.collect_garbage().unwrap();
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_anchor_rejects_plain_values() {
    let (mut machine, _, _) = setup();
    assert!(matches!(
        machine.anchor(&LuaValue::from(3), false),
        Err(LuaError::Marshal(_))
    ));
}

#[test]
fn test_objects_report_their_type_name() {
    let (mut machine, _, _) = setup();
    let results = machine
        .do_string("return type(counter), getmetatable(counter).__name", "=names")
        .unwrap();
    assert_eq!(results, args!["userdata", "Counter"]);
}
