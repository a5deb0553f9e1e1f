// Tests for LuaArgs, LuaValue and LuaTable
use crate::lua_value::LuaString;
use crate::{FromLua, IntoLua, LuaArgs, LuaError, LuaTable, LuaValue, args};

#[test]
fn test_args_macro_and_accessors() {
    let a = args![2, 3.5, "three", true];
    assert_eq!(a.len(), 4);
    assert_eq!(a.get_integer(0).unwrap(), 2);
    assert_eq!(a.get_number(1).unwrap(), 3.5);
    assert_eq!(a.get_string(2).unwrap(), "three");
    assert!(a.get_bool(3).unwrap());
    assert!(a.get(10).is_nil());
    assert_eq!(a.type_name(10), "nil");
}

#[test]
fn test_bad_argument_message() {
    let a = args!["x"];
    let err = a.get_integer(0).unwrap_err();
    assert_eq!(err.to_string(), "bad argument #1 (integer expected, got string)");
    match err {
        LuaError::Script(value) => assert!(value.as_str().is_some()),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_optional_accessors() {
    let a = args![LuaValue::Nil, 7];
    assert_eq!(a.get_optional_integer(0, 42).unwrap(), 42);
    assert_eq!(a.get_optional_integer(1, 42).unwrap(), 7);
    assert_eq!(a.get_optional_string(5, "dflt").unwrap(), "dflt");
    assert!(a.get_optional_bool(1, false).is_err());
}

#[test]
fn test_integral_float_reads_as_integer() {
    let a = args![4.0];
    assert_eq!(a.get_integer(0).unwrap(), 4);
    assert!(args![4.5].get_integer(0).is_err());
}

#[test]
fn test_select_shares_values() {
    let a = LuaArgs::from_vec((1..=10).map(LuaValue::from).collect());
    let tail = a.select(7);
    assert_eq!(tail, args![8, 9, 10]);
    assert_eq!(a.select(20).len(), 0);
}

#[test]
fn test_from_lua_and_into_lua() {
    assert_eq!(i32::from_lua(&LuaValue::Integer(12)).unwrap(), 12);
    assert!(u8::from_lua(&LuaValue::Integer(300)).is_err());
    assert_eq!(Option::<i64>::from_lua(&LuaValue::Nil).unwrap(), None);
    assert_eq!(String::from_lua(&LuaValue::from("hi")).unwrap(), "hi");
    assert_eq!(5i64.into_lua(), LuaValue::Integer(5));
    assert_eq!(args![1, 2].get_as::<i64>(1).unwrap(), 2);
}

#[test]
fn test_text_and_bytes_compare_equal() {
    let text = LuaValue::from("abc");
    let bytes = LuaValue::from(b"abc".to_vec());
    assert_eq!(text, bytes);
    assert_eq!(LuaString::from("abc").as_bytes(), b"abc");
}

#[test]
fn test_number_equality_rules() {
    assert_eq!(LuaValue::Integer(1), LuaValue::Number(1.0));
    assert_ne!(LuaValue::Integer(1), LuaValue::Number(1.5));
    assert_ne!(LuaValue::Number(f64::NAN), LuaValue::Number(f64::NAN));
}

#[test]
fn test_table_nil_semantics() {
    let t = LuaTable::new();
    t.set("a", 1).unwrap();
    t.set(2.0, "two").unwrap();
    assert_eq!(t.get(2), LuaValue::from("two"));
    t.set("a", LuaValue::Nil).unwrap();
    assert!(!t.contains_key("a"));
    assert_eq!(t.len(), 1);
    assert!(t.set(LuaValue::Nil, 1).is_err());
    assert!(t.set(f64::NAN, 1).is_err());
}

#[test]
fn test_table_sequence() {
    let t = LuaTable::from_sequence([10, 20, 30]);
    assert_eq!(t.sequence_len(), 3);
    t.push(40).unwrap();
    assert_eq!(t.sequence(), [10, 20, 30, 40].map(LuaValue::from).to_vec());
}

#[test]
fn test_deep_equals() {
    let a = LuaTable::from_pairs([("x", 1), ("y", 2)]).unwrap();
    let b = LuaTable::from_pairs([("y", 2), ("x", 1)]).unwrap();
    let inner_a = LuaTable::from_sequence(["p", "q"]);
    let inner_b = LuaTable::from_sequence(["p", "q"]);
    a.set("inner", inner_a).unwrap();
    b.set("inner", inner_b).unwrap();
    let (a, b) = (LuaValue::from(a), LuaValue::from(b));
    assert_ne!(a, b);
    assert!(a.deep_equals(&b));
    if let Some(t) = b.as_table() {
        t.set("x", 3).unwrap();
    }
    assert!(!a.deep_equals(&b));
}
