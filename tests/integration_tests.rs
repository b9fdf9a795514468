// End-to-End Integration Tests for varstore
// These tests exercise complete variable flows through the public facade:
// local and global scopes, list variables, routing, and cache recovery.

use varstore::{
    Ctx, GlobalVariableScope, SimpleVariableScope, Value, VariablePath, VariableScope, Variables,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn path(text: &str) -> VariablePath {
    VariablePath::parse(text).unwrap()
}

/// Test complete set/read/overwrite/delete flow for global variables
#[test]
fn test_e2e_global_crud() {
    let mut vars = Variables::new();

    vars.set(&path("user::1"), None, Value::from("Alice")).unwrap();
    vars.set(&path("user::2"), None, Value::from("Bob")).unwrap();

    assert_eq!(vars.get_value(&path("user::1"), None).unwrap(), Some(Value::from("Alice")));
    assert_eq!(vars.get_value(&path("user::2"), None).unwrap(), Some(Value::from("Bob")));

    vars.set(&path("user::2"), None, Value::from("Robert")).unwrap();
    assert_eq!(vars.get_value(&path("user::2"), None).unwrap(), Some(Value::from("Robert")));

    assert!(vars.delete(&path("user::1"), None, false).unwrap());
    assert_eq!(vars.get_value(&path("user::1"), None).unwrap(), None);
    assert_eq!(vars.get_value(&path("user::2"), None).unwrap(), Some(Value::from("Robert")));

    vars.close().unwrap();
}

/// `set {_x} to 5` then `{_x}` reads 5
#[test]
fn test_e2e_local_variable_roundtrip() {
    let mut vars = Variables::new();
    let ctx = Ctx::new();

    vars.set(&path("_x"), Some(&ctx), Value::from(5i64)).unwrap();
    assert_eq!(vars.get_value(&path("_x"), Some(&ctx)).unwrap(), Some(Value::from(5i64)));

    vars.end_context(&ctx);
    vars.close().unwrap();
}

/// `set {_list::1} to "a"`, `set {_list::foo} to "b"` — iterating the list
/// yields both entries and `{_list::1}` still reads "a"
#[test]
fn test_e2e_mixed_list_entries() {
    let mut vars = Variables::new();
    let ctx = Ctx::new();

    vars.set(&path("_list::1"), Some(&ctx), Value::from("a")).unwrap();
    vars.set(&path("_list::foo"), Some(&ctx), Value::from("b")).unwrap();

    let list = vars.get(&path("_list"), Some(&ctx)).unwrap().unwrap();
    let list = list.as_list().unwrap().clone();
    let entries = list.read().entries();
    assert_eq!(entries.len(), 2);
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"1"));
    assert!(names.contains(&"foo"));

    assert_eq!(vars.get_value(&path("_list::1"), Some(&ctx)).unwrap(), Some(Value::from("a")));

    vars.end_context(&ctx);
    vars.close().unwrap();
}

/// Two execution contexts hold independent namespaces, and both are
/// reclaimed after their contexts end
#[test]
fn test_e2e_context_isolation_and_reclaim() {
    let mut vars = Variables::new();
    let first = Ctx::new();
    let second = Ctx::new();

    vars.set(&path("_score"), Some(&first), Value::from(10i64)).unwrap();
    vars.set(&path("_score"), Some(&second), Value::from(20i64)).unwrap();

    assert_eq!(vars.get_value(&path("_score"), Some(&first)).unwrap(), Some(Value::from(10i64)));
    assert_eq!(vars.get_value(&path("_score"), Some(&second)).unwrap(), Some(Value::from(20i64)));
    assert_eq!(vars.local_context_count(), 2);

    vars.end_context(&first);
    vars.end_context(&second);
    assert_eq!(vars.local_context_count(), 0);

    vars.close().unwrap();
}

/// A path that cached its parent list keeps working after the list was
/// deleted and recreated underneath it
#[test]
fn test_e2e_path_cache_survives_list_deletion() {
    let mut vars = Variables::new();
    let reused = path("board::top");

    vars.set(&reused, None, Value::from("first")).unwrap();
    assert_eq!(vars.get_value(&reused, None).unwrap(), Some(Value::from("first")));

    // Delete the whole list out from under the cached path
    vars.delete(&path("board"), None, true).unwrap();
    assert_eq!(vars.get_value(&reused, None).unwrap(), None);

    // Recreate and read through the same path object again
    vars.set(&path("board::top"), None, Value::from("second")).unwrap();
    assert_eq!(vars.get_value(&reused, None).unwrap(), Some(Value::from("second")));

    vars.close().unwrap();
}

/// Appending builds a list with sequential keys
#[test]
fn test_e2e_append_builds_list() {
    let mut vars = Variables::new();

    for word in ["red", "green", "blue"] {
        vars.append(&path("colors"), None, Value::from(word)).unwrap();
    }

    assert_eq!(vars.get_value(&path("colors::0"), None).unwrap(), Some(Value::from("red")));
    assert_eq!(vars.get_value(&path("colors::2"), None).unwrap(), Some(Value::from("blue")));

    let list = vars.get(&path("colors"), None).unwrap().unwrap();
    assert_eq!(list.as_list().unwrap().read().len(), 3);

    vars.close().unwrap();
}

/// A path matching several routed prefixes always goes to the last
/// matching entry, repeatably
#[test]
fn test_e2e_last_matching_prefix_wins() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let tagged = |label: &'static str| -> Box<dyn VariableScope> {
        let log = Arc::clone(&log);
        Box::new(SimpleVariableScope::with_sink(Arc::new(move |name, _| {
            log.lock().push(format!("{}:{}", label, name));
        })))
    };

    let mut global = GlobalVariableScope::new();
    global.add_route(path("stats"), tagged("specific")).unwrap();
    global.add_route(path("stats"), tagged("override")).unwrap();

    for _ in 0..5 {
        global.set(&path("stats::kills"), None, Value::from(1i64)).unwrap();
    }

    let seen = log.lock().clone();
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|entry| entry == "override:stats::kills"));
}

/// Deep nesting works through every operation
#[test]
fn test_e2e_deep_nesting() {
    let mut vars = Variables::new();

    vars.set(&path("a::b::c::d::e"), None, Value::from(1i64)).unwrap();
    assert_eq!(vars.get_value(&path("a::b::c::d::e"), None).unwrap(), Some(Value::from(1i64)));

    // Deleting a mid-level list removes the whole subtree
    assert!(vars.delete(&path("a::b::c"), None, true).unwrap());
    assert_eq!(vars.get_value(&path("a::b::c::d::e"), None).unwrap(), None);

    // The untouched ancestors survive
    assert!(vars.get(&path("a::b"), None).unwrap().is_some());

    vars.close().unwrap();
}

/// Values of every built-in type survive a set/get roundtrip
#[test]
fn test_e2e_value_types() {
    let mut vars = Variables::new();
    let values = vec![
        Value::Boolean(true),
        Value::Long(-7),
        Value::Double(2.5),
        Value::Text("text".to_string()),
        Value::Bytes(vec![1, 2, 3]),
    ];

    for (i, value) in values.iter().enumerate() {
        let p = path(&format!("typed::{}", i));
        vars.set(&p, None, value.clone()).unwrap();
        assert_eq!(vars.get_value(&p, None).unwrap().as_ref(), Some(value));
    }

    vars.close().unwrap();
}
