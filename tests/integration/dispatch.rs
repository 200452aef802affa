use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use respatch::dispatch::{Dispatcher, Invoker};
use respatch::keys::MethodId;
use respatch::runtime::value::Value;

fn const_invoker(v: i32) -> Invoker {
    Arc::new(move |_, _| Ok(Value::Int(v)))
}

#[test]
fn registration_is_monotonic_under_concurrent_invokes() {
    let dispatcher = Arc::new(Dispatcher::new());
    let id = MethodId(0xAB);
    dispatcher.register(id, const_invoker(0));

    let stop = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            let stop = Arc::clone(&stop);
            let violations = Arc::clone(&violations);
            std::thread::spawn(move || {
                let mut last = 0;
                while !stop.load(Ordering::Relaxed) {
                    let Value::Int(v) = dispatcher.invoke(None, id, None) else {
                        violations.store(true, Ordering::Relaxed);
                        break;
                    };
                    // After register(i) returns, every invoke sees i or a
                    // later registration, never an earlier one.
                    if v < last {
                        violations.store(true, Ordering::Relaxed);
                        break;
                    }
                    last = v;
                }
            })
        })
        .collect();

    for version in 1..200 {
        dispatcher.register(id, const_invoker(version));
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(!violations.load(Ordering::Relaxed));
}

#[test]
fn invokers_receive_instance_and_argv() {
    let dispatcher = Dispatcher::new();
    let id = MethodId(7);
    dispatcher.register(
        id,
        Arc::new(|instance, argv| {
            assert!(instance.is_some());
            let Value::Int(a) = argv[0] else { panic!("expected int") };
            let Value::Int(b) = argv[1] else { panic!("expected int") };
            Ok(Value::Int(a + b))
        }),
    );

    let obj = respatch::runtime::value::Instance::new("C", &[]);
    let args = [Value::Int(2), Value::Int(5)];
    let result = dispatcher.invoke(Some(Value::Obj(obj)), id, Some(&args));
    assert!(matches!(result, Value::Int(7)));
}

#[test]
fn unknown_id_yields_null_and_keeps_running() {
    let dispatcher = Dispatcher::new();
    for _ in 0..3 {
        assert!(dispatcher.invoke(None, MethodId(0xDEAD), None).is_null());
    }
}

#[test]
fn clear_forgets_registrations() {
    let dispatcher = Dispatcher::new();
    let id = MethodId(1);
    dispatcher.register(id, const_invoker(1));
    dispatcher.clear();
    assert!(dispatcher.invoke(None, id, None).is_null());
}

#[test]
fn concurrent_registration_and_invocation_do_not_deadlock() {
    let dispatcher = Arc::new(Dispatcher::new());
    let calls = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            let calls = Arc::clone(&calls);
            std::thread::spawn(move || {
                for i in 0..500 {
                    let id = MethodId((t * 1000 + i) as u32);
                    dispatcher.register(id, const_invoker(i));
                    dispatcher.invoke(None, id, None);
                    calls.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(calls.load(Ordering::Relaxed), 2000);
    assert_eq!(dispatcher.len(), 2000);
}
