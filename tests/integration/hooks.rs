mod common;

use common::{ASSEMBLY, fixture_with};

// The detour/trampoline handles are RAII native-style resources: the
// installer must retain every one of them, or patches silently vanish.

#[test]
fn patches_survive_memory_churn_and_maintenance() {
    let (fx, _obj) = fixture_with("class C { void OnTick() { print(\"orig\"); } }", "C");
    fx.apply("class C { void OnTick() { print(\"patched\"); } }");

    for round in 0..20 {
        // Allocation churn standing in for arbitrary GC cycles.
        let garbage: Vec<Vec<u8>> = (0..64).map(|i| vec![(round + i) as u8; 4096]).collect();
        drop(garbage);
        fx.ctx.field_store.prune();
        fx.engine.pump_scanner();

        assert_eq!(fx.tick_output(), vec!["patched"], "patch vanished on round {round}");
    }

    let (_, trampolines) = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();
    assert_eq!(trampolines.len(), 1);
}

#[test]
fn detoured_ordinary_methods_stay_patched() {
    let (fx, obj) = fixture_with("class C { void Greet() { print(\"old\"); } }", "C");
    fx.apply("class C { void Greet() { print(\"new\"); } }");

    for _ in 0..10 {
        fx.host.call(ASSEMBLY, "C", "Greet", Some(obj.clone()), &[]).unwrap();
    }
    assert_eq!(fx.host.take_output(), vec!["new"; 10]);
}

#[test]
fn repeated_applies_do_not_leak_hooks() {
    let (fx, _obj) = fixture_with("class C { void OnTick() { print(\"0\"); } }", "C");

    for i in 1..=5 {
        let src = format!("class C {{ void OnTick() {{ print(\"{i}\"); }} }}");
        fx.apply(&src);
    }

    // One trampoline per lifecycle key, however many times it was patched.
    let (method_hooks, trampoline_hooks) = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();
    assert_eq!(trampoline_hooks.len(), 1);
    // The synthesized constructor keeps exactly one detour.
    assert_eq!(method_hooks.len(), 1);
    assert_eq!(fx.tick_output(), vec!["5"]);
}

#[test]
fn reset_releases_every_hook() {
    let (fx, obj) = fixture_with(
        "class C { void OnTick() { print(\"t-orig\"); } void Greet() { print(\"g-orig\"); } }",
        "C",
    );
    fx.apply(
        "class C { void OnTick() { print(\"t-new\"); } void Greet() { print(\"g-new\"); } }",
    );

    fx.engine.reset();
    let patcher = fx.engine.patcher(ASSEMBLY).unwrap();
    assert_eq!(patcher.hook_counts(), (0, 0));

    fx.host.call(ASSEMBLY, "C", "Greet", Some(obj), &[]).unwrap();
    fx.host.tick();
    let mut output = fx.host.take_output();
    output.sort();
    assert_eq!(output, vec!["g-orig", "t-orig"]);
}
