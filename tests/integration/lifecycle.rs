mod common;

use common::{ASSEMBLY, fixture_with};
use respatch::entrypoints::LifecycleKind;
use respatch::runtime::loaded::EntryTarget;

#[test]
fn lifecycle_body_edit_installs_trampoline() {
    let (fx, _obj) = fixture_with("class C { void OnTick() { print(\"a\"); } }", "C");

    assert_eq!(fx.tick_output(), vec!["a"]);

    let result = fx.apply("class C { void OnTick() { print(\"b\"); } }");
    assert_eq!(result.trampolines, 1);
    assert_eq!(result.errors, Vec::<String>::new());

    // The scheduler's cached entry now leads to the dispatcher.
    let module = fx.engine.patcher(ASSEMBLY).unwrap().module().clone();
    assert!(matches!(
        module.entry_target("C", LifecycleKind::Tick),
        Some(EntryTarget::Dispatch(_))
    ));
    assert_eq!(fx.tick_output(), vec!["b"]);
}

#[test]
fn newly_added_lifecycle_method_reaches_instances_via_proxy() {
    let (fx, _obj) = fixture_with("class C { }", "C");

    // Nothing to run yet.
    assert!(fx.tick_output().is_empty());

    let result = fx.apply("class C { void OnTick() { print(\"t\"); } }");
    // OnTick has no runtime slot: dispatcher-only plus an entry-point
    // registration for the scanner.
    assert!(result.dispatched >= 1);
    assert_eq!(result.trampolines, 0);
    assert!(fx.ctx.entry_points.registrations_for("C").is_some());

    // Before the scan no proxy is attached, so ticks are silent.
    assert!(fx.tick_output().is_empty());

    // The scan attaches one proxy to the live instance; ticks then land in
    // the new method.
    let attached = fx.ctx.entry_points.scan(fx.host.as_ref(), true);
    assert_eq!(attached, 1);
    assert_eq!(fx.tick_output(), vec!["t"]);
    assert_eq!(fx.tick_output(), vec!["t"]);
}

#[test]
fn proxies_cover_future_instances() {
    let (fx, _obj) = fixture_with("class C { }", "C");
    fx.apply("class C { void OnTick() { print(\"t\"); } }");
    fx.ctx.entry_points.scan(fx.host.as_ref(), true);

    // A component spawned after the patch gets its proxy from the next
    // scan pass.
    fx.host.spawn(ASSEMBLY, "C").unwrap();
    fx.ctx.entry_points.scan(fx.host.as_ref(), true);
    assert_eq!(fx.tick_output(), vec!["t", "t"]);
}

#[test]
fn scan_is_idempotent_per_target() {
    let (fx, _obj) = fixture_with("class C { }", "C");
    fx.apply("class C { void OnTick() { print(\"t\"); } }");

    assert_eq!(fx.ctx.entry_points.scan(fx.host.as_ref(), true), 1);
    assert_eq!(fx.ctx.entry_points.scan(fx.host.as_ref(), true), 0);
    assert_eq!(fx.tick_output(), vec!["t"]);
}

#[test]
fn unforced_scans_are_rate_limited() {
    let (fx, _obj) = fixture_with("class C { }", "C");
    fx.apply("class C { void OnTick() { print(\"t\"); } }");

    assert_eq!(fx.ctx.entry_points.scan(fx.host.as_ref(), false), 1);
    // Immediately after, the coarse scan declines to run.
    assert_eq!(fx.ctx.entry_points.scan(fx.host.as_ref(), false), 0);
}

#[test]
fn trampoline_updates_on_subsequent_applies() {
    let (fx, _obj) = fixture_with("class C { void OnTick() { print(\"1\"); } }", "C");

    fx.apply("class C { void OnTick() { print(\"2\"); } }");
    assert_eq!(fx.tick_output(), vec!["2"]);

    fx.apply("class C { void OnTick() { print(\"3\"); } }");
    assert_eq!(fx.tick_output(), vec!["3"]);

    let (_, trampolines) = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();
    assert_eq!(trampolines.len(), 1);
}

#[test]
fn reset_restores_original_lifecycle_behavior() {
    let (fx, _obj) = fixture_with("class C { void OnTick() { print(\"orig\"); } }", "C");

    fx.apply("class C { void OnTick() { print(\"patched\"); } }");
    assert_eq!(fx.tick_output(), vec!["patched"]);

    // Playmode exit: hooks released, entry restored, dispatcher cleared.
    fx.engine.reset();
    assert_eq!(fx.tick_output(), vec!["orig"]);
    assert!(fx.ctx.dispatcher.is_empty());
}
