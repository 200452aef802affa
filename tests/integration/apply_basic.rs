mod common;

use common::{ASSEMBLY, fixture, fixture_with};
use respatch::classifier::ChangeKind;
use respatch::runtime::value::Value;

const TICK_A: &str = "class C {
    void Tick() {
        print(\"a\");
    }
}
";
const TICK_B: &str = "class C {
    void Tick() {
        print(\"b\");
    }
}
";

#[test]
fn body_edit_takes_fast_path_and_detours() {
    let (fx, obj) = fixture_with(TICK_A, "C");

    // First sighting of the file: slow path, detours installed.
    let first = fx.apply(TICK_A);
    assert!(first.patched >= 1);
    assert_eq!(first.errors, Vec::<String>::new());
    let (methods, trampolines) = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();
    assert!(methods.iter().any(|k| k.starts_with("C::Tick")));
    assert!(trampolines.is_empty());

    // Body-only edit: fast path.
    fx.edit(TICK_B);
    let report = fx.reload();
    assert_eq!(report.verdict, Some(ChangeKind::MethodBodyOnly));
    assert!(report.fast_path);
    let result = report.result.expect("apply result");
    assert!(result.patched >= 1);
    assert_eq!(result.trampolines, 0);
    assert_eq!(result.errors, Vec::<String>::new());

    // The detoured body runs for ordinary calls.
    fx.host.call(ASSEMBLY, "C", "Tick", Some(obj), &[]).unwrap();
    assert_eq!(fx.host.take_output(), vec!["b"]);
}

#[test]
fn first_analysis_is_slow_path() {
    let fx = fixture(TICK_A);
    fx.edit(TICK_A);
    let report = fx.reload();
    assert_eq!(report.verdict, Some(ChangeKind::FirstAnalysis));
    assert!(!report.fast_path);
}

#[test]
fn added_method_call_site_goes_through_dispatcher() {
    let (fx, obj) = fixture_with(TICK_A, "C");

    let result = fx.apply(
        "class C {
    void Tick() {
        Hello();
    }
    void Hello() {
        print(\"h\");
    }
}
",
    );
    // Hello has no runtime slot: dispatcher-registered; Tick detoured.
    assert!(result.dispatched >= 1);
    assert!(result.patched >= 1);
    assert_eq!(result.errors, Vec::<String>::new());

    fx.host.call(ASSEMBLY, "C", "Tick", Some(obj), &[]).unwrap();
    assert_eq!(fx.host.take_output(), vec!["h"]);
}

#[test]
fn signature_change_is_slow_path_verdict() {
    let fx = fixture(TICK_A);
    fx.apply(TICK_A);

    fx.edit(
        "class C {
    void Tick() {
        print(\"a\");
    }
    void Extra() {
    }
}
",
    );
    let report = fx.reload();
    assert_eq!(report.verdict, Some(ChangeKind::SignatureChanged));
    assert!(!report.fast_path);
    assert!(report.result.is_some());
}

#[test]
fn compile_failure_reports_diagnostics_and_installs_nothing() {
    let fx = fixture(TICK_A);
    fx.edit("class C { void Tick() { unknown_function(); } }");
    let report = fx.reload();
    assert!(!report.diagnostics.is_empty());
    assert!(report.result.is_none());
    assert!(fx.engine.patcher(ASSEMBLY).is_none());
}

#[test]
fn disabled_engine_skips() {
    use respatch::engine::ReloadEngine;
    use respatch::host::{HostServices, RuntimeCtx, SimHost};
    use respatch::settings::ReloadSettings;
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("A.cs");
    std::fs::write(&source, TICK_A).unwrap();

    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    host.load_assembly(common::compile(TICK_A));

    let settings = ReloadSettings {
        enabled: false,
        state_dir: dir.path().join(".respatch"),
        ..ReloadSettings::default()
    };
    let engine =
        ReloadEngine::new(Arc::clone(&host) as Arc<dyn HostServices>, ctx, settings).unwrap();
    let report = engine.reload_now(&source).unwrap();
    assert!(report.result.is_none());
    assert!(report.verdict.is_none());
}

#[test]
fn patched_state_survives_arguments() {
    let (fx, obj) = fixture_with(
        "class C { int Add(int a, int b) { return a + b; } }",
        "C",
    );
    fx.apply("class C { int Add(int a, int b) { return a + b + 100; } }");

    let v = fx
        .host
        .call(ASSEMBLY, "C", "Add", Some(obj), &[Value::Int(2), Value::Int(3)])
        .unwrap();
    assert!(matches!(v, Value::Int(105)));
}

#[test]
fn vanished_file_is_dropped() {
    let fx = fixture(TICK_A);
    let missing = fx.dir.path().join("Gone.cs");
    // No panic, no report; the engine logs and drops.
    fx.engine.request_reload(&missing);
    assert!(fx.engine.pump().is_empty());
}
