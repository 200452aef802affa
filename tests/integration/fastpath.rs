mod common;

use common::{ASSEMBLY, fixture, fixture_with};
use respatch::classifier::ChangeKind;

const SRC: &str = "class C {
    void OnTick() {
        print(\"x\");
    }
    void Helper() {
    }
}
";

#[test]
fn reapplying_unchanged_source_is_structurally_idempotent() {
    let (fx, _obj) = fixture_with(SRC, "C");

    fx.apply(SRC);
    let first_hooks = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();
    let first_counts = fx.engine.patcher(ASSEMBLY).unwrap().hook_counts();

    // Same source again: fast path, and the hook tables keep the same
    // structure (the handles underneath are fresh objects).
    fx.edit(SRC);
    let report = fx.reload();
    assert_eq!(report.verdict, Some(ChangeKind::MethodBodyOnly));
    assert!(report.fast_path);

    assert_eq!(fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys(), first_hooks);
    assert_eq!(fx.engine.patcher(ASSEMBLY).unwrap().hook_counts(), first_counts);
    assert_eq!(fx.tick_output(), vec!["x"]);
}

#[test]
fn fast_path_apply_still_executes_new_bodies() {
    let ticker = |msg: &str| {
        format!("class C {{\n    void OnTick() {{\n        print(\"{msg}\");\n    }}\n}}\n")
    };
    let (fx, _obj) = fixture_with(&ticker("1"), "C");
    fx.apply(&ticker("1"));

    for expected in ["2", "3", "4"] {
        fx.edit(&ticker(expected));
        let report = fx.reload();
        assert!(report.fast_path);
        assert_eq!(fx.tick_output(), vec![expected]);
    }
}

#[test]
fn comment_edits_stay_on_fast_path() {
    let fx = fixture(SRC);
    fx.apply(SRC);

    fx.edit(
        "class C { // note
    void OnTick() {
        /* same body */
        print(\"x\");
    }
    void Helper() {
    }
}
",
    );
    let report = fx.reload();
    assert_eq!(report.verdict, Some(ChangeKind::MethodBodyOnly));
}

#[test]
fn signature_cache_survives_engine_restart() {
    let (fx, _obj) = fixture_with(SRC, "C");
    fx.apply(SRC);

    // A second engine over the same state dir sees the persisted signature
    // hash, so an unchanged file classifies as body-only immediately.
    use respatch::engine::ReloadEngine;
    use respatch::host::HostServices;
    use respatch::settings::ReloadSettings;
    use std::sync::Arc;

    let settings = ReloadSettings {
        state_dir: fx.dir.path().join(".respatch"),
        ..ReloadSettings::default()
    };
    let engine = ReloadEngine::new(
        Arc::clone(&fx.host) as Arc<dyn HostServices>,
        Arc::clone(&fx.ctx),
        settings,
    )
    .unwrap();
    let report = engine.reload_now(&fx.source).unwrap();
    assert_eq!(report.verdict, Some(ChangeKind::MethodBodyOnly));
}
