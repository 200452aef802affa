mod common;

use std::sync::Arc;

use common::{ASSEMBLY, fixture_with};
use respatch::engine::ReloadEngine;
use respatch::host::{HostServices, RuntimeCtx, SimHost};
use respatch::settings::ReloadSettings;

const ORIGINAL: &str = "class C { void OnTick() { print(\"orig\"); } }";
const PATCHED: &str = "class C { void OnTick() { print(\"patched\"); } }";

fn engine_for(host: &Arc<SimHost>, ctx: &Arc<RuntimeCtx>, state_dir: std::path::PathBuf) -> ReloadEngine {
    let settings = ReloadSettings { state_dir, ..ReloadSettings::default() };
    ReloadEngine::new(Arc::clone(host) as Arc<dyn HostServices>, Arc::clone(ctx), settings).unwrap()
}

#[test]
fn replay_restores_hooks_after_host_reload() {
    let (fx, _obj) = fixture_with(ORIGINAL, "C");
    fx.apply(PATCHED);
    assert_eq!(fx.tick_output(), vec!["patched"]);
    let original_hooks = fx.engine.patcher(ASSEMBLY).unwrap().hooked_keys();

    // Host-triggered reload: a fresh host process loads the same module
    // build (identical UUID) and replays the persisted patch.
    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    host.load_assembly(fx.baseline.clone());
    host.spawn(ASSEMBLY, "C").unwrap();

    let engine = engine_for(&host, &ctx, fx.dir.path().join(".respatch"));
    assert_eq!(engine.replay_history(), 1);

    // Identical hook set, resolved through the recorded token pairs.
    assert_eq!(engine.patcher(ASSEMBLY).unwrap().hooked_keys(), original_hooks);
    host.tick();
    assert_eq!(host.take_output(), vec!["patched"]);
}

#[test]
fn replay_rebinds_by_key_when_module_was_relinked() {
    let (fx, _obj) = fixture_with(ORIGINAL, "C");
    fx.apply(PATCHED);

    // The host re-linked the assembly: same declarations, new module UUID.
    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    let relinked = common::compile(ORIGINAL);
    assert_ne!(relinked.mvid, fx.baseline.mvid);
    host.load_assembly(relinked);
    host.spawn(ASSEMBLY, "C").unwrap();

    let engine = engine_for(&host, &ctx, fx.dir.path().join(".respatch"));
    assert_eq!(engine.replay_history(), 1);
    host.tick();
    assert_eq!(host.take_output(), vec!["patched"]);
}

#[test]
fn stale_history_records_are_deleted_not_replayed() {
    let (fx, _obj) = fixture_with(ORIGINAL, "C");
    fx.apply(PATCHED);
    assert_eq!(fx.engine.history().records().len(), 1);
    let image_path = fx.engine.history().records()[0].patch_image_path.clone();

    // The source moved on after the patch was persisted.
    fx.edit("class C { void OnTick() { print(\"even newer\"); } }");

    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    host.load_assembly(fx.baseline.clone());
    host.spawn(ASSEMBLY, "C").unwrap();

    let engine = engine_for(&host, &ctx, fx.dir.path().join(".respatch"));
    assert_eq!(engine.replay_history(), 0);
    assert!(!image_path.exists());

    host.tick();
    assert_eq!(host.take_output(), vec!["orig"]);
}

#[test]
fn replay_skips_when_assembly_not_loaded() {
    let (fx, _obj) = fixture_with(ORIGINAL, "C");
    fx.apply(PATCHED);

    // A host that never loaded the assembly: the record survives but
    // nothing is applied.
    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    let engine = engine_for(&host, &ctx, fx.dir.path().join(".respatch"));
    assert_eq!(engine.replay_history(), 0);
}

#[test]
fn newest_record_wins_per_source() {
    let (fx, _obj) = fixture_with(ORIGINAL, "C");
    fx.apply(PATCHED);
    fx.apply("class C { void OnTick() { print(\"final\"); } }");

    // One record per (source, assembly) pair.
    assert_eq!(fx.engine.history().records().len(), 1);

    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    host.load_assembly(fx.baseline.clone());
    host.spawn(ASSEMBLY, "C").unwrap();
    let engine = engine_for(&host, &ctx, fx.dir.path().join(".respatch"));
    assert_eq!(engine.replay_history(), 1);
    host.tick();
    assert_eq!(host.take_output(), vec!["final"]);
}
