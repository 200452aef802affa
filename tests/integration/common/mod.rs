//! Shared fixtures for the integration suite: a SimHost with one loaded
//! script assembly and an engine wired to a temp state directory.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use respatch::engine::{ReloadEngine, ReloadReport};
use respatch::host::{HostServices, RuntimeCtx, SimHost};
use respatch::image::ModuleImage;
use respatch::install::PatchApplyResult;
use respatch::runtime::value::ObjRef;
use respatch::settings::ReloadSettings;

pub const ASSEMBLY: &str = "Scripts";

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<RuntimeCtx>,
    pub host: Arc<SimHost>,
    pub engine: ReloadEngine,
    pub source: PathBuf,
    /// The image the host loaded at startup, for reload simulations.
    pub baseline: ModuleImage,
}

pub fn compile(source: &str) -> ModuleImage {
    respatch::compile_source(source, ASSEMBLY, false).expect("fixture source compiles")
}

/// Host running `initial_source` as its loaded script assembly, plus an
/// engine whose signature cache and history live under a temp dir.
pub fn fixture(initial_source: &str) -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let source = dir.path().join("A.cs");
    std::fs::write(&source, initial_source).expect("write source");

    let baseline = compile(initial_source);
    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    host.load_assembly(baseline.clone());

    let settings = ReloadSettings {
        state_dir: dir.path().join(".respatch"),
        ..ReloadSettings::default()
    };
    let engine = ReloadEngine::new(
        Arc::clone(&host) as Arc<dyn HostServices>,
        Arc::clone(&ctx),
        settings,
    )
    .expect("engine");

    Fixture { dir, ctx, host, engine, source, baseline }
}

/// Fixture plus one spawned component of `type_name`.
pub fn fixture_with(initial_source: &str, type_name: &str) -> (Fixture, ObjRef) {
    let fx = fixture(initial_source);
    let obj = fx.host.spawn(ASSEMBLY, type_name).expect("spawn");
    (fx, obj)
}

impl Fixture {
    /// Overwrite the watched source file.
    pub fn edit(&self, new_source: &str) {
        std::fs::write(&self.source, new_source).expect("write source");
    }

    /// Edit + synchronous reload, expecting a successful apply.
    pub fn reload(&self) -> ReloadReport {
        self.engine.reload_now(&self.source).expect("reload")
    }

    pub fn apply(&self, new_source: &str) -> PatchApplyResult {
        self.edit(new_source);
        let report = self.reload();
        assert!(
            report.diagnostics.is_empty(),
            "unexpected compile diagnostics: {:?}",
            report.diagnostics
        );
        report.result.expect("apply result")
    }

    /// Tick the scheduler and collect everything printed.
    pub fn tick_output(&self) -> Vec<String> {
        self.host.tick();
        self.host.take_output()
    }
}
