//! Apply orchestration.
//!
//! The engine ties the pipeline together: classify the edit, compile on the
//! worker thread, plan against the loaded runtime module, rewrite, install,
//! persist. Apply runs on the host main thread (`pump`/`reload_now`);
//! compiles are serialized on the worker; per assembly at most one apply is
//! in flight and later requests queue behind it. A compile whose source
//! moved on before it finished is discarded and the file re-queued.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::classifier::{ChangeClassifier, ChangeKind};
use crate::compiler::{CompileJob, CompileWorker, CompilerDriver, CompletedCompile, ReferenceSet};
use crate::diagnostics::{Diagnostic, PatchError};
use crate::history::PatchHistory;
use crate::host::{HostServices, RuntimeCtx};
use crate::image::ModuleImage;
use crate::inspect::{PlanOutcome, ReplayContext, plan};
use crate::install::{AssemblyPatcher, PatchApplyResult};
use crate::runtime::lock;
use crate::settings::ReloadSettings;

const LOCKED_RETRY_LIMIT: u32 = 3;
const SYNC_COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one reload request, fatal errors aside.
#[derive(Debug)]
pub struct ReloadReport {
    pub source_path: PathBuf,
    pub verdict: Option<ChangeKind>,
    pub fast_path: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub result: Option<PatchApplyResult>,
}

impl ReloadReport {
    fn skipped(path: &Path) -> ReloadReport {
        ReloadReport {
            source_path: path.to_path_buf(),
            verdict: None,
            fast_path: false,
            diagnostics: Vec::new(),
            result: None,
        }
    }
}

#[derive(Default)]
struct PendingState {
    in_flight: bool,
    requeued: bool,
    locked_attempts: u32,
    last_verdict: Option<ChangeKind>,
}

pub struct ReloadEngine {
    settings: ReloadSettings,
    host: Arc<dyn HostServices>,
    ctx: Arc<RuntimeCtx>,
    classifier: Mutex<ChangeClassifier>,
    worker: CompileWorker,
    history: PatchHistory,
    patchers: Mutex<HashMap<String, Arc<AssemblyPatcher>>>,
    pending: Mutex<HashMap<PathBuf, PendingState>>,
    retry_queue: Mutex<Vec<PathBuf>>,
}

impl ReloadEngine {
    pub fn new(
        host: Arc<dyn HostServices>,
        ctx: Arc<RuntimeCtx>,
        settings: ReloadSettings,
    ) -> Result<ReloadEngine, PatchError> {
        std::fs::create_dir_all(&settings.state_dir)?;
        let classifier = ChangeClassifier::with_cache_file(settings.signature_cache_path());
        let history = PatchHistory::open(settings.history_dir())?;
        let driver = Arc::new(CompilerDriver::new(ReferenceSet::default()));
        let worker = CompileWorker::spawn(driver);

        Ok(ReloadEngine {
            settings,
            host,
            ctx,
            classifier: Mutex::new(classifier),
            worker,
            history,
            patchers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            retry_queue: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &ReloadSettings {
        &self.settings
    }

    /// Queue a reload for an edited source file. Non-blocking; results
    /// surface through `pump`.
    pub fn request_reload(&self, path: &Path) {
        if !self.settings.enabled {
            return;
        }
        let source = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                self.handle_read_error(path, err);
                return;
            }
        };
        {
            let mut pending = lock(&self.pending);
            let state = pending.entry(path.to_path_buf()).or_default();
            state.locked_attempts = 0;
            if state.in_flight {
                // One apply in flight per assembly; remember to re-run.
                state.requeued = true;
                return;
            }
            state.in_flight = true;
            state.requeued = false;
        }

        let verdict = lock(&self.classifier).analyze(path, &source);
        let Some(verdict) = verdict else {
            log::debug!(target: "respatch::detector", "{}: nothing to compile", path.display());
            self.finish_pending(path);
            return;
        };
        log::info!(
            target: "respatch::detector",
            "{}: {} ({})",
            path.display(),
            verdict.kind,
            verdict.reason
        );
        if let Some(state) = lock(&self.pending).get_mut(path) {
            state.last_verdict = Some(verdict.kind);
        }

        let job = CompileJob {
            source_path: path.to_path_buf(),
            source_text: source,
            module_name: self.assembly_for(path).unwrap_or_else(|| "Scripts".to_string()),
            use_fast_path: verdict.can_fast_path,
            observed_mtime: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        };
        if self.worker.submit(job).is_err() {
            log::error!(target: "respatch::compiler", "compile worker is gone");
            self.finish_pending(path);
        }
    }

    fn handle_read_error(&self, path: &Path, err: std::io::Error) {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => {
                log::info!(target: "respatch::detector", "{} vanished; dropping", path.display());
                lock(&self.classifier).forget(path);
                lock(&self.pending).remove(path);
            }
            ErrorKind::PermissionDenied | ErrorKind::WouldBlock => {
                let mut pending = lock(&self.pending);
                let state = pending.entry(path.to_path_buf()).or_default();
                state.locked_attempts += 1;
                if state.locked_attempts <= LOCKED_RETRY_LIMIT {
                    log::debug!(
                        target: "respatch::detector",
                        "{} is locked (attempt {}); re-queueing",
                        path.display(),
                        state.locked_attempts
                    );
                    lock(&self.retry_queue).push(path.to_path_buf());
                } else {
                    log::warn!(target: "respatch::detector", "{} stayed locked; dropping", path.display());
                    pending.remove(path);
                }
            }
            _ => {
                log::warn!(target: "respatch::detector", "cannot read {}: {err}", path.display());
                lock(&self.pending).remove(path);
            }
        }
    }

    fn finish_pending(&self, path: &Path) {
        let requeue = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(path) {
                Some(state) => {
                    state.in_flight = false;
                    std::mem::take(&mut state.requeued)
                }
                None => false,
            }
        };
        if requeue {
            lock(&self.retry_queue).push(path.to_path_buf());
        }
    }

    /// Drive the apply side on the host main thread: finished compiles are
    /// applied, queued files re-requested. Returns one report per finished
    /// apply attempt.
    pub fn pump(&self) -> Vec<ReloadReport> {
        let mut reports = Vec::new();
        for completed in self.worker.completed() {
            match self.process_completed(completed) {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => log::error!(target: "respatch::installer", "apply failed: {err}"),
            }
        }
        for path in std::mem::take(&mut *lock(&self.retry_queue)) {
            self.request_reload(&path);
        }
        reports
    }

    /// Synchronous classify → compile → apply round trip for one file.
    pub fn reload_now(&self, path: &Path) -> Result<ReloadReport, PatchError> {
        if !self.settings.enabled {
            return Ok(ReloadReport::skipped(path));
        }
        let source = std::fs::read_to_string(path).map_err(|err| PatchError::SourceUnreachable {
            path: path.to_path_buf(),
            source: err,
        })?;
        let Some(verdict) = lock(&self.classifier).analyze(path, &source) else {
            return Ok(ReloadReport::skipped(path));
        };
        {
            let mut pending = lock(&self.pending);
            let state = pending.entry(path.to_path_buf()).or_default();
            state.in_flight = true;
            state.last_verdict = Some(verdict.kind);
        }
        self.worker.submit(CompileJob {
            source_path: path.to_path_buf(),
            source_text: source,
            module_name: self.assembly_for(path).unwrap_or_else(|| "Scripts".to_string()),
            use_fast_path: verdict.can_fast_path,
            observed_mtime: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        })?;

        loop {
            let Some(completed) = self.worker.wait_one(SYNC_COMPILE_TIMEOUT) else {
                return Err(PatchError::WorkerGone);
            };
            let matches = completed.job.source_path == path;
            match self.process_completed(completed) {
                Ok(Some(report)) if matches => return Ok(report),
                Ok(_) => continue,
                Err(err) if matches => return Err(err),
                Err(err) => {
                    log::error!(target: "respatch::installer", "apply failed: {err}");
                }
            }
        }
    }

    fn process_completed(
        &self,
        completed: CompletedCompile,
    ) -> Result<Option<ReloadReport>, PatchError> {
        let CompletedCompile { job, outcome } = completed;
        let path = job.source_path.clone();
        let verdict = lock(&self.pending).get(&path).and_then(|s| s.last_verdict);
        self.finish_pending(&path);

        // A newer revision landed while this compile ran: discard, re-queue.
        let current_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if let (Some(observed), Some(current)) = (job.observed_mtime, current_mtime)
            && current > observed
        {
            log::info!(
                target: "respatch::compiler",
                "{}: source moved on during compile; re-queueing",
                path.display()
            );
            lock(&self.retry_queue).push(path.clone());
            return Ok(None);
        }

        if !outcome.ok {
            for d in outcome.diagnostics.iter().take(self.settings.max_error_lines) {
                log::warn!(target: "respatch::compiler", "{}: {}", path.display(), d.message);
            }
            return Ok(Some(ReloadReport {
                source_path: path,
                verdict,
                fast_path: job.use_fast_path,
                diagnostics: outcome.diagnostics,
                result: None,
            }));
        }

        let bytes = outcome
            .image_bytes
            .as_deref()
            .ok_or_else(|| PatchError::ImageUnreadable { reason: "empty compile output".into() })?;
        let result = self.apply_image(&path, &job.source_text, bytes, job.use_fast_path)?;
        Ok(Some(ReloadReport {
            source_path: path,
            verdict,
            fast_path: job.use_fast_path,
            diagnostics: Vec::new(),
            result: Some(result),
        }))
    }

    /// Plan, rewrite, install, and persist one compiled image.
    fn apply_image(
        &self,
        path: &Path,
        source_text: &str,
        image_bytes: &[u8],
        fast_path: bool,
    ) -> Result<PatchApplyResult, PatchError> {
        let image = ModuleImage::from_bytes(image_bytes)
            .map_err(|e| PatchError::ImageUnreadable { reason: e.to_string() })?;

        let assembly = self
            .assembly_for(path)
            .ok_or_else(|| PatchError::AssemblyMissing { name: image.name.clone() })?;
        let module = self
            .host
            .find_loaded_assembly(&assembly)
            .ok_or_else(|| PatchError::AssemblyMissing { name: assembly.clone() })?;

        let plan = match plan(&image, &module, fast_path, None) {
            PlanOutcome::Plan(plan) => plan,
            PlanOutcome::Incompatible { reason } => {
                log::warn!(target: "respatch::detector", "{assembly}: {reason}");
                return Err(PatchError::Incompatible { reason });
            }
        };

        let patcher = self.patcher_for(&module);
        let result = patcher.apply(&image, &plan);

        if result.installed_any()
            && let Err(err) = self.history.record(path, source_text, &result, image_bytes)
        {
            log::warn!(target: "respatch::general", "could not persist patch: {err}");
        }
        Ok(result)
    }

    fn patcher_for(&self, module: &Arc<crate::runtime::loaded::LoadedModule>) -> Arc<AssemblyPatcher> {
        let mut patchers = lock(&self.patchers);
        Arc::clone(patchers.entry(module.name().to_string()).or_insert_with(|| {
            Arc::new(AssemblyPatcher::new(
                Arc::clone(module),
                Arc::clone(&self.host),
                Arc::clone(&self.ctx.dispatcher),
                Arc::clone(&self.ctx.entry_points),
            ))
        }))
    }

    fn assembly_for(&self, path: &Path) -> Option<String> {
        self.settings
            .assembly
            .clone()
            .or_else(|| self.host.assembly_for_source(path))
    }

    /// Replay persisted patches after a host-triggered reload, oldest
    /// first, skipping fast-path validation and using recorded token pairs
    /// where the runtime module build is unchanged.
    pub fn replay_history(&self) -> usize {
        let mut applied = 0;
        for record in self.history.valid_records() {
            let Some(module) = self.host.find_loaded_assembly(&record.assembly_name) else {
                log::warn!(
                    target: "respatch::general",
                    "replay: assembly {} not loaded",
                    record.assembly_name
                );
                continue;
            };
            let image = match self.history.load_image(&record) {
                Ok(image) => image,
                Err(err) => {
                    log::warn!(target: "respatch::general", "replay: {err}");
                    continue;
                }
            };
            let replay = ReplayContext {
                token_pairs: record.token_pairs.clone(),
                uuid_matches: module.uuid() == record.runtime_module_uuid,
            };
            let plan = match plan(&image, &module, true, Some(&replay)) {
                PlanOutcome::Plan(plan) => plan,
                PlanOutcome::Incompatible { reason } => {
                    log::warn!(target: "respatch::general", "replay: {reason}");
                    continue;
                }
            };
            let patcher = self.patcher_for(&module);
            let result = patcher.apply(&image, &plan);
            if result.installed_any() {
                applied += 1;
                log::info!(
                    target: "respatch::general",
                    "replayed patch for {}",
                    record.source_path.display()
                );
            }
        }
        applied
    }

    /// Periodic maintenance: proxy scan plus field-store pruning.
    pub fn pump_scanner(&self) {
        self.ctx.entry_points.scan(self.host.as_ref(), false);
        self.ctx.field_store.prune();
    }

    pub fn history(&self) -> &PatchHistory {
        &self.history
    }

    pub fn patcher(&self, assembly: &str) -> Option<Arc<AssemblyPatcher>> {
        lock(&self.patchers).get(assembly).cloned()
    }

    /// Playmode exit: release every hook and clear the shared tables.
    pub fn reset(&self) {
        for patcher in lock(&self.patchers).values() {
            patcher.reset();
        }
        self.ctx.dispatcher.clear();
        self.ctx.entry_points.clear();
        self.ctx.field_store.clear();
        log::info!(target: "respatch::general", "patch state reset");
    }
}
