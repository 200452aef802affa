//! Single-file compiler driver.
//!
//! Two toolchain configurations are built once per process and never
//! rebuilt within a session: the optimized one for slow-path applies and
//! the unoptimized one the fast path uses for turnaround. A parse cache
//! keyed by source hash amortizes lexing and parsing after the first
//! compile of a given text.
//!
//! Compilation runs off the host main thread: `CompileWorker` owns a
//! dedicated thread that serializes requests, one at a time per host, so
//! concurrent edits don't stack up memory spikes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::classifier::source_hash;
use crate::diagnostics::{Diagnostic, PatchError};
use crate::lexer::lex;
use crate::lower::{LowerOptions, lower_unit};
use crate::parser::{Parser, ast::Unit};
use crate::runtime::lock;

/// Reference closure of the host, resolved by absolute path once at
/// startup.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    pub paths: Vec<PathBuf>,
}

impl ReferenceSet {
    pub fn resolve(paths: impl IntoIterator<Item = PathBuf>) -> ReferenceSet {
        ReferenceSet {
            paths: paths
                .into_iter()
                .map(|p| p.canonicalize().unwrap_or(p))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompileTimings {
    pub parse_ms: u64,
    pub emit_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub ok: bool,
    pub image_bytes: Option<Vec<u8>>,
    pub diagnostics: Vec<Diagnostic>,
    pub timings: CompileTimings,
}

struct ToolchainInstance {
    optimize: bool,
    parse_cache: Mutex<HashMap<String, Arc<Unit>>>,
}

impl ToolchainInstance {
    fn new(optimize: bool) -> Self {
        Self {
            optimize,
            parse_cache: Mutex::new(HashMap::new()),
        }
    }

    fn parse(&self, source: &str) -> Result<Arc<Unit>, crate::diagnostics::CompileError> {
        let hash = source_hash(source);
        if let Some(unit) = lock(&self.parse_cache).get(&hash) {
            return Ok(Arc::clone(unit));
        }
        let tokens = lex(source)?;
        let unit = Arc::new(Parser::new(&tokens, source).parse_unit()?);
        lock(&self.parse_cache).insert(hash, Arc::clone(&unit));
        Ok(unit)
    }

    fn compile(&self, source: &str, module_name: &str) -> CompileOutcome {
        let started = Instant::now();
        let mut timings = CompileTimings::default();

        let unit = match self.parse(source) {
            Ok(unit) => unit,
            Err(err) => {
                return CompileOutcome {
                    ok: false,
                    image_bytes: None,
                    diagnostics: vec![Diagnostic::from_compile_error(&err)],
                    timings,
                };
            }
        };
        timings.parse_ms = started.elapsed().as_millis() as u64;

        let emit_started = Instant::now();
        let image = match lower_unit(&unit, module_name, &LowerOptions { optimize: self.optimize }) {
            Ok(image) => image,
            Err(err) => {
                return CompileOutcome {
                    ok: false,
                    image_bytes: None,
                    diagnostics: vec![Diagnostic::from_compile_error(&err)],
                    timings,
                };
            }
        };
        let bytes = match image.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                return CompileOutcome {
                    ok: false,
                    image_bytes: None,
                    diagnostics: vec![Diagnostic::message_only(err.to_string())],
                    timings,
                };
            }
        };
        timings.emit_ms = emit_started.elapsed().as_millis() as u64;
        timings.total_ms = started.elapsed().as_millis() as u64;

        CompileOutcome {
            ok: true,
            image_bytes: Some(bytes),
            diagnostics: Vec::new(),
            timings,
        }
    }
}

/// The dual-configuration driver.
pub struct CompilerDriver {
    references: Arc<ReferenceSet>,
    release: ToolchainInstance,
    debug: ToolchainInstance,
}

impl CompilerDriver {
    pub fn new(references: ReferenceSet) -> CompilerDriver {
        CompilerDriver {
            references: Arc::new(references),
            release: ToolchainInstance::new(true),
            debug: ToolchainInstance::new(false),
        }
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    /// Fast-path compiles use the unoptimized configuration.
    pub fn compile(&self, source: &str, module_name: &str, use_fast_path: bool) -> CompileOutcome {
        let instance = if use_fast_path { &self.debug } else { &self.release };
        let outcome = instance.compile(source, module_name);
        log::debug!(
            target: "respatch::compiler",
            "compiled {module_name} ({}) in {} ms: {}",
            if use_fast_path { "debug" } else { "release" },
            outcome.timings.total_ms,
            if outcome.ok { "ok" } else { "failed" },
        );
        outcome
    }
}

/// One compile request as the worker sees it.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub source_path: PathBuf,
    pub source_text: String,
    pub module_name: String,
    pub use_fast_path: bool,
    /// Source mtime observed when the job was queued; the engine discards
    /// the result if the file moved past it.
    pub observed_mtime: Option<SystemTime>,
}

pub struct CompletedCompile {
    pub job: CompileJob,
    pub outcome: CompileOutcome,
}

/// Dedicated compile thread; requests are strictly serialized.
pub struct CompileWorker {
    tx: Sender<CompileJob>,
    done: Receiver<CompletedCompile>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CompileWorker {
    pub fn spawn(driver: Arc<CompilerDriver>) -> CompileWorker {
        let (tx, rx) = unbounded::<CompileJob>();
        let (tx_done, done) = unbounded::<CompletedCompile>();
        let handle = std::thread::Builder::new()
            .name("respatch-compile".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let outcome =
                        driver.compile(&job.source_text, &job.module_name, job.use_fast_path);
                    if tx_done.send(CompletedCompile { job, outcome }).is_err() {
                        break;
                    }
                }
            })
            .ok();
        CompileWorker { tx, done, handle }
    }

    pub fn submit(&self, job: CompileJob) -> Result<(), PatchError> {
        self.tx.send(job).map_err(|_| PatchError::WorkerGone)
    }

    /// Drain finished compiles without blocking.
    pub fn completed(&self) -> Vec<CompletedCompile> {
        self.done.try_iter().collect()
    }

    /// Block for the next finished compile.
    pub fn wait_one(&self, timeout: std::time::Duration) -> Option<CompletedCompile> {
        self.done.recv_timeout(timeout).ok()
    }
}

impl Drop for CompileWorker {
    fn drop(&mut self) {
        // Closing the channel stops the worker loop.
        let (tx, _) = unbounded();
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
