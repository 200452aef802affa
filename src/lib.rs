//! respatch: in-place hot code reload for a managed bytecode runtime.
//!
//! While a host process is live, single source files are recompiled and the
//! new method bodies spliced into already-loaded modules: no unload, no
//! relink, no restart. The pipeline per edit: classify the change
//! (fast/slow path), compile off the main thread, plan against the loaded
//! runtime module, rewrite each body into the runtime's reference space,
//! install detours/trampolines/dispatcher registrations, and persist the
//! patch for replay after a host-triggered reload.

pub mod classifier;
pub mod compiler;
pub mod diagnostics;
pub mod dispatch;
pub mod engine;
pub mod entrypoints;
pub mod field_store;
pub mod history;
pub mod host;
pub mod image;
pub mod inspect;
pub mod install;
pub mod keys;
pub mod lexer;
pub mod lower;
#[cfg(all(unix, target_arch = "x86_64"))]
pub mod native;
pub mod parser;
pub mod rewrite;
pub mod runtime;
pub mod server;
pub mod settings;
pub mod span;
pub mod watch;

use diagnostics::CompileError;
use image::ModuleImage;

/// One-shot compile of a source text into a module image.
pub fn compile_source(
    source: &str,
    module_name: &str,
    optimize: bool,
) -> Result<ModuleImage, CompileError> {
    let tokens = lexer::lex(source)?;
    let unit = parser::Parser::new(&tokens, source).parse_unit()?;
    lower::lower_unit(&unit, module_name, &lower::LowerOptions { optimize })
}
