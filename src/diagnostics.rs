use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::span::Span;

/// Error raised by the in-tree bytecode toolchain.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Syntax error: {msg}")]
    Syntax { msg: String, span: Span },

    #[error("Lowering error: {msg}")]
    Lower { msg: String, span: Span },
}

impl CompileError {
    pub fn syntax(msg: impl Into<String>, span: Span) -> Self {
        Self::Syntax { msg: msg.into(), span }
    }

    pub fn lower(msg: impl Into<String>, span: Span) -> Self {
        Self::Lower { msg: msg.into(), span }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::Syntax { span, .. } | Self::Lower { span, .. } => *span,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Syntax { msg, .. } | Self::Lower { msg, .. } => msg,
        }
    }
}

/// Error raised by the patch engine around an apply.
///
/// Only two kinds are fatal for an apply: the runtime assembly being absent
/// and the compiled image being unreadable. Everything else degrades to a
/// per-method skip aggregated in the apply result.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("runtime assembly not loaded: {name}")]
    AssemblyMissing { name: String },

    #[error("compiled image unreadable: {reason}")]
    ImageUnreadable { reason: String },

    #[error("incompatible structural change: {reason}")]
    Incompatible { reason: String },

    #[error("source unreachable: {path}: {source}")]
    SourceUnreachable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("history store error: {0}")]
    History(String),

    #[error("settings error: {0}")]
    Config(String),

    #[error("watcher error: {0}")]
    Watch(String),

    #[error("compile worker gone")]
    WorkerGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol-agnostic diagnostic, as surfaced by the compile service and the
/// apply summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub span: Option<DiagnosticSpan>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiagnosticSpan {
    pub start: usize,
    pub end: usize,
}

impl Diagnostic {
    pub fn from_compile_error(err: &CompileError) -> Self {
        let span = err.span();
        Diagnostic {
            message: err.to_string(),
            span: Some(DiagnosticSpan { start: span.start, end: span.end }),
        }
    }

    pub fn message_only(message: impl Into<String>) -> Self {
        Diagnostic { message: message.into(), span: None }
    }
}

/// Render a toolchain error with ariadne for terminal output.
pub fn render_error(source: &str, err: &CompileError) {
    use ariadne::{Label, Report, ReportKind, Source};

    let span = err.span();
    let kind = match err {
        CompileError::Syntax { .. } => "syntax",
        CompileError::Lower { .. } => "lowering",
    };
    let report = Report::build(ReportKind::Error, (), span.start)
        .with_message(format!("{kind} error"))
        .with_label(Label::new(span.start..span.end).with_message(err.message()))
        .finish();
    let _ = report.eprint(Source::from(source));
}

/// Collapse a list of per-method failures into the single user-facing summary
/// the engine logs: a count plus the first few lines of detail.
pub fn summarize_errors(errors: &[String], max_lines: usize) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let mut out = format!("{} method(s) could not be patched:", errors.len());
    for line in errors.iter().take(max_lines) {
        out.push_str("\n  ");
        out.push_str(line);
    }
    if errors.len() > max_lines {
        out.push_str(&format!("\n  ... and {} more", errors.len() - max_lines));
    }
    out
}
