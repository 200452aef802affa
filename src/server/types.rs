//! Wire and result types for the compile service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler::CompileTimings;
use crate::diagnostics::Diagnostic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    pub source_text: String,
    pub module_name: String,
    pub use_fast_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResponse {
    pub ok: bool,
    pub image_bytes: Option<Vec<u8>>,
    pub diagnostics: Vec<Diagnostic>,
    pub timings: CompileTimings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub reference_count: usize,
    pub compiles_served: u64,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Frames exchanged with the out-of-process worker.
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerRequest {
    Compile(CompileRequest),
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    Compile(CompileResponse),
    Status(ServiceStatus),
}
