//! Compile service API.
//!
//! `CompileService` is the protocol-agnostic face of the compiler driver.
//! Two implementations exist:
//! - `InProcessCompiler`: direct calls into the driver, the default.
//! - `RemoteCompiler`: the out-of-process variant, speaking length-prefixed
//!   bincode frames to a `WorkerServer` on the configured TCP port.

pub mod in_process;
pub mod remote;
pub mod types;

pub use in_process::InProcessCompiler;
pub use remote::{RemoteCompiler, WorkerServer};

use types::{CompileRequest, CompileResponse, ServiceError, ServiceStatus};

/// Protocol-agnostic compiler operations.
pub trait CompileService {
    /// Compile one source text into a module image.
    fn compile_source(&self, request: CompileRequest) -> Result<CompileResponse, ServiceError>;

    /// Liveness and bookkeeping for status displays.
    fn status(&self) -> Result<ServiceStatus, ServiceError>;
}
