//! In-process compile service: direct calls into the driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compiler::CompilerDriver;
use crate::server::CompileService;
use crate::server::types::{CompileRequest, CompileResponse, ServiceError, ServiceStatus};

pub struct InProcessCompiler {
    driver: Arc<CompilerDriver>,
    served: AtomicU64,
}

impl InProcessCompiler {
    pub fn new(driver: Arc<CompilerDriver>) -> InProcessCompiler {
        InProcessCompiler { driver, served: AtomicU64::new(0) }
    }
}

impl CompileService for InProcessCompiler {
    fn compile_source(&self, request: CompileRequest) -> Result<CompileResponse, ServiceError> {
        let outcome = self.driver.compile(
            &request.source_text,
            &request.module_name,
            request.use_fast_path,
        );
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(CompileResponse {
            ok: outcome.ok,
            image_bytes: outcome.image_bytes,
            diagnostics: outcome.diagnostics,
            timings: outcome.timings,
        })
    }

    fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            reference_count: self.driver.references().paths.len(),
            compiles_served: self.served.load(Ordering::Relaxed),
        })
    }
}
