//! Out-of-process compile worker.
//!
//! The worker listens on the configured TCP port and serves
//! length-prefixed bincode frames: `u32 LE length` + encoded
//! `WorkerRequest`/`WorkerResponse`. Connections are handled one at a
//! time; compile requests stay serialized, the same policy the
//! in-process worker thread applies. The worker is force-terminated with
//! the host; `WorkerServer`'s drop wakes the accept loop and joins it.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::compiler::CompilerDriver;
use crate::server::CompileService;
use crate::server::types::{
    CompileRequest, CompileResponse, ServiceError, ServiceStatus, WorkerRequest, WorkerResponse,
};

const MAX_FRAME: u32 = 64 * 1024 * 1024;

fn write_frame<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), ServiceError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ServiceError::Protocol(e.to_string()))?;
    let len = u32::try_from(bytes.len()).map_err(|_| ServiceError::Protocol("frame too large".into()))?;
    stream
        .write_all(&len.to_le_bytes())
        .and_then(|_| stream.write_all(&bytes))
        .map_err(|e| ServiceError::Transport(e.to_string()))
}

fn read_frame<T: serde::de::DeserializeOwned>(stream: &mut TcpStream) -> Result<Option<T>, ServiceError> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ServiceError::Transport(e.to_string())),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(ServiceError::Protocol(format!("oversized frame: {len} bytes")));
    }
    let mut bytes = vec![0u8; len as usize];
    stream
        .read_exact(&mut bytes)
        .map_err(|e| ServiceError::Transport(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| ServiceError::Protocol(e.to_string()))?;
    Ok(Some(value))
}

/// The worker's server side.
pub struct WorkerServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WorkerServer {
    /// Bind on `port` (0 picks an ephemeral one) and serve in a background
    /// thread.
    pub fn bind(port: u16, driver: Arc<CompilerDriver>) -> Result<WorkerServer, ServiceError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let addr = listener.local_addr().map_err(|e| ServiceError::Transport(e.to_string()))?;
        let stop = Arc::new(AtomicBool::new(false));

        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("respatch-worker".to_string())
            .spawn(move || {
                let served = AtomicU64::new(0);
                for stream in listener.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(mut stream) = stream else {
                        continue;
                    };
                    if let Err(err) = serve_connection(&mut stream, &driver, &served) {
                        log::warn!(target: "respatch::compiler", "worker connection error: {err}");
                    }
                }
            })
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        log::info!(target: "respatch::compiler", "compile worker listening on {addr}");
        Ok(WorkerServer { addr, stop, handle: Some(handle) })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(
    stream: &mut TcpStream,
    driver: &CompilerDriver,
    served: &AtomicU64,
) -> Result<(), ServiceError> {
    while let Some(request) = read_frame::<WorkerRequest>(stream)? {
        let response = match request {
            WorkerRequest::Compile(req) => {
                let outcome = driver.compile(&req.source_text, &req.module_name, req.use_fast_path);
                served.fetch_add(1, Ordering::Relaxed);
                WorkerResponse::Compile(CompileResponse {
                    ok: outcome.ok,
                    image_bytes: outcome.image_bytes,
                    diagnostics: outcome.diagnostics,
                    timings: outcome.timings,
                })
            }
            WorkerRequest::Status => WorkerResponse::Status(ServiceStatus {
                reference_count: driver.references().paths.len(),
                compiles_served: served.load(Ordering::Relaxed),
            }),
        };
        write_frame(stream, &response)?;
    }
    Ok(())
}

/// Client side of the out-of-process worker.
pub struct RemoteCompiler {
    addr: SocketAddr,
}

impl RemoteCompiler {
    pub fn connect_to(addr: SocketAddr) -> RemoteCompiler {
        RemoteCompiler { addr }
    }

    fn round_trip(&self, request: &WorkerRequest) -> Result<WorkerResponse, ServiceError> {
        let mut stream =
            TcpStream::connect(self.addr).map_err(|e| ServiceError::Transport(e.to_string()))?;
        write_frame(&mut stream, request)?;
        read_frame(&mut stream)?.ok_or_else(|| ServiceError::Transport("worker closed connection".into()))
    }
}

impl CompileService for RemoteCompiler {
    fn compile_source(&self, request: CompileRequest) -> Result<CompileResponse, ServiceError> {
        match self.round_trip(&WorkerRequest::Compile(request))? {
            WorkerResponse::Compile(response) => Ok(response),
            other => Err(ServiceError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    fn status(&self) -> Result<ServiceStatus, ServiceError> {
        match self.round_trip(&WorkerRequest::Status)? {
            WorkerResponse::Status(status) => Ok(status),
            other => Err(ServiceError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }
}
