use std::sync::Arc;

use respatch::compiler::{CompilerDriver, ReferenceSet};
use respatch::image::ModuleImage;
use respatch::server::types::CompileRequest;
use respatch::server::{CompileService, InProcessCompiler, RemoteCompiler, WorkerServer};

const SRC: &str = "class C { void Tick() { print(\"a\"); } }";

fn driver() -> Arc<CompilerDriver> {
    Arc::new(CompilerDriver::new(ReferenceSet::default()))
}

fn request(fast: bool) -> CompileRequest {
    CompileRequest {
        source_text: SRC.to_string(),
        module_name: "Scripts".to_string(),
        use_fast_path: fast,
    }
}

#[test]
fn in_process_service_compiles() {
    let service = InProcessCompiler::new(driver());
    let response = service.compile_source(request(true)).unwrap();
    assert!(response.ok);
    let image = ModuleImage::from_bytes(&response.image_bytes.unwrap()).unwrap();
    assert_eq!(image.name, "Scripts");
}

#[test]
fn remote_worker_round_trip() {
    let server = WorkerServer::bind(0, driver()).unwrap();
    let client = RemoteCompiler::connect_to(server.addr());

    let response = client.compile_source(request(true)).unwrap();
    assert!(response.ok);
    let image = ModuleImage::from_bytes(&response.image_bytes.unwrap()).unwrap();
    assert_eq!(image.types[0].full_name, "C");

    let status = client.status().unwrap();
    assert_eq!(status.compiles_served, 1);
}

#[test]
fn remote_worker_reports_diagnostics() {
    let server = WorkerServer::bind(0, driver()).unwrap();
    let client = RemoteCompiler::connect_to(server.addr());

    let response = client
        .compile_source(CompileRequest {
            source_text: "class C { void T() { nope(); } }".to_string(),
            module_name: "Scripts".to_string(),
            use_fast_path: false,
        })
        .unwrap();
    assert!(!response.ok);
    assert!(!response.diagnostics.is_empty());
    assert!(response.image_bytes.is_none());
}

#[test]
fn remote_worker_serves_sequential_requests() {
    let server = WorkerServer::bind(0, driver()).unwrap();
    let client = RemoteCompiler::connect_to(server.addr());

    for _ in 0..5 {
        assert!(client.compile_source(request(true)).unwrap().ok);
    }
    assert_eq!(client.status().unwrap().compiles_served, 5);
}

#[test]
fn worker_shutdown_is_clean() {
    let server = WorkerServer::bind(0, driver()).unwrap();
    let addr = server.addr();
    drop(server);
    // The port is released once the server is gone; connecting either
    // fails or yields an immediately-closed stream.
    let client = RemoteCompiler::connect_to(addr);
    assert!(client.compile_source(request(true)).is_err());
}
