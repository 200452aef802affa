use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use respatch::compiler::{CompilerDriver, ReferenceSet};
use respatch::engine::ReloadEngine;
use respatch::host::{HostServices, RuntimeCtx, SimHost};
use respatch::server::WorkerServer;
use respatch::settings::ReloadSettings;
use respatch::watch::{WatchConfig, watch_sources};

#[derive(Parser)]
#[command(name = "respatch", about = "Hot code reload engine for managed script modules")]
struct Cli {
    /// Settings file (TOML); defaults apply when absent.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a project root and hot-patch the demo host on every edit
    Watch {
        /// Project root containing source files
        root: PathBuf,
        /// Keep the terminal scrollback between reloads
        #[arg(long)]
        no_clear: bool,
    },
    /// Run the out-of-process compile worker
    Worker {
        /// TCP port to listen on (0 picks one)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Compile a single source file and write the module image
    Compile {
        /// Source file path
        file: PathBuf,
        /// Output image path
        #[arg(short, long, default_value = "out.img")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let settings = cli
        .settings
        .as_deref()
        .map(ReloadSettings::load_or_default)
        .unwrap_or_default();

    env_logger::Builder::new().parse_filters(&settings.log_filter()).init();

    match cli.command {
        Commands::Watch { root, no_clear } => watch_command(root, no_clear, settings),
        Commands::Worker { port } => worker_command(port, settings),
        Commands::Compile { file, output } => compile_command(file, output),
    }
}

/// Demo loop: load every source under the root into one script assembly,
/// spawn a component per class, then reload files as they change.
fn watch_command(root: PathBuf, no_clear: bool, settings: ReloadSettings) {
    let sources = collect_sources(&root, &settings);
    if sources.is_empty() {
        eprintln!("no .{} sources under {}", settings.source_extension, root.display());
        std::process::exit(1);
    }

    let combined = sources
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .collect::<Vec<_>>()
        .join("\n");
    let image = match respatch::compile_source(&combined, "Scripts", true) {
        Ok(image) => image,
        Err(err) => {
            respatch::diagnostics::render_error(&combined, &err);
            std::process::exit(1);
        }
    };

    let ctx = RuntimeCtx::new();
    let host = SimHost::new(Arc::clone(&ctx));
    let class_names: Vec<String> = image.types.iter().map(|t| t.full_name.clone()).collect();
    host.load_assembly(image);
    for class in &class_names {
        if let Err(err) = host.spawn("Scripts", class) {
            eprintln!("could not spawn {class}: {err}");
        }
    }

    let engine = match ReloadEngine::new(host.clone() as Arc<dyn HostServices>, ctx, settings.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    engine.replay_history();

    let watcher = match watch_sources(WatchConfig::from_settings(&root, &settings)) {
        Ok(watcher) => watcher,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    println!("Watching {} for changes...", root.display());

    loop {
        while let Ok(path) = watcher.events.try_recv() {
            if !no_clear {
                clearscreen::clear().ok();
            }
            println!("File changed: {}", path.display());
            engine.request_reload(&path);
        }
        for report in engine.pump() {
            match report.result {
                Some(result) => println!("{}", result.summary(settings.max_error_lines)),
                None => {
                    for d in report.diagnostics.iter().take(settings.max_error_lines) {
                        eprintln!("error: {}", d.message);
                    }
                }
            }
        }
        engine.pump_scanner();
        host.tick();
        for line in host.take_output() {
            println!("{line}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn worker_command(port: Option<u16>, settings: ReloadSettings) {
    let driver = Arc::new(CompilerDriver::new(ReferenceSet::default()));
    let server = match WorkerServer::bind(port.unwrap_or(settings.worker_port), driver) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    println!("compile worker on port {}", server.port());
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn compile_command(file: PathBuf, output: PathBuf) {
    let source = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read '{}': {e}", file.display());
            std::process::exit(1);
        }
    };

    match respatch::compile_source(&source, "Scripts", true) {
        Ok(image) => match image.to_bytes().map(|bytes| std::fs::write(&output, bytes)) {
            Ok(Ok(())) => println!("wrote {}", output.display()),
            Ok(Err(e)) => {
                eprintln!("error: could not write '{}': {e}", output.display());
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        Err(err) => {
            respatch::diagnostics::render_error(&source, &err);
            std::process::exit(1);
        }
    }
}

fn collect_sources(root: &PathBuf, settings: &ReloadSettings) -> Vec<PathBuf> {
    let config = WatchConfig::from_settings(root, settings);
    let mut sources = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if config.accepts(&path) {
                sources.push(path);
            }
        }
    }
    sources.sort();
    sources
}
