//! File watcher: debounced source-change events for the engine.
//!
//! The watcher owns debounce and filtering; the engine only ever sees a
//! settled path. Events for non-source files, editor-only subtrees, and
//! generated files never leave this module.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use notify::{Event, RecursiveMode, Watcher};

use crate::diagnostics::PatchError;
use crate::settings::ReloadSettings;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub root: PathBuf,
    pub extension: String,
    pub excluded_dirs: Vec<String>,
    pub generated_suffixes: Vec<String>,
    pub debounce: Duration,
}

impl WatchConfig {
    pub fn from_settings(root: impl Into<PathBuf>, settings: &ReloadSettings) -> WatchConfig {
        WatchConfig {
            root: root.into(),
            extension: settings.source_extension.clone(),
            excluded_dirs: settings.excluded_dirs.clone(),
            generated_suffixes: settings.generated_suffixes.clone(),
            debounce: Duration::from_millis(settings.debounce_ms),
        }
    }

    /// Whether a changed path is a reloadable source file.
    pub fn accepts(&self, path: &Path) -> bool {
        if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
            return false;
        }
        for dir in &self.excluded_dirs {
            if path
                .components()
                .any(|c| c.as_os_str().to_string_lossy() == dir.as_str())
            {
                return false;
            }
        }
        let text = path.to_string_lossy();
        for suffix in &self.generated_suffixes {
            if text.ends_with(suffix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A running watcher. Dropping it stops the notify backend; the debounce
/// thread exits once the event channel closes.
pub struct SourceWatcher {
    _watcher: notify::RecommendedWatcher,
    pub events: Receiver<PathBuf>,
}

/// Watch `config.root` recursively, delivering each settled source path on
/// the returned channel after at least `config.debounce` of quiet.
pub fn watch_sources(config: WatchConfig) -> Result<SourceWatcher, PatchError> {
    let (raw_tx, raw_rx) = unbounded::<PathBuf>();
    let (tx, events) = unbounded::<PathBuf>();

    let filter = config.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
        ) {
            return;
        }
        for path in event.paths {
            if filter.accepts(&path) {
                let _ = raw_tx.send(path);
            }
        }
    })
    .map_err(|e| PatchError::Watch(format!("failed to create file watcher: {e}")))?;

    watcher
        .watch(&config.root, RecursiveMode::Recursive)
        .map_err(|e| PatchError::Watch(format!("failed to watch {}: {e}", config.root.display())))?;

    let debounce = config.debounce;
    std::thread::Builder::new()
        .name("respatch-watch".to_string())
        .spawn(move || debounce_loop(raw_rx, tx, debounce))
        .map_err(PatchError::Io)?;

    Ok(SourceWatcher { _watcher: watcher, events })
}

/// Collect raw events per file and emit once a file has been quiet for the
/// debounce window.
fn debounce_loop(raw: Receiver<PathBuf>, out: Sender<PathBuf>, debounce: Duration) {
    let mut last_seen: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let timeout = if last_seen.is_empty() {
            Duration::from_secs(3600)
        } else {
            debounce / 2
        };
        select! {
            recv(raw) -> msg => match msg {
                Ok(path) => {
                    last_seen.insert(path, Instant::now());
                }
                Err(_) => return,
            },
            default(timeout) => {}
        }

        let now = Instant::now();
        let ready: Vec<PathBuf> = last_seen
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= debounce)
            .map(|(p, _)| p.clone())
            .collect();
        for path in ready {
            last_seen.remove(&path);
            if out.send(path).is_err() {
                return;
            }
        }
    }
}
