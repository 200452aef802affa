//! Engine settings: the single enable flag, log levels and categories, the
//! compile-worker port, and the watcher's path filters. Loaded from a TOML
//! file when present; every field has a default.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diagnostics::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Compiler,
    Detector,
    Rewriter,
    Installer,
    Dispatcher,
    General,
}

impl LogCategory {
    pub const ALL: [LogCategory; 6] = [
        LogCategory::Compiler,
        LogCategory::Detector,
        LogCategory::Rewriter,
        LogCategory::Installer,
        LogCategory::Dispatcher,
        LogCategory::General,
    ];

    /// Log target for this category.
    pub fn target(self) -> &'static str {
        match self {
            LogCategory::Compiler => "respatch::compiler",
            LogCategory::Detector => "respatch::detector",
            LogCategory::Rewriter => "respatch::rewriter",
            LogCategory::Installer => "respatch::installer",
            LogCategory::Dispatcher => "respatch::dispatcher",
            LogCategory::General => "respatch::general",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target().trim_start_matches("respatch::"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSettings {
    /// The single operational switch.
    pub enabled: bool,
    pub log_level: String,
    pub log_categories: Vec<LogCategory>,
    /// TCP port of the out-of-process compile worker; 0 compiles in-process.
    pub worker_port: u16,
    pub source_extension: String,
    pub debounce_ms: u64,
    /// Editor-only subtrees the watcher ignores.
    pub excluded_dirs: Vec<String>,
    /// Generated-file suffixes the watcher ignores.
    pub generated_suffixes: Vec<String>,
    /// Root for the signature cache and the patch history.
    pub state_dir: PathBuf,
    /// Detail lines shown in a user-facing apply summary.
    pub max_error_lines: usize,
    /// Script assembly override; otherwise the host maps sources.
    pub assembly: Option<String>,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
            log_categories: LogCategory::ALL.to_vec(),
            worker_port: 0,
            source_extension: "cs".to_string(),
            debounce_ms: 300,
            excluded_dirs: vec!["Editor".to_string()],
            generated_suffixes: vec![".g.cs".to_string(), ".generated.cs".to_string()],
            state_dir: PathBuf::from(".respatch"),
            max_error_lines: 5,
            assembly: None,
        }
    }
}

impl ReloadSettings {
    pub fn load(path: &Path) -> Result<ReloadSettings, PatchError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| PatchError::Config(format!("bad settings file: {e}")))
    }

    pub fn load_or_default(path: &Path) -> ReloadSettings {
        Self::load(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| PatchError::Config(format!("cannot serialize settings: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn signature_cache_path(&self) -> PathBuf {
        self.state_dir.join("signatures.txt")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.state_dir.join("history")
    }

    /// `env_logger`-style filter string honoring level and categories.
    pub fn log_filter(&self) -> String {
        self.log_categories
            .iter()
            .map(|c| format!("{}={}", c.target(), self.log_level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = ReloadSettings::default();
        assert!(s.enabled);
        assert_eq!(s.source_extension, "cs");
        assert_eq!(s.debounce_ms, 300);
        assert_eq!(s.log_categories.len(), 6);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("respatch.toml");

        let mut s = ReloadSettings::default();
        s.worker_port = 7071;
        s.assembly = Some("Scripts".to_string());
        s.save(&path).unwrap();

        let loaded = ReloadSettings::load(&path).unwrap();
        assert_eq!(loaded.worker_port, 7071);
        assert_eq!(loaded.assembly.as_deref(), Some("Scripts"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("respatch.toml");
        std::fs::write(&path, "enabled = false\n").unwrap();
        let loaded = ReloadSettings::load(&path).unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.debounce_ms, 300);
    }

    #[test]
    fn log_filter_lists_categories() {
        let s = ReloadSettings::default();
        let filter = s.log_filter();
        assert!(filter.contains("respatch::compiler=info"));
        assert!(filter.contains("respatch::dispatcher=info"));
    }
}
