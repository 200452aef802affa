//! Change classifier: decides whether an edited source file can take the
//! fast path (method bodies only) or needs the full structural validation.
//!
//! The scan is a single pass over the text, no parser involved. It is
//! intentionally imprecise: a missed structural change is caught downstream
//! by the inspector's compatibility check on the slow path, and a false
//! "structure changed" only costs the optimized compile.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// No cached signature for this path yet.
    FirstAnalysis,
    /// Structural signatures identical to the cached hash.
    MethodBodyOnly,
    /// Structural signatures differ from the cached hash.
    SignatureChanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::FirstAnalysis => "first analysis",
            ChangeKind::MethodBodyOnly => "method bodies only",
            ChangeKind::SignatureChanged => "signature changed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub kind: ChangeKind,
    pub reason: String,
    pub can_fast_path: bool,
}

/// SHA-256 of the full source text, base64-encoded. Shared with the patch
/// history's staleness check.
pub fn source_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Hash of the newline-joined structural signature list.
pub fn signature_hash(source: &str) -> String {
    let sigs = structural_signatures(source);
    let mut hasher = Sha256::new();
    for (i, sig) in sigs.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(sig.as_bytes());
    }
    BASE64.encode(hasher.finalize())
}

pub struct ChangeClassifier {
    cache: HashMap<PathBuf, String>,
    cache_path: Option<PathBuf>,
}

impl ChangeClassifier {
    pub fn new() -> Self {
        Self { cache: HashMap::new(), cache_path: None }
    }

    /// Classifier backed by an on-disk cache in `path|hash` line format, so
    /// verdicts survive a host reload.
    pub fn with_cache_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut cache = HashMap::new();
        if let Ok(text) = std::fs::read_to_string(&path) {
            for line in text.lines() {
                if let Some((p, h)) = line.rsplit_once('|') {
                    cache.insert(PathBuf::from(p), h.to_string());
                }
            }
        }
        Self { cache, cache_path: Some(path) }
    }

    /// Classify an edit. Returns `None` for empty source (nothing to do).
    pub fn analyze(&mut self, source_path: &Path, source_text: &str) -> Option<Verdict> {
        if source_text.trim().is_empty() {
            return None;
        }

        let new_hash = signature_hash(source_text);
        let verdict = match self.cache.get(source_path) {
            None => Verdict {
                kind: ChangeKind::FirstAnalysis,
                reason: format!("no cached signature for {}", source_path.display()),
                can_fast_path: false,
            },
            Some(old) if *old == new_hash => Verdict {
                kind: ChangeKind::MethodBodyOnly,
                reason: "structural signatures unchanged".to_string(),
                can_fast_path: true,
            },
            Some(_) => Verdict {
                kind: ChangeKind::SignatureChanged,
                reason: "structural signature hash changed".to_string(),
                can_fast_path: false,
            },
        };

        if !verdict.can_fast_path {
            self.cache.insert(source_path.to_path_buf(), new_hash);
            self.persist();
        }
        Some(verdict)
    }

    /// Drop the cached signature for a path (e.g. the file was deleted).
    pub fn forget(&mut self, source_path: &Path) {
        if self.cache.remove(source_path).is_some() {
            self.persist();
        }
    }

    fn persist(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let mut lines: Vec<String> = self
            .cache
            .iter()
            .map(|(p, h)| format!("{}|{}", p.display(), h))
            .collect();
        lines.sort();
        let body = lines.join("\n");

        // Atomic on Unix: temp file + rename.
        #[cfg(unix)]
        {
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, &body).is_ok() {
                let _ = std::fs::rename(&tmp, path);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::fs::write(path, &body);
        }
    }
}

impl Default for ChangeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the structural signature lines of a source file: type
/// declarations, method declarations, and field/property declarations,
/// normalized for whitespace.
pub fn structural_signatures(source: &str) -> Vec<String> {
    let stripped = strip_comments(source);
    let mut sigs = Vec::new();
    let mut depth: i32 = 0;

    for line in stripped.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            if is_type_decl(trimmed) {
                sigs.push(normalize(trimmed));
            } else if depth == 1 {
                // Member depth of a top-level type. Statement lines inside
                // bodies sit deeper and are skipped wholesale.
                if is_method_decl(trimmed) || is_field_or_property(trimmed) {
                    sigs.push(normalize(trimmed));
                }
            }
        }
        depth += brace_delta(line);
    }
    sigs
}

const TYPE_KEYWORDS: &[&str] = &["class", "struct", "interface", "enum"];

const CONTROL_KEYWORDS: &[&str] = &[
    "if", "else", "for", "foreach", "while", "do", "switch", "return", "using", "lock", "try",
    "catch", "finally", "yield", "throw", "break", "continue",
];

fn is_type_decl(line: &str) -> bool {
    // Modifiers come first, so look at the first few words.
    line.split_whitespace().take(4).any(|w| TYPE_KEYWORDS.contains(&w))
}

fn is_method_decl(line: &str) -> bool {
    if !line.contains('(') || !line.contains(')') {
        return false;
    }
    if line.ends_with(';') || line.ends_with('=') {
        return false;
    }
    let first = line.split_whitespace().next().unwrap_or("");
    !CONTROL_KEYWORDS.contains(&first)
}

fn is_field_or_property(line: &str) -> bool {
    if line.contains("get;") || line.contains("set;") {
        return true;
    }
    line.ends_with(';') && !line.contains('(')
}

fn normalize(line: &str) -> String {
    let line = match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    };
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Brace balance of a line, ignoring braces inside string literals.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_str = false;
    let mut prev_escape = false;
    for c in line.chars() {
        if in_str {
            if prev_escape {
                prev_escape = false;
            } else if c == '\\' {
                prev_escape = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// Remove `//` line comments and `/* */` block comments, preserving line
/// structure so brace depth still lines up.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let bytes = source.as_bytes();
    let mut i = 0;
    let mut in_block = false;
    let mut in_str = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_block {
            if c == '\n' {
                out.push('\n');
            }
            if c == '*' && bytes.get(i + 1) == Some(&b'/') {
                in_block = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if in_str {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = bytes.get(i + 1) {
                    out.push(next as char);
                    i += 2;
                    continue;
                }
            } else if c == '"' {
                in_str = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_str = true;
                out.push(c);
                i += 1;
            }
            '/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                in_block = true;
                i += 2;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}
