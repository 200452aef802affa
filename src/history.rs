//! Persistent patch history.
//!
//! A host-triggered reload tears down every installed hook; the history
//! replays surviving patches on startup. Each record pairs a JSON index
//! entry with the patch image bytes on disk, keyed by
//! `(source_path, assembly)`: recording a new patch for the same pair
//! deletes the prior record and its image.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::source_hash;
use crate::diagnostics::PatchError;
use crate::image::ModuleImage;
use crate::inspect::TokenPair;
use crate::install::PatchApplyResult;

pub const INDEX_FILE: &str = "patches.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub patch_id: Uuid,
    pub assembly_name: String,
    pub source_path: PathBuf,
    pub source_hash: String,
    pub patch_image_path: PathBuf,
    pub runtime_module_uuid: Uuid,
    pub token_pairs: Vec<TokenPair>,
    pub utc_timestamp: u64,
}

pub struct PatchHistory {
    dir: PathBuf,
}

impl PatchHistory {
    pub fn open(dir: impl Into<PathBuf>) -> Result<PatchHistory, PatchError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(PatchHistory { dir })
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn records(&self) -> Vec<PatchRecord> {
        let Ok(text) = std::fs::read_to_string(self.index_path()) else {
            return Vec::new();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }

    fn save(&self, records: &[PatchRecord]) -> Result<(), PatchError> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| PatchError::History(e.to_string()))?;
        let tmp = self.index_path().with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    /// Persist an apply that installed at least one patch. Prior records for
    /// the same `(source, assembly)` pair are removed first, files included.
    pub fn record(
        &self,
        source_path: &Path,
        source_text: &str,
        result: &PatchApplyResult,
        image_bytes: &[u8],
    ) -> Result<PatchRecord, PatchError> {
        let mut records = self.records();
        records.retain(|r| {
            let same = r.source_path == source_path && r.assembly_name == result.assembly;
            if same {
                let _ = std::fs::remove_file(&r.patch_image_path);
            }
            !same
        });

        let patch_id = Uuid::new_v4();
        let patch_image_path = self.dir.join(format!("{patch_id}.img"));
        std::fs::write(&patch_image_path, image_bytes)?;

        let record = PatchRecord {
            patch_id,
            assembly_name: result.assembly.clone(),
            source_path: source_path.to_path_buf(),
            source_hash: source_hash(source_text),
            patch_image_path,
            runtime_module_uuid: result.runtime_module_uuid,
            token_pairs: result.token_pairs.clone(),
            utc_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        records.push(record.clone());
        self.save(&records)?;
        log::debug!(target: "respatch::general", "recorded patch {patch_id} for {}", source_path.display());
        Ok(record)
    }

    /// Records worth replaying, oldest first. A record is valid iff its
    /// source file still exists and hashes to the recorded value; stale
    /// records and their images are deleted here.
    pub fn valid_records(&self) -> Vec<PatchRecord> {
        let records = self.records();
        let mut valid = Vec::new();
        let mut dropped = 0usize;

        for record in records {
            let current = std::fs::read_to_string(&record.source_path).ok().map(|t| source_hash(&t));
            let image_exists = record.patch_image_path.exists();
            if image_exists && current.as_deref() == Some(record.source_hash.as_str()) {
                valid.push(record);
            } else {
                let _ = std::fs::remove_file(&record.patch_image_path);
                dropped += 1;
            }
        }

        if dropped > 0 {
            log::info!(target: "respatch::general", "dropped {dropped} stale patch record(s)");
            let _ = self.save(&valid);
        }
        valid.sort_by_key(|r| r.utc_timestamp);
        valid
    }

    pub fn load_image(&self, record: &PatchRecord) -> Result<ModuleImage, PatchError> {
        let bytes = std::fs::read(&record.patch_image_path)?;
        ModuleImage::from_bytes(&bytes)
            .map_err(|e| PatchError::ImageUnreadable { reason: e.to_string() })
    }

    pub fn clear(&self) -> Result<(), PatchError> {
        for record in self.records() {
            let _ = std::fs::remove_file(&record.patch_image_path);
        }
        self.save(&[])
    }
}
