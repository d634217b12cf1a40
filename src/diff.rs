//! Version-tracking database and binary diff generation (§4.9).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Error};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::checksum::{digest_file, HashAlgo};
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub canonical_path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAlgorithm {
    Xdelta3,
    Bsdiff,
    Rsync,
}

impl DiffAlgorithm {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "xdelta3" => Some(DiffAlgorithm::Xdelta3),
            "bsdiff" => Some(DiffAlgorithm::Bsdiff),
            "rsync" => Some(DiffAlgorithm::Rsync),
            _ => None,
        }
    }

    fn binary(self) -> &'static str {
        match self {
            DiffAlgorithm::Xdelta3 => "xdelta3",
            DiffAlgorithm::Bsdiff => "bsdiff",
            DiffAlgorithm::Rsync => "rsync",
        }
    }
}

/// The `var/file_versions.json` database: `canonicalPath → VersionRecord`.
#[derive(Debug, Default)]
pub struct VersionDb {
    records: BTreeMap<PathBuf, VersionRecord>,
    path: PathBuf,
}

impl VersionDb {
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(VersionDb { records: BTreeMap::new(), path: path.to_path_buf() });
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read version database {path:?}"))?;
        let records: BTreeMap<PathBuf, VersionRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse version database {path:?}"))?;
        Ok(VersionDb { records, path: path.to_path_buf() })
    }

    pub fn get(&self, canonical_path: &Path) -> Option<&VersionRecord> {
        self.records.get(canonical_path)
    }

    pub fn insert(&mut self, record: VersionRecord) {
        self.records.insert(record.canonical_path.clone(), record);
    }

    /// Rewrites the database atomically: write to a sibling temp file, then
    /// rename over the original.
    pub fn save(&self) -> Result<(), Error> {
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
        }
        let serialized = serde_json::to_string_pretty(&self.records)
            .context("failed to serialize version database")?;
        fs::write(&tmp, serialized)
            .with_context(|| format!("failed to write {tmp:?}"))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to install version database {:?}", self.path))?;
        Ok(())
    }
}

/// Drives §4.9 for one archive-stage file, called *before* promotion
/// overwrites `mirror/<canonical_path>` with the freshly staged content.
/// `old_file` is therefore the still-live previous mirror copy and `new_file`
/// is the freshly fetched `skel/` copy; diffing them before the overwrite
/// means no separate old-content snapshot needs to be retained. Hashes
/// `new_file`, compares against the prior database record, and on change
/// invokes the configured external diff tool. Returns `true` if a new diff
/// was written. The version database is updated with the new record
/// regardless of whether a diff was generated.
pub fn process_changed_file(
    db: &mut VersionDb,
    old_file: Option<&Path>,
    new_file: &Path,
    canonical_path: &Path,
    diffs_root: &Path,
    algorithm: DiffAlgorithm,
    max_diff_size_ratio: f64,
    now: i64,
) -> Result<bool, Error> {
    let new_sha256 = digest_file(new_file, HashAlgo::Sha256)?;
    let new_size = fs::metadata(new_file)
        .with_context(|| format!("failed to stat {new_file:?}"))?
        .len();

    let prior = db.get(canonical_path).cloned();
    let changed = prior.as_ref().map(|p| p.sha256 != new_sha256).unwrap_or(true);

    let mut wrote_diff = false;

    if changed {
        if let Some(old_file) = old_file.filter(|p| p.is_file()) {
            let mut diff_name = canonical_path.as_os_str().to_os_string();
            diff_name.push(".diff");
            let diff_path = diffs_root.join(diff_name);
            wrote_diff =
                generate_diff(algorithm, old_file, new_file, &diff_path, max_diff_size_ratio)?;
        }

        db.insert(VersionRecord {
            canonical_path: canonical_path.to_path_buf(),
            size: new_size,
            sha256: new_sha256,
            timestamp: now,
        });
    }

    Ok(wrote_diff)
}

/// Invokes the configured external tool to diff `old` against `new`, writing
/// the result to `out`. Retains the diff only if it is strictly smaller than
/// `max_diff_size_ratio * new_size`; otherwise deletes it. Returns whether the
/// diff was retained.
pub fn generate_diff(
    algorithm: DiffAlgorithm,
    old: &Path,
    new: &Path,
    out: &Path,
    max_diff_size_ratio: f64,
) -> Result<bool, Error> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
    }

    let status = match algorithm {
        DiffAlgorithm::Xdelta3 => Command::new("xdelta3")
            .args(["-e", "-s"])
            .arg(old)
            .arg(new)
            .arg(out)
            .status(),
        DiffAlgorithm::Bsdiff => Command::new("bsdiff").arg(old).arg(new).arg(out).status(),
        DiffAlgorithm::Rsync => Command::new("rsync")
            .arg("--only-write-batch")
            .arg(out)
            .arg(new)
            .arg(old)
            .status(),
    };

    let status = match status {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ExternalToolMissing(algorithm.binary().to_string()).into());
        }
        Err(e) => return Err(EngineError::Io(e.to_string()).into()),
    };

    if !status.success() {
        warn!("{} exited with {status}", algorithm.binary());
        let _ = fs::remove_file(out);
        return Ok(false);
    }

    let new_size = fs::metadata(new).map(|m| m.len()).unwrap_or(0);
    let diff_size = fs::metadata(out).map(|m| m.len()).unwrap_or(u64::MAX);

    if (diff_size as f64) < max_diff_size_ratio * (new_size as f64) {
        Ok(true)
    } else {
        let _ = fs::remove_file(out);
        Ok(false)
    }
}

/// Checks whether the diff tool's binary can be located, without running a
/// real diff. Used once per run to decide whether to disable diffing after a
/// missing-tool failure (§7: "logged once, the dependent feature is disabled
/// for the remainder of the run").
pub fn tool_available(algorithm: DiffAlgorithm) -> bool {
    Command::new(algorithm.binary())
        .arg("--help")
        .output()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_db_roundtrips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file_versions.json");
        let mut db = VersionDb { records: BTreeMap::new(), path: path.clone() };
        db.insert(VersionRecord {
            canonical_path: PathBuf::from("pool/main/h/hello.deb"),
            size: 1234,
            sha256: "abc".into(),
            timestamp: 1000,
        });
        db.save().unwrap();

        let reloaded = VersionDb::load(&path).unwrap();
        let record = reloaded.get(Path::new("pool/main/h/hello.deb")).unwrap();
        assert_eq!(record.size, 1234);
        assert_eq!(record.sha256, "abc");
    }

    #[test]
    fn missing_db_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = VersionDb::load(&dir.path().join("nope.json")).unwrap();
        assert!(db.get(Path::new("anything")).is_none());
    }

    #[test]
    fn diff_algorithm_parses_known_names() {
        assert_eq!(DiffAlgorithm::from_config_value("xdelta3"), Some(DiffAlgorithm::Xdelta3));
        assert_eq!(DiffAlgorithm::from_config_value("BSDIFF"), Some(DiffAlgorithm::Bsdiff));
        assert_eq!(DiffAlgorithm::from_config_value("nonsense"), None);
    }
}
