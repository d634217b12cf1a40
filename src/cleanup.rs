//! Cleanup collaborator: identifies `mirror/ \ skipClean` and either emits a
//! shell script or executes autoclean directly (§4.8, §6).

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::info;
use walkdir::WalkDir;

use crate::error::EngineError;

/// Walks `mirror_root` and returns every regular file's path relative to it
/// that is not present in `skip_clean`.
pub fn stale_files(mirror_root: &Path, skip_clean: &HashSet<PathBuf>) -> Vec<PathBuf> {
    WalkDir::new(mirror_root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(mirror_root).ok().map(Path::to_path_buf))
        .filter(|relative| !skip_clean.contains(relative))
        .collect()
}

/// Renders a `#!/bin/sh` script that removes every stale file, matching the
/// original tool's generated cleanup script.
pub fn render_script(mirror_root: &Path, stale: &[PathBuf]) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for path in stale {
        let _ = writeln!(script, "rm -f {:?}", mirror_root.join(path));
    }
    script
}

/// Writes the cleanup script to `cleanscript_path`, or (when `autoclean` is
/// set) removes the stale files directly and logs what was removed.
pub fn run(
    mirror_root: &Path,
    skip_clean: &HashSet<PathBuf>,
    cleanscript_path: &Path,
    autoclean: bool,
) -> Result<usize, Error> {
    let stale = stale_files(mirror_root, skip_clean);

    if autoclean {
        for path in &stale {
            let full = mirror_root.join(path);
            if let Err(e) = fs::remove_file(&full) {
                log::warn!("failed to remove stale mirror file {full:?}: {e}");
            }
        }
        info!("autoclean removed {} stale files", stale.len());
    } else {
        let script = render_script(mirror_root, &stale);
        if let Some(parent) = cleanscript_path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
        }
        fs::write(cleanscript_path, script)
            .with_context(|| format!("failed to write cleanup script {cleanscript_path:?}"))?;
        info!("wrote cleanup script for {} stale files to {cleanscript_path:?}", stale.len());
    }

    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_files_excludes_skip_clean_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pool/main")).unwrap();
        fs::write(dir.path().join("pool/main/keep.deb"), b"x").unwrap();
        fs::write(dir.path().join("pool/main/stale.deb"), b"y").unwrap();

        let mut skip = HashSet::new();
        skip.insert(PathBuf::from("pool/main/keep.deb"));

        let stale = stale_files(dir.path(), &skip);
        assert_eq!(stale, vec![PathBuf::from("pool/main/stale.deb")]);
    }

    #[test]
    fn autoclean_removes_stale_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stale.deb"), b"y").unwrap();
        let skip = HashSet::new();

        let removed = run(dir.path(), &skip, &dir.path().join("var/clean.sh"), true).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("stale.deb").exists());
    }

    #[test]
    fn non_autoclean_writes_script_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stale.deb"), b"y").unwrap();
        let skip = HashSet::new();
        let script_path = dir.path().join("var/clean.sh");

        run(dir.path(), &skip, &script_path, false).unwrap();

        assert!(dir.path().join("stale.deb").exists());
        let script = fs::read_to_string(&script_path).unwrap();
        assert!(script.contains("stale.deb"));
    }
}
