//! Staging-to-mirror promotion: hardlink-preferred, metadata-preserving copy
//! fallback (§4.10).

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Error};
use filetime::FileTime;

use crate::checksum::{digest_file, HashAlgo};
use crate::error::EngineError;

/// Copies (or hardlinks) `src` onto `dest`, creating `dest`'s parent
/// directories as needed. Used both for fetch's mirror→skel short-circuit and
/// for end-of-run promotion.
pub fn link_or_copy(src: &Path, dest: &Path) -> Result<(), Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
    }

    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }

    copy_preserving_metadata(src, dest)
}

/// Promotes one staged file to its published location, per §4.10:
/// - identical (size, mtime, mode) triple ⇒ already promoted, skip.
/// - with `unlink` set, the triple differing, and a byte-wise comparison
///   confirming the content itself differs, remove `dest` first (so other
///   hardlinks to the old inode are unaffected) before copying.
/// - otherwise hardlink, falling back to a metadata-preserving copy.
///
/// Returns `true` if the file was (re-)promoted, `false` if it was already
/// identical and left untouched.
pub fn promote(src: &Path, dest: &Path, unlink: bool) -> Result<bool, Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
    }

    if identical_triple(src, dest)? {
        return Ok(false);
    }

    if unlink && dest.exists() && contents_differ(src, dest)? {
        fs::remove_file(dest)
            .with_context(|| format!("failed to unlink stale mirror file {dest:?}"))?;
    }

    if fs::hard_link(src, dest).is_ok() {
        return Ok(true);
    }

    copy_preserving_metadata(src, dest)?;
    Ok(true)
}

fn identical_triple(src: &Path, dest: &Path) -> Result<bool, Error> {
    let (Ok(src_meta), Ok(dest_meta)) = (fs::metadata(src), fs::metadata(dest)) else {
        return Ok(false);
    };

    Ok(src_meta.len() == dest_meta.len()
        && src_meta.mode() == dest_meta.mode()
        && FileTime::from_last_modification_time(&src_meta)
            == FileTime::from_last_modification_time(&dest_meta))
}

/// Byte-wise content comparison gating the unlink-before-overwrite path
/// (§4.10): a mismatched (size, mtime, mode) triple does not by itself mean
/// the bytes differ, and breaking a hardlink when they don't would be
/// needless churn.
fn contents_differ(src: &Path, dest: &Path) -> Result<bool, Error> {
    let src_digest = digest_file(src, HashAlgo::Sha256)
        .with_context(|| format!("failed to hash {src:?}"))?;
    let dest_digest = digest_file(dest, HashAlgo::Sha256)
        .with_context(|| format!("failed to hash {dest:?}"))?;
    Ok(src_digest != dest_digest)
}

fn copy_preserving_metadata(src: &Path, dest: &Path) -> Result<(), Error> {
    fs::copy(src, dest).with_context(|| format!("failed to copy {src:?} to {dest:?}"))?;

    let meta = fs::metadata(src).with_context(|| format!("failed to stat {src:?}"))?;
    fs::set_permissions(dest, fs::Permissions::from_mode(meta.mode()))
        .with_context(|| format!("failed to set permissions on {dest:?}"))?;

    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_times(dest, mtime, mtime)
        .with_context(|| format!("failed to set mtime on {dest:?}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn copy_preserves_size_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        let mut f = fs::File::create(&src).unwrap();
        f.write_all(b"payload").unwrap();
        drop(f);
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();

        copy_preserving_metadata(&src, &dest).unwrap();

        assert_eq!(fs::metadata(&dest).unwrap().len(), 7);
        assert_eq!(fs::metadata(&dest).unwrap().mode() & 0o777, 0o640);
    }

    #[test]
    fn promote_skips_identical_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"hi").unwrap();
        let dest = dir.path().join("dest");
        copy_preserving_metadata(&src, &dest).unwrap();

        let changed = promote(&src, &dest, false).unwrap();
        assert!(!changed);
    }

    #[test]
    fn promote_unlinks_before_overwrite_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"new content").unwrap();
        let dest = dir.path().join("dest");
        fs::write(&dest, b"old").unwrap();
        let other_link = dir.path().join("hardlinked_elsewhere");
        fs::hard_link(&dest, &other_link).unwrap();

        promote(&src, &dest, true).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new content");
        assert_eq!(fs::read(&other_link).unwrap(), b"old");
    }

    #[test]
    fn promote_does_not_unlink_when_content_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"same content").unwrap();
        let dest = dir.path().join("dest");
        fs::write(&dest, b"same content").unwrap();
        // Force the (size, mtime, mode) triple to mismatch despite identical
        // bytes, so the unlink gate can only be satisfied by the content
        // comparison actually running.
        let old_mtime = FileTime::from_unix_time(0, 0);
        filetime::set_file_times(&dest, old_mtime, old_mtime).unwrap();
        let other_link = dir.path().join("hardlinked_elsewhere");
        fs::hard_link(&dest, &other_link).unwrap();
        let dest_ino_before = fs::metadata(&dest).unwrap().ino();

        let changed = promote(&src, &dest, true).unwrap();

        assert!(changed);
        assert_eq!(fs::metadata(&dest).unwrap().ino(), dest_ino_before);
        assert_eq!(fs::read(&other_link).unwrap(), b"same content");
    }
}
