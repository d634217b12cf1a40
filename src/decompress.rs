//! Transparent expansion of gzip/bzip2/xz metadata files.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use bzip2::read::BzDecoder;
use flate2::bufread::GzDecoder;
use xz2::read::XzDecoder;

use crate::error::EngineError;

/// If `path`'s name ends in `.gz`, `.bz2` or `.xz`, decompresses it to a sibling
/// file with that suffix stripped and returns the sibling's path. Otherwise
/// returns `path` unchanged. Corrupt input surfaces as `EngineError::Decompression`.
pub fn decompress(path: &Path) -> Result<PathBuf, Error> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(path.to_path_buf());
    };

    let (stripped, kind) = if let Some(stem) = name.strip_suffix(".gz") {
        (stem, Kind::Gzip)
    } else if let Some(stem) = name.strip_suffix(".bz2") {
        (stem, Kind::Bzip2)
    } else if let Some(stem) = name.strip_suffix(".xz") {
        (stem, Kind::Xz)
    } else {
        return Ok(path.to_path_buf());
    };

    let dest = path.with_file_name(stripped);
    decompress_into(path, &dest, kind)
        .with_context(|| format!("failed to decompress {path:?}"))?;
    Ok(dest)
}

enum Kind {
    Gzip,
    Bzip2,
    Xz,
}

fn decompress_into(src: &Path, dest: &Path, kind: Kind) -> Result<(), Error> {
    let file = File::open(src).map_err(|e| EngineError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut out = File::create(dest).map_err(|e| EngineError::Io(e.to_string()))?;

    let result: io::Result<u64> = match kind {
        Kind::Gzip => io::copy(&mut GzDecoder::new(reader), &mut out),
        Kind::Bzip2 => io::copy(&mut BzDecoder::new(reader), &mut out),
        Kind::Xz => io::copy(&mut XzDecoder::new_multi_decoder(reader), &mut out),
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            // don't leave a truncated/corrupt file behind for later stages to trip over
            let _ = std::fs::remove_file(dest);
            Err(EngineError::Decompression(e.to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn passthrough_for_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Packages");
        File::create(&path).unwrap().write_all(b"stanza").unwrap();

        let result = decompress(&path).unwrap();
        assert_eq!(result, path);
    }

    #[test]
    fn decompresses_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Packages.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"Package: hello\n").unwrap();
        enc.finish().unwrap();

        let result = decompress(&path).unwrap();
        assert_eq!(result, dir.path().join("Packages"));
        let contents = std::fs::read_to_string(result).unwrap();
        assert_eq!(contents, "Package: hello\n");
    }

    #[test]
    fn corrupt_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Packages.gz");
        File::create(&path).unwrap().write_all(b"not gzip data").unwrap();

        assert!(decompress(&path).is_err());
        assert!(!dir.path().join("Packages").exists());
    }
}
