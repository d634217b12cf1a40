//! Streaming checksum verification against the digests advertised in Release and
//! Packages/Sources metadata.

use std::cmp::Ordering;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Error};
use openssl::hash::{Hasher, MessageDigest};

const BLOCK_SIZE: usize = 64 * 1024;

/// Supported hash algorithms, ordered from strongest to weakest. `Ord` follows
/// that strength ordering so `Vec<HashAlgo>::iter().max()` picks the strongest
/// one advertised for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    fn strength(self) -> u8 {
        match self {
            HashAlgo::Md5 => 0,
            HashAlgo::Sha1 => 1,
            HashAlgo::Sha256 => 2,
            HashAlgo::Sha512 => 3,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            HashAlgo::Md5 => MessageDigest::md5(),
            HashAlgo::Sha1 => MessageDigest::sha1(),
            HashAlgo::Sha256 => MessageDigest::sha256(),
            HashAlgo::Sha512 => MessageDigest::sha512(),
        }
    }

    /// The stanza key used in Release files (`SHA512:`, `MD5Sum:`, ...).
    pub fn release_key(self) -> &'static str {
        match self {
            HashAlgo::Md5 => "MD5Sum",
            HashAlgo::Sha1 => "SHA1",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha512 => "SHA512",
        }
    }

    /// The field name used in Packages stanzas (`SHA512`, `MD5sum`, ...).
    pub fn packages_field(self) -> &'static str {
        match self {
            HashAlgo::Md5 => "MD5sum",
            HashAlgo::Sha1 => "SHA1",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha512 => "SHA512",
        }
    }

    /// The directory name used for `by-hash/<algo>/<digest>` paths.
    pub fn by_hash_dir(self) -> &'static str {
        self.release_key()
    }
}

impl PartialOrd for HashAlgo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HashAlgo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.strength().cmp(&other.strength())
    }
}

/// A declared (algorithm, hex-digest) pair, plus the size it was declared against.
#[derive(Debug, Clone)]
pub struct Digest {
    pub algorithm: HashAlgo,
    pub hex: String,
}

/// Streams `path` in fixed-size blocks and compares the computed digest against
/// `expected` (case-insensitive). Never loads the whole file into memory.
pub fn verify_file(path: &Path, digest: &Digest) -> Result<bool, Error> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {path:?} for verification"))?;
    let mut hasher = Hasher::new(digest.algorithm.message_digest())
        .context("failed to initialize hasher")?;

    let mut buf = [0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).context("failed to read file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]).context("failed to update hasher")?;
    }

    let computed = hasher.finish().context("failed to finalize hash")?;
    let computed_hex = hex::encode(computed);

    Ok(computed_hex.eq_ignore_ascii_case(&digest.hex))
}

/// Computes the digest of `path` under `algorithm` without comparing against any
/// expected value (used by the diff subsystem to track SHA-256 versions).
pub fn digest_file(path: &Path, algorithm: HashAlgo) -> Result<String, Error> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {path:?} for hashing"))?;
    let mut hasher = Hasher::new(algorithm.message_digest()).context("failed to initialize hasher")?;

    let mut buf = [0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).context("failed to read file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]).context("failed to update hasher")?;
    }

    Ok(hex::encode(hasher.finish().context("failed to finalize hash")?))
}

/// Picks the strongest digest out of a set of advertised ones, per §3's ordering.
pub fn strongest(digests: &[Digest]) -> Option<&Digest> {
    digests.iter().max_by_key(|d| d.algorithm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn strength_ordering() {
        assert!(HashAlgo::Sha512 > HashAlgo::Sha256);
        assert!(HashAlgo::Sha256 > HashAlgo::Sha1);
        assert!(HashAlgo::Sha1 > HashAlgo::Md5);
    }

    #[test]
    fn verifies_known_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let digest = Digest {
            algorithm: HashAlgo::Sha256,
            hex: "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde".to_string(),
        };
        assert!(verify_file(&path, &digest).unwrap());
    }

    #[test]
    fn rejects_mismatched_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"goodbye world").unwrap();
        drop(f);

        let digest = Digest {
            algorithm: HashAlgo::Sha256,
            hex: "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde".to_string(),
        };
        assert!(!verify_file(&path, &digest).unwrap());
    }

    #[test]
    fn case_insensitive_compare() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let digest = Digest {
            algorithm: HashAlgo::Sha256,
            hex: "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE".to_string(),
        };
        assert!(verify_file(&path, &digest).unwrap());
    }

    #[test]
    fn strongest_picks_sha512_over_sha256() {
        let digests = vec![
            Digest { algorithm: HashAlgo::Sha256, hex: "a".into() },
            Digest { algorithm: HashAlgo::Sha512, hex: "b".into() },
            Digest { algorithm: HashAlgo::Md5, hex: "c".into() },
        ];
        assert_eq!(strongest(&digests).unwrap().algorithm, HashAlgo::Sha512);
    }
}
