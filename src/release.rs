//! Parses Release/InRelease documents into per-file digest sets (§4.5).

use std::collections::BTreeMap;

use crate::checksum::{Digest, HashAlgo};

/// One parsed Release/InRelease document.
#[derive(Debug, Default, Clone)]
pub struct ReleaseDoc {
    pub acquire_by_hash: bool,
    pub files: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub size: u64,
    pub digests: Vec<Digest>,
}

impl ReleaseDoc {
    /// The strongest advertised digest for `filename`, if any.
    pub fn strongest_digest(&self, filename: &str) -> Option<&Digest> {
        self.files
            .get(filename)
            .and_then(|entry| crate::checksum::strongest(&entry.digests))
    }

    /// The strongest hash algorithm advertised anywhere in this document,
    /// used by the By-Hash Coordinator as the repo-wide "strongest-algo"
    /// against which each file's own digest algorithm is compared (§4.7).
    pub fn strongest_algo(&self) -> Option<HashAlgo> {
        self.files
            .values()
            .flat_map(|entry| entry.digests.iter())
            .map(|d| d.algorithm)
            .max()
    }
}

const HASH_HEADERS: [(&str, HashAlgo); 4] = [
    ("SHA512:", HashAlgo::Sha512),
    ("SHA256:", HashAlgo::Sha256),
    ("SHA1:", HashAlgo::Sha1),
    ("MD5Sum:", HashAlgo::Md5),
];

/// Parses the raw bytes of a Release/InRelease document. Clearsigned
/// `InRelease` wrappers (`-----BEGIN PGP SIGNED MESSAGE-----` / signature
/// trailer) are tolerated by scanning line-by-line rather than requiring a
/// bare deb822 document; since signature verification is out of scope, the
/// armor lines are simply skipped as unrecognised non-indented lines.
pub fn parse(content: &str) -> ReleaseDoc {
    let mut doc = ReleaseDoc::default();
    let mut current_algo: Option<HashAlgo> = None;

    for line in content.lines() {
        if line.trim().is_empty() {
            current_algo = None;
            continue;
        }

        if let Some(rest) = line.strip_prefix(' ').or_else(|| line.strip_prefix('\t')) {
            if let Some(algo) = current_algo {
                if let Some((hex, size, name)) = parse_checksum_line(rest) {
                    let entry = doc.files.entry(name).or_insert_with(|| FileEntry {
                        size,
                        digests: Vec::new(),
                    });
                    entry.size = size;
                    entry.digests.push(Digest { algorithm: algo, hex });
                }
            }
            continue;
        }

        current_algo = None;

        if line.trim() == "Acquire-By-Hash: yes" {
            doc.acquire_by_hash = true;
            continue;
        }

        for (header, algo) in HASH_HEADERS {
            if line.trim() == header.trim_end_matches(':') || line.trim() == header {
                current_algo = Some(algo);
                break;
            }
        }
    }

    doc
}

fn parse_checksum_line(line: &str) -> Option<(String, u64, String)> {
    let mut parts = line.split_whitespace();
    let hex = parts.next()?.to_string();
    let size: u64 = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    Some((hex, size, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Origin: Debian\n\
Acquire-By-Hash: yes\n\
SHA256:\n\
 abababababababababababababababababababababababababababababab 1234 main/binary-amd64/Packages.gz\n\
 cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd 5678 main/binary-amd64/Packages\n\
MD5Sum:\n\
 11111111111111111111111111111111 1234 main/binary-amd64/Packages.gz\n";

    #[test]
    fn parses_acquire_by_hash_flag() {
        let doc = parse(SAMPLE);
        assert!(doc.acquire_by_hash);
    }

    #[test]
    fn binds_multiple_algorithms_to_same_file() {
        let doc = parse(SAMPLE);
        let entry = doc.files.get("main/binary-amd64/Packages.gz").unwrap();
        assert_eq!(entry.size, 1234);
        assert_eq!(entry.digests.len(), 2);
    }

    #[test]
    fn picks_strongest_digest() {
        let doc = parse(SAMPLE);
        let strongest = doc.strongest_digest("main/binary-amd64/Packages.gz").unwrap();
        assert_eq!(strongest.algorithm, HashAlgo::Sha256);
    }

    #[test]
    fn blank_line_ends_block() {
        let content = "SHA256:\n abababababababababababababababababababababababababababababab 1 a/b\n\nUnrelated: value\n 11111111111111111111111111111111 1 c/d\n";
        let doc = parse(content);
        assert!(doc.files.contains_key("a/b"));
        assert!(!doc.files.contains_key("c/d"));
    }
}
