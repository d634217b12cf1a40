//! Parses a decompressed Packages index into per-package fetch records (§4.6).

use crate::checksum::{strongest, Digest, HashAlgo};
use crate::deb822::{parse_stanzas, Stanza};
use crate::path_utils::collapse;

/// One package entry extracted from a Packages stanza.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub filename: String,
    pub size: u64,
    pub digest: Option<Digest>,
}

const ALGOS: [HashAlgo; 4] = [
    HashAlgo::Sha512,
    HashAlgo::Sha256,
    HashAlgo::Sha1,
    HashAlgo::Md5,
];

/// Parses a Packages file body into one entry per stanza carrying a `Filename`
/// field. Stanzas missing `Filename` or `Size` are skipped.
pub fn parse(content: &str) -> Vec<PackageEntry> {
    parse_stanzas(content)
        .into_iter()
        .filter_map(|stanza| entry_from_stanza(&stanza))
        .collect()
}

fn entry_from_stanza(stanza: &Stanza) -> Option<PackageEntry> {
    let filename = stanza.get("Filename")?.to_string();
    let size: u64 = stanza.get("Size")?.parse().ok()?;

    let digests: Vec<Digest> = ALGOS
        .iter()
        .filter_map(|&algo| {
            stanza
                .get(algo.packages_field())
                .map(|hex| Digest { algorithm: algo, hex: hex.trim().to_string() })
        })
        .collect();

    Some(PackageEntry {
        filename,
        size,
        digest: strongest(&digests).cloned(),
    })
}

/// Builds the absolute artifact URL for a package entry relative to its
/// repository's base URI.
pub fn artifact_url(repo_uri: &str, filename: &str) -> String {
    collapse(&format!("{repo_uri}/{filename}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Package: hello\n\
Filename: pool/main/h/hello/hello_1_amd64.deb\n\
Size: 1234\n\
MD5sum: 11111111111111111111111111111111\n\
SHA256: abababababababababababababababababababababababababababababab\n\n\
Package: skip\n\
Size: 1\n";

    #[test]
    fn extracts_filename_size_and_strongest_digest() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.filename, "pool/main/h/hello/hello_1_amd64.deb");
        assert_eq!(entry.size, 1234);
        assert_eq!(entry.digest.as_ref().unwrap().algorithm, HashAlgo::Sha256);
    }

    #[test]
    fn skips_stanza_without_filename() {
        let entries = parse("Package: incomplete\nSize: 1\n");
        assert!(entries.is_empty());
    }

    #[test]
    fn builds_collapsed_artifact_url() {
        let url = artifact_url("http://example.com/debian//", "pool/main/h/hello.deb");
        assert_eq!(url, "http://example.com/debian/pool/main/h/hello.deb");
    }
}
