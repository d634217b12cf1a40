//! Parses a decompressed Sources index (§4.6/§9), symmetrically to Packages.

use crate::checksum::{strongest, Digest, HashAlgo};
use crate::deb822::{parse_checksum_block, parse_stanzas, Stanza};
use crate::path_utils::collapse;

/// One file listed under a Sources stanza's `Directory`.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub filename: String,
    pub size: u64,
    pub digest: Option<Digest>,
}

/// Parses a Sources file body. Each stanza contributes one `SourceEntry` per
/// file named in its checksum blocks, joined against that stanza's
/// `Directory`. The strongest of `Checksums-Sha256` / legacy `Files` (MD5) is
/// kept per file, per the ordering in §3. `Checksums-Sha1` is also honoured
/// when present, matching the Release hash-block precedence.
pub fn parse(content: &str) -> Vec<SourceEntry> {
    parse_stanzas(content)
        .into_iter()
        .flat_map(|stanza| entries_from_stanza(&stanza))
        .collect()
}

fn entries_from_stanza(stanza: &Stanza) -> Vec<SourceEntry> {
    let Some(directory) = stanza.get("Directory") else {
        return Vec::new();
    };

    // name -> collected digests across the three possible blocks
    let mut by_name: std::collections::BTreeMap<String, (u64, Vec<Digest>)> =
        std::collections::BTreeMap::new();

    let blocks: [(&str, HashAlgo); 3] = [
        ("Checksums-Sha256", HashAlgo::Sha256),
        ("Checksums-Sha1", HashAlgo::Sha1),
        ("Files", HashAlgo::Md5),
    ];

    for (field, algo) in blocks {
        let Some(block) = stanza.get(field) else {
            continue;
        };
        for (hex, size, name) in parse_checksum_block(block) {
            let entry = by_name.entry(name).or_insert_with(|| (size, Vec::new()));
            entry.0 = size;
            entry.1.push(Digest { algorithm: algo, hex });
        }
    }

    by_name
        .into_iter()
        .map(|(name, (size, digests))| SourceEntry {
            filename: collapse(&format!("{directory}/{name}")),
            size,
            digest: strongest(&digests).cloned(),
        })
        .collect()
}

/// Builds the absolute artifact URL for a source file relative to its
/// repository's base URI. `relative_path` is already joined against
/// `Directory` (see [`SourceEntry::filename`]).
pub fn artifact_url(repo_uri: &str, relative_path: &str) -> String {
    collapse(&format!("{repo_uri}/{relative_path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Package: hello\n\
Directory: pool/main/h/hello\n\
Files:\n\
 11111111111111111111111111111111 100 hello_1.dsc\n\
 22222222222222222222222222222222 200 hello_1.tar.gz\n\
Checksums-Sha256:\n\
 abababababababababababababababababababababababababababababab 100 hello_1.dsc\n\
 cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd 200 hello_1.tar.gz\n";

    #[test]
    fn joins_directory_and_filename() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .any(|e| e.filename == "pool/main/h/hello/hello_1.dsc"));
    }

    #[test]
    fn prefers_sha256_over_legacy_md5() {
        let entries = parse(SAMPLE);
        let dsc = entries
            .iter()
            .find(|e| e.filename.ends_with("hello_1.dsc"))
            .unwrap();
        assert_eq!(dsc.digest.as_ref().unwrap().algorithm, HashAlgo::Sha256);
    }

    #[test]
    fn stanza_without_directory_yields_nothing() {
        let entries = parse("Package: orphan\nFiles:\n 1 1 a\n");
        assert!(entries.is_empty());
    }
}
