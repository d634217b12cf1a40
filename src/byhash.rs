//! By-Hash Coordinator: rewrites downloads into `by-hash/<algo>/<digest>`
//! form and fans a single fetched payload out to every alias (§4.7).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::checksum::{Digest, HashAlgo};
use crate::fetch::{FetchTask, Stage};
use crate::promote::link_or_copy;

/// A planned download as seen by the Coordinator, before it decides whether
/// to rewrite the URL into by-hash form.
pub struct PlannedDownload {
    pub url: String,
    pub size: Option<u64>,
    pub canonical_path: PathBuf,
    pub strongest_algo: Option<HashAlgo>,
    pub per_file_digest: Option<Digest>,
    pub acquire_by_hash: bool,
    pub stage: Stage,
}

/// Owns the two inverse alias multimaps from §3 and the set of canonical
/// paths the cleanup collaborator must keep (`skipClean`).
#[derive(Default)]
pub struct ByHashCoordinator {
    hash_to_canonicals: HashMap<PathBuf, Vec<PathBuf>>,
    canonical_to_hashes: HashMap<PathBuf, Vec<PathBuf>>,
    skip_clean: HashSet<PathBuf>,
}

impl ByHashCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_clean(&self) -> &HashSet<PathBuf> {
        &self.skip_clean
    }

    /// Branches per §4.7 and returns the single FetchTask to enqueue, if any.
    /// A `None` result means the file is a redundant weaker-algorithm alias
    /// that will be materialised during fan-out instead of downloaded.
    pub fn plan(&mut self, planned: PlannedDownload) -> Option<FetchTask> {
        self.skip_clean.insert(planned.canonical_path.clone());

        let (Some(algo), Some(digest)) = (planned.strongest_algo, planned.per_file_digest.as_ref())
        else {
            return Some(FetchTask {
                url: planned.url,
                expected_size: planned.size,
                digest: None,
                canonical_path: planned.canonical_path,
                hash_path: None,
                stage: planned.stage,
            });
        };

        if !planned.acquire_by_hash {
            return Some(FetchTask {
                url: planned.url,
                expected_size: planned.size,
                digest: Some(digest.clone()),
                canonical_path: planned.canonical_path,
                hash_path: None,
                stage: planned.stage,
            });
        }

        let hash_path = by_hash_path(&planned.canonical_path, digest);

        if digest.algorithm == algo {
            self.hash_to_canonicals
                .entry(hash_path.clone())
                .or_default()
                .push(planned.canonical_path.clone());
            self.skip_clean.insert(hash_path.clone());

            let url = by_hash_url(&planned.url, &planned.canonical_path, digest);

            Some(FetchTask {
                url,
                expected_size: planned.size,
                digest: Some(digest.clone()),
                canonical_path: planned.canonical_path,
                hash_path: Some(hash_path),
                stage: planned.stage,
            })
        } else {
            // weaker algorithm than the one actually fetched: record as an
            // alias to materialise post-fetch, don't download it ourselves.
            self.canonical_to_hashes
                .entry(planned.canonical_path)
                .or_default()
                .push(hash_path.clone());
            self.skip_clean.insert(hash_path);
            None
        }
    }

    /// Post-download fan-out (§4.7): for each hash path that was actually
    /// fetched, copy its payload to every canonical alias, then to every
    /// additional (weaker) hash path recorded for those canonicals.
    pub fn fan_out(&self, skel_root: &Path) -> Result<(), Error> {
        for (hash_path, canonicals) in &self.hash_to_canonicals {
            let source = skel_root.join(hash_path);
            if !source.is_file() {
                continue;
            }
            for canonical in canonicals {
                let dest = skel_root.join(canonical);
                link_or_copy(&source, &dest)
                    .with_context(|| format!("failed to fan out {hash_path:?} to {canonical:?}"))?;

                if let Some(extra_hashes) = self.canonical_to_hashes.get(canonical) {
                    for extra in extra_hashes {
                        let extra_dest = skel_root.join(extra);
                        link_or_copy(&dest, &extra_dest).with_context(|| {
                            format!("failed to materialise alias {extra:?} from {canonical:?}")
                        })?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn by_hash_path(canonical_path: &Path, digest: &Digest) -> PathBuf {
    let dir = canonical_path.parent().unwrap_or_else(|| Path::new(""));
    dir.join("by-hash")
        .join(digest.algorithm.by_hash_dir())
        .join(&digest.hex)
}

fn by_hash_url(original_url: &str, canonical_path: &Path, digest: &Digest) -> String {
    let filename = canonical_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let Some(idx) = original_url.rfind(filename) else {
        return original_url.to_string();
    };
    let dir_url = &original_url[..idx];
    crate::path_utils::collapse(&format!(
        "{dir_url}by-hash/{}/{}",
        digest.algorithm.by_hash_dir(),
        digest.hex
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(algo: HashAlgo, hex: &str) -> Digest {
        Digest { algorithm: algo, hex: hex.to_string() }
    }

    #[test]
    fn plain_task_when_no_digest() {
        let mut coord = ByHashCoordinator::new();
        let task = coord
            .plan(PlannedDownload {
                url: "http://example.com/dists/stable/Release".into(),
                size: Some(100),
                canonical_path: PathBuf::from("dists/stable/Release"),
                strongest_algo: None,
                per_file_digest: None,
                acquire_by_hash: true,
                stage: Stage::Release,
            })
            .unwrap();
        assert!(task.hash_path.is_none());
        assert!(coord.skip_clean().contains(Path::new("dists/stable/Release")));
    }

    #[test]
    fn rewrites_to_by_hash_when_strongest() {
        let mut coord = ByHashCoordinator::new();
        let d = digest(HashAlgo::Sha256, "abcd1234");
        let task = coord
            .plan(PlannedDownload {
                url: "http://example.com/dists/stable/main/binary-amd64/Packages.gz".into(),
                size: Some(100),
                canonical_path: PathBuf::from("dists/stable/main/binary-amd64/Packages.gz"),
                strongest_algo: Some(HashAlgo::Sha256),
                per_file_digest: Some(d.clone()),
                acquire_by_hash: true,
                stage: Stage::Index,
            })
            .unwrap();

        assert_eq!(
            task.hash_path.unwrap(),
            PathBuf::from("dists/stable/main/binary-amd64/by-hash/SHA256/abcd1234")
        );
        assert!(task.url.ends_with("by-hash/SHA256/abcd1234"));
    }

    #[test]
    fn weaker_digest_produces_no_task_but_records_alias() {
        let mut coord = ByHashCoordinator::new();
        let weaker = digest(HashAlgo::Md5, "deadbeef");
        let result = coord.plan(PlannedDownload {
            url: "http://example.com/x/Packages.gz".into(),
            size: Some(50),
            canonical_path: PathBuf::from("x/Packages.gz"),
            strongest_algo: Some(HashAlgo::Sha256),
            per_file_digest: Some(weaker),
            acquire_by_hash: true,
            stage: Stage::Index,
        });
        assert!(result.is_none());
        assert!(coord
            .skip_clean()
            .contains(Path::new("x/by-hash/MD5Sum/deadbeef")));
    }

    #[test]
    fn no_by_hash_rewrite_when_not_advertised() {
        let mut coord = ByHashCoordinator::new();
        let d = digest(HashAlgo::Sha256, "abcd1234");
        let task = coord
            .plan(PlannedDownload {
                url: "http://example.com/x/Packages.gz".into(),
                size: Some(50),
                canonical_path: PathBuf::from("x/Packages.gz"),
                strongest_algo: Some(HashAlgo::Sha256),
                per_file_digest: Some(d),
                acquire_by_hash: false,
                stage: Stage::Index,
            })
            .unwrap();
        assert!(task.hash_path.is_none());
    }
}
