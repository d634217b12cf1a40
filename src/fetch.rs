//! Bounded-concurrency HTTP fetcher with resume, retry and post-verification
//! (§4.4, §5).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Error;
use log::{debug, warn};

use crate::checksum::{verify_file, Digest};
use crate::error::EngineError;
use crate::progress::{Progress, Stopwatch};

/// Which stage enqueued a task, carried through for progress accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Release,
    Index,
    Archive,
}

/// One planned download (§3).
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub url: String,
    pub expected_size: Option<u64>,
    pub digest: Option<Digest>,
    pub canonical_path: PathBuf,
    pub hash_path: Option<PathBuf>,
    pub stage: Stage,
}

impl FetchTask {
    /// The path relative to `skel/`/`mirror/` that this task is staged under.
    pub fn staged_path(&self) -> &Path {
        self.hash_path.as_deref().unwrap_or(&self.canonical_path)
    }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok,
    Failed(String),
}

/// Network/retry/verification policy, sourced from the typed `EngineConfig`.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub nthreads: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub verify_checksums: bool,
    pub resume_partial_downloads: bool,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_check_certificate: bool,
    pub progress_update_interval: Duration,
}

pub struct Fetcher {
    policy: FetchPolicy,
    skel_root: PathBuf,
    mirror_root: PathBuf,
    agent: ureq::Agent,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy, skel_root: PathBuf, mirror_root: PathBuf) -> Self {
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(policy.connect_timeout)
            .timeout(policy.total_timeout);

        if let Some(proxy) = policy.https_proxy.as_ref().or(policy.http_proxy.as_ref()) {
            if let Ok(proxy) = ureq::Proxy::new(proxy) {
                builder = builder.proxy(proxy);
            } else {
                warn!("ignoring malformed proxy URL {proxy:?}");
            }
        }

        if policy.no_check_certificate {
            warn!(
                "no_check_certificate is set but TLS peer verification cannot be disabled \
                 without an additional TLS backend dependency; certificates are still verified"
            );
        }

        Fetcher {
            agent: builder.build(),
            policy,
            skel_root,
            mirror_root,
        }
    }

    /// Runs `tasks` across a worker pool bounded by `nthreads`, returning one
    /// outcome per task in input order. This stage must fully drain (§5)
    /// before the caller proceeds, which this call's blocking return enforces.
    /// While the pool is draining, a monitor thread emits the in-place
    /// progress line (§4.8, §10) no more often than `progress_update_interval`.
    pub fn fetch_batch(&self, tasks: Vec<FetchTask>) -> Vec<(FetchTask, FetchOutcome)> {
        let workers = self.policy.nthreads.max(1).min(tasks.len().max(1));
        let next = AtomicUsize::new(0);
        let completed_files = AtomicUsize::new(0);
        let completed_bytes = AtomicU64::new(0);
        let total_bytes: u64 = tasks.iter().filter_map(|t| t.expected_size).sum();
        let results: Vec<std::sync::Mutex<Option<(FetchTask, FetchOutcome)>>> =
            tasks.iter().map(|_| std::sync::Mutex::new(None)).collect();
        let stopwatch = Stopwatch::start();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= tasks.len() {
                        break;
                    }
                    let task = &tasks[idx];
                    let outcome = self.fetch_one(task);
                    if let FetchOutcome::Ok = outcome {
                        completed_bytes.fetch_add(task.expected_size.unwrap_or(0), Ordering::SeqCst);
                    }
                    completed_files.fetch_add(1, Ordering::SeqCst);
                    *results[idx].lock().unwrap() = Some((task.clone(), outcome));
                });
            }

            scope.spawn(|| {
                self.report_progress(
                    tasks.len(),
                    total_bytes,
                    &completed_files,
                    &completed_bytes,
                    &stopwatch,
                );
            });
        });

        results
            .into_iter()
            .map(|m| m.into_inner().unwrap().expect("every index is claimed exactly once"))
            .collect()
    }

    fn report_progress(
        &self,
        total_files: usize,
        total_bytes: u64,
        completed_files: &AtomicUsize,
        completed_bytes: &AtomicU64,
        stopwatch: &Stopwatch,
    ) {
        let interval = self.policy.progress_update_interval;
        if interval.is_zero() || total_files == 0 {
            return;
        }
        loop {
            std::thread::sleep(interval);
            let done = completed_files.load(Ordering::SeqCst);
            let mut progress = Progress::new(total_files, total_bytes);
            progress.completed_files = done;
            progress.completed_bytes = completed_bytes.load(Ordering::SeqCst);
            print!("\r{}", progress.line(stopwatch.elapsed()));
            let _ = io::stdout().flush();
            if done >= total_files {
                println!();
                break;
            }
        }
    }

    fn fetch_one(&self, task: &FetchTask) -> FetchOutcome {
        match self.fetch_one_inner(task) {
            Ok(()) => FetchOutcome::Ok,
            Err(e) => FetchOutcome::Failed(e.to_string()),
        }
    }

    fn fetch_one_inner(&self, task: &FetchTask) -> Result<(), Error> {
        let skel_path = self.skel_root.join(task.staged_path());
        let mirror_path = self.mirror_root.join(&task.canonical_path);

        if self.short_circuit_from_mirror(task, &mirror_path, &skel_path)? {
            debug!("short-circuit {:?}: already present in mirror", task.canonical_path);
            return Ok(());
        }

        if let Some(parent) = skel_path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_fetch(task, &skel_path) {
                Ok(()) => return Ok(()),
                Err(FetchAttemptError::Permanent(err)) => {
                    return Err(err.into());
                }
                Err(FetchAttemptError::Retryable(err)) => {
                    if attempt >= self.policy.retry_attempts {
                        let _ = fs::remove_file(&skel_path);
                        return Err(err.into());
                    }
                    let delay = self.policy.retry_delay * attempt;
                    warn!(
                        "fetch of {} failed (attempt {attempt}/{}): {err}, retrying in {:?}",
                        task.url, self.policy.retry_attempts, delay
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Step 2 of §4.4: if `mirror_path` already holds a verified copy, link or
    /// copy it into `skel/` and report success without touching the network.
    fn short_circuit_from_mirror(
        &self,
        task: &FetchTask,
        mirror_path: &Path,
        skel_path: &Path,
    ) -> Result<bool, Error> {
        if !mirror_path.is_file() {
            return Ok(false);
        }

        if !self.verify_against_expectations(task, mirror_path)? {
            return Ok(false);
        }

        if !skel_path.exists() {
            if let Some(parent) = skel_path.parent() {
                fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
            }
            crate::promote::link_or_copy(mirror_path, skel_path)?;
        }

        Ok(true)
    }

    fn verify_against_expectations(&self, task: &FetchTask, path: &Path) -> Result<bool, Error> {
        if self.policy.verify_checksums {
            if let Some(digest) = &task.digest {
                return verify_file(path, digest);
            }
        }
        match task.expected_size {
            Some(size) => Ok(fs::metadata(path).map(|m| m.len()).unwrap_or(0) == size),
            None => Ok(true),
        }
    }

    fn attempt_fetch(&self, task: &FetchTask, skel_path: &Path) -> Result<(), FetchAttemptError> {
        let existing_len = if skel_path.exists() {
            fs::metadata(skel_path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let (resume_from, mut file) = match (existing_len, task.expected_size) {
            (0, _) => (0, Self::create_file(skel_path)?),
            (len, Some(expected)) if len == expected => {
                if self
                    .verify_against_expectations(task, skel_path)
                    .map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))?
                {
                    return Ok(());
                }
                (0, Self::create_file(skel_path)?)
            }
            (len, Some(expected)) if len > expected => (0, Self::create_file(skel_path)?),
            (len, _) if self.policy.resume_partial_downloads => (
                len,
                OpenOptions::new()
                    .append(true)
                    .open(skel_path)
                    .map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))?,
            ),
            _ => (0, Self::create_file(skel_path)?),
        };

        let mut request = self.agent.get(&task.url);
        if resume_from > 0 {
            request = request.set("Range", &format!("bytes={resume_from}-"));
        }

        let response = request.call().map_err(classify_ureq_error)?;

        let mut reader = response.into_reader();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))?;
        }
        drop(file);

        if let Some(expected) = task.expected_size {
            let actual = fs::metadata(skel_path)
                .map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))?
                .len();
            if actual != expected {
                return Err(FetchAttemptError::Retryable(EngineError::SizeMismatch {
                    expected,
                    actual,
                }));
            }
        }

        if self.policy.verify_checksums {
            if let Some(digest) = &task.digest {
                let ok = verify_file(skel_path, digest)
                    .map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))?;
                if !ok {
                    return Err(FetchAttemptError::Retryable(EngineError::ChecksumMismatch {
                        algorithm: digest.algorithm.release_key().to_string(),
                        expected: digest.hex.clone(),
                    }));
                }
            }
        }

        Ok(())
    }

    fn create_file(skel_path: &Path) -> Result<File, FetchAttemptError> {
        File::create(skel_path).map_err(|e| FetchAttemptError::Retryable(EngineError::Io(e.to_string())))
    }
}

enum FetchAttemptError {
    Permanent(EngineError),
    Retryable(EngineError),
}

fn classify_ureq_error(err: ureq::Error) -> FetchAttemptError {
    match err {
        ureq::Error::Status(code, response) => {
            let msg = format!("HTTP {code} fetching {}", response.get_url());
            if is_permanent_status(code) {
                FetchAttemptError::Permanent(EngineError::Network(msg))
            } else {
                FetchAttemptError::Retryable(EngineError::Network(msg))
            }
        }
        ureq::Error::Transport(t) => {
            FetchAttemptError::Retryable(EngineError::Network(t.to_string()))
        }
    }
}

/// 4xx other than 408 (Request Timeout) and 429 (Too Many Requests) are
/// permanent; everything else (5xx, 408, 429) is retryable.
fn is_permanent_status(code: u16) -> bool {
    (400..500).contains(&code) && code != 408 && code != 429
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_status_classification() {
        assert!(is_permanent_status(404));
        assert!(is_permanent_status(403));
        assert!(!is_permanent_status(408));
        assert!(!is_permanent_status(429));
        assert!(!is_permanent_status(500));
        assert!(!is_permanent_status(503));
    }

    #[test]
    fn staged_path_prefers_hash_path() {
        let task = FetchTask {
            url: "http://example.com/x".into(),
            expected_size: None,
            digest: None,
            canonical_path: PathBuf::from("dists/stable/Release"),
            hash_path: Some(PathBuf::from("dists/stable/by-hash/SHA256/abc")),
            stage: Stage::Release,
        };
        assert_eq!(task.staged_path(), Path::new("dists/stable/by-hash/SHA256/abc"));
    }
}
