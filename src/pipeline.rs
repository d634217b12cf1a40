//! Pipeline Orchestrator: drives the five ordered stages and owns the run
//! lifecycle (§4.8).

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Error};
use log::{info, warn};
use regex::Regex;

use crate::byhash::{ByHashCoordinator, PlannedDownload};
use crate::config::{EngineConfig, RepoKind, RepoSpec};
use crate::diff::VersionDb;
use crate::fetch::{FetchOutcome, FetchPolicy, FetchTask, Fetcher, Stage};
use crate::lock::LockGuard;
use crate::path_utils::{collapse, sanitise};
use crate::progress::{format_duration, Progress, Stopwatch};
use crate::release::{self, ReleaseDoc};
use crate::{packages, sources};

/// Summary emitted at the end of a run (§7, §10).
#[derive(Debug)]
pub struct RunSummary {
    pub elapsed: std::time::Duration,
    pub failed_files: usize,
    pub diffs_generated: usize,
    pub limit_rate_advisory: Option<String>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "completed in {}, {} failed files, {} diffs generated",
            format_duration(self.elapsed),
            self.failed_files,
            self.diffs_generated
        )?;
        if let Some(note) = &self.limit_rate_advisory {
            write!(f, " ({note})")?;
        }
        Ok(())
    }
}

/// Owns session-scoped state for a single run: configuration, fetcher,
/// by-hash tables and the growing set of canonical/hash paths to keep.
pub struct Engine {
    config: EngineConfig,
}

struct RepoContext<'a> {
    repo: &'a RepoSpec,
    base: String,
    dists_root_canonical: PathBuf,
    release: Option<ReleaseDoc>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine { config }
    }

    pub fn run(&self) -> Result<RunSummary, Error> {
        let stopwatch = Stopwatch::start();
        let _lock = LockGuard::acquire(&self.config.var_path)?;

        for root in [&self.config.skel_path, &self.config.mirror_path, &self.config.var_path, &self.config.diff_storage_path] {
            fs::create_dir_all(root)
                .with_context(|| format!("failed to create tree root {root:?}"))?;
        }

        let fetcher = Fetcher::new(self.fetch_policy(), self.config.skel_path.clone(), self.config.mirror_path.clone());
        let mut coordinator = ByHashCoordinator::new();
        let mut failed_files = 0usize;

        // Stage 1: Release.
        let mut contexts: Vec<RepoContext> = self
            .config
            .repos
            .iter()
            .map(|repo| {
                let base = sanitise(&repo.uri, self.config.tilde_encoding);
                let dists_root_canonical = PathBuf::from(collapse(&format!(
                    "{base}/dists/{}",
                    repo.distribution
                )));
                RepoContext { repo, base, dists_root_canonical, release: None }
            })
            .collect();

        let release_tasks = self.build_release_tasks(&contexts);
        let release_results = fetcher.fetch_batch(release_tasks);
        failed_files += count_failures(&release_results);
        log_stage_progress("release", &release_results);
        self.warn_on_missing_releases(&contexts, &release_results);

        for ctx in &mut contexts {
            ctx.release = self.load_release_doc(ctx);
            if ctx.release.is_none() {
                warn!(
                    "repository {} {} has neither InRelease nor Release; skipping metadata/archive stages",
                    ctx.repo.uri, ctx.repo.distribution
                );
            }
        }

        // Stage 2: Metadata.
        let metadata_plans = self.build_metadata_plans(&contexts);
        let metadata_tasks: Vec<FetchTask> = metadata_plans
            .into_iter()
            .filter_map(|plan| coordinator.plan(plan))
            .collect();
        let metadata_results = fetcher.fetch_batch(metadata_tasks);
        failed_files += count_failures(&metadata_results);
        log_stage_progress("metadata", &metadata_results);

        // Stage 3: Index processing.
        let archive_plans = self.process_indexes(&contexts, &metadata_results);

        // Stage 4: Archive.
        let archive_tasks: Vec<FetchTask> = archive_plans
            .into_iter()
            .filter_map(|plan| coordinator.plan(plan))
            .collect();
        let archive_results = fetcher.fetch_batch(archive_tasks);
        failed_files += count_failures(&archive_results);
        log_stage_progress("archive", &archive_results);

        // Stage 5: Promotion + diff + cleanup.
        coordinator
            .fan_out(&self.config.skel_path)
            .context("failed to fan out by-hash aliases")?;

        let mut skip_clean: HashSet<PathBuf> = coordinator.skip_clean().clone();
        for (task, outcome) in release_results.iter().chain(metadata_results.iter()) {
            if matches!(outcome, FetchOutcome::Ok) {
                skip_clean.insert(task.canonical_path.clone());
            }
        }
        // `clean`/`skip-clean` directives (§6) name paths the cleanup
        // collaborator must leave alone regardless of what the fetch stages
        // touched this run; both are already sanitised at parse time.
        for path in self.config.clean.iter().chain(self.config.skip_clean.iter()) {
            skip_clean.insert(PathBuf::from(path));
        }

        let mut diffs_generated = 0usize;
        if self.config.enable_diffs {
            diffs_generated = self.run_diffs(&archive_results)?;
        }

        self.promote_all(&release_results, &metadata_results, &archive_results, &skip_clean)?;

        crate::cleanup::run(
            &self.config.mirror_path,
            &skip_clean,
            &self.config.cleanscript,
            self.config.autoclean,
        )?;

        if self.config.run_postmirror {
            self.run_postmirror_hook();
        }

        let limit_rate_advisory = self.config.limit_rate.as_ref().map(|rate| {
            format!("limit_rate={rate} is advisory only and was not enforced")
        });

        let summary = RunSummary {
            elapsed: stopwatch.elapsed(),
            failed_files,
            diffs_generated,
            limit_rate_advisory,
        };
        info!("{summary}");
        Ok(summary)
    }

    fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            nthreads: self.config.nthreads,
            retry_attempts: self.config.retry_attempts,
            retry_delay: self.config.retry_delay,
            verify_checksums: self.config.verify_checksums,
            resume_partial_downloads: self.config.resume_partial_downloads,
            connect_timeout: std::time::Duration::from_secs(30),
            total_timeout: std::time::Duration::from_secs(3600),
            http_proxy: self.config.http_proxy.clone(),
            https_proxy: self.config.https_proxy.clone(),
            no_check_certificate: self.config.no_check_certificate,
            progress_update_interval: self.config.progress_update_interval,
        }
    }

    fn build_release_tasks(&self, contexts: &[RepoContext]) -> Vec<FetchTask> {
        let mut tasks = Vec::new();
        for ctx in contexts {
            for name in ["InRelease", "Release", "Release.gpg"] {
                let canonical_path = ctx.dists_root_canonical.join(name);
                let url = collapse(&format!("{}/dists/{}/{name}", ctx.repo.uri, ctx.repo.distribution));
                tasks.push(FetchTask {
                    url,
                    expected_size: None,
                    digest: None,
                    canonical_path,
                    hash_path: None,
                    stage: Stage::Release,
                });
            }
        }
        tasks
    }

    fn warn_on_missing_releases(&self, contexts: &[RepoContext], results: &[(FetchTask, FetchOutcome)]) {
        for ctx in contexts {
            let in_release = ctx.dists_root_canonical.join("InRelease");
            let release = ctx.dists_root_canonical.join("Release");
            let present = results.iter().any(|(task, outcome)| {
                matches!(outcome, FetchOutcome::Ok)
                    && (task.canonical_path == in_release || task.canonical_path == release)
            });
            if !present {
                warn!(
                    "no InRelease or Release found for {} {}",
                    ctx.repo.uri, ctx.repo.distribution
                );
            }
        }
    }

    fn load_release_doc(&self, ctx: &RepoContext) -> Option<ReleaseDoc> {
        for name in ["InRelease", "Release"] {
            let path = self.config.skel_path.join(ctx.dists_root_canonical.join(name));
            if let Ok(content) = fs::read_to_string(&path) {
                return Some(release::parse(&content));
            }
        }
        None
    }

    /// Builds the metadata-stage planned downloads (§4.8 step 2): every file
    /// in each repo's Release document matching the binary/Contents/Sources
    /// index patterns for its declared components and architecture.
    fn build_metadata_plans(&self, contexts: &[RepoContext]) -> Vec<PlannedDownload> {
        let mut plans = Vec::new();

        for ctx in contexts {
            let Some(release) = &ctx.release else { continue };
            let strongest_algo = release.strongest_algo();

            for pattern in self.index_patterns(ctx.repo) {
                let regex = match Regex::new(&pattern) {
                    Ok(r) => r,
                    Err(_) => continue,
                };

                for (filename, entry) in &release.files {
                    if !regex.is_match(filename) {
                        continue;
                    }
                    let canonical_path = ctx.dists_root_canonical.join(filename);
                    let url = collapse(&format!(
                        "{}/dists/{}/{filename}",
                        ctx.repo.uri, ctx.repo.distribution
                    ));

                    // One planned download per advertised digest, not just the
                    // strongest: a weaker algorithm must still reach the
                    // Coordinator so it can record a canonicalToHashes alias
                    // instead of being silently dropped (§4.7).
                    for digest in &entry.digests {
                        plans.push(PlannedDownload {
                            url: url.clone(),
                            size: Some(entry.size),
                            canonical_path: canonical_path.clone(),
                            strongest_algo,
                            per_file_digest: Some(digest.clone()),
                            acquire_by_hash: release.acquire_by_hash,
                            stage: Stage::Index,
                        });
                    }
                }
            }
        }

        plans
    }

    /// Index patterns (§4.6/§4.8) for one RepoSpec: binary Packages and
    /// (optionally) Contents for a binary repo, or Sources for a source repo.
    /// Empty `components` means a flat repository with no component prefix.
    fn index_patterns(&self, repo: &RepoSpec) -> Vec<String> {
        let comps: Vec<String> = if repo.components.is_empty() {
            vec![String::new()]
        } else {
            repo.components.clone()
        };

        let mut patterns = Vec::new();
        for comp in comps {
            let prefix = if comp.is_empty() { String::new() } else { format!("{}/", regex::escape(&comp)) };
            match repo.kind {
                RepoKind::Binary => {
                    let arch = repo
                        .architecture
                        .clone()
                        .unwrap_or_else(|| self.config.default_arch.clone());
                    patterns.push(format!(
                        r"^{prefix}binary-{}/Packages(\.gz|\.bz2|\.xz)?$",
                        regex::escape(&arch)
                    ));
                    if self.config.contents {
                        patterns.push(format!(
                            r"^{prefix}Contents-{}(\.gz|\.bz2|\.xz)?$",
                            regex::escape(&arch)
                        ));
                    }
                }
                RepoKind::Source => {
                    patterns.push(format!(r"^{prefix}source/Sources(\.gz|\.bz2|\.xz)?$"));
                }
            }
        }
        patterns
    }

    /// Stage 3 (§4.8 step 3): for each successfully fetched metadata file,
    /// decompress it and feed it to the Index Processor. The Fetcher already
    /// enforced the declared size/digest during the metadata stage itself, so
    /// a failed verification simply shows up as a failed fetch outcome here
    /// (and is skipped with a warning, not aborting the run).
    fn process_indexes(
        &self,
        contexts: &[RepoContext],
        metadata_results: &[(FetchTask, FetchOutcome)],
    ) -> Vec<PlannedDownload> {
        let mut plans = Vec::new();

        for ctx in contexts {
            let Some(release) = &ctx.release else { continue };
            let strongest_algo = release.strongest_algo();

            for (task, outcome) in metadata_results {
                if !task.canonical_path.starts_with(&ctx.dists_root_canonical) {
                    continue;
                }
                if !matches!(outcome, FetchOutcome::Ok) {
                    warn!("skipping index {:?}: fetch/verification failed", task.canonical_path);
                    continue;
                }

                let is_packages = task
                    .canonical_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("Packages"))
                    .unwrap_or(false);
                let is_sources = task
                    .canonical_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("Sources"))
                    .unwrap_or(false);

                if !is_packages && !is_sources {
                    continue;
                }

                let staged = self.config.skel_path.join(task.staged_path());
                let decompressed = match crate::decompress::decompress(&staged) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("failed to decompress {staged:?}: {e}");
                        continue;
                    }
                };
                let Ok(content) = fs::read_to_string(&decompressed) else {
                    warn!("failed to read decompressed index {decompressed:?}");
                    continue;
                };

                if is_packages {
                    for entry in packages::parse(&content) {
                        let canonical_path = PathBuf::from(sanitise(
                            &packages::artifact_url(&ctx.repo.uri, &entry.filename),
                            self.config.tilde_encoding,
                        ));
                        plans.push(PlannedDownload {
                            url: packages::artifact_url(&ctx.repo.uri, &entry.filename),
                            size: Some(entry.size),
                            canonical_path,
                            strongest_algo,
                            per_file_digest: entry.digest,
                            acquire_by_hash: release.acquire_by_hash,
                            stage: Stage::Archive,
                        });
                    }
                } else {
                    for entry in sources::parse(&content) {
                        let canonical_path = PathBuf::from(sanitise(
                            &sources::artifact_url(&ctx.repo.uri, &entry.filename),
                            self.config.tilde_encoding,
                        ));
                        plans.push(PlannedDownload {
                            url: sources::artifact_url(&ctx.repo.uri, &entry.filename),
                            size: Some(entry.size),
                            canonical_path,
                            strongest_algo,
                            per_file_digest: entry.digest,
                            acquire_by_hash: release.acquire_by_hash,
                            stage: Stage::Archive,
                        });
                    }
                }
            }
        }

        plans
    }

    fn run_diffs(&self, archive_results: &[(FetchTask, FetchOutcome)]) -> Result<usize, Error> {
        let db_path = self.config.var_path.join("file_versions.json");
        let mut db = VersionDb::load(&db_path)?;
        let mut generated = 0usize;
        let now = crate::time_now();

        let mut tool_ok = true;
        if !crate::diff::tool_available(self.config.diff_algorithm) {
            warn!("diff tool for {:?} not found; disabling diff generation for this run", self.config.diff_algorithm);
            tool_ok = false;
        }

        if tool_ok {
            for (task, outcome) in archive_results {
                if !matches!(outcome, FetchOutcome::Ok) {
                    continue;
                }
                let new_file = self.config.skel_path.join(task.staged_path());
                let old_file = self.config.mirror_path.join(&task.canonical_path);
                let old_file_ref = old_file.is_file().then_some(old_file.as_path());

                match crate::diff::process_changed_file(
                    &mut db,
                    old_file_ref,
                    &new_file,
                    &task.canonical_path,
                    &self.config.diff_storage_path,
                    self.config.diff_algorithm,
                    self.config.max_diff_size_ratio,
                    now,
                ) {
                    Ok(true) => generated += 1,
                    Ok(false) => {}
                    Err(e) => warn!("diff generation failed for {:?}: {e}", task.canonical_path),
                }
            }
        }

        db.save()?;
        Ok(generated)
    }

    fn promote_all(
        &self,
        release_results: &[(FetchTask, FetchOutcome)],
        metadata_results: &[(FetchTask, FetchOutcome)],
        archive_results: &[(FetchTask, FetchOutcome)],
        skip_clean: &HashSet<PathBuf>,
    ) -> Result<(), Error> {
        for canonical in skip_clean {
            let skel_file = self.config.skel_path.join(canonical);
            if !skel_file.is_file() {
                continue;
            }
            let mirror_file = self.config.mirror_path.join(canonical);
            crate::promote::promote(&skel_file, &mirror_file, self.config.unlink)
                .with_context(|| format!("failed to promote {canonical:?}"))?;
        }

        for (task, outcome) in release_results.iter().chain(metadata_results.iter()).chain(archive_results.iter()) {
            if !matches!(outcome, FetchOutcome::Ok) {
                continue;
            }
            let skel_file = self.config.skel_path.join(task.staged_path());
            if !skel_file.is_file() {
                continue;
            }
            let mirror_file = self.config.mirror_path.join(task.staged_path());
            crate::promote::promote(&skel_file, &mirror_file, self.config.unlink)
                .with_context(|| format!("failed to promote {:?}", task.staged_path()))?;
        }

        Ok(())
    }

    fn run_postmirror_hook(&self) {
        let script = &self.config.postmirror_script;
        if !script.is_file() {
            return;
        }

        let is_executable = fs::metadata(script)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);

        let result = if is_executable {
            std::process::Command::new(script).status()
        } else {
            std::process::Command::new("/bin/sh").arg(script).status()
        };

        match result {
            Ok(status) if status.success() => info!("post-mirror hook {script:?} completed"),
            Ok(status) => warn!("post-mirror hook {script:?} exited with {status}"),
            Err(e) => warn!("failed to run post-mirror hook {script:?}: {e}"),
        }
    }
}

fn count_failures(results: &[(FetchTask, FetchOutcome)]) -> usize {
    results.iter().filter(|(_, o)| matches!(o, FetchOutcome::Failed(_))).count()
}

/// Emits the one progress line for a completed stage (§4.8's per-stage
/// progress, §10's log-facade rule — here logged as a single summary record
/// rather than an in-place rewritten line, since a stage only reports once it
/// has fully drained).
fn log_stage_progress(stage: &str, results: &[(FetchTask, FetchOutcome)]) {
    let mut progress = Progress::new(results.len(), 0);
    for (task, outcome) in results {
        match outcome {
            FetchOutcome::Ok => {
                let bytes = task.expected_size.unwrap_or(0);
                progress.total_bytes += bytes;
                progress.record_success(bytes);
            }
            FetchOutcome::Failed(_) => progress.record_failure(),
        }
    }
    info!("{stage} stage: {progress}");
}
