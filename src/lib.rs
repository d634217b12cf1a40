//! Concurrent, checksum-verified mirroring engine for APT repositories.
//!
//! It implements the following features:
//! - local storage in a hardlink-based pool (`skel/` staging, `mirror/` published tree)
//! - checksum-verified, concurrent fetching of only the files that changed since the
//!   last run
//! - by-hash acquisition, binary diff generation and stale-file cleanup

use std::path::Path;

use anyhow::Error;

pub mod byhash;
pub mod checksum;
pub mod cleanup;
pub mod config;
pub mod deb822;
pub mod decompress;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod packages;
pub mod path_utils;
pub mod pipeline;
pub mod progress;
pub mod promote;
pub mod release;
pub mod sources;

/// Current wall-clock time as a Unix epoch, used to stamp version-database
/// records (§4.9). Thin wrapper so the rest of the crate never calls
/// `proxmox_time` directly.
pub(crate) fn time_now() -> i64 {
    proxmox_time::epoch_i64()
}

/// Loads the configuration at `config_path` and runs one full mirroring
/// pass. This is the single entry point the CLI binary calls.
pub fn run(config_path: &Path) -> Result<pipeline::RunSummary, Error> {
    let config = config::EngineConfig::load(config_path)?;
    pipeline::Engine::new(config).run()
}
