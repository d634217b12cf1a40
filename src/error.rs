use std::fmt;

/// Typed error kinds surfaced by the engine.
///
/// These are constructed at the point of failure and usually carried upwards as
/// `anyhow::Error` (via `?`); callers that need to branch on the kind of failure
/// (the orchestrator deciding whether something is stage-fatal or per-file) can
/// `downcast_ref::<EngineError>()` on the resulting `anyhow::Error`.
#[derive(Debug)]
pub enum EngineError {
    Config(String),
    LockHeld(std::path::PathBuf),
    Network(String),
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { algorithm: String, expected: String },
    Decompression(String),
    Io(String),
    ExternalToolMissing(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "configuration error: {msg}"),
            EngineError::LockHeld(path) => {
                write!(f, "another run is already in progress ({path:?} exists)")
            }
            EngineError::Network(msg) => write!(f, "network error: {msg}"),
            EngineError::SizeMismatch { expected, actual } => write!(
                f,
                "size mismatch: expected {expected} bytes, got {actual} bytes"
            ),
            EngineError::ChecksumMismatch { algorithm, expected } => write!(
                f,
                "checksum mismatch: expected {algorithm} {expected}"
            ),
            EngineError::Decompression(msg) => write!(f, "decompression failed: {msg}"),
            EngineError::Io(msg) => write!(f, "I/O error: {msg}"),
            EngineError::ExternalToolMissing(tool) => {
                write!(f, "external tool not found: {tool}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
