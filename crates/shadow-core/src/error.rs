/// Error kinds used across the shadowing engine.
///
/// Propagation policy (per the design): only engine-initialization
/// (`ShadowEngine::init`) and monitor-start (`ShadowEngine::spawn_workers`)
/// failures escape to the caller. Everything else is logged and the
/// triggering event is skipped; the monitor keeps running.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShadowError {
    /// Cannot acquire the link-creation capability. Fatal at startup.
    #[error("failed to acquire link-creation capability")]
    CapabilityDenied,

    /// A path could not be converted between representations (e.g. UTF-16
    /// round-trip failure). Logged and skipped.
    #[error("path conversion failed for {0:?}")]
    PathConversion(String),

    /// Could not generate a unique staging name.
    #[error("failed to generate a unique staging name")]
    NameGeneration,

    /// Expected during promotion; drives the suffix-retry loop. A final
    /// failure after exhausting suffixes is reported with this variant.
    #[error("destination already exists after exhausting suffix attempts")]
    LinkExists,

    /// Hard-link creation failed because the source no longer exists.
    #[error("source file disappeared before it could be shadowed: {0}")]
    SourceDisappeared(String),

    /// Duplicate key on insert; the new shadow is torn down.
    #[error("a shadow already exists for this path")]
    IndexCollision,

    /// Any other OS error during an individual event.
    #[error("transient OS error (code {code})")]
    Transient { code: u32 },

    /// Fatal per worker; the worker exits and the rest of the pool
    /// continues.
    #[error("failed to open directory for change notifications")]
    ReadDirectoryFailed,
}

pub type Result<T> = std::result::Result<T, ShadowError>;
