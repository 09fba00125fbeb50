//! Error taxonomy for the engine's inbound contract.
//!
//! Internal plumbing (ioctl parsing, tree walks) is free to use `anyhow::Result`
//! the way the rest of this crate's ancestry always has; everything crossing the
//! boundary into [`crate::engine::Engine`] gets collapsed into one of these kinds.

use std::path::PathBuf;

use thiserror::Error;

/// Error kinds the engine can report to a caller. These are *kinds*, not raw
/// kernel errno passthroughs: the engine categorizes failures so a caller never
/// has to interpret `errno` itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `FS_INFO` rejected the file descriptor; the path is not a btrfs mount.
    #[error("{path:?} is not a btrfs mount")]
    NotBtrfs { path: PathBuf },

    /// A btrfs ioctl returned an error from the kernel.
    #[error("ioctl {op} failed: {raw}")]
    IoctlFailed { op: &'static str, raw: String },

    /// An on-disk item was shorter than the fields the decoder needs.
    #[error("{item_type} item too short ({length} bytes)")]
    DecodeFailed { item_type: &'static str, length: usize },

    /// A stored session's filesystem path differs from the one requested.
    #[error("session at {stored:?} does not match requested path {requested:?}")]
    SessionMismatch { stored: PathBuf, requested: PathBuf },

    /// The KV store could not be opened or a write could not be committed.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// The sampler was asked to start but the filesystem has no allocated
    /// data chunks to sample from.
    #[error("no allocated data chunks on {path:?}")]
    NoAllocatedChunks { path: PathBuf },

    /// A path or device id was not found in the requested context.
    #[error("not found: {0}")]
    NotFound(String),

    /// The sampler was asked to start while already running.
    #[error("sampler already running for {path:?}")]
    AlreadyRunning { path: PathBuf },
}

pub type EngineResult<T> = Result<T, EngineError>;
