//! Error types for the view backend
//!
//! The embedder-facing entry points collapse these into `bool`/`Option`
//! results; the typed variants exist so callers inside Rust can tell a
//! missing capability apart from an OS failure.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::popup::PopupId;
use crate::view_display::SurfaceId;

/// Failures talking to the upstream compositor.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to the upstream compositor: {0}")]
    Connect(String),

    #[error("upstream dispatch failed: {0}")]
    Dispatch(String),

    #[error("upstream global `{0}` is not advertised")]
    MissingGlobal(&'static str),

    #[error("failed to bind upstream `{interface}`: {message}")]
    Bind {
        interface: &'static str,
        message: String,
    },

    #[error("shared-memory format {0:#010x} cannot be expressed upstream")]
    UnsupportedFormat(u32),
}

/// Reasons `ViewBackend::alloc_buffer` returns no buffer.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no wl_shm global is available upstream")]
    NoShm,

    #[error("environment variable {0} is not set")]
    NoRuntimeDir(String),

    #[error("refusing to allocate an empty {width}x{height} buffer")]
    EmptyBuffer { width: u32, height: u32 },

    #[error("a {width}x{height} buffer does not fit the shared-memory protocol")]
    TooLarge { width: u32, height: u32 },

    #[error("failed to create shared-memory file from template {path:?}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to size shared-memory file to {size} bytes")]
    Truncate {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {size} bytes of shared memory")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Misuse of the backend's object tables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("no on-screen main surface exists to parent a popup")]
    NoMainSurface,

    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceId),

    #[error("unknown popup {0:?}")]
    UnknownPopup(PopupId),
}
