//! Error types surfaced by fallible construction paths.
//!
//! Chain-carried completions report failure as a `success: bool` in the
//! completion tuple (see [`crate::io`]), since no chain exists yet for
//! errors that happen before a resource comes into being. This module
//! only covers that earlier class of failure.

use thiserror::Error;

/// Failures that can occur while bringing an I/O resource into
/// existence, before any [`crate::chain::Chain`] has been handed back
/// to the caller.
#[derive(Debug, Error)]
pub enum IoSetupError {
    #[error("failed to create io_uring submission queue: {0}")]
    UringInit(#[source] std::io::Error),

    #[error("failed to open file {path:?}: {source}")]
    FileOpen {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind listening socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to switch socket to non-blocking mode: {0}")]
    NonBlocking(#[source] std::io::Error),

    #[error("prefix directory {0:?} does not exist or is not a directory")]
    InvalidPrefixDirectory(std::path::PathBuf),
}
