//! Error types for the defragmentation shim.
//!
//! Per the error-handling design, most of these never reach a caller as a
//! `Result`: backend I/O failures and invariant violations are fatal and are
//! converted to a logged `panic!` at the boundary that detects them (see
//! [`crate::fatal`]). `ShimError` exists so the internal plumbing can still
//! use `?` before that conversion happens.

use std::fmt;

/// Errors internal to the shim's plumbing.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    /// The backing store reported an error. Treated as fatal wherever it
    /// surfaces, since the store's consistency can no longer be reasoned
    /// about once it fails.
    #[error("persistence backend error: {0}")]
    Db(#[from] rusqlite::Error),

    /// A blob I/O operation against the backing store failed. Treated as
    /// fatal like [`ShimError::Db`], for the same reason.
    #[error("persistence backend blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A second transport instance was constructed, or an operation was
    /// attempted before `initialize()` completed.
    #[error("shim already initialized")]
    AlreadyInitialized,

    /// An operation that requires both the API and DB halves to be
    /// initialized was attempted too early.
    #[error("shim not initialized")]
    NotInitialized,

    /// A rehydrated outbound row disagreed with its own metadata. Not
    /// surfaced to callers; recorded here so tests can assert on the
    /// reason without parsing log output.
    #[error("rehydration disagreement for friend {friend} id {id}: {reason}")]
    RehydrationMismatch {
        friend: u32,
        id: u64,
        reason: RehydrationDisagreement,
    },
}

/// The specific way a rehydrated row disagreed with the re-split payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydrationDisagreement {
    PartCountMismatch,
    ConfirmedLengthMismatch,
    ConfirmedCountMismatch,
}

impl fmt::Display for RehydrationDisagreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RehydrationDisagreement::PartCountMismatch => "re-split part count disagrees with frags_num",
            RehydrationDisagreement::ConfirmedLengthMismatch => {
                "confirmed bitmap length disagrees with frags_num"
            }
            RehydrationDisagreement::ConfirmedCountMismatch => {
                "confirmed bitmap popcount disagrees with frags_done"
            }
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;

/// Convert a fatal [`ShimError`] into a logged abort. Backend I/O failure
/// and programming invariant violations are both unrecoverable here: the
/// store's consistency can't otherwise be reasoned about, so the process
/// aborts after a diagnostic rather than continuing on corrupted state.
///
/// Call this at the outermost entry point that observes the error; do not
/// let `Db`/invariant errors propagate past the shim's public API.
#[track_caller]
pub fn fatal(err: ShimError) -> ! {
    tracing::error!(error = %err, "fatal error in defragmentation shim, aborting");
    panic!("fragshim: fatal error: {err}");
}
