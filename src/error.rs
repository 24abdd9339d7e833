//! Error types for reconciliation passes.
//!
//! Errors are categorized so the engine can tell a recoverable missing
//! precondition apart from a failure that must park the machine in a
//! degraded phase until an input changes.

use thiserror::Error;

/// Errors surfaced by a reconciliation pass.
#[derive(Debug, Error)]
pub enum Error {
    /// A required precondition is not yet satisfied. Recoverable: the
    /// pass simply re-evaluates on the next input change.
    #[error("not ready: {what} missing")]
    NotReady { what: &'static str },

    /// Two mutually-exclusive database relations are ready at the same
    /// time. Blocked until resolved externally.
    #[error("conflicting database relations ready: {kinds}")]
    ConfigConflict { kinds: String },

    /// Package installation or the provision command failed.
    #[error("dependency installation failed: {detail}")]
    InstallFailure { detail: String },

    /// Writing the service definition or signaling the supervisor failed.
    #[error("service apply failed: {detail}")]
    ApplyFailure { detail: String },
}

impl Error {
    /// Whether this error parks the engine in a degraded phase.
    ///
    /// `NotReady` is the only kind that does not: it is re-evaluated
    /// silently on the next event.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::NotReady { .. })
    }
}
