//! One-shot termination signal owned by each cluster record.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Close-once signal that stops everything a cluster record started.
///
/// Signalling is idempotent; only the first call reports that it closed the signal.
/// A termination derived from a parent token with [Termination::child_of] is also closed
/// when the parent is cancelled, which is how process shutdown reaches every record.
#[derive(Clone, Debug, Default)]
pub struct Termination {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Closes the signal. Returns `true` only for the call that actually closed it.
    pub fn signal(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is closed, by [Termination::signal] or by the parent.
    pub async fn signaled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
