//! Abuse sub-limiter for unauthenticated attempts.
//!
//! Counts failed identity resolutions per source and blocks sources that
//! keep guessing. Unlike the admission path, this sub-limiter fails CLOSED:
//! unauthenticated traffic is the attack surface, and losing visibility into
//! attempt counts is a reason to deny, not to admit. The two postures are
//! deliberately separate code paths.

use std::sync::Arc;
use tracing::warn;

use crate::store::SharedStore;

/// Sliding window for counting invalid-key attempts.
pub const ATTEMPT_WINDOW_SECONDS: u64 = 5 * 60;

/// Attempts tolerated within the window before the source is blocked.
pub const MAX_ATTEMPTS: u64 = 10;

/// How long a blocked source stays blocked.
pub const BLOCK_DURATION_SECONDS: u64 = 15 * 60;

/// Outcome of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseVerdict {
    /// Within tolerance; the caller returns the original identity error.
    Tolerated,
    /// Over the attempt limit (or the store is unavailable); the caller
    /// returns the blocked-source response.
    Blocked,
}

/// Per-source limiter for failed identity resolutions.
pub struct AbuseLimiter {
    store: Arc<dyn SharedStore>,
    max_attempts: u64,
    attempt_window_seconds: u64,
    block_duration_seconds: u64,
}

impl AbuseLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        AbuseLimiter {
            store,
            max_attempts: MAX_ATTEMPTS,
            attempt_window_seconds: ATTEMPT_WINDOW_SECONDS,
            block_duration_seconds: BLOCK_DURATION_SECONDS,
        }
    }

    #[cfg(test)]
    pub fn with_max_attempts(store: Arc<dyn SharedStore>, max_attempts: u64) -> Self {
        AbuseLimiter {
            store,
            max_attempts,
            attempt_window_seconds: ATTEMPT_WINDOW_SECONDS,
            block_duration_seconds: BLOCK_DURATION_SECONDS,
        }
    }

    /// Checks for an existing block sentinel on the source.
    ///
    /// A failed lookup reads as not-blocked: the request then proceeds to
    /// identity resolution, and any unauthenticated attempt still lands in
    /// the fail-closed `record_failed_attempt` below, so store trouble never
    /// lets unauthenticated traffic through.
    pub async fn is_blocked(&self, source: &str) -> bool {
        match self.store.is_blocked(source).await {
            Ok(blocked) => blocked,
            Err(err) => {
                warn!(source, error = %err, "block lookup failed, treating as not blocked");
                false
            }
        }
    }

    /// Records one failed identity resolution for the source.
    ///
    /// Over the attempt limit the source is blocked for
    /// `BLOCK_DURATION_SECONDS`. If the store cannot even count the attempt,
    /// the verdict is `Blocked` (fail closed).
    pub async fn record_failed_attempt(&self, source: &str) -> AbuseVerdict {
        let count = match self
            .store
            .bump_abuse(source, self.attempt_window_seconds)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!(source, error = %err, "abuse counter unavailable, failing closed");
                return AbuseVerdict::Blocked;
            }
        };

        if count > self.max_attempts {
            warn!(
                source,
                count,
                max_attempts = self.max_attempts,
                "source exceeded invalid-key attempts, blocking"
            );
            if let Err(err) = self
                .store
                .block(source, self.block_duration_seconds)
                .await
            {
                // The sentinel write failed; this request is still denied.
                warn!(source, error = %err, "failed to persist source block");
            }
            return AbuseVerdict::Blocked;
        }

        AbuseVerdict::Tolerated
    }

    pub fn block_duration_seconds(&self) -> u64 {
        self.block_duration_seconds
    }
}
