//! Admission engine: the per-request decision orchestrator.
//!
//! Stateless. For each request it resolves the key, reads health, selects
//! the effective limit, and runs the atomic counter check. Store trouble in
//! the counter step produces a fail-open fallback decision rather than an
//! error: the limiter must never turn a counter-plane outage into a global
//! request outage.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::directory::{IdentityDirectory, ResolvedIdentity};
use crate::health::HealthOracle;
use crate::policy::{effective_limit, Tier};
use crate::store::{unix_now, SharedStore};

/// Accepted API key shape: 10 to 200 characters from a URL-safe alphabet.
static KEY_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{10,200}$").unwrap());

/// Identity-resolution failures, each mapped to a client-facing code.
///
/// These are normal request outcomes, recovered locally: they produce a 4xx
/// response and feed the abuse sub-limiter, and never touch the circuit
/// breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing API key")]
    MissingKey,

    #[error("empty API key")]
    EmptyKey,

    #[error("malformed API key format")]
    MalformedKey,

    #[error("unknown API key")]
    UnknownKey,
}

impl IdentityError {
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            IdentityError::MalformedKey => StatusCode::BAD_REQUEST,
            IdentityError::MissingKey | IdentityError::EmptyKey | IdentityError::UnknownKey => {
                StatusCode::UNAUTHORIZED
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            IdentityError::MissingKey => "MISSING_API_KEY",
            IdentityError::EmptyKey => "EMPTY_API_KEY",
            IdentityError::MalformedKey => "MALFORMED_API_KEY",
            IdentityError::UnknownKey => "INVALID_API_KEY",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            IdentityError::MissingKey => "Missing API key. Provide the API key header.",
            IdentityError::EmptyKey => "Empty API key provided.",
            IdentityError::MalformedKey => "Malformed API key format.",
            IdentityError::UnknownKey => "Invalid API key provided.",
        }
    }
}

/// A short SHA-256 digest of an API key, safe to log.
///
/// Raw keys are bearer tokens and never appear in logs; the digest is stable
/// enough to correlate events for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDigest(String);

impl KeyDigest {
    pub fn of(key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
        KeyDigest(hex)
    }
}

impl std::fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", self.0)
    }
}

/// Validates the raw header value and resolves it through the directory.
///
/// Format is checked before the directory lookup: a key that fails the
/// shape check is `MalformedKey` regardless of whether some identity happens
/// to be bound to that exact string.
pub fn resolve_identity(
    raw_key: Option<&str>,
    directory: &IdentityDirectory,
) -> Result<ResolvedIdentity, IdentityError> {
    let raw_key = raw_key.ok_or(IdentityError::MissingKey)?;
    let key = raw_key.trim();
    if key.is_empty() {
        return Err(IdentityError::EmptyKey);
    }
    if !KEY_FORMAT.is_match(key) {
        return Err(IdentityError::MalformedKey);
    }
    directory.resolve(key).ok_or(IdentityError::UnknownKey)
}

/// Per-request admission decision. Attached to request-scoped state and
/// echoed in response headers; never persisted.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp at which the current window ends.
    pub reset_at: u64,
    pub identity: String,
    pub tier: String,
}

impl AdmissionDecision {
    /// Seconds until the window resets, floored at one for Retry-After.
    pub fn retry_after(&self, now: u64) -> u64 {
        self.reset_at.saturating_sub(now).max(1)
    }
}

/// Orchestrates one admission decision per request.
pub struct AdmissionEngine {
    store: Arc<dyn SharedStore>,
    oracle: Arc<HealthOracle>,
}

impl AdmissionEngine {
    pub fn new(store: Arc<dyn SharedStore>, oracle: Arc<HealthOracle>) -> Self {
        AdmissionEngine { store, oracle }
    }

    /// Runs health lookup, limit selection, and the atomic counter check for
    /// an already-resolved identity.
    pub async fn admit(&self, resolved: &ResolvedIdentity) -> AdmissionDecision {
        let health = self.oracle.current().await;
        let tier = Tier::from_name(&resolved.tier_name);
        let limit = effective_limit(tier, &resolved.limits, health);
        let window = resolved.limits.window_seconds;

        debug!(
            identity = %resolved.identity,
            tier = %resolved.tier_name,
            health = %health,
            limit,
            "effective limit selected"
        );

        match self
            .store
            .check_and_increment(&resolved.identity, limit, window, unix_now())
            .await
        {
            Ok(outcome) => AdmissionDecision {
                admitted: outcome.allowed,
                limit,
                remaining: if outcome.allowed {
                    limit.saturating_sub(outcome.count)
                } else {
                    0
                },
                reset_at: outcome.reset_at,
                identity: resolved.identity.clone(),
                tier: resolved.tier_name.clone(),
            },
            Err(err) => {
                // Counter plane unavailable: admit with one token of
                // headroom so legitimate traffic keeps flowing while an
                // operator responds.
                warn!(
                    identity = %resolved.identity,
                    error = %err,
                    "counter check failed, using fallback decision"
                );
                AdmissionDecision {
                    admitted: true,
                    limit,
                    remaining: 1,
                    reset_at: unix_now() + window,
                    identity: resolved.identity.clone(),
                    tier: resolved.tier_name.clone(),
                }
            }
        }
    }
}
