//! Global system health state and the local read-through cache.
//!
//! Health is a single value shared by all limiter instances through the
//! store. The admission path only ever reads it, and reads go through a
//! short-TTL local cache so a health flip becomes visible fleet-wide within
//! the cache TTL without a store round-trip per request.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::store::{unix_now, SharedStore, StoreError};

/// How long a locally cached health value stays fresh.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(2);

/// Global system health states that drive the limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemHealth {
    Normal,
    Degraded,
    /// A stored value that parsed to neither known state. Read-only: the
    /// policy collapses it to the safe base limit, and writes reject it.
    Unknown,
}

impl SystemHealth {
    /// Parses a stored status string. Anything unrecognised maps to
    /// `Unknown` rather than failing the read path.
    pub fn parse(value: &str) -> Self {
        match value {
            "NORMAL" => SystemHealth::Normal,
            "DEGRADED" => SystemHealth::Degraded,
            _ => SystemHealth::Unknown,
        }
    }

    /// Parses an operator-supplied status. Only the two settable states are
    /// accepted.
    pub fn from_request(value: &str) -> Option<Self> {
        match value {
            "NORMAL" => Some(SystemHealth::Normal),
            "DEGRADED" => Some(SystemHealth::Degraded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemHealth::Normal => "NORMAL",
            SystemHealth::Degraded => "DEGRADED",
            SystemHealth::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The health value as stored, with its metadata fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: SystemHealth,
    /// Unix timestamp of the last update.
    pub timestamp: u64,
    pub updated_by: String,
}

impl HealthRecord {
    /// The record reads resolve to when the store holds no health value.
    pub fn absent() -> Self {
        HealthRecord {
            status: SystemHealth::Normal,
            timestamp: unix_now(),
            updated_by: "system".to_string(),
        }
    }
}

/// A cached health value published as one immutable record, so readers never
/// observe a torn (value, fetched_at) pair.
#[derive(Clone, Copy)]
struct CachedHealth {
    status: SystemHealth,
    fetched_at: Instant,
}

/// Read path for global health with a short-TTL local cache.
///
/// Racing cache misses may both fetch; the last writer wins, which is
/// harmless because both fetched fresh values.
pub struct HealthOracle {
    store: Arc<dyn SharedStore>,
    cache: RwLock<Option<CachedHealth>>,
    cache_ttl: Duration,
}

impl HealthOracle {
    pub fn new(store: Arc<dyn SharedStore>, cache_ttl: Duration) -> Self {
        HealthOracle {
            store,
            cache: RwLock::new(None),
            cache_ttl,
        }
    }

    /// Returns the current health state for the admission path.
    ///
    /// Serves from the local cache when fresh; otherwise fetches from the
    /// store and republishes the cache entry. A failed fetch returns
    /// `Normal` without caching, so good-actor traffic is never degraded by
    /// transient store trouble.
    pub async fn current(&self) -> SystemHealth {
        if let Some(cached) = self.fresh_cached() {
            return cached;
        }

        match self.store.get_health().await {
            Ok(record) => {
                let entry = CachedHealth {
                    status: record.status,
                    fetched_at: Instant::now(),
                };
                if let Ok(mut cache) = self.cache.write() {
                    *cache = Some(entry);
                }
                record.status
            }
            Err(err) => {
                warn!(error = %err, "health fetch failed, assuming NORMAL");
                SystemHealth::Normal
            }
        }
    }

    fn fresh_cached(&self) -> Option<SystemHealth> {
        let cache = self.cache.read().ok()?;
        let cached = (*cache)?;
        if cached.fetched_at.elapsed() < self.cache_ttl {
            Some(cached.status)
        } else {
            None
        }
    }

    /// Writes a new health state to the store.
    ///
    /// The local cache is left untouched; this instance converges through
    /// the same read path as every other instance. An optional TTL lets the
    /// stored value expire back to NORMAL automatically.
    pub async fn set(
        &self,
        status: SystemHealth,
        ttl_seconds: Option<u64>,
        updated_by: &str,
    ) -> Result<HealthRecord, StoreError> {
        let record = self.store.set_health(status, ttl_seconds, updated_by).await?;
        info!(
            status = %record.status,
            updated_by = %record.updated_by,
            ttl_seconds,
            "system health updated"
        );
        Ok(record)
    }

    /// Reads the stored record directly, bypassing the cache. Used by the
    /// admin surface, where staleness would be confusing.
    pub async fn snapshot(&self) -> Result<HealthRecord, StoreError> {
        self.store.get_health().await
    }
}
