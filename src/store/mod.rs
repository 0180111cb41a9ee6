//! Shared-store client for distributed counters, health, and abuse state.
//!
//! This module owns everything that touches Redis:
//! - the bounded connection pool,
//! - the Lua scripts that keep read-compare-increment atomic across
//!   limiter instances,
//! - the circuit breaker and per-operation deadlines that bound every call.
//!
//! Counter ordering across instances is established entirely by the store;
//! there is no local locking on the hot path.

pub mod breaker;
mod error;

#[cfg(test)]
pub mod mock;

pub use breaker::CircuitBreaker;
pub use error::StoreError;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use std::collections::HashMap;
use std::future::Future;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::health::{HealthRecord, SystemHealth};

/// Store key holding the global health hash.
const HEALTH_KEY: &str = "system:health";

/// Deadline for maintenance operations (counter reset), which walk the
/// keyspace and cannot finish within the per-request deadline.
const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(2);

fn counter_key(identity: &str) -> String {
    format!("rate_limit:user:{identity}")
}

fn abuse_key(source: &str) -> String {
    format!("security:invalid_keys:{source}")
}

fn blocked_key(source: &str) -> String {
    format!("security:blocked_ip:{source}")
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Atomic window-counter script.
///
/// Executed as one indivisible unit against the window key derived from
/// `now`: read the count, refuse and backfill a missing TTL when at the
/// limit, otherwise increment and stamp TTL window+1. The extra second keeps
/// the key alive across the window boundary despite clock jitter between
/// instance and store.
static CHECK_AND_INCREMENT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local window = tonumber(ARGV[1])
        local limit = tonumber(ARGV[2])
        local now = tonumber(ARGV[3])

        local window_start = math.floor(now / window) * window
        local window_key = KEYS[1] .. ":" .. window_start

        local current = redis.call('GET', window_key)
        if current == false then
            current = 0
        else
            current = tonumber(current)
        end

        if current >= limit then
            local ttl = redis.call('TTL', window_key)
            if ttl == -1 then
                redis.call('EXPIRE', window_key, window)
            end
            return {0, current, window_start + window}
        end

        local count = redis.call('INCR', window_key)
        redis.call('EXPIRE', window_key, window + 1)
        return {1, count, window_start + window}
        "#,
    )
});

/// Health-write script: sets the hash fields and optional expiry in one unit
/// and returns the resulting hash.
static SET_HEALTH_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        redis.call('HSET', KEYS[1],
            'status', ARGV[1],
            'timestamp', ARGV[2],
            'updated_by', ARGV[3])
        local ttl = tonumber(ARGV[4])
        if ttl > 0 then
            redis.call('EXPIRE', KEYS[1], ttl)
        end
        return redis.call('HGETALL', KEYS[1])
        "#,
    )
});

/// Abuse-counter script: increment, and set the TTL only on the first
/// increment so the counter expires relative to the first attempt.
static BUMP_ABUSE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
        end
        return count
        "#,
    )
});

/// Result of an atomic counter check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    /// Committed count after the decision.
    pub count: u64,
    /// Unix timestamp at which the current window ends.
    pub reset_at: u64,
}

/// Point-in-time counter status for one identity's current window.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CounterStatus {
    pub count: u64,
    pub window_start: u64,
    pub window_end: u64,
    pub ttl: u64,
}

/// Operations the limiter needs from the shared store.
///
/// The admission engine, health oracle, and abuse sub-limiter all consume
/// this trait rather than the concrete client, so tests can swap in an
/// in-memory store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically checks and increments the counter for `(identity, window
    /// containing now)`. See the script for the exact contract.
    async fn check_and_increment(
        &self,
        identity: &str,
        limit: u64,
        window_seconds: u64,
        now: u64,
    ) -> Result<RateLimitOutcome, StoreError>;

    /// Reads the current window's counter without touching it.
    async fn read_status(
        &self,
        identity: &str,
        window_seconds: u64,
    ) -> Result<CounterStatus, StoreError>;

    /// Writes the global health value; `ttl_seconds` arms auto-expiry.
    async fn set_health(
        &self,
        status: SystemHealth,
        ttl_seconds: Option<u64>,
        updated_by: &str,
    ) -> Result<HealthRecord, StoreError>;

    /// Reads the global health value; an absent value reads as NORMAL.
    async fn get_health(&self) -> Result<HealthRecord, StoreError>;

    /// Increments the abuse counter for a source, setting the TTL only on
    /// the first increment. Returns the new count.
    async fn bump_abuse(&self, source: &str, ttl_seconds: u64) -> Result<u64, StoreError>;

    /// Checks for a block sentinel on the source.
    async fn is_blocked(&self, source: &str) -> Result<bool, StoreError>;

    /// Writes a block sentinel that expires after `duration_seconds`.
    async fn block(&self, source: &str, duration_seconds: u64) -> Result<(), StoreError>;

    /// Deletes every window counter for the identity. Returns the number of
    /// keys removed.
    async fn reset_counters(&self, identity: &str) -> Result<u64, StoreError>;

    /// Round-trips the store connection.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Circuit-breaker state name, for the service health endpoint.
    fn breaker_state(&self) -> &'static str {
        "closed"
    }
}

/// Records a breaker failure if the guarded operation is dropped before it
/// resolves (the caller was cancelled or its deadline fired upstream).
struct AbandonGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_failure();
        }
    }
}

/// Redis-backed store client with a bounded pool, a circuit breaker, and a
/// per-operation deadline.
pub struct StoreClient {
    pool: Pool,
    breaker: CircuitBreaker,
    op_timeout: Duration,
}

impl StoreClient {
    /// Builds the connection pool. No connection is attempted here; the
    /// first operation (or the periodic ping) establishes one.
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let op_timeout = config.op_timeout();
        let pool = PoolConfig::from_url(config.url())
            .builder()
            .map_err(|err| StoreError::Pool {
                message: err.to_string(),
            })?
            .max_size(config.max_connections)
            .wait_timeout(Some(op_timeout))
            .create_timeout(Some(op_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|err| StoreError::Pool {
                message: err.to_string(),
            })?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            max_connections = config.max_connections,
            op_timeout_ms = config.op_timeout_ms,
            "store connection pool created"
        );

        Ok(StoreClient {
            pool,
            breaker: CircuitBreaker::with_defaults(),
            op_timeout,
        })
    }

    /// Closes the pool. In-flight operations fail; new ones are rejected.
    pub fn close(&self) {
        self.pool.close();
        info!("store connection pool closed");
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(|err| StoreError::Pool {
            message: err.to_string(),
        })
    }

    /// Runs one store operation under the circuit breaker and a deadline.
    ///
    /// A rejected call (breaker open) is not recorded as a failure; an
    /// attempted call that errors or exceeds its deadline is, and so is an
    /// operation abandoned because the caller was cancelled mid-flight.
    async fn guarded<T, Fut>(
        &self,
        op: &'static str,
        deadline: Duration,
        fut: Fut,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if !self.breaker.try_acquire() {
            debug!(op, "store call rejected, circuit open");
            return Err(StoreError::CircuitOpen);
        }

        let mut abandon = AbandonGuard {
            breaker: &self.breaker,
            armed: true,
        };

        let result = match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(value)) => {
                self.breaker.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.breaker.on_failure();
                warn!(op, error = %err, "store operation failed");
                Err(err)
            }
            Err(_) => {
                self.breaker.on_failure();
                let timeout_ms = deadline.as_millis() as u64;
                warn!(op, timeout_ms, "store operation timed out");
                Err(StoreError::Timeout { op, timeout_ms })
            }
        };

        abandon.armed = false;
        result
    }

    fn health_record_from_hash(mut hash: HashMap<String, String>) -> HealthRecord {
        if hash.is_empty() {
            return HealthRecord::absent();
        }
        let status = hash
            .get("status")
            .map(|status| SystemHealth::parse(status))
            .unwrap_or(SystemHealth::Unknown);
        let timestamp = hash
            .get("timestamp")
            .and_then(|timestamp| timestamp.parse().ok())
            .unwrap_or_else(unix_now);
        let updated_by = hash
            .remove("updated_by")
            .unwrap_or_else(|| "system".to_string());
        HealthRecord {
            status,
            timestamp,
            updated_by,
        }
    }
}

#[async_trait]
impl SharedStore for StoreClient {
    async fn check_and_increment(
        &self,
        identity: &str,
        limit: u64,
        window_seconds: u64,
        now: u64,
    ) -> Result<RateLimitOutcome, StoreError> {
        let key = counter_key(identity);
        self.guarded("check_and_increment", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let (allowed, count, reset_at): (u8, u64, u64) = CHECK_AND_INCREMENT_SCRIPT
                .key(&key)
                .arg(window_seconds)
                .arg(limit)
                .arg(now)
                .invoke_async(&mut conn)
                .await?;
            Ok(RateLimitOutcome {
                allowed: allowed == 1,
                count,
                reset_at,
            })
        })
        .await
    }

    async fn read_status(
        &self,
        identity: &str,
        window_seconds: u64,
    ) -> Result<CounterStatus, StoreError> {
        let now = unix_now();
        let window_start = (now / window_seconds) * window_seconds;
        let window_key = format!("{}:{}", counter_key(identity), window_start);

        self.guarded("read_status", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let (count, ttl): (Option<u64>, i64) = redis::pipe()
                .get(&window_key)
                .ttl(&window_key)
                .query_async(&mut conn)
                .await?;
            Ok(CounterStatus {
                count: count.unwrap_or(0),
                window_start,
                window_end: window_start + window_seconds,
                ttl: ttl.max(0) as u64,
            })
        })
        .await
    }

    async fn set_health(
        &self,
        status: SystemHealth,
        ttl_seconds: Option<u64>,
        updated_by: &str,
    ) -> Result<HealthRecord, StoreError> {
        let timestamp = unix_now();
        self.guarded("set_health", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let hash: HashMap<String, String> = SET_HEALTH_SCRIPT
                .key(HEALTH_KEY)
                .arg(status.as_str())
                .arg(timestamp)
                .arg(updated_by)
                .arg(ttl_seconds.unwrap_or(0))
                .invoke_async(&mut conn)
                .await?;
            if hash.is_empty() {
                return Err(StoreError::BadReply { op: "set_health" });
            }
            Ok(Self::health_record_from_hash(hash))
        })
        .await
    }

    async fn get_health(&self) -> Result<HealthRecord, StoreError> {
        self.guarded("get_health", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let hash: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(HEALTH_KEY)
                .query_async(&mut conn)
                .await?;
            Ok(Self::health_record_from_hash(hash))
        })
        .await
    }

    async fn bump_abuse(&self, source: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let key = abuse_key(source);
        self.guarded("bump_abuse", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let count: u64 = BUMP_ABUSE_SCRIPT
                .key(&key)
                .arg(ttl_seconds)
                .invoke_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn is_blocked(&self, source: &str) -> Result<bool, StoreError> {
        let key = blocked_key(source);
        self.guarded("is_blocked", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let exists: u64 = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
            Ok(exists > 0)
        })
        .await
    }

    async fn block(&self, source: &str, duration_seconds: u64) -> Result<(), StoreError> {
        let key = blocked_key(source);
        self.guarded("block", self.op_timeout, async {
            let mut conn = self.conn().await?;
            redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("EX")
                .arg(duration_seconds)
                .query_async::<()>(&mut conn)
                .await?;
            Ok(())
        })
        .await?;
        warn!(source, duration_seconds, "source blocked");
        Ok(())
    }

    async fn reset_counters(&self, identity: &str) -> Result<u64, StoreError> {
        let pattern = format!("{}:*", counter_key(identity));
        let deleted = self
            .guarded("reset_counters", MAINTENANCE_TIMEOUT, async {
                let mut conn = self.conn().await?;
                let mut cursor: u64 = 0;
                let mut deleted: u64 = 0;
                loop {
                    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await?;
                    if !keys.is_empty() {
                        let removed: u64 = redis::cmd("DEL")
                            .arg(&keys)
                            .query_async(&mut conn)
                            .await?;
                        deleted += removed;
                    }
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok(deleted)
            })
            .await?;
        info!(identity, deleted, "window counters reset");
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.guarded("ping", self.op_timeout, async {
            let mut conn = self.conn().await?;
            let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
            if reply == "PONG" {
                Ok(())
            } else {
                Err(StoreError::BadReply { op: "ping" })
            }
        })
        .await
    }

    fn breaker_state(&self) -> &'static str {
        self.breaker.state_name()
    }
}
