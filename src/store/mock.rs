//! In-memory `SharedStore` used by tests.
//!
//! Mirrors the window arithmetic of the Lua counter script so engine and
//! pipeline tests can drive real fixed-window behaviour, and exposes
//! per-subsystem failure switches for exercising the fail-open/fail-closed
//! postures.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{unix_now, CounterStatus, RateLimitOutcome, SharedStore, StoreError};
use crate::health::{HealthRecord, SystemHealth};

#[derive(Default)]
pub struct MockStore {
    counters: Mutex<HashMap<String, u64>>,
    abuse: Mutex<HashMap<String, u64>>,
    blocked: Mutex<HashSet<String>>,
    health: Mutex<Option<HealthRecord>>,
    fail_counters: AtomicBool,
    fail_abuse: AtomicBool,
    fail_health: AtomicBool,
    fail_blocked: AtomicBool,
    calls: AtomicU64,
}

impl MockStore {
    pub fn new() -> Self {
        MockStore::default()
    }

    /// Make counter operations fail as if the store were unreachable.
    pub fn fail_counters(&self) {
        self.fail_counters.store(true, Ordering::SeqCst);
    }

    /// Make abuse bump/block operations fail.
    pub fn fail_abuse(&self) {
        self.fail_abuse.store(true, Ordering::SeqCst);
    }

    /// Make health reads and writes fail.
    pub fn fail_health(&self) {
        self.fail_health.store(true, Ordering::SeqCst);
    }

    /// Make block-sentinel lookups fail.
    pub fn fail_blocked(&self) {
        self.fail_blocked.store(true, Ordering::SeqCst);
    }

    /// Total store operations attempted, across all kinds.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn blocked_sources(&self) -> Vec<String> {
        self.blocked.lock().unwrap().iter().cloned().collect()
    }

    fn unavailable() -> StoreError {
        StoreError::Pool {
            message: "mock store offline".to_string(),
        }
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SharedStore for MockStore {
    async fn check_and_increment(
        &self,
        identity: &str,
        limit: u64,
        window_seconds: u64,
        now: u64,
    ) -> Result<RateLimitOutcome, StoreError> {
        self.record_call();
        if self.fail_counters.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let window_start = (now / window_seconds) * window_seconds;
        let window_key = format!("{identity}:{window_start}");
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(window_key).or_insert(0);

        if *count >= limit {
            return Ok(RateLimitOutcome {
                allowed: false,
                count: *count,
                reset_at: window_start + window_seconds,
            });
        }

        *count += 1;
        Ok(RateLimitOutcome {
            allowed: true,
            count: *count,
            reset_at: window_start + window_seconds,
        })
    }

    async fn read_status(
        &self,
        identity: &str,
        window_seconds: u64,
    ) -> Result<CounterStatus, StoreError> {
        self.record_call();
        if self.fail_counters.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let now = unix_now();
        let window_start = (now / window_seconds) * window_seconds;
        let window_key = format!("{identity}:{window_start}");
        let count = self
            .counters
            .lock()
            .unwrap()
            .get(&window_key)
            .copied()
            .unwrap_or(0);
        Ok(CounterStatus {
            count,
            window_start,
            window_end: window_start + window_seconds,
            ttl: window_seconds,
        })
    }

    async fn set_health(
        &self,
        status: SystemHealth,
        _ttl_seconds: Option<u64>,
        updated_by: &str,
    ) -> Result<HealthRecord, StoreError> {
        self.record_call();
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let record = HealthRecord {
            status,
            timestamp: unix_now(),
            updated_by: updated_by.to_string(),
        };
        *self.health.lock().unwrap() = Some(record.clone());
        Ok(record)
    }

    async fn get_health(&self) -> Result<HealthRecord, StoreError> {
        self.record_call();
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        Ok(self
            .health
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(HealthRecord::absent))
    }

    async fn bump_abuse(&self, source: &str, _ttl_seconds: u64) -> Result<u64, StoreError> {
        self.record_call();
        if self.fail_abuse.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let mut abuse = self.abuse.lock().unwrap();
        let count = abuse.entry(source.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn is_blocked(&self, source: &str) -> Result<bool, StoreError> {
        self.record_call();
        if self.fail_blocked.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        Ok(self.blocked.lock().unwrap().contains(source))
    }

    async fn block(&self, source: &str, _duration_seconds: u64) -> Result<(), StoreError> {
        self.record_call();
        if self.fail_abuse.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        self.blocked.lock().unwrap().insert(source.to_string());
        Ok(())
    }

    async fn reset_counters(&self, identity: &str) -> Result<u64, StoreError> {
        self.record_call();
        if self.fail_counters.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let prefix = format!("{identity}:");
        let mut counters = self.counters.lock().unwrap();
        let before = counters.len();
        counters.retain(|key, _| !key.starts_with(&prefix));
        Ok((before - counters.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.record_call();
        if self.fail_counters.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The mock mirrors the Lua counter script; these tests pin the shared
    // fixed-window contract it must honour.

    #[tokio::test]
    async fn test_counter_is_per_window() {
        let store = MockStore::new();
        let window_start = 1_700_000_040; // multiple of 60

        for expected in 1..=3u64 {
            let outcome = store
                .check_and_increment("alice", 3, 60, window_start + 5)
                .await
                .unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.count, expected);
            assert_eq!(outcome.reset_at, window_start + 60);
        }

        let rejected = store
            .check_and_increment("alice", 3, 60, window_start + 59)
            .await
            .unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.count, 3);
    }

    #[tokio::test]
    async fn test_window_rollover_starts_fresh() {
        let store = MockStore::new();
        let window_start = 1_700_000_040;

        for _ in 0..3 {
            store
                .check_and_increment("alice", 3, 60, window_start)
                .await
                .unwrap();
        }

        // First second of the next window: a new counter.
        let outcome = store
            .check_and_increment("alice", 3, 60, window_start + 60)
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.reset_at, window_start + 120);
    }
}
