//! In-memory identity directory: API key -> identity -> tier.
//!
//! Built from configuration at startup. Lookups on the hot path clone an
//! `Arc` snapshot under a briefly held read lock; a reload builds a whole
//! new snapshot off to the side and swaps it in atomically, so readers
//! never observe a half-constructed table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::config::{LimiterConfig, TierLimits};

/// A successfully resolved API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub identity: String,
    pub tier_name: String,
    pub limits: TierLimits,
}

struct DirectoryTable {
    /// key -> identity (many-to-one)
    keys: HashMap<String, String>,
    /// identity -> (tier name, limits) (one-to-one)
    identities: HashMap<String, (String, TierLimits)>,
}

impl DirectoryTable {
    fn build(config: &LimiterConfig) -> Self {
        let mut identities = HashMap::with_capacity(config.identities.len());
        for (identity, tier_name) in &config.identities {
            // Validated at load time; an identity without a tier cannot get here.
            if let Some(limits) = config.tier_limits(tier_name) {
                identities.insert(
                    identity.clone(),
                    (tier_name.clone(), limits.clone()),
                );
            }
        }

        DirectoryTable {
            keys: config.api_keys.clone(),
            identities,
        }
    }
}

/// Read-mostly directory with atomic whole-table replacement on reload.
pub struct IdentityDirectory {
    table: RwLock<Arc<DirectoryTable>>,
}

impl IdentityDirectory {
    pub fn from_config(config: &LimiterConfig) -> Self {
        let table = DirectoryTable::build(config);
        info!(
            api_keys = table.keys.len(),
            identities = table.identities.len(),
            "identity directory loaded"
        );
        IdentityDirectory {
            table: RwLock::new(Arc::new(table)),
        }
    }

    fn snapshot(&self) -> Arc<DirectoryTable> {
        match self.table.read() {
            Ok(table) => Arc::clone(&table),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Resolves a well-formed API key to its identity and tier.
    ///
    /// Returns `None` for keys the directory does not know. Format checks
    /// happen before this lookup, in the admission engine.
    pub fn resolve(&self, key: &str) -> Option<ResolvedIdentity> {
        let table = self.snapshot();
        let identity = table.keys.get(key)?;
        let (tier_name, limits) = table.identities.get(identity)?;
        Some(ResolvedIdentity {
            identity: identity.clone(),
            tier_name: tier_name.clone(),
            limits: limits.clone(),
        })
    }

    /// Looks up an identity's tier directly, for the admin status surface.
    pub fn tier_of(&self, identity: &str) -> Option<(String, TierLimits)> {
        let table = self.snapshot();
        table.identities.get(identity).cloned()
    }

    /// Re-materialises both maps from a freshly validated configuration.
    /// The new table becomes visible to all readers in one step.
    pub fn replace(&self, config: &LimiterConfig) {
        let table = Arc::new(DirectoryTable::build(config));
        let counts = (table.keys.len(), table.identities.len());
        match self.table.write() {
            Ok(mut current) => *current = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
        info!(
            api_keys = counts.0,
            identities = counts.1,
            "identity directory reloaded"
        );
    }

    /// (api key count, identity count), for status reporting.
    pub fn counts(&self) -> (usize, usize) {
        let table = self.snapshot();
        (table.keys.len(), table.identities.len())
    }
}
