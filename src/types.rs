//! Shared application state threaded through the router.
//!
//! All components are constructed once at startup and owned here; nothing
//! initialises lazily behind the scenes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::abuse::AbuseLimiter;
use crate::config::LimiterConfig;
use crate::directory::IdentityDirectory;
use crate::engine::AdmissionEngine;
use crate::health::{HealthOracle, HEALTH_CACHE_TTL};
use crate::server::exclude::ExclusionList;
use crate::store::SharedStore;

pub struct AppState {
    /// Header carrying the API key (configuration; default `X-API-Key`).
    pub key_header: String,
    pub exclusions: ExclusionList,
    /// Configuration file backing reloads; `None` for the built-in demo
    /// configuration, which makes reload a no-op.
    pub config_path: Option<PathBuf>,
    pub store: Arc<dyn SharedStore>,
    pub directory: IdentityDirectory,
    pub oracle: Arc<HealthOracle>,
    pub engine: AdmissionEngine,
    pub abuse: AbuseLimiter,
}

impl AppState {
    pub fn new(
        config: &LimiterConfig,
        store: Arc<dyn SharedStore>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let oracle = Arc::new(HealthOracle::new(store.clone(), HEALTH_CACHE_TTL));
        AppState {
            key_header: config.key_header.clone(),
            exclusions: ExclusionList::new(&config.exclude_paths),
            config_path,
            directory: IdentityDirectory::from_config(config),
            engine: AdmissionEngine::new(store.clone(), oracle.clone()),
            abuse: AbuseLimiter::new(store.clone()),
            oracle,
            store,
        }
    }
}
