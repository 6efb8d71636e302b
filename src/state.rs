//! Application state: every process-wide singleton, owned in one place
//! and passed explicitly through the router.
//!
//! Cloning is cheap; each service wraps its shared interior in an `Arc`.

use std::sync::Arc;

use anyhow::Result;

use crate::apple::AppleVerifier;
use crate::auth::Authenticator;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::cost_guard::CostGuard;
use crate::hosted::HostedImages;
use crate::pricing::PricingTable;
use crate::providers::{shared_client, ProviderRegistry};
use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;
use crate::store::Store;
use crate::tower::TowerState;
use crate::usage::UsageLog;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub pricing: Arc<PricingTable>,
    pub store: Store,
    pub sessions: SessionStore,
    pub rate_limiter: RateLimiter,
    pub usage: UsageLog,
    pub cost_guard: CostGuard,
    pub auth: Authenticator,
    pub apple: AppleVerifier,
    pub providers: Arc<ProviderRegistry>,
    pub tower: TowerState,
    pub hosted: HostedImages,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let store = if config.database_path == ":memory:" {
            Store::open_in_memory()?
        } else {
            Store::open(&config.database_path)?
        };
        Ok(Self::with_store(config, store))
    }

    fn with_store(config: Config, store: Store) -> Self {
        let config = Arc::new(config);
        let client = shared_client();

        let sessions = SessionStore::new(config.session_ttl_secs);
        let usage = UsageLog::new(store.clone());
        let cost_guard = CostGuard::new(
            usage.clone(),
            config.cost_limits,
            config.cost_fail_closed,
        );
        let auth = Authenticator::new(config.clone(), sessions.clone());
        let apple = AppleVerifier::new(client.clone(), config.apple_bundle_ids.clone());
        let providers = Arc::new(ProviderRegistry::new(&config));
        let tower = TowerState::from_config(&config);
        let hosted = HostedImages::new(store.clone(), client, config.hosted_images.clone());

        Self {
            store,
            rate_limiter: RateLimiter::new(config.rate_limit),
            catalog: Arc::new(Catalog::default_catalog()),
            pricing: Arc::new(PricingTable::default_table()),
            sessions,
            usage,
            cost_guard,
            auth,
            apple,
            providers,
            tower,
            hosted,
            config,
        }
    }

    /// In-memory state for tests, regardless of `database_path`.
    #[cfg(test)]
    pub fn for_tests(config: Config) -> Self {
        Self::with_store(config, Store::open_in_memory().expect("in-memory store"))
    }

    /// Kick off the background maintenance tasks. Handles are detached;
    /// they live for the server's lifetime.
    pub fn spawn_background_tasks(&self) {
        self.sessions.spawn_reaper();
        self.rate_limiter.spawn_sweeper();
        self.usage.spawn_flusher();
        self.tower.spawn_sweeper();
        if self.config.hosted_images.enabled {
            self.hosted.spawn_culler();
        }
    }
}
