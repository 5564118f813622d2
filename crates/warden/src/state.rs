//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::CredentialBroker;
use crate::config::AppConfig;
use crate::protocol::{ChallengeOrchestrator, IcpClient};
use crate::query::QueryService;
use crate::replenisher::Replenisher;
use crate::solver::{Perception, Solver};
use crate::store::{CredentialStore, MemoryResultCache, RedisResultCache, ResultCache};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Consumer-facing credential broker
    pub broker: Arc<CredentialBroker>,

    /// Cached query path
    pub query: Arc<QueryService>,

    /// Background pool maintenance
    pub replenisher: Arc<Replenisher>,

    /// TTL the replenisher counts live credentials at
    pub replenish_ttl: Duration,
}

impl AppState {
    /// Load models, connect the result cache and wire the services together
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let perception = Perception::load(&config.solver).context("Failed to load perception models")?;
        tracing::info!(
            geometry = ?config.solver.geometry,
            text_targets = perception.glyphs.is_some(),
            "Perception models loaded"
        );

        let client = Arc::new(IcpClient::new(&config.api)?);
        let orchestrator = Arc::new(ChallengeOrchestrator::new(
            client.clone(),
            Arc::new(Solver::new(perception)),
        ));

        let serve_ttl = Duration::from_secs(config.store.serve_ttl_secs);
        let replenish_ttl = Duration::from_secs(config.replenisher.ttl_secs);
        let store = Arc::new(CredentialStore::new(
            config.store.path.clone(),
            serve_ttl.max(replenish_ttl),
        ));

        let result_ttl = Duration::from_secs(config.result_cache.ttl_secs);
        let cache: Arc<dyn ResultCache> = match &config.redis_url {
            Some(url) => {
                let cache = RedisResultCache::connect(url, result_ttl).await?;
                tracing::info!(redis_url = %url, "Result cache backed by Redis");
                Arc::new(cache)
            }
            None => {
                tracing::info!("No Redis configured, result cache is in-memory");
                Arc::new(MemoryResultCache::new(result_ttl))
            }
        };

        let broker = Arc::new(CredentialBroker::new(
            store.clone(),
            orchestrator.clone(),
            config.acquisition.attempts,
            serve_ttl,
        ));
        let query = Arc::new(QueryService::new(broker.clone(), client, cache, result_ttl));
        let replenisher = Arc::new(Replenisher::new(store, orchestrator, &config.replenisher));

        Ok(Self {
            broker,
            query,
            replenisher,
            replenish_ttl,
        })
    }
}
