//! Replenisher: keeps a floor of live credentials in the store.
//!
//! Every interval the worker counts credentials live at the replenishment
//! TTL and, when the count is below the floor, runs one bounded acquisition
//! and stores the result. Tick failures are logged and the loop carries on.
//!
//! Lifecycle is an explicit `Stopped`/`Running` machine behind a mutex:
//! `start` is idempotent, `stop` signals the loop and joins it with a timeout.

use anyhow::{Context, Result};
use beian_common::constants::DEFAULT_REPLENISH_INTERVAL_SECS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::config::ReplenisherConfig;
use crate::protocol::{CredentialAcquirer, acquire_with_retries};
use crate::store::CredentialStore;

/// Result of one maintenance pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Enough live credentials; nothing acquired
    Sufficient { live: usize },
    /// Below the floor; one credential acquired and stored
    Replenished { credential_id: String },
}

enum State {
    Stopped,
    Running {
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    },
}

struct Worker {
    store: Arc<CredentialStore>,
    acquirer: Arc<dyn CredentialAcquirer>,
    interval: Duration,
    ttl: Duration,
    floor: usize,
    attempts: u32,
}

impl Worker {
    async fn tick(&self) -> Result<TickOutcome> {
        let live = self
            .store
            .count_live(self.ttl)
            .await
            .context("Failed to count live credentials")?;
        tracing::debug!(live, floor = self.floor, "Checked credential pool");

        if live >= self.floor {
            return Ok(TickOutcome::Sufficient { live });
        }

        tracing::info!(live, floor = self.floor, "Live credentials below floor, acquiring");
        let credential = acquire_with_retries(self.acquirer.as_ref(), self.attempts).await?;
        self.store
            .insert(credential.clone())
            .await
            .context("Failed to store replenished credential")?;
        tracing::info!(credential_id = %credential.id, "Replenished credential pool");

        Ok(TickOutcome::Replenished {
            credential_id: credential.id,
        })
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            floor = self.floor,
            "Replenisher started"
        );

        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %format!("{e:#}"), "Replenisher tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("Replenisher stopped");
    }
}

pub struct Replenisher {
    worker: Arc<Worker>,
    join_timeout: Duration,
    state: Mutex<State>,
}

impl Replenisher {
    pub fn new(
        store: Arc<CredentialStore>,
        acquirer: Arc<dyn CredentialAcquirer>,
        config: &ReplenisherConfig,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                acquirer,
                interval: config
                    .interval()
                    .unwrap_or(Duration::from_secs(DEFAULT_REPLENISH_INTERVAL_SECS)),
                ttl: Duration::from_secs(config.ttl_secs),
                floor: config.floor,
                attempts: config.attempts,
            }),
            join_timeout: Duration::from_secs(config.join_timeout_secs),
            state: Mutex::new(State::Stopped),
        }
    }

    /// Spawn the loop. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Running { .. }) {
            tracing::info!("Replenisher already running");
            return false;
        }

        let (shutdown, rx) = oneshot::channel();
        let handle = tokio::spawn(self.worker.clone().run(rx));
        *state = State::Running { shutdown, handle };
        true
    }

    /// Signal the loop and wait up to the join timeout for it to exit.
    /// Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let State::Running { shutdown, handle } = std::mem::replace(&mut *state, State::Stopped) else {
            return false;
        };

        let _ = shutdown.send(());
        match tokio::time::timeout(self.join_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Replenisher task failed"),
            Err(_) => tracing::warn!(
                timeout_secs = self.join_timeout.as_secs(),
                "Replenisher did not stop in time, detaching"
            ),
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, State::Running { .. })
    }

    /// Run one maintenance pass outside the loop
    pub async fn tick(&self) -> Result<TickOutcome> {
        self.worker.tick().await
    }
}
