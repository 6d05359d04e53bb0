//! Active health probing.
//!
//! # Responsibilities
//! - Periodically probe every backend's health endpoint
//! - Flip registry health flags; log only the edges
//!
//! # Design Decisions
//! - Success is status 200, body ignored
//! - A hard per-probe deadline keeps one dead backend from stalling the
//!   tick
//! - The prober never touches affinity and never tears down in-flight
//!   splices; selectors consult health on every lookup

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::HealthCheckConfig;
use crate::proxy::registry::BackendRegistry;

/// Background task probing backend liveness.
pub struct HealthProber {
    registry: Arc<BackendRegistry>,
    config: HealthCheckConfig,
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Run until the shutdown broadcast fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            timeout_secs = self.config.timeout_secs,
            path = %self.config.path,
            "Health prober started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = shutdown.recv() => {
                    tracing::debug!("Health prober stopped");
                    return;
                }
            }
        }
    }

    /// Probe every backend once.
    pub async fn probe_all(&self) {
        let deadline = Duration::from_secs(self.config.timeout_secs);
        for backend in self.registry.snapshot() {
            let url = format!("{}{}", backend.http_base, self.config.path);
            let healthy = match tokio::time::timeout(deadline, self.client.get(&url).send()).await
            {
                Ok(Ok(response)) => response.status() == reqwest::StatusCode::OK,
                Ok(Err(e)) => {
                    tracing::debug!(backend = %backend.id, error = %e, "Probe failed");
                    false
                }
                Err(_) => {
                    tracing::debug!(backend = %backend.id, "Probe timed out");
                    false
                }
            };
            self.registry.mark_healthy(&backend.id, healthy);
        }
    }
}
