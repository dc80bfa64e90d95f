//! Daemon runner - ties the registry, scrape pipeline, provider and
//! steering together under one supervisor.
//!
//! # Task supervision
//!
//! All long-running tasks are spawned through a [`Supervisor`]:
//! - the Prometheus metrics server,
//! - the scrape worker pool (which owns the scrape queue),
//! - the rate query endpoint,
//! - endpoint steering, when a cluster API is configured.
//!
//! Cancellation fans out to all of them on shutdown; the scraper drains its
//! in-flight scrapes and the steerer revokes the endpoint record before the
//! process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use ratewatch_provider::PodMetricsProvider;
use ratewatch_registry::clock::{Clock, SystemClock};
use ratewatch_registry::Registry;
use ratewatch_scraper::Scraper;
use ratewatch_steering::{HaService, HttpEndpointsApi, SteeringError};

use crate::api;
use crate::config::NodeConfig;
use crate::supervisor::Supervisor;

/// The ratewatch daemon.
///
/// The cluster watchers that discover targets and credentials are external
/// collaborators; they feed this process through the handle returned by
/// [`Node::registry`].
pub struct Node {
    config: NodeConfig,
    registry: Arc<Registry>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let registry = Registry::new(config.min_sample_gap(), Arc::new(SystemClock));
        Self { config, registry }
    }

    /// The registry external watchers write targets and credentials into.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Runs the daemon until interrupted.
    pub async fn run(&self) -> Result<()> {
        ratewatch_metrics::init();
        let supervisor = Supervisor::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let metrics_addr = self.config.metrics_listen;
        supervisor.spawn_cancellable("metrics-server", move |token| async move {
            ratewatch_metrics::start_metrics_server(metrics_addr, token)
                .await
                .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
        });

        let scraper = Arc::new(Scraper::new(
            self.registry.clone(),
            self.config.scrape_period(),
            self.config.flow_control_period(),
            clock.clone(),
        ));
        supervisor.spawn_cancellable("scraper", move |token| async move {
            scraper.run(token).await;
            Ok(())
        });

        let provider = Arc::new(PodMetricsProvider::new(
            self.registry.clone(),
            self.config.max_sample_age(),
            self.config.max_sample_gap(),
            clock,
        ));
        let serving_addr = self.config.serving_listen;
        supervisor.spawn_cancellable("rate-server", move |token| async move {
            api::serve_rates(serving_addr, provider, token).await
        });

        // With a single replica this process is trivially the leader; in
        // multi-replica setups an external election runner gates the term.
        if let Some(api_url) = &self.config.cluster_api_url {
            let endpoints = HttpEndpointsApi::new(
                api_url,
                self.config.cluster_api_token.as_deref().unwrap_or(""),
            )
            .context("building endpoints client")?;
            let steering = HaService::new(
                Arc::new(endpoints),
                &self.config.effective_namespace(),
                &self.config.serving_ip,
                self.config.serving_port,
            );
            supervisor.spawn_cancellable("endpoint-steering", move |token| async move {
                match steering.run(token).await {
                    Ok(()) | Err(SteeringError::Cancelled) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            });
        }

        info!("ratewatchd started");
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal...");

        supervisor.shutdown().await?;
        Ok(())
    }
}
