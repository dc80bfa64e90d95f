//! Ratewatch Prometheus metrics infrastructure.
//!
//! This crate provides centralized metric definitions for the scrape
//! pipeline, plus a small HTTP server exposing them alongside a health
//! probe.

pub mod scrape;
pub mod server;

pub use server::{spawn_metrics_server, start_metrics_server};

use once_cell::sync::Lazy;
use prometheus::Registry;

/// Global Prometheus registry for all ratewatch metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    scrape::register_metrics(&registry);

    registry
});

/// Initialize all metrics. Call once at startup.
pub fn init() {
    Lazy::force(&REGISTRY);
    tracing::info!("ratewatch metrics initialized");
}
