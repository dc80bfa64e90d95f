//! Scrape pipeline metrics.

use once_cell::sync::Lazy;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};

pub static SCRAPES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "ratewatch_scrapes_total",
        "Total successful target scrapes",
    )
    .expect("metric can be created")
});

pub static SCRAPE_FAULTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "ratewatch_scrape_faults_total",
        "Total failed target scrapes",
    )
    .expect("metric can be created")
});

pub static SCRAPE_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(prometheus::histogram_opts!(
        "ratewatch_scrape_duration_seconds",
        "Wall-clock duration of individual scrapes",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ))
    .expect("metric can be created")
});

pub static QUEUE_TARGETS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ratewatch_queue_targets",
        "Targets currently tracked by the scrape queue",
    )
    .expect("metric can be created")
});

pub static ACTIVE_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ratewatch_active_workers",
        "Scrape workers currently running",
    )
    .expect("metric can be created")
});

/// Register all scrape pipeline collectors with `registry`.
pub fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(SCRAPES_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SCRAPE_FAULTS_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SCRAPE_DURATION_SECONDS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(QUEUE_TARGETS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ACTIVE_WORKERS.clone()))
        .expect("collector can be registered");
}
