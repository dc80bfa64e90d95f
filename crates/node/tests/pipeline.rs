//! End-to-end scrape pipeline test: registry, queue, worker pool and
//! provider wired together, with the HTTP client faked out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ratewatch_provider::{LabelSelector, PodMetricsProvider};
use ratewatch_registry::clock::ManualClock;
use ratewatch_registry::Registry;
use ratewatch_scraper::{MetricsClient, ScrapeError, Scraper};

const SCRAPE_PERIOD: Duration = Duration::from_secs(60);
const FLOW_PERIOD: Duration = Duration::from_millis(20);
const MIN_SAMPLE_GAP: Duration = Duration::from_secs(10);
const MAX_SAMPLE_AGE: Duration = Duration::from_secs(90);
const MAX_SAMPLE_GAP: Duration = Duration::from_secs(600);

/// Serves programmable counter totals keyed by scrape URL.
struct FakeApiserver {
    totals: Mutex<HashMap<String, i64>>,
}

impl FakeApiserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            totals: Mutex::new(HashMap::new()),
        })
    }

    fn set_total(&self, url: &str, total: i64) {
        self.totals.lock().insert(url.to_owned(), total);
    }
}

#[async_trait]
impl MetricsClient for FakeApiserver {
    async fn total_request_count(
        &self,
        url: &str,
        _token: &str,
        _ca_pem: &[u8],
    ) -> Result<i64, ScrapeError> {
        match self.totals.lock().get(url) {
            Some(total) => Ok(*total),
            None => Err(ScrapeError::Status(404)),
        }
    }
}

struct Pipeline {
    registry: Arc<Registry>,
    clock: Arc<ManualClock>,
    apiserver: Arc<FakeApiserver>,
    provider: PodMetricsProvider,
    cancel: CancellationToken,
    run: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    async fn start() -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let registry = Registry::new(MIN_SAMPLE_GAP, clock.clone());
        let apiserver = FakeApiserver::new();
        let scraper = Arc::new(
            Scraper::new(registry.clone(), SCRAPE_PERIOD, FLOW_PERIOD, clock.clone())
                .with_client(apiserver.clone()),
        );
        let provider = PodMetricsProvider::new(
            registry.clone(),
            MAX_SAMPLE_AGE,
            MAX_SAMPLE_GAP,
            clock.clone(),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn(scraper.run(cancel.clone()));

        Self {
            registry,
            clock,
            apiserver,
            provider,
            cancel,
            run,
        }
    }

    fn add_target(&self, pod: &str, labels: &[(&str, &str)], total: i64) {
        let url = format!("https://{pod}/metrics");
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.registry
            .upsert_target("shoot--a", pod, &format!("uid-{pod}"), labels, &url);
        self.registry.set_auth_token("shoot--a", "bearer-token");
        self.registry.set_ca_bundle("shoot--a", Some(b"pem"));
        self.apiserver.set_total(&url, total);
    }

    async fn wait_for_count(&self, pod: &str, expected: i64) {
        for _ in 0..1000 {
            if self
                .registry
                .get_target("shoot--a", pod)
                .is_some_and(|t| t.count_new == expected)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pod {pod} never reached counter {expected}");
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.run)
            .await
            .expect("scraper did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn full_cycle_produces_served_rates() {
    let pipeline = Pipeline::start().await;
    pipeline.add_target("pod-a", &[("role", "apiserver")], 1000);
    pipeline.add_target("pod-b", &[("role", "apiserver")], 5000);

    // First lap: both targets are scraped eagerly.
    pipeline.wait_for_count("pod-a", 1000).await;
    pipeline.wait_for_count("pod-b", 5000).await;

    // One sample is not a pair yet: nothing is served.
    assert!(pipeline
        .provider
        .get_by_name("shoot--a", "pod-a")
        .unwrap()
        .is_none());

    // Advance one scrape period; the next lap sees increased counters.
    pipeline.apiserver.set_total("https://pod-a/metrics", 1060);
    pipeline.apiserver.set_total("https://pod-b/metrics", 5120);
    pipeline.clock.advance(ChronoDuration::seconds(60));

    pipeline.wait_for_count("pod-a", 1060).await;
    pipeline.wait_for_count("pod-b", 5120).await;

    let value = pipeline
        .provider
        .get_by_name("shoot--a", "pod-a")
        .unwrap()
        .expect("fresh rate for pod-a");
    assert_eq!(value.value_milli, 1000);
    assert_eq!(value.window_seconds, 60);
    assert_eq!(value.reference.uid, "uid-pod-a");

    let values = pipeline
        .provider
        .get_by_selector("shoot--a", &LabelSelector::parse("role=apiserver").unwrap());
    assert_eq!(values.len(), 2);
    let pod_b = values
        .iter()
        .find(|v| v.reference.pod == "pod-b")
        .expect("pod-b served");
    assert_eq!(pod_b.value_milli, 2000);

    pipeline.stop().await;
}

#[tokio::test]
async fn between_laps_no_extra_scrapes_happen() {
    let pipeline = Pipeline::start().await;
    pipeline.add_target("pod-a", &[], 1000);
    pipeline.wait_for_count("pod-a", 1000).await;

    // With frozen time the target is not due; several flow-control periods
    // later the stored sample must be unchanged.
    pipeline.apiserver.set_total("https://pod-a/metrics", 9999);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = pipeline.registry.get_target("shoot--a", "pod-a").unwrap();
    assert_eq!(snapshot.count_new, 1000);

    pipeline.stop().await;
}

#[tokio::test]
async fn removed_target_stops_being_scraped_and_served() {
    let pipeline = Pipeline::start().await;
    pipeline.add_target("pod-a", &[], 1000);
    pipeline.wait_for_count("pod-a", 1000).await;

    pipeline.registry.remove_target("shoot--a", "pod-a");
    assert!(pipeline
        .provider
        .get_by_selector("shoot--a", &LabelSelector::everything())
        .is_empty());

    // The queue eventually drains the delete event.
    pipeline.clock.advance(ChronoDuration::seconds(61));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.registry.get_target("shoot--a", "pod-a").is_none());

    pipeline.stop().await;
}

#[tokio::test]
async fn failing_target_accumulates_faults_until_it_recovers() {
    let pipeline = Pipeline::start().await;
    // A target with credentials but no programmed response scrapes a 404.
    let url = "https://pod-a/metrics";
    pipeline
        .registry
        .upsert_target("shoot--a", "pod-a", "uid", HashMap::new(), url);
    pipeline.registry.set_auth_token("shoot--a", "bearer-token");
    pipeline.registry.set_ca_bundle("shoot--a", Some(b"pem"));

    for _ in 0..1000 {
        let faults = pipeline
            .registry
            .get_target("shoot--a", "pod-a")
            .map(|t| t.fault_count)
            .unwrap_or(0);
        if faults >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pipeline.registry.get_target("shoot--a", "pod-a").unwrap().fault_count >= 1);

    // Recovery: a later lap succeeds and clears the fault count.
    pipeline.apiserver.set_total(url, 777);
    pipeline.clock.advance(ChronoDuration::seconds(61));
    pipeline.wait_for_count("pod-a", 777).await;
    assert_eq!(
        pipeline
            .registry
            .get_target("shoot--a", "pod-a")
            .unwrap()
            .fault_count,
        0
    );

    pipeline.stop().await;
}
