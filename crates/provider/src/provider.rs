//! Rate-of-change computation over registry sample pairs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use ratewatch_registry::clock::Clock;
use ratewatch_registry::{TargetSnapshot, TargetSource};

use crate::selector::LabelSelector;

/// Identifier under which the computed rate is served.
pub const METRIC_NAME: &str = "pods:apiserver_request_total:rate";

/// Errors answering a metric query.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// More than one target matched a by-name query. Duplicate pods within
    /// a tenant are an invariant violation of the upstream watcher.
    #[error("retrieving custom metric {tenant}/{pod}: multiple targets match")]
    AmbiguousTarget { tenant: String, pod: String },
}

/// Identifies the pod a [`RateValue`] describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectReference {
    pub tenant: String,
    pub pod: String,
    pub uid: String,
}

/// One served metric value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateValue {
    pub reference: ObjectReference,
    /// Request rate in milli-requests per second.
    pub value_milli: i64,
    /// Time of the newer sample of the pair.
    pub timestamp: DateTime<Utc>,
    /// The sample gap, rounded to whole seconds.
    pub window_seconds: i64,
}

/// Serves per-pod request rates computed from the last two samples of each
/// target, subject to a freshness policy.
pub struct PodMetricsProvider {
    source: Arc<dyn TargetSource>,
    /// The newest sample of a pair is valid for this long.
    max_sample_age: Duration,
    /// Pairs further apart than this are not used for rate calculation.
    max_sample_gap: Duration,
    clock: Arc<dyn Clock>,
}

impl PodMetricsProvider {
    /// Creates a provider reading from `source`.
    ///
    /// `max_sample_age`: samples older than this are not served.
    /// `max_sample_gap`: sample pairs further apart than this are skipped;
    /// the arithmetic would be correct but over-smoothed, no longer
    /// relevant to the present moment.
    pub fn new(
        source: Arc<dyn TargetSource>,
        max_sample_age: std::time::Duration,
        max_sample_gap: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            max_sample_age: Duration::from_std(max_sample_age).unwrap_or(Duration::MAX),
            max_sample_gap: Duration::from_std(max_sample_gap).unwrap_or(Duration::MAX),
            clock,
        }
    }

    /// Returns the rate for a single pod, or `None` when the pod is unknown
    /// or has no fresh sample pair.
    pub fn get_by_name(&self, tenant: &str, pod: &str) -> Result<Option<RateValue>, ProviderError> {
        let mut values = self.collect(tenant, |snapshot| snapshot.pod == pod);
        if values.len() > 1 {
            return Err(ProviderError::AmbiguousTarget {
                tenant: tenant.to_owned(),
                pod: pod.to_owned(),
            });
        }
        Ok(values.pop())
    }

    /// Returns the rates of every pod of the tenant whose labels satisfy
    /// `selector`.
    pub fn get_by_selector(&self, tenant: &str, selector: &LabelSelector) -> Vec<RateValue> {
        self.collect(tenant, |snapshot| selector.matches(&snapshot.labels))
    }

    fn collect<P>(&self, tenant: &str, predicate: P) -> Vec<RateValue>
    where
        P: Fn(&TargetSnapshot) -> bool,
    {
        let now = self.clock.now();
        let mut values = Vec::new();

        for snapshot in self.source.tenant_targets(tenant) {
            if !predicate(&snapshot) {
                continue;
            }

            let gap = snapshot.time_new - snapshot.time_old;
            if gap.is_zero() {
                // Before samples get recorded, both times sit at the epoch.
                continue;
            }
            if gap > self.max_sample_gap {
                // Too many samples missed between old and new. Also covers
                // the moment right after the very first sample, while the
                // old one still points at the epoch.
                continue;
            }
            if snapshot.time_new < now - self.max_sample_age {
                continue;
            }

            let gap_secs = gap.num_milliseconds() as f64 / 1000.0;
            let rate = (snapshot.count_new - snapshot.count_old) as f64 / gap_secs;
            values.push(RateValue {
                reference: ObjectReference {
                    tenant: snapshot.tenant,
                    pod: snapshot.pod,
                    uid: snapshot.uid,
                },
                value_milli: (rate * 1000.0) as i64,
                timestamp: snapshot.time_new,
                window_seconds: gap_secs.round() as i64,
            });
        }

        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ratewatch_registry::clock::ManualClock;
    use ratewatch_registry::Registry;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    const MAX_SAMPLE_AGE: StdDuration = StdDuration::from_secs(90);
    const MAX_SAMPLE_GAP: StdDuration = StdDuration::from_secs(600);

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn make_provider() -> (PodMetricsProvider, Arc<Registry>, Arc<ManualClock>) {
        let clock = ManualClock::new(start_time());
        let registry = Registry::new(StdDuration::from_secs(10), clock.clone());
        let provider = PodMetricsProvider::new(
            registry.clone(),
            MAX_SAMPLE_AGE,
            MAX_SAMPLE_GAP,
            clock.clone(),
        );
        (provider, registry, clock)
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_target_ideal_cycle() {
        let (provider, registry, clock) = make_provider();
        registry.upsert_target(
            "ns",
            "pod",
            "uid-1",
            labels(&[("a", "1")]),
            "https://1.2.3.4/metrics",
        );

        // Counter 1000 at t=0s, 1060 at t=60s: one request per second.
        registry.set_sample("ns", "pod", 1000);
        clock.advance(Duration::seconds(60));
        registry.set_sample("ns", "pod", 1060);
        clock.advance(Duration::seconds(1));

        let value = provider.get_by_name("ns", "pod").unwrap().unwrap();
        assert_eq!(value.value_milli, 1000);
        assert_eq!(value.window_seconds, 60);
        assert_eq!(value.timestamp, start_time() + Duration::seconds(60));
        assert_eq!(value.reference.uid, "uid-1");
        assert_eq!(value.reference.tenant, "ns");
        assert_eq!(value.reference.pod, "pod");
    }

    #[test]
    fn rejected_sample_leaves_served_value_unchanged() {
        let (provider, registry, clock) = make_provider();
        registry.upsert_target("ns", "pod", "u", labels(&[]), "");
        registry.set_sample("ns", "pod", 1000);
        clock.advance(Duration::seconds(60));
        registry.set_sample("ns", "pod", 1060);

        // Five seconds later: below the min sample gap, rejected upstream.
        clock.advance(Duration::seconds(5));
        registry.set_sample("ns", "pod", 1070);

        let value = provider.get_by_name("ns", "pod").unwrap().unwrap();
        assert_eq!(value.value_milli, 1000);
        assert_eq!(value.timestamp, start_time() + Duration::seconds(60));
    }

    #[test]
    fn unknown_pod_yields_none() {
        let (provider, _, _) = make_provider();
        assert!(provider.get_by_name("ns", "pod").unwrap().is_none());
    }

    #[test]
    fn target_without_sample_pair_is_skipped() {
        let (provider, registry, _) = make_provider();
        registry.upsert_target("ns", "pod", "u", labels(&[]), "");
        assert!(provider.get_by_name("ns", "pod").unwrap().is_none());

        // A single sample is still not a pair: the old time is the epoch,
        // making the gap exceed the ceiling.
        registry.set_sample("ns", "pod", 1000);
        assert!(provider.get_by_name("ns", "pod").unwrap().is_none());
    }

    #[test]
    fn excessive_sample_gap_is_skipped() {
        let (provider, registry, clock) = make_provider();
        registry.upsert_target("ns", "pod", "u", labels(&[("a", "1")]), "");
        registry.set_sample("ns", "pod", 1000);
        clock.advance(Duration::seconds(650));
        registry.set_sample("ns", "pod", 2000);

        let values = provider.get_by_selector("ns", &LabelSelector::everything());
        assert!(values.is_empty());
    }

    #[test]
    fn stale_samples_age_out() {
        let (provider, registry, clock) = make_provider();
        registry.upsert_target("ns", "pod", "u", labels(&[]), "");
        registry.set_sample("ns", "pod", 1000);
        clock.advance(Duration::seconds(60));
        registry.set_sample("ns", "pod", 1060);

        clock.advance(Duration::seconds(89));
        assert!(provider.get_by_name("ns", "pod").unwrap().is_some());

        clock.advance(Duration::seconds(2));
        assert!(provider.get_by_name("ns", "pod").unwrap().is_none());
    }

    #[test]
    fn selector_filters_by_labels() {
        let (provider, registry, clock) = make_provider();
        registry.upsert_target("ns", "pod-a", "u1", labels(&[("role", "apiserver")]), "");
        registry.upsert_target("ns", "pod-b", "u2", labels(&[("role", "proxy")]), "");
        for pod in ["pod-a", "pod-b"] {
            registry.set_sample("ns", pod, 1000);
        }
        clock.advance(Duration::seconds(60));
        for pod in ["pod-a", "pod-b"] {
            registry.set_sample("ns", pod, 1600);
        }

        let selector = LabelSelector::parse("role=apiserver").unwrap();
        let values = provider.get_by_selector("ns", &selector);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].reference.pod, "pod-a");
        assert_eq!(values[0].value_milli, 10_000);

        let everything = provider.get_by_selector("ns", &LabelSelector::everything());
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn unknown_tenant_yields_empty_list() {
        let (provider, _, _) = make_provider();
        assert!(provider
            .get_by_selector("nowhere", &LabelSelector::everything())
            .is_empty());
    }

    #[test]
    fn duplicate_matches_are_an_error() {
        // Duplicates cannot be produced through the registry; fake the
        // source to model the upstream invariant violation.
        struct DuplicatingSource(Vec<TargetSnapshot>);
        impl TargetSource for DuplicatingSource {
            fn tenant_targets(&self, _tenant: &str) -> Vec<TargetSnapshot> {
                self.0.clone()
            }
        }

        let clock = ManualClock::new(start_time());
        let snapshot = TargetSnapshot {
            tenant: "ns".into(),
            pod: "pod".into(),
            uid: "u".into(),
            labels: HashMap::new(),
            url: String::new(),
            count_new: 1060,
            time_new: start_time(),
            count_old: 1000,
            time_old: start_time() - Duration::seconds(60),
            last_scrape_time: start_time(),
            fault_count: 0,
        };
        let source = Arc::new(DuplicatingSource(vec![snapshot.clone(), snapshot]));
        let provider =
            PodMetricsProvider::new(source, MAX_SAMPLE_AGE, MAX_SAMPLE_GAP, clock);

        assert!(matches!(
            provider.get_by_name("ns", "pod"),
            Err(ProviderError::AmbiguousTarget { .. })
        ));
    }

    #[test]
    fn fractional_rates_are_conveyed_in_milli_units() {
        let (provider, registry, clock) = make_provider();
        registry.upsert_target("ns", "pod", "u", labels(&[]), "");
        registry.set_sample("ns", "pod", 0);
        clock.advance(Duration::seconds(40));
        registry.set_sample("ns", "pod", 10);

        let value = provider.get_by_name("ns", "pod").unwrap().unwrap();
        // 10 requests over 40 seconds: 0.25/s, i.e. 250 milli-units.
        assert_eq!(value.value_milli, 250);
        assert_eq!(value.window_seconds, 40);
    }
}
