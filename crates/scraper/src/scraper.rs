//! Adaptive scrape worker pool.
//!
//! The [`Scraper`] tracks the targets in a [`Registry`] through its
//! [`ScrapeQueue`] and populates the registry back with scraped counter
//! values. Parallelism is adjusted in *shifts*: a periodic tick sizes the
//! next batch of workers from the previous shift's observed throughput.
//! Growth is capped at doubling per shift to prevent stampedes; shrinkage is
//! one worker at a time to avoid oscillation.
//!
//! The implementation is sized for fleets of tens to thousands of targets.
//! Far below that it is functionally correct but slightly suboptimal; far
//! above it, contention on the queue lock may become a bottleneck.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use ratewatch_metrics::scrape::{
    ACTIVE_WORKERS, SCRAPES_TOTAL, SCRAPE_DURATION_SECONDS, SCRAPE_FAULTS_TOTAL,
};
use ratewatch_registry::clock::Clock;
use ratewatch_registry::Registry;

use crate::client::{HttpMetricsClient, MetricsClient};
use crate::error::ScrapeError;
use crate::parse::DEFAULT_COUNTER_NAME;
use crate::queue::{ScrapeQueue, ScrapeTarget};

/// Parameters that affected scheduling in a given shift.
#[derive(Debug, Clone, Copy)]
struct Shift {
    start: chrono::DateTime<chrono::Utc>,
    target_count: i64,
    worker_count: i64,
}

/// Worker-pool executor with shift-based scheduling.
pub struct Scraper {
    /// Source of targets and credentials, and sink for scraped samples.
    registry: Arc<Registry>,
    /// Determines scrape order and timing.
    queue: Arc<ScrapeQueue>,
    client: Arc<dyn MetricsClient>,
    clock: Arc<dyn Clock>,

    /// How often the level of parallelism is adjusted.
    flow_control_period: Duration,
    /// Abort a scrape request that takes longer than this.
    scrape_timeout: Duration,
    /// Fewest workers spawned per shift.
    min_shift_workers: i64,
    /// Most workers spawned per shift.
    max_shift_workers: i64,
    /// Cap on simultaneous workers, leftovers from earlier shifts included.
    max_active_workers: i64,

    /// Mutated only by the shift ticker (single writer).
    last_shift: Mutex<Shift>,
    active_workers: AtomicI64,
    workers: TaskTracker,
}

impl Scraper {
    /// Creates a scraper over `registry`.
    ///
    /// `scrape_period` is how often the same target is scraped;
    /// `flow_control_period` is how often the worker count is adjusted.
    pub fn new(
        registry: Arc<Registry>,
        scrape_period: Duration,
        flow_control_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = ScrapeQueue::new(registry.clone(), scrape_period, clock.clone());
        Self {
            registry,
            queue,
            client: Arc::new(HttpMetricsClient::new(DEFAULT_COUNTER_NAME)),
            clock,
            flow_control_period,
            // A longer timeout tolerates intermittent disruption, but lets
            // an unresponsive server tie up workers and risks producing two
            // samples too close together for accurate differentiation.
            scrape_timeout: scrape_period / 2,
            min_shift_workers: 1,
            max_shift_workers: 10,
            max_active_workers: 50,
            last_shift: Mutex::new(Shift {
                start: DateTime::UNIX_EPOCH,
                target_count: 0,
                worker_count: 1,
            }),
            active_workers: AtomicI64::new(0),
            workers: TaskTracker::new(),
        }
    }

    /// Replaces the HTTP client, e.g. with a fake in tests.
    pub fn with_client(mut self, client: Arc<dyn MetricsClient>) -> Self {
        self.client = client;
        self
    }

    /// Overrides the worker pool bounds.
    pub fn with_pool_bounds(mut self, min_shift: i64, max_shift: i64, max_active: i64) -> Self {
        self.min_shift_workers = min_shift;
        self.max_shift_workers = max_shift;
        self.max_active_workers = max_active;
        self
    }

    /// Runs the shift scheduler until `cancel` fires, then closes the queue
    /// and returns once all in-flight scrapes have finished.
    ///
    /// Errors in individual scrapes never terminate the overall process and
    /// are therefore not surfaced here.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flow_control_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(
            period_ms = self.flow_control_period.as_millis() as u64,
            "scraper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("context closed, stopping scraper");
                    self.queue.close();
                    break;
                }
                _ = ticker.tick() => self.start_shift_workers(&cancel),
            }
        }

        self.workers.close();
        self.workers.wait().await;
    }

    /// The queue feeding this scraper.
    pub fn queue(&self) -> &ScrapeQueue {
        &self.queue
    }

    /// Estimates the worker count for the shift beginning now and spawns
    /// them. Not reentrant; only the shift ticker calls it.
    fn start_shift_workers(self: &Arc<Self>, cancel: &CancellationToken) {
        let last = *self.last_shift.lock();
        let now = self.clock.now();
        let due_now = self.queue.due_count(now, false) as i64;

        // How many targets due at the start of last shift were never picked
        // up. Never-scraped targets are excluded; chances are they appeared
        // after that shift ended.
        let leftover = self.queue.due_count(last.start, true) as i64;

        let worker_count = self.plan_shift(last, due_now, leftover);
        *self.last_shift.lock() = Shift {
            start: now,
            target_count: due_now,
            worker_count,
        };

        debug!(
            last_targets = last.target_count,
            last_workers = last.worker_count,
            leftover,
            due_now,
            workers = worker_count,
            "shift begins"
        );

        for _ in 0..worker_count {
            self.active_workers.fetch_add(1, Ordering::Relaxed);
            ACTIVE_WORKERS.inc();
            let scraper = Arc::clone(self);
            let cancel = cancel.clone();
            self.workers.spawn(async move {
                scraper.scrape_queue(cancel).await;
                scraper.active_workers.fetch_sub(1, Ordering::Relaxed);
                ACTIVE_WORKERS.dec();
            });
        }
    }

    /// Pure shift-sizing arithmetic: next worker count from last shift's
    /// throughput and the current amount of due work.
    fn plan_shift(&self, last: Shift, due_now: i64, leftover: i64) -> i64 {
        let mut throughput = (last.target_count - leftover) as f64 / last.worker_count as f64;
        if throughput < 1.0 {
            // A worker practically always picks at least one target, so an
            // estimate below one just means the last shift had more workers
            // than targets.
            throughput = 1.0;
        }

        let mut want = if leftover > 0 {
            // Assume per-worker throughput repeats. Underprovisioning is
            // benign: workers left over from previous shifts keep pulling
            // until this shift's work is done.
            let estimated = (due_now as f64 / throughput).ceil() as i64;
            estimated.min(2 * last.worker_count)
        } else {
            // Do not shrink on throughput estimates; decay one at a time.
            last.worker_count - 1
        };

        if want < self.min_shift_workers {
            want = self.min_shift_workers;
        } else {
            want = want.min(self.max_shift_workers);
            let allowed = self.max_active_workers - self.active_workers.load(Ordering::Relaxed);
            want = want.min(allowed);
        }
        want
    }

    /// Sequentially picks targets from the queue and scrapes them, until no
    /// more are eligible or the scraper is cancelled. Workers are stateless;
    /// it makes no difference which worker picks which target.
    async fn scrape_queue(&self, cancel: CancellationToken) {
        while let Some(target) = self.queue.get_next() {
            if cancel.is_cancelled() {
                break;
            }
            self.scrape(&cancel, &target).await;
        }
    }

    /// Scrapes one target and stores the outcome in the registry. Failures
    /// are recorded as faults, never propagated: the affected iteration is
    /// skipped and data goes temporarily stale until a later scrape
    /// succeeds.
    async fn scrape(&self, cancel: &CancellationToken, target: &ScrapeTarget) {
        let Some(snapshot) = self.registry.get_target(&target.tenant, &target.pod) else {
            error!(
                tenant = %target.tenant,
                pod = %target.pod,
                "no record for this target in the registry"
            );
            return;
        };
        let Some(token) = self.registry.auth_token(&target.tenant) else {
            error!(
                tenant = %target.tenant,
                pod = %target.pod,
                "no auth token for this tenant in the registry"
            );
            return;
        };
        let Some(ca_bundle) = self.registry.ca_bundle(&target.tenant) else {
            error!(
                tenant = %target.tenant,
                pod = %target.pod,
                "no CA certificate for this tenant in the registry"
            );
            return;
        };

        let timer = SCRAPE_DURATION_SECONDS.start_timer();
        let fetch = self
            .client
            .total_request_count(&snapshot.url, &token, &ca_bundle);
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                timer.stop_and_discard();
                return;
            }
            fetched = tokio::time::timeout(self.scrape_timeout, fetch) => {
                fetched.unwrap_or(Err(ScrapeError::DeadlineExceeded))
            }
        };
        timer.observe_duration();

        match result {
            Ok(total) => {
                SCRAPES_TOTAL.inc();
                debug!(
                    tenant = %target.tenant,
                    pod = %target.pod,
                    total,
                    "request count scraped"
                );
                self.registry.set_sample(&target.tenant, &target.pod, total);
            }
            Err(err) => {
                SCRAPE_FAULTS_TOTAL.inc();
                let faults = self.registry.notify_fault(&target.tenant, &target.pod);
                // Error-level entries back off exponentially: only fault
                // counts that are powers of two log at that level.
                match faults {
                    Some(count) if count.is_power_of_two() => {
                        error!(
                            tenant = %target.tenant,
                            pod = %target.pod,
                            faults = count,
                            error = %err,
                            "metrics retrieval failed"
                        );
                    }
                    _ => {
                        debug!(
                            tenant = %target.tenant,
                            pod = %target.pod,
                            error = %err,
                            "metrics retrieval failed"
                        );
                    }
                }
            }
        }
    }
}
