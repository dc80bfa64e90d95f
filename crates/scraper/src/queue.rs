//! Scrape ordering and timing.
//!
//! The [`ScrapeQueue`] prescribes the order and timing for scraping the
//! targets in a [`Registry`]. It tracks registry changes by subscribing for
//! target events and does not cache target data; it fetches snapshots from
//! the registry when needed.
//!
//! Scraping progresses at a default rate of `target_count / scrape_period`.
//! When scraping falls behind that schedule, the pacemaker temporarily
//! switches to a higher rate until the queue catches up.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ratewatch_metrics::scrape::QUEUE_TARGETS;
use ratewatch_registry::clock::Clock;
use ratewatch_registry::{Registry, TargetEvent, TargetEventKind, WatcherId};

use crate::pacemaker::{Pacemaker, PacemakerConfig};

/// Identifies one pod as a target for metrics scraping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub tenant: String,
    pub pod: String,
}

/// Size of the event notification buffer.
///
/// This buffer temporally decouples event emission from event handling,
/// which is what breaks the deadlock chain: the registry emits events while
/// holding its data lock, and handling an event requires registry access
/// (and thus that same lock). The synchronous phase of the handler only
/// pushes onto this buffer; a dedicated task drains it. Handling is much
/// faster than emission, so the buffer has to outsize any realistic burst.
const EVENT_BUFFER_SIZE: usize = 10_000;

/// Cyclic queue of scrape targets, gated by a [`Pacemaker`].
///
/// Public members are concurrency-safe.
pub struct ScrapeQueue {
    registry: Arc<Registry>,
    /// Determines scrape timing based on rate/burst settings.
    pacemaker: Pacemaker,
    clock: Arc<dyn Clock>,
    /// How long before all targets are scraped and the cycle repeats.
    scrape_period: Duration,
    /// The queue proper, reflecting the scrape order.
    targets: Mutex<VecDeque<ScrapeTarget>>,
    /// Subscription and buffer close state. `None` once closed.
    subscription: Mutex<Option<(WatcherId, mpsc::Sender<TargetEvent>)>>,
}

impl ScrapeQueue {
    /// Creates a queue tracking `registry`, subscribed for target events
    /// with replay of pre-existing targets.
    pub fn new(
        registry: Arc<Registry>,
        scrape_period: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let pacemaker = Pacemaker::new(
            PacemakerConfig {
                min_rate: 0.0,
                max_rate: 100.0,
                debt_limit: 0,
                surplus_limit: 50,
            },
            clock.clone(),
        );
        let queue = Arc::new(Self {
            registry: registry.clone(),
            pacemaker,
            clock,
            scrape_period: Duration::from_std(scrape_period).unwrap_or(Duration::MAX),
            targets: Mutex::new(VecDeque::new()),
            subscription: Mutex::new(None),
        });

        let (event_tx, mut event_rx) = mpsc::channel::<TargetEvent>(EVENT_BUFFER_SIZE);

        // Synchronous phase: runs under the registry lock, must only enqueue.
        let buffer = event_tx.clone();
        let watcher_id = registry.add_watcher(
            Box::new(move |event| {
                if buffer.try_send(event.clone()).is_err() {
                    warn!(
                        tenant = %event.tenant,
                        pod = %event.pod,
                        "event buffer full, dropping target event"
                    );
                }
            }),
            true,
        );
        *queue.subscription.lock() = Some((watcher_id, event_tx));

        // Asynchronous phase: drains the buffer under the queue's own lock.
        let pump = Arc::clone(&queue);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                pump.apply_event(event);
            }
        });

        queue
    }

    /// Returns the next target eligible for immediate scraping, or `None`
    /// if no target is eligible at this moment.
    ///
    /// A target is eligible when its scrape period elapsed since its last
    /// scrape, or when a scrape is required to keep up the queue's minimum
    /// rate. Denial by the pacemaker does not rotate the queue.
    pub fn get_next(&self) -> Option<ScrapeTarget> {
        let mut targets = self.targets.lock();
        loop {
            let head = targets.front()?.clone();
            let Some(snapshot) = self.registry.get_target(&head.tenant, &head.pod) else {
                // Removed from the registry, but the delete notification has
                // not been drained yet. Drop it and try the next target.
                debug!(
                    tenant = %head.tenant,
                    pod = %head.pod,
                    "target in queue but missing from registry"
                );
                targets.pop_front();
                continue;
            };

            let now = self.clock.now();
            let eager = now >= snapshot.last_scrape_time + self.scrape_period;
            if !self.pacemaker.scrape_permission(eager) {
                return None;
            }

            // Settled: the target is scraped now. Rotate it to the back.
            self.registry
                .set_last_scrape_time(&head.tenant, &head.pod, now);
            targets.rotate_left(1);
            return Some(head);
        }
    }

    /// Number of targets in the queue.
    pub fn count(&self) -> usize {
        self.targets.lock().len()
    }

    /// Counts the targets whose scrape would be due (or overdue) at
    /// `as_of`, per the current queue state. With `exclude_unscraped`,
    /// targets that were never scraped do not count.
    ///
    /// The queue is in LRU-by-scrape order after the first full lap, so the
    /// scan stops at the first not-due target.
    pub fn due_count(&self, as_of: DateTime<Utc>, exclude_unscraped: bool) -> usize {
        let cutoff = as_of - self.scrape_period;
        let targets = self.targets.lock();
        let mut count = 0;

        for target in targets.iter() {
            let Some(snapshot) = self.registry.get_target(&target.tenant, &target.pod) else {
                // Gone from the registry; the delete event will catch up.
                continue;
            };

            if snapshot.last_scrape_time > cutoff {
                return count;
            }

            if !exclude_unscraped || snapshot.last_scrape_time != DateTime::UNIX_EPOCH {
                count += 1;
            }
        }

        count
    }

    /// Ends the registry subscription and closes the event buffer.
    ///
    /// Events already buffered may still be applied after this returns, but
    /// events occurring afterwards are ignored. Safe to call repeatedly.
    pub fn close(&self) {
        let Some((watcher_id, _event_tx)) = self.subscription.lock().take() else {
            return;
        };
        if !self.registry.remove_watcher(watcher_id) {
            warn!("closing scrape queue: the queue was not registered as a watcher");
        }
        // Dropping the last sender ends the drain task.
    }

    fn apply_event(&self, event: TargetEvent) {
        let count = {
            let mut targets = self.targets.lock();
            match event.kind {
                TargetEventKind::Created => {
                    // Newly discovered targets are scraped eagerly first.
                    targets.push_front(ScrapeTarget {
                        tenant: event.tenant,
                        pod: event.pod,
                    });
                }
                TargetEventKind::Deleted => {
                    if let Some(index) = targets
                        .iter()
                        .position(|t| t.tenant == event.tenant && t.pod == event.pod)
                    {
                        targets.remove(index);
                    }
                }
            }
            targets.len()
        };

        QUEUE_TARGETS.set(count as i64);

        // Aim for an even temporal distribution of scrapes. The debt ceiling
        // equals the target count: tracking more would accrue a second unit
        // of debt for a target that already has one.
        let rate = count as f64 / period_secs(self.scrape_period);
        self.pacemaker.update_rate(rate, count as u32);
        debug!(count, rate, "scrape queue updated");
    }
}

fn period_secs(period: Duration) -> f64 {
    period.num_milliseconds() as f64 / 1000.0
}
