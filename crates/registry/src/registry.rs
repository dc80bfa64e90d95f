//! The registry proper: tenants, targets, samples and watchers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;

/// Kinds of change delivered to target watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEventKind {
    /// A target was just added to the registry.
    Created,
    /// The target is about to be removed from the registry.
    Deleted,
}

/// A change notification for a single target.
///
/// Events for a given target are delivered in the order they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEvent {
    pub kind: TargetEventKind,
    pub tenant: String,
    pub pod: String,
}

/// Subscriber callback, invoked synchronously while the registry lock is
/// held. A watcher must not call back into the registry from the same flow
/// of control; it may hand the event off to a task that does.
pub type TargetWatcher = Box<dyn Fn(&TargetEvent) + Send + Sync>;

/// Stable handle identifying a watcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// Deep copy of the state tracked for a single apiserver pod.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    /// Tenant and pod are immutable and together serve as the target's key.
    pub tenant: String,
    pub pod: String,
    pub uid: String,
    /// Labels on the pod object, used for selector queries.
    pub labels: HashMap<String, String>,
    /// URL where the pod's counters can be scraped.
    pub url: String,
    /// Most recent accepted counter value.
    pub count_new: i64,
    /// Time the most recent sample refers to. Unix epoch when unset.
    pub time_new: DateTime<Utc>,
    /// Previous counter value, enabling rate-of-change calculations.
    pub count_old: i64,
    /// Time the previous sample refers to. Unix epoch when unset.
    pub time_old: DateTime<Utc>,
    /// Start time of the most recent scrape attempt. Unix epoch when unset.
    pub last_scrape_time: DateTime<Utc>,
    /// Consecutive failed scrapes. Reset when a scrape succeeds.
    pub fault_count: u32,
}

/// Read-only view of the registry for metric consumers.
pub trait TargetSource: Send + Sync {
    /// Deep-copied snapshots of all targets of a tenant. Empty if the
    /// tenant is unknown.
    fn tenant_targets(&self, tenant: &str) -> Vec<TargetSnapshot>;
}

#[derive(Debug, Clone)]
struct TargetData {
    pod: String,
    uid: String,
    labels: HashMap<String, String>,
    url: String,
    count_new: i64,
    time_new: DateTime<Utc>,
    count_old: i64,
    time_old: DateTime<Utc>,
    last_scrape_time: DateTime<Utc>,
    fault_count: u32,
}

impl TargetData {
    fn new(pod: &str) -> Self {
        Self {
            pod: pod.to_owned(),
            uid: String::new(),
            labels: HashMap::new(),
            url: String::new(),
            count_new: 0,
            time_new: DateTime::UNIX_EPOCH,
            count_old: 0,
            time_old: DateTime::UNIX_EPOCH,
            last_scrape_time: DateTime::UNIX_EPOCH,
            fault_count: 0,
        }
    }

    fn snapshot(&self, tenant: &str) -> TargetSnapshot {
        TargetSnapshot {
            tenant: tenant.to_owned(),
            pod: self.pod.clone(),
            uid: self.uid.clone(),
            labels: self.labels.clone(),
            url: self.url.clone(),
            count_new: self.count_new,
            time_new: self.time_new,
            count_old: self.count_old,
            time_old: self.time_old,
            last_scrape_time: self.last_scrape_time,
            fault_count: self.fault_count,
        }
    }
}

/// All registry information for a single tenant. A tenant record exists if
/// and only if at least one of its fields is non-empty.
#[derive(Debug, Default)]
struct TenantData {
    /// Bearer token for the tenant's apiservers. Empty string means absent.
    token: String,
    /// PEM bundle of trusted CA certificates. `None` means absent.
    ca_bundle: Option<Vec<u8>>,
    targets: Vec<TargetData>,
}

impl TenantData {
    fn is_empty(&self) -> bool {
        self.token.is_empty() && self.ca_bundle.is_none() && self.targets.is_empty()
    }
}

struct Inner {
    tenants: HashMap<String, TenantData>,
    watchers: Vec<(WatcherId, TargetWatcher)>,
    next_watcher: u64,
}

/// Store of per-tenant credentials and per-pod target and sample state.
///
/// All public operations are concurrency-safe and total: operations on
/// unknown targets are silent no-ops, so producers and consumers never have
/// to coordinate removal ordering.
pub struct Registry {
    /// Two samples closer together than this do not provide sufficient
    /// differentiation accuracy and the newer one is rejected.
    min_sample_gap: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(min_sample_gap: std::time::Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            min_sample_gap: Duration::from_std(min_sample_gap).unwrap_or(Duration::MAX),
            clock,
            inner: Mutex::new(Inner {
                tenants: HashMap::new(),
                watchers: Vec::new(),
                next_watcher: 0,
            }),
        })
    }

    /// Returns a deep copy of the target's state, or `None` if the registry
    /// holds no record for it.
    pub fn get_target(&self, tenant: &str, pod: &str) -> Option<TargetSnapshot> {
        let inner = self.inner.lock();
        find_target(&inner.tenants, tenant, pod).map(|t| t.snapshot(tenant))
    }

    /// Creates or updates the identity fields of a target. Creation emits a
    /// `Created` event; updates emit nothing.
    pub fn upsert_target(
        &self,
        tenant: &str,
        pod: &str,
        uid: &str,
        labels: HashMap<String, String>,
        url: &str,
    ) {
        let mut inner = self.inner.lock();
        let Inner {
            tenants, watchers, ..
        } = &mut *inner;

        let tenant_data = tenants.entry(tenant.to_owned()).or_default();
        let created = match tenant_data.targets.iter_mut().find(|t| t.pod == pod) {
            Some(target) => {
                target.uid = uid.to_owned();
                target.labels = labels;
                target.url = url.to_owned();
                false
            }
            None => {
                let mut target = TargetData::new(pod);
                target.uid = uid.to_owned();
                target.labels = labels;
                target.url = url.to_owned();
                tenant_data.targets.push(target);
                true
            }
        };

        if created {
            notify(watchers, TargetEventKind::Created, tenant, pod);
        }
    }

    /// Deletes all state for a target. The `Deleted` event is emitted before
    /// removal, so subscribers see the terminal state exactly once. Returns
    /// whether the target existed. An emptied tenant is garbage-collected.
    pub fn remove_target(&self, tenant: &str, pod: &str) -> bool {
        let mut inner = self.inner.lock();
        let Inner {
            tenants, watchers, ..
        } = &mut *inner;

        let Some(tenant_data) = tenants.get_mut(tenant) else {
            return false;
        };
        let Some(index) = tenant_data.targets.iter().position(|t| t.pod == pod) else {
            return false;
        };

        notify(watchers, TargetEventKind::Deleted, tenant, pod);

        tenant_data.targets.remove(index);
        if tenant_data.is_empty() {
            tenants.remove(tenant);
        }
        true
    }

    /// Records a freshly scraped counter value for the target, shifting the
    /// previous sample into the `old` slot. The sample is ignored when it is
    /// out of order (counter went backwards) or arrives within
    /// `min_sample_gap` of the stored one. No-op for unknown targets.
    pub fn set_sample(&self, tenant: &str, pod: &str, total_count: i64) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Some(target) = find_target_mut(&mut inner.tenants, tenant, pod) else {
            return;
        };

        // The scrape itself succeeded, even if the sample ends up rejected.
        target.fault_count = 0;

        if total_count < target.count_new || now - target.time_new < self.min_sample_gap {
            return;
        }

        target.time_old = target.time_new;
        target.count_old = target.count_new;
        target.time_new = now;
        target.count_new = total_count;
        debug!(tenant, pod, count = total_count, "new total request count");
    }

    /// Records the start time of the most recent scrape attempt. No-op for
    /// unknown targets.
    pub fn set_last_scrape_time(&self, tenant: &str, pod: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(target) = find_target_mut(&mut inner.tenants, tenant, pod) {
            target.last_scrape_time = at;
        }
    }

    /// Counterpart of [`Registry::set_sample`] for failed scrapes. Returns
    /// the consecutive fault count including this one, or `None` when the
    /// registry holds no record for the target.
    pub fn notify_fault(&self, tenant: &str, pod: &str) -> Option<u32> {
        let mut inner = self.inner.lock();
        let target = find_target_mut(&mut inner.tenants, tenant, pod)?;
        target.fault_count += 1;
        Some(target.fault_count)
    }

    /// The bearer token used to scrape the tenant's pods, or `None` if no
    /// token is on record.
    pub fn auth_token(&self, tenant: &str) -> Option<String> {
        let inner = self.inner.lock();
        let token = &inner.tenants.get(tenant)?.token;
        if token.is_empty() {
            None
        } else {
            Some(token.clone())
        }
    }

    /// Records the tenant's bearer token. An empty token deletes the record
    /// and garbage-collects the tenant if nothing else remains.
    pub fn set_auth_token(&self, tenant: &str, token: &str) {
        let mut inner = self.inner.lock();
        match inner.tenants.get_mut(tenant) {
            None => {
                if token.is_empty() {
                    return;
                }
                let tenant_data = TenantData {
                    token: token.to_owned(),
                    ..Default::default()
                };
                inner.tenants.insert(tenant.to_owned(), tenant_data);
            }
            Some(tenant_data) => {
                tenant_data.token = token.to_owned();
                if tenant_data.is_empty() {
                    inner.tenants.remove(tenant);
                }
            }
        }
    }

    /// The PEM bundle of CA certificates trusted for the tenant's pods, or
    /// `None` if no bundle is on record.
    pub fn ca_bundle(&self, tenant: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner.tenants.get(tenant)?.ca_bundle.clone()
    }

    /// Records the tenant's CA bundle. Passing `None` deletes the record and
    /// garbage-collects the tenant if nothing else remains.
    pub fn set_ca_bundle(&self, tenant: &str, bundle: Option<&[u8]>) {
        let mut inner = self.inner.lock();
        match inner.tenants.get_mut(tenant) {
            None => {
                let Some(bundle) = bundle else { return };
                let tenant_data = TenantData {
                    ca_bundle: Some(bundle.to_vec()),
                    ..Default::default()
                };
                inner.tenants.insert(tenant.to_owned(), tenant_data);
            }
            Some(tenant_data) => {
                tenant_data.ca_bundle = bundle.map(<[u8]>::to_vec);
                if tenant_data.is_empty() {
                    inner.tenants.remove(tenant);
                }
            }
        }
    }

    /// Subscribes a watcher for target change events. With
    /// `replay_existing`, a synthetic `Created` event is delivered for every
    /// target already in the registry before the call returns.
    pub fn add_watcher(&self, watcher: TargetWatcher, replay_existing: bool) -> WatcherId {
        let mut inner = self.inner.lock();

        if replay_existing {
            for (tenant, tenant_data) in &inner.tenants {
                for target in &tenant_data.targets {
                    watcher(&TargetEvent {
                        kind: TargetEventKind::Created,
                        tenant: tenant.clone(),
                        pod: target.pod.clone(),
                    });
                }
            }
        }

        let id = WatcherId(inner.next_watcher);
        inner.next_watcher += 1;
        inner.watchers.push((id, watcher));
        id
    }

    /// Removes a watcher registration. Returns `false` if the handle was
    /// never registered or was already removed. After a `true` return, no
    /// further events are delivered to the watcher.
    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.watchers.len();
        inner.watchers.retain(|(watcher_id, _)| *watcher_id != id);
        inner.watchers.len() != before
    }
}

impl TargetSource for Registry {
    fn tenant_targets(&self, tenant: &str) -> Vec<TargetSnapshot> {
        let inner = self.inner.lock();
        match inner.tenants.get(tenant) {
            Some(tenant_data) => tenant_data
                .targets
                .iter()
                .map(|t| t.snapshot(tenant))
                .collect(),
            None => Vec::new(),
        }
    }
}

fn find_target<'a>(
    tenants: &'a HashMap<String, TenantData>,
    tenant: &str,
    pod: &str,
) -> Option<&'a TargetData> {
    tenants.get(tenant)?.targets.iter().find(|t| t.pod == pod)
}

fn find_target_mut<'a>(
    tenants: &'a mut HashMap<String, TenantData>,
    tenant: &str,
    pod: &str,
) -> Option<&'a mut TargetData> {
    tenants
        .get_mut(tenant)?
        .targets
        .iter_mut()
        .find(|t| t.pod == pod)
}

fn notify(watchers: &[(WatcherId, TargetWatcher)], kind: TargetEventKind, tenant: &str, pod: &str) {
    let event = TargetEvent {
        kind,
        tenant: tenant.to_owned(),
        pod: pod.to_owned(),
    };
    for (_, watcher) in watchers {
        watcher(&event);
    }
}
