//! Leader-driven endpoint steering.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoints::{
    EndpointAddress, EndpointPort, EndpointSubset, EndpointsApi, EndpointsRecord, Preconditions,
    SteeringError,
};

/// The application name; also names the steering endpoint record.
pub const APP_NAME: &str = "ratewatch";

/// Initial delay between attempts to write the endpoint record.
const RETRY_PERIOD: Duration = Duration::from_secs(1);
/// Backoff ceiling for those attempts.
const MAX_RETRY_PERIOD: Duration = Duration::from_secs(300);
/// Delay between revocation attempts on leadership loss.
const REVOKE_RETRY_PERIOD: Duration = Duration::from_secs(1);
/// Revocation attempts before abandoning.
const REVOKE_ATTEMPTS: u32 = 10;
/// Total revocation budget, chosen to fit within a typical termination
/// grace period.
const REVOKE_BUDGET: Duration = Duration::from_secs(14);

/// Ensures the single published endpoint record points at the current
/// leader.
///
/// The external leader-election runner calls [`HaService::run`] exactly once
/// per leadership term and cancels the token on loss. At steady state the
/// record points at exactly the leader; a non-leader never writes it.
pub struct HaService {
    api: Arc<dyn EndpointsApi>,
    /// Namespace this process and its associated records belong to.
    namespace: String,
    /// Address at which this replica serves metric queries.
    serving_ip: String,
    serving_port: u16,
    /// Uid and resource version from the last successful write, used as
    /// deletion preconditions during revocation.
    last_written: Mutex<Option<Preconditions>>,
}

impl HaService {
    pub fn new(api: Arc<dyn EndpointsApi>, namespace: &str, serving_ip: &str, serving_port: u16) -> Self {
        Self {
            api,
            namespace: namespace.to_owned(),
            serving_ip: serving_ip.to_owned(),
            serving_port,
            last_written: Mutex::new(None),
        }
    }

    /// Runs one leadership term: steers the endpoint record to this replica
    /// (retrying with exponential backoff), then waits for the term to end
    /// and revokes the record on a best-effort basis.
    ///
    /// Returns [`SteeringError::Cancelled`] when the term ends, which is the
    /// expected way out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SteeringError> {
        let mut retry_period = RETRY_PERIOD;

        loop {
            match self.set_endpoints().await {
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, "failed to set service endpoints");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.revoke().await;
                            return Err(SteeringError::Cancelled);
                        }
                        _ = tokio::time::sleep(retry_period) => {}
                    }
                    retry_period = (retry_period * 2).min(MAX_RETRY_PERIOD);
                }
            }
        }

        info!(
            namespace = %self.namespace,
            ip = %self.serving_ip,
            port = self.serving_port,
            "service endpoint steered to this replica"
        );

        cancel.cancelled().await;
        self.revoke().await;
        Err(SteeringError::Cancelled)
    }

    /// Points the endpoint record at this replica. The record is fetched
    /// fresh (no cache), synthesized when absent, and written back with a
    /// single TCP address subset.
    async fn set_endpoints(&self) -> Result<(), SteeringError> {
        let mut record = self
            .api
            .get(&self.namespace, APP_NAME)
            .await?
            .unwrap_or_else(|| EndpointsRecord::named(&self.namespace, APP_NAME));

        record
            .metadata
            .labels
            .insert("app".to_owned(), APP_NAME.to_owned());
        record.subsets = vec![EndpointSubset {
            addresses: vec![EndpointAddress {
                ip: self.serving_ip.clone(),
            }],
            ports: vec![EndpointPort {
                port: self.serving_port,
                protocol: "TCP".to_owned(),
            }],
        }];

        let written = self.api.update(&record).await?;
        *self.last_written.lock() = Some(Preconditions {
            uid: written.metadata.uid,
            resource_version: written.metadata.resource_version,
        });
        Ok(())
    }

    /// Best-effort removal of the endpoint record at the end of a term.
    /// Deletion carries the uid/resource-version preconditions from the last
    /// successful write, so a record taken over by another replica is never
    /// deleted. Abandons after a bounded number of attempts.
    async fn revoke(&self) {
        let Some(preconditions) = self.last_written.lock().clone() else {
            // Never successfully written; nothing to revoke.
            return;
        };

        let attempts = async {
            for attempt in 1..=REVOKE_ATTEMPTS {
                match self.try_revoke(&preconditions).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(attempt, error = %err, "failed to revoke service endpoint");
                    }
                }
                tokio::time::sleep(REVOKE_RETRY_PERIOD).await;
            }
            warn!("abandoning service endpoint revocation");
        };

        if tokio::time::timeout(REVOKE_BUDGET, attempts).await.is_err() {
            warn!("service endpoint revocation ran out of time");
        }
    }

    async fn try_revoke(&self, preconditions: &Preconditions) -> Result<(), SteeringError> {
        let record = match self.api.get(&self.namespace, APP_NAME).await? {
            Some(record) => record,
            // Deleted by an external actor; nothing left to do.
            None => return Ok(()),
        };

        if !record.points_at(&self.serving_ip, self.serving_port) {
            // Another replica has taken over; leave its record alone.
            debug!("service endpoint no longer points here, skipping revocation");
            return Ok(());
        }

        match self.api.delete(&self.namespace, APP_NAME, preconditions).await {
            Ok(()) | Err(SteeringError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
