//! Lease-based leader election
//!
//! Replicas compete for a `coordination.k8s.io` Lease. Writes carry the
//! observed resource version, so two candidates can never both win a round.
//! The leader renews every retry period and steps down once it has been
//! unable to renew for a whole lease duration.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::Client;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Leader election configuration
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// Identity written into the lease, usually the pod name
    pub identity: String,
    pub lease_duration: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// What a candidate may do with the lease it observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it; extend the renew time
    Renew,
    /// Free or expired; take it over
    Acquire,
    /// Another live holder
    HeldBy(String),
}

/// Decide on an observed lease
pub fn evaluate(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(spec) = spec else {
        return LeaseDecision::Acquire;
    };
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseDecision::Acquire;
    }
    if holder == identity {
        return LeaseDecision::Renew;
    }

    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    match spec.renew_time.as_ref() {
        Some(MicroTime(renewed)) if *renewed + duration > now => {
            LeaseDecision::HeldBy(holder.to_string())
        }
        _ => LeaseDecision::Acquire,
    }
}

enum Exit {
    Finished(std::result::Result<Result<()>, JoinError>),
    Lost,
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// Take or renew the lease; `Ok(false)` when someone else holds it
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.config.name).await?;

        let decision = evaluate(
            existing.as_ref().and_then(|l| l.spec.as_ref()),
            &self.config.identity,
            now,
        );
        if let LeaseDecision::HeldBy(holder) = &decision {
            debug!("Lease {} held by {}", self.config.name, holder);
            return Ok(false);
        }

        let result = match existing {
            None => {
                let mut lease = Lease::default();
                lease.metadata.name = Some(self.config.name.clone());
                lease.metadata.namespace = Some(self.config.namespace.clone());
                lease.spec = Some(LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_secs()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                });
                self.api.create(&PostParams::default(), &lease).await
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(Default::default);
                if decision == LeaseDecision::Acquire {
                    spec.holder_identity = Some(self.config.identity.clone());
                    spec.acquire_time = Some(MicroTime(now));
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                }
                spec.lease_duration_seconds = Some(self.lease_duration_secs());
                spec.renew_time = Some(MicroTime(now));
                self.api
                    .replace(&self.config.name, &PostParams::default(), &lease)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!("Lost race for lease {}", self.config.name);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease up so a standby can take over without waiting it out
    async fn release(&self) {
        let mut lease = match self.api.get_opt(&self.config.name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read lease {} for release: {}", self.config.name, e);
                return;
            }
        };
        let Some(spec) = lease.spec.as_mut() else {
            return;
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        match self
            .api
            .replace(&self.config.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => info!("Released lease {}", self.config.name),
            Err(e) => warn!("Failed to release lease {}: {}", self.config.name, e),
        }
    }

    /// Block until elected, then run `work` while leadership lasts.
    ///
    /// `work` receives a token cancelled on shutdown or loss of the lease.
    /// Losing the lease is an error so the process restarts as a candidate.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, work: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Waiting for lease {}/{} as {}",
            self.config.namespace, self.config.name, self.config.identity
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => match self.try_acquire_or_renew().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to acquire lease {}: {}", self.config.name, e),
                },
            }
        }
        info!("Acquired lease {}, leading", self.config.name);

        let leading = cancel.child_token();
        let mut task = tokio::spawn(work(leading.clone()));
        let mut last_renew = Instant::now();

        let exit = loop {
            tokio::select! {
                joined = &mut task => break Exit::Finished(joined),
                _ = ticker.tick() => match self.try_acquire_or_renew().await {
                    Ok(true) => last_renew = Instant::now(),
                    Ok(false) => break Exit::Lost,
                    Err(e) if last_renew.elapsed() >= self.config.lease_duration => {
                        error!("Could not renew lease {}: {}", self.config.name, e);
                        break Exit::Lost;
                    }
                    Err(e) => warn!("Failed to renew lease {}: {}", self.config.name, e),
                },
            }
        };
        leading.cancel();

        match exit {
            Exit::Finished(joined) => {
                self.release().await;
                joined.map_err(|e| Error::Internal(format!("Leader task failed: {}", e)))?
            }
            Exit::Lost => {
                if let Err(e) = task.await {
                    warn!("Leader task failed while stepping down: {}", e);
                }
                Err(Error::Internal(format!(
                    "Lost leadership of lease {}",
                    self.config.name
                )))
            }
        }
    }
}
