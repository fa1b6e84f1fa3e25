//! Readiness and teardown wait loops for the Scaleway backend.
//!
//! Each poll lists every outstanding server in one call. Listing failures
//! are treated as transient and retried until the deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::time::Instant;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::poll::PollSchedule;
use crate::provider::{
    InstanceAddress, InstanceFailure, InstanceId, InstanceState, ProvisioningTimeoutError,
    TerminationError,
};
use crate::scaleway::{ScalewayBackendError, ScalewayProvider};

use super::{LIST_PAGE_SIZE, ServerSnapshot};

/// Servers keyed by identity, as returned by one listing round.
pub(in crate::scaleway) type Listing = BTreeMap<String, ServerSnapshot>;

impl ScalewayProvider {
    /// Lists the given servers. Servers that no longer exist are absent.
    pub(in crate::scaleway) async fn fetch_servers(
        &self,
        ids: &[InstanceId],
    ) -> Result<Listing, ScalewayBackendError> {
        let mut listing = Listing::new();
        for chunk in ids.chunks(LIST_PAGE_SIZE) {
            let filter = chunk
                .iter()
                .map(InstanceId::as_str)
                .collect::<Vec<_>>()
                .join(",");
            let servers = self
                .api
                .list_instances(&self.zone)
                .servers(&filter)
                .per_page(100)
                .run_async()
                .await?;
            listing.extend(
                servers
                    .into_iter()
                    .map(ServerSnapshot::from)
                    .map(|server| (server.id.clone(), server)),
            );
        }
        Ok(listing)
    }
}

/// Outcome of checking one listing against the outstanding servers.
#[derive(Debug, Default, Eq, PartialEq)]
pub(in crate::scaleway) struct ReadinessRound {
    pub(in crate::scaleway) ready: Vec<(InstanceId, InstanceAddress)>,
    pub(in crate::scaleway) failed: Vec<InstanceFailure>,
    pub(in crate::scaleway) pending: Vec<InstanceId>,
}

pub(in crate::scaleway) fn assess_readiness(
    outstanding: &[InstanceId],
    listing: &Listing,
) -> ReadinessRound {
    let mut round = ReadinessRound::default();
    for id in outstanding {
        let Some(server) = listing.get(id.as_str()) else {
            round
                .failed
                .push(InstanceFailure::new(id.clone(), "instance disappeared"));
            continue;
        };
        match server.state.lifecycle() {
            InstanceState::Running => {
                let public_ip = server
                    .public_ip
                    .as_deref()
                    .and_then(|ip| ip.parse::<IpAddr>().ok());
                round
                    .ready
                    .push((id.clone(), InstanceAddress { public_ip }));
            }
            InstanceState::Failed => round.failed.push(InstanceFailure::new(
                id.clone(),
                format!("server entered state {}", server.state.as_str()),
            )),
            _ => round.pending.push(id.clone()),
        }
    }
    round
}

/// Polls `fetch` until every server runs, fails, or the schedule runs out.
pub(in crate::scaleway) async fn poll_until_running<F, Fut>(
    ids: &[InstanceId],
    schedule: PollSchedule,
    mut fetch: F,
) -> Result<BTreeMap<InstanceId, InstanceAddress>, ProvisioningTimeoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Listing, ScalewayBackendError>>,
{
    let deadline = schedule.deadline();
    let mut ready = BTreeMap::new();
    let mut failures = Vec::new();
    let mut outstanding = ids.to_vec();
    let mut last_states = BTreeMap::new();

    while !outstanding.is_empty() && Instant::now() <= deadline {
        match fetch().await {
            Ok(listing) => {
                for id in &outstanding {
                    if let Some(server) = listing.get(id.as_str()) {
                        last_states.insert(id.clone(), server.state.as_str().to_owned());
                    }
                }
                let round = assess_readiness(&outstanding, &listing);
                ready.extend(round.ready);
                failures.extend(round.failed);
                outstanding = round.pending;
                debug!(pending = outstanding.len(), "readiness poll");
            }
            Err(err) => warn!(error = %err, "server listing failed; retrying"),
        }
        if outstanding.is_empty() {
            break;
        }
        sleep(schedule.interval).await;
    }

    failures.extend(outstanding.into_iter().map(|id| {
        let cause = last_states.get(&id).map_or_else(
            || String::from("not running before the deadline"),
            |state| format!("still {state} at the deadline"),
        );
        InstanceFailure::new(id, cause)
    }));

    if failures.is_empty() {
        Ok(ready)
    } else {
        Err(ProvisioningTimeoutError { ready, failures })
    }
}

/// Polls `fetch` until none of the servers is listed or the schedule runs
/// out.
pub(in crate::scaleway) async fn poll_until_gone<F, Fut>(
    ids: &[InstanceId],
    schedule: PollSchedule,
    mut fetch: F,
) -> Result<(), TerminationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Listing, ScalewayBackendError>>,
{
    let deadline = schedule.deadline();
    let mut visible = ids.to_vec();

    while Instant::now() <= deadline {
        match fetch().await {
            Ok(listing) => {
                visible.retain(|id| listing.contains_key(id.as_str()));
                if visible.is_empty() {
                    return Ok(());
                }
            }
            Err(err) => warn!(error = %err, "server listing failed; retrying"),
        }
        sleep(schedule.interval).await;
    }

    let terminated = ids
        .iter()
        .filter(|id| !visible.contains(id))
        .cloned()
        .collect();
    Err(TerminationError {
        terminated,
        failures: visible
            .into_iter()
            .map(|id| InstanceFailure::new(id, "still present after teardown"))
            .collect(),
    })
}
