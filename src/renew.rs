/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::config;
use crate::store::LeaseMetadata;
use crate::trace::*;
use crate::{ticket, Engine, Error};

use chrono::Local;
use futures::future;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::{
    sync::{Mutex, Semaphore},
    time,
};
use tokio_util::sync::CancellationToken;

// Two failed cycles in a row park a ticket in Degraded; it keeps being
// retried every cycle but the noise level goes up to `error!`.
const DEGRADED_AFTER: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TicketState {
    Fresh,
    Renewing,
    Degraded,
}

struct RenewalState {
    state: TicketState,
    consecutive_failures: u32,
}

impl Default for RenewalState {
    fn default() -> Self {
        Self {
            state: TicketState::Fresh,
            consecutive_failures: 0,
        }
    }
}

// Periodically walks the lease store and refreshes every credential cache
// whose `renew until` stamp is inside the renewal window. Cycles never
// overlap; shutdown is honored between tickets, not mid-ticket.
pub struct Scheduler {
    engine: Arc<Engine>,
    states: Mutex<HashMap<PathBuf, RenewalState>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = time::interval(time::Duration::from_secs(config().renewal.interval));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        tracing::info!(
            interval = config().renewal.interval,
            threshold_hours = config().renewal.threshold_hours,
            "starting renewal scheduler"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.cycle(&shutdown).await;
        }
        tracing::info!("renewal scheduler stopped");
    }

    pub async fn cycle(&self, shutdown: &CancellationToken) {
        let metas = match self.engine.store().list() {
            Ok(metas) => metas,
            Err(err) => {
                tracing::warn!(error = err.chain(), "could not list leases, skipping cycle");
                return;
            }
        };

        let groups = group_by_cache(metas);
        self.drop_stale_states(&groups).await;

        let permits = Arc::new(Semaphore::new(config().renewal.max_concurrent));
        future::join_all(groups.into_iter().map(|(cache, group)| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire().await.expect("semaphore never closes");
                if shutdown.is_cancelled() {
                    return;
                }
                self.process(cache, group).await;
            }
        }))
        .await;
    }

    async fn process(&self, cache: PathBuf, group: Vec<LeaseMetadata>) {
        let Some(meta) = group.first() else { return };

        // The stamp is re-read from klist every cycle; nothing cached here is
        // ever authoritative.
        let renew_until = match ticket::renew_until(&cache).await {
            Ok(Some(stamp)) => stamp,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = err.chain(), cache = %cache.display(), "klist check failed");
                return;
            }
        };

        if !ticket::within_renewal_window(
            renew_until,
            Local::now(),
            config().renewal.threshold_hours,
        ) {
            self.transition(&cache, TicketState::Fresh, 0).await;
            return;
        }

        self.transition(&cache, TicketState::Renewing, self.failures(&cache).await)
            .await;
        tracing::info!(
            cache = %cache.display(),
            account = %meta.service_account_name,
            %renew_until,
            "ticket entered the renewal window"
        );

        match self.renew(meta).await {
            Ok(()) => {
                tracing::info!(
                    cache = %cache.display(),
                    account = %meta.service_account_name,
                    "ticket renewed"
                );
                self.transition(&cache, TicketState::Fresh, 0).await;
            }
            Err(err) => {
                let failures = self.failures(&cache).await + 1;
                if failures >= DEGRADED_AFTER {
                    tracing::error!(
                        error = err.chain(),
                        cache = %cache.display(),
                        failures,
                        "ticket renewal keeps failing"
                    );
                    self.transition(&cache, TicketState::Degraded, failures).await;
                } else {
                    tracing::warn!(
                        error = err.chain(),
                        cache = %cache.display(),
                        "ticket renewal failed, will be retried"
                    );
                    self.transition(&cache, TicketState::Renewing, failures).await;
                }
            }
        }
    }

    // An expired machine or user TGT surfaces as an LDAP bind failure; one
    // reauthentication and one more attempt per cycle.
    async fn renew(&self, meta: &LeaseMetadata) -> Result<(), Error> {
        match self.engine.refresh_ticket(meta).await {
            Err(err) if err.is_auth_failure() => {
                tracing::warn!(
                    account = %meta.service_account_name,
                    "ticket-granting ticket expired, reauthenticating"
                );
                self.engine.reauth_for(meta).await?;
                self.engine.refresh_ticket(meta).await
            }
            other => other,
        }
    }

    async fn transition(&self, cache: &PathBuf, state: TicketState, failures: u32) {
        let mut states = self.states.lock().await;
        let entry = states.entry(cache.clone()).or_default();
        if entry.state != state {
            tracing::debug!(cache = %cache.display(), from = ?entry.state, to = ?state, "ticket state change");
        }
        entry.state = state;
        entry.consecutive_failures = failures;
    }

    async fn failures(&self, cache: &PathBuf) -> u32 {
        self.states
            .lock()
            .await
            .get(cache)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    // Destroyed leases leave no metadata behind; their tickets are terminal.
    async fn drop_stale_states(&self, groups: &[(PathBuf, Vec<LeaseMetadata>)]) {
        let mut states = self.states.lock().await;
        states.retain(|cache, _| groups.iter().any(|(c, _)| c == cache));
    }
}

// Stable, first-seen ordering so a cycle processes caches deterministically.
fn group_by_cache(metas: Vec<LeaseMetadata>) -> Vec<(PathBuf, Vec<LeaseMetadata>)> {
    let mut groups: Vec<(PathBuf, Vec<LeaseMetadata>)> = Vec::new();
    for meta in metas {
        match groups.iter_mut().find(|(cache, _)| *cache == meta.krb_file_path) {
            Some((_, group)) => group.push(meta),
            None => groups.push((meta.krb_file_path.clone(), vec![meta])),
        }
    }
    groups
}
