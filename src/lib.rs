/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

mod auth;
mod conf;
mod dns;
mod gmsa;
mod probe;
mod proc;
mod renew;
mod secrets;
mod store;
mod ticket;
mod trace;
mod util;

pub use auth::TgtMode;
pub use conf::{config, load_config, set_ecs_mode};
pub use renew::Scheduler;
pub use store::{LeaseMetadata, LeaseStore};

use crate::trace::*;

use snafu::prelude::*;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid input"), context(false))]
    InvalidInput { source: util::Error },
    #[snafu(display("Tool environment verification failed"), context(false))]
    ToolMissing { source: probe::Error },
    #[snafu(display("Domain controller discovery failed"), context(false))]
    DnsFailure { source: dns::Error },
    #[snafu(display("Authentication failed"), context(false))]
    AuthFailure { source: auth::Error },
    #[snafu(display("Managed password retrieval failed"), context(false))]
    PasswordRetrievalFailure { source: gmsa::Error },
    #[snafu(display("Credential materialization failed"), context(false))]
    MaterializeFailure { source: ticket::Error },
    #[snafu(display("Lease store failure"), context(false))]
    Io { source: store::Error },
}

/// The eight failure kinds the engine surfaces, one per operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ToolMissing,
    DnsFailure,
    AuthFailure,
    PasswordRetrievalFailure,
    MaterializeFailure,
    Io,
    Timeout,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput { .. } => ErrorKind::InvalidInput,
            Error::ToolMissing { .. } => ErrorKind::ToolMissing,
            Error::DnsFailure { .. } => ErrorKind::DnsFailure,
            Error::AuthFailure { source } if source.is_environment() => ErrorKind::ToolMissing,
            Error::AuthFailure { source } if source.is_invalid_input() => ErrorKind::InvalidInput,
            Error::AuthFailure { source } if source.is_timeout() => ErrorKind::Timeout,
            Error::AuthFailure { .. } => ErrorKind::AuthFailure,
            Error::PasswordRetrievalFailure { source } if source.is_auth_failure() => {
                ErrorKind::AuthFailure
            }
            Error::PasswordRetrievalFailure { source } if source.is_timeout() => ErrorKind::Timeout,
            Error::PasswordRetrievalFailure { .. } => ErrorKind::PasswordRetrievalFailure,
            Error::MaterializeFailure { source } if source.is_timeout() => ErrorKind::Timeout,
            Error::MaterializeFailure { .. } => ErrorKind::MaterializeFailure,
            Error::Io { .. } => ErrorKind::Io,
        }
    }

    /// Daemon CLI contract: 1 config/tool missing, 2 persistent auth failure,
    /// 3 filesystem error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::InvalidInput | ErrorKind::ToolMissing => 1,
            ErrorKind::Io => 3,
            _ => 2,
        }
    }

    pub(crate) fn is_auth_failure(&self) -> bool {
        self.kind() == ErrorKind::AuthFailure
    }
}

/// Check all external tool contracts once, typically at daemon start.
pub fn verify_environment() -> Result<(), Error> {
    probe::verify().map_err(Into::into)
}

/// A lease creation request from the control plane.
pub struct CreateLease {
    pub lease_id: String,
    pub domain: String,
    pub accounts: Vec<String>,
    pub mode: TgtMode,
}

/// The credential-lifecycle engine. One instance per daemon; the RPC surface
/// calls into it, the renewal scheduler walks it.
pub struct Engine {
    store: LeaseStore,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // Ids destroyed during this daemon lifetime; they must not be reused.
    retired: Mutex<HashSet<String>>,
}

impl Engine {
    pub fn new(krb_root: impl Into<PathBuf>) -> Self {
        Self {
            store: LeaseStore::new(krb_root),
            locks: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    /// Materialize credential caches for every requested service account and
    /// persist their lease metadata. Nothing survives on disk when any stage
    /// fails.
    pub async fn create_lease(&self, req: CreateLease) -> Result<Vec<LeaseMetadata>, Error> {
        // Reject hostile identifiers before anything is spawned or written.
        util::validate_identifier("lease id", &req.lease_id)?;
        util::validate_domain(&req.domain)?;
        ensure!(
            !req.accounts.is_empty(),
            util::EmptyIdentifier {
                what: "service account",
            }
        );
        for account in &req.accounts {
            util::validate_identifier("service account", account)?;
        }
        if let TgtMode::User { username, .. } = &req.mode {
            util::validate_identifier("username", username)?;
        }

        let lock = self.lease_lock(&req.lease_id).await;
        let _guard = lock.lock().await;

        if self.retired.lock().await.contains(&req.lease_id) {
            return Err(store::Error::Conflict {
                lease_id: req.lease_id.clone(),
            }
            .into());
        }

        probe::verify()?;
        let lease_dir = self.store.reserve(&req.lease_id)?;

        match self.populate(&req, &lease_dir).await {
            Ok(created) => {
                tracing::info!(
                    lease_id = %req.lease_id,
                    accounts = created.len(),
                    "lease created"
                );
                Ok(created)
            }
            Err(err) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&lease_dir) {
                    tracing::warn!(
                        error = cleanup.chain(),
                        lease_id = %req.lease_id,
                        "could not roll back lease directory"
                    );
                }
                Err(err)
            }
        }
    }

    async fn populate(
        &self,
        req: &CreateLease,
        lease_dir: &std::path::Path,
    ) -> Result<Vec<LeaseMetadata>, Error> {
        let domainless_user = auth::ensure_tgt(&req.mode, &req.domain).await?;
        let dcs = dns::locate(&req.domain).await?;

        let mut created = Vec::new();
        for (index, account) in req.accounts.iter().enumerate() {
            let blob = gmsa::fetch(&req.domain, account, &dcs).await?;
            let principal = auth::service_principal(account, &req.domain);
            let cache = self.store.cache_path(&req.lease_id, index, account);
            ticket::materialize(&blob, &principal, &cache, lease_dir).await?;

            let meta = LeaseMetadata::new(
                &req.lease_id,
                account,
                &req.domain,
                cache,
                domainless_user.as_deref(),
            );
            self.store.write(&meta)?;
            created.push(meta);
        }
        Ok(created)
    }

    /// Tear a lease down: kdestroy every cache its metadata references, then
    /// remove the lease directory. Best-effort; returns the caches that were
    /// destroyed successfully.
    pub async fn delete_lease(&self, lease_id: &str) -> Result<Vec<PathBuf>, Error> {
        util::validate_identifier("lease id", lease_id)?;

        let lock = self.lease_lock(lease_id).await;
        let _guard = lock.lock().await;

        let destroyed = self.store.destroy(lease_id).await?;
        self.retired.lock().await.insert(lease_id.to_owned());
        self.locks.lock().await.remove(lease_id);
        tracing::info!(lease_id, destroyed = destroyed.len(), "lease destroyed");
        Ok(destroyed)
    }

    /// Re-run the fetch and materialize pipeline for one persisted ticket.
    /// Intentionally lock-free: a concurrent destroy wins and the failing
    /// write is logged by the caller, not fatal.
    pub(crate) async fn refresh_ticket(&self, meta: &LeaseMetadata) -> Result<(), Error> {
        let dcs = dns::locate(&meta.domain_name).await?;
        let blob = gmsa::fetch(&meta.domain_name, &meta.service_account_name, &dcs).await?;
        let principal = auth::service_principal(&meta.service_account_name, &meta.domain_name);
        let lease_dir = self.store.lease_dir(&meta.lease_id);
        ticket::materialize(&blob, &principal, &meta.krb_file_path, &lease_dir).await?;
        Ok(())
    }

    pub(crate) async fn reauth_for(&self, meta: &LeaseMetadata) -> Result<(), Error> {
        if meta.is_domainless() {
            auth::reauth_domainless(&meta.domainless_user, &meta.domain_name).await?;
        } else {
            auth::ensure_tgt(&TgtMode::Machine, &meta.domain_name).await?;
        }
        Ok(())
    }

    /// Push-style domainless renewal: the control plane supplies the user's
    /// credentials and every lease owned by that user is refreshed.
    pub async fn renew_tickets_domainless(
        &self,
        domain: &str,
        username: &str,
        password: Zeroizing<String>,
    ) -> Result<Vec<PathBuf>, Error> {
        util::validate_domain(domain)?;
        util::validate_identifier("username", username)?;

        let mode = TgtMode::User {
            username: username.to_owned(),
            password,
        };

        let mut renewed = Vec::new();
        for meta in self.store.list()? {
            if meta.domainless_user != username {
                continue;
            }
            let refreshed = match self.refresh_ticket(&meta).await {
                Err(err) if err.is_auth_failure() => {
                    auth::ensure_tgt(&mode, domain).await?;
                    self.refresh_ticket(&meta).await
                }
                other => other,
            };
            match refreshed {
                Ok(()) => renewed.push(meta.krb_file_path.clone()),
                Err(err) => tracing::warn!(
                    error = err.chain(),
                    cache = %meta.krb_file_path.display(),
                    "could not renew domainless ticket"
                ),
            }
        }
        Ok(renewed)
    }

    async fn lease_lock(&self, lease_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(lease_id.to_owned())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, Engine) {
        let root = tempdir().unwrap();
        let engine = Engine::new(root.path());
        (root, engine)
    }

    #[tokio::test]
    async fn injection_is_rejected_before_any_side_effect() {
        let (root, engine) = engine();

        let err = engine
            .create_lease(CreateLease {
                lease_id: "lease-001".into(),
                domain: "contoso.com; rm -rf /".into(),
                accounts: vec!["webapp01".into()],
                mode: TgtMode::Machine,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.exit_code(), 1);

        // Nothing was reserved or written.
        assert!(engine.store().list().unwrap().is_empty());
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn every_identifier_is_validated() {
        let (_root, engine) = engine();

        for req in [
            CreateLease {
                lease_id: "lease 001".into(),
                domain: "contoso.com".into(),
                accounts: vec!["webapp01".into()],
                mode: TgtMode::Machine,
            },
            CreateLease {
                lease_id: "lease-001".into(),
                domain: "contoso.com".into(),
                accounts: vec!["webapp01$(reboot)".into()],
                mode: TgtMode::Machine,
            },
            CreateLease {
                lease_id: "lease-001".into(),
                domain: "contoso.com".into(),
                accounts: vec![],
                mode: TgtMode::Machine,
            },
        ] {
            let err = engine.create_lease(req).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }

        let err = engine.delete_lease("lease;rm").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn deleting_an_unknown_lease_is_empty_not_fatal() {
        let (_root, engine) = engine();
        assert!(engine.delete_lease("lease-404").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn destroyed_lease_ids_do_not_come_back() {
        let (_root, engine) = engine();

        engine.delete_lease("lease-001").await.unwrap();
        let err = engine
            .create_lease(CreateLease {
                lease_id: "lease-001".into(),
                domain: "contoso.com".into(),
                accounts: vec!["webapp01".into()],
                mode: TgtMode::Machine,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Io {
                source: store::Error::Conflict { .. }
            }
        ));
    }

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        let io_err: Error = store::LeaseStore::new("/proc/definitely-not-writable")
            .reserve("x")
            .unwrap_err()
            .into();
        assert_eq!(io_err.exit_code(), 3);

        let invalid: Error = util::validate_identifier("lease id", "a b").unwrap_err().into();
        assert_eq!(invalid.exit_code(), 1);
    }
}
