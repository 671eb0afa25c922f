/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::config;
use crate::proc;
use crate::trace::*;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

pub const METADATA_SUFFIX: &str = "_metadata";
const CACHE_FILE_NAME: &str = "krb5_cc";

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Lease `{lease_id}` already exists"))]
    Conflict { lease_id: String },
    #[snafu(display("I/O failure under `{}`", path.display()))]
    Io { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to encode lease metadata"))]
    Encode { source: serde_json::Error },
    #[snafu(display("Failed to persist metadata to `{}`", path.display()))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

// One persisted record per principal per lease; the metadata files are the
// sole source of truth for renewal and deletion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseMetadata {
    pub lease_id: String,
    pub service_account_name: String,
    pub domain_name: String,
    pub krb_file_path: PathBuf,
    pub created_at: String,
    #[serde(default)]
    pub domainless_user: String,
}

impl LeaseMetadata {
    pub fn new(
        lease_id: &str,
        account: &str,
        domain: &str,
        cache: PathBuf,
        domainless_user: Option<&str>,
    ) -> Self {
        Self {
            lease_id: lease_id.to_owned(),
            service_account_name: account.to_owned(),
            domain_name: domain.to_owned(),
            krb_file_path: cache,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            domainless_user: domainless_user.unwrap_or_default().to_owned(),
        }
    }

    pub fn is_domainless(&self) -> bool {
        !self.domainless_user.is_empty()
    }
}

pub struct LeaseStore {
    root: PathBuf,
}

impl LeaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lease_dir(&self, lease_id: &str) -> PathBuf {
        self.root.join(lease_id)
    }

    // Cache file for the nth service account of a lease. The first account
    // owns the plain `krb5_cc` name; later ones are disambiguated.
    pub fn cache_path(&self, lease_id: &str, index: usize, account: &str) -> PathBuf {
        let dir = self.lease_dir(lease_id);
        if index == 0 {
            dir.join(CACHE_FILE_NAME)
        } else {
            dir.join(format!("{CACHE_FILE_NAME}_{account}"))
        }
    }

    // Reserve the lease directory. An existing directory means the lease id
    // is taken.
    pub fn reserve(&self, lease_id: &str) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.root).context(Io { path: &self.root })?;
        let dir = self.lease_dir(lease_id);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(dir),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Conflict { lease_id }.fail()
            }
            Err(err) => Err(err).context(Io { path: dir }),
        }
    }

    pub fn write(&self, meta: &LeaseMetadata) -> Result<PathBuf, Error> {
        let dir = self.lease_dir(&meta.lease_id);
        let path = dir.join(format!("{}{METADATA_SUFFIX}", meta.service_account_name));
        let json = serde_json::to_vec_pretty(meta).context(Encode)?;

        let mut tmp = NamedTempFile::new_in(&dir).context(Io { path: &dir })?;
        tmp.write_all(&json).context(Io { path: &path })?;
        tmp.persist(&path).context(Persist { path: &path })?;
        Ok(path)
    }

    pub fn list(&self) -> Result<Vec<LeaseMetadata>, Error> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context(Io { path: &self.root }),
        };

        let mut metas = Vec::new();
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                metas.extend(self.read_lease_dir(&entry.path()));
            }
        }
        Ok(metas)
    }

    pub fn for_lease(&self, lease_id: &str) -> Result<Vec<LeaseMetadata>, Error> {
        let dir = self.lease_dir(lease_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        Ok(self.read_lease_dir(&dir))
    }

    // Partially-written directories are expected during crashes; anything that
    // is not a parseable metadata file is skipped.
    fn read_lease_dir(&self, dir: &Path) -> Vec<LeaseMetadata> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut metas = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(METADATA_SUFFIX) {
                continue;
            }
            match fs::read_to_string(entry.path())
                .map_err(|err| err.to_string())
                .and_then(|json| {
                    serde_json::from_str::<LeaseMetadata>(&json).map_err(|err| err.to_string())
                }) {
                Ok(meta) => metas.push(meta),
                Err(error) => {
                    tracing::warn!(path = %entry.path().display(), %error, "skipping unreadable metadata")
                }
            }
        }
        metas
    }

    // Destroy every cache a lease references, then remove the lease
    // directory. Individual kdestroy failures are logged and skipped; the
    // directory goes away regardless.
    pub async fn destroy(&self, lease_id: &str) -> Result<Vec<PathBuf>, Error> {
        let dir = self.lease_dir(lease_id);
        if !dir.is_dir() {
            tracing::warn!(lease_id, "no lease directory to destroy");
            return Ok(Vec::new());
        }

        let mut destroyed = Vec::new();
        for meta in self.read_lease_dir(&dir) {
            match proc::run(
                "kdestroy",
                &[],
                &[("KRB5CCNAME", meta.krb_file_path.as_os_str())],
                None,
                config().timeouts.kdestroy,
            )
            .await
            {
                Ok(out) if out.success() => destroyed.push(meta.krb_file_path),
                Ok(out) => tracing::warn!(
                    cache = %meta.krb_file_path.display(),
                    code = out.code.unwrap_or(-1),
                    "kdestroy failed"
                ),
                Err(err) => tracing::warn!(
                    error = err.chain(),
                    cache = %meta.krb_file_path.display(),
                    "could not run kdestroy"
                ),
            }
        }

        fs::remove_dir_all(&dir).context(Io { path: dir })?;
        Ok(destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &Path) -> LeaseStore {
        LeaseStore::new(root)
    }

    #[test]
    fn metadata_wire_format_is_stable() {
        let meta = LeaseMetadata::new(
            "lease-001",
            "webapp01",
            "contoso.com",
            PathBuf::from("/var/credentials_fetcher/krb_dir/lease-001/krb5_cc"),
            None,
        );
        let value = serde_json::to_value(&meta).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "leaseId",
            "serviceAccountName",
            "domainName",
            "krbFilePath",
            "createdAt",
            "domainlessUser",
        ] {
            assert!(object.contains_key(key), "missing `{key}`");
        }
        assert_eq!(object["serviceAccountName"], "webapp01");
        assert_eq!(
            object["krbFilePath"],
            "/var/credentials_fetcher/krb_dir/lease-001/krb5_cc"
        );
    }

    #[test]
    fn caches_live_under_the_lease_directory() {
        let store = store(Path::new("/var/credentials_fetcher/krb_dir"));
        let first = store.cache_path("lease-001", 0, "webapp01");
        let second = store.cache_path("lease-001", 1, "webapp02");
        assert_eq!(
            first,
            Path::new("/var/credentials_fetcher/krb_dir/lease-001/krb5_cc")
        );
        assert!(second.starts_with(store.lease_dir("lease-001")));
        assert_ne!(first, second);
    }

    #[test]
    fn reserve_write_list_round_trip() {
        let root = tempdir().unwrap();
        let store = store(root.path());

        store.reserve("lease-001").unwrap();
        let cache = store.cache_path("lease-001", 0, "webapp01");
        let meta = LeaseMetadata::new("lease-001", "webapp01", "contoso.com", cache.clone(), None);
        let path = store.write(&meta).unwrap();
        assert!(path.ends_with("webapp01_metadata"));

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].service_account_name, "webapp01");
        assert_eq!(listed[0].krb_file_path, cache);

        let scoped = store.for_lease("lease-001").unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(store.for_lease("lease-404").unwrap().is_empty());
    }

    #[test]
    fn duplicate_leases_conflict() {
        let root = tempdir().unwrap();
        let store = store(root.path());

        store.reserve("lease-001").unwrap();
        assert!(matches!(
            store.reserve("lease-001"),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn unreadable_metadata_is_skipped() {
        let root = tempdir().unwrap();
        let store = store(root.path());

        let dir = store.reserve("lease-001").unwrap();
        fs::write(dir.join("broken_metadata"), "not json").unwrap();
        fs::write(dir.join("krb5_cc"), "binary").unwrap();
        let meta = LeaseMetadata::new(
            "lease-001",
            "webapp01",
            "contoso.com",
            store.cache_path("lease-001", 0, "webapp01"),
            Some("svc-reader"),
        );
        store.write(&meta).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_domainless());
    }

    #[tokio::test]
    async fn destroy_removes_the_lease_directory() {
        let root = tempdir().unwrap();
        let store = store(root.path());

        let dir = store.reserve("lease-x").unwrap();
        for (index, account) in ["webapp01", "webapp02"].into_iter().enumerate() {
            let meta = LeaseMetadata::new(
                "lease-x",
                account,
                "contoso.com",
                store.cache_path("lease-x", index, account),
                None,
            );
            store.write(&meta).unwrap();
        }

        // kdestroy has nothing to destroy here; the sweep must still remove
        // the directory and report only the caches destroyed successfully.
        let destroyed = store.destroy("lease-x").await.unwrap();
        assert!(destroyed.len() <= 2);
        assert!(!dir.exists());

        assert!(store.destroy("lease-x").await.unwrap().is_empty());
    }
}
