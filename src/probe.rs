/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::config;
use crate::{proc, util};

use nix::unistd::{access, AccessFlags};
use snafu::prelude::*;
use std::{
    env,
    path::{Path, PathBuf},
};

// Tools resolved through PATH, probed in this order.
const PATH_TOOLS: &[&str] = &["hostname", "realm", "kinit", "klist", "kdestroy", "ldapsearch"];

const REALM_TIMEOUT: u64 = 5;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Required tool `{tool}` is missing or not executable"))]
    MissingTool { tool: String },
    #[snafu(display("Failed to run `realm list`"))]
    RealmTool { source: proc::Error },
    #[snafu(display("`realm list` exited with status {code:?}"))]
    RealmDiscovery { code: Option<i32> },
    #[snafu(display("Host is not joined to any realm"))]
    RealmNotJoined,
    #[snafu(display("Configured domain `{domain}` does not match joined realm `{realm}`"))]
    RealmMismatch { domain: String, realm: String },
}

// Check every external tool this daemon shells out to. Fails on the first
// missing one; cheap enough to repeat before each authentication attempt.
pub fn verify() -> Result<(), Error> {
    for tool in PATH_TOOLS {
        which(tool).context(MissingTool { tool: *tool })?;
    }
    for path in [&config().decoder_path, &config().aws_cli_path] {
        ensure!(
            is_executable(Path::new(path)),
            MissingTool { tool: path.clone() }
        );
    }
    Ok(())
}

pub async fn discovered_realm() -> Result<String, Error> {
    let out = proc::run("realm", &["list"], &[], None, REALM_TIMEOUT)
        .await
        .context(RealmTool)?;
    ensure!(out.success(), RealmDiscovery { code: out.code });

    let realm = util::segments(&out.stdout)
        .find_map(|seg| seg.strip_prefix("realm-name:"))
        .map(|name| name.trim().to_uppercase())
        .context(RealmNotJoined);
    realm
}

// Resolve the joined realm and reject a configuration that points at a
// different domain. Returns the canonical uppercase realm.
pub async fn check_domain(domain: &str) -> Result<String, Error> {
    let realm = discovered_realm().await?;
    ensure!(
        realm.eq_ignore_ascii_case(domain),
        RealmMismatch { domain, realm }
    );
    Ok(realm)
}

fn which(tool: &str) -> Option<PathBuf> {
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(tool))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executability_check() {
        assert!(!is_executable(Path::new("/nonexistent/tool")));
        // A directory is never an acceptable tool.
        assert!(!is_executable(Path::new("/")));
    }

    #[test]
    fn realm_name_extraction() {
        let out = "contoso.com\n  type: kerberos\n  realm-name: CONTOSO.COM\n  domain-name: contoso.com\n";
        let realm = util::segments(out)
            .find_map(|seg| seg.strip_prefix("realm-name:"))
            .map(|name| name.trim().to_uppercase());
        assert_eq!(realm.as_deref(), Some("CONTOSO.COM"));
    }
}
