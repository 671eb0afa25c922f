/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::{self, config};
use crate::{probe, proc, secrets, util};

use nix::{errno::Errno, unistd};
use snafu::prelude::*;
use zeroize::Zeroizing;

// NetBIOS computer name limit; AD refuses tickets for longer host names.
pub const HOST_NAME_LIMIT: usize = 15;

const BAD_CREDENTIALS_MARKERS: &[&str] = &[
    "Password incorrect",
    "Preauthentication failed",
    "Client not found in Kerberos database",
];

// Where the ticket-granting ticket comes from.
pub enum TgtMode {
    // Domain-joined host: machine keytab at /etc/krb5.keytab.
    Machine,
    // Domainless: credentials brokered through the cloud secrets store.
    UserFromSecret { secret_id: String },
    // Domainless: credentials supplied by the caller.
    User {
        username: String,
        password: Zeroizing<String>,
    },
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to verify the tool environment"), context(false))]
    Environment { source: probe::Error },
    #[snafu(display("Failed to read the host name"))]
    Hostname { source: Errno },
    #[snafu(display("Failed to run kinit"), context(false))]
    Subprocess { source: proc::Error },
    #[snafu(display("kinit exited with status {code}"))]
    KinitFailed { code: i32 },
    #[snafu(display("Credentials were rejected for `{principal}`"))]
    BadCredentials { principal: String },
    #[snafu(display("Failed to fetch broker credentials"), context(false))]
    Secret { source: secrets::Error },
    #[snafu(display("Invalid principal component"), context(false))]
    Input { source: util::Error },
    #[snafu(display("No renewal credentials available for `{user}`"))]
    RenewalCredentialsUnavailable { user: String },
}

impl Error {
    pub fn is_environment(&self) -> bool {
        matches!(self, Error::Environment { .. })
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::Input { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Subprocess { source } if source.is_timeout())
    }
}

// Obtain a TGT into the default credential cache so the subsequent
// LDAP-over-GSSAPI search can bind. Returns the authenticated username in
// the domainless modes so the caller can record who renews the lease. The
// environment is re-probed on every attempt; the cost is noise next to the
// LDAP round-trip.
pub async fn ensure_tgt(mode: &TgtMode, domain: &str) -> Result<Option<String>, Error> {
    probe::verify()?;

    match mode {
        TgtMode::Machine => {
            let realm = probe::check_domain(domain).await?;
            let hostname = unistd::gethostname().context(Hostname)?;
            let hostname = hostname.to_string_lossy();
            let (principal, truncated) = machine_principal(&hostname, &realm);
            if truncated {
                tracing::warn!(
                    %hostname,
                    %principal,
                    "hostname exceeds the NetBIOS limit and was truncated, \
                     long hostnames can prevent kerberos tickets"
                );
            }

            tracing::debug!(%principal, "requesting machine ticket-granting ticket");
            let out = proc::run("kinit", &["-k", &principal], &[], None, config().timeouts.kinit)
                .await?;
            classify_kinit(out, &principal)?;
            Ok(None)
        }
        TgtMode::UserFromSecret { secret_id } => {
            let creds = secrets::fetch(secret_id).await?;
            kinit_with_password(&creds.username, &creds.password, domain).await?;
            Ok(Some(creds.username))
        }
        TgtMode::User { username, password } => {
            kinit_with_password(username, password, domain).await?;
            Ok(Some(username.clone()))
        }
    }
}

// Recover the TGT during a scheduled renewal of a domainless lease. The
// broker secret must belong to the user recorded in the lease metadata.
pub async fn reauth_domainless(domainless_user: &str, domain: &str) -> Result<(), Error> {
    probe::verify()?;

    let Some(secret_id) = conf::cf_lookup(conf::ENV_GMSA_SECRET_NAME) else {
        return RenewalCredentialsUnavailable {
            user: domainless_user,
        }
        .fail();
    };
    let creds = secrets::fetch(&secret_id).await?;
    if creds.username != domainless_user {
        tracing::warn!(
            user = domainless_user,
            broker_user = %creds.username,
            "broker secret does not belong to the lease owner"
        );
        return RenewalCredentialsUnavailable {
            user: domainless_user,
        }
        .fail();
    }
    kinit_with_password(&creds.username, &creds.password, domain).await
}

async fn kinit_with_password(username: &str, password: &str, domain: &str) -> Result<(), Error> {
    util::validate_identifier("username", username)?;
    let principal = format!("{username}@{}", domain.to_uppercase());

    tracing::debug!(%principal, "requesting user ticket-granting ticket");
    let mut input = Zeroizing::new(Vec::with_capacity(password.len() + 1));
    input.extend_from_slice(password.as_bytes());
    input.push(b'\n');

    let out = proc::run(
        "kinit",
        &[&principal],
        &[],
        Some(&input),
        config().timeouts.kinit,
    )
    .await?;
    classify_kinit(out, &principal)
}

fn classify_kinit(out: proc::Output, principal: &str) -> Result<(), Error> {
    if out.success() {
        return Ok(());
    }
    if BAD_CREDENTIALS_MARKERS.iter().any(|m| out.stderr.contains(m)) {
        return BadCredentials { principal }.fail();
    }
    tracing::error!(
        code = out.code.unwrap_or(-1),
        stderr = %out.stderr.trim(),
        "kinit failed"
    );
    KinitFailed {
        code: out.code.unwrap_or(-1),
    }
    .fail()
}

// Machine principal `SHORTHOST$@REALM`; the short host is truncated to the
// NetBIOS limit. The flag reports whether truncation happened so the caller
// can surface the soft error.
pub fn machine_principal(hostname: &str, realm: &str) -> (String, bool) {
    let short = hostname.split('.').next().unwrap_or(hostname);
    let truncated = short.chars().count() > HOST_NAME_LIMIT;
    let short: String = short.chars().take(HOST_NAME_LIMIT).collect();
    (format!("{short}$@{realm}"), truncated)
}

// Service-account principal `ACCOUNT$@REALM`.
pub fn service_principal(account: &str, realm: &str) -> String {
    format!("{account}$@{}", realm.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hostnames_pass_through() {
        let (principal, truncated) = machine_principal("ec2amaz-q5vjzq.contoso.com", "CONTOSO.COM");
        assert_eq!(principal, "ec2amaz-q5vjzq$@CONTOSO.COM");
        assert!(!truncated);
    }

    #[test]
    fn long_hostnames_are_truncated() {
        let (principal, truncated) =
            machine_principal("very-long-host-name-16.contoso.com", "CONTOSO.COM");
        assert_eq!(principal, "very-long-host-$@CONTOSO.COM");
        assert!(truncated);
    }

    #[test]
    fn service_principals_uppercase_the_realm() {
        assert_eq!(
            service_principal("webapp01", "contoso.com"),
            "webapp01$@CONTOSO.COM"
        );
    }
}
