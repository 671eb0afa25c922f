/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::{self, config};
use crate::trace::*;
use crate::{proc, secrets, util};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use snafu::prelude::*;
use zeroize::Zeroizing;

// Layout of the msDS-ManagedPassword blob: version, reserved, length and four
// offset fields (16 bytes) ahead of the current password. The decoder binary
// consumes exactly GMSA_PASSWORD_SIZE bytes; both constants live here and
// nowhere else.
pub const GMSA_PASSWORD_SIZE: usize = 256;
pub const GMSA_PASSWORD_OFFSET: usize = 16;

const MANAGED_PASSWORD_MARKER: &str = "msDS-ManagedPassword::";
const MANAGED_PASSWORD_TOKEN: &str = "msds-ManagedPassword";
const DEFAULT_GMSA_OU: &str = "CN=Managed Service Accounts";
const ATTEMPTS_PER_DC: usize = 2;

// MIT tool stderr fragments that mean the GSSAPI bind itself failed, as
// opposed to the server being unreachable.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "Ticket expired",
    "No Kerberos credentials",
    "Credentials cache",
    "Invalid credentials",
    "Local error",
];

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("LDAP entry for `{account}` carries no managed password"))]
    NoPasswordInLdap { account: String },
    #[snafu(display("No domain controller answered the managed password search for `{domain}`"))]
    LdapUnreachable { domain: String },
    #[snafu(display("GSSAPI bind to `{fqdn}` failed"))]
    LdapAuthFailed { fqdn: String },
    #[snafu(display("ldapsearch against `{domain}` kept timing out"))]
    LdapTimedOut { domain: String, source: proc::Error },
    #[snafu(display("Managed password is not valid base64"))]
    Base64Malformed { source: base64::DecodeError },
    #[snafu(display("Managed password blob is truncated ({len} bytes)"))]
    BlobTooShort { len: usize },
}

impl Error {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::LdapAuthFailed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::LdapTimedOut { .. })
    }
}

// The base64-decoded payload of `msDS-ManagedPassword`, pinned in memory
// that is wiped on drop. Only the current-password window is ever exposed.
pub struct ManagedPasswordBlob(Zeroizing<Vec<u8>>);

impl ManagedPasswordBlob {
    fn parse(raw: Zeroizing<Vec<u8>>) -> Result<Self, Error> {
        ensure!(
            raw.len() >= GMSA_PASSWORD_OFFSET + GMSA_PASSWORD_SIZE,
            BlobTooShort { len: raw.len() }
        );
        Ok(Self(raw))
    }

    pub fn current_password(&self) -> &[u8] {
        &self.0[GMSA_PASSWORD_OFFSET..GMSA_PASSWORD_OFFSET + GMSA_PASSWORD_SIZE]
    }
}

// Retrieve the managed password of `account` by searching each candidate
// domain controller over an LDAP-over-GSSAPI bind. Each controller gets two
// attempts; a bind failure aborts the sweep because the underlying TGT is
// process-global and no other controller can do better.
pub async fn fetch(
    domain: &str,
    account: &str,
    dcs: &[String],
) -> Result<ManagedPasswordBlob, Error> {
    let override_words = resolve_base_dn_override(account).await;
    let computed_dn = format!(
        "CN={account},{},{}",
        conf::cf_lookup(conf::ENV_GMSA_OU).unwrap_or_else(|| DEFAULT_GMSA_OU.to_owned()),
        derive_base_dn(domain)
    );

    let mut last_error: Option<Error> = None;
    for fqdn in dcs.iter().map(String::as_str) {
        let url = format!("ldap://{fqdn}");
        let mut args: Vec<&str> = vec!["-LLL", "-Y", "GSSAPI", "-H", &url, "-b"];
        match &override_words {
            Some(words) => args.extend(words.iter().map(String::as_str)),
            None => args.extend([
                computed_dn.as_str(),
                "-s",
                "sub",
                "(objectClass=msDs-GroupManagedServiceAccount)",
                "msDS-ManagedPassword",
            ]),
        }

        tracing::info!(%fqdn, account, "searching for managed password");
        'attempts: for attempt in 1..=ATTEMPTS_PER_DC {
            let out = match proc::run(
                "ldapsearch",
                &args,
                &[],
                None,
                config().timeouts.ldapsearch,
            )
            .await
            {
                Ok(out) => out,
                Err(err) => {
                    tracing::warn!(error = err.chain(), %fqdn, attempt, "ldapsearch did not run");
                    last_error = Some(if err.is_timeout() {
                        Error::LdapTimedOut {
                            domain: domain.to_owned(),
                            source: err,
                        }
                    } else {
                        Error::LdapUnreachable {
                            domain: domain.to_owned(),
                        }
                    });
                    continue;
                }
            };

            if !out.success() {
                if classify_bind_failure(&out.stderr) {
                    tracing::error!(%fqdn, "ldapsearch could not bind, reauthentication required");
                    return LdapAuthFailed { fqdn }.fail();
                }
                tracing::warn!(
                    %fqdn,
                    attempt,
                    code = out.code.unwrap_or(-1),
                    "ldapsearch failed"
                );
                last_error = Some(Error::LdapUnreachable {
                    domain: domain.to_owned(),
                });
                continue;
            }

            match extract_password_b64(&out.stdout) {
                Some(b64) => {
                    tracing::info!(%fqdn, account, "ldapsearch succeeded");
                    return decode_blob(&b64);
                }
                None => {
                    // The entry exists but the attribute is absent; asking the
                    // same controller again cannot help.
                    tracing::warn!(%fqdn, account, "managed password attribute is missing");
                    last_error = Some(Error::NoPasswordInLdap {
                        account: account.to_owned(),
                    });
                    break 'attempts;
                }
            }
        }
    }

    Err(last_error.unwrap_or(Error::LdapUnreachable {
        domain: domain.to_owned(),
    }))
}

// A base-DN override comes from CF_GMSA_BASE_DN or from the broker secret's
// distinguishedName. The attribute selector rides along as extra argv words,
// appended when the override does not already carry the token.
async fn resolve_base_dn_override(account: &str) -> Option<Vec<String>> {
    let mut dn = conf::cf_lookup(conf::ENV_GMSA_BASE_DN);

    if let Some(secret_id) = conf::cf_lookup(conf::ENV_GMSA_SECRET_NAME) {
        match secrets::fetch(&secret_id).await {
            Ok(creds) => {
                if let Some(broker_dn) = creds.distinguished_name {
                    tracing::debug!(account, "using distinguished name from the broker secret");
                    dn = Some(broker_dn);
                }
            }
            Err(err) => {
                tracing::debug!(error = err.chain(), "broker secret not usable for base DN")
            }
        }
    }

    dn.map(|dn| override_words(&dn))
}

fn override_words(dn: &str) -> Vec<String> {
    let mut dn = dn.to_owned();
    if !dn.contains(MANAGED_PASSWORD_TOKEN) {
        dn.push(' ');
        dn.push_str(MANAGED_PASSWORD_TOKEN);
    }
    dn.split_whitespace().map(str::to_owned).collect()
}

fn derive_base_dn(domain: &str) -> String {
    domain
        .split('.')
        .map(|part| format!("DC={part}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn classify_bind_failure(stderr: &str) -> bool {
    AUTH_FAILURE_MARKERS.iter().any(|m| stderr.contains(m))
}

fn extract_password_b64(ldif: &str) -> Option<String> {
    util::segments(ldif)
        .find_map(|seg| {
            seg.find(MANAGED_PASSWORD_MARKER)
                .map(|idx| seg[idx + MANAGED_PASSWORD_MARKER.len()..].trim().to_owned())
        })
        .filter(|b64| !b64.is_empty())
}

fn decode_blob(b64: &str) -> Result<ManagedPasswordBlob, Error> {
    let raw = Zeroizing::new(STANDARD.decode(b64).context(Base64Malformed)?);
    ManagedPasswordBlob::parse(raw)
}

#[cfg(test)]
pub fn test_blob(b64: &str) -> ManagedPasswordBlob {
    decode_blob(b64).expect("valid test blob")
}
