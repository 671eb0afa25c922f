/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf;
use crate::trace::*;

use regex_lite::Regex;
use snafu::prelude::*;
use std::{net::IpAddr, sync::OnceLock};
use trust_dns_resolver::{error::ResolveError, AsyncResolver};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to resolve addresses for domain `{domain}`"))]
    HostLookup { domain: String, source: ResolveError },
    #[snafu(display("Malformed A record `{record}` for domain `{domain}`"))]
    BadDnsResponse { domain: String, record: String },
    #[snafu(display("No domain controller configured for `{domain}`"))]
    DcNotConfigured { domain: String },
    #[snafu(display("Failed to find a viable domain controller for `{domain}`"))]
    NoViableDc { domain: String },
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new(
            "^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\\.){3}\
             ([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
        )
        .expect("invalid IPv4 regex")
    })
}

// Discover candidate domain controllers for `domain`, most preferred first.
// The order is the DNS answer order so that retries are deterministic.
pub async fn locate(domain: &str) -> Result<Vec<String>, Error> {
    if let Some(fqdn) = conf::cf_lookup(conf::ENV_DOMAIN_CONTROLLER) {
        tracing::debug!(domain, %fqdn, "using configured domain controller");
        return Ok(vec![fqdn]);
    }
    // On ECS hosts discovery is delegated to the agent configuration.
    ensure!(!conf::ecs_mode(), DcNotConfigured { domain });

    let resolver = AsyncResolver::tokio_from_system_conf().context(HostLookup { domain })?;

    tracing::debug!(domain, "resolving domain controller addresses");
    let answer = resolver
        .ipv4_lookup(domain)
        .await
        .context(HostLookup { domain })?;

    let mut controllers = Vec::new();
    for a in answer.iter() {
        let record = a.0.to_string();
        ensure!(
            ipv4_regex().is_match(&record),
            BadDnsResponse { domain, record }
        );

        let names = match resolver.reverse_lookup(IpAddr::V4(a.0)).await {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::debug!(error = err.chain(), address = %record, "reverse lookup failed");
                continue;
            }
        };
        for name in names.iter() {
            if let Some(fqdn) = accept_controller(&name.to_utf8(), domain) {
                if !controllers.contains(&fqdn) {
                    controllers.push(fqdn);
                }
            }
        }
    }

    ensure!(!controllers.is_empty(), NoViableDc { domain });
    Ok(controllers)
}

// Resolutions like ip-10-0-0-162.us-west-1.compute.internal carry no trace of
// the configured domain and are dropped.
fn accept_controller(fqdn: &str, domain: &str) -> Option<String> {
    let fqdn = fqdn.strip_suffix('.').unwrap_or(fqdn).to_lowercase();
    (!fqdn.is_empty() && fqdn.contains(&domain.to_lowercase())).then_some(fqdn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_ipv4_validation() {
        for record in ["10.0.0.10", "255.255.255.255", "0.0.0.0", "192.168.1.1"] {
            assert!(ipv4_regex().is_match(record), "`{record}` must pass");
        }
        for record in ["999.1.2.3", "10.0.0", "10.0.0.256", "1.2.3.4.5", "a.b.c.d", ""] {
            assert!(!ipv4_regex().is_match(record), "`{record}` must fail");
        }
    }

    #[test]
    fn controller_acceptance() {
        assert_eq!(
            accept_controller("dc1.contoso.com.", "contoso.com").as_deref(),
            Some("dc1.contoso.com")
        );
        assert_eq!(
            accept_controller("DC1.CONTOSO.COM.", "contoso.com").as_deref(),
            Some("dc1.contoso.com")
        );
        assert_eq!(
            accept_controller("ip-10-0-0-162.us-west-1.compute.internal.", "contoso.com"),
            None
        );
        assert_eq!(accept_controller("", "contoso.com"), None);
    }

    #[test]
    fn acceptance_preserves_discovery_order() {
        let names = ["dc2.contoso.com.", "dc1.contoso.com.", "dc2.contoso.com."];
        let mut controllers: Vec<String> = Vec::new();
        for name in names {
            if let Some(fqdn) = accept_controller(name, "contoso.com") {
                if !controllers.contains(&fqdn) {
                    controllers.push(fqdn);
                }
            }
        }
        assert_eq!(controllers, vec!["dc2.contoso.com", "dc1.contoso.com"]);
    }
}
