/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::trace::*;

use serde::Deserialize;
use std::{env, fs, path::Path, sync::OnceLock};

pub const ENV_DOMAIN_CONTROLLER: &str = "CF_DOMAIN_CONTROLLER";
pub const ENV_GMSA_OU: &str = "CF_GMSA_OU";
pub const ENV_GMSA_BASE_DN: &str = "CF_GMSA_BASE_DN";
pub const ENV_GMSA_SECRET_NAME: &str = "CF_GMSA_SECRET_NAME";

const DEFAULT_KRB_DIR: &str = "/var/credentials_fetcher/krb_dir";
const DEFAULT_DECODER_PATH: &str = "/usr/sbin/credentials_fetcher_utf16_private.exe";
const DEFAULT_AWS_CLI_PATH: &str = "/usr/bin/aws";
const DEFAULT_ECS_CONFIG_PATH: &str = "/etc/ecs/ecs.config";
const DEFAULT_RENEWAL_INTERVAL: u64 = 600;
const DEFAULT_RENEWAL_THRESHOLD_HOURS: i64 = 1;
const DEFAULT_MAX_CONCURRENT_RENEWALS: usize = 4;
const DEFAULT_LDAPSEARCH_TIMEOUT: u64 = 30;
const DEFAULT_KINIT_TIMEOUT: u64 = 15;
const DEFAULT_KLIST_TIMEOUT: u64 = 5;
const DEFAULT_KDESTROY_TIMEOUT: u64 = 5;
const DEFAULT_BROKER_TIMEOUT: u64 = 30;

#[derive(Deserialize)]
#[serde(default)]
pub struct Renewal {
    pub interval: u64,
    pub threshold_hours: i64,
    pub max_concurrent: usize,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub ldapsearch: u64,
    pub kinit: u64,
    pub klist: u64,
    pub kdestroy: u64,
    pub broker: u64,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub krb_dir: String,
    pub decoder_path: String,
    pub aws_cli_path: String,
    pub ecs_config_path: String,
    pub renewal: Renewal,
    pub timeouts: Timeouts,
}

impl Default for Renewal {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RENEWAL_INTERVAL,
            threshold_hours: DEFAULT_RENEWAL_THRESHOLD_HOURS,
            max_concurrent: DEFAULT_MAX_CONCURRENT_RENEWALS,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ldapsearch: DEFAULT_LDAPSEARCH_TIMEOUT,
            kinit: DEFAULT_KINIT_TIMEOUT,
            klist: DEFAULT_KLIST_TIMEOUT,
            kdestroy: DEFAULT_KDESTROY_TIMEOUT,
            broker: DEFAULT_BROKER_TIMEOUT,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            krb_dir: DEFAULT_KRB_DIR.to_owned(),
            decoder_path: DEFAULT_DECODER_PATH.to_owned(),
            aws_cli_path: DEFAULT_AWS_CLI_PATH.to_owned(),
            ecs_config_path: DEFAULT_ECS_CONFIG_PATH.to_owned(),
            renewal: Renewal::default(),
            timeouts: Timeouts::default(),
        }
    }
}

pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();

    CONFIG.get_or_init(|| {
        config::Config::builder()
            .add_source(
                config::File::with_name(
                    &option_env!("PREFIX")
                        .map_or("/".as_ref(), Path::new)
                        .join("etc/gmsad")
                        .to_string_lossy(),
                )
                .required(false),
            )
            .add_source(config::Environment::with_prefix("GMSAD").separator("__").try_parsing(true))
            .build()
            .and_then(config::Config::try_deserialize)
            .unwrap_or_else(|err| {
                tracing::warn!(error = err.chain(), "could not load configuration");
                Config::default()
            })
    })
}

pub fn load_config() {
    tracing::info!(
        krb_dir = %config().krb_dir,
        decoder_path = %config().decoder_path,
        aws_cli_path = %config().aws_cli_path,
        renewal.interval = config().renewal.interval,
        renewal.threshold_hours = config().renewal.threshold_hours,
        renewal.max_concurrent = config().renewal.max_concurrent,
        "loaded configuration"
    );
}

static ECS_MODE: OnceLock<bool> = OnceLock::new();

// Set once at startup, read-only afterwards.
pub fn set_ecs_mode(enabled: bool) {
    ECS_MODE.set(enabled).ok();
}

pub fn ecs_mode() -> bool {
    *ECS_MODE.get().unwrap_or(&false)
}

// Look up one of the `CF_*` interface variables: the process environment
// wins, the ECS agent configuration file is the fallback.
pub fn cf_lookup(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| retrieve_from_ecs_config(name))
}

fn retrieve_from_ecs_config(name: &str) -> Option<String> {
    let path = &config().ecs_config_path;
    let content = fs::read_to_string(path).ok()?;
    parse_ecs_config(&content, name)
}

// Shell-style KEY=VALUE lines, scanned in order. The first matching key wins;
// a line that is not KEY=VALUE after trimming rejects the file. Unknown keys
// are ignored.
fn parse_ecs_config(content: &str, name: &str) -> Option<String> {
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(line, "invalid configuration format");
            return None;
        };
        let (key, value) = (key.trim_end(), value.trim_start());
        if key.is_empty() {
            tracing::warn!(line, "invalid configuration format");
            return None;
        }
        if key == name {
            return Some(value.to_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecs_config_lookup() {
        let content = "CF_DOMAIN_CONTROLLER=dc1.contoso.com\nCF_GMSA_SECRET_NAME = gmsa-secret\n";
        assert_eq!(
            parse_ecs_config(content, "CF_DOMAIN_CONTROLLER").as_deref(),
            Some("dc1.contoso.com")
        );
        assert_eq!(
            parse_ecs_config(content, "CF_GMSA_SECRET_NAME").as_deref(),
            Some("gmsa-secret")
        );
        assert_eq!(parse_ecs_config(content, "CF_GMSA_OU"), None);
    }

    #[test]
    fn ecs_config_rejects_malformed_lines() {
        assert_eq!(
            parse_ecs_config("not a key value pair\nCF_GMSA_OU=x\n", "CF_GMSA_OU"),
            None
        );
        assert_eq!(parse_ecs_config("=value\nCF_GMSA_OU=x\n", "CF_GMSA_OU"), None);
    }

    #[test]
    fn ecs_config_first_match_wins() {
        let content = "K=1\nK=2\n";
        assert_eq!(parse_ecs_config(content, "K").as_deref(), Some("1"));
    }
}
