/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::config;
use crate::proc;

use serde::Deserialize;
use snafu::prelude::*;
use std::fmt;
use zeroize::Zeroizing;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to invoke the secrets broker for `{secret_id}`"))]
    Broker {
        secret_id: String,
        source: proc::Error,
    },
    #[snafu(display("Secret `{secret_id}` was not found (status {code:?})"))]
    NotFound {
        secret_id: String,
        code: Option<i32>,
    },
    #[snafu(display("Secret `{secret_id}` is not a credential blob"))]
    Malformed { secret_id: String },
}

pub struct BrokeredCredentials {
    pub username: String,
    pub password: Zeroizing<String>,
    pub distinguished_name: Option<String>,
}

impl fmt::Debug for BrokeredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokeredCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("distinguished_name", &self.distinguished_name)
            .finish()
    }
}

#[derive(Deserialize)]
struct RawSecret {
    username: Option<String>,
    password: Option<String>,
    #[serde(default, rename = "distinguishedName")]
    distinguished_name: Option<String>,
}

// Fetch a credential blob from the cloud secrets store. The password never
// reaches the logs and the transient output buffer is wiped after parsing.
pub async fn fetch(secret_id: &str) -> Result<BrokeredCredentials, Error> {
    let out = proc::run(
        &config().aws_cli_path,
        &[
            "secretsmanager",
            "get-secret-value",
            "--secret-id",
            secret_id,
            "--query",
            "SecretString",
            "--output",
            "text",
        ],
        &[],
        None,
        config().timeouts.broker,
    )
    .await
    .context(Broker { secret_id })?;

    ensure!(
        out.success(),
        NotFound {
            secret_id,
            code: out.code,
        }
    );

    let stdout = Zeroizing::new(out.stdout);
    parse_credentials(&stdout).context(Malformed { secret_id })
}

fn parse_credentials(json: &str) -> Option<BrokeredCredentials> {
    let mut raw: RawSecret = serde_json::from_str(json).ok()?;

    let username = raw.username.take().filter(|u| !u.is_empty())?;
    let password = Zeroizing::new(raw.password.take().filter(|p| !p.is_empty())?);
    let distinguished_name = raw.distinguished_name.take().filter(|d| !d.is_empty());

    Some(BrokeredCredentials {
        username,
        password,
        distinguished_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_blob_parsing() {
        let creds = parse_credentials(
            r#"{"username":"svc-reader","password":"hunter2","distinguishedName":"CN=x,DC=contoso,DC=com"}"#,
        )
        .unwrap();
        assert_eq!(creds.username, "svc-reader");
        assert_eq!(creds.password.as_str(), "hunter2");
        assert_eq!(
            creds.distinguished_name.as_deref(),
            Some("CN=x,DC=contoso,DC=com")
        );
    }

    #[test]
    fn empty_distinguished_name_is_normalized() {
        let creds = parse_credentials(
            r#"{"username":"svc-reader","password":"hunter2","distinguishedName":""}"#,
        )
        .unwrap();
        assert_eq!(creds.distinguished_name, None);
    }

    #[test]
    fn malformed_blobs_are_refused() {
        assert!(parse_credentials("not json").is_none());
        assert!(parse_credentials(r#"{"username":"x"}"#).is_none());
        assert!(parse_credentials(r#"{"username":"","password":"y"}"#).is_none());
    }

    #[test]
    fn debug_redacts_the_password() {
        let creds = parse_credentials(r#"{"username":"u","password":"s3cret"}"#).unwrap();
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
