/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::conf::config;
use crate::gmsa::ManagedPasswordBlob;
use crate::trace::*;
use crate::{proc, util};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex_lite::Regex;
use snafu::prelude::*;
use std::{io, path::Path, process::Stdio, sync::OnceLock};
use tokio::{io::AsyncWriteExt, process::Command, time};

const RENEW_UNTIL_MARKER: &str = "renew until";

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Credential cache path `{path}` is outside the lease directory"))]
    CachePath { path: String },
    #[snafu(display("Failed to spawn the password decoder"))]
    DecoderSpawn { source: io::Error },
    #[snafu(display("Failed to feed the password decoder"))]
    DecoderPipe { source: io::Error },
    #[snafu(display("Failed to spawn kinit"))]
    KinitSpawn { source: io::Error },
    #[snafu(display("Failed to collect kinit output"))]
    KinitCollect { source: io::Error },
    #[snafu(display("Ticket materialization did not finish within {seconds}s"))]
    TimedOut { seconds: u64 },
    #[snafu(display("kinit exited with status {code}"))]
    KinitFailed { code: i32 },
    #[snafu(display("Failed to run klist"), context(false))]
    Subprocess { source: proc::Error },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
            || matches!(self, Error::Subprocess { source } if source.is_timeout())
    }
}

// Turn a managed password blob into a per-lease credential cache by piping
// the fixed-size password window through the UTF-16 decoder into
// `kinit -c <cache> -V <principal>`. The blob stays in secure memory and is
// wiped by its owner on every path.
pub async fn materialize(
    blob: &ManagedPasswordBlob,
    principal: &str,
    cache_path: &Path,
    lease_dir: &Path,
) -> Result<(), Error> {
    ensure!(
        cache_path.is_absolute() && cache_path.starts_with(lease_dir),
        CachePath {
            path: cache_path.display().to_string(),
        }
    );

    let mut decoder = Command::new(&config().decoder_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context(DecoderSpawn)?;

    let decoded: Stdio = decoder
        .stdout
        .take()
        .expect("stdout was piped")
        .try_into()
        .context(DecoderSpawn)?;

    let mut kinit = Command::new("kinit")
        .arg("-c")
        .arg(cache_path)
        .arg("-V")
        .arg(principal)
        .stdin(decoded)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context(KinitSpawn)?;

    // Exactly the password window, then EOF.
    let mut pipe = decoder.stdin.take().expect("stdin was piped");
    pipe.write_all(blob.current_password())
        .await
        .context(DecoderPipe)?;
    drop(pipe);

    let seconds = config().timeouts.kinit;
    let (dec, out) = time::timeout(time::Duration::from_secs(seconds), async {
        let dec = decoder.wait().await;
        let out = kinit.wait_with_output().await;
        (dec, out)
    })
    .await
    .ok()
    .context(TimedOut { seconds })?;

    if let Err(err) = dec {
        tracing::warn!(error = err.chain(), "could not wait on the password decoder");
    }
    let out = out.context(KinitCollect)?;

    if out.status.success() {
        tracing::debug!(%principal, cache = %cache_path.display(), "credential cache written");
        Ok(())
    } else {
        tracing::error!(
            %principal,
            code = out.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "kinit failed"
        );
        KinitFailed {
            code: out.status.code().unwrap_or(-1),
        }
        .fail()
    }
}

// Read the `renew until` stamp of a credential cache. `None` means the
// output was absent or unparseable; the caller skips renewal this cycle
// without discarding the ticket.
pub async fn renew_until(cache_path: &Path) -> Result<Option<DateTime<Local>>, Error> {
    let out = proc::run(
        "klist",
        &[],
        &[("KRB5CCNAME", cache_path.as_os_str())],
        None,
        config().timeouts.klist,
    )
    .await?;

    if !out.success() {
        tracing::warn!(
            cache = %cache_path.display(),
            code = out.code.unwrap_or(-1),
            "klist failed"
        );
        return Ok(None);
    }

    let Some(stamp) = get_ticket_expiration(&out.stdout) else {
        tracing::warn!(cache = %cache_path.display(), "could not parse klist output");
        return Ok(None);
    };
    Ok(parse_expiration(&stamp).and_then(to_local))
}

pub fn within_renewal_window(
    renew_until: DateTime<Local>,
    now: DateTime<Local>,
    threshold_hours: i64,
) -> bool {
    renew_until.signed_duration_since(now) <= chrono::Duration::hours(threshold_hours)
}

// Extract `<date> <time>` from the `renew until` line of klist output.
// Four-digit years are tried first, two-digit years second.
pub fn get_ticket_expiration(klist_output: &str) -> Option<String> {
    let seg = util::segments(klist_output).find(|seg| seg.contains(RENEW_UNTIL_MARKER))?;
    let caps = four_digit_year()
        .captures(seg)
        .or_else(|| two_digit_year().captures(seg))?;
    Some(format!("{} {}", &caps[1], &caps[2]))
}

// klist renders local wall-clock; it must not be converted to UTC because the
// renewal comparison runs against the same local clock.
pub fn parse_expiration(stamp: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stamp, "%m/%d/%Y %T")
        .or_else(|_| NaiveDateTime::parse_from_str(stamp, "%m/%d/%y %T"))
        .ok()
}

fn to_local(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

fn four_digit_year() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new("([0-9]{2}/[0-9]{2}/[0-9]{4})[ ]+([0-9]{2}:[0-9]{2}:[0-9]{2})")
            .expect("invalid date regex")
    })
}

fn two_digit_year() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new("([0-9]{2}/[0-9]{2}/[0-9]{2})[ ]+([0-9]{2}:[0-9]{2}:[0-9]{2})")
            .expect("invalid date regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const KLIST_OUTPUT: &str = "\
Ticket cache: FILE:/var/credentials_fetcher/krb_dir/lease-001/krb5_cc
Default principal: webapp01$@CONTOSO.COM

Valid starting       Expires              Service principal
12/04/2024 19:39:06  12/05/2024 05:39:06  krbtgt/CONTOSO.COM@CONTOSO.COM
\trenew until 12/11/2024 19:39:04
";

    #[test]
    fn renew_until_is_extracted() {
        assert_eq!(
            get_ticket_expiration(KLIST_OUTPUT).as_deref(),
            Some("12/11/2024 19:39:04")
        );
    }

    #[test]
    fn expiration_round_trip_four_digit_year() {
        let (date, time) = ("12/04/2024", "19:39:06");
        let rendered = format!("\trenew until {date} {time}\n");
        assert_eq!(
            get_ticket_expiration(&rendered),
            Some(format!("{date} {time}"))
        );
    }

    #[test]
    fn expiration_round_trip_two_digit_year() {
        let (date, time) = ("12/04/24", "21:58:51");
        let rendered = format!("\trenew until {date} {time}\n");
        assert_eq!(
            get_ticket_expiration(&rendered),
            Some(format!("{date} {time}"))
        );
    }

    #[test]
    fn unparseable_output_is_skipped() {
        assert_eq!(get_ticket_expiration("no tickets in cache"), None);
        assert_eq!(get_ticket_expiration("renew until someday soon"), None);
    }

    #[test]
    fn both_year_formats_parse_to_the_same_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 12, 4)
            .unwrap()
            .and_hms_opt(19, 39, 6)
            .unwrap();
        assert_eq!(parse_expiration("12/04/2024 19:39:06"), Some(expected));
        assert_eq!(parse_expiration("12/04/24 19:39:06"), Some(expected));
        assert_eq!(parse_expiration("12-04-2024 19:39:06"), None);
    }

    #[test]
    fn threshold_decision() {
        let renew = to_local(parse_expiration("12/04/2024 19:39:06").unwrap()).unwrap();
        let inside = to_local(parse_expiration("12/04/2024 18:50:00").unwrap()).unwrap();
        let outside = to_local(parse_expiration("12/04/2024 17:00:00").unwrap()).unwrap();
        assert!(within_renewal_window(renew, inside, 1));
        assert!(!within_renewal_window(renew, outside, 1));
    }

    #[tokio::test]
    async fn cache_paths_outside_the_lease_are_refused() {
        let blob = {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            let raw = STANDARD.encode(vec![0u8; 272]);
            crate::gmsa::test_blob(&raw)
        };
        let lease_dir = Path::new("/var/credentials_fetcher/krb_dir/lease-001");

        let err = materialize(&blob, "webapp01$@CONTOSO.COM", Path::new("krb5_cc"), lease_dir)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CachePath { .. }));

        let err = materialize(
            &blob,
            "webapp01$@CONTOSO.COM",
            Path::new("/etc/krb5_cc"),
            lease_dir,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CachePath { .. }));
    }
}
