/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use snafu::prelude::*;
use std::{ffi::OsStr, io, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command, time};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to spawn `{tool}`"))]
    Spawn { tool: String, source: io::Error },
    #[snafu(display("Failed to write to stdin of `{tool}`"))]
    Stdin { tool: String, source: io::Error },
    #[snafu(display("`{tool}` did not finish within {seconds}s"))]
    TimedOut { tool: String, seconds: u64 },
    #[snafu(display("Failed to collect output of `{tool}`"))]
    Collect { tool: String, source: io::Error },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
    }
}

pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// Run an external tool argv-wise, feed it `stdin`, and collect its output
// under a deadline. The child is killed if the deadline passes or the
// supervising task is dropped.
pub async fn run(
    tool: &str,
    args: &[&str],
    envs: &[(&str, &OsStr)],
    stdin: Option<&[u8]>,
    seconds: u64,
) -> Result<Output, Error> {
    let mut cmd = Command::new(tool);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (var, val) in envs {
        cmd.env(var, val);
    }

    let mut child = cmd.spawn().context(Spawn { tool })?;

    if let Some(bytes) = stdin {
        let mut pipe = child.stdin.take().expect("stdin was piped");
        pipe.write_all(bytes).await.context(Stdin { tool })?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let output = time::timeout(time::Duration::from_secs(seconds), child.wait_with_output())
        .await
        .ok()
        .context(TimedOut { tool, seconds })?
        .context(Collect { tool })?;

    Ok(Output {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
