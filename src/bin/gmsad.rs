/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use argh::FromArgs;
use gmsad::{Engine, Scheduler};
use std::{process::ExitCode, sync::Arc};
use tokio::{runtime, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const NUM_WORKERS: usize = 4;

#[derive(FromArgs)]
/// gMSA credential lifecycle daemon.
struct Arguments {
    /// number of worker threads
    #[argh(option, short = 'w', default = "NUM_WORKERS")]
    workers: usize,
    /// kerberos directory holding the lease store
    #[argh(option, short = 'd')]
    krb_dir: Option<String>,
    /// enable ECS agent integration
    #[argh(switch)]
    ecs: bool,
}

async fn run(args: Arguments) -> Result<(), gmsad::Error> {
    gmsad::set_ecs_mode(args.ecs);
    gmsad::load_config();
    gmsad::verify_environment()?;

    let krb_dir = args
        .krb_dir
        .unwrap_or_else(|| gmsad::config().krb_dir.clone());
    let engine = Arc::new(Engine::new(krb_dir));
    let scheduler = Scheduler::new(engine);

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(scheduler.run(shutdown.clone()));

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("could not install SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    tracing::info!("shutdown requested");
    shutdown.cancel();
    worker.await.ok();
    Ok(())
}

fn setup_log() {
    let layer = if std::env::var("RUST_LOG_STYLE").is_ok_and(|v| v == "SYSTEMD") {
        fmt::layer().without_time().compact().boxed()
    } else {
        fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> ExitCode {
    setup_log();

    let main_args: Arguments = argh::from_env();

    let result = runtime::Builder::new_multi_thread()
        .worker_threads(main_args.workers)
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(main_args));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{}", snafu::Report::from_error(err));
            ExitCode::from(code)
        }
    }
}
