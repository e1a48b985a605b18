// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the recording daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base::signal::Flag;
use base::{bail, err, Error};
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{self, Config};
use crate::supervisor::{self, Camera, Registry};
use crate::{bus, storage, watcher, web};

/// Exit status asking the service manager to restart the daemon.
pub const RESTART_EXIT_CODE: i32 = 2;

/// How long spawned tasks get to drain after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(45);

/// Runs the recording daemon: per-camera supervisors and watchers, the
/// message bus, and the HTTP dashboard.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the YAML configuration file.
    #[bpaf(short('c'), long, argument("PATH"), fallback(super::DEFAULT_CONFIG_PATH.into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Arc::new(config::load(&args.config)?);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder
        .build()
        .map_err(|e| err!(Internal, msg("build runtime"), source(e)))?;
    let r = rt.block_on(async_run(config));

    // tokio normally waits for all spawned tasks to complete, but:
    // * in the graceful shutdown path, we wait for specific tasks with logging.
    // * in the immediate shutdown path, we don't want to wait.
    rt.shutdown_background();

    r
}

async fn async_run(config: Arc<Config>) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::signal::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt())?;
        let term = signal(SignalKind::terminate())?;
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config: Arc<Config>, outer_shutdown: base::signal::Receiver) -> Result<i32, Error> {
    // The spool must exist before anything touches it; a missing mount is
    // fatal at start.
    storage::force_create_dirs(&config.temp_storage_path)?;
    if config.cameras.is_empty() {
        bail!(FailedPrecondition, msg("no recorders configured"));
    }
    info!(
        cameras = config.cameras.len(),
        spool = %config.temp_storage_path.display(),
        "configuration loaded"
    );

    // Tasks get their own shutdown channel so a bus-requested restart can
    // stop them without a process signal.
    let (task_tx, task_rx) = base::signal::channel();
    let restart = Flag::new(false);
    let (status_tx, status_rx) = mpsc::channel::<bus::Outgoing>(64);

    let registry: Registry = Arc::new(
        config
            .cameras
            .iter()
            .map(|cfg| (cfg.name.clone(), Camera::new(cfg.clone())))
            .collect(),
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(bus::run(
        config.clone(),
        registry.clone(),
        status_rx,
        restart.clone(),
        task_rx.clone(),
    ));
    if let Some(http) = &config.http {
        let registry = registry.clone();
        let rx = task_rx.clone();
        let http = crate::config::HttpConfig {
            host: http.host.clone(),
            port: http.port,
        };
        tasks.spawn(async move {
            if let Err(e) = web::serve(&http, registry, rx).await {
                error!(err = %e.chain(), "dashboard failed");
            }
        });
    }

    for cam in registry.values() {
        let name = cam.cfg.name.clone();
        let sup = supervisor::Supervisor::new(cam.clone(), task_rx.clone());
        tasks.spawn(sup.run().instrument(info_span!("supervisor", camera = %name)));
        let wat = watcher::Watcher::new(cam.clone(), config.clone(), task_rx.clone());
        tasks.spawn(wat.run().instrument(info_span!("watcher", camera = %name)));
        tasks.spawn(
            supervisor::run_status_task(cam.clone(), status_tx.clone(), task_rx.clone())
                .instrument(info_span!("status", camera = %name)),
        );
    }
    drop(status_tx);
    drop(task_rx);
    info!("all camera tasks started");

    let mut outer_shutdown = outer_shutdown;
    let mut restart_rx = restart.subscribe();
    let code = tokio::select! {
        _ = outer_shutdown.recv() => 0,
        changed = restart_rx.changed() => {
            if changed.is_ok() && restart.is_set() {
                info!("restart requested, draining");
                RESTART_EXIT_CODE
            } else {
                0
            }
        }
    };

    drop(task_tx);
    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(err = %e, "task panicked during drain");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("tasks did not drain in time");
        tasks.abort_all();
    }
    info!("exiting");
    Ok(code)
}
