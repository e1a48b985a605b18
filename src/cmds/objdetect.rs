// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the object-detector process.
//!
//! A single detector serves every camera through the shared frame spool, so
//! it runs as its own process: heavy inference never competes with the
//! recording daemon, and either side can be restarted independently.

use std::path::PathBuf;
use std::sync::Arc;

use base::{err, Error};
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::config;
use crate::detect::DetectorService;
use crate::storage;

/// Runs the object-detector process shared by all cameras.
#[derive(Bpaf, Debug)]
#[bpaf(command("objdetect"))]
pub struct Args {
    /// Path to the YAML configuration file.
    #[bpaf(short('c'), long, argument("PATH"), fallback(super::DEFAULT_CONFIG_PATH.into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Arc::new(config::load(&args.config)?);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| err!(Internal, msg("build runtime"), source(e)))?;
    let r = rt.block_on(async_run(config));
    rt.shutdown_background();
    r
}

async fn async_run(config: Arc<config::Config>) -> Result<i32, Error> {
    storage::force_create_dirs(&config.temp_storage_path)?;
    let (shutdown_tx, shutdown_rx) = base::signal::channel();
    let svc = DetectorService::new(config, shutdown_rx)?;

    tokio::pin! {
        let int = signal(SignalKind::interrupt())?;
        let term = signal(SignalKind::terminate())?;
        let run = svc.run();
    }
    let mut shutdown_tx = Some(shutdown_tx);
    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; finishing the current frame");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            info!("received SIGTERM; finishing the current frame");
            shutdown_tx.take();
        }
        _ = &mut run => return Ok(0),
    }
    run.await;
    Ok(0)
}
