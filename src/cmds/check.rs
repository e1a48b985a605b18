// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to load and validate the configuration file.

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;

use crate::config;

/// Loads and validates the configuration file, then exits.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the YAML configuration file.
    #[bpaf(short('c'), long, argument("PATH"), fallback(super::DEFAULT_CONFIG_PATH.into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = config::load(&args.config)?;
    println!(
        "ok: {} camera(s), spool at {}",
        cfg.cameras.len(),
        cfg.temp_storage_path.display()
    );
    for cam in &cfg.cameras {
        println!(
            "  {}: motion={} actions={} storage={} ({} max)",
            cam.name,
            cam.motion.enabled,
            cam.actions.len(),
            cam.storage_path()?.display(),
            base::strutil::encode_size(cam.storage_max_bytes),
        );
    }
    match &cfg.detector {
        None => println!("  object detection: disabled"),
        Some(d) => println!(
            "  object detection: enabled (timeout {:?}, min score {})",
            d.timeout(),
            d.min_score()
        ),
    }
    if cfg.mqtt.is_none() {
        println!("  mqtt: disabled");
    }
    if cfg.http.is_none() {
        println!("  http: disabled");
    }
    Ok(0)
}
