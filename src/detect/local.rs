// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Local inference: one external command invocation per frame.
//!
//! The command template gets `{filename}` substituted and must print the
//! detections as JSON on stdout (a bare array or a full report object).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use base::{err, Error};
use tokio::process::Command;
use tracing::debug;

use crate::config::LocalDetectorConfig;
use crate::json::Detection;

pub(super) struct LocalDetector {
    cmd_template: String,
    timeout: std::time::Duration,
}

impl LocalDetector {
    pub(super) fn new(cfg: &LocalDetectorConfig) -> Result<Self, Error> {
        if !cfg.cmd.contains("{filename}") {
            return Err(err!(
                InvalidArgument,
                msg("object_detector_local.cmd must reference {{filename}}")
            ));
        }
        Ok(LocalDetector {
            cmd_template: cfg.cmd.clone(),
            timeout: cfg.timeout,
        })
    }
}

#[async_trait]
impl super::ObjectDetector for LocalDetector {
    async fn detect(&self, frame: &Path) -> Result<Vec<Detection>, Error> {
        let argv = super::inference_command(&self.cmd_template, frame)?;
        debug!(cmd = ?argv, "running inference command");
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| err!(DeadlineExceeded, msg("inference command timed out")))?
            .map_err(|e| err!(Unavailable, msg("can't run {}", argv[0]), source(e)))?;
        if !output.status.success() {
            return Err(err!(
                Internal,
                msg(
                    "inference command failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )
            ));
        }
        super::parse_detections(&output.stdout)
    }

    fn variant(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::super::ObjectDetector;
    use super::*;
    use std::time::Duration;

    fn cfg(cmd: &str) -> LocalDetectorConfig {
        LocalDetectorConfig {
            cmd: cmd.to_owned(),
            timeout: Duration::from_secs(5),
            min_score: 30.0,
            sleep_time: Duration::from_millis(250),
        }
    }

    #[test]
    fn rejects_template_without_filename() {
        assert!(LocalDetector::new(&cfg("detect --all")).is_err());
        assert!(LocalDetector::new(&cfg("detect {filename}")).is_ok());
    }

    #[tokio::test]
    async fn runs_command_and_parses_stdout() {
        // `cat` stands in for an inference tool: the "frame" file holds the
        // JSON the tool would print, which also exercises the {filename}
        // substitution.
        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("cam0_1_1.obj.start");
        std::fs::write(&frame, br#"[{"class":"person","score":0.9,"box":[1,2,3,4]}]"#).unwrap();
        let d = LocalDetector::new(&cfg("cat {filename}")).unwrap();
        let objs = d.detect(&frame).await.unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].class, "person");
    }

    #[tokio::test]
    async fn command_failure_is_an_error() {
        let d = LocalDetector::new(&cfg("false {filename}")).unwrap();
        assert!(d.detect(Path::new("/nonexistent.jpg")).await.is_err());
    }
}
