// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The object-detector process: one consumer shared by every camera.
//!
//! It talks to the watchers exclusively through the spool's filename
//! protocol: claim `.obj.wait` frames by renaming to `.obj.start`, run
//! inference, and leave `.obj.none` or `.obj.found` + the report sidecar
//! behind. It never deletes frames; cleanup belongs to the watcher.

mod local;
mod remote;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base::clock::{Clocks, RealClocks, TimerGuard};
use base::signal::Receiver;
use base::{err, Error};
use tracing::{debug, info, warn};

use crate::config::{Config, DetectorConfig};
use crate::json::{Detection, DetectionReport};
use crate::spool::{self, FrameName, Tag};
use crate::storage;

/// Margin subtracted from the rendezvous timeout when picking up frames, so
/// the detector never races the watcher's timeout cleanup.
const PICKUP_MARGIN: Duration = Duration::from_secs(2);

/// The narrow inference capability; the service loop owns everything else.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    /// Runs inference on one frame file, returning raw detections (scores in
    /// `[0, 1]`, unfiltered).
    async fn detect(&self, frame: &Path) -> Result<Vec<Detection>, Error>;

    /// Human-readable variant name for logs.
    fn variant(&self) -> &'static str;
}

/// Builds the configured detector variant.
pub fn create(cfg: &DetectorConfig) -> Result<Arc<dyn ObjectDetector>, Error> {
    Ok(match cfg {
        DetectorConfig::Local(c) => Arc::new(local::LocalDetector::new(c)?),
        DetectorConfig::Cloud(c) => Arc::new(remote::RemoteDetector::new(c)?),
    })
}

pub struct DetectorService {
    daemon: Arc<Config>,
    detector: Arc<dyn ObjectDetector>,
    min_score: f64,
    timeout: Duration,
    sleep_time: Duration,
    shutdown: Receiver,
}

impl DetectorService {
    pub fn new(daemon: Arc<Config>, shutdown: Receiver) -> Result<Self, Error> {
        let (detector, min_score, timeout, sleep_time) = {
            let det_cfg = daemon
                .detector
                .as_ref()
                .ok_or_else(|| err!(FailedPrecondition, msg("no object detector configured")))?;
            (
                create(det_cfg)?,
                det_cfg.min_score(),
                det_cfg.timeout(),
                det_cfg.sleep_time(),
            )
        };
        Ok(DetectorService {
            daemon,
            detector,
            min_score,
            timeout,
            sleep_time,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(variant = self.detector.variant(), "object detector started");
        let pattern = spool::any_glob(&self.daemon.temp_storage_path, Tag::ObjWait);
        while self.shutdown.check().is_ok() {
            match self.run_once(&pattern).await {
                Ok(true) => {} // processed one; look again immediately
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.sleep_time) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
                Err(e) => {
                    warn!(err = %e.chain(), "detection pass failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.sleep_time) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
            }
        }
        info!("object detector shut down");
    }

    /// Claims and processes at most one waiting frame. Returns whether one
    /// was processed.
    pub async fn run_once(&self, pattern: &str) -> Result<bool, Error> {
        // Don't pick up candidates the watcher is about to reap.
        let floor = SystemTime::now()
            .checked_sub(self.timeout.saturating_sub(PICKUP_MARGIN))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let Some(wait_path) = storage::first_file(pattern, Some(floor)) else {
            return Ok(false);
        };
        let Some(start_path) = spool::retag(&wait_path, Tag::ObjStart)? else {
            // The watcher's timeout cleanup won; not an error.
            return Ok(false);
        };
        debug!(frame = %start_path.display(), "claimed frame");
        self.process(&start_path).await?;
        Ok(true)
    }

    async fn process(&self, start_path: &Path) -> Result<(), Error> {
        let clocks = RealClocks {};
        let begin = clocks.monotonic();
        let result = {
            let _t = TimerGuard::new(&clocks, || format!("inference on {}", start_path.display()));
            self.detector.detect(start_path).await
        };
        let elapsed = (clocks.monotonic() - begin).as_secs_f64();
        match result {
            Ok(all) => {
                let total = all.len();
                let objects: Vec<Detection> = all
                    .into_iter()
                    .filter(|d| d.score * 100.0 >= self.min_score)
                    .collect();
                if objects.is_empty() {
                    debug!(total, "no objects above min score");
                    spool::retag(start_path, Tag::ObjNone)?;
                } else {
                    info!(
                        found = objects.len(),
                        total, elapsed, "objects detected"
                    );
                    self.emit_found(start_path, objects, elapsed)?;
                }
            }
            Err(e) => {
                // Inference failure counts as no objects; the pipeline moves
                // on and the watcher's throttling reacts.
                warn!(frame = %start_path.display(), err = %e.chain(), "inference failed");
                spool::retag(start_path, Tag::ObjNone)?;
            }
        }
        Ok(())
    }

    /// Writes the report sidecar before renaming to `.obj.found`, so a
    /// watcher that sees the outcome tag always finds the report.
    fn emit_found(
        &self,
        start_path: &Path,
        objects: Vec<Detection>,
        elapsed: f64,
    ) -> Result<(), Error> {
        let name = start_path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(FrameName::parse)
            .map(|(n, _)| n)
            .ok_or_else(|| {
                err!(Internal, msg("claimed a non-spool path {}", start_path.display()))
            })?;
        let dir = start_path.parent().unwrap_or(Path::new("."));
        let mut report = DetectionReport::ok(objects);
        report.elapsed = Some(elapsed);
        report.filename = Some(name.path(dir, Tag::ObjFound));
        let raw = serde_json::to_vec(&report)
            .map_err(|e| err!(Internal, msg("encode report"), source(e)))?;
        let info_path = name.info_path(dir);
        fs::write(&info_path, raw)
            .map_err(|e| err!(Unknown, msg("write {}", info_path.display()), source(e)))?;
        spool::retag(start_path, Tag::ObjFound)?;
        Ok(())
    }
}

/// Expands a local inference command template for one frame.
fn inference_command(template: &str, frame: &Path) -> Result<Vec<String>, Error> {
    let frame = frame.to_string_lossy();
    let cmd = crate::config::expand(template, &[("filename", &frame)])?;
    crate::config::split_command(&cmd)
}

fn parse_detections(raw: &[u8]) -> Result<Vec<Detection>, Error> {
    // Accept either a bare array or a full report object.
    if let Ok(objects) = serde_json::from_slice::<Vec<Detection>>(raw) {
        return Ok(objects);
    }
    let report: DetectionReport = serde_json::from_slice(raw)
        .map_err(|e| err!(InvalidArgument, msg("unparseable detector output"), source(e)))?;
    if !report.is_ok() {
        return Err(err!(Internal, msg("detector reported {:?}", report.result)));
    }
    Ok(report.objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::BBox;

    struct StubDetector(Vec<Detection>);

    #[async_trait]
    impl ObjectDetector for StubDetector {
        async fn detect(&self, _frame: &Path) -> Result<Vec<Detection>, Error> {
            Ok(self.0.clone())
        }
        fn variant(&self) -> &'static str {
            "stub"
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl ObjectDetector for FailingDetector {
        async fn detect(&self, _frame: &Path) -> Result<Vec<Detection>, Error> {
            Err(err!(Internal, msg("model exploded")))
        }
        fn variant(&self) -> &'static str {
            "failing"
        }
    }

    fn det(class: &str, score: f64) -> Detection {
        Detection {
            class: class.to_owned(),
            score,
            bbox: BBox([10, 20, 110, 220]),
            in_memory: false,
            cluster: None,
        }
    }

    fn service(dir: &Path, detector: Arc<dyn ObjectDetector>) -> (DetectorService, base::signal::Sender) {
        let daemon = Arc::new(Config {
            mqtt: None,
            temp_storage_path: dir.to_owned(),
            detector: None,
            http: None,
            worker_threads: None,
            cameras: Vec::new(),
        });
        let (tx, rx) = base::signal::channel();
        (
            DetectorService {
                daemon,
                detector,
                min_score: 30.0,
                timeout: Duration::from_secs(30),
                sleep_time: Duration::from_millis(10),
                shutdown: rx,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn found_outcome_writes_info_before_tag() {
        let dir = tempfile::tempdir().unwrap();
        let name = FrameName::new("cam0", 1);
        fs::write(name.path(dir.path(), Tag::ObjWait), b"img").unwrap();

        let (svc, _tx) = service(
            dir.path(),
            Arc::new(StubDetector(vec![det("person", 0.91), det("dust", 0.1)])),
        );
        let pattern = spool::any_glob(dir.path(), Tag::ObjWait);
        assert!(svc.run_once(&pattern).await.unwrap());

        let found = name.path(dir.path(), Tag::ObjFound);
        assert!(found.exists());
        let report: DetectionReport =
            serde_json::from_slice(&fs::read(name.info_path(dir.path())).unwrap()).unwrap();
        assert!(report.is_ok());
        // The 10% detection fell below min_score=30.
        assert_eq!(report.objects.len(), 1);
        assert_eq!(report.objects[0].class, "person");
        assert!(report.elapsed.is_some());
        // Exactly one path for the frame remains (plus the sidecar).
        assert!(!name.path(dir.path(), Tag::ObjWait).exists());
        assert!(!name.path(dir.path(), Tag::ObjStart).exists());
    }

    #[tokio::test]
    async fn all_below_score_is_none_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let name = FrameName::new("cam0", 2);
        fs::write(name.path(dir.path(), Tag::ObjWait), b"img").unwrap();
        let (svc, _tx) = service(dir.path(), Arc::new(StubDetector(vec![det("dust", 0.05)])));
        let pattern = spool::any_glob(dir.path(), Tag::ObjWait);
        assert!(svc.run_once(&pattern).await.unwrap());
        assert!(name.path(dir.path(), Tag::ObjNone).exists());
        assert!(!name.info_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn inference_error_is_none_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let name = FrameName::new("cam0", 3);
        fs::write(name.path(dir.path(), Tag::ObjWait), b"img").unwrap();
        let (svc, _tx) = service(dir.path(), Arc::new(FailingDetector));
        let pattern = spool::any_glob(dir.path(), Tag::ObjWait);
        assert!(svc.run_once(&pattern).await.unwrap());
        assert!(name.path(dir.path(), Tag::ObjNone).exists());
    }

    #[tokio::test]
    async fn outdated_candidates_are_not_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let name = FrameName::new("cam0", 4);
        let wait = name.path(dir.path(), Tag::ObjWait);
        fs::write(&wait, b"img").unwrap();
        let old = SystemTime::now() - Duration::from_secs(120);
        fs::File::options()
            .write(true)
            .open(&wait)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let (svc, _tx) = service(dir.path(), Arc::new(StubDetector(vec![det("person", 0.9)])));
        let pattern = spool::any_glob(dir.path(), Tag::ObjWait);
        assert!(!svc.run_once(&pattern).await.unwrap());
        assert!(wait.exists(), "left for the watcher's cleanup");
    }

    #[test]
    fn detections_parse_both_shapes() {
        let arr = br#"[{"class":"car","score":0.8,"box":[1,2,3,4]}]"#;
        assert_eq!(parse_detections(arr).unwrap().len(), 1);
        let rep = br#"{"result":"ok","objects":[{"class":"car","score":0.8,"box":[1,2,3,4]}]}"#;
        assert_eq!(parse_detections(rep).unwrap().len(), 1);
        assert!(parse_detections(b"nonsense").is_err());
        let failed = br#"{"result":"model not loaded","objects":[]}"#;
        assert!(parse_detections(failed).is_err());
    }

    #[test]
    fn inference_command_substitutes_filename() {
        let argv =
            inference_command("detect --model m.onnx \"{filename}\"", Path::new("/spool/f.obj.start"))
                .unwrap();
        assert_eq!(argv, vec!["detect", "--model", "m.onnx", "/spool/f.obj.start"]);
    }
}
