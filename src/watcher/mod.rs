// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-camera watcher pipeline.
//!
//! A single outer loop claims sampled frames from the spool in age order and
//! runs motion detection (stateful, so strictly sequential). Each motion
//! frame then gets its own task for the object-detector rendezvous, memory
//! de-duplication and action dispatch; those tasks overlap freely and may
//! complete out of order.

pub mod memory;
pub mod motion;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use base::clock::{RealClocks, TimerGuard};
use base::signal::{AnyChange, Receiver};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::actions::ActionDispatcher;
use crate::config::Config;
use crate::json::DetectionReport;
use crate::spool::{self, FrameName, Tag};
use crate::storage;
use crate::supervisor::Camera;

use self::memory::DetectionMemory;
use self::motion::{MotionDetector, MotionVerdict};

/// Sleep between spool scans when no frame is waiting.
const SCAN_SLEEP: Duration = Duration::from_secs(1);

/// `round(no_object_streak / object_throttling)`; positive values mean
/// degraded mode where most frames are dropped before analysis.
fn throttle_divisor(no_object: u32, object_throttling: u32) -> u64 {
    (f64::from(no_object) / f64::from(object_throttling.max(1))).round() as u64
}

/// With divisor `t`, iteration `i` is dropped pre-emptively unless it lands
/// on the divisor grid.
fn should_drop(i: u64, t: u64) -> bool {
    t > 0 && i % t != 0
}

fn append_log(path: &str, label: &str, data: &str) {
    let r = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{label}\t{data}"));
    if let Err(e) = r {
        warn!(path, err = %e, "can't append sidecar log");
    }
}

/// Everything a per-frame rendezvous task needs.
struct FrameCtx {
    cam: Arc<Camera>,
    spool_dir: PathBuf,
    watch_delay: Duration,
    timeout: Duration,
    memory: Arc<Mutex<DetectionMemory<RealClocks>>>,
    dispatcher: Arc<ActionDispatcher>,
    shutdown: Receiver,
    latest_video: String,
}

pub struct Watcher {
    cam: Arc<Camera>,
    daemon: Arc<Config>,
    shutdown: Receiver,
}

impl Watcher {
    pub fn new(cam: Arc<Camera>, daemon: Arc<Config>, shutdown: Receiver) -> Self {
        Watcher {
            cam,
            daemon,
            shutdown,
        }
    }

    pub async fn run(self) {
        let cfg = self.cam.cfg.clone();
        let clocks = RealClocks {};
        let spool_dir = self.daemon.temp_storage_path.clone();
        let timeout = self.daemon.object_detector_timeout();
        let mut detector = MotionDetector::new(cfg.motion.clone());
        let memory = Arc::new(Mutex::new(DetectionMemory::new(
            cfg.memory.clone(),
            clocks,
        )));
        let dispatcher = Arc::new(ActionDispatcher::new(cfg.clone()));
        let mut any = AnyChange::new(self.shutdown.clone(), &[&self.cam.watch]);
        let mut tasks = JoinSet::new();
        let rec_glob = spool::camera_glob(&spool_dir, &cfg.name, Tag::Rec);
        let counters = self.cam.counters.clone();
        let mut shutdown = self.shutdown.clone();
        let mut i: u64 = 0;
        let mut last_reap = Instant::now();

        info!("watcher started");
        while self.shutdown.check().is_ok() {
            if !self.cam.watch.is_set() {
                any.wait(cfg.idle_sleep).await;
                continue;
            }
            let floor = SystemTime::now()
                .checked_sub(timeout)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            // Sweep leftovers (earlier crashes, missed cleanups) even while
            // the queue stays busy, so nothing outlives the detector timeout
            // by more than one period.
            if last_reap.elapsed() >= timeout {
                reap_stale(&spool_dir, &cfg.name, floor);
                last_reap = Instant::now();
            }
            let Some(path) = storage::first_file(&rec_glob, Some(floor)) else {
                reap_stale(&spool_dir, &cfg.name, floor);
                last_reap = Instant::now();
                tokio::select! {
                    _ = tokio::time::sleep(SCAN_SLEEP) => {}
                    _ = shutdown.recv() => break,
                }
                continue;
            };
            i += 1;
            let t = throttle_divisor(
                counters.no_object.load(Ordering::Relaxed),
                cfg.motion.object_throttling,
            );
            if should_drop(i, t) {
                debug!(divisor = t, "object-detection throttling, dropping frame");
                let _ = fs::remove_file(&path);
                continue;
            }
            counters.frames_analyzed.fetch_add(1, Ordering::Relaxed);

            let wch = match spool::retag(&path, Tag::Wch) {
                Ok(Some(p)) => p,
                Ok(None) => continue, // another stage won the race
                Err(e) => {
                    // Unclaimable files would be rediscovered forever.
                    warn!(err = %e.chain(), "can't claim frame, discarding");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            let verdict = {
                let _t = TimerGuard::new(&clocks, || format!("motion detect {}", wch.display()));
                detector.detect(&wch)
            };
            let verdict = match verdict {
                Ok(v) => v,
                Err(e) => {
                    warn!(frame = %wch.display(), err = %e.chain(), "frame unreadable, dropping");
                    let _ = fs::remove_file(&wch);
                    continue;
                }
            };
            if verdict != MotionVerdict::Motion {
                let _ = fs::remove_file(&wch);
                continue;
            }
            counters.motion_frames.fetch_add(1, Ordering::Relaxed);
            let latest_video = counters.latest_video.lock().unwrap().clone();
            let name = match wch
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(FrameName::parse)
            {
                Some((name, _)) => name,
                None => {
                    let _ = fs::remove_file(&wch);
                    continue;
                }
            };
            if !latest_video.is_empty() {
                append_log(&format!("{latest_video}.motion.log"), &name.label, "");
            }
            if !self.daemon.is_object_detection() {
                let _ = fs::remove_file(&wch);
                continue;
            }
            match spool::retag(&wch, Tag::ObjWait) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    warn!(err = %e.chain(), "can't hand frame to detector");
                    continue;
                }
            }
            let ctx = FrameCtx {
                cam: self.cam.clone(),
                spool_dir: spool_dir.clone(),
                watch_delay: cfg.motion.object_watch_delay,
                timeout,
                memory: memory.clone(),
                dispatcher: dispatcher.clone(),
                shutdown: self.shutdown.clone(),
                latest_video,
            };
            tasks.spawn(rendezvous(ctx, name));
            // Reap whatever already finished so the set stays small.
            while tasks.try_join_next().is_some() {}
        }

        // Let in-flight frames drain under a bounded grace period.
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("frame tasks did not drain in time, aborting");
            tasks.abort_all();
        }
        info!("watcher shut down");
    }
}

/// Deletes this camera's spool leftovers older than the detector timeout;
/// keeps a wedged pipeline from pinning tmpfs memory.
fn reap_stale(dir: &std::path::Path, camera: &str, floor: SystemTime) {
    let mut patterns: Vec<String> = spool::ALL_TAGS
        .iter()
        .map(|t| spool::camera_glob(dir, camera, *t))
        .collect();
    patterns.push(format!(
        "{}/{}_*{}",
        dir.display(),
        camera,
        spool::INFO_SUFFIX
    ));
    for pattern in patterns {
        for path in storage::list_files(&pattern) {
            let stale = fs::metadata(&path)
                .and_then(|md| md.modified())
                .map(|m| m < floor)
                .unwrap_or(false);
            if stale {
                debug!(path = %path.display(), "reaping stale spool file");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Polls for the detector's outcome for one frame, then finishes the frame:
/// memory, actions, cleanup.
async fn rendezvous(ctx: FrameCtx, name: FrameName) {
    let counters = &ctx.cam.counters;
    let dir = &ctx.spool_dir;
    let none_path = name.path(dir, Tag::ObjNone);
    let found_path = name.path(dir, Tag::ObjFound);
    let info_path = name.info_path(dir);
    let deadline = Instant::now() + ctx.timeout;
    let mut shutdown = ctx.shutdown.clone();
    loop {
        if none_path.exists() {
            counters.no_object.fetch_add(1, Ordering::Relaxed);
            let _ = fs::remove_file(&none_path);
            return;
        }
        if found_path.exists() {
            let report = fs::read(&info_path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_slice::<DetectionReport>(&raw).map_err(|e| e.to_string())
                });
            let mut report = match report {
                Ok(r) => r,
                Err(e) => {
                    warn!(frame = %name.stem(), err = %e, "unusable detection report");
                    spool::remove_family(dir, &name);
                    return;
                }
            };
            report.filename = Some(found_path.clone());
            counters.obj_frames.fetch_add(1, Ordering::Relaxed);
            if !ctx.latest_video.is_empty() {
                let line = serde_json::to_string(&report).unwrap_or_default();
                append_log(&format!("{}.object.log", ctx.latest_video), &name.label, &line);
            }
            let eligible = ctx.memory.lock().await.add(&mut report);
            if eligible {
                counters.no_object.store(0, Ordering::Relaxed);
                ctx.dispatcher.run(&found_path, &report, &ctx.memory).await;
            } else {
                counters.in_memory.fetch_add(1, Ordering::Relaxed);
            }
            spool::remove_family(dir, &name);
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                frame = %name.stem(),
                timeout = ?ctx.timeout,
                "object detector timed out"
            );
            counters.no_object.fetch_add(1, Ordering::Relaxed);
            spool::remove_family(dir, &name);
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(ctx.watch_delay) => {}
            _ = shutdown.recv() => {
                spool::remove_family(dir, &name);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ConfigFile};
    use crate::json::{BBox, Detection};
    use crate::supervisor::Camera;

    #[test]
    fn throttling_grid() {
        // S2: a 30-frame no-object streak with object_throttling=10 gives a
        // divisor of 3 and drops two of every three frames.
        assert_eq!(throttle_divisor(30, 10), 3);
        let dropped = (1..=9u64).filter(|i| should_drop(*i, 3)).count();
        assert_eq!(dropped, 6);

        // No streak, no pre-emptive drops.
        assert_eq!(throttle_divisor(0, 10), 0);
        assert!((1..=100u64).all(|i| !should_drop(i, 0)));

        // round(), not floor: a streak of 5 with throttling 10 already drops.
        assert_eq!(throttle_divisor(5, 10), 1);
        assert_eq!(throttle_divisor(4, 10), 0);
    }

    fn test_setup(dir: &std::path::Path) -> (Arc<Camera>, FrameCtx, base::signal::Sender) {
        let storage = dir.join("storage");
        let yaml = format!(
            r#"
recorders:
  cam0:
    ip: 10.0.0.1
    stream_url: rtsp://x/
    storage_path: "{}"
    actions:
      log1:
        type: log
        score: 0
"#,
            storage.display()
        );
        let file: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        let cfg = resolve(file).unwrap().cameras[0].clone();
        let cam = Camera::new(cfg.clone());
        let (tx, rx) = base::signal::channel();
        let ctx = FrameCtx {
            cam: cam.clone(),
            spool_dir: dir.to_owned(),
            watch_delay: Duration::from_millis(20),
            timeout: Duration::from_millis(400),
            memory: Arc::new(Mutex::new(DetectionMemory::new(
                cfg.memory.clone(),
                RealClocks {},
            ))),
            dispatcher: Arc::new(ActionDispatcher::new(cfg)),
            shutdown: rx,
            latest_video: String::new(),
        };
        (cam, ctx, tx)
    }

    fn report_json() -> String {
        serde_json::to_string(&DetectionReport::ok(vec![Detection {
            class: "person".to_owned(),
            score: 0.91,
            bbox: BBox([10, 20, 110, 220]),
            in_memory: false,
            cluster: None,
        }]))
        .unwrap()
    }

    #[tokio::test]
    async fn rendezvous_found_dispatches_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let (cam, ctx, _keep) = test_setup(dir.path());
        let name = FrameName::new("cam0", 1);
        fs::write(name.path(dir.path(), Tag::ObjWait), b"img").unwrap();
        cam.counters.no_object.store(5, Ordering::Relaxed);

        // Simulated detector: claims, then emits the outcome.
        let dir2 = dir.path().to_owned();
        let name2 = name.clone();
        let detector = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let wait = name2.path(&dir2, Tag::ObjWait);
            let start = spool::retag(&wait, Tag::ObjStart).unwrap().unwrap();
            fs::write(name2.info_path(&dir2), report_json()).unwrap();
            spool::retag(&start, Tag::ObjFound).unwrap().unwrap();
        });

        rendezvous(ctx, name.clone()).await;
        detector.await.unwrap();

        assert_eq!(cam.counters.obj_frames.load(Ordering::Relaxed), 1);
        assert_eq!(cam.counters.no_object.load(Ordering::Relaxed), 0, "streak reset");
        // Actions ran: the log action appended one line.
        let log = fs::read_to_string(
            dir.path().join("storage").join("cam0_objects.log"),
        )
        .unwrap();
        assert_eq!(log.lines().count(), 1);
        // The whole family is gone from the spool.
        for tag in spool::ALL_TAGS {
            assert!(!name.path(dir.path(), tag).exists(), "{tag:?} left behind");
        }
        assert!(!name.info_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn rendezvous_none_counts_the_streak() {
        let dir = tempfile::tempdir().unwrap();
        let (cam, ctx, _keep) = test_setup(dir.path());
        let name = FrameName::new("cam0", 2);
        fs::write(name.path(dir.path(), Tag::ObjNone), b"").unwrap();

        rendezvous(ctx, name.clone()).await;
        assert_eq!(cam.counters.no_object.load(Ordering::Relaxed), 1);
        assert!(!name.path(dir.path(), Tag::ObjNone).exists());
    }

    #[tokio::test]
    async fn rendezvous_timeout_cleans_family() {
        let dir = tempfile::tempdir().unwrap();
        let (cam, ctx, _keep) = test_setup(dir.path());
        let name = FrameName::new("cam0", 3);
        fs::write(name.path(dir.path(), Tag::ObjWait), b"img").unwrap();

        rendezvous(ctx, name.clone()).await;
        assert_eq!(cam.counters.no_object.load(Ordering::Relaxed), 1);
        assert!(!name.path(dir.path(), Tag::ObjWait).exists());
        assert_eq!(cam.counters.obj_frames.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn rendezvous_malformed_info_cleans_without_actions() {
        let dir = tempfile::tempdir().unwrap();
        let (cam, ctx, _keep) = test_setup(dir.path());
        let name = FrameName::new("cam0", 4);
        fs::write(name.path(dir.path(), Tag::ObjFound), b"img").unwrap();
        fs::write(name.info_path(dir.path()), b"not json").unwrap();

        rendezvous(ctx, name.clone()).await;
        assert!(!name.path(dir.path(), Tag::ObjFound).exists());
        assert!(!name.info_path(dir.path()).exists());
        assert!(!dir.path().join("storage").join("cam0_objects.log").exists());
        assert_eq!(cam.counters.obj_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reap_stale_spares_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let name = FrameName::new("cam0", 5);
        let stale = name.path(dir.path(), Tag::Wch);
        fs::write(&stale, b"x").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(old)
            .unwrap();
        let fresh = FrameName::new("cam0", 6).path(dir.path(), Tag::Rec);
        fs::write(&fresh, b"y").unwrap();

        let floor = SystemTime::now() - Duration::from_secs(30);
        reap_stale(dir.path(), "cam0", floor);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
