// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera lifecycle: drives the frame-producing child process through
//! its state machine, parses its status output, and publishes counters.
//!
//! The supervisor is long-lived: it sleeps and retries after failures rather
//! than exiting, and only a global shutdown stops it.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base::signal::{AnyChange, Flag, Receiver};
use nom::bytes::complete::{tag, take_until};
use nom::character::complete::char;
use nom::sequence::{delimited, pair, preceded};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Outgoing;
use crate::config::{split_command, CameraConfig};
use crate::json;
use crate::storage;

/// Extra time past `record_time` before a producer run is considered wedged.
const RUN_GRACE: Duration = Duration::from_secs(5);

/// How long a signaled producer gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Stopped,
    Inactive,
    Starting,
    Recording,
    Restarting,
    Error,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Inactive => "inactive",
            State::Starting => "starting",
            State::Recording => "recording",
            State::Restarting => "restarting",
            State::Error => "error",
        }
    }
}

/// Rolling per-camera counters. The watcher and supervisor update them; the
/// status task reads and (for the per-interval ones) resets them.
pub struct Counters {
    pub err_cnt: AtomicU32,
    pub frames_analyzed: AtomicU32,
    pub motion_frames: AtomicU32,
    pub obj_frames: AtomicU32,
    pub in_memory: AtomicU32,

    /// Consecutive motion frames with no detected object; drives pre-emptive
    /// frame drops. A streak, not a rolling counter: never reset on publish.
    pub no_object: AtomicU32,

    pub latest_video: Mutex<String>,
    pub latest_snapshot: Mutex<String>,
    pub motion_throttling: Mutex<String>,
    state: Mutex<State>,
}

impl Counters {
    fn new() -> Self {
        Counters {
            err_cnt: AtomicU32::new(0),
            frames_analyzed: AtomicU32::new(0),
            motion_frames: AtomicU32::new(0),
            obj_frames: AtomicU32::new(0),
            in_memory: AtomicU32::new(0),
            no_object: AtomicU32::new(0),
            latest_video: Mutex::new(String::new()),
            latest_snapshot: Mutex::new(String::new()),
            motion_throttling: Mutex::new(String::new()),
            state: Mutex::new(State::Stopped),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: State) {
        let mut l = self.state.lock().unwrap();
        if *l != s {
            debug!(from = l.as_str(), to = s.as_str(), "state transition");
            *l = s;
        }
    }
}

/// One camera's shared handle: descriptor, enable flags, counters.
pub struct Camera {
    pub cfg: Arc<CameraConfig>,
    pub record: Flag,
    pub watch: Flag,
    pub counters: Arc<Counters>,
}

impl Camera {
    pub fn new(cfg: Arc<CameraConfig>) -> Arc<Camera> {
        Arc::new(Camera {
            cfg,
            record: Flag::new(false),
            watch: Flag::new(false),
            counters: Arc::new(Counters::new()),
        })
    }
}

pub type Registry = Arc<BTreeMap<String, Arc<Camera>>>;

/// Builds the bus status payload. With `reset`, the per-interval counters are
/// zeroed as they are read; the error count and the no-object streak persist.
pub fn status_snapshot(cam: &Camera, reset: bool) -> json::Status {
    let c = &cam.counters;
    let read = |a: &AtomicU32| {
        if reset {
            a.swap(0, Ordering::Relaxed)
        } else {
            a.load(Ordering::Relaxed)
        }
    };
    let no_object = c.no_object.load(Ordering::Relaxed);
    let divisor = cam.cfg.motion.object_throttling.max(1);
    json::Status {
        name: cam.cfg.name.clone(),
        status: c.state().as_str().to_owned(),
        error_cnt: c.err_cnt.load(Ordering::Relaxed),
        latest_file: c.latest_video.lock().unwrap().clone(),
        snapshot: c.latest_snapshot.lock().unwrap().clone(),
        record: cam.record.is_set(),
        watcher: cam.watch.is_set(),
        motion_throttling: c.motion_throttling.lock().unwrap().clone(),
        cnt_frame_analyzed: read(&c.frames_analyzed),
        cnt_motion_frame: read(&c.motion_frames),
        object_throttling: no_object.div_ceil(divisor),
        cnt_obj_frame: read(&c.obj_frames),
        cnt_in_memory: read(&c.in_memory),
    }
}

/// Emits the camera's status event every `send_status_interval`.
pub async fn run_status_task(cam: Arc<Camera>, tx: mpsc::Sender<Outgoing>, mut shutdown: Receiver) {
    let mut interval = tokio::time::interval(cam.cfg.send_status_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let status = status_snapshot(&cam, true);
                let payload = match serde_json::to_string(&status) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(err = %e, "can't encode status");
                        continue;
                    }
                };
                if tx.send(Outgoing { source: cam.cfg.name.clone(), payload }).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A signal line recognized on the producer's stdout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProducerSignal {
    StartRecord(String),
    Snapshot(String),
    Throttling(String),
}

fn after_marker<'a>(line: &'a str, marker: &str, open: char, close: char) -> Option<&'a str> {
    let mut close_buf = [0u8; 4];
    let close_str: &str = close.encode_utf8(&mut close_buf);
    let r: nom::IResult<&str, &str> = preceded(
        pair(take_until(marker), tag(marker)),
        delimited(char(open), take_until(close_str), char(close)),
    )(line);
    r.ok().map(|(_, inner)| inner)
}

/// Matches the three signal shapes the producer emits, ignoring everything
/// else.
pub fn parse_producer_line(line: &str) -> Option<ProducerSignal> {
    if let Some(f) = after_marker(line, "Start record filename: ", '<', '>') {
        return Some(ProducerSignal::StartRecord(f.to_owned()));
    }
    if let Some(f) = after_marker(line, "Snapshot filename: ", '<', '>') {
        return Some(ProducerSignal::Snapshot(f.to_owned()));
    }
    if line.contains("for recorder") {
        if let Some(level) = after_marker(line, " frame throttling ", '(', ')') {
            return Some(ProducerSignal::Throttling(level.trim().to_owned()));
        }
    }
    None
}

/// Best-effort ICMP reachability probe. Advisory only: a success says nothing
/// about stream health, and an unrunnable `ping` reports reachable.
pub async fn probe_reachable(ip: &str) -> bool {
    let status = Command::new("ping")
        .args(["-c", "1", "-W", "2"])
        .arg(ip)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) => s.success(),
        Err(e) => {
            debug!(err = %e, "can't run ping, assuming reachable");
            true
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ProducerMode {
    Record,
    /// Recording is off but watching is on: feed the spool anyway.
    Snapshot,
}

enum RunOutcome {
    /// Producer exited on its own after `duration`.
    Exited(Duration),
    /// Stopped on command (record/watch cleared) or shutdown.
    Stopped,
    /// Never spawned (bad command, storage failure, ..).
    SpawnFailed,
}

pub struct Supervisor {
    cam: Arc<Camera>,
    shutdown: Receiver,
}

impl Supervisor {
    pub fn new(cam: Arc<Camera>, shutdown: Receiver) -> Self {
        Supervisor { cam, shutdown }
    }

    pub async fn run(mut self) {
        let cfg = self.cam.cfg.clone();
        if cfg.record_autostart {
            self.cam.record.set();
        }
        if cfg.motion.enabled {
            self.cam.watch.set();
        }
        let mut any = AnyChange::new(self.shutdown.clone(), &[&self.cam.record, &self.cam.watch]);
        info!("supervisor started");
        while self.shutdown.check().is_ok() {
            if !probe_reachable(&cfg.ip).await {
                self.cam.counters.set_state(State::Inactive);
                debug!(interval = ?cfg.camera_ping_interval, "camera unreachable, will re-probe");
                any.wait(cfg.camera_ping_interval).await;
                continue;
            }
            if self.cam.record.is_set() {
                match self.run_producer(ProducerMode::Record).await {
                    RunOutcome::Exited(duration) => self.after_record_exit(duration, &mut any).await,
                    RunOutcome::Stopped => self.cam.counters.set_state(State::Stopped),
                    RunOutcome::SpawnFailed => {
                        self.cam.counters.set_state(State::Error);
                        any.wait(cfg.start_error_sleep).await;
                    }
                }
            } else if self.cam.watch.is_set() && cfg.cmd_take_snapshot.is_some() {
                self.run_producer(ProducerMode::Snapshot).await;
                any.wait(cfg.idle_sleep).await;
            } else {
                self.cam.counters.set_state(State::Stopped);
                any.wait(cfg.idle_sleep).await;
            }
        }
        self.cam.counters.set_state(State::Stopped);
        info!("supervisor shut down");
    }

    /// Fast exits count toward the error backoff; normal ones schedule a
    /// restart.
    async fn after_record_exit(&mut self, duration: Duration, any: &mut AnyChange) {
        let cfg = &self.cam.cfg;
        let counters = &self.cam.counters;
        if duration < cfg.start_error_threshold {
            let attempts = counters.err_cnt.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                ?duration,
                attempts, "producer exited too fast, probably failed to start"
            );
            if attempts % cfg.start_error_attempt_cnt == 0 {
                warn!(
                    attempts,
                    sleep = ?cfg.start_error_sleep,
                    "too many failed starts, backing off"
                );
                counters.set_state(State::Error);
                any.wait(cfg.start_error_sleep).await;
            }
        } else {
            counters.err_cnt.store(0, Ordering::Relaxed);
            debug!(?duration, "producer run finished");
            counters.set_state(State::Restarting);
        }
    }

    /// Creates the camera's storage tree and sweeps it back under quota, so
    /// every producer run starts with room to write.
    async fn prepare_storage(&self) -> Result<(), base::Error> {
        let cfg = &self.cam.cfg;
        let sm = storage::StorageManager::new(cfg.storage_path()?, cfg.storage_max_bytes)?;
        storage::force_create_parent(&cfg.snapshot_path()?)?;
        storage::force_create_parent(&cfg.video_path()?)?;
        let deleted = tokio::task::spawn_blocking(move || {
            sm.enforce_quota(&base::clock::RealClocks {})
        })
        .await
        .map_err(|e| base::err!(Internal, msg("quota sweep task"), source(e)))??;
        if deleted > 0 {
            info!(
                deleted = %base::strutil::encode_size(deleted),
                "storage swept back under quota"
            );
        }
        Ok(())
    }

    async fn run_producer(&mut self, mode: ProducerMode) -> RunOutcome {
        let cfg = self.cam.cfg.clone();
        let cmd = match mode {
            ProducerMode::Record => cfg.recorder_command(),
            ProducerMode::Snapshot => match cfg.snapshot_command() {
                Ok(Some(c)) => Ok(c),
                Ok(None) => return RunOutcome::SpawnFailed,
                Err(e) => Err(e),
            },
        };
        let cmd = match cmd {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e.chain(), "producer command unavailable");
                return RunOutcome::SpawnFailed;
            }
        };
        if let Err(e) = self.prepare_storage().await {
            warn!(err = %e.chain(), "can't prepare storage");
            return RunOutcome::SpawnFailed;
        }
        let argv = match split_command(&cmd) {
            Ok(a) => a,
            Err(e) => {
                warn!(err = %e.chain(), "bad producer command");
                return RunOutcome::SpawnFailed;
            }
        };
        if mode == ProducerMode::Record {
            self.cam.counters.set_state(State::Starting);
        }
        debug!(cmd = %cmd, "spawning producer");
        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(cmd = %argv[0], err = %e, "can't spawn producer");
                return match mode {
                    // Counts as an instant failed run so backoff applies.
                    ProducerMode::Record => RunOutcome::Exited(Duration::ZERO),
                    ProducerMode::Snapshot => RunOutcome::SpawnFailed,
                };
            }
        };
        let started = Instant::now();

        let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
        let mut stderr = BufReader::new(child.stderr.take().expect("stderr piped")).lines();
        let mut stdin = child.stdin.take();
        self.send_watch_byte(&mut stdin).await;

        let mut watch_rx = self.cam.watch.subscribe();
        let mut record_rx = self.cam.record.subscribe();
        let mut shutdown = self.shutdown.clone();
        let deadline = tokio::time::sleep(cfg.record_time + RUN_GRACE);
        tokio::pin!(deadline);

        // The select arms never touch `child` directly; arms that need to
        // signal it break out first, since `child.wait()` holds the exclusive
        // borrow while the select is live.
        enum LoopEnd {
            Exited,
            Stop,
            Overrun,
        }
        let end = loop {
            tokio::select! {
                res = child.wait() => {
                    match res {
                        Ok(status) => debug!(?status, "producer exited"),
                        Err(e) => warn!(err = %e, "producer wait failed"),
                    }
                    break LoopEnd::Exited;
                }
                line = stdout.next_line() => {
                    // Read failures on producer output are non-fatal; exit
                    // observation takes over.
                    if let Ok(Some(line)) = line {
                        self.handle_producer_line(line.trim(), mode);
                    }
                }
                line = stderr.next_line() => {
                    if let Ok(Some(line)) = line {
                        debug!(producer = %line.trim());
                    }
                }
                changed = watch_rx.changed() => {
                    if changed.is_ok() {
                        match mode {
                            ProducerMode::Record => self.send_watch_byte(&mut stdin).await,
                            ProducerMode::Snapshot => {
                                if !self.cam.watch.is_set() {
                                    break LoopEnd::Stop;
                                }
                            }
                        }
                    }
                }
                changed = record_rx.changed() => {
                    if changed.is_ok()
                        && mode == ProducerMode::Record
                        && !self.cam.record.is_set()
                    {
                        break LoopEnd::Stop;
                    }
                }
                _ = shutdown.recv() => break LoopEnd::Stop,
                _ = &mut deadline => {
                    debug!("producer exceeded run duration, reaping");
                    break LoopEnd::Overrun;
                }
            }
        };

        if !matches!(end, LoopEnd::Exited) {
            // Signal, give a bounded grace period, then terminate forcibly.
            interrupt(&child);
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("producer ignored interrupt, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        match end {
            LoopEnd::Stop => RunOutcome::Stopped,
            LoopEnd::Exited | LoopEnd::Overrun => RunOutcome::Exited(started.elapsed()),
        }
    }

    /// Tells the producer whether to sample frames for the watcher: a single
    /// `w` (on) or `e` (off) byte on its stdin.
    async fn send_watch_byte(&self, stdin: &mut Option<tokio::process::ChildStdin>) {
        if let Some(stdin) = stdin.as_mut() {
            let b: &[u8] = if self.cam.watch.is_set() { b"w" } else { b"e" };
            if stdin.write_all(b).await.is_err() || stdin.flush().await.is_err() {
                debug!("can't write watch byte to producer stdin");
            }
        }
    }

    fn handle_producer_line(&self, line: &str, mode: ProducerMode) {
        debug!(producer = %line);
        let Some(signal) = parse_producer_line(line) else {
            return;
        };
        let counters = &self.cam.counters;
        match signal {
            ProducerSignal::StartRecord(f) => *counters.latest_video.lock().unwrap() = f,
            ProducerSignal::Snapshot(f) => *counters.latest_snapshot.lock().unwrap() = f,
            ProducerSignal::Throttling(level) => {
                *counters.motion_throttling.lock().unwrap() = level
            }
        }
        if mode == ProducerMode::Record && counters.state() == State::Starting {
            counters.set_state(State::Recording);
        }
    }
}

/// Sends SIGINT to a live child; the producer contract is to exit on it.
fn interrupt(child: &Child) {
    if let Some(id) = child.id() {
        let pid = nix::unistd::Pid::from_raw(id as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT) {
            debug!(err = %e, "can't signal producer");
        }
    }
}
