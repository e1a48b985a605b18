// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Configuration file (`/etc/vigil.yaml`) loading and validation.
//!
//! The file is deserialized into raw sections, then resolved into immutable
//! descriptors: per-camera keys override `global` keys (per key, not per
//! section), defaults are applied, templates are checked, and anything
//! malformed is rejected at startup with the offending key named.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base::{bail, err, Error};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::actions::Action;
use crate::watcher::memory::MemoryConfig;
use crate::watcher::motion::{AreaBound, ContourConfig, MotionConfig};

macro_rules! pick {
    ($local:expr, $global:expr) => {
        $local.clone().or_else(|| $global.clone())
    };
}

/// Top-level raw configuration file object.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub mqtt: Option<MqttSection>,

    /// Memory-backed directory used as the frame spool. Expected to be a
    /// tmpfs mount; a missing, uncreatable directory is fatal at start.
    #[serde(default = "default_temp_storage_path")]
    pub temp_storage_path: PathBuf,

    #[serde(default)]
    pub object_detector_cloud: Option<CloudDetectorSection>,

    #[serde(default)]
    pub object_detector_local: Option<LocalDetectorSection>,

    #[serde(default)]
    pub http_server: Option<HttpSection>,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default)]
    pub global: RecorderSection,

    #[serde(default)]
    pub recorders: BTreeMap<String, RecorderSection>,
}

fn default_temp_storage_path() -> PathBuf {
    "/dev/shm/vigil".into()
}

#[derive(Clone, Debug, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_name")]
    pub name: String,
    #[serde(default = "default_mqtt_host")]
    pub server_host: String,
    #[serde(default = "default_mqtt_port")]
    pub server_port: u16,
    #[serde(default = "default_mqtt_keepalive")]
    pub server_keepalive: u64,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub pwd: Option<String>,
    #[serde(default = "default_topic_publish")]
    pub topic_publish: String,
    #[serde(default = "default_topic_subscribe")]
    pub topic_subscribe: String,
}

fn default_mqtt_name() -> String {
    "vigil".to_owned()
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_keepalive() -> u64 {
    60
}
fn default_topic_publish() -> String {
    "vigil/clients/{source_name}".to_owned()
}
fn default_topic_subscribe() -> String {
    "vigil/daemon/{source_name}".to_owned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct CloudDetectorSection {
    pub url: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_cloud_timeout")]
    pub timeout: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_detector_sleep")]
    pub sleep_time: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LocalDetectorSection {
    /// Inference command template; `{filename}` is substituted per frame.
    /// Must print a JSON array of detections on stdout.
    pub cmd: String,
    #[serde(default = "default_local_timeout")]
    pub timeout: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_detector_sleep")]
    pub sleep_time: f64,
}

fn default_cloud_timeout() -> f64 {
    300.0
}
fn default_local_timeout() -> f64 {
    30.0
}
fn default_min_score() -> f64 {
    30.0
}
fn default_detector_sleep() -> f64 {
    0.25
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "0.0.0.0".to_owned()
}
fn default_http_port() -> u16 {
    8282
}

/// One camera's raw keys; also the shape of the `global` section. Every key
/// is optional here so that resolution can layer local over global over
/// defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RecorderSection {
    pub ip: Option<String>,
    pub stream_url: Option<String>,
    pub record_autostart: Option<bool>,
    pub record_time: Option<f64>,
    pub recorder_sleep_time: Option<f64>,
    pub camera_ping_interval: Option<f64>,
    pub send_status_interval: Option<f64>,
    pub snapshot_time: Option<f64>,
    /// GB; eviction keeps the camera's storage tree under this.
    pub storage_max_size: Option<f64>,
    pub storage_path: Option<String>,
    pub filename_snapshot: Option<String>,
    pub filename_video: Option<String>,
    pub cmd_recorder_start: Option<String>,
    pub cmd_take_snapshot: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frame_channels: Option<u32>,
    pub start_error_atempt_cnt: Option<u32>,
    pub start_error_threshold: Option<f64>,
    pub start_error_sleep: Option<f64>,
    /// MB; producer-side spool thresholds, substituted into its command.
    pub throttling_min_mem_size: Option<u64>,
    pub throttling_max_mem_size: Option<u64>,
    pub motion_detector: Option<MotionSection>,
    pub memory: Option<MemorySection>,
    /// Ordered: an annotate action's output becomes the input of the actions
    /// after it.
    pub actions: Option<IndexMap<String, ActionSection>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MotionSection {
    pub enabled: Option<bool>,
    pub max_image_height: Option<u32>,
    pub max_image_width: Option<u32>,
    pub bg_frame_count: Option<usize>,
    pub threshold: Option<u8>,
    pub detect_by_diff_threshold: Option<f64>,
    pub min_frames_changes: Option<u32>,
    pub max_frames_static: Option<u32>,
    pub contour_detection: Option<ContourSection>,
    pub object_watch_delay: Option<f64>,
    pub object_throttling: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContourSection {
    pub min_area: Option<RawAreaBound>,
    pub max_area: Option<RawAreaBound>,
    pub max_count: Option<usize>,
}

/// An area bound: either absolute pixels or a percentage string like `"50%"`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RawAreaBound {
    Pixels(u64),
    Text(String),
}

impl RawAreaBound {
    fn resolve(&self, key: &str) -> Result<AreaBound, Error> {
        match self {
            RawAreaBound::Pixels(px) => Ok(AreaBound::Pixels(*px)),
            RawAreaBound::Text(s) => {
                let s = s.trim();
                if let Some(pct) = s.strip_suffix('%') {
                    let v: f64 = pct
                        .trim()
                        .parse()
                        .map_err(|_| err!(InvalidArgument, msg("{key}: bad percentage {s:?}")))?;
                    if !(0.0..=100.0).contains(&v) {
                        bail!(InvalidArgument, msg("{key}: percentage {v} out of range"));
                    }
                    Ok(AreaBound::Percent(v))
                } else {
                    let v: u64 = s
                        .parse()
                        .map_err(|_| err!(InvalidArgument, msg("{key}: bad area {s:?}")))?;
                    Ok(AreaBound::Pixels(v))
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MemorySection {
    /// Seconds; negative disables memory entirely.
    pub remember_time: Option<i64>,
    /// Pixels of center displacement below which two boxes match.
    pub move_threshold: Option<f64>,
    /// Percent of the new box's area that must be intersected to match.
    pub area_intersect: Option<f64>,
    /// Percent size similarity at or above which two boxes match.
    pub size_similarity: Option<f64>,
    pub objects: Option<StringList>,
    pub objects_exclude: Option<StringList>,
}

/// A list of class names, given either as a YAML list or a comma-separated
/// string.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    List(Vec<String>),
    Csv(String),
}

impl StringList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringList::List(v) => v,
            StringList::Csv(s) => s
                .split(',')
                .map(|p| p.trim().to_owned())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ActionSection {
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub objects: Option<StringList>,
    pub objects_exclude: Option<StringList>,
    /// Percent, 0..100.
    pub score: Option<f64>,
    /// Detection polygon vertices as `[x, y]`; fewer than 3 disables the gate.
    pub area: Option<Vec<[i64; 2]>>,
    pub use_memory: Option<bool>,
    pub file: Option<FileSection>,
    pub brush_size: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub font: Option<PathBuf>,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub subject: Option<String>,
    pub mail_from: Option<String>,
    pub mail_to: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileSection {
    pub source: Option<String>,
    pub target: Option<String>,
}

/// Resolved daemon-wide configuration.
#[derive(Debug)]
pub struct Config {
    pub mqtt: Option<MqttConfig>,
    pub temp_storage_path: PathBuf,
    pub detector: Option<DetectorConfig>,
    pub http: Option<HttpConfig>,
    pub worker_threads: Option<usize>,
    pub cameras: Vec<Arc<CameraConfig>>,
}

impl Config {
    pub fn is_object_detection(&self) -> bool {
        self.detector.is_some()
    }

    /// The rendezvous deadline: how long the watcher polls for a detector
    /// outcome, and the bound after which spool leftovers are reaped.
    pub fn object_detector_timeout(&self) -> Duration {
        self.detector
            .as_ref()
            .map(DetectorConfig::timeout)
            .unwrap_or(Duration::from_secs(30))
    }

    pub fn camera(&self, name: &str) -> Option<&Arc<CameraConfig>> {
        self.cameras.iter().find(|c| c.name == name)
    }
}

#[derive(Debug)]
pub struct MqttConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub login: Option<String>,
    pub password: Option<String>,
    pub topic_publish: String,
    pub topic_subscribe: String,
}

impl MqttConfig {
    pub fn publish_topic(&self, source: &str) -> Result<String, Error> {
        expand(&self.topic_publish, &[("source_name", source)])
    }

    pub fn subscribe_topic(&self, source: &str) -> Result<String, Error> {
        expand(&self.topic_subscribe, &[("source_name", source)])
    }
}

#[derive(Debug)]
pub enum DetectorConfig {
    Cloud(CloudDetectorConfig),
    Local(LocalDetectorConfig),
}

#[derive(Debug)]
pub struct CloudDetectorConfig {
    pub url: url::Url,
    pub key: Option<String>,
    pub timeout: Duration,
    pub min_score: f64,
    pub sleep_time: Duration,
}

#[derive(Debug)]
pub struct LocalDetectorConfig {
    pub cmd: String,
    pub timeout: Duration,
    pub min_score: f64,
    pub sleep_time: Duration,
}

impl DetectorConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            DetectorConfig::Cloud(c) => c.timeout,
            DetectorConfig::Local(c) => c.timeout,
        }
    }

    pub fn min_score(&self) -> f64 {
        match self {
            DetectorConfig::Cloud(c) => c.min_score,
            DetectorConfig::Local(c) => c.min_score,
        }
    }

    pub fn sleep_time(&self) -> Duration {
        match self {
            DetectorConfig::Cloud(c) => c.sleep_time,
            DetectorConfig::Local(c) => c.sleep_time,
        }
    }
}

#[derive(Debug)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

/// One camera's immutable descriptor. Created at startup, never mutated.
#[derive(Debug)]
pub struct CameraConfig {
    pub name: String,
    pub ip: String,
    pub stream_url: String,
    pub record_autostart: bool,
    pub record_time: Duration,
    pub idle_sleep: Duration,
    pub camera_ping_interval: Duration,
    pub send_status_interval: Duration,
    pub snapshot_time: Duration,
    pub storage_max_bytes: u64,
    storage_path_template: String,
    filename_snapshot_template: String,
    filename_video_template: String,
    pub cmd_recorder_start: Option<String>,
    pub cmd_take_snapshot: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frame_channels: Option<u32>,
    pub start_error_attempt_cnt: u32,
    pub start_error_threshold: Duration,
    pub start_error_sleep: Duration,
    pub throttling_min_mem_bytes: u64,
    pub throttling_max_mem_bytes: u64,
    pub motion: MotionConfig,
    pub memory: MemoryConfig,
    pub actions: Vec<(String, Action)>,
}

impl CameraConfig {
    fn resolve(
        name: &str,
        global: &RecorderSection,
        local: &RecorderSection,
    ) -> Result<CameraConfig, Error> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                InvalidArgument,
                msg("recorder name {name:?} must be ascii alphanumeric/dash/underscore")
            );
        }
        let required = |v: Option<String>, key: &str| {
            v.ok_or_else(|| err!(InvalidArgument, msg("recorder {name}: missing key {key}")))
        };
        let ip = required(pick!(local.ip, global.ip), "ip")?;
        let raw_stream_url = required(pick!(local.stream_url, global.stream_url), "stream_url")?;
        let stream_url = expand(&raw_stream_url, &[("name", name), ("ip", &ip)])?;

        let secs = |v: Option<f64>, key: &str, default: f64| -> Result<Duration, Error> {
            let v = v.unwrap_or(default);
            if !v.is_finite() || v < 0.0 {
                bail!(InvalidArgument, msg("recorder {name}: bad {key} {v}"));
            }
            Ok(Duration::from_secs_f64(v))
        };

        let storage_gb = pick!(local.storage_max_size, global.storage_max_size).unwrap_or(10.0);
        if !storage_gb.is_finite() || storage_gb <= 0.0 {
            bail!(InvalidArgument, msg("recorder {name}: bad storage_max_size"));
        }

        let motion = resolve_motion(
            name,
            global.motion_detector.as_ref(),
            local.motion_detector.as_ref(),
        )?;
        let memory = resolve_memory(global.memory.as_ref(), local.memory.as_ref());
        let actions = resolve_actions(name, global.actions.as_ref(), local.actions.as_ref())?;

        Ok(CameraConfig {
            name: name.to_owned(),
            ip,
            stream_url,
            record_autostart: pick!(local.record_autostart, global.record_autostart)
                .unwrap_or(false),
            record_time: secs(pick!(local.record_time, global.record_time), "record_time", 600.0)?,
            idle_sleep: secs(
                pick!(local.recorder_sleep_time, global.recorder_sleep_time),
                "recorder_sleep_time",
                5.0,
            )?,
            camera_ping_interval: secs(
                pick!(local.camera_ping_interval, global.camera_ping_interval),
                "camera_ping_interval",
                30.0,
            )?,
            send_status_interval: secs(
                pick!(local.send_status_interval, global.send_status_interval),
                "send_status_interval",
                30.0,
            )?,
            snapshot_time: secs(
                pick!(local.snapshot_time, global.snapshot_time),
                "snapshot_time",
                5.0,
            )?,
            storage_max_bytes: (storage_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            storage_path_template: pick!(local.storage_path, global.storage_path)
                .unwrap_or_else(|| "storage/{name}".to_owned()),
            filename_snapshot_template: pick!(local.filename_snapshot, global.filename_snapshot)
                .unwrap_or_else(|| "{storage_path}/snapshot.jpg".to_owned()),
            filename_video_template: pick!(local.filename_video, global.filename_video)
                .unwrap_or_else(|| {
                    "{storage_path}/{datetime:%Y-%m-%d}/{name}_{datetime:%Y%m%d_%H%M%S}.mp4"
                        .to_owned()
                }),
            cmd_recorder_start: pick!(local.cmd_recorder_start, global.cmd_recorder_start),
            cmd_take_snapshot: pick!(local.cmd_take_snapshot, global.cmd_take_snapshot),
            frame_width: pick!(local.frame_width, global.frame_width),
            frame_height: pick!(local.frame_height, global.frame_height),
            frame_channels: pick!(local.frame_channels, global.frame_channels),
            start_error_attempt_cnt: pick!(
                local.start_error_atempt_cnt,
                global.start_error_atempt_cnt
            )
            .unwrap_or(10)
            .max(1),
            start_error_threshold: secs(
                pick!(local.start_error_threshold, global.start_error_threshold),
                "start_error_threshold",
                10.0,
            )?,
            start_error_sleep: secs(
                pick!(local.start_error_sleep, global.start_error_sleep),
                "start_error_sleep",
                600.0,
            )?,
            throttling_min_mem_bytes: pick!(
                local.throttling_min_mem_size,
                global.throttling_min_mem_size
            )
            .unwrap_or(16)
                * 1024
                * 1024,
            throttling_max_mem_bytes: pick!(
                local.throttling_max_mem_size,
                global.throttling_max_mem_size
            )
            .unwrap_or(32)
                * 1024
                * 1024,
            motion,
            memory,
            actions,
        })
    }

    fn vars<'a>(&'a self, storage_path: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("name", self.name.as_str()),
            ("ip", self.ip.as_str()),
            ("stream_url", self.stream_url.as_str()),
            ("storage_path", storage_path),
        ]
    }

    /// The camera's storage root (quota scope).
    pub fn storage_path(&self) -> Result<PathBuf, Error> {
        Ok(expand(&self.storage_path_template, &[("name", &self.name)])?.into())
    }

    pub fn snapshot_path(&self) -> Result<PathBuf, Error> {
        let storage = self.storage_path()?;
        let storage = storage.to_string_lossy();
        Ok(expand(&self.filename_snapshot_template, &self.vars(&storage))?.into())
    }

    pub fn video_path(&self) -> Result<PathBuf, Error> {
        let storage = self.storage_path()?;
        let storage = storage.to_string_lossy();
        Ok(expand(&self.filename_video_template, &self.vars(&storage))?.into())
    }

    fn producer_command(&self, template: &str) -> Result<String, Error> {
        let storage = self.storage_path()?;
        let storage = storage.to_string_lossy();
        let record_time = format!("{}", self.record_time.as_secs());
        let snapshot_time = format!("{}", self.snapshot_time.as_secs());
        let min_mem = format!("{}", self.throttling_min_mem_bytes);
        let max_mem = format!("{}", self.throttling_max_mem_bytes);
        let mut vars = self.vars(&storage);
        vars.push(("record_time", &record_time));
        vars.push(("snapshot_time", &snapshot_time));
        vars.push(("throttling_min_mem_size", &min_mem));
        vars.push(("throttling_max_mem_size", &max_mem));
        let mut cmd = expand(template, &vars)?;
        // Frame geometry is appended as flags the producer understands.
        if let Some(h) = self.frame_height {
            cmd.push_str(&format!(" -fh {h}"));
        }
        if let Some(w) = self.frame_width {
            cmd.push_str(&format!(" -fw {w}"));
        }
        if let Some(d) = self.frame_channels {
            cmd.push_str(&format!(" -fd {d}"));
        }
        Ok(cmd)
    }

    /// The full recording producer command, or an error if not configured.
    pub fn recorder_command(&self) -> Result<String, Error> {
        let t = self.cmd_recorder_start.as_deref().ok_or_else(|| {
            err!(
                FailedPrecondition,
                msg("recorder {}: cmd_recorder_start is not defined", self.name)
            )
        })?;
        self.producer_command(t)
    }

    /// The snapshot-only producer command, if configured.
    pub fn snapshot_command(&self) -> Result<Option<String>, Error> {
        match self.cmd_take_snapshot.as_deref() {
            None => Ok(None),
            Some(t) => Ok(Some(self.producer_command(t)?)),
        }
    }
}

fn resolve_motion(
    name: &str,
    global: Option<&MotionSection>,
    local: Option<&MotionSection>,
) -> Result<MotionConfig, Error> {
    let d = MotionSection::default();
    let g = global.unwrap_or(&d);
    let l = local.unwrap_or(&d);
    let contour = match pick!(l.contour_detection, g.contour_detection) {
        None => None,
        Some(c) => Some(ContourConfig {
            min_area: c
                .min_area
                .unwrap_or(RawAreaBound::Text("0.5%".to_owned()))
                .resolve(&format!("recorder {name}: contour_detection.min_area"))?,
            max_area: c
                .max_area
                .unwrap_or(RawAreaBound::Text("50%".to_owned()))
                .resolve(&format!("recorder {name}: contour_detection.max_area"))?,
            max_count: c.max_count.unwrap_or(100),
        }),
    };
    let object_watch_delay = pick!(l.object_watch_delay, g.object_watch_delay).unwrap_or(0.5);
    if !object_watch_delay.is_finite() || object_watch_delay <= 0.0 {
        bail!(InvalidArgument, msg("recorder {name}: bad object_watch_delay"));
    }
    Ok(MotionConfig {
        enabled: pick!(l.enabled, g.enabled).unwrap_or(false),
        max_image_height: pick!(l.max_image_height, g.max_image_height).unwrap_or(128),
        max_image_width: pick!(l.max_image_width, g.max_image_width).unwrap_or(128),
        bg_frame_count: pick!(l.bg_frame_count, g.bg_frame_count).unwrap_or(5).max(2),
        threshold: pick!(l.threshold, g.threshold).unwrap_or(15),
        diff_threshold: pick!(l.detect_by_diff_threshold, g.detect_by_diff_threshold)
            .unwrap_or(5.0),
        min_frames_changes: pick!(l.min_frames_changes, g.min_frames_changes).unwrap_or(5),
        max_frames_static: pick!(l.max_frames_static, g.max_frames_static).unwrap_or(5),
        contour,
        object_watch_delay: Duration::from_secs_f64(object_watch_delay),
        object_throttling: pick!(l.object_throttling, g.object_throttling)
            .unwrap_or(10)
            .max(1),
    })
}

fn resolve_memory(global: Option<&MemorySection>, local: Option<&MemorySection>) -> MemoryConfig {
    let d = MemorySection::default();
    let g = global.unwrap_or(&d);
    let l = local.unwrap_or(&d);
    MemoryConfig {
        remember_time: pick!(l.remember_time, g.remember_time).unwrap_or(600),
        move_threshold: pick!(l.move_threshold, g.move_threshold).unwrap_or(10.0),
        area_intersect: pick!(l.area_intersect, g.area_intersect).unwrap_or(50.0),
        size_similarity: pick!(l.size_similarity, g.size_similarity).unwrap_or(90.0),
        objects: pick!(l.objects, g.objects)
            .map(StringList::into_vec)
            .unwrap_or_default(),
        objects_exclude: pick!(l.objects_exclude, g.objects_exclude)
            .map(StringList::into_vec)
            .unwrap_or_default(),
    }
}

fn resolve_actions(
    name: &str,
    global: Option<&IndexMap<String, ActionSection>>,
    local: Option<&IndexMap<String, ActionSection>>,
) -> Result<Vec<(String, Action)>, Error> {
    let empty = IndexMap::new();
    let g = global.unwrap_or(&empty);
    let l = local.unwrap_or(&empty);
    // Configuration order, globals first; a local override keeps the
    // global's position.
    let mut names: Vec<&String> = Vec::new();
    for n in g.keys().chain(l.keys()) {
        if !names.contains(&n) {
            names.push(n);
        }
    }
    let mut out = Vec::with_capacity(names.len());
    for action_name in names {
        let merged = merge_action(g.get(action_name), l.get(action_name));
        let action = Action::resolve(name, action_name, &merged)?;
        out.push((action_name.clone(), action));
    }
    Ok(out)
}

fn merge_action(global: Option<&ActionSection>, local: Option<&ActionSection>) -> ActionSection {
    let d = ActionSection::default();
    let g = global.unwrap_or(&d);
    let l = local.unwrap_or(&d);
    ActionSection {
        type_: pick!(l.type_, g.type_),
        objects: pick!(l.objects, g.objects),
        objects_exclude: pick!(l.objects_exclude, g.objects_exclude),
        score: pick!(l.score, g.score),
        area: pick!(l.area, g.area),
        use_memory: pick!(l.use_memory, g.use_memory),
        file: pick!(l.file, g.file),
        brush_size: pick!(l.brush_size, g.brush_size),
        jpeg_quality: pick!(l.jpeg_quality, g.jpeg_quality),
        font: pick!(l.font, g.font),
        smtp_server: pick!(l.smtp_server, g.smtp_server),
        smtp_port: pick!(l.smtp_port, g.smtp_port),
        user: pick!(l.user, g.user),
        password: pick!(l.password, g.password),
        subject: pick!(l.subject, g.subject),
        mail_from: pick!(l.mail_from, g.mail_from),
        mail_to: pick!(l.mail_to, g.mail_to),
    }
}

/// Loads and resolves the configuration file.
pub fn load(path: &Path) -> Result<Config, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, msg("unable to read {}", path.display()), source(e)))?;
    let file: ConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse {}", path.display()), source(e)))?;
    resolve(file)
}

pub fn resolve(file: ConfigFile) -> Result<Config, Error> {
    if file.object_detector_cloud.is_some() && file.object_detector_local.is_some() {
        bail!(
            InvalidArgument,
            msg("configure only one of object_detector_cloud / object_detector_local")
        );
    }
    let detector = if let Some(c) = file.object_detector_cloud {
        Some(DetectorConfig::Cloud(CloudDetectorConfig {
            url: url::Url::parse(&c.url)
                .map_err(|e| err!(InvalidArgument, msg("object_detector_cloud.url"), source(e)))?,
            key: c.key,
            timeout: Duration::from_secs_f64(c.timeout),
            min_score: c.min_score,
            sleep_time: Duration::from_secs_f64(c.sleep_time),
        }))
    } else if let Some(c) = file.object_detector_local {
        Some(DetectorConfig::Local(LocalDetectorConfig {
            cmd: c.cmd,
            timeout: Duration::from_secs_f64(c.timeout),
            min_score: c.min_score,
            sleep_time: Duration::from_secs_f64(c.sleep_time),
        }))
    } else {
        None
    };

    let mut cameras = Vec::with_capacity(file.recorders.len());
    for (name, section) in &file.recorders {
        cameras.push(Arc::new(CameraConfig::resolve(name, &file.global, section)?));
    }

    Ok(Config {
        mqtt: file.mqtt.map(|m| MqttConfig {
            client_id: m.name,
            host: m.server_host,
            port: m.server_port,
            keepalive: Duration::from_secs(m.server_keepalive),
            login: m.login,
            password: m.pwd,
            topic_publish: m.topic_publish,
            topic_subscribe: m.topic_subscribe,
        }),
        temp_storage_path: file.temp_storage_path,
        detector,
        http: file.http_server.map(|h| HttpConfig {
            host: h.host,
            port: h.port,
        }),
        worker_threads: file.worker_threads,
        cameras,
    })
}

/// Expands `{key}` and `{datetime:%...}` placeholders in a template.
///
/// `{{` and `}}` escape literal braces. Unknown keys are an error so that a
/// typo fails at startup rather than producing a misnamed file at 3am.
pub fn expand(template: &str, vars: &[(&str, &str)]) -> Result<String, Error> {
    expand_at(template, vars, &jiff::Zoned::now())
}

pub fn expand_at(template: &str, vars: &[(&str, &str)], now: &jiff::Zoned) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut token = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => token.push(c),
                        None => bail!(InvalidArgument, msg("unclosed {{ in template {template:?}")),
                    }
                }
                let (key, fmt) = match token.split_once(':') {
                    Some((k, f)) => (k, Some(f)),
                    None => (token.as_str(), None),
                };
                if key == "datetime" {
                    let fmt = fmt.unwrap_or("%Y%m%d_%H%M%S");
                    let s = jiff::fmt::strtime::format(fmt, now).map_err(|e| {
                        err!(InvalidArgument, msg("bad datetime format {fmt:?}"), source(e))
                    })?;
                    out.push_str(&s);
                } else {
                    match vars.iter().find(|(k, _)| *k == key) {
                        Some((_, v)) => out.push_str(v),
                        None => bail!(
                            InvalidArgument,
                            msg("unknown template key {key:?} in {template:?}")
                        ),
                    }
                }
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Splits a command line into argv, honoring single/double quotes.
pub fn split_command(cmd: &str) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in cmd.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    cur.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        out.push(std::mem::take(&mut cur));
                        in_word = false;
                    }
                }
                c => {
                    cur.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        bail!(InvalidArgument, msg("unbalanced quote in command {cmd:?}"));
    }
    if in_word {
        out.push(cur);
    }
    if out.is_empty() {
        bail!(InvalidArgument, msg("empty command"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
mqtt:
  server_host: broker.local
global:
  ip: 10.0.0.1
  stream_url: "rtsp://{ip}/live"
  record_time: 60
  motion_detector:
    enabled: true
    min_frames_changes: 2
recorders:
  cam0: {}
  cam1:
    ip: 10.0.0.2
    record_time: 120
    motion_detector:
      min_frames_changes: 7
"#
    }

    #[test]
    fn per_camera_key_beats_global() {
        let file: ConfigFile = serde_yaml::from_str(minimal_yaml()).unwrap();
        let cfg = resolve(file).unwrap();
        let cam0 = cfg.camera("cam0").unwrap();
        let cam1 = cfg.camera("cam1").unwrap();
        assert_eq!(cam0.ip, "10.0.0.1");
        assert_eq!(cam0.stream_url, "rtsp://10.0.0.1/live");
        assert_eq!(cam0.record_time, Duration::from_secs(60));
        assert_eq!(cam1.ip, "10.0.0.2");
        assert_eq!(cam1.stream_url, "rtsp://10.0.0.2/live");
        assert_eq!(cam1.record_time, Duration::from_secs(120));
        // Group keys merge per key: enabled comes from global even where the
        // camera overrides another key in the same group.
        assert!(cam1.motion.enabled);
        assert_eq!(cam1.motion.min_frames_changes, 7);
        assert_eq!(cam0.motion.min_frames_changes, 2);
    }

    #[test]
    fn missing_required_key_names_it() {
        let yaml = r#"
recorders:
  cam0:
    ip: 10.0.0.1
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let e = resolve(file).unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("stream_url"), "{msg}");
    }

    #[test]
    fn bad_recorder_name_rejected() {
        let yaml = r#"
recorders:
  "cam*0":
    ip: 10.0.0.1
    stream_url: rtsp://x/
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert!(resolve(file).is_err());
    }

    #[test]
    fn expand_datetime_and_vars() {
        let now: jiff::Zoned = "2024-03-05T17:30:09[UTC]".parse().unwrap();
        let s = expand_at(
            "{storage_path}/{datetime:%Y-%m-%d}/{name}_{datetime}.mp4",
            &[("storage_path", "storage/cam0"), ("name", "cam0")],
            &now,
        )
        .unwrap();
        assert_eq!(s, "storage/cam0/2024-03-05/cam0_20240305_173009.mp4");
    }

    #[test]
    fn expand_rejects_unknown_key() {
        assert!(expand("{nope}", &[]).is_err());
        assert_eq!(expand("{{literal}}", &[]).unwrap(), "{literal}");
    }

    #[test]
    fn split_command_honors_quotes() {
        let argv = split_command(r#"ffmpeg -i "rtsp://u:p@h/a b" -f rawvideo pipe:"#).unwrap();
        assert_eq!(argv[0], "ffmpeg");
        assert_eq!(argv[2], "rtsp://u:p@h/a b");
        assert_eq!(argv.last().unwrap(), "pipe:");
        assert!(split_command(r#"x "unbalanced"#).is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn area_bounds_parse() {
        assert_eq!(
            RawAreaBound::Text("0.5%".into()).resolve("k").unwrap(),
            AreaBound::Percent(0.5)
        );
        assert_eq!(
            RawAreaBound::Pixels(300).resolve("k").unwrap(),
            AreaBound::Pixels(300)
        );
        assert_eq!(
            RawAreaBound::Text(" 40 ".into()).resolve("k").unwrap(),
            AreaBound::Pixels(40)
        );
        assert!(RawAreaBound::Text("150%".into()).resolve("k").is_err());
    }

    #[test]
    fn string_list_forms() {
        let v: StringList = serde_yaml::from_str("\"car, person\"").unwrap();
        assert_eq!(v.into_vec(), vec!["car", "person"]);
        let v: StringList = serde_yaml::from_str("[car, person]").unwrap();
        assert_eq!(v.into_vec(), vec!["car", "person"]);
    }
}
