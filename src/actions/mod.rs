// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Side-effects for frames with confirmed objects.
//!
//! Actions are a closed set, configured per camera and dispatched in
//! configuration order. Execution is best-effort: one failing action is
//! logged and the rest still run.

pub mod mailer;
pub mod painter;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base::clock::Clocks;
use base::{bail, err, Error};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{expand, ActionSection, CameraConfig, StringList};
use crate::json::{BBox, DetectionReport};
use crate::storage;
use crate::watcher::memory::DetectionMemory;

use self::mailer::MailConfig;

/// The pre-dispatch gating parameters shared by every action kind.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    pub objects: Vec<String>,
    pub objects_exclude: Vec<String>,
    /// Percent, 0..100. Detector scores are 0..1; the comparison is
    /// `score * 100 >= score_min`.
    pub score_min: f64,
    /// Detection polygon as `(x, y)` vertices; fewer than 3 makes the
    /// polygon gate vacuously true.
    pub area: Vec<[i64; 2]>,
    pub use_memory: bool,
}

impl Gate {
    fn class_ok(&self, class: &str) -> bool {
        if self.objects_exclude.iter().any(|c| c == class) {
            return false;
        }
        self.objects.is_empty() || self.objects.iter().any(|c| c == class)
    }

    fn score_ok(&self, score: f64) -> bool {
        score * 100.0 >= self.score_min
    }

    fn polygon_ok(&self, bbox: &BBox) -> bool {
        if self.area.len() < 3 {
            return true;
        }
        bbox.corners()
            .iter()
            .any(|&(x, y)| point_in_polygon(&self.area, x as f64, y as f64))
    }
}

/// Ray-casting point-in-polygon test.
fn point_in_polygon(poly: &[[i64; 2]], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = poly.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (poly[i][0] as f64, poly[i][1] as f64);
        let (xj, yj) = (poly[j][0] as f64, poly[j][1] as f64);
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// A configured action; the variant is fixed by the YAML `type` key.
#[derive(Clone, Debug)]
pub enum Action {
    /// Draw the detection polygon plus per-object boxes and labels, then make
    /// the annotated file the "current" frame for subsequent actions.
    Annotate {
        gate: Gate,
        target: String,
        brush_size: u32,
        jpeg_quality: u8,
        font: Option<PathBuf>,
    },
    /// Append the report as a JSON line.
    Log { gate: Gate, target: String },
    Copy {
        gate: Gate,
        target: String,
    },
    Move {
        gate: Gate,
        target: String,
    },
    Mail { gate: Gate, mail: MailConfig },
}

impl Action {
    pub fn gate(&self) -> &Gate {
        match self {
            Action::Annotate { gate, .. }
            | Action::Log { gate, .. }
            | Action::Copy { gate, .. }
            | Action::Move { gate, .. }
            | Action::Mail { gate, .. } => gate,
        }
    }

    /// The kind string recorded in a cluster's triggered-action set.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Annotate { .. } => "annotate",
            Action::Log { .. } => "log",
            Action::Copy { .. } => "copy",
            Action::Move { .. } => "move",
            Action::Mail { .. } => "mail",
        }
    }

    /// Validates one raw action block into a variant.
    pub fn resolve(camera: &str, name: &str, s: &ActionSection) -> Result<Action, Error> {
        let ctx = |key: &str| format!("recorder {camera}: action {name}: {key}");
        let gate = Gate {
            objects: s
                .objects
                .clone()
                .map(StringList::into_vec)
                .unwrap_or_default(),
            objects_exclude: s
                .objects_exclude
                .clone()
                .map(StringList::into_vec)
                .unwrap_or_default(),
            score_min: s.score.unwrap_or(50.0),
            area: s.area.clone().unwrap_or_default(),
            use_memory: s.use_memory.unwrap_or(false),
        };
        let file = s.file.clone().unwrap_or_default();
        let required = |v: Option<String>, key: &str| {
            v.ok_or_else(|| err!(InvalidArgument, msg("{} is required", ctx(key))))
        };
        let type_ = s
            .type_
            .as_deref()
            .ok_or_else(|| err!(InvalidArgument, msg("{} is required", ctx("type"))))?;
        Ok(match type_ {
            "draw" | "annotate" => Action::Annotate {
                gate,
                target: file.target.unwrap_or_else(|| "{filename}".to_owned()),
                brush_size: s.brush_size.unwrap_or(1).clamp(1, 16),
                jpeg_quality: s.jpeg_quality.unwrap_or(90).clamp(1, 100),
                font: s.font.clone(),
            },
            "log" => Action::Log {
                gate,
                target: file
                    .target
                    .unwrap_or_else(|| "{storage_path}/{name}_objects.log".to_owned()),
            },
            "copy" => Action::Copy {
                gate,
                target: required(file.target, "file.target")?,
            },
            "move" => Action::Move {
                gate,
                target: required(file.target, "file.target")?,
            },
            "mail" => Action::Mail {
                gate,
                mail: MailConfig {
                    server: required(s.smtp_server.clone(), "smtp_server")?,
                    port: s.smtp_port,
                    user: required(s.user.clone(), "user")?,
                    password: required(s.password.clone(), "password")?,
                    from: required(s.mail_from.clone(), "mail_from")?,
                    to: required(s.mail_to.clone(), "mail_to")?,
                    subject: s
                        .subject
                        .clone()
                        .unwrap_or_else(|| format!("Vigil: object detected by {camera}")),
                },
            },
            other => bail!(
                InvalidArgument,
                msg("{}: unknown action type {other:?}", ctx("type"))
            ),
        })
    }
}

/// Executes a camera's configured actions against one detection report.
pub struct ActionDispatcher {
    cfg: std::sync::Arc<CameraConfig>,
}

impl ActionDispatcher {
    pub fn new(cfg: std::sync::Arc<CameraConfig>) -> Self {
        ActionDispatcher { cfg }
    }

    /// Runs every configured action against `report`, in order. `frame` is
    /// the `.obj.found` path; an annotate action swaps in its output for the
    /// actions after it.
    pub async fn run<C: Clocks>(
        &self,
        frame: &Path,
        report: &DetectionReport,
        memory: &Mutex<DetectionMemory<C>>,
    ) {
        let mut current = frame.to_path_buf();
        for (name, action) in &self.cfg.actions {
            if !self.gate_passes(action, report, memory).await {
                debug!(action = %name, "gate not passed, skipping");
                continue;
            }
            match self.run_one(action, &mut current, report, memory).await {
                Ok(()) => info!(action = %name, frame = %current.display(), "action done"),
                Err(e) => {
                    warn!(action = %name, err = %e.chain(), "action failed, continuing")
                }
            }
        }
    }

    async fn gate_passes<C: Clocks>(
        &self,
        action: &Action,
        report: &DetectionReport,
        memory: &Mutex<DetectionMemory<C>>,
    ) -> bool {
        let gate = action.gate();
        if !report.is_ok() || report.objects.is_empty() {
            return false;
        }
        let mem = if gate.use_memory {
            Some(memory.lock().await)
        } else {
            None
        };
        report.objects.iter().any(|d| {
            gate.class_ok(&d.class)
                && gate.score_ok(d.score)
                && gate.polygon_ok(&d.bbox)
                && match (&mem, d.cluster) {
                    (Some(m), Some(id)) => !m.is_triggered(id, action.kind()),
                    // A class excluded from memory is never suppressed.
                    _ => true,
                }
        })
    }

    fn vars<'a>(
        &'a self,
        current: &'a str,
        storage_path: &'a str,
        class: Option<&'a str>,
    ) -> Vec<(&'a str, &'a str)> {
        let mut v = vec![
            ("filename", current),
            ("name", self.cfg.name.as_str()),
            ("storage_path", storage_path),
        ];
        if let Some(c) = class {
            v.push(("class", c));
        }
        v
    }

    async fn run_one<C: Clocks>(
        &self,
        action: &Action,
        current: &mut PathBuf,
        report: &DetectionReport,
        memory: &Mutex<DetectionMemory<C>>,
    ) -> Result<(), Error> {
        let storage_path = self.cfg.storage_path()?;
        let storage_path = storage_path.to_string_lossy().into_owned();
        let current_str = current.to_string_lossy().into_owned();
        let gate = action.gate();
        match action {
            Action::Annotate {
                target,
                brush_size,
                jpeg_quality,
                font,
                ..
            } => {
                let out: PathBuf =
                    expand(target, &self.vars(&current_str, &storage_path, None))?.into();
                storage::force_create_parent(&out)?;
                painter::annotate(
                    current,
                    &out,
                    report,
                    &gate.area,
                    *brush_size,
                    *jpeg_quality,
                    font.as_deref(),
                )?;
                self.mark_all(gate, action.kind(), report, memory).await;
                *current = out;
                Ok(())
            }
            Action::Log { target, .. } => {
                let out: PathBuf =
                    expand(target, &self.vars(&current_str, &storage_path, None))?.into();
                storage::force_create_parent(&out)?;
                let mut f = fs::OpenOptions::new().create(true).append(true).open(&out)?;
                let line = serde_json::to_string(report)
                    .map_err(|e| err!(Internal, msg("encode report"), source(e)))?;
                writeln!(f, "{line}")?;
                self.mark_all(gate, action.kind(), report, memory).await;
                Ok(())
            }
            Action::Copy { target, .. } | Action::Move { target, .. } => {
                self.copy_or_move(action, gate, target, current, report, memory)
                    .await
            }
            Action::Mail { mail, .. } => {
                // Suppressed entirely when everything is already known.
                if gate.use_memory && report.objects.iter().all(|d| d.in_memory) {
                    debug!("all detections in memory, not mailing");
                    return Ok(());
                }
                let image = fs::read(&*current)?;
                let mail = mail.clone();
                let report_for_mail = report.clone();
                tokio::task::spawn_blocking(move || mailer::send(&mail, &image, &report_for_mail))
                    .await
                    .map_err(|e| err!(Internal, msg("mail task"), source(e)))??;
                self.mark_all(gate, action.kind(), report, memory).await;
                Ok(())
            }
        }
    }

    /// Per-object file transfer; each transferred object's cluster is marked
    /// so a `use_memory` copy fires once per physical object.
    async fn copy_or_move<C: Clocks>(
        &self,
        action: &Action,
        gate: &Gate,
        target: &str,
        current: &Path,
        report: &DetectionReport,
        memory: &Mutex<DetectionMemory<C>>,
    ) -> Result<(), Error> {
        let storage_path = self.cfg.storage_path()?;
        let storage_path = storage_path.to_string_lossy().into_owned();
        let current_str = current.to_string_lossy().into_owned();
        let is_move = matches!(action, Action::Move { .. });
        let mut last_err = None;
        for d in &report.objects {
            if !gate.class_ok(&d.class) {
                continue;
            }
            if gate.use_memory {
                if let Some(id) = d.cluster {
                    if memory.lock().await.is_triggered(id, action.kind()) {
                        continue;
                    }
                }
            }
            let out: PathBuf = expand(
                target,
                &self.vars(&current_str, &storage_path, Some(&d.class)),
            )?
            .into();
            let res = (|| -> Result<(), Error> {
                storage::force_create_parent(&out)?;
                if is_move {
                    // Rename when possible; fall back for cross-device moves.
                    if fs::rename(current, &out).is_err() {
                        fs::copy(current, &out)?;
                        fs::remove_file(current)?;
                    }
                } else {
                    fs::copy(current, &out)?;
                }
                Ok(())
            })();
            match res {
                Ok(()) => {
                    if gate.use_memory {
                        if let Some(id) = d.cluster {
                            memory.lock().await.mark_triggered(id, action.kind());
                        }
                    }
                    if is_move {
                        // Nothing left to move for the remaining objects.
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(target = %out.display(), err = %e.chain(), "file action failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn mark_all<C: Clocks>(
        &self,
        gate: &Gate,
        kind: &str,
        report: &DetectionReport,
        memory: &Mutex<DetectionMemory<C>>,
    ) {
        if !gate.use_memory {
            return;
        }
        let mut mem = memory.lock().await;
        for d in &report.objects {
            if let Some(id) = d.cluster {
                if gate.class_ok(&d.class) {
                    mem.mark_triggered(id, kind);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ConfigFile};
    use crate::json::Detection;
    use base::clock::SimulatedClocks;
    use std::sync::Arc;

    fn gate() -> Gate {
        Gate {
            objects: vec!["person".to_owned()],
            objects_exclude: vec!["bird".to_owned()],
            score_min: 50.0,
            area: Vec::new(),
            use_memory: false,
        }
    }

    fn det(class: &str, score: f64, bbox: [i64; 4]) -> Detection {
        Detection {
            class: class.to_owned(),
            score,
            bbox: BBox(bbox),
            in_memory: false,
            cluster: None,
        }
    }

    #[test]
    fn gate_score_is_percent() {
        let g = gate();
        assert!(g.score_ok(0.5));
        assert!(g.score_ok(0.51));
        assert!(!g.score_ok(0.49));
    }

    #[test]
    fn gate_class_lists() {
        let g = gate();
        assert!(g.class_ok("person"));
        assert!(!g.class_ok("car"));
        assert!(!g.class_ok("bird"));
        let open = Gate::default();
        assert!(open.class_ok("anything"));
    }

    #[test]
    fn polygon_gate_vacuous_below_three_points() {
        let mut g = gate();
        g.area = vec![[0, 0], [100, 0]];
        assert!(g.polygon_ok(&BBox([500, 500, 600, 600])));
    }

    #[test]
    fn polygon_gate_checks_corners() {
        let mut g = gate();
        g.area = vec![[0, 0], [100, 0], [100, 100], [0, 100]];
        // box corner (x1=50, y1=50) inside
        assert!(g.polygon_ok(&BBox([50, 50, 500, 500])));
        // entirely outside
        assert!(!g.polygon_ok(&BBox([200, 200, 300, 300])));
    }

    fn camera_with_actions(yaml_actions: &str, dir: &Path) -> Arc<CameraConfig> {
        let yaml = format!(
            r#"
recorders:
  cam0:
    ip: 10.0.0.1
    stream_url: rtsp://x/
    storage_path: "{}"
    actions:
{yaml_actions}
"#,
            dir.display()
        );
        let file: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        resolve(file).unwrap().cameras[0].clone()
    }

    fn memory_for(
        cfg: &CameraConfig,
    ) -> Mutex<DetectionMemory<SimulatedClocks>> {
        Mutex::new(DetectionMemory::new(
            cfg.memory.clone(),
            SimulatedClocks::new("2024-03-01T00:00:00Z".parse().unwrap()),
        ))
    }

    #[tokio::test]
    async fn log_action_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cam = camera_with_actions(
            r#"
      log1:
        type: log
        score: 0
"#,
            dir.path(),
        );
        let memory = memory_for(&cam);
        let frame = dir.path().join("cam0_1_1.obj.found");
        std::fs::write(&frame, b"img").unwrap();
        let report = DetectionReport::ok(vec![det("person", 0.9, [10, 20, 110, 220])]);

        let d = ActionDispatcher::new(cam.clone());
        d.run(&frame, &report, &memory).await;
        d.run(&frame, &report, &memory).await;

        let log = std::fs::read_to_string(dir.path().join("cam0_objects.log")).unwrap();
        assert_eq!(log.lines().count(), 2, "log has no use_memory, fires twice");
        let parsed: DetectionReport = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.objects[0].class, "person");
    }

    #[tokio::test]
    async fn use_memory_copy_fires_once_per_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let cam = camera_with_actions(
            r#"
      grab:
        type: copy
        score: 0
        use_memory: true
        file:
          target: "{storage_path}/out/{class}.jpg"
"#,
            dir.path(),
        );
        let memory = memory_for(&cam);
        let frame = dir.path().join("cam0_1_1.obj.found");
        std::fs::write(&frame, b"img").unwrap();

        let mut report = DetectionReport::ok(vec![det("car", 0.9, [100, 100, 200, 200])]);
        assert!(memory.lock().await.add(&mut report));
        let d = ActionDispatcher::new(cam.clone());
        d.run(&frame, &report, &memory).await;
        let out = dir.path().join("out/car.jpg");
        assert!(out.exists());
        std::fs::remove_file(&out).unwrap();

        // Same physical object a moment later: matched in memory, already
        // triggered, so the copy must not repeat.
        let mut second = DetectionReport::ok(vec![det("car", 0.9, [102, 101, 203, 204])]);
        assert!(!memory.lock().await.add(&mut second));
        d.run(&frame, &second, &memory).await;
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_later_actions() {
        let dir = tempfile::tempdir().unwrap();
        // Actions dispatch in configuration order: "a-copy" fails on a bad
        // template key before "b-log" runs.
        let cam = camera_with_actions(
            r#"
      a-copy:
        type: copy
        score: 0
        file:
          target: "{storage_path}/{unknown_key}.jpg"
      b-log:
        type: log
        score: 0
"#,
            dir.path(),
        );
        let memory = memory_for(&cam);
        let frame = dir.path().join("cam0_1_1.obj.found");
        std::fs::write(&frame, b"img").unwrap();
        let report = DetectionReport::ok(vec![det("person", 0.9, [10, 20, 110, 220])]);
        ActionDispatcher::new(cam).run(&frame, &report, &memory).await;
        assert!(dir.path().join("cam0_objects.log").exists());
    }

    #[test]
    fn resolve_rejects_unknown_type() {
        let s = ActionSection {
            type_: Some("explode".to_owned()),
            ..Default::default()
        };
        assert!(Action::resolve("cam0", "boom", &s).is_err());
    }

    #[test]
    fn resolve_mail_requires_credentials() {
        let s = ActionSection {
            type_: Some("mail".to_owned()),
            smtp_server: Some("smtp.example.com".to_owned()),
            ..Default::default()
        };
        let e = Action::resolve("cam0", "alert", &s).unwrap_err();
        assert!(e.to_string().contains("user"), "{e}");
    }
}
