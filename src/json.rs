// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types exchanged over the bus, the HTTP surface, and detector sidecar
//! files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A command received on `{prefix}/daemon/{source}`.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Command {
    pub cmd: CommandKind,
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Start,
    Stop,
    Status,

    /// Valid only for the `daemon` source.
    Restart,
}

/// A status snapshot published on `{prefix}/clients/{camera}`.
///
/// Field names (including the spaced ones) are fixed by the bus interface.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Status {
    pub name: String,
    pub status: String,
    pub error_cnt: u32,
    pub latest_file: String,
    pub snapshot: String,
    pub record: bool,
    pub watcher: bool,
    #[serde(rename = "motion throttling")]
    pub motion_throttling: String,
    pub cnt_frame_analyzed: u32,
    pub cnt_motion_frame: u32,
    #[serde(rename = "object throttling")]
    pub object_throttling: u32,
    pub cnt_obj_frame: u32,
    pub cnt_in_memory: u32,
}

/// An axis-aligned bounding box as `(y1, x1, y2, x2)` integer pixels.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BBox(pub [i64; 4]);

impl BBox {
    pub fn y1(&self) -> i64 {
        self.0[0]
    }
    pub fn x1(&self) -> i64 {
        self.0[1]
    }
    pub fn y2(&self) -> i64 {
        self.0[2]
    }
    pub fn x2(&self) -> i64 {
        self.0[3]
    }

    pub fn height(&self) -> i64 {
        (self.y2() - self.y1()).abs()
    }

    pub fn width(&self) -> i64 {
        (self.x2() - self.x1()).abs()
    }

    pub fn area(&self) -> i64 {
        self.height() * self.width()
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1() + self.x2()) as f64 / 2.0,
            (self.y1() + self.y2()) as f64 / 2.0,
        )
    }

    /// Area of the intersection with `other`, zero when disjoint.
    pub fn intersect_area(&self, other: &BBox) -> i64 {
        let h = (self.y2().min(other.y2()) - self.y1().max(other.y1())).max(0);
        let w = (self.x2().min(other.x2()) - self.x1().max(other.x1())).max(0);
        h * w
    }

    /// The four corners as `(x, y)` points, for the polygon gate.
    pub fn corners(&self) -> [(i64, i64); 4] {
        [
            (self.x1(), self.y1()),
            (self.x2(), self.y2()),
            (self.x2(), self.y1()),
            (self.x1(), self.y2()),
        ]
    }
}

/// One detected object within a frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub class: String,

    /// Confidence in `[0, 1]`. Configured gates are percentages; compare as
    /// `score * 100.0 >= score_min`.
    pub score: f64,

    #[serde(rename = "box")]
    pub bbox: BBox,

    /// True when detection memory matched this observation to an existing
    /// cluster.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_memory: bool,

    /// Arena id of the owning memory cluster, if any. Process-local.
    #[serde(skip)]
    pub cluster: Option<usize>,
}

/// The sidecar contents of a `.obj.found.info` file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DetectionReport {
    /// `"ok"` or an error string.
    pub result: String,

    #[serde(default)]
    pub objects: Vec<Detection>,

    /// Path of the frame the report describes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,

    /// Inference wall time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
}

impl DetectionReport {
    pub fn ok(objects: Vec<Detection>) -> Self {
        DetectionReport {
            result: "ok".to_owned(),
            objects,
            filename: None,
            elapsed: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trip() {
        let raw = r#"{
            "result": "ok",
            "objects": [
                {"class": "person", "score": 0.91, "box": [10, 20, 110, 220]}
            ],
            "elapsed": 0.25
        }"#;
        let r: DetectionReport = serde_json::from_str(raw).unwrap();
        assert!(r.is_ok());
        assert_eq!(r.objects.len(), 1);
        let d = &r.objects[0];
        assert_eq!(d.class, "person");
        assert_eq!(d.bbox, BBox([10, 20, 110, 220]));
        assert!(!d.in_memory);
        let back = serde_json::to_string(&r).unwrap();
        let r2: DetectionReport = serde_json::from_str(&back).unwrap();
        assert_eq!(r2.objects, r.objects);
    }

    #[test]
    fn bbox_geometry() {
        let a = BBox([100, 100, 200, 200]);
        let b = BBox([102, 101, 203, 204]);
        assert_eq!(a.area(), 10_000);
        assert_eq!(a.intersect_area(&b), 98 * 99);
        assert_eq!(a.center(), (150.0, 150.0));
        assert_eq!(a.intersect_area(&BBox([300, 300, 400, 400])), 0);
    }

    #[test]
    fn command_parse() {
        let c: Command = serde_json::from_str(r#"{"cmd": "start"}"#).unwrap();
        assert_eq!(c.cmd, CommandKind::Start);
        assert!(serde_json::from_str::<Command>(r#"{"cmd": "explode"}"#).is_err());
    }
}
