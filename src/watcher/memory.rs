// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Short-term memory of detected objects, for de-duplicating actions.
//!
//! Detections that look like "the same object over time" are grouped into
//! clusters. Clusters live in a per-camera arena; detections refer to them by
//! index, never by pointer, so reports stay serializable. `add` is the only
//! mutation path and each camera's memory sits behind its own mutex upstream.

use std::collections::HashSet;

use base::clock::Clocks;
use tracing::debug;

use crate::json::{BBox, Detection, DetectionReport};

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Seconds a cluster survives without a new association. Negative
    /// disables memory: every report is eligible.
    pub remember_time: i64,
    /// Max of |Δcx|, |Δcy| in pixels under which two boxes match.
    pub move_threshold: f64,
    /// Percent of the new box's area covered by an old box to match.
    pub area_intersect: f64,
    /// Percent size similarity at or above which two boxes match.
    pub size_similarity: f64,
    /// Classes eligible for memory; empty means all.
    pub objects: Vec<String>,
    /// Classes that bypass memory entirely.
    pub objects_exclude: Vec<String>,
}

/// A time-windowed equivalence class of detections.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub class: String,
    /// Every box ever associated; always nonempty.
    pub history: Vec<BBox>,
    /// Action kinds that already fired for this cluster.
    pub triggered: HashSet<String>,
    pub last_seen: jiff::Timestamp,
}

pub struct DetectionMemory<C: Clocks> {
    cfg: MemoryConfig,
    clocks: C,
    slots: Vec<Option<Cluster>>,
}

impl<C: Clocks> DetectionMemory<C> {
    pub fn new(cfg: MemoryConfig, clocks: C) -> Self {
        DetectionMemory {
            cfg,
            clocks,
            slots: Vec::new(),
        }
    }

    /// Folds a report into memory.
    ///
    /// Returns true when at least one observation is new or belongs to a
    /// cluster with no triggered actions yet, i.e. downstream actions should
    /// run. Matched detections get `in_memory` set and their cluster id
    /// attached.
    pub fn add(&mut self, report: &mut DetectionReport) -> bool {
        if self.cfg.remember_time < 0 {
            return true;
        }
        let now = self.clocks.realtime();
        self.expire(now);
        let mut eligible = false;
        for i in 0..report.objects.len() {
            if !self.remembers_class(&report.objects[i].class) {
                eligible = true;
                continue;
            }
            match self.find_match(&report.objects[i]) {
                Some(id) => {
                    let det = &mut report.objects[i];
                    det.in_memory = true;
                    det.cluster = Some(id);
                    let c = self.slots[id].as_mut().expect("matched slot is live");
                    c.history.push(det.bbox);
                    c.last_seen = now;
                    if c.triggered.is_empty() {
                        eligible = true;
                    }
                }
                None => {
                    let det = &report.objects[i];
                    let id = self.insert(Cluster {
                        class: det.class.clone(),
                        history: vec![det.bbox],
                        triggered: HashSet::new(),
                        last_seen: now,
                    });
                    debug!(class = %report.objects[i].class, id, "remembering new object");
                    report.objects[i].cluster = Some(id);
                    eligible = true;
                }
            }
        }
        eligible
    }

    /// Marks an action kind as fired for a cluster.
    pub fn mark_triggered(&mut self, id: usize, action_kind: &str) {
        if let Some(Some(c)) = self.slots.get_mut(id) {
            c.triggered.insert(action_kind.to_owned());
        }
    }

    /// Whether the action kind already fired for the cluster. An expired or
    /// unknown cluster has, by definition, triggered nothing.
    pub fn is_triggered(&self, id: usize, action_kind: &str) -> bool {
        matches!(self.slots.get(id), Some(Some(c)) if c.triggered.contains(action_kind))
    }

    pub fn cluster(&self, id: usize) -> Option<&Cluster> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remembers_class(&self, class: &str) -> bool {
        if self.cfg.objects_exclude.iter().any(|c| c == class) {
            return false;
        }
        self.cfg.objects.is_empty() || self.cfg.objects.iter().any(|c| c == class)
    }

    fn find_match(&self, det: &Detection) -> Option<usize> {
        for (id, slot) in self.slots.iter().enumerate() {
            let Some(c) = slot else { continue };
            if c.class != det.class {
                continue;
            }
            if c.history.iter().any(|old| self.boxes_match(&det.bbox, old)) {
                return Some(id);
            }
        }
        None
    }

    /// OR of the three similarity predicates; deliberately permissive.
    fn boxes_match(&self, new: &BBox, old: &BBox) -> bool {
        if new.area() > 0 {
            let pct = new.intersect_area(old) as f64 / new.area() as f64 * 100.0;
            if pct >= self.cfg.area_intersect {
                return true;
            }
        }
        if size_similarity(new, old) >= self.cfg.size_similarity {
            return true;
        }
        let (ncx, ncy) = new.center();
        let (ocx, ocy) = old.center();
        (ncx - ocx).abs().max((ncy - ocy).abs()) < self.cfg.move_threshold
    }

    fn expire(&mut self, now: jiff::Timestamp) {
        let cutoff = self.cfg.remember_time;
        for slot in &mut self.slots {
            if let Some(c) = slot {
                if (now.as_second() - c.last_seen.as_second()) > cutoff {
                    debug!(class = %c.class, "forgetting object");
                    *slot = None;
                }
            }
        }
    }

    fn insert(&mut self, c: Cluster) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = Some(c);
                i
            }
            None => {
                self.slots.push(Some(c));
                self.slots.len() - 1
            }
        }
    }
}

/// Symmetric size similarity of two boxes in percent: 100 means identical
/// height and width, 0 means totally different.
fn size_similarity(a: &BBox, b: &BBox) -> f64 {
    let dh = rel_change(a.height(), b.height());
    let dw = rel_change(a.width(), b.width());
    ((1.0 - (dh + dw) / 2.0) * 100.0).max(0.0)
}

fn rel_change(a: i64, b: i64) -> f64 {
    let m = a.max(b);
    if m == 0 {
        return 0.0;
    }
    (a - b).abs() as f64 / m as f64
}
