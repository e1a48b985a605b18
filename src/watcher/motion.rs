// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Motion detection over a sliding background window.
//!
//! Each sampled frame is grayscaled, downscaled, and diffed against a
//! randomly chosen background frame (never the newest two, so a slowly moving
//! subject can't hide by becoming its own background). Two decision modes:
//! contour analysis of the thresholded difference, or plain standard
//! deviation. Debounce counters require several changed frames in a row
//! before motion is asserted.

use std::collections::VecDeque;
use std::path::Path;

use base::{err, Error};
use image::{GrayImage, ImageReader};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use imageproc::point::Point;
use rand::Rng;
use tracing::debug;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MotionVerdict {
    Motion,
    NoMotion,
    /// Not enough background yet, or the frame was too noisy to judge.
    Indeterminate,
}

/// A contour-area bound: absolute pixels or percent of the (scaled) frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AreaBound {
    Pixels(u64),
    Percent(f64),
}

impl AreaBound {
    fn resolve(&self, height: u32, width: u32) -> f64 {
        match *self {
            AreaBound::Pixels(px) => px as f64,
            AreaBound::Percent(pct) => pct * f64::from(height) * f64::from(width) / 100.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContourConfig {
    pub min_area: AreaBound,
    pub max_area: AreaBound,
    /// More contours than this means interference (rain, snow, ..); the frame
    /// is discarded as indeterminate.
    pub max_count: usize,
}

#[derive(Clone, Debug)]
pub struct MotionConfig {
    pub enabled: bool,
    pub max_image_height: u32,
    pub max_image_width: u32,
    pub bg_frame_count: usize,
    /// Per-pixel difference above which a pixel counts as changed.
    pub threshold: u8,
    /// Standard-deviation bound for the non-contour mode, and for the
    /// background-poisoning check.
    pub diff_threshold: f64,
    pub min_frames_changes: u32,
    pub max_frames_static: u32,
    pub contour: Option<ContourConfig>,
    pub object_watch_delay: std::time::Duration,
    pub object_throttling: u32,
}

pub struct MotionDetector {
    cfg: MotionConfig,
    scale: Option<f64>,
    contour_bounds: Option<(f64, f64)>,
    backgrounds: VecDeque<GrayImage>,
    last_background: Option<GrayImage>,
    frames_changed: u32,
    frames_static: u32,
}

impl MotionDetector {
    pub fn new(cfg: MotionConfig) -> Self {
        MotionDetector {
            cfg,
            scale: None,
            contour_bounds: None,
            backgrounds: VecDeque::new(),
            last_background: None,
            frames_changed: 0,
            frames_static: 0,
        }
    }

    /// Feeds one frame file and returns the (debounced) motion decision.
    pub fn detect(&mut self, path: &Path) -> Result<MotionVerdict, Error> {
        let img = ImageReader::open(path)
            .map_err(|e| err!(NotFound, msg("open {}", path.display()), source(e)))?
            .with_guessed_format()
            .map_err(|e| err!(InvalidArgument, msg("sniff {}", path.display()), source(e)))?
            .decode()
            .map_err(|e| err!(InvalidArgument, msg("decode {}", path.display()), source(e)))?;
        let gray = img.to_luma8();
        let (w, h) = gray.dimensions();

        let scale = *self.scale.get_or_insert_with(|| {
            (f64::from(self.cfg.max_image_height) / f64::from(h))
                .min(f64::from(self.cfg.max_image_width) / f64::from(w))
                .min(1.0)
        });
        let frame = if scale < 1.0 {
            let sw = ((f64::from(w) * scale).floor() as u32).max(1);
            let sh = ((f64::from(h) * scale).floor() as u32).max(1);
            image::imageops::resize(&gray, sw, sh, image::imageops::FilterType::Triangle)
        } else {
            gray
        };

        // A geometry change (camera reconfigured) invalidates the background.
        if let Some(back) = self.backgrounds.back() {
            if back.dimensions() != frame.dimensions() {
                debug!("frame geometry changed, resetting background");
                self.backgrounds.clear();
                self.last_background = None;
            }
        }
        self.backgrounds.push_back(frame);
        while self.backgrounds.len() > self.cfg.bg_frame_count {
            self.backgrounds.pop_front();
        }
        if self.backgrounds.len() < 2 {
            return Ok(MotionVerdict::Indeterminate);
        }

        let pick = if self.backgrounds.len() <= 2 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.backgrounds.len() - 2)
        };
        let prev = &self.backgrounds[pick];
        let newest = self.backgrounds.back().expect("nonempty");
        let diff = absdiff(prev, newest);

        let raw_motion = if let Some(contour_cfg) = &self.cfg.contour {
            let (sh, sw) = {
                let (w, h) = newest.dimensions();
                (h, w)
            };
            let (min_area, max_area) = *self.contour_bounds.get_or_insert_with(|| {
                (
                    contour_cfg.min_area.resolve(sh, sw),
                    contour_cfg.max_area.resolve(sh, sw),
                )
            });
            let binary = threshold(&diff, self.cfg.threshold);
            let dilated = dilate(&binary, Norm::LInf, 1);
            let contours = find_contours::<i32>(&dilated);
            let outer = contours
                .iter()
                .filter(|c| c.border_type == BorderType::Outer)
                .count();
            if outer > contour_cfg.max_count {
                debug!(contours = outer, max = contour_cfg.max_count, "too noisy, skipping");
                self.backgrounds.pop_back();
                return Ok(MotionVerdict::Indeterminate);
            }
            let largest = contours
                .iter()
                .filter(|c| c.border_type == BorderType::Outer)
                .map(|c| contour_area(&c.points))
                .fold(0.0f64, f64::max);
            largest >= min_area && largest <= max_area
        } else {
            stddev(&diff) > self.cfg.diff_threshold
        };

        if raw_motion {
            self.background_check();
            self.frames_changed += 1;
            self.frames_static = 0;
            debug!(
                changed = self.frames_changed,
                needed = self.cfg.min_frames_changes,
                "frame changed"
            );
            if self.frames_changed >= self.cfg.min_frames_changes {
                Ok(MotionVerdict::Motion)
            } else {
                Ok(MotionVerdict::NoMotion)
            }
        } else {
            self.frames_static += 1;
            if self.frames_static >= self.cfg.max_frames_static && self.frames_changed > 0 {
                debug!(changed = self.frames_changed, "scene static again, resetting");
                self.frames_changed = 0;
            }
            Ok(MotionVerdict::NoMotion)
        }
    }

    /// Keeps a moving subject from poisoning the background: if the newest
    /// background frame differs sharply from the previous newest, it is
    /// dropped from the ring.
    fn background_check(&mut self) {
        let newest = match self.backgrounds.back() {
            Some(n) => n.clone(),
            None => return,
        };
        let last = match self.last_background.replace(newest.clone()) {
            Some(l) => l,
            None => return,
        };
        if last.dimensions() != newest.dimensions() {
            return;
        }
        if stddev(&absdiff(&last, &newest)) > self.cfg.diff_threshold {
            self.backgrounds.pop_back();
        }
    }
}

fn absdiff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let mut out = GrayImage::new(a.width(), a.height());
    for ((pa, pb), po) in a.pixels().zip(b.pixels()).zip(out.pixels_mut()) {
        po.0[0] = pa.0[0].abs_diff(pb.0[0]);
    }
    out
}

fn threshold(img: &GrayImage, t: u8) -> GrayImage {
    let mut out = GrayImage::new(img.width(), img.height());
    for (p, po) in img.pixels().zip(out.pixels_mut()) {
        po.0[0] = if p.0[0] > t { 255 } else { 0 };
    }
    out
}

fn stddev(img: &GrayImage) -> f64 {
    let n = (img.width() as u64 * img.height() as u64) as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for p in img.pixels() {
        let v = f64::from(p.0[0]);
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

/// Shoelace area of a closed contour.
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for (a, b) in points.iter().zip(points.iter().cycle().skip(1)).take(points.len()) {
        acc += i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y);
    }
    (acc.abs() as f64) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg(min_frames_changes: u32, contour: Option<ContourConfig>) -> MotionConfig {
        MotionConfig {
            enabled: true,
            max_image_height: 128,
            max_image_width: 128,
            bg_frame_count: 5,
            threshold: 15,
            diff_threshold: 5.0,
            min_frames_changes,
            max_frames_static: 3,
            contour,
            object_watch_delay: Duration::from_millis(500),
            object_throttling: 10,
        }
    }

    fn square_frame(dir: &Path, n: u32, x: u32, y: u32) -> std::path::PathBuf {
        let img = GrayImage::from_fn(64, 64, |px, py| {
            if px >= x && px < x + 12 && py >= y && py < y + 12 {
                image::Luma([255u8])
            } else {
                image::Luma([0u8])
            }
        });
        // Frames arrive under their rendezvous tag; format is sniffed, not
        // taken from the extension.
        let path = dir.join(format!("cam0_{n}_{n}.wch"));
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, bytes.into_inner()).unwrap();
        path
    }

    fn noise_frame(dir: &Path, n: u32, seed: u32) -> std::path::PathBuf {
        // Deterministic speckle: scattered single white pixels.
        let img = GrayImage::from_fn(64, 64, |px, py| {
            if (px * 7 + py * 13 + seed) % 37 == 0 {
                image::Luma([255u8])
            } else {
                image::Luma([0u8])
            }
        });
        let path = dir.join(format!("cam0_{n}_{n}.wch"));
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, bytes.into_inner()).unwrap();
        path
    }

    #[test]
    fn moving_square_asserts_motion_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let contour = ContourConfig {
            min_area: AreaBound::Pixels(20),
            max_area: AreaBound::Percent(50.0),
            max_count: 10,
        };
        let mut d = MotionDetector::new(cfg(2, Some(contour)));

        let f1 = square_frame(dir.path(), 1, 0, 0);
        assert_eq!(d.detect(&f1).unwrap(), MotionVerdict::Indeterminate);
        let f2 = square_frame(dir.path(), 2, 20, 20);
        assert_eq!(d.detect(&f2).unwrap(), MotionVerdict::NoMotion); // 1 < 2 changed
        let f3 = square_frame(dir.path(), 3, 35, 35);
        assert_eq!(d.detect(&f3).unwrap(), MotionVerdict::Motion);
    }

    #[test]
    fn static_scene_never_asserts_motion() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = MotionDetector::new(cfg(1, None));
        for n in 0..6 {
            let f = square_frame(dir.path(), n, 10, 10);
            let v = d.detect(&f).unwrap();
            assert_ne!(v, MotionVerdict::Motion, "frame {n}");
        }
    }

    #[test]
    fn speckle_noise_is_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        let contour = ContourConfig {
            min_area: AreaBound::Pixels(4),
            max_area: AreaBound::Percent(50.0),
            max_count: 5,
        };
        let mut d = MotionDetector::new(cfg(1, Some(contour)));
        let f1 = noise_frame(dir.path(), 1, 0);
        assert_eq!(d.detect(&f1).unwrap(), MotionVerdict::Indeterminate);
        let before = d.backgrounds.len();
        let f2 = noise_frame(dir.path(), 2, 5);
        assert_eq!(d.detect(&f2).unwrap(), MotionVerdict::Indeterminate);
        // The noisy frame was discarded from the background ring.
        assert_eq!(d.backgrounds.len(), before);
    }

    #[test]
    fn area_bound_resolution() {
        assert_eq!(AreaBound::Pixels(300).resolve(100, 100), 300.0);
        assert_eq!(AreaBound::Percent(50.0).resolve(100, 200), 10_000.0);
    }

    #[test]
    fn contour_area_of_square() {
        let pts = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(contour_area(&pts), 100.0);
        assert_eq!(contour_area(&pts[..2]), 0.0);
    }
}
