// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Draws detection results onto a frame and writes it as JPEG.

use std::io::BufWriter;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use base::{err, Error};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::debug;

const POLYGON_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LABEL_SCALE: f32 = 16.0;

/// Draws the detection polygon and per-object boxes + labels on `input`,
/// writing the result to `output` (which may equal `input`).
pub fn annotate(
    input: &Path,
    output: &Path,
    report: &crate::json::DetectionReport,
    polygon: &[[i64; 2]],
    brush_size: u32,
    jpeg_quality: u8,
    font_path: Option<&Path>,
) -> Result<(), Error> {
    let mut img = ImageReader::open(input)
        .map_err(|e| err!(NotFound, msg("open {}", input.display()), source(e)))?
        .with_guessed_format()
        .map_err(|e| err!(InvalidArgument, msg("sniff {}", input.display()), source(e)))?
        .decode()
        .map_err(|e| err!(InvalidArgument, msg("decode {}", input.display()), source(e)))?
        .to_rgb8();

    draw_polygon(&mut img, polygon);

    let font = match font_path {
        Some(p) => match std::fs::read(p).map(FontVec::try_from_vec) {
            Ok(Ok(f)) => Some(f),
            _ => {
                debug!(path = %p.display(), "label font unavailable, boxes only");
                None
            }
        },
        None => None,
    };

    for (i, d) in report.objects.iter().enumerate() {
        // Shades get lighter per object so overlapping boxes stay readable.
        let c = (20 * i as u32).min(200) as u8;
        let color = Rgb([255, c, c]);
        draw_box(&mut img, d, color, brush_size);
        if let Some(font) = &font {
            let x = (d.bbox.x2() + 3).clamp(0, i64::from(img.width().saturating_sub(1))) as i32;
            let y = d.bbox.y1().clamp(0, i64::from(img.height().saturating_sub(1))) as i32;
            draw_text_mut(&mut img, color, x, y, PxScale::from(LABEL_SCALE), font, &d.class);
            let score = format!("{}%", (d.score * 100.0).round());
            draw_text_mut(
                &mut img,
                color,
                x,
                y + LABEL_SCALE as i32,
                PxScale::from(LABEL_SCALE),
                font,
                &score,
            );
        }
    }

    let f = std::fs::File::create(output)
        .map_err(|e| err!(Unknown, msg("create {}", output.display()), source(e)))?;
    let enc = JpegEncoder::new_with_quality(BufWriter::new(f), jpeg_quality);
    img.write_with_encoder(enc)
        .map_err(|e| err!(Unknown, msg("encode {}", output.display()), source(e)))?;
    Ok(())
}

fn draw_polygon(img: &mut RgbImage, polygon: &[[i64; 2]]) {
    if polygon.len() < 3 {
        return;
    }
    for (a, b) in polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .take(polygon.len())
    {
        draw_line_segment_mut(
            img,
            (a[0] as f32, a[1] as f32),
            (b[0] as f32, b[1] as f32),
            POLYGON_COLOR,
        );
    }
}

fn draw_box(img: &mut RgbImage, d: &crate::json::Detection, color: Rgb<u8>, brush_size: u32) {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    for t in 0..i64::from(brush_size) {
        let x1 = (d.bbox.x1() - t).clamp(0, w - 1);
        let y1 = (d.bbox.y1() - t).clamp(0, h - 1);
        let x2 = (d.bbox.x2() + t).clamp(0, w - 1);
        let y2 = (d.bbox.y2() + t).clamp(0, h - 1);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        let rect = Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{BBox, Detection, DetectionReport};

    fn frame(dir: &Path) -> std::path::PathBuf {
        let img = RgbImage::from_pixel(120, 80, Rgb([10, 10, 10]));
        let path = dir.join("cam0_1_1.obj.found");
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, bytes.into_inner()).unwrap();
        path
    }

    #[test]
    fn annotated_jpeg_keeps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let input = frame(dir.path());
        let output = dir.path().join("painted.jpg");
        let report = DetectionReport::ok(vec![Detection {
            class: "person".to_owned(),
            score: 0.91,
            bbox: BBox([10, 20, 60, 100]),
            in_memory: false,
            cluster: None,
        }]);
        annotate(
            &input,
            &output,
            &report,
            &[[0, 0], [119, 0], [119, 79]],
            2,
            90,
            None,
        )
        .unwrap();
        let out = image::open(&output).unwrap();
        assert_eq!((out.width(), out.height()), (120, 80));
        // Input untouched when the target differs.
        let original = ImageReader::open(&input)
            .unwrap()
            .with_guessed_format()
            .unwrap();
        assert_eq!(original.format(), Some(image::ImageFormat::Png));
    }

    #[test]
    fn out_of_bounds_boxes_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let input = frame(dir.path());
        let output = dir.path().join("painted.jpg");
        let report = DetectionReport::ok(vec![Detection {
            class: "truck".to_owned(),
            score: 0.6,
            bbox: BBox([-50, -50, 500, 500]),
            in_memory: false,
            cluster: None,
        }]);
        annotate(&input, &output, &report, &[], 3, 80, None).unwrap();
        assert!(output.exists());
    }
}
