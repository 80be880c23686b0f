//! JPEG evidence of raised alarms, with the zone outline burned in.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::BufWriter,
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, Utc};
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use ml_core::Point;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::{
    alarm::AlarmKind,
    alert::{AlarmTransition, AlertEvent, AlertHandler},
    audit::sanitize,
};

type RgbImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

const JPEG_QUALITY: u8 = 85;
const OUTLINE_THICKNESS: i32 = 3;

fn outline_color(kind: AlarmKind) -> Rgb<u8> {
    match kind {
        AlarmKind::Person => Rgb([255, 255, 0]),
        AlarmKind::Coal => Rgb([255, 0, 0]),
    }
}

pub struct SnapshotWriter {
    dir: PathBuf,
    throttle: Duration,
    last_saved: HashMap<(String, AlarmKind), DateTime<Utc>>,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, throttle: Duration) -> Self {
        Self {
            dir: dir.into(),
            throttle,
            last_saved: HashMap::new(),
        }
    }

    /// `<dir>/<YYYYMMDD>/<type>_<camera>_<YYYYMMDD_HHMMSS_micros>.jpg`, local time.
    pub fn path_for(&self, kind: AlarmKind, camera: &str, at: DateTime<Utc>) -> PathBuf {
        let local = at.with_timezone(&Local);
        self.dir.join(local.format("%Y%m%d").to_string()).join(format!(
            "{}_{}_{}.jpg",
            kind.label(),
            sanitize(camera),
            local.format("%Y%m%d_%H%M%S_%6f")
        ))
    }

    /// Save the frame behind a raise. Returns the written path, or `None`
    /// when throttled or there is no frame.
    pub fn save(&mut self, transition: &AlarmTransition) -> Result<Option<PathBuf>> {
        let Some(frame) = transition.frame.as_deref() else {
            return Ok(None);
        };
        let key = (transition.camera.to_string(), transition.kind);
        if let Some(last) = self.last_saved.get(&key) {
            if (transition.at - *last)
                .to_std()
                .is_ok_and(|gap| gap < self.throttle)
            {
                return Ok(None);
            }
        }

        let mut image = to_rgb(frame)?;
        draw_polygon(&mut image, &transition.roi, outline_color(transition.kind));

        let path = self.path_for(transition.kind, &transition.camera, transition.at);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY)
            .encode_image(&image)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;

        self.last_saved.insert(key, transition.at);
        debug!(camera = %transition.camera, path = %path.display(), "alarm snapshot saved");
        Ok(Some(path))
    }
}

impl AlertHandler for SnapshotWriter {
    fn handle(&mut self, event: &AlertEvent) {
        let AlertEvent::Transition(transition) = event else {
            return;
        };
        if !transition.current {
            return;
        }
        if let Err(err) = self.save(transition) {
            warn!(camera = %transition.camera, "failed to save alarm snapshot: {err:#}");
        }
    }
}

fn to_rgb(frame: &Frame) -> Result<RgbImage> {
    if frame.data.len() != frame.expected_len() {
        return Err(anyhow!(
            "frame buffer is {} bytes, expected {}",
            frame.data.len(),
            frame.expected_len()
        ));
    }
    let rgb: Vec<u8> = frame
        .data
        .chunks_exact(3)
        .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
        .collect();
    ImageBuffer::from_vec(frame.width(), frame.height(), rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

fn draw_polygon(image: &mut RgbImage, points: &[Point], color: Rgb<u8>) {
    if points.len() < 2 {
        return;
    }
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        draw_line(image, *a, b, color);
    }
}

fn draw_line(image: &mut RgbImage, a: Point, b: Point, color: Rgb<u8>) {
    let Some(((x0, y0), (x1, y1))) = clip_segment(a, b, image.width(), image.height()) else {
        return;
    };
    let (mut x0, mut y0) = (x0.round() as i32, y0.round() as i32);
    let (x1, y1) = (x1.round() as i32, y1.round() as i32);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        stamp(image, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Liang-Barsky clip of `a`-`b` to the pixel grid. `None` when the segment
/// misses the image or has a non-finite end.
fn clip_segment(a: Point, b: Point, width: u32, height: u32) -> Option<((f64, f64), (f64, f64))> {
    let (ax, ay, bx, by) = (
        f64::from(a.x),
        f64::from(a.y),
        f64::from(b.x),
        f64::from(b.y),
    );
    if width == 0 || height == 0 || ![ax, ay, bx, by].iter().all(|v| v.is_finite()) {
        return None;
    }
    let (xmax, ymax) = (f64::from(width - 1), f64::from(height - 1));
    let (dx, dy) = (bx - ax, by - ay);
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in [(-dx, ax), (dx, xmax - ax), (-dy, ay), (dy, ymax - ay)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some(((ax + t0 * dx, ay + t0 * dy), (ax + t1 * dx, ay + t1 * dy)))
}

fn stamp(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let half = OUTLINE_THICKNESS / 2;
    for py in (y - half)..=(y + half) {
        for px in (x - half)..=(x + half) {
            if px >= 0 && px < width && py >= 0 && py < height {
                *image.get_pixel_mut(px as u32, py as u32) = color;
            }
        }
    }
}
