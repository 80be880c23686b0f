//! Region-of-interest geometry.
//!
//! ROIs are drawn once against a reference resolution and scaled linearly to
//! whatever resolution the camera actually delivers. An ROI with fewer than
//! three points or no area after scaling never triggers.

use ml_core::{Point, Shape};
use thiserror::Error;
use video_ingest::Resolution;

/// Areas below this many square pixels count as empty.
const MIN_AREA: f32 = 1e-3;

#[derive(Debug, Error, PartialEq)]
pub enum RoiError {
    #[error("ROI needs at least 3 points, got {0}")]
    TooFewPoints(usize),
    #[error("ROI point {index} is not finite")]
    NonFinite { index: usize },
    #[error("ROI reference resolution {0} is empty")]
    EmptyReference(Resolution),
}

/// ROI as configured, in reference-resolution pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiPolygon {
    points: Vec<Point>,
    reference: Resolution,
}

impl RoiPolygon {
    pub fn new(points: Vec<Point>, reference: Resolution) -> Result<Self, RoiError> {
        if reference.is_empty() {
            return Err(RoiError::EmptyReference(reference));
        }
        if points.len() < 3 {
            return Err(RoiError::TooFewPoints(points.len()));
        }
        if let Some(index) = points
            .iter()
            .position(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(RoiError::NonFinite { index });
        }
        Ok(Self { points, reference })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn reference(&self) -> Resolution {
        self.reference
    }

    pub fn scaled_to(&self, target: Resolution) -> ScaledRoi {
        ScaledRoi::new(scale(&self.points, self.reference, target))
    }
}

/// Linear per-axis scaling between resolutions.
pub fn scale(points: &[Point], from: Resolution, to: Resolution) -> Vec<Point> {
    if from.is_empty() {
        return Vec::new();
    }
    let sx = to.width as f32 / from.width as f32;
    let sy = to.height as f32 / from.height as f32;
    points
        .iter()
        .map(|p| Point::new(p.x * sx, p.y * sy))
        .collect()
}

/// ROI in frame pixels, ready for testing detections.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledRoi {
    points: Vec<Point>,
    area: f32,
}

impl ScaledRoi {
    pub fn new(points: Vec<Point>) -> Self {
        let area = polygon_area(&points);
        Self { points, area }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn area(&self) -> f32 {
        self.area
    }

    pub fn is_degenerate(&self) -> bool {
        self.points.len() < 3 || self.area < MIN_AREA
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, point: Point) -> bool {
        if self.is_degenerate() {
            return false;
        }
        let mut inside = false;
        let n = self.points.len();
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + n - 1) % n];
            if (a.y > point.y) != (b.y > point.y) {
                let x = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if point.x < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Whether the centre of `shape` falls inside the ROI.
    pub fn contains_centroid(&self, shape: &Shape) -> bool {
        shape.centroid().is_some_and(|c| self.contains(c))
    }

    /// Fraction of the ROI covered by the union of `regions`, in `[0, 1]`.
    ///
    /// Sampled on pixel-row centres within `frame`, so overlapping regions
    /// are not double counted.
    pub fn mask_fraction<'a>(
        &self,
        regions: impl IntoIterator<Item = &'a Shape>,
        frame: Resolution,
    ) -> f32 {
        if self.is_degenerate() || frame.is_empty() {
            return 0.0;
        }
        let regions: Vec<&Shape> = regions.into_iter().collect();
        let (min_y, max_y) = self
            .points
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.y), hi.max(p.y))
            });
        let first_row = min_y.floor().max(0.0) as u32;
        let last_row = (max_y.ceil().max(0.0) as u32).min(frame.height);
        let width = frame.width as f32;

        let mut roi_len = 0.0f64;
        let mut covered = 0.0f64;
        let mut roi_spans = Vec::new();
        let mut hit_spans = Vec::new();
        for row in first_row..last_row {
            let y = row as f32 + 0.5;
            roi_spans.clear();
            polygon_spans(&self.points, y, &mut roi_spans);
            clip_spans(&mut roi_spans, width);
            if roi_spans.is_empty() {
                continue;
            }
            hit_spans.clear();
            for region in &regions {
                shape_spans(region, y, &mut hit_spans);
            }
            clip_spans(&mut hit_spans, width);
            merge_spans(&mut hit_spans);

            for &(start, end) in &roi_spans {
                roi_len += f64::from(end - start);
                for &(hit_start, hit_end) in &hit_spans {
                    let overlap = end.min(hit_end) - start.max(hit_start);
                    if overlap > 0.0 {
                        covered += f64::from(overlap);
                    }
                }
            }
        }
        if roi_len <= 0.0 {
            return 0.0;
        }
        (covered / roi_len).clamp(0.0, 1.0) as f32
    }
}

fn polygon_area(points: &[Point]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| f64::from(a.x) * f64::from(b.y) - f64::from(b.x) * f64::from(a.y))
        .sum();
    (twice.abs() / 2.0) as f32
}

/// Horizontal spans of `points` (even-odd) crossing the line at `y`.
fn polygon_spans(points: &[Point], y: f32, out: &mut Vec<(f32, f32)>) {
    let n = points.len();
    if n < 3 {
        return;
    }
    let mut crossings = Vec::new();
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        if (a.y <= y) != (b.y <= y) {
            crossings.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
        }
    }
    crossings.sort_by(f32::total_cmp);
    out.extend(crossings.chunks_exact(2).map(|pair| (pair[0], pair[1])));
}

fn shape_spans(shape: &Shape, y: f32, out: &mut Vec<(f32, f32)>) {
    match shape {
        Shape::Box { min, max } => {
            let (top, bottom) = (min.y.min(max.y), min.y.max(max.y));
            if y >= top && y < bottom {
                out.push((min.x.min(max.x), min.x.max(max.x)));
            }
        }
        Shape::Polygon(points) => polygon_spans(points, y, out),
    }
}

fn clip_spans(spans: &mut Vec<(f32, f32)>, width: f32) {
    spans.retain_mut(|(start, end)| {
        *start = start.max(0.0);
        *end = end.min(width);
        *end > *start
    });
}

/// Sort and merge overlapping spans in place.
fn merge_spans(spans: &mut Vec<(f32, f32)>) {
    spans.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut merged: Vec<(f32, f32)> = Vec::with_capacity(spans.len());
    for &(start, end) in spans.iter() {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    *spans = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(size: f32) -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(size, 0.0),
            Point::new(size, size),
            Point::new(0.0, size),
        ]
    }

    fn boxed(x0: f32, y0: f32, x1: f32, y1: f32) -> Shape {
        Shape::Box {
            min: Point::new(x0, y0),
            max: Point::new(x1, y1),
        }
    }

    #[test]
    fn scales_each_axis_independently() {
        let roi = RoiPolygon::new(square(100.0), Resolution::new(100, 100)).unwrap();
        let scaled = roi.scaled_to(Resolution::new(1920, 1080));
        assert_eq!(scaled.points()[2], Point::new(1920.0, 1080.0));
        assert!((scaled.area() - 1920.0 * 1080.0).abs() < 1.0);
    }

    #[test]
    fn rejects_malformed_rois() {
        let reference = Resolution::new(100, 100);
        assert_eq!(
            RoiPolygon::new(square(10.0)[..2].to_vec(), reference),
            Err(RoiError::TooFewPoints(2))
        );
        assert!(matches!(
            RoiPolygon::new(square(10.0), Resolution::new(0, 100)),
            Err(RoiError::EmptyReference(_))
        ));
        let mut points = square(10.0);
        points[1].x = f32::NAN;
        assert_eq!(
            RoiPolygon::new(points, reference),
            Err(RoiError::NonFinite { index: 1 })
        );
    }

    #[test]
    fn centroid_containment() {
        let roi = ScaledRoi::new(square(100.0));
        assert!(roi.contains_centroid(&Shape::from_center(50.0, 50.0, 10.0, 10.0)));
        assert!(!roi.contains_centroid(&Shape::from_center(150.0, 50.0, 10.0, 10.0)));
        // Box overlaps the ROI but its centre does not.
        assert!(!roi.contains_centroid(&boxed(90.0, 90.0, 130.0, 130.0)));
    }

    #[test]
    fn concave_roi_excludes_the_notch() {
        let roi = ScaledRoi::new(vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(100.0, 100.0),
            Point::new(50.0, 40.0),
            Point::new(0.0, 100.0),
        ]);
        assert!(roi.contains(Point::new(50.0, 20.0)));
        assert!(!roi.contains(Point::new(50.0, 80.0)));
    }

    #[test]
    fn degenerate_rois_never_trigger() {
        let line = ScaledRoi::new(vec![
            Point::new(0.0, 0.0),
            Point::new(50.0, 50.0),
            Point::new(100.0, 100.0),
        ]);
        assert!(line.is_degenerate());
        assert!(!line.contains(Point::new(50.0, 50.0)));
        let everything = boxed(0.0, 0.0, 200.0, 200.0);
        assert_eq!(line.mask_fraction([&everything], Resolution::new(200, 200)), 0.0);

        let collapsed = RoiPolygon::new(square(100.0), Resolution::new(100, 100))
            .unwrap()
            .scaled_to(Resolution::new(0, 0));
        assert!(collapsed.is_degenerate());
    }

    #[test]
    fn mask_fraction_measures_covered_share() {
        let roi = ScaledRoi::new(square(100.0));
        let frame = Resolution::new(100, 100);
        let left = boxed(0.0, 0.0, 80.0, 100.0);
        assert!((roi.mask_fraction([&left], frame) - 0.8).abs() < 1e-4);

        let outside = boxed(120.0, 0.0, 200.0, 100.0);
        assert_eq!(roi.mask_fraction([&outside], frame), 0.0);
        assert_eq!(roi.mask_fraction(std::iter::empty(), frame), 0.0);
    }

    #[test]
    fn overlapping_regions_count_once() {
        let roi = ScaledRoi::new(square(100.0));
        let frame = Resolution::new(100, 100);
        let a = boxed(0.0, 0.0, 60.0, 100.0);
        let b = boxed(40.0, 0.0, 70.0, 100.0);
        assert!((roi.mask_fraction([&a, &b], frame) - 0.7).abs() < 1e-4);
    }

    #[test]
    fn polygon_regions_are_rasterised() {
        let roi = ScaledRoi::new(square(100.0));
        let triangle = Shape::Polygon(vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(0.0, 100.0),
        ]);
        let fraction = roi.mask_fraction([&triangle], Resolution::new(100, 100));
        assert!((fraction - 0.5).abs() < 1e-3, "{fraction}");
    }

    #[test]
    fn mask_outline_covers_less_than_its_box() {
        // Coal fills the bottom band and the left half above it.
        let mut probs = Vec::new();
        for row in 0..10 {
            let filled = if row < 6 { 5 } else { 10 };
            probs.extend((0..10).map(|col| if col < filled { 0.9 } else { 0.1 }));
        }
        let mask = ml_core::InstanceMask {
            probs: &probs,
            width: 10,
            height: 10,
        };
        let crop = (Point::new(0.0, 0.0), Point::new(10.0, 10.0));
        let outline = mask.outline(0.5, crop, (10.0, 10.0)).unwrap();
        assert!(matches!(outline, Shape::Polygon(_)));

        let roi = ScaledRoi::new(square(100.0));
        let frame = Resolution::new(100, 100);
        let fraction = roi.mask_fraction([&outline], frame);
        assert!((fraction - 0.7).abs() < 1e-3, "{fraction}");
        let bounds = boxed(0.0, 0.0, 100.0, 100.0);
        assert!((roi.mask_fraction([&bounds], frame) - 1.0).abs() < 1e-4);
    }
}
