//! Instance segmentation masks to polygon outlines.
//!
//! Masks arrive as a probability grid (the prototype resolution of a
//! segmentation head). A mask is binarised, cropped to its detection box,
//! reduced to its largest 4-connected region and traced along pixel edges,
//! so the outline encloses exactly the kept cells. Holes are not traced.

use crate::{Point, Shape};

/// Probabilities for one instance, row-major `width x height`.
#[derive(Debug, Clone, Copy)]
pub struct InstanceMask<'a> {
    pub probs: &'a [f32],
    pub width: usize,
    pub height: usize,
}

impl InstanceMask<'_> {
    /// Outline of the largest region at or above `threshold` whose cell
    /// centres fall inside `crop` (grid units), scaled by `scale` into frame
    /// pixels. `None` when no cell qualifies.
    pub fn outline(&self, threshold: f32, crop: (Point, Point), scale: (f32, f32)) -> Option<Shape> {
        let (width, height) = (self.width, self.height);
        if width == 0 || height == 0 || self.probs.len() != width * height {
            return None;
        }
        let (lo, hi) = crop;
        let mask: Vec<bool> = self
            .probs
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let cx = (i % width) as f32 + 0.5;
                let cy = (i / width) as f32 + 0.5;
                p >= threshold && cx >= lo.x && cx <= hi.x && cy >= lo.y && cy <= hi.y
            })
            .collect();
        let region = largest_region(&mask, width, height);
        let corners = trace_outline(&region, width, height)?;
        let (sx, sy) = scale;
        Some(Shape::Polygon(
            corners
                .into_iter()
                .map(|(x, y)| Point::new(x as f32 * sx, y as f32 * sy))
                .collect(),
        ))
    }
}

/// Cells of the largest 4-connected region of `mask`. Ties keep the first
/// region in raster order.
fn largest_region(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let mut seen = vec![false; mask.len()];
    let mut best: Vec<usize> = Vec::new();
    let mut stack = Vec::new();
    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        let mut members = Vec::new();
        seen[start] = true;
        stack.push(start);
        while let Some(i) = stack.pop() {
            members.push(i);
            let (x, y) = (i % width, i / width);
            let neighbours = [
                (x > 0).then(|| i - 1),
                (x + 1 < width).then(|| i + 1),
                (y > 0).then(|| i - width),
                (y + 1 < height).then(|| i + width),
            ];
            for j in neighbours.into_iter().flatten() {
                if mask[j] && !seen[j] {
                    seen[j] = true;
                    stack.push(j);
                }
            }
        }
        if members.len() > best.len() {
            best = members;
        }
    }
    let mut region = vec![false; mask.len()];
    for i in best {
        region[i] = true;
    }
    region
}

/// Headings in clockwise order for a y-down grid: east, south, west, north.
const STEPS: [(i64, i64); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

/// Corner vertices of the outer boundary of a single 4-connected region,
/// walked clockwise along cell edges with the region on the right.
fn trace_outline(region: &[bool], width: usize, height: usize) -> Option<Vec<(i64, i64)>> {
    let start = region.iter().position(|&v| v)?;
    let origin = ((start % width) as i64, (start / width) as i64);
    let inside = |(x, y): (i64, i64)| {
        x >= 0
            && y >= 0
            && (x as usize) < width
            && (y as usize) < height
            && region[y as usize * width + x as usize]
    };

    let (mut x, mut y) = origin;
    let mut heading = 0usize;
    let mut corners = vec![origin];
    // Every cell edge is walked at most once.
    let limit = 4 * (width + 1) * (height + 1);
    for _ in 0..limit {
        let (ahead_left, ahead_right) = match heading {
            0 => ((x, y - 1), (x, y)),
            1 => ((x, y), (x - 1, y)),
            2 => ((x - 1, y), (x - 1, y - 1)),
            _ => ((x - 1, y - 1), (x, y - 1)),
        };
        let next = if !inside(ahead_right) {
            (heading + 1) % 4
        } else if inside(ahead_left) {
            (heading + 3) % 4
        } else {
            heading
        };
        if next != heading && (x, y) != origin {
            corners.push((x, y));
        }
        heading = next;
        x += STEPS[heading].0;
        y += STEPS[heading].1;
        if (x, y) == origin {
            return Some(corners);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&str]) -> (Vec<f32>, usize, usize) {
        let width = rows[0].len();
        let probs = rows
            .iter()
            .flat_map(|row| row.chars().map(|c| if c == '#' { 0.9 } else { 0.1 }))
            .collect();
        (probs, width, rows.len())
    }

    fn outline(rows: &[&str], crop: (Point, Point), scale: (f32, f32)) -> Option<Vec<(f32, f32)>> {
        let (probs, width, height) = grid(rows);
        let mask = InstanceMask {
            probs: &probs,
            width,
            height,
        };
        match mask.outline(0.5, crop, scale)? {
            Shape::Polygon(points) => Some(points.into_iter().map(|p| (p.x, p.y)).collect()),
            Shape::Box { .. } => None,
        }
    }

    fn everything() -> (Point, Point) {
        (Point::new(0.0, 0.0), Point::new(1.0e6, 1.0e6))
    }

    #[test]
    fn block_traces_to_its_four_corners() {
        let points = outline(&["....", ".##.", ".##.", "...."], everything(), (1.0, 1.0)).unwrap();
        assert_eq!(points, vec![(1.0, 1.0), (3.0, 1.0), (3.0, 3.0), (1.0, 3.0)]);
    }

    #[test]
    fn concave_region_keeps_its_notch() {
        let points = outline(&["#.", "##"], everything(), (1.0, 1.0)).unwrap();
        assert_eq!(
            points,
            vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (0.0, 2.0)]
        );
        let shape = Shape::Polygon(points.iter().map(|&(x, y)| Point::new(x, y)).collect());
        let centroid = shape.centroid().unwrap();
        assert!((centroid.x - 5.0 / 6.0).abs() < 1e-4);
        assert!((centroid.y - 7.0 / 6.0).abs() < 1e-4);
    }

    #[test]
    fn largest_region_wins_and_diagonals_do_not_connect() {
        let points = outline(&["#...", ".#.#", "...#"], everything(), (1.0, 1.0)).unwrap();
        assert_eq!(points, vec![(3.0, 1.0), (4.0, 1.0), (4.0, 3.0), (3.0, 3.0)]);
    }

    #[test]
    fn crop_and_scale_apply() {
        let rows = ["####", "####"];
        let crop = (Point::new(0.0, 0.0), Point::new(2.0, 2.0));
        let points = outline(&rows, crop, (10.0, 5.0)).unwrap();
        assert_eq!(points, vec![(0.0, 0.0), (20.0, 0.0), (20.0, 10.0), (0.0, 10.0)]);
    }

    #[test]
    fn empty_or_mismatched_masks_have_no_outline() {
        assert!(outline(&["...", "..."], everything(), (1.0, 1.0)).is_none());
        let mask = InstanceMask {
            probs: &[0.9; 5],
            width: 2,
            height: 2,
        };
        assert!(mask.outline(0.5, everything(), (1.0, 1.0)).is_none());
    }
}
