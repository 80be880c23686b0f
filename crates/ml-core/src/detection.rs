/// Pixel coordinate in frame space. Sub-pixel values are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

/// Region a detection covers.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Axis-aligned box given by its top-left and bottom-right corners.
    Box { min: Point, max: Point },
    /// Closed outline, for segmentation output.
    Polygon(Vec<Point>),
}

impl Shape {
    /// Box from centre and size, the layout most detectors emit.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Shape::Box {
            min: Point::new(cx - w / 2.0, cy - h / 2.0),
            max: Point::new(cx + w / 2.0, cy + h / 2.0),
        }
    }

    /// Area centroid. Collinear outlines fall back to the vertex mean;
    /// an empty polygon has none.
    pub fn centroid(&self) -> Option<Point> {
        match self {
            Shape::Box { min, max } => Some(Point::new(
                (min.x + max.x) / 2.0,
                (min.y + max.y) / 2.0,
            )),
            Shape::Polygon(points) => polygon_centroid(points),
        }
    }

    /// Outline as a vertex list; boxes are returned clockwise from top-left.
    pub fn outline(&self) -> Vec<Point> {
        match self {
            Shape::Box { min, max } => vec![
                *min,
                Point::new(max.x, min.y),
                *max,
                Point::new(min.x, max.y),
            ],
            Shape::Polygon(points) => points.clone(),
        }
    }
}

fn polygon_centroid(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let mut twice_area = 0.0f64;
    let (mut cx, mut cy) = (0.0f64, 0.0f64);
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        let cross = f64::from(a.x) * f64::from(b.y) - f64::from(b.x) * f64::from(a.y);
        twice_area += cross;
        cx += (f64::from(a.x) + f64::from(b.x)) * cross;
        cy += (f64::from(a.y) + f64::from(b.y)) * cross;
    }
    if twice_area.abs() < 1e-9 {
        let n = points.len() as f32;
        let (sx, sy) = points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        return Some(Point::new(sx / n, sy / n));
    }
    let scale = 1.0 / (3.0 * twice_area);
    Some(Point::new((cx * scale) as f32, (cy * scale) as f32))
}

/// One labelled region reported by a scorer for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub class_id: i64,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub shape: Shape,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, shape: Shape) -> Self {
        Self {
            label: label.into(),
            class_id: 0,
            confidence: confidence.clamp(0.0, 1.0),
            shape,
        }
    }

    pub fn with_class_id(mut self, class_id: i64) -> Self {
        self.class_id = class_id;
        self
    }
}
