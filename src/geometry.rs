use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

/// Polygon vertex on the pixel-corner lattice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPoint {
    pub x: i32,
    pub y: i32,
}

impl GridPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box in pixel-corner coordinates: covers `[x, x + w) x [y, y + h)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub fn of_points(points: &[GridPoint]) -> Self {
        if points.is_empty() {
            return Self {
                x: 0,
                y: 0,
                w: 0,
                h: 0,
            };
        }
        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        for p in points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Self {
            x: min_x,
            y: min_y,
            w: max_x - min_x,
            h: max_y - min_y,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn area(&self) -> f64 {
        self.w.max(0) as f64 * self.h.max(0) as f64
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.w as f64 / 2.0,
            self.y as f64 + self.h as f64 / 2.0,
        )
    }

    /// Long side over short side, at least 1.
    pub fn elongation(&self) -> f64 {
        let long = self.w.max(self.h).max(1) as f64;
        let short = self.w.min(self.h).max(1) as f64;
        long / short
    }

    pub fn expanded(&self, gap: i32) -> Self {
        Self {
            x: self.x - gap,
            y: self.y - gap,
            w: self.w + 2 * gap,
            h: self.h + 2 * gap,
        }
    }

    /// Closed-interval test, so boxes that only touch count as intersecting.
    pub fn touches(&self, other: &Self) -> bool {
        !(self.right() < other.x
            || other.right() < self.x
            || self.bottom() < other.y
            || other.bottom() < self.y)
    }

    pub fn intersection_area(&self, other: &Self) -> f64 {
        let w = (self.right().min(other.right()) - self.x.max(other.x)).max(0);
        let h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0);
        w as f64 * h as f64
    }

    pub fn union(&self, other: &Self) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Self {
            x,
            y,
            w: self.right().max(other.right()) - x,
            h: self.bottom().max(other.bottom()) - y,
        }
    }

    pub fn contains_box(&self, other: &Self) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x0 = self.x.clamp(0, width as i32);
        let y0 = self.y.clamp(0, height as i32);
        let x1 = self.right().clamp(0, width as i32);
        let y1 = self.bottom().clamp(0, height as i32);
        Self {
            x: x0,
            y: y0,
            w: (x1 - x0).max(0),
            h: (y1 - y0).max(0),
        }
    }

    pub fn corners(&self) -> Vec<GridPoint> {
        vec![
            GridPoint::new(self.x, self.y),
            GridPoint::new(self.right(), self.y),
            GridPoint::new(self.right(), self.bottom()),
            GridPoint::new(self.x, self.bottom()),
        ]
    }
}

pub fn bbox_iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let inter = a.intersection_area(b);
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

pub fn polygon_signed_area(points: &[GridPoint]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        area += a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
    }
    area * 0.5
}

pub fn polygon_area(points: &[GridPoint]) -> f64 {
    polygon_signed_area(points).abs()
}

pub fn polygon_perimeter(points: &[GridPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    (0..points.len())
        .map(|i| distance(points[i], points[(i + 1) % points.len()]))
        .sum()
}

/// Area centroid; falls back to the vertex mean for degenerate rings.
pub fn polygon_centroid(points: &[GridPoint]) -> (f64, f64) {
    let signed = polygon_signed_area(points);
    if signed.abs() < f64::EPSILON {
        return vertex_mean(points);
    }
    let mut cx = 0.0f64;
    let mut cy = 0.0f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        let cross = a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
        cx += (a.x + b.x) as f64 * cross;
        cy += (a.y + b.y) as f64 * cross;
    }
    (cx / (6.0 * signed), cy / (6.0 * signed))
}

pub fn vertex_mean(points: &[GridPoint]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let sx: f64 = points.iter().map(|p| p.x as f64).sum();
    let sy: f64 = points.iter().map(|p| p.y as f64).sum();
    (sx / n, sy / n)
}

/// Even-odd ray cast.
pub fn point_in_polygon(x: f64, y: f64, points: &[GridPoint]) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (points[i].x as f64, points[i].y as f64);
        let (xj, yj) = (points[j].x as f64, points[j].y as f64);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn distance(a: GridPoint, b: GridPoint) -> f64 {
    let dx = (a.x - b.x) as f64;
    let dy = (a.y - b.y) as f64;
    (dx * dx + dy * dy).sqrt()
}

fn perpendicular_distance(point: GridPoint, line_start: GridPoint, line_end: GridPoint) -> f64 {
    let dx = (line_end.x - line_start.x) as f64;
    let dy = (line_end.y - line_start.y) as f64;
    if dx.abs() < f64::EPSILON && dy.abs() < f64::EPSILON {
        return distance(point, line_start);
    }

    let numerator = (dy * point.x as f64 - dx * point.y as f64
        + line_end.x as f64 * line_start.y as f64
        - line_end.y as f64 * line_start.x as f64)
        .abs();
    numerator / (dx * dx + dy * dy).sqrt()
}

fn rdp(points: &[GridPoint], epsilon: f64) -> Vec<GridPoint> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let first = points[0];
    let last = points[points.len() - 1];
    let mut max_dist = 0.0;
    let mut index = 0usize;

    for (i, point) in points.iter().enumerate().take(points.len() - 1).skip(1) {
        let dist = perpendicular_distance(*point, first, last);
        if dist > max_dist {
            index = i;
            max_dist = dist;
        }
    }

    if max_dist > epsilon {
        let mut left = rdp(&points[..=index], epsilon);
        let right = rdp(&points[index..], epsilon);
        left.pop();
        left.into_iter().chain(right).collect()
    } else {
        vec![first, last]
    }
}

/// Douglas-Peucker over an open ring (first vertex not repeated).
///
/// The ring is split at the vertex farthest from the first one so both halves
/// are simplified as ordinary polylines. Returns the input unchanged when the
/// result would collapse below a triangle.
pub fn simplify_closed(ring: &[GridPoint], epsilon: f64) -> Vec<GridPoint> {
    if ring.len() <= 3 || epsilon <= 0.0 {
        return ring.to_vec();
    }

    let anchor = ring[0];
    let mut far = 0usize;
    let mut far_dist = 0.0;
    for (i, p) in ring.iter().enumerate() {
        let d = distance(*p, anchor);
        if d > far_dist {
            far_dist = d;
            far = i;
        }
    }
    if far == 0 {
        return ring.to_vec();
    }

    let mut first_half: Vec<GridPoint> = ring[..=far].to_vec();
    let mut second_half: Vec<GridPoint> = ring[far..].to_vec();
    second_half.push(anchor);

    first_half = rdp(&first_half, epsilon);
    second_half = rdp(&second_half, epsilon);
    first_half.pop();
    second_half.pop();

    let simplified: Vec<GridPoint> = first_half.into_iter().chain(second_half).collect();
    if simplified.len() < 3 || polygon_area(&simplified) <= 0.0 {
        return ring.to_vec();
    }
    simplified
}

/// Fill `points` into a mask covering `frame`. Pixels outside the frame are dropped.
pub fn rasterize_polygon(points: &[GridPoint], frame: &BoundingBox) -> GrayImage {
    let w = frame.w.max(0) as u32;
    let h = frame.h.max(0) as u32;
    let mut canvas = GrayImage::new(w, h);
    if w == 0 || h == 0 {
        return canvas;
    }

    let mut local: Vec<Point<i32>> = Vec::with_capacity(points.len());
    for p in points {
        let q = Point::new(p.x - frame.x, p.y - frame.y);
        if local.last() != Some(&q) {
            local.push(q);
        }
    }
    while local.len() > 1 && local.first() == local.last() {
        local.pop();
    }
    if local.len() < 3 {
        return canvas;
    }

    draw_polygon_mut(&mut canvas, &local, Luma([255u8]));
    canvas
}

pub fn count_set(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|v| **v > 0).count()
}

/// Pixel IoU of two polygons rasterized over their joint frame.
pub fn polygon_iou(a: &[GridPoint], b: &[GridPoint]) -> f64 {
    let frame = BoundingBox::of_points(a)
        .union(&BoundingBox::of_points(b))
        .expanded(1);
    let ma = rasterize_polygon(a, &frame);
    let mb = rasterize_polygon(b, &frame);

    let mut inter = 0usize;
    let mut union = 0usize;
    for (pa, pb) in ma.as_raw().iter().zip(mb.as_raw().iter()) {
        let ia = *pa > 0;
        let ib = *pb > 0;
        if ia && ib {
            inter += 1;
        }
        if ia || ib {
            union += 1;
        }
    }
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

pub fn loop_to_svg_path(points: &[GridPoint]) -> String {
    if points.len() < 2 {
        return String::new();
    }
    let mut out = String::new();
    for (i, p) in points.iter().enumerate() {
        if i == 0 {
            out.push_str(&format!("M {} {}", p.x, p.y));
        } else {
            out.push_str(&format!(" L {} {}", p.x, p.y));
        }
    }
    out.push_str(" Z");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Vec<GridPoint> {
        BoundingBox { x, y, w, h }.corners()
    }

    #[test]
    fn rectangle_area_centroid_and_perimeter() {
        let poly = rect(10, 20, 40, 10);
        assert_eq!(polygon_area(&poly), 400.0);
        assert_eq!(polygon_perimeter(&poly), 100.0);
        let (cx, cy) = polygon_centroid(&poly);
        assert!((cx - 30.0).abs() < 1e-9);
        assert!((cy - 25.0).abs() < 1e-9);
    }

    #[test]
    fn point_in_polygon_handles_inside_and_outside() {
        let poly = rect(0, 0, 10, 10);
        assert!(point_in_polygon(5.0, 5.0, &poly));
        assert!(!point_in_polygon(15.0, 5.0, &poly));
    }

    #[test]
    fn bbox_iou_of_identical_boxes_is_one() {
        let a = BoundingBox {
            x: 0,
            y: 0,
            w: 10,
            h: 10,
        };
        assert!((bbox_iou(&a, &a) - 1.0).abs() < 1e-12);
        let b = BoundingBox {
            x: 20,
            y: 20,
            w: 5,
            h: 5,
        };
        assert_eq!(bbox_iou(&a, &b), 0.0);
    }

    #[test]
    fn polygon_iou_reflects_overlap() {
        let a = rect(0, 0, 20, 20);
        assert!(polygon_iou(&a, &a) > 0.99);
        let b = rect(10, 0, 20, 20);
        let iou = polygon_iou(&a, &b);
        assert!(iou > 0.25 && iou < 0.45, "iou = {}", iou);
        let c = rect(100, 100, 5, 5);
        assert_eq!(polygon_iou(&a, &c), 0.0);
    }

    #[test]
    fn simplify_closed_drops_near_collinear_vertices() {
        let ring = vec![
            GridPoint::new(0, 0),
            GridPoint::new(50, 1),
            GridPoint::new(100, 0),
            GridPoint::new(100, 50),
            GridPoint::new(0, 50),
        ];
        let simplified = simplify_closed(&ring, 3.6);
        assert_eq!(simplified.len(), 4);
        assert!(!simplified.contains(&GridPoint::new(50, 1)));
    }

    #[test]
    fn rasterize_fills_interior() {
        let poly = rect(2, 2, 6, 6);
        let frame = BoundingBox {
            x: 0,
            y: 0,
            w: 10,
            h: 10,
        };
        let mask = rasterize_polygon(&poly, &frame);
        assert_eq!(mask.get_pixel(5, 5)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        let filled = count_set(&mask);
        assert!((36..=49).contains(&filled));
    }

    #[test]
    fn svg_path_is_closed() {
        let path = loop_to_svg_path(&rect(0, 0, 3, 4));
        assert_eq!(path, "M 0 0 L 3 0 L 3 4 L 0 4 Z");
    }

    #[test]
    fn expanded_boxes_touch_across_gap() {
        let a = BoundingBox {
            x: 0,
            y: 0,
            w: 10,
            h: 10,
        };
        let b = BoundingBox {
            x: 30,
            y: 0,
            w: 10,
            h: 10,
        };
        assert!(!a.expanded(5).touches(&b.expanded(5)));
        assert!(a.expanded(10).touches(&b.expanded(10)));
    }
}
