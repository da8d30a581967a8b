//! Distance primitives and the seven-segment body decomposition.

use crate::landmarks::{Landmark, Skeleton};

/// Ratio from the nose-to-mouth distance to the nose-to-crown distance.
pub const HEAD_TOP_RATIO: f64 = 3.236;

/// Coordinate space the segment formulas can run in.
pub trait Point: Copy {
    fn distance(self, other: Self) -> f64;
    fn midpoint(self, other: Self) -> Self;
    /// Distance from `self` to the infinite line through `start` and `end`.
    fn perpendicular_distance(self, start: Self, end: Self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Point for Point2 {
    fn distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    fn midpoint(self, other: Self) -> Self {
        Self::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    fn perpendicular_distance(self, start: Self, end: Self) -> f64 {
        // Vertical line: slope undefined, offset is purely horizontal.
        if end.x == start.x {
            return (self.x - start.x).abs();
        }
        let slope = (end.y - start.y) / (end.x - start.x);
        let intercept = start.y - slope * start.x;
        (slope * self.x - self.y + intercept).abs() / (slope * slope + 1.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }
}

impl Point for Point3 {
    fn distance(self, other: Self) -> f64 {
        self.sub(other).norm()
    }

    fn midpoint(self, other: Self) -> Self {
        Self::new(
            (self.x + other.x) / 2.0,
            (self.y + other.y) / 2.0,
            (self.z + other.z) / 2.0,
        )
    }

    fn perpendicular_distance(self, start: Self, end: Self) -> f64 {
        let line = end.sub(start);
        let offset = self.sub(start);
        let len = line.norm();
        // Degenerate line collapses to a point.
        if len == 0.0 {
            return offset.norm();
        }
        let t = line.dot(offset) / (len * len);
        let nearest = Point3::new(line.x * t, line.y * t, line.z * t);
        offset.sub(nearest).norm()
    }
}

/// Convert a normalized landmark to integer pixel coordinates.
///
/// Truncates toward zero.
pub fn to_pixel(lm: Landmark, width: f64, height: f64) -> Point2 {
    Point2::new((lm.x * width).trunc(), (lm.y * height).trunc())
}

pub fn to_normalized_2d(lm: Landmark) -> Point2 {
    Point2::new(lm.x, lm.y)
}

pub fn to_normalized_3d(lm: Landmark) -> Point3 {
    Point3::new(lm.x, lm.y, lm.z)
}

/// Seven segment lengths in [`BodySegment`](crate::landmarks::BodySegment) order.
pub fn segment_lengths<P: Point>(s: &Skeleton<P>) -> [f64; 7] {
    let shoulder_mid = s.shoulder_left.midpoint(s.shoulder_right);
    let hip_mid = s.hip_left.midpoint(s.hip_right);
    let mouth_mid = s.mouth_left.midpoint(s.mouth_right);

    let nose_mouth = s.nose.perpendicular_distance(s.mouth_left, s.mouth_right);

    [
        s.ankle.perpendicular_distance(s.heel, s.foot_index),
        s.knee.distance(s.ankle),
        s.hip_left.distance(s.knee),
        shoulder_mid.distance(hip_mid),
        mouth_mid.distance(shoulder_mid),
        nose_mouth,
        HEAD_TOP_RATIO * nose_mouth,
    ]
}
