//! Axis-aligned 2D bounding box on the world XY plane
//!
//! Used for interest volumes, area and cell bounds. Boundaries are
//! inclusive: touching boxes intersect.

use serde::{Deserialize, Serialize};

use crate::util::vector::{Vector2, Vector3};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Aabb2 {
    pub min: Vector2,
    pub max: Vector2,
}

impl Aabb2 {
    pub const ZERO: Aabb2 = Aabb2 { min: Vector2::ZERO, max: Vector2::ZERO };

    #[inline]
    pub fn new(min: Vector2, max: Vector2) -> Self {
        Self { min, max }
    }

    /// Square of side `size` centred on `center`
    pub fn from_center(center: Vector2, size: f32) -> Self {
        let half = size * 0.5;
        Self {
            min: Vector2::new(center.x - half, center.y - half),
            max: Vector2::new(center.x + half, center.y + half),
        }
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Vector2 {
        Vector2::new((self.min.x + self.max.x) * 0.5, (self.min.y + self.max.y) * 0.5)
    }

    /// Shift by a world position (height ignored)
    pub fn translate(&self, offset: Vector3) -> Self {
        let offset = offset.xy();
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Grow every side by `distance`
    pub fn expand(&self, distance: f32) -> Self {
        Self {
            min: Vector2::new(self.min.x - distance, self.min.y - distance),
            max: Vector2::new(self.max.x + distance, self.max.y + distance),
        }
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb2) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    #[inline]
    pub fn contains_point(&self, point: Vector2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }

    pub fn contains(&self, other: &Aabb2) -> bool {
        other.min.x >= self.min.x
            && other.max.x <= self.max.x
            && other.min.y >= self.min.y
            && other.max.y <= self.max.y
    }

    /// Bounding box of this box rotated around the origin
    pub fn rotate_z(&self, angle: f32) -> Self {
        let corners = [
            self.min,
            Vector2::new(self.max.x, self.min.y),
            self.max,
            Vector2::new(self.min.x, self.max.y),
        ];
        let first = corners[0].rotate(angle);
        let (min, max) = corners[1..].iter().fold((first, first), |(min, max), corner| {
            let rotated = corner.rotate(angle);
            (min.min(rotated), max.max(rotated))
        });
        Self { min, max }
    }
}
