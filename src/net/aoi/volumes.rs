//! Interest volume calculation
//!
//! A connection's view is a square footprint (the camera view) offset
//! towards the camera and optionally rotated to the camera direction. The
//! footprint follows the player and is expanded twice:
//!
//! - entity volume: the footprint itself
//! - visible volume: things inside get created on the client
//! - invisible volume: things outside get destroyed on the client
//!
//! The gap between visible and invisible is hysteresis so that walking
//! along a border does not thrash areas and cells.

use std::f32::consts::{FRAC_PI_4, PI};

use tracing::warn;

use crate::game::constants::aoi::{
    AOI_VOLUME_DEFAULT, AOI_VOLUME_MAX, AOI_VOLUME_MIN, INVISIBLE_EXPANSION_DISTANCE, VIEW_EXPANSION_DISTANCE,
    VIEW_OFFSET_DIVISOR,
};
use crate::util::aabb2::Aabb2;
use crate::util::vector::{wrap_angle, Vector2, Vector3};

/// The three nested volumes of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InterestVolumes {
    pub entity: Aabb2,
    pub visible: Aabb2,
    pub invisible: Aabb2,
}

/// Clamp an AOI volume into the accepted range. Out-of-range values fall
/// back to the default.
pub fn sanitize_aoi_volume(aoi_volume: f32) -> f32 {
    if (AOI_VOLUME_MIN..=AOI_VOLUME_MAX).contains(&aoi_volume) {
        aoi_volume
    } else {
        warn!(
            "AOI volume {} outside [{}, {}], using default {}",
            aoi_volume, AOI_VOLUME_MIN, AOI_VOLUME_MAX, AOI_VOLUME_DEFAULT
        );
        AOI_VOLUME_DEFAULT
    }
}

#[derive(Debug, Clone)]
pub struct VolumeCalculator {
    aoi_volume: f32,
    /// Camera view relative to the player
    footprint: Aabb2,
    camera_direction: Option<Vector3>,
}

impl VolumeCalculator {
    pub fn new(aoi_volume: f32) -> Self {
        let mut calculator = Self {
            aoi_volume: AOI_VOLUME_DEFAULT,
            footprint: Aabb2::ZERO,
            camera_direction: None,
        };
        calculator.configure_footprint(aoi_volume);
        calculator
    }

    pub fn aoi_volume(&self) -> f32 {
        self.aoi_volume
    }

    pub fn footprint(&self) -> Aabb2 {
        self.footprint
    }

    /// Resize the footprint. Returns the size actually applied.
    pub fn configure_footprint(&mut self, aoi_volume: f32) -> f32 {
        self.aoi_volume = sanitize_aoi_volume(aoi_volume);
        self.rebuild_footprint();
        self.aoi_volume
    }

    /// Point the footprint along a camera direction (None resets it)
    pub fn set_camera_direction(&mut self, direction: Option<Vector3>) {
        self.camera_direction = direction.filter(|d| d.x != 0.0 || d.y != 0.0);
        self.rebuild_footprint();
    }

    fn rebuild_footprint(&mut self) {
        let view_offset = self.aoi_volume / VIEW_OFFSET_DIVISOR;
        let footprint = Aabb2::from_center(Vector2::new(view_offset, view_offset), self.aoi_volume);
        self.footprint = match self.camera_direction {
            Some(direction) => footprint.rotate_z(wrap_angle(direction.yaw() + PI - FRAC_PI_4)),
            None => footprint,
        };
    }

    pub fn compute(&self, position: Vector3) -> InterestVolumes {
        let entity = self.footprint.translate(position);
        InterestVolumes {
            entity,
            visible: entity.expand(VIEW_EXPANSION_DISTANCE),
            invisible: entity.expand(INVISIBLE_EXPANSION_DISTANCE),
        }
    }
}

impl Default for VolumeCalculator {
    fn default() -> Self {
        Self::new(AOI_VOLUME_DEFAULT)
    }
}
