/// Interest volume constants (world units)
pub mod aoi {
    /// Minimum 2D distance the player must move before volumes are recomputed
    pub const UPDATE_DISTANCE: f32 = 256.0;
    /// Visible volume = entity volume grown by this much on every side
    pub const VIEW_EXPANSION_DISTANCE: f32 = 600.0;
    /// Invisible volume = entity volume grown by this much on every side.
    /// Must stay above VIEW_EXPANSION_DISTANCE (hysteresis band).
    pub const INVISIBLE_EXPANSION_DISTANCE: f32 = 1200.0;
    /// Default side of the square view footprint
    pub const AOI_VOLUME_DEFAULT: f32 = 3200.0;
    /// Smallest accepted footprint
    pub const AOI_VOLUME_MIN: f32 = 1600.0;
    /// Largest accepted footprint
    pub const AOI_VOLUME_MAX: f32 = 5000.0;
    /// Footprint is shifted forward by AOI volume / this divisor
    pub const VIEW_OFFSET_DIVISOR: f32 = 8.0;
    /// Upper bound on inventory nesting walked by the resolver
    pub const MAX_CONTAINER_DEPTH: usize = 8;
    /// Flags value sent with an environment update after cell changes
    pub const ENVIRONMENT_UPDATE_CELLS_CHANGED: u32 = 1;
}

/// Archive encoding constants
pub mod archive {
    /// Fixed-point precision (fractional bits) for positions
    pub const POSITION_PRECISION: i32 = 3;
    /// Fixed-point precision for orientations
    pub const ORIENTATION_PRECISION: i32 = 6;
    /// Fixed-point precision for bounds scale override
    pub const BOUNDS_SCALE_PRECISION: i32 = 8;
    /// Fixed-point precision for locomotion speeds and ranges
    pub const SPEED_PRECISION: i32 = 0;
    /// Number of bits used by locomotion message flags. Enter-world
    /// extra flags are packed above this.
    pub const LOCO_FLAG_COUNT: u32 = 12;
    /// Longest varint accepted by readers (u64 worth of 7-bit groups)
    pub const MAX_VARINT_BYTES: usize = 10;
}

/// Minimap constants
pub mod minimap {
    /// Side of one low-res map texel in world units
    pub const TEXEL_SIZE: f32 = 256.0;
    /// Upper bound on texels per axis
    pub const MAX_TEXELS_PER_AXIS: usize = 256;
}

/// Session / runtime constants
pub mod session {
    /// Default demo tick rate in Hz
    pub const TICK_RATE: u32 = 20;
    /// Default metrics endpoint port
    pub const METRICS_PORT: u16 = 9090;
    /// Replication ids are seeded from this many low bits of the clock
    pub const REPLICATION_SEED_MASK: u64 = 0xFFFF;
}
