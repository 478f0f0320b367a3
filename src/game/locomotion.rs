//! Locomotion state and its archive encoding
//!
//! A locomotion state is sent either in full or relative to the state the
//! client already has. `LocomotionMessageFlags` says which fields follow;
//! absent fields keep their previous (or default) value on the client.

use serde::{Deserialize, Serialize};

use crate::game::constants::archive::{POSITION_PRECISION, SPEED_PRECISION};
use crate::net::archive::{ArchiveError, ArchiveReader, ArchiveWriter};
use crate::util::vector::Vector3;

// ============================================================================
// Flags
// ============================================================================

/// Field presence flags for locomotion archives (12 bits)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocomotionMessageFlags(pub u32);

impl LocomotionMessageFlags {
    pub const NONE: Self = Self(0);
    pub const HAS_FULL_ORIENTATION: Self = Self(1 << 0);
    pub const NO_LOCOMOTION_STATE: Self = Self(1 << 1);
    pub const RELATIVE_TO_PREVIOUS_STATE: Self = Self(1 << 2);
    pub const HAS_LOCOMOTION_FLAGS: Self = Self(1 << 3);
    pub const HAS_METHOD: Self = Self(1 << 4);
    pub const UPDATE_PATH_NODES: Self = Self(1 << 5);
    pub const LOCOMOTION_FINISHED: Self = Self(1 << 6);
    pub const HAS_MOVE_SPEED: Self = Self(1 << 7);
    pub const HAS_HEIGHT: Self = Self(1 << 8);
    pub const HAS_FOLLOW_ENTITY_ID: Self = Self(1 << 9);
    pub const HAS_FOLLOW_ENTITY_RANGE: Self = Self(1 << 10);
    pub const HAS_ENTITY_PROTOTYPE_ID: Self = Self(1 << 11);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// Movement state flags carried inside a locomotion state
pub mod locomotion_flags {
    pub const IS_LOCOMOTING: u64 = 1 << 0;
    pub const IS_WALKING: u64 = 1 << 1;
    pub const IS_LOOKING: u64 = 1 << 2;
    pub const SKIP_CURRENT_SPEED_RATE: u64 = 1 << 3;
    pub const NO_ENTITY_COLLIDE: u64 = 1 << 4;
    pub const IS_MOVEMENT_POWER: u64 = 1 << 5;
    pub const DISABLE_ORIENTATION: u64 = 1 << 6;
    pub const IS_DRIVING_MOVEMENT_MODE: u64 = 1 << 7;
    pub const MOVE_FORWARD: u64 = 1 << 8;
    pub const MOVE_TO: u64 = 1 << 9;
    pub const IS_SYNC_MOVING: u64 = 1 << 10;
    pub const IGNORES_WORLD_COLLISION: u64 = 1 << 11;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum LocomotorMethod {
    None = 0,
    Ground = 1,
    Airborne = 2,
    TallGround = 3,
    Missile = 4,
    MissileSeeking = 5,
    HighFlying = 6,
    #[default]
    Default = 7,
}

impl TryFrom<u32> for LocomotorMethod {
    type Error = ArchiveError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Ground,
            2 => Self::Airborne,
            3 => Self::TallGround,
            4 => Self::Missile,
            5 => Self::MissileSeeking,
            6 => Self::HighFlying,
            7 => Self::Default,
            other => {
                return Err(ArchiveError::InvalidValue {
                    field: "locomotor method",
                    value: other as u64,
                })
            }
        })
    }
}

// ============================================================================
// Path nodes
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NaviSide {
    #[default]
    Point,
    Left,
    Right,
}

/// One waypoint of a navigation path
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NaviPathNode {
    pub vertex: Vector3,
    pub side: NaviSide,
    pub radius: f32,
}

impl NaviPathNode {
    /// Vertex as a delta from the previous one, then side and radius packed
    /// into one zigzag int: `radius << 2 | side`
    fn encode(&self, writer: &mut ArchiveWriter, previous_vertex: Vector3) {
        writer.write_vector_fixed(self.vertex - previous_vertex, POSITION_PRECISION);
        let side = match self.side {
            NaviSide::Point => 0,
            NaviSide::Left => 1,
            NaviSide::Right => 2,
        };
        writer.write_i32(((self.radius as i32) << 2) | side);
    }

    fn decode(reader: &mut ArchiveReader, previous_vertex: Vector3) -> Result<Self, ArchiveError> {
        let vertex = previous_vertex + reader.read_vector_fixed(POSITION_PRECISION)?;
        let packed = reader.read_i32()?;
        let side = match packed & 0b11 {
            0 => NaviSide::Point,
            1 => NaviSide::Left,
            2 => NaviSide::Right,
            other => {
                return Err(ArchiveError::InvalidValue {
                    field: "navi side",
                    value: other as u64,
                })
            }
        };
        Ok(Self {
            vertex,
            side,
            radius: (packed >> 2) as f32,
        })
    }
}

// ============================================================================
// Locomotion state
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocomotionState {
    pub flags: u64,
    pub method: LocomotorMethod,
    pub move_speed: f32,
    pub height: u32,
    pub follow_entity_id: u64,
    pub follow_range_start: f32,
    pub follow_range_end: f32,
    pub path_goal_node_index: u32,
    pub path_nodes: Vec<NaviPathNode>,
}

impl LocomotionState {
    pub fn new(move_speed: f32) -> Self {
        Self {
            move_speed,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_locomoting(&self) -> bool {
        self.flags & locomotion_flags::IS_LOCOMOTING != 0
    }

    /// Which fields need to go over the wire for `new`.
    ///
    /// Without `old` every non-default field is sent. With `old` only the
    /// fields that changed are sent and the message is marked relative.
    pub fn field_flags(
        new: Option<&LocomotionState>,
        old: Option<&LocomotionState>,
        with_path_nodes: bool,
    ) -> LocomotionMessageFlags {
        let mut flags = LocomotionMessageFlags::NONE;
        let Some(new) = new else {
            flags.insert(LocomotionMessageFlags::NO_LOCOMOTION_STATE);
            return flags;
        };

        let base = match old {
            Some(old) => {
                flags.insert(LocomotionMessageFlags::RELATIVE_TO_PREVIOUS_STATE);
                old.clone()
            }
            None => LocomotionState::default(),
        };

        flags.set(LocomotionMessageFlags::HAS_LOCOMOTION_FLAGS, new.flags != base.flags);
        flags.set(LocomotionMessageFlags::HAS_METHOD, new.method != base.method);
        flags.set(LocomotionMessageFlags::HAS_MOVE_SPEED, new.move_speed != base.move_speed);
        flags.set(LocomotionMessageFlags::HAS_HEIGHT, new.height != base.height);
        flags.set(
            LocomotionMessageFlags::HAS_FOLLOW_ENTITY_ID,
            new.follow_entity_id != base.follow_entity_id,
        );
        flags.set(
            LocomotionMessageFlags::HAS_FOLLOW_ENTITY_RANGE,
            new.follow_range_start != base.follow_range_start || new.follow_range_end != base.follow_range_end,
        );
        flags.set(
            LocomotionMessageFlags::UPDATE_PATH_NODES,
            with_path_nodes && !new.path_nodes.is_empty(),
        );
        flags.set(
            LocomotionMessageFlags::LOCOMOTION_FINISHED,
            old.is_some_and(|old| old.is_locomoting()) && !new.is_locomoting(),
        );
        flags
    }

    pub fn encode(&self, writer: &mut ArchiveWriter, flags: LocomotionMessageFlags) {
        if flags.contains(LocomotionMessageFlags::HAS_LOCOMOTION_FLAGS) {
            writer.write_u64(self.flags);
        }
        if flags.contains(LocomotionMessageFlags::HAS_METHOD) {
            writer.write_u32(self.method as u32);
        }
        if flags.contains(LocomotionMessageFlags::HAS_MOVE_SPEED) {
            writer.write_float_fixed(self.move_speed, SPEED_PRECISION);
        }
        if flags.contains(LocomotionMessageFlags::HAS_HEIGHT) {
            writer.write_u32(self.height);
        }
        if flags.contains(LocomotionMessageFlags::HAS_FOLLOW_ENTITY_ID) {
            writer.write_u64(self.follow_entity_id);
        }
        if flags.contains(LocomotionMessageFlags::HAS_FOLLOW_ENTITY_RANGE) {
            writer.write_float_fixed(self.follow_range_start, SPEED_PRECISION);
            writer.write_float_fixed(self.follow_range_end, SPEED_PRECISION);
        }
        if flags.contains(LocomotionMessageFlags::UPDATE_PATH_NODES) {
            writer.write_u32(self.path_goal_node_index);
            writer.write_u64(self.path_nodes.len() as u64);
            let mut previous = Vector3::ZERO;
            for node in &self.path_nodes {
                node.encode(writer, previous);
                previous = node.vertex;
            }
        }
    }

    /// Apply the fields present in `flags` on top of `self`
    pub fn decode(&mut self, reader: &mut ArchiveReader, flags: LocomotionMessageFlags) -> Result<(), ArchiveError> {
        self.path_nodes.clear();

        if flags.contains(LocomotionMessageFlags::HAS_LOCOMOTION_FLAGS) {
            self.flags = reader.read_u64()?;
        }
        if flags.contains(LocomotionMessageFlags::HAS_METHOD) {
            self.method = LocomotorMethod::try_from(reader.read_u32()?)?;
        }
        if flags.contains(LocomotionMessageFlags::HAS_MOVE_SPEED) {
            self.move_speed = reader.read_float_fixed(SPEED_PRECISION)?;
        }
        if flags.contains(LocomotionMessageFlags::HAS_HEIGHT) {
            self.height = reader.read_u32()?;
        }
        if flags.contains(LocomotionMessageFlags::HAS_FOLLOW_ENTITY_ID) {
            self.follow_entity_id = reader.read_u64()?;
        }
        if flags.contains(LocomotionMessageFlags::HAS_FOLLOW_ENTITY_RANGE) {
            self.follow_range_start = reader.read_float_fixed(SPEED_PRECISION)?;
            self.follow_range_end = reader.read_float_fixed(SPEED_PRECISION)?;
        }
        if flags.contains(LocomotionMessageFlags::UPDATE_PATH_NODES) {
            self.path_goal_node_index = reader.read_u32()?;
            let count = reader.read_count()?;
            let mut previous = Vector3::ZERO;
            for _ in 0..count {
                let node = NaviPathNode::decode(reader, previous)?;
                previous = node.vertex;
                self.path_nodes.push(node);
            }
        }
        Ok(())
    }
}
