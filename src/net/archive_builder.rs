//! Builders for archive-carrying messages
//!
//! - `EntityCreate`: flag-driven base block + full state block
//! - `LocomotionStateUpdate`: position, orientation and locomotion delta
//! - `EntityEnterGameWorld`: like the update, with extra flags packed above
//!   the locomotion flag bits
//!
//! Every builder has a matching decoder so clients, tools and tests can read
//! the archives back.

use serde::{Deserialize, Serialize};

use crate::game::constants::archive::{
    BOUNDS_SCALE_PRECISION, LOCO_FLAG_COUNT, ORIENTATION_PRECISION, POSITION_PRECISION,
};
use crate::game::entity::{status, Entity, EntityId, EntityKind, PrototypeId, INVALID_ENTITY_ID, INVALID_PROTOTYPE_ID};
use crate::game::inventory::InventoryLocation;
use crate::game::locomotion::{LocomotionMessageFlags, LocomotionState};
use crate::game::replication::ArchiveMessageHandler;
use crate::net::archive::{ArchiveError, ArchiveReader, ArchiveWriter};
use crate::net::policy::InterestPolicies;
use crate::net::protocol::{self, DecodeError, EncodeError, ServerMessage};
use crate::util::vector::{Orientation, Vector3};

// ============================================================================
// Flags
// ============================================================================

/// Field presence flags of the entity create base block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCreateFlags(pub u32);

impl EntityCreateFlags {
    pub const NONE: Self = Self(0);
    pub const HAS_POSITION_AND_ORIENTATION: Self = Self(1 << 0);
    pub const HAS_ACTIVE_POWER_PROTOTYPE_REF: Self = Self(1 << 1);
    pub const IS_NEW_ON_SERVER: Self = Self(1 << 2);
    pub const HAS_SOURCE_ENTITY_ID: Self = Self(1 << 3);
    pub const HAS_SOURCE_POSITION: Self = Self(1 << 4);
    pub const HAS_NON_PROXIMITY_INTEREST: Self = Self(1 << 5);
    pub const HAS_INV_LOC: Self = Self(1 << 6);
    pub const HAS_INV_LOC_PREV: Self = Self(1 << 7);
    pub const HAS_DB_ID: Self = Self(1 << 8);
    pub const HAS_AVATAR_WORLD_INSTANCE_ID: Self = Self(1 << 9);
    pub const OVERRIDE_SNAP_TO_FLOOR_ON_SPAWN: Self = Self(1 << 10);
    pub const HAS_BOUNDS_SCALE_OVERRIDE: Self = Self(1 << 11);
    pub const IS_CLIENT_ENTITY_HIDDEN: Self = Self(1 << 12);
    // Bit 13 is unused on the wire
    pub const HAS_ATTACHED_ENTITIES: Self = Self(1 << 14);
    pub const IGNORE_NAVI: Self = Self(1 << 15);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
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

/// Extra flags of the enter-world archive, stored above the locomotion bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnterGameWorldFlags(pub u32);

impl EnterGameWorldFlags {
    pub const NONE: Self = Self(0);
    pub const HAS_AVATAR_WORLD_INSTANCE_ID: Self = Self(1 << 0);
    pub const IS_NEW_ON_SERVER: Self = Self(1 << 1);
    pub const IS_CLIENT_ENTITY_HIDDEN: Self = Self(1 << 2);
    pub const HAS_ATTACHED_ENTITIES: Self = Self(1 << 3);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
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

const LOCO_FLAG_MASK: u32 = (1 << LOCO_FLAG_COUNT) - 1;

// ============================================================================
// Entity settings
// ============================================================================

/// Creation-time options that end up as base block flags
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySettings {
    pub is_new_on_server: bool,
    pub is_client_entity_hidden: bool,
    pub ignore_navi: bool,
    pub override_snap_to_floor: bool,
    pub source_entity_id: EntityId,
    pub source_position: Vector3,
    pub bounds_scale_override: f32,
    pub inventory_location_prev: Option<InventoryLocation>,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            is_new_on_server: false,
            is_client_entity_hidden: false,
            ignore_navi: false,
            override_snap_to_floor: false,
            source_entity_id: INVALID_ENTITY_ID,
            source_position: Vector3::ZERO,
            bounds_scale_override: 1.0,
            inventory_location_prev: None,
        }
    }
}

impl EntitySettings {
    /// Settings implied by the entity's current state
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            is_new_on_server: entity.test_status(status::NEW_ON_SERVER),
            is_client_entity_hidden: entity.test_status(status::CLIENT_HIDDEN),
            bounds_scale_override: entity.bounds_scale,
            inventory_location_prev: entity.inventory_location_prev,
            ..Default::default()
        }
    }
}

// ============================================================================
// Entity create base block
// ============================================================================

/// Decoded form of the entity create base block
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCreateBaseData {
    pub replication_policy: InterestPolicies,
    pub entity_id: EntityId,
    pub prototype_ref: PrototypeId,
    pub field_flags: EntityCreateFlags,
    pub loco_flags: LocomotionMessageFlags,
    pub interest_policies: InterestPolicies,
    pub avatar_world_instance_id: u32,
    pub db_id: u64,
    pub position: Vector3,
    pub orientation: Orientation,
    pub locomotion: Option<LocomotionState>,
    pub bounds_scale_override: f32,
    pub source_entity_id: EntityId,
    pub source_position: Vector3,
    pub active_power_ref: PrototypeId,
    pub inventory_location: Option<InventoryLocation>,
    pub inventory_location_prev: Option<InventoryLocation>,
    pub attached_entities: Vec<EntityId>,
}

impl Default for EntityCreateBaseData {
    fn default() -> Self {
        Self {
            replication_policy: InterestPolicies::PROXIMITY,
            entity_id: INVALID_ENTITY_ID,
            prototype_ref: INVALID_PROTOTYPE_ID,
            field_flags: EntityCreateFlags::NONE,
            loco_flags: LocomotionMessageFlags::NONE,
            interest_policies: InterestPolicies::PROXIMITY,
            avatar_world_instance_id: 0,
            db_id: 0,
            position: Vector3::ZERO,
            orientation: Orientation::ZERO,
            locomotion: None,
            bounds_scale_override: 1.0,
            source_entity_id: INVALID_ENTITY_ID,
            source_position: Vector3::ZERO,
            active_power_ref: INVALID_PROTOTYPE_ID,
            inventory_location: None,
            inventory_location_prev: None,
            attached_entities: Vec::new(),
        }
    }
}

/// One conditional field of the base block
struct BaseField {
    present: fn(&EntityCreateBaseData) -> bool,
    encode: fn(&EntityCreateBaseData, &mut ArchiveWriter),
    decode: fn(&mut EntityCreateBaseData, &mut ArchiveReader) -> Result<(), ArchiveError>,
}

/// Conditional fields in wire order, after the fixed header
const BASE_FIELDS: &[BaseField] = &[
    // Non-proximity interest
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_NON_PROXIMITY_INTEREST),
        encode: |d, w| w.write_u32(d.interest_policies.bits()),
        decode: |d, r| {
            d.interest_policies = InterestPolicies::from_bits(r.read_u32()?);
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_AVATAR_WORLD_INSTANCE_ID),
        encode: |d, w| w.write_u32(d.avatar_world_instance_id),
        decode: |d, r| {
            d.avatar_world_instance_id = r.read_u32()?;
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_DB_ID),
        encode: |d, w| w.write_u64(d.db_id),
        decode: |d, r| {
            d.db_id = r.read_u64()?;
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_POSITION_AND_ORIENTATION),
        encode: |d, w| write_position_orientation(w, d.position, d.orientation, d.loco_flags),
        decode: |d, r| {
            (d.position, d.orientation) = read_position_orientation(r, d.loco_flags)?;
            Ok(())
        },
    },
    BaseField {
        present: |d| !d.loco_flags.contains(LocomotionMessageFlags::NO_LOCOMOTION_STATE),
        encode: |d, w| match &d.locomotion {
            Some(state) => state.encode(w, d.loco_flags),
            None => LocomotionState::default().encode(w, d.loco_flags),
        },
        decode: |d, r| {
            let mut state = LocomotionState::default();
            state.decode(r, d.loco_flags)?;
            d.locomotion = Some(state);
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_BOUNDS_SCALE_OVERRIDE),
        encode: |d, w| w.write_float_fixed(d.bounds_scale_override, BOUNDS_SCALE_PRECISION),
        decode: |d, r| {
            d.bounds_scale_override = r.read_float_fixed(BOUNDS_SCALE_PRECISION)?;
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_SOURCE_ENTITY_ID),
        encode: |d, w| w.write_u64(d.source_entity_id),
        decode: |d, r| {
            d.source_entity_id = r.read_u64()?;
            Ok(())
        },
    },
    // Source position travels as a delta from the entity position
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_SOURCE_POSITION),
        encode: |d, w| w.write_vector_fixed(d.source_position - d.position, POSITION_PRECISION),
        decode: |d, r| {
            d.source_position = d.position + r.read_vector_fixed(POSITION_PRECISION)?;
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_ACTIVE_POWER_PROTOTYPE_REF),
        encode: |d, w| w.write_u64(d.active_power_ref),
        decode: |d, r| {
            d.active_power_ref = r.read_u64()?;
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_INV_LOC),
        encode: |d, w| d.inventory_location.unwrap_or(EMPTY_LOCATION).encode(w),
        decode: |d, r| {
            d.inventory_location = Some(InventoryLocation::decode(r)?);
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_INV_LOC_PREV),
        encode: |d, w| d.inventory_location_prev.unwrap_or(EMPTY_LOCATION).encode(w),
        decode: |d, r| {
            d.inventory_location_prev = Some(InventoryLocation::decode(r)?);
            Ok(())
        },
    },
    BaseField {
        present: |d| d.field_flags.contains(EntityCreateFlags::HAS_ATTACHED_ENTITIES),
        encode: |d, w| w.write_u64_list(&d.attached_entities),
        decode: |d, r| {
            d.attached_entities = r.read_u64_list()?;
            Ok(())
        },
    },
];

const EMPTY_LOCATION: InventoryLocation = InventoryLocation {
    container_id: INVALID_ENTITY_ID,
    inventory_ref: INVALID_PROTOTYPE_ID,
    slot: 0,
};

impl EntityCreateBaseData {
    /// Base block for `entity` as seen through `policies`
    pub fn from_entity(
        entity: &Entity,
        policies: InterestPolicies,
        include_inventory_location: bool,
        settings: &EntitySettings,
    ) -> Self {
        let mut data = Self {
            replication_policy: policies,
            entity_id: entity.id,
            prototype_ref: entity.prototype_ref,
            interest_policies: policies,
            ..Default::default()
        };
        let flags = &mut data.field_flags;

        // Proximity is implied unless flagged otherwise
        flags.set(EntityCreateFlags::HAS_NON_PROXIMITY_INTEREST, policies != InterestPolicies::PROXIMITY);

        if entity.kind == EntityKind::Player {
            flags.set(EntityCreateFlags::HAS_DB_ID, true);
            data.db_id = entity.db_id;
        }
        if entity.is_avatar() {
            flags.set(EntityCreateFlags::HAS_AVATAR_WORLD_INSTANCE_ID, true);
            data.avatar_world_instance_id = entity.avatar_world_instance_id;
        }

        // Items in someone else's equipment are proximity-visible but not in world
        let positioned = entity.kind.is_world_entity()
            && entity.is_in_world()
            && policies.intersects(InterestPolicies::PROXIMITY | InterestPolicies::CLIENT_INDEPENDENT);
        match entity.location.filter(|_| positioned) {
            Some(location) => {
                flags.set(EntityCreateFlags::HAS_POSITION_AND_ORIENTATION, true);
                data.position = location.position;
                data.orientation = location.orientation;
                data.loco_flags = LocomotionState::field_flags(entity.locomotion.as_ref(), None, true);
                data.loco_flags.set(
                    LocomotionMessageFlags::HAS_FULL_ORIENTATION,
                    !location.orientation.is_yaw_only(),
                );
                data.locomotion = entity.locomotion.clone();
            }
            None => data.loco_flags = LocomotionMessageFlags::NO_LOCOMOTION_STATE,
        }

        if entity.kind.is_world_entity() {
            if entity.active_power_ref != INVALID_PROTOTYPE_ID {
                flags.set(EntityCreateFlags::HAS_ACTIVE_POWER_PROTOTYPE_REF, true);
                data.active_power_ref = entity.active_power_ref;
            }
            if !entity.attached_entities.is_empty() {
                flags.set(EntityCreateFlags::HAS_ATTACHED_ENTITIES, true);
                data.attached_entities = entity.attached_entities.to_vec();
            }
            flags.set(EntityCreateFlags::OVERRIDE_SNAP_TO_FLOOR_ON_SPAWN, settings.override_snap_to_floor);
        }

        flags.set(EntityCreateFlags::IS_NEW_ON_SERVER, settings.is_new_on_server);
        flags.set(EntityCreateFlags::IS_CLIENT_ENTITY_HIDDEN, settings.is_client_entity_hidden);
        flags.set(EntityCreateFlags::IGNORE_NAVI, settings.ignore_navi);
        if settings.source_entity_id != INVALID_ENTITY_ID {
            flags.set(EntityCreateFlags::HAS_SOURCE_ENTITY_ID, true);
            data.source_entity_id = settings.source_entity_id;
        }
        if settings.source_position != Vector3::ZERO {
            flags.set(EntityCreateFlags::HAS_SOURCE_POSITION, true);
            data.source_position = settings.source_position;
        }
        if settings.bounds_scale_override != 1.0 {
            flags.set(EntityCreateFlags::HAS_BOUNDS_SCALE_OVERRIDE, true);
            data.bounds_scale_override = settings.bounds_scale_override;
        }

        // Previous location only goes along with a current one
        if let Some(location) = entity.inventory_location.filter(|_| include_inventory_location) {
            flags.set(EntityCreateFlags::HAS_INV_LOC, true);
            data.inventory_location = Some(location);
            if let Some(previous) = settings.inventory_location_prev.filter(|prev| *prev != location) {
                flags.set(EntityCreateFlags::HAS_INV_LOC_PREV, true);
                data.inventory_location_prev = Some(previous);
            }
        }

        data
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(self.replication_policy);
        writer.write_u64(self.entity_id);
        writer.write_u64(self.prototype_ref);
        writer.write_u32(self.field_flags.0);
        writer.write_u32(self.loco_flags.0);
        for field in BASE_FIELDS {
            if (field.present)(self) {
                (field.encode)(self, &mut writer);
            }
        }
        writer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ArchiveError> {
        let mut reader = ArchiveReader::new(data)?;
        let mut base = Self {
            replication_policy: reader.replication_policy(),
            entity_id: reader.read_u64()?,
            prototype_ref: reader.read_u64()?,
            field_flags: EntityCreateFlags(reader.read_u32()?),
            loco_flags: LocomotionMessageFlags(reader.read_u32()?),
            ..Default::default()
        };
        for field in BASE_FIELDS {
            if (field.present)(&base) {
                (field.decode)(&mut base, &mut reader)?;
            }
        }
        reader.finish()?;
        Ok(base)
    }
}

// ============================================================================
// Entity state block
// ============================================================================

/// Full replicated state of an entity, sent after the base block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityArchiveState {
    pub entity_id: EntityId,
    pub prototype_ref: PrototypeId,
    pub kind: EntityKind,
    pub status: u32,
    pub replication_policy: InterestPolicies,
    /// Replication id of the property collection (0 if unbound)
    pub properties_replication_id: u64,
    pub properties: Vec<(u32, i64)>,
}

impl EntityArchiveState {
    pub fn from_entity(entity: &Entity, policies: InterestPolicies) -> Self {
        Self {
            entity_id: entity.id,
            prototype_ref: entity.prototype_ref,
            kind: entity.kind,
            status: entity.status_bits(),
            replication_policy: policies,
            properties_replication_id: entity.properties.replication_id(),
            properties: entity.properties.iter().collect(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        protocol::decode(data)
    }
}

/// Build the `EntityCreate` message for `entity` as seen through `policies`
pub fn build_entity_create(
    entity: &Entity,
    policies: InterestPolicies,
    include_inventory_location: bool,
    settings: &EntitySettings,
) -> Result<ServerMessage, EncodeError> {
    let base = EntityCreateBaseData::from_entity(entity, policies, include_inventory_location, settings);
    let state = EntityArchiveState::from_entity(entity, policies);
    Ok(ServerMessage::EntityCreate {
        base_data: base.encode(),
        archive_data: protocol::encode(&state)?,
    })
}

// ============================================================================
// Shared position / orientation block
// ============================================================================

fn write_position_orientation(
    writer: &mut ArchiveWriter,
    position: Vector3,
    orientation: Orientation,
    loco_flags: LocomotionMessageFlags,
) {
    writer.write_vector_fixed(position, POSITION_PRECISION);
    let yaw_only = !loco_flags.contains(LocomotionMessageFlags::HAS_FULL_ORIENTATION);
    writer.write_orientation_fixed(orientation, yaw_only, ORIENTATION_PRECISION);
}

fn read_position_orientation(
    reader: &mut ArchiveReader,
    loco_flags: LocomotionMessageFlags,
) -> Result<(Vector3, Orientation), ArchiveError> {
    let position = reader.read_vector_fixed(POSITION_PRECISION)?;
    let yaw_only = !loco_flags.contains(LocomotionMessageFlags::HAS_FULL_ORIENTATION);
    let orientation = reader.read_orientation_fixed(yaw_only, ORIENTATION_PRECISION)?;
    Ok((position, orientation))
}

// ============================================================================
// Locomotion state update
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LocomotionUpdateArchive {
    pub entity_id: EntityId,
    pub loco_flags: LocomotionMessageFlags,
    pub prototype_ref: PrototypeId,
    pub position: Vector3,
    pub orientation: Orientation,
    pub state: LocomotionState,
}

impl LocomotionUpdateArchive {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(InterestPolicies::PROXIMITY);
        writer.write_u64(self.entity_id);
        writer.write_u32(self.loco_flags.0);
        if self.loco_flags.contains(LocomotionMessageFlags::HAS_ENTITY_PROTOTYPE_ID) {
            writer.write_u64(self.prototype_ref);
        }
        write_position_orientation(&mut writer, self.position, self.orientation, self.loco_flags);
        self.state.encode(&mut writer, self.loco_flags);
        writer.into_bytes()
    }

    /// Decode on top of `previous`, the state the reader already knows
    pub fn decode(data: &[u8], previous: Option<&LocomotionState>) -> Result<Self, ArchiveError> {
        let mut reader = ArchiveReader::new(data)?;
        let entity_id = reader.read_u64()?;
        let loco_flags = LocomotionMessageFlags(reader.read_u32()?);
        let prototype_ref = if loco_flags.contains(LocomotionMessageFlags::HAS_ENTITY_PROTOTYPE_ID) {
            reader.read_u64()?
        } else {
            INVALID_PROTOTYPE_ID
        };
        let (position, orientation) = read_position_orientation(&mut reader, loco_flags)?;
        let mut state = match previous {
            Some(previous) if loco_flags.contains(LocomotionMessageFlags::RELATIVE_TO_PREVIOUS_STATE) => {
                previous.clone()
            }
            _ => LocomotionState::default(),
        };
        state.decode(&mut reader, loco_flags)?;
        reader.finish()?;
        Ok(Self {
            entity_id,
            loco_flags,
            prototype_ref,
            position,
            orientation,
            state,
        })
    }
}

/// Build a `LocomotionStateUpdate` for an in-world entity. Returns None if
/// the entity has no world location.
pub fn build_locomotion_state_update(
    entity: &Entity,
    old_state: Option<&LocomotionState>,
    new_state: &LocomotionState,
    with_path_nodes: bool,
) -> Option<ServerMessage> {
    let location = entity.location.filter(|_| entity.is_in_world())?;
    let mut loco_flags = LocomotionState::field_flags(Some(new_state), old_state, with_path_nodes);
    loco_flags.set(
        LocomotionMessageFlags::HAS_FULL_ORIENTATION,
        !location.orientation.is_yaw_only(),
    );
    let archive = LocomotionUpdateArchive {
        entity_id: entity.id,
        loco_flags,
        prototype_ref: entity.prototype_ref,
        position: location.position,
        orientation: location.orientation,
        state: new_state.clone(),
    };
    Some(ServerMessage::LocomotionStateUpdate {
        archive_data: archive.encode(),
    })
}

// ============================================================================
// Enter game world
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EnterGameWorldArchive {
    pub entity_id: EntityId,
    pub loco_flags: LocomotionMessageFlags,
    pub extra_flags: EnterGameWorldFlags,
    pub prototype_ref: PrototypeId,
    pub position: Vector3,
    pub orientation: Orientation,
    pub locomotion: Option<LocomotionState>,
    pub avatar_world_instance_id: u32,
    pub attached_entities: Vec<EntityId>,
}

impl EnterGameWorldArchive {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        let location = entity.location.filter(|_| entity.is_in_world())?;
        let mut loco_flags = LocomotionState::field_flags(entity.locomotion.as_ref(), None, true);
        loco_flags.set(
            LocomotionMessageFlags::HAS_FULL_ORIENTATION,
            !location.orientation.is_yaw_only(),
        );

        let mut extra_flags = EnterGameWorldFlags::NONE;
        extra_flags.set(EnterGameWorldFlags::HAS_AVATAR_WORLD_INSTANCE_ID, entity.is_avatar());
        extra_flags.set(EnterGameWorldFlags::IS_NEW_ON_SERVER, entity.test_status(status::NEW_ON_SERVER));
        extra_flags.set(
            EnterGameWorldFlags::IS_CLIENT_ENTITY_HIDDEN,
            entity.test_status(status::CLIENT_HIDDEN),
        );
        extra_flags.set(EnterGameWorldFlags::HAS_ATTACHED_ENTITIES, !entity.attached_entities.is_empty());

        Some(Self {
            entity_id: entity.id,
            loco_flags,
            extra_flags,
            prototype_ref: entity.prototype_ref,
            position: location.position,
            orientation: location.orientation,
            locomotion: entity.locomotion.clone(),
            avatar_world_instance_id: entity.avatar_world_instance_id,
            attached_entities: entity.attached_entities.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(InterestPolicies::PROXIMITY);
        writer.write_u64(self.entity_id);
        writer.write_u32((self.loco_flags.0 & LOCO_FLAG_MASK) | (self.extra_flags.0 << LOCO_FLAG_COUNT));
        if self.loco_flags.contains(LocomotionMessageFlags::HAS_ENTITY_PROTOTYPE_ID) {
            writer.write_u64(self.prototype_ref);
        }
        write_position_orientation(&mut writer, self.position, self.orientation, self.loco_flags);
        if !self.loco_flags.contains(LocomotionMessageFlags::NO_LOCOMOTION_STATE) {
            match &self.locomotion {
                Some(state) => state.encode(&mut writer, self.loco_flags),
                None => LocomotionState::default().encode(&mut writer, self.loco_flags),
            }
        }
        if self.extra_flags.contains(EnterGameWorldFlags::HAS_AVATAR_WORLD_INSTANCE_ID) {
            writer.write_u32(self.avatar_world_instance_id);
        }
        if self.extra_flags.contains(EnterGameWorldFlags::HAS_ATTACHED_ENTITIES) {
            writer.write_u64_list(&self.attached_entities);
        }
        writer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ArchiveError> {
        let mut reader = ArchiveReader::new(data)?;
        let entity_id = reader.read_u64()?;
        let combined = reader.read_u32()?;
        let loco_flags = LocomotionMessageFlags(combined & LOCO_FLAG_MASK);
        let extra_flags = EnterGameWorldFlags(combined >> LOCO_FLAG_COUNT);

        let prototype_ref = if loco_flags.contains(LocomotionMessageFlags::HAS_ENTITY_PROTOTYPE_ID) {
            reader.read_u64()?
        } else {
            INVALID_PROTOTYPE_ID
        };
        let (position, orientation) = read_position_orientation(&mut reader, loco_flags)?;
        let locomotion = if loco_flags.contains(LocomotionMessageFlags::NO_LOCOMOTION_STATE) {
            None
        } else {
            let mut state = LocomotionState::default();
            state.decode(&mut reader, loco_flags)?;
            Some(state)
        };
        let avatar_world_instance_id = if extra_flags.contains(EnterGameWorldFlags::HAS_AVATAR_WORLD_INSTANCE_ID) {
            reader.read_u32()?
        } else {
            0
        };
        let attached_entities = if extra_flags.contains(EnterGameWorldFlags::HAS_ATTACHED_ENTITIES) {
            reader.read_u64_list()?
        } else {
            Vec::new()
        };
        reader.finish()?;

        Ok(Self {
            entity_id,
            loco_flags,
            extra_flags,
            prototype_ref,
            position,
            orientation,
            locomotion,
            avatar_world_instance_id,
            attached_entities,
        })
    }
}

/// Build `EntityEnterGameWorld` for an in-world entity
pub fn build_enter_game_world(entity: &Entity) -> Option<ServerMessage> {
    EnterGameWorldArchive::from_entity(entity).map(|archive| ServerMessage::EntityEnterGameWorld {
        archive_data: archive.encode(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::RegionLocation;
    use crate::game::locomotion::{locomotion_flags, NaviPathNode, NaviSide};

    fn in_world_agent(id: EntityId) -> Entity {
        let mut entity = Entity::new(id, 4242, EntityKind::Agent).with_status(status::IN_WORLD);
        entity.location = Some(RegionLocation {
            position: Vector3::new(100.5, -40.25, 8.0),
            orientation: Orientation::from_yaw(1.5),
            area_id: 1,
            cell_id: 1,
        });
        entity
    }

    fn moving_state() -> LocomotionState {
        let mut state = LocomotionState::new(600.0);
        state.flags = locomotion_flags::IS_LOCOMOTING | locomotion_flags::MOVE_TO;
        state.path_nodes = vec![
            NaviPathNode {
                vertex: Vector3::new(100.0, -40.0, 8.0),
                side: NaviSide::Point,
                radius: 0.0,
            },
            NaviPathNode {
                vertex: Vector3::new(300.0, 60.0, 8.0),
                side: NaviSide::Left,
                radius: 32.0,
            },
        ];
        state
    }

    #[test]
    fn test_proximity_create_has_position() {
        let mut agent = in_world_agent(10);
        agent.locomotion = Some(moving_state());
        let base = EntityCreateBaseData::from_entity(&agent, InterestPolicies::PROXIMITY, false, &EntitySettings::default());

        assert!(base.field_flags.contains(EntityCreateFlags::HAS_POSITION_AND_ORIENTATION));
        assert!(!base.field_flags.contains(EntityCreateFlags::HAS_NON_PROXIMITY_INTEREST));
        assert!(!base.loco_flags.contains(LocomotionMessageFlags::HAS_FULL_ORIENTATION));
        assert!(base.loco_flags.contains(LocomotionMessageFlags::UPDATE_PATH_NODES));

        let decoded = EntityCreateBaseData::decode(&base.encode()).unwrap();
        assert_eq!(decoded.entity_id, 10);
        assert_eq!(decoded.prototype_ref, 4242);
        assert!(decoded.position.approx_eq(Vector3::new(100.5, -40.25, 8.0), 0.125));
        assert!((decoded.orientation.yaw - 1.5).abs() < 1e-4);
        let state = decoded.locomotion.unwrap();
        assert_eq!(state.path_nodes.len(), 2);
        assert_eq!(state.path_nodes[1].side, NaviSide::Left);
    }

    #[test]
    fn test_owner_only_create_has_no_position() {
        let agent = in_world_agent(11);
        let base = EntityCreateBaseData::from_entity(&agent, InterestPolicies::OWNER, false, &EntitySettings::default());

        assert!(!base.field_flags.contains(EntityCreateFlags::HAS_POSITION_AND_ORIENTATION));
        assert!(base.field_flags.contains(EntityCreateFlags::HAS_NON_PROXIMITY_INTEREST));
        assert!(base.loco_flags.contains(LocomotionMessageFlags::NO_LOCOMOTION_STATE));

        let decoded = EntityCreateBaseData::decode(&base.encode()).unwrap();
        assert_eq!(decoded.interest_policies, InterestPolicies::OWNER);
        assert_eq!(decoded.replication_policy, InterestPolicies::OWNER);
        assert!(decoded.locomotion.is_none());
    }

    #[test]
    fn test_client_independent_create_has_position() {
        let missile = {
            let mut entity = in_world_agent(12);
            entity.kind = EntityKind::Missile;
            entity
        };
        let base = EntityCreateBaseData::from_entity(
            &missile,
            InterestPolicies::CLIENT_INDEPENDENT,
            false,
            &EntitySettings::default(),
        );
        assert!(base.field_flags.contains(EntityCreateFlags::HAS_POSITION_AND_ORIENTATION));
    }

    #[test]
    fn test_full_orientation_flag() {
        let mut agent = in_world_agent(13);
        if let Some(location) = agent.location.as_mut() {
            location.orientation = Orientation::new(0.5, 0.25, -0.125);
        }
        let base = EntityCreateBaseData::from_entity(&agent, InterestPolicies::PROXIMITY, false, &EntitySettings::default());
        assert!(base.loco_flags.contains(LocomotionMessageFlags::HAS_FULL_ORIENTATION));

        let decoded = EntityCreateBaseData::decode(&base.encode()).unwrap();
        assert!((decoded.orientation.pitch - 0.25).abs() < 1e-4);
        assert!((decoded.orientation.roll + 0.125).abs() < 1e-4);
    }

    #[test]
    fn test_every_optional_field_survives_decode() {
        let mut avatar = in_world_agent(20);
        avatar.kind = EntityKind::Avatar;
        avatar.avatar_world_instance_id = 3;
        avatar.active_power_ref = 9001;
        avatar.attached_entities.push(21);
        avatar.attached_entities.push(22);
        avatar.inventory_location = Some(InventoryLocation::new(1, 500, 2));

        let settings = EntitySettings {
            is_new_on_server: true,
            is_client_entity_hidden: true,
            ignore_navi: true,
            override_snap_to_floor: true,
            source_entity_id: 5,
            source_position: Vector3::new(90.0, -30.0, 8.0),
            bounds_scale_override: 1.5,
            inventory_location_prev: Some(InventoryLocation::new(1, 500, 0)),
        };
        let policies = InterestPolicies::PROXIMITY | InterestPolicies::OWNER;
        let base = EntityCreateBaseData::from_entity(&avatar, policies, true, &settings);
        let decoded = EntityCreateBaseData::decode(&base.encode()).unwrap();

        assert_eq!(decoded.field_flags, base.field_flags);
        assert!(decoded.field_flags.contains(EntityCreateFlags::IGNORE_NAVI));
        assert_eq!(decoded.interest_policies, policies);
        assert_eq!(decoded.avatar_world_instance_id, 3);
        assert_eq!(decoded.active_power_ref, 9001);
        assert_eq!(decoded.source_entity_id, 5);
        assert!(decoded.source_position.approx_eq(settings.source_position, 0.25));
        assert!((decoded.bounds_scale_override - 1.5).abs() < 1e-3);
        assert_eq!(decoded.inventory_location, avatar.inventory_location);
        assert_eq!(decoded.inventory_location_prev, settings.inventory_location_prev);
        assert_eq!(decoded.attached_entities, vec![21, 22]);
    }

    #[test]
    fn test_player_create_carries_db_id() {
        let mut player = Entity::new(1, 77, EntityKind::Player);
        player.db_id = 0xDEAD_BEEF;
        let base = EntityCreateBaseData::from_entity(&player, InterestPolicies::OWNER, false, &EntitySettings::default());
        let decoded = EntityCreateBaseData::decode(&base.encode()).unwrap();
        assert!(decoded.field_flags.contains(EntityCreateFlags::HAS_DB_ID));
        assert_eq!(decoded.db_id, 0xDEAD_BEEF);
    }

    #[test]
    fn test_prev_location_requires_current() {
        let mut item = Entity::new(30, 5, EntityKind::Item);
        item.inventory_location = Some(InventoryLocation::new(2, 501, 4));
        let settings = EntitySettings {
            inventory_location_prev: Some(InventoryLocation::new(2, 501, 4)),
            ..Default::default()
        };

        let without = EntityCreateBaseData::from_entity(&item, InterestPolicies::OWNER, false, &settings);
        assert!(!without.field_flags.contains(EntityCreateFlags::HAS_INV_LOC));
        assert!(!without.field_flags.contains(EntityCreateFlags::HAS_INV_LOC_PREV));

        // Unchanged previous location is not repeated
        let with = EntityCreateBaseData::from_entity(&item, InterestPolicies::OWNER, true, &settings);
        assert!(with.field_flags.contains(EntityCreateFlags::HAS_INV_LOC));
        assert!(!with.field_flags.contains(EntityCreateFlags::HAS_INV_LOC_PREV));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let agent = in_world_agent(14);
        let mut data = EntityCreateBaseData::from_entity(&agent, InterestPolicies::PROXIMITY, false, &EntitySettings::default())
            .encode();
        data.push(0);
        assert_eq!(EntityCreateBaseData::decode(&data), Err(ArchiveError::TrailingBytes(1)));
    }

    #[test]
    fn test_build_entity_create_state_block() {
        let mut agent = in_world_agent(15);
        agent.properties.set(7, 250);
        let message = build_entity_create(&agent, InterestPolicies::PROXIMITY, false, &EntitySettings::from_entity(&agent))
            .unwrap();
        match message {
            ServerMessage::EntityCreate { archive_data, .. } => {
                let state = EntityArchiveState::decode(&archive_data).unwrap();
                assert_eq!(state.entity_id, 15);
                assert_eq!(state.kind, EntityKind::Agent);
                assert_eq!(state.properties, vec![(7, 250)]);
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[test]
    fn test_locomotion_update_relative() {
        let mut agent = in_world_agent(40);
        let old = moving_state();
        let mut new = old.clone();
        new.move_speed = 300.0;
        agent.locomotion = Some(new.clone());

        let message = build_locomotion_state_update(&agent, Some(&old), &new, false).unwrap();
        let ServerMessage::LocomotionStateUpdate { archive_data } = message else {
            panic!("expected a locomotion update");
        };
        let decoded = LocomotionUpdateArchive::decode(&archive_data, Some(&old)).unwrap();
        assert!(decoded.loco_flags.contains(LocomotionMessageFlags::RELATIVE_TO_PREVIOUS_STATE));
        assert!(decoded.loco_flags.contains(LocomotionMessageFlags::HAS_MOVE_SPEED));
        assert!(!decoded.loco_flags.contains(LocomotionMessageFlags::HAS_LOCOMOTION_FLAGS));
        assert_eq!(decoded.state.move_speed, 300.0);
        assert_eq!(decoded.state.flags, old.flags, "unchanged fields come from the previous state");
    }

    #[test]
    fn test_locomotion_update_requires_world() {
        let agent = Entity::new(41, 1, EntityKind::Agent);
        assert!(build_locomotion_state_update(&agent, None, &LocomotionState::default(), false).is_none());
    }

    #[test]
    fn test_enter_game_world_packs_extra_flags() {
        let mut avatar = in_world_agent(50).with_status(status::NEW_ON_SERVER);
        avatar.kind = EntityKind::Avatar;
        avatar.avatar_world_instance_id = 1;
        avatar.locomotion = Some(LocomotionState::new(600.0));
        avatar.attached_entities.push(51);

        let archive = EnterGameWorldArchive::from_entity(&avatar).unwrap();
        let data = archive.encode();

        // Combined flag word follows the header and entity id
        let mut reader = ArchiveReader::new(&data).unwrap();
        assert_eq!(reader.replication_policy(), InterestPolicies::PROXIMITY);
        reader.read_u64().unwrap();
        let combined = reader.read_u32().unwrap();
        assert_eq!(combined >> LOCO_FLAG_COUNT, archive.extra_flags.0);

        let decoded = EnterGameWorldArchive::decode(&data).unwrap();
        assert!(decoded.extra_flags.contains(EnterGameWorldFlags::HAS_AVATAR_WORLD_INSTANCE_ID));
        assert!(decoded.extra_flags.contains(EnterGameWorldFlags::IS_NEW_ON_SERVER));
        assert!(decoded.extra_flags.contains(EnterGameWorldFlags::HAS_ATTACHED_ENTITIES));
        assert_eq!(decoded.avatar_world_instance_id, 1);
        assert_eq!(decoded.attached_entities, vec![51]);
        assert_eq!(decoded.locomotion.map(|s| s.move_speed), Some(600.0));
    }

    #[test]
    fn test_enter_game_world_with_prototype_ref() {
        let agent = in_world_agent(60);
        let mut archive = EnterGameWorldArchive::from_entity(&agent).unwrap();
        archive.loco_flags.insert(LocomotionMessageFlags::HAS_ENTITY_PROTOTYPE_ID);
        let decoded = EnterGameWorldArchive::decode(&archive.encode()).unwrap();
        assert_eq!(decoded.prototype_ref, 4242);
        assert!(decoded.locomotion.is_none(), "agent without a locomotor sends no state");
    }
}
