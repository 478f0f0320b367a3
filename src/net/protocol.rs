use serde::{Deserialize, Serialize};

use crate::game::entity::{EntityId, PrototypeId};
use crate::game::inventory::InventoryLocation;
use crate::game::region::{AreaId, CellId, RegionId};
use crate::game::replication::ReplicationId;
use crate::net::policy::InterestPolicies;
use crate::util::vector::Vector3;

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Connection was attached to a region; tracking starts from scratch
    RegionChange {
        region_id: RegionId,
        region_prototype: PrototypeId,
        /// Reveal bitmap archive for the region's minimap
        minimap_archive: Vec<u8>,
    },
    AddArea {
        area_id: AreaId,
        area_prototype: PrototypeId,
        area_origin: Vector3,
        is_start_area: bool,
    },
    RemoveArea { area_id: AreaId },
    CellCreate {
        area_id: AreaId,
        cell_id: CellId,
        cell_prototype: PrototypeId,
        position_in_area: Vector3,
    },
    CellDestroy { area_id: AreaId, cell_id: CellId },
    /// Cells changed in a static area; the client rebuilds navigation
    EnvironmentUpdate { flags: u32 },
    UpdateMiniMap { archive_data: Vec<u8> },
    /// Base block plus full state archive
    EntityCreate {
        base_data: Vec<u8>,
        archive_data: Vec<u8>,
    },
    EntityDestroy { entity_id: EntityId },
    EntityEnterGameWorld { archive_data: Vec<u8> },
    LocomotionStateUpdate { archive_data: Vec<u8> },
    /// Client drops the given channels for an entity
    AoiPolicyForget {
        entity_id: EntityId,
        new_policies: InterestPolicies,
        removed_policies: InterestPolicies,
        exit_game_world: bool,
    },
    AoiPolicyChange {
        entity_id: EntityId,
        new_policies: InterestPolicies,
        previous_policies: InterestPolicies,
    },
    InventoryMove {
        entity_id: EntityId,
        location: InventoryLocation,
    },
    /// Avatar hierarchy is about to be torn down
    FullInWorldHierarchyUpdateBegin { entity_id: EntityId },
    /// Avatar and everything it carries has been created
    FullInWorldHierarchyUpdateEnd { entity_id: EntityId },
    SetReplicatedValue {
        replication_id: ReplicationId,
        data: Vec<u8>,
    },
    SetProperty {
        replication_id: ReplicationId,
        property_id: u32,
        value: i64,
    },
}

impl ServerMessage {
    /// Name used in logs and per-message metrics
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::RegionChange { .. } => "RegionChange",
            ServerMessage::AddArea { .. } => "AddArea",
            ServerMessage::RemoveArea { .. } => "RemoveArea",
            ServerMessage::CellCreate { .. } => "CellCreate",
            ServerMessage::CellDestroy { .. } => "CellDestroy",
            ServerMessage::EnvironmentUpdate { .. } => "EnvironmentUpdate",
            ServerMessage::UpdateMiniMap { .. } => "UpdateMiniMap",
            ServerMessage::EntityCreate { .. } => "EntityCreate",
            ServerMessage::EntityDestroy { .. } => "EntityDestroy",
            ServerMessage::EntityEnterGameWorld { .. } => "EntityEnterGameWorld",
            ServerMessage::LocomotionStateUpdate { .. } => "LocomotionStateUpdate",
            ServerMessage::AoiPolicyForget { .. } => "AoiPolicyForget",
            ServerMessage::AoiPolicyChange { .. } => "AoiPolicyChange",
            ServerMessage::InventoryMove { .. } => "InventoryMove",
            ServerMessage::FullInWorldHierarchyUpdateBegin { .. } => "FullInWorldHierarchyUpdateBegin",
            ServerMessage::FullInWorldHierarchyUpdateEnd { .. } => "FullInWorldHierarchyUpdateEnd",
            ServerMessage::SetReplicatedValue { .. } => "SetReplicatedValue",
            ServerMessage::SetProperty { .. } => "SetProperty",
        }
    }
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
