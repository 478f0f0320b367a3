//! Entity model as seen by interest management
//!
//! Entities carry just enough state for visibility decisions and for
//! building creation archives: kind, status bits, world location,
//! inventory placement and ownership.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::trace;

use crate::game::inventory::{Inventory, InventoryLocation};
use crate::game::locomotion::LocomotionState;
use crate::game::replication::ReplicatedPropertyCollection;
use crate::game::region::{AreaId, CellId};
use crate::net::policy::InterestPolicies;
use crate::util::vector::{Orientation, Vector3};

pub type EntityId = u64;
pub type PrototypeId = u64;

pub const INVALID_ENTITY_ID: EntityId = 0;
pub const INVALID_PROTOTYPE_ID: PrototypeId = 0;

/// Entity status bits
pub mod status {
    /// Entity is gone; only kept until references are cleaned up
    pub const DESTROYED: u32 = 1 << 0;
    /// Entity takes part in the simulation
    pub const SIMULATED: u32 = 1 << 1;
    /// Entity is placed in a region
    pub const IN_WORLD: u32 = 1 << 2;
    /// Entity is being removed from the world this frame
    pub const EXITING_WORLD: u32 = 1 << 3;
    pub const DEAD: u32 = 1 << 4;
    /// Player is fully in-game (players only)
    pub const IN_GAME: u32 = 1 << 5;
    /// Entity was created this frame
    pub const NEW_ON_SERVER: u32 = 1 << 6;
    /// Client should hide the entity
    pub const CLIENT_HIDDEN: u32 = 1 << 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Player,
    Avatar,
    Agent,
    Item,
    Missile,
    Hotspot,
    Transition,
    Prop,
}

impl EntityKind {
    /// Channels this kind of entity may ever be tracked through
    pub fn compatible_channels(self) -> InterestPolicies {
        use InterestPolicies as P;
        match self {
            EntityKind::Player => P::OWNER | P::PARTY | P::TRADER,
            EntityKind::Avatar => P::PROXIMITY | P::OWNER | P::PARTY | P::DISCOVERY,
            EntityKind::Agent => P::PROXIMITY | P::OWNER | P::DISCOVERY,
            EntityKind::Item => P::PROXIMITY | P::OWNER | P::TRADER | P::DISCOVERY,
            EntityKind::Missile => P::PROXIMITY | P::CLIENT_INDEPENDENT,
            EntityKind::Hotspot | EntityKind::Prop => P::PROXIMITY,
            EntityKind::Transition => P::PROXIMITY | P::DISCOVERY,
        }
    }

    #[inline]
    pub fn is_world_entity(self) -> bool {
        !matches!(self, EntityKind::Player)
    }
}

/// Where an in-world entity is
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionLocation {
    pub position: Vector3,
    pub orientation: Orientation,
    pub area_id: AreaId,
    pub cell_id: CellId,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub prototype_ref: PrototypeId,
    pub kind: EntityKind,
    /// Persistent id (players only)
    pub db_id: u64,
    status: u32,
    pub compatible_channels: InterestPolicies,
    /// Stay tracked through the discovery channel once seen
    pub track_after_discovery: bool,
    /// Item that can be picked up from the ground
    pub is_pickup: bool,
    /// Client simulates it after creation (fire-and-forget missiles)
    pub is_client_independent: bool,
    /// Only this player may ever see the entity
    pub restricted_to_player: Option<EntityId>,
    /// Party membership (players only)
    pub party_id: Option<u64>,
    pub avatar_world_instance_id: u32,
    pub location: Option<RegionLocation>,
    pub locomotion: Option<LocomotionState>,
    pub inventory_location: Option<InventoryLocation>,
    pub inventory_location_prev: Option<InventoryLocation>,
    pub inventories: SmallVec<[Inventory; 2]>,
    pub active_power_ref: PrototypeId,
    pub bounds_scale: f32,
    pub attached_entities: SmallVec<[EntityId; 4]>,
    /// Replicated properties, ordered for stable archives
    pub properties: ReplicatedPropertyCollection,
}

impl Entity {
    pub fn new(id: EntityId, prototype_ref: PrototypeId, kind: EntityKind) -> Self {
        Self {
            id,
            prototype_ref,
            kind,
            db_id: 0,
            status: status::SIMULATED,
            compatible_channels: kind.compatible_channels(),
            track_after_discovery: false,
            is_pickup: false,
            is_client_independent: false,
            restricted_to_player: None,
            party_id: None,
            avatar_world_instance_id: 0,
            location: None,
            locomotion: None,
            inventory_location: None,
            inventory_location_prev: None,
            inventories: SmallVec::new(),
            active_power_ref: INVALID_PROTOTYPE_ID,
            bounds_scale: 1.0,
            attached_entities: SmallVec::new(),
            properties: ReplicatedPropertyCollection::new(id),
        }
    }

    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventories.push(inventory);
        self
    }

    pub fn with_status(mut self, bits: u32) -> Self {
        self.status |= bits;
        self
    }

    #[inline]
    pub fn test_status(&self, bits: u32) -> bool {
        self.status & bits != 0
    }

    #[inline]
    pub fn set_status(&mut self, bits: u32, value: bool) {
        if value {
            self.status |= bits;
        } else {
            self.status &= !bits;
        }
    }

    pub fn status_bits(&self) -> u32 {
        self.status
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.test_status(status::DESTROYED)
    }

    #[inline]
    pub fn is_simulated(&self) -> bool {
        self.test_status(status::SIMULATED)
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.test_status(status::DEAD)
    }

    #[inline]
    pub fn is_in_world(&self) -> bool {
        self.test_status(status::IN_WORLD) && self.location.is_some()
    }

    #[inline]
    pub fn is_exiting_world(&self) -> bool {
        self.test_status(status::EXITING_WORLD)
    }

    #[inline]
    pub fn is_avatar(&self) -> bool {
        self.kind == EntityKind::Avatar
    }

    /// Container entity, if stored in an inventory
    #[inline]
    pub fn owner_id(&self) -> Option<EntityId> {
        self.inventory_location.map(|location| location.container_id)
    }

    pub fn position(&self) -> Option<Vector3> {
        self.location.map(|location| location.position)
    }

    pub fn inventory(&self, prototype_ref: PrototypeId) -> Option<&Inventory> {
        self.inventories.iter().find(|inv| inv.prototype_ref == prototype_ref)
    }

    pub fn inventory_mut(&mut self, prototype_ref: PrototypeId) -> Option<&mut Inventory> {
        self.inventories.iter_mut().find(|inv| inv.prototype_ref == prototype_ref)
    }

    /// Every entity stored in any of this entity's inventories
    pub fn contained_entity_ids(&self) -> SmallVec<[EntityId; 16]> {
        self.inventories.iter().flat_map(|inv| inv.entity_ids()).collect()
    }
}

/// Errors from entity bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("Entity {0} not found")]
    NotFound(EntityId),
    #[error("Entity id {0} already in use")]
    DuplicateId(EntityId),
    #[error("Entity {container} has no inventory {inventory_ref}")]
    InventoryNotFound { container: EntityId, inventory_ref: PrototypeId },
    #[error("Slot {slot} of inventory {inventory_ref} on entity {container} is unavailable")]
    SlotUnavailable { container: EntityId, inventory_ref: PrototypeId, slot: u32 },
    #[error("Entity {0} cannot be stored inside itself")]
    SelfContainment(EntityId),
}

// ============================================================================
// Entity Manager
// ============================================================================

/// Owns every entity of a game session
#[derive(Debug, Default)]
pub struct EntityManager {
    entities: FxHashMap<EntityId, Entity>,
    next_id: EntityId,
}

impl EntityManager {
    pub fn new() -> Self {
        Self {
            entities: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// Reserve a fresh entity id
    pub fn next_entity_id(&mut self) -> EntityId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    pub fn insert(&mut self, entity: Entity) -> Result<EntityId, EntityError> {
        let id = entity.id;
        if id == INVALID_ENTITY_ID || self.entities.contains_key(&id) {
            return Err(EntityError::DuplicateId(id));
        }
        self.next_id = self.next_id.max(id + 1);
        self.entities.insert(id, entity);
        trace!("Entity {} registered", id);
        Ok(id)
    }

    /// Drop an entity entirely (after it was destroyed and every connection forgot it)
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        if let Some(location) = entity.inventory_location {
            if let Some(container) = self.entities.get_mut(&location.container_id) {
                if let Some(inventory) = container.inventory_mut(location.inventory_ref) {
                    inventory.remove(id);
                }
            }
        }
        Some(entity)
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Store `entity_id` in a container's inventory, taking it out of its
    /// previous one. The old location is kept as the previous location.
    pub fn move_to_inventory(&mut self, entity_id: EntityId, location: InventoryLocation) -> Result<(), EntityError> {
        if entity_id == location.container_id {
            return Err(EntityError::SelfContainment(entity_id));
        }
        let previous = self
            .entities
            .get(&entity_id)
            .ok_or(EntityError::NotFound(entity_id))?
            .inventory_location;

        let container = self
            .entities
            .get(&location.container_id)
            .ok_or(EntityError::NotFound(location.container_id))?;
        let inventory = container
            .inventory(location.inventory_ref)
            .ok_or(EntityError::InventoryNotFound {
                container: location.container_id,
                inventory_ref: location.inventory_ref,
            })?;
        let slot_taken = inventory
            .entity_in_slot(location.slot)
            .is_some_and(|occupant| occupant != entity_id);
        if location.slot >= inventory.capacity || slot_taken {
            return Err(EntityError::SlotUnavailable {
                container: location.container_id,
                inventory_ref: location.inventory_ref,
                slot: location.slot,
            });
        }

        if let Some(previous) = previous {
            if let Some(inventory) = self
                .entities
                .get_mut(&previous.container_id)
                .and_then(|container| container.inventory_mut(previous.inventory_ref))
            {
                inventory.remove(entity_id);
            }
        }
        if let Some(inventory) = self
            .entities
            .get_mut(&location.container_id)
            .and_then(|container| container.inventory_mut(location.inventory_ref))
        {
            inventory.insert(location.slot, entity_id);
        }

        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.inventory_location_prev = previous;
            entity.inventory_location = Some(location);
        }
        Ok(())
    }

    /// Take an entity out of its inventory
    pub fn remove_from_inventory(&mut self, entity_id: EntityId) -> Result<(), EntityError> {
        let entity = self.entities.get_mut(&entity_id).ok_or(EntityError::NotFound(entity_id))?;
        let Some(location) = entity.inventory_location.take() else {
            return Ok(());
        };
        entity.inventory_location_prev = Some(location);

        if let Some(inventory) = self
            .entities
            .get_mut(&location.container_id)
            .and_then(|container| container.inventory_mut(location.inventory_ref))
        {
            inventory.remove(entity_id);
        }
        Ok(())
    }

    /// Whether `player_id` owns `entity_id` through a chain of containers.
    /// Every entity owns itself. The walk stops after `max_depth` links.
    pub fn is_owned_by(&self, entity_id: EntityId, player_id: EntityId, max_depth: usize) -> bool {
        let mut current = entity_id;
        for _ in 0..=max_depth {
            if current == player_id {
                return true;
            }
            match self.entities.get(&current).and_then(|entity| entity.owner_id()) {
                Some(owner) => current = owner,
                None => return false,
            }
        }
        false
    }

    /// Topmost player in the ownership chain, if any
    pub fn owning_player(&self, entity_id: EntityId, max_depth: usize) -> Option<&Entity> {
        let mut current = self.entities.get(&entity_id)?;
        for _ in 0..=max_depth {
            if current.kind == EntityKind::Player {
                return Some(current);
            }
            current = self.entities.get(&current.owner_id()?)?;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::inventory::InventoryCategory;

    const AVATAR_LIBRARY: PrototypeId = 500;
    const EQUIPMENT: PrototypeId = 501;

    fn manager_with_player() -> EntityManager {
        let mut manager = EntityManager::new();
        manager
            .insert(
                Entity::new(1, 100, EntityKind::Player)
                    .with_inventory(Inventory::new(AVATAR_LIBRARY, InventoryCategory::Storage)),
            )
            .unwrap();
        manager
            .insert(
                Entity::new(2, 200, EntityKind::Avatar)
                    .with_inventory(Inventory::new(EQUIPMENT, InventoryCategory::OnPerson).with_capacity(4)),
            )
            .unwrap();
        manager.insert(Entity::new(3, 300, EntityKind::Item)).unwrap();
        manager
    }

    #[test]
    fn test_insert_duplicate() {
        let mut manager = manager_with_player();
        assert_eq!(
            manager.insert(Entity::new(1, 100, EntityKind::Player)),
            Err(EntityError::DuplicateId(1))
        );
        assert_eq!(manager.next_entity_id(), 4);
    }

    #[test]
    fn test_default_status() {
        let entity = Entity::new(9, 1, EntityKind::Agent);
        assert!(entity.is_simulated());
        assert!(!entity.is_in_world(), "no location means not in world");
        assert!(!entity.is_destroyed());
    }

    #[test]
    fn test_move_to_inventory_tracks_previous() {
        let mut manager = manager_with_player();
        manager.move_to_inventory(2, InventoryLocation::new(1, AVATAR_LIBRARY, 0)).unwrap();
        manager.move_to_inventory(3, InventoryLocation::new(2, EQUIPMENT, 0)).unwrap();
        manager.move_to_inventory(3, InventoryLocation::new(2, EQUIPMENT, 1)).unwrap();

        let item = manager.get(3).unwrap();
        assert_eq!(item.inventory_location.map(|l| l.slot), Some(1));
        assert_eq!(item.inventory_location_prev.map(|l| l.slot), Some(0));

        let avatar = manager.get(2).unwrap();
        assert_eq!(avatar.contained_entity_ids().as_slice(), &[3]);
    }

    #[test]
    fn test_move_to_inventory_errors() {
        let mut manager = manager_with_player();
        assert_eq!(
            manager.move_to_inventory(3, InventoryLocation::new(2, 999, 0)),
            Err(EntityError::InventoryNotFound { container: 2, inventory_ref: 999 })
        );
        assert_eq!(
            manager.move_to_inventory(3, InventoryLocation::new(2, EQUIPMENT, 7)),
            Err(EntityError::SlotUnavailable { container: 2, inventory_ref: EQUIPMENT, slot: 7 })
        );
        assert_eq!(
            manager.move_to_inventory(2, InventoryLocation::new(2, EQUIPMENT, 0)),
            Err(EntityError::SelfContainment(2))
        );
    }

    #[test]
    fn test_ownership_chain() {
        let mut manager = manager_with_player();
        manager.move_to_inventory(2, InventoryLocation::new(1, AVATAR_LIBRARY, 0)).unwrap();
        manager.move_to_inventory(3, InventoryLocation::new(2, EQUIPMENT, 0)).unwrap();

        assert!(manager.is_owned_by(3, 1, 8));
        assert!(manager.is_owned_by(1, 1, 8), "ownership is reflexive");
        assert!(!manager.is_owned_by(3, 99, 8));
        assert!(!manager.is_owned_by(3, 1, 1), "chain longer than depth limit");
        assert_eq!(manager.owning_player(3, 8).map(|p| p.id), Some(1));
    }

    #[test]
    fn test_remove_cleans_container() {
        let mut manager = manager_with_player();
        manager.move_to_inventory(3, InventoryLocation::new(2, EQUIPMENT, 0)).unwrap();
        assert!(manager.remove(3).is_some());
        assert!(manager.get(2).unwrap().contained_entity_ids().is_empty());
    }

    #[test]
    fn test_remove_from_inventory() {
        let mut manager = manager_with_player();
        manager.move_to_inventory(3, InventoryLocation::new(2, EQUIPMENT, 2)).unwrap();
        manager.remove_from_inventory(3).unwrap();

        let item = manager.get(3).unwrap();
        assert!(item.inventory_location.is_none());
        assert_eq!(item.inventory_location_prev.map(|l| l.slot), Some(2));
        assert!(manager.get(2).unwrap().contained_entity_ids().is_empty());
    }
}
