//! Inventory containers and locations
//!
//! Only the parts of inventories that matter for visibility live here:
//! where an entity is stored, what category the container is, and which
//! channels may see its contents.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::game::entity::{EntityId, PrototypeId};
use crate::net::archive::{ArchiveError, ArchiveReader, ArchiveWriter};

/// Where an entity is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryLocation {
    pub container_id: EntityId,
    pub inventory_ref: PrototypeId,
    pub slot: u32,
}

impl InventoryLocation {
    pub fn new(container_id: EntityId, inventory_ref: PrototypeId, slot: u32) -> Self {
        Self {
            container_id,
            inventory_ref,
            slot,
        }
    }

    pub fn encode(&self, writer: &mut ArchiveWriter) {
        writer.write_u64(self.container_id);
        writer.write_u64(self.inventory_ref);
        writer.write_u32(self.slot);
    }

    pub fn decode(reader: &mut ArchiveReader) -> Result<Self, ArchiveError> {
        Ok(Self {
            container_id: reader.read_u64()?,
            inventory_ref: reader.read_u64()?,
            slot: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCategory {
    /// Worn or equipped (costume, gear, active avatar slot)
    OnPerson,
    /// General bags carried by an avatar
    Bag,
    /// Player-level storage (stash, avatar library)
    Storage,
    /// Quest and system bookkeeping
    Internal,
}

impl InventoryCategory {
    #[inline]
    pub fn is_on_person(self) -> bool {
        matches!(self, InventoryCategory::OnPerson)
    }
}

/// One inventory owned by a container entity
#[derive(Debug, Clone)]
pub struct Inventory {
    pub prototype_ref: PrototypeId,
    pub category: InventoryCategory,
    /// Contents are shown to the container's owning player
    pub visible_to_owner: bool,
    /// Contents are shown to anyone who sees the container
    pub visible_to_proximity: bool,
    pub capacity: u32,
    contents: SmallVec<[(u32, EntityId); 8]>,
}

impl Inventory {
    pub fn new(prototype_ref: PrototypeId, category: InventoryCategory) -> Self {
        let (visible_to_owner, visible_to_proximity) = match category {
            InventoryCategory::OnPerson => (true, true),
            InventoryCategory::Bag | InventoryCategory::Storage => (true, false),
            InventoryCategory::Internal => (false, false),
        };
        Self {
            prototype_ref,
            category,
            visible_to_owner,
            visible_to_proximity,
            capacity: u32::MAX,
            contents: SmallVec::new(),
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_visibility(mut self, to_owner: bool, to_proximity: bool) -> Self {
        self.visible_to_owner = to_owner;
        self.visible_to_proximity = to_proximity;
        self
    }

    pub fn entity_in_slot(&self, slot: u32) -> Option<EntityId> {
        self.contents.iter().find(|(s, _)| *s == slot).map(|(_, id)| *id)
    }

    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.contents.iter().any(|(_, id)| *id == entity_id)
    }

    /// Entity ids in slot order
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.contents.iter().map(|(_, id)| *id)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Returns false if the slot is taken or out of capacity
    pub(crate) fn insert(&mut self, slot: u32, entity_id: EntityId) -> bool {
        if slot >= self.capacity || self.entity_in_slot(slot).is_some() {
            return false;
        }
        let index = self.contents.partition_point(|(s, _)| *s < slot);
        self.contents.insert(index, (slot, entity_id));
        true
    }

    pub(crate) fn remove(&mut self, entity_id: EntityId) -> bool {
        match self.contents.iter().position(|(_, id)| *id == entity_id) {
            Some(index) => {
                self.contents.remove(index);
                true
            }
            None => false,
        }
    }
}
