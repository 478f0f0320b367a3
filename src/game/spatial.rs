//! Spatial hash grid for in-world entities
//!
//! Buckets entity positions by grid cell so volume queries only visit the
//! buckets a box overlaps. Positions are 2D; height does not matter for
//! interest.

use hashbrown::HashMap;
use rustc_hash::FxHashMap;

use crate::game::entity::EntityId;
use crate::util::aabb2::Aabb2;
use crate::util::vector::Vector2;

/// Default bucket size (world units). Roughly one cell.
pub const ENTITY_GRID_CELL_SIZE: f32 = 512.0;

/// Initial capacity for the bucket map (number of expected non-empty buckets)
const ENTITY_GRID_INITIAL_CAPACITY: usize = 256;

/// Initial capacity for entity vectors within buckets
const ENTITY_BUCKET_INITIAL_CAPACITY: usize = 8;

/// Grid bucket key - (x, y) bucket coordinates
pub type BucketKey = (i32, i32);

#[derive(Debug, Clone)]
pub struct EntityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    buckets: HashMap<BucketKey, Vec<(EntityId, Vector2)>>,
    /// Which bucket each entity is in, for O(1) removal
    locations: FxHashMap<EntityId, BucketKey>,
}

impl EntityGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            buckets: HashMap::with_capacity(ENTITY_GRID_INITIAL_CAPACITY),
            locations: FxHashMap::default(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[inline]
    fn position_to_bucket(&self, position: Vector2) -> BucketKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
        )
    }

    /// Insert or move an entity
    pub fn update(&mut self, entity_id: EntityId, position: Vector2) {
        let key = self.position_to_bucket(position);
        if let Some(old_key) = self.locations.insert(entity_id, key) {
            if let Some(bucket) = self.buckets.get_mut(&old_key) {
                if let Some(index) = bucket.iter().position(|(id, _)| *id == entity_id) {
                    bucket.swap_remove(index);
                }
            }
        }
        self.buckets
            .entry(key)
            .or_insert_with(|| Vec::with_capacity(ENTITY_BUCKET_INITIAL_CAPACITY))
            .push((entity_id, position));
    }

    /// Returns true if the entity was in the grid
    pub fn remove(&mut self, entity_id: EntityId) -> bool {
        let Some(key) = self.locations.remove(&entity_id) else {
            return false;
        };
        if let Some(bucket) = self.buckets.get_mut(&key) {
            if let Some(index) = bucket.iter().position(|(id, _)| *id == entity_id) {
                bucket.swap_remove(index);
            }
        }
        true
    }

    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.locations.contains_key(&entity_id)
    }

    /// Entities whose position lies inside `volume` (inclusive)
    pub fn query_volume<'a>(&'a self, volume: &'a Aabb2) -> impl Iterator<Item = EntityId> + 'a {
        let (min_x, min_y) = self.position_to_bucket(volume.min);
        let (max_x, max_y) = self.position_to_bucket(volume.max);

        (min_x..=max_x).flat_map(move |bx| {
            (min_y..=max_y).flat_map(move |by| {
                self.buckets
                    .get(&(bx, by))
                    .into_iter()
                    .flat_map(|bucket| bucket.iter())
                    .filter(move |(_, position)| volume.contains_point(*position))
                    .map(|(id, _)| *id)
            })
        })
    }

    pub fn clear(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
        self.locations.clear();
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn stats(&self) -> EntityGridStats {
        EntityGridStats {
            non_empty_buckets: self.buckets.values().filter(|b| !b.is_empty()).count(),
            total_entities: self.locations.len(),
            max_per_bucket: self.buckets.values().map(|b| b.len()).max().unwrap_or(0),
        }
    }
}

impl Default for EntityGrid {
    fn default() -> Self {
        Self::new(ENTITY_GRID_CELL_SIZE)
    }
}

/// Statistics about the grid
#[derive(Debug, Clone)]
pub struct EntityGridStats {
    pub non_empty_buckets: usize,
    pub total_entities: usize,
    pub max_per_bucket: usize,
}
