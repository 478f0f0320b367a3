//! Region, area and cell model
//!
//! A region is a playable map split into areas, each of which is split
//! into cells. The interest engine only reads it: bounds queries for
//! areas/cells and volume queries for in-world entities.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::game::entity::{EntityId, PrototypeId};
use crate::game::spatial::EntityGrid;
use crate::util::aabb2::Aabb2;
use crate::util::vector::{Vector2, Vector3};

pub type RegionId = u64;
pub type AreaId = u32;
pub type CellId = u32;

#[derive(Debug, Clone)]
pub struct Area {
    pub id: AreaId,
    pub prototype_ref: PrototypeId,
    pub origin: Vector3,
    pub bounds: Aabb2,
    /// Procedurally spawned area; changes to it do not refresh the environment
    pub is_dynamic: bool,
    cell_ids: SmallVec<[CellId; 16]>,
}

impl Area {
    pub fn new(id: AreaId, prototype_ref: PrototypeId, origin: Vector3, bounds: Aabb2) -> Self {
        Self {
            id,
            prototype_ref,
            origin,
            bounds,
            is_dynamic: false,
            cell_ids: SmallVec::new(),
        }
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    pub fn cell_ids(&self) -> &[CellId] {
        &self.cell_ids
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub id: CellId,
    pub area_id: AreaId,
    pub prototype_ref: PrototypeId,
    /// Cell origin relative to its area origin
    pub position_in_area: Vector3,
    pub bounds: Aabb2,
}

impl Cell {
    pub fn new(id: CellId, area_id: AreaId, prototype_ref: PrototypeId, position_in_area: Vector3, bounds: Aabb2) -> Self {
        Self {
            id,
            area_id,
            prototype_ref,
            position_in_area,
            bounds,
        }
    }
}

/// Errors from building a region
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("Area {0} already exists")]
    DuplicateArea(AreaId),
    #[error("Cell {0} already exists")]
    DuplicateCell(CellId),
    #[error("Area {0} not found")]
    AreaNotFound(AreaId),
    #[error("No cell contains the position")]
    NoCellAtPosition,
}

#[derive(Debug)]
pub struct Region {
    pub id: RegionId,
    pub prototype_ref: PrototypeId,
    /// Reveal the whole minimap on entry
    pub always_reveal_full_map: bool,
    bounds: Aabb2,
    start_area: Option<AreaId>,
    areas: Vec<Area>,
    area_index: FxHashMap<AreaId, usize>,
    cells: Vec<Cell>,
    cell_index: FxHashMap<CellId, usize>,
    entity_grid: EntityGrid,
}

impl Region {
    pub fn new(id: RegionId, prototype_ref: PrototypeId) -> Self {
        Self {
            id,
            prototype_ref,
            always_reveal_full_map: false,
            bounds: Aabb2::ZERO,
            start_area: None,
            areas: Vec::new(),
            area_index: FxHashMap::default(),
            cells: Vec::new(),
            cell_index: FxHashMap::default(),
            entity_grid: EntityGrid::default(),
        }
    }

    /// Add an area. The first area becomes the start area.
    pub fn add_area(&mut self, area: Area) -> Result<AreaId, RegionError> {
        if self.area_index.contains_key(&area.id) {
            return Err(RegionError::DuplicateArea(area.id));
        }
        self.bounds = if self.areas.is_empty() {
            area.bounds
        } else {
            Aabb2::new(self.bounds.min.min(area.bounds.min), self.bounds.max.max(area.bounds.max))
        };
        let id = area.id;
        self.start_area.get_or_insert(id);
        self.area_index.insert(id, self.areas.len());
        self.areas.push(area);
        Ok(id)
    }

    pub fn add_cell(&mut self, cell: Cell) -> Result<CellId, RegionError> {
        if self.cell_index.contains_key(&cell.id) {
            return Err(RegionError::DuplicateCell(cell.id));
        }
        let area_slot = *self
            .area_index
            .get(&cell.area_id)
            .ok_or(RegionError::AreaNotFound(cell.area_id))?;
        let id = cell.id;
        self.areas[area_slot].cell_ids.push(id);
        self.cell_index.insert(id, self.cells.len());
        self.cells.push(cell);
        Ok(id)
    }

    pub fn set_start_area(&mut self, area_id: AreaId) -> Result<(), RegionError> {
        if !self.area_index.contains_key(&area_id) {
            return Err(RegionError::AreaNotFound(area_id));
        }
        self.start_area = Some(area_id);
        Ok(())
    }

    pub fn start_area(&self) -> Option<&Area> {
        self.start_area.and_then(|id| self.area(id))
    }

    pub fn bounds(&self) -> Aabb2 {
        self.bounds
    }

    pub fn area(&self, id: AreaId) -> Option<&Area> {
        self.area_index.get(&id).map(|&slot| &self.areas[slot])
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cell_index.get(&id).map(|&slot| &self.cells[slot])
    }

    /// Areas in insertion order
    pub fn areas(&self) -> impl Iterator<Item = &Area> {
        self.areas.iter()
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Cells whose bounds overlap `volume`, in insertion order
    pub fn cells_in_volume<'a>(&'a self, volume: &'a Aabb2) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells.iter().filter(move |cell| cell.bounds.intersects(volume))
    }

    /// First cell containing the point
    pub fn cell_at(&self, position: Vector3) -> Option<&Cell> {
        let point = position.xy();
        self.cells.iter().find(|cell| cell.bounds.contains_point(point))
    }

    // ------------------------------------------------------------------------
    // Entity index
    // ------------------------------------------------------------------------

    pub(crate) fn index_entity(&mut self, entity_id: EntityId, position: Vector3) {
        self.entity_grid.update(entity_id, position.xy());
    }

    pub(crate) fn unindex_entity(&mut self, entity_id: EntityId) -> bool {
        self.entity_grid.remove(entity_id)
    }

    /// In-world entities whose position is inside `volume`
    pub fn entities_in_volume<'a>(&'a self, volume: &'a Aabb2) -> impl Iterator<Item = EntityId> + 'a {
        self.entity_grid.query_volume(volume)
    }

    pub fn entity_grid(&self) -> &EntityGrid {
        &self.entity_grid
    }
}

/// Build a rectangular region of `areas_x * areas_y` areas, each split into
/// `cells_per_side²` cells. Ids are assigned in row order starting at 1.
pub fn build_grid_region(
    id: RegionId,
    prototype_ref: PrototypeId,
    areas_x: u32,
    areas_y: u32,
    area_size: f32,
    cells_per_side: u32,
) -> Result<Region, RegionError> {
    let mut region = Region::new(id, prototype_ref);
    let cell_size = area_size / cells_per_side.max(1) as f32;
    let mut next_cell_id: CellId = 1;

    for ay in 0..areas_y {
        for ax in 0..areas_x {
            let area_id = ay * areas_x + ax + 1;
            let origin = Vector3::new(ax as f32 * area_size, ay as f32 * area_size, 0.0);
            let bounds = Aabb2::new(origin.xy(), origin.xy() + Vector2::new(area_size, area_size));
            region.add_area(Area::new(area_id, 1000 + area_id as u64, origin, bounds))?;

            for cy in 0..cells_per_side {
                for cx in 0..cells_per_side {
                    let offset = Vector3::new(cx as f32 * cell_size, cy as f32 * cell_size, 0.0);
                    let cell_min = (origin + offset).xy();
                    let cell_bounds = Aabb2::new(
                        cell_min,
                        cell_min + Vector2::new(cell_size, cell_size),
                    );
                    region.add_cell(Cell::new(next_cell_id, area_id, 2000, offset, cell_bounds))?;
                    next_cell_id += 1;
                }
            }
        }
    }
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_region_layout() {
        let region = build_grid_region(1, 10, 3, 2, 1000.0, 2).unwrap();
        assert_eq!(region.area_count(), 6);
        assert_eq!(region.cell_count(), 24);
        assert_eq!(region.start_area().map(|a| a.id), Some(1));
        assert_eq!(region.bounds().max, Vector2::new(3000.0, 2000.0));

        let area = region.area(5).unwrap();
        assert_eq!(area.cell_ids().len(), 4);
        for cell_id in area.cell_ids() {
            let cell = region.cell(*cell_id).unwrap();
            assert!(area.bounds.contains(&cell.bounds), "cell {} outside its area", cell_id);
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut region = build_grid_region(1, 10, 1, 1, 100.0, 1).unwrap();
        let bounds = Aabb2::from_center(Vector2::ZERO, 10.0);
        assert_eq!(
            region.add_area(Area::new(1, 0, Vector3::ZERO, bounds)),
            Err(RegionError::DuplicateArea(1))
        );
        assert_eq!(
            region.add_cell(Cell::new(1, 1, 0, Vector3::ZERO, bounds)),
            Err(RegionError::DuplicateCell(1))
        );
        assert_eq!(
            region.add_cell(Cell::new(99, 42, 0, Vector3::ZERO, bounds)),
            Err(RegionError::AreaNotFound(42))
        );
    }

    #[test]
    fn test_cell_queries() {
        let region = build_grid_region(1, 10, 2, 1, 1000.0, 2).unwrap();
        let cell = region.cell_at(Vector3::new(1600.0, 200.0, 0.0)).unwrap();
        assert_eq!(cell.area_id, 2);

        let volume = Aabb2::new(Vector2::new(0.0, 0.0), Vector2::new(400.0, 400.0));
        let ids: Vec<_> = region.cells_in_volume(&volume).map(|c| c.id).collect();
        assert_eq!(ids, vec![1]);

        assert!(region.cell_at(Vector3::new(-10.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_entity_index() {
        let mut region = build_grid_region(1, 10, 2, 2, 1000.0, 1).unwrap();
        region.index_entity(7, Vector3::new(100.0, 100.0, 0.0));
        region.index_entity(8, Vector3::new(1900.0, 1900.0, 0.0));

        let volume = Aabb2::new(Vector2::new(0.0, 0.0), Vector2::new(1000.0, 1000.0));
        let ids: Vec<_> = region.entities_in_volume(&volume).collect();
        assert_eq!(ids, vec![7]);

        assert!(region.unindex_entity(7));
        assert_eq!(region.entities_in_volume(&volume).count(), 0);
    }
}
