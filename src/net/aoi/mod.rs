//! Area of Interest (AOI) engine
//!
//! One `AreaOfInterest` per connection decides which areas, cells and
//! entities of its region the client knows about, and emits the messages
//! that move the client from its previous view to the current one.
//!
//! A visibility pass runs in this order:
//! 1. volumes are recomputed when the player moved far enough (or forced)
//! 2. entities: spatial scan over the visible volume, then a fallback scan
//!    over tracked entities the spatial scan did not reach. Transitions
//!    are queued and drained FIFO.
//! 3. areas, then cells. Cell changes in static areas trigger an
//!    environment update and a minimap refresh.
//!
//! The first pass after attaching only adds the start area (and whatever
//! the area/cell scan finds); entities follow once the client has cells.

pub mod resolver;
pub mod volumes;

use std::cell::RefCell;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

pub use resolver::{resolve_container_mask, resolve_policies, ResolveContext};
pub use volumes::{sanitize_aoi_volume, InterestVolumes, VolumeCalculator};

use crate::config::InterestConfig;
use crate::game::constants::aoi::ENVIRONMENT_UPDATE_CELLS_CHANGED;
use crate::game::entity::{Entity, EntityId, EntityManager};
use crate::game::minimap::LowResMap;
use crate::game::region::{Area, AreaId, CellId, Region, RegionId};
use crate::net::archive_builder::{build_enter_game_world, build_entity_create, EntitySettings};
use crate::net::connection::ConnectionOutbox;
use crate::net::policy::{InterestPolicies, PolicyDelta};
use crate::net::protocol::{EncodeError, ServerMessage};
use crate::util::vector::Vector3;

// Thread-local reusable buffers to avoid per-pass allocations
thread_local! {
    /// Entity ids gathered by the spatial and fallback scans
    static ENTITY_SCAN_BUFFER: RefCell<Vec<EntityId>> = RefCell::new(Vec::with_capacity(256));
    /// Transitions queued by the entity scans
    static PENDING_OPS_BUFFER: RefCell<Vec<PendingLifecycleOp>> = RefCell::new(Vec::with_capacity(64));
}

fn take_buffer<T: 'static>(key: &'static std::thread::LocalKey<RefCell<Vec<T>>>) -> Vec<T> {
    key.with(|buffer| std::mem::take(&mut *buffer.borrow_mut()))
}

fn return_buffer<T: 'static>(key: &'static std::thread::LocalKey<RefCell<Vec<T>>>, mut buffer: Vec<T>) {
    buffer.clear();
    key.with(|slot| *slot.borrow_mut() = buffer);
}

// ============================================================================
// Errors and hooks
// ============================================================================

/// Invariant violations in the lifecycle engine. Nothing is mutated when
/// one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterestError {
    #[error("Entity {0} is already tracked")]
    AlreadyTracked(EntityId),
    #[error("Entity {0} is not tracked")]
    NotTracked(EntityId),
    #[error("Entity {0} cannot be tracked with no interest channels")]
    EmptyPolicies(EntityId),
    #[error("Cell {0} is not tracked")]
    CellNotTracked(CellId),
    #[error("Connection is not attached to a region")]
    NoRegion,
    #[error("Connection is attached to region {attached}, not {given}")]
    RegionMismatch { attached: RegionId, given: RegionId },
    #[error("Entity {0} not found")]
    EntityNotFound(EntityId),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Callbacks around entity transitions of one connection. Hooks see the
/// entity as it is; they must not block.
pub trait InterestObserver: Send + Sync {
    fn before_add(&self, _player_id: EntityId, _entity: &Entity, _policies: InterestPolicies) {}
    fn after_add(&self, _player_id: EntityId, _entity: &Entity, _policies: InterestPolicies) {}
    fn before_remove(&self, _player_id: EntityId, _entity: &Entity, _previous: InterestPolicies) {}
    fn after_remove(&self, _player_id: EntityId, _entity: &Entity, _previous: InterestPolicies) {}
    fn before_modify(
        &self,
        _player_id: EntityId,
        _entity: &Entity,
        _policies: InterestPolicies,
        _previous: InterestPolicies,
    ) {
    }
    fn after_modify(
        &self,
        _player_id: EntityId,
        _entity: &Entity,
        _policies: InterestPolicies,
        _previous: InterestPolicies,
    ) {
    }
}

/// Observer with every hook left empty
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl InterestObserver for NoopObserver {}

/// Read-only world handed to every pass
#[derive(Clone, Copy)]
pub struct WorldView<'a> {
    pub region: &'a Region,
    pub entities: &'a EntityManager,
    pub observer: &'a dyn InterestObserver,
}

impl<'a> WorldView<'a> {
    pub fn new(region: &'a Region, entities: &'a EntityManager) -> Self {
        Self {
            region,
            entities,
            observer: &NoopObserver,
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn InterestObserver) -> Self {
        self.observer = observer;
        self
    }
}

// ============================================================================
// Tracking records
// ============================================================================

/// Area the client has been told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedArea {
    pub frame: u64,
}

/// Cell the client has been told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedCell {
    pub area_id: AreaId,
    pub frame: u64,
    /// Client acknowledged loading the cell
    pub is_loaded: bool,
}

/// Entity the client has been told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedEntity {
    /// Last pass that resolved this entity
    pub frame: u64,
    /// Channels the client tracks the entity through; never empty
    pub policies: InterestPolicies,
    pub inventory_location_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Add,
    Remove,
    Modify,
}

/// Transition queued during the entity scans and applied after them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLifecycleOp {
    pub kind: LifecycleKind,
    pub entity_id: EntityId,
    pub new_policies: InterestPolicies,
}

impl PendingLifecycleOp {
    /// Transition from `previous` to `new`, or None if nothing changes
    pub fn between(entity_id: EntityId, previous: InterestPolicies, new: InterestPolicies) -> Option<Self> {
        let kind = match (previous.is_empty(), new.is_empty()) {
            (true, true) => return None,
            (true, false) => LifecycleKind::Add,
            (false, true) => LifecycleKind::Remove,
            (false, false) if previous == new => return None,
            (false, false) => LifecycleKind::Modify,
        };
        Some(Self {
            kind,
            entity_id,
            new_policies: new,
        })
    }
}

/// What one pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub frame: u64,
    pub volumes_recomputed: bool,
    pub environment_changed: bool,
    pub areas_added: u32,
    pub areas_removed: u32,
    pub cells_created: u32,
    pub cells_destroyed: u32,
    pub entities_added: u32,
    pub entities_removed: u32,
    pub entities_modified: u32,
    pub ops_skipped: u32,
    pub messages_sent: u64,
}

// ============================================================================
// Area of Interest
// ============================================================================

/// Per-connection view of one region
#[derive(Debug)]
pub struct AreaOfInterest {
    player_entity_id: EntityId,
    outbox: ConnectionOutbox,
    region_id: Option<RegionId>,
    volume_calc: VolumeCalculator,
    volumes: InterestVolumes,
    last_update_position: Option<Vector3>,
    update_distance_sq: f32,
    max_container_depth: usize,
    current_frame: u64,
    needs_start: bool,
    volumes_dirty: bool,
    tracked_areas: FxHashMap<AreaId, TrackedArea>,
    tracked_cells: FxHashMap<CellId, TrackedCell>,
    tracked_entities: FxHashMap<EntityId, TrackedEntity>,
    loaded_cell_count: usize,
    minimap: Option<LowResMap>,
    pass: PassSummary,
}

impl AreaOfInterest {
    pub fn new(player_entity_id: EntityId, outbox: ConnectionOutbox, config: &InterestConfig) -> Self {
        Self {
            player_entity_id,
            outbox,
            region_id: None,
            volume_calc: VolumeCalculator::new(config.aoi_volume),
            volumes: InterestVolumes::default(),
            last_update_position: None,
            update_distance_sq: config.update_distance * config.update_distance,
            max_container_depth: config.max_container_depth,
            current_frame: 0,
            needs_start: false,
            volumes_dirty: true,
            tracked_areas: FxHashMap::default(),
            tracked_cells: FxHashMap::default(),
            tracked_entities: FxHashMap::default(),
            loaded_cell_count: 0,
            minimap: None,
            pass: PassSummary::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Region attach / detach
    // ------------------------------------------------------------------------

    /// Start tracking `view.region` from scratch. A previous region is
    /// detached first.
    pub fn attach(&mut self, view: &WorldView<'_>) {
        if self.region_id.is_some() {
            self.detach(view);
        }
        let region = view.region;
        let minimap = LowResMap::new(region.bounds(), region.always_reveal_full_map);
        self.send(ServerMessage::RegionChange {
            region_id: region.id,
            region_prototype: region.prototype_ref,
            minimap_archive: minimap.to_archive(),
        });
        self.outbox.flush();

        self.minimap = Some(minimap);
        self.region_id = Some(region.id);
        self.needs_start = true;
        self.volumes_dirty = true;
        self.last_update_position = None;
        info!(
            "Player {} attached to region {} ({} areas, {} cells)",
            self.player_entity_id,
            region.id,
            region.area_count(),
            region.cell_count()
        );
    }

    /// Forget everything about the current region. Entities go through
    /// Remove so hooks fire; areas and cells are dropped silently.
    pub fn detach(&mut self, view: &WorldView<'_>) {
        let Some(region_id) = self.region_id.take() else {
            return;
        };

        let mut ids: Vec<EntityId> = self.tracked_entities.keys().copied().collect();
        ids.sort_unstable();
        for entity_id in ids.into_iter().rev() {
            if self.tracked_entities.contains_key(&entity_id) {
                if let Err(e) = self.remove_entity_at(view, entity_id, 0, false) {
                    debug!("Detach could not remove entity {}: {}", entity_id, e);
                }
            }
        }
        self.outbox.flush();

        self.tracked_areas.clear();
        self.tracked_cells.clear();
        self.loaded_cell_count = 0;
        self.minimap = None;
        self.needs_start = false;
        self.last_update_position = None;
        info!("Player {} detached from region {}", self.player_entity_id, region_id);
    }

    // ------------------------------------------------------------------------
    // Visibility pass
    // ------------------------------------------------------------------------

    /// Run one visibility pass for a player at `position`
    pub fn update(&mut self, view: &WorldView<'_>, position: Vector3, force: bool) -> Result<PassSummary, InterestError> {
        let Some(region_id) = self.region_id else {
            return Err(InterestError::NoRegion);
        };
        if view.region.id != region_id {
            error!(
                "Pass for player {} got region {} while attached to {}",
                self.player_entity_id, view.region.id, region_id
            );
            return Err(InterestError::RegionMismatch {
                attached: region_id,
                given: view.region.id,
            });
        }

        self.current_frame += 1;
        self.pass = PassSummary {
            frame: self.current_frame,
            ..PassSummary::default()
        };
        let sent_before = self.outbox.messages_sent();

        let moved_far = self
            .last_update_position
            .map_or(true, |last| last.distance_sq_2d(position) >= self.update_distance_sq);
        if force || self.volumes_dirty || moved_far {
            self.volumes = self.volume_calc.compute(position);
            self.last_update_position = Some(position);
            self.volumes_dirty = false;
            self.pass.volumes_recomputed = true;
            if let Some(minimap) = self.minimap.as_mut() {
                minimap.reveal(&self.volumes.visible);
            }
        }

        if self.needs_start {
            self.needs_start = false;
            self.add_start_area(view.region, position);
        } else {
            self.update_entities(view);
        }

        self.update_areas(view.region);
        let environment_changed = self.update_cells(view.region);
        if environment_changed {
            self.pass.environment_changed = true;
            self.send(ServerMessage::EnvironmentUpdate {
                flags: ENVIRONMENT_UPDATE_CELLS_CHANGED,
            });
            if let Some(archive_data) = self.minimap.as_ref().map(LowResMap::to_archive) {
                self.send(ServerMessage::UpdateMiniMap { archive_data });
            }
        }

        self.outbox.flush();
        self.pass.messages_sent = self.outbox.messages_sent() - sent_before;
        Ok(self.pass)
    }

    fn add_start_area(&mut self, region: &Region, position: Vector3) {
        let point = position.xy();
        let start = region
            .areas()
            .find(|area| area.bounds.contains_point(point))
            .or_else(|| region.start_area());
        match start {
            Some(area) => self.track_area(area, true),
            None => warn!("Region {} has no start area", region.id),
        }
    }

    fn track_area(&mut self, area: &Area, is_start_area: bool) {
        if self.tracked_areas.contains_key(&area.id) {
            return;
        }
        self.tracked_areas.insert(
            area.id,
            TrackedArea {
                frame: self.current_frame,
            },
        );
        self.pass.areas_added += 1;
        self.send(ServerMessage::AddArea {
            area_id: area.id,
            area_prototype: area.prototype_ref,
            area_origin: area.origin,
            is_start_area,
        });
    }

    fn update_areas(&mut self, region: &Region) {
        let visible = self.volumes.visible;
        let invisible = self.volumes.invisible;
        let frame = self.current_frame;

        for area in region.areas() {
            if let Some(record) = self.tracked_areas.get_mut(&area.id) {
                if area.bounds.intersects(&invisible) {
                    record.frame = frame;
                } else {
                    self.tracked_areas.remove(&area.id);
                    self.pass.areas_removed += 1;
                    self.send(ServerMessage::RemoveArea { area_id: area.id });
                }
            } else if area.bounds.intersects(&visible) {
                self.track_area(area, false);
            }
        }
    }

    /// Returns true if a cell of a static area appeared or disappeared
    fn update_cells(&mut self, region: &Region) -> bool {
        let visible = self.volumes.visible;
        let invisible = self.volumes.invisible;
        let frame = self.current_frame;
        let mut environment_changed = false;

        let mut stale: SmallVec<[CellId; 32]> = self
            .tracked_cells
            .iter()
            .filter(|(cell_id, record)| {
                !self.tracked_areas.contains_key(&record.area_id)
                    || region
                        .cell(**cell_id)
                        .map_or(true, |cell| !cell.bounds.intersects(&invisible))
            })
            .map(|(cell_id, _)| *cell_id)
            .collect();
        stale.sort_unstable();

        for cell_id in stale {
            let Some(record) = self.tracked_cells.remove(&cell_id) else {
                continue;
            };
            if record.is_loaded {
                self.loaded_cell_count = self.loaded_cell_count.saturating_sub(1);
            }
            self.pass.cells_destroyed += 1;
            if self.tracked_areas.contains_key(&record.area_id) {
                self.send(ServerMessage::CellDestroy {
                    area_id: record.area_id,
                    cell_id,
                });
            }
            if region.area(record.area_id).is_some_and(|area| !area.is_dynamic) {
                environment_changed = true;
            }
        }

        for cell in region.cells_in_volume(&visible) {
            if !self.tracked_areas.contains_key(&cell.area_id) {
                continue;
            }
            if let Some(record) = self.tracked_cells.get_mut(&cell.id) {
                record.frame = frame;
                continue;
            }
            self.tracked_cells.insert(
                cell.id,
                TrackedCell {
                    area_id: cell.area_id,
                    frame,
                    is_loaded: false,
                },
            );
            self.pass.cells_created += 1;
            self.send(ServerMessage::CellCreate {
                area_id: cell.area_id,
                cell_id: cell.id,
                cell_prototype: cell.prototype_ref,
                position_in_area: cell.position_in_area,
            });
            if region.area(cell.area_id).is_some_and(|area| !area.is_dynamic) {
                environment_changed = true;
            }
        }

        environment_changed
    }

    fn update_entities(&mut self, view: &WorldView<'_>) {
        let frame = self.current_frame;
        let visible = self.volumes.visible;
        let mut scan = take_buffer(&ENTITY_SCAN_BUFFER);
        let mut ops = take_buffer(&PENDING_OPS_BUFFER);

        // Spatial scan
        scan.extend(view.region.entities_in_volume(&visible));
        for &entity_id in &scan {
            if self.tracked_entities.get(&entity_id).is_some_and(|record| record.frame == frame) {
                continue;
            }
            if let Some(entity) = view.entities.get(entity_id) {
                self.queue_transition(view, entity, &mut ops);
            }
        }

        // Fallback over everything tracked the spatial scan did not reach
        scan.clear();
        scan.extend(
            self.tracked_entities
                .iter()
                .filter(|(_, record)| record.frame < frame)
                .map(|(entity_id, _)| *entity_id),
        );
        scan.sort_unstable();
        for &entity_id in &scan {
            match view.entities.get(entity_id) {
                Some(entity) => self.queue_transition(view, entity, &mut ops),
                None => self.drop_vanished_entity(entity_id),
            }
        }

        for op in ops.drain(..) {
            self.apply_pending_op(view, op);
        }

        return_buffer(&PENDING_OPS_BUFFER, ops);
        return_buffer(&ENTITY_SCAN_BUFFER, scan);
    }

    /// Resolve `entity` and queue a transition, or just stamp the frame
    fn queue_transition(&mut self, view: &WorldView<'_>, entity: &Entity, ops: &mut Vec<PendingLifecycleOp>) {
        let new = self.resolve(view, entity);
        let frame = self.current_frame;
        let previous = match self.tracked_entities.get_mut(&entity.id) {
            Some(record) => {
                record.frame = frame;
                record.policies
            }
            None => InterestPolicies::NONE,
        };
        if let Some(op) = PendingLifecycleOp::between(entity.id, previous, new) {
            ops.push(op);
        }
    }

    fn apply_pending_op(&mut self, view: &WorldView<'_>, op: PendingLifecycleOp) {
        let tracked = self.tracked_entities.contains_key(&op.entity_id);
        let still_valid = match op.kind {
            LifecycleKind::Add => !tracked,
            LifecycleKind::Remove | LifecycleKind::Modify => tracked,
        };
        if !still_valid || view.entities.get(op.entity_id).is_none() {
            trace!("Skipping stale {:?} for entity {}", op.kind, op.entity_id);
            self.pass.ops_skipped += 1;
            return;
        }
        let result = match op.kind {
            LifecycleKind::Add => self.add_entity_at(view, op.entity_id, op.new_policies, 0),
            LifecycleKind::Remove => self.remove_entity_at(view, op.entity_id, 0, true),
            LifecycleKind::Modify => self.modify_entity_at(view, op.entity_id, op.new_policies, 0),
        };
        if let Err(e) = result {
            debug!("{:?} of entity {} failed: {}", op.kind, op.entity_id, e);
        }
    }

    /// A tracked entity no longer exists in the manager
    fn drop_vanished_entity(&mut self, entity_id: EntityId) {
        let Some(record) = self.tracked_entities.remove(&entity_id) else {
            return;
        };
        trace!("Tracked entity {} vanished, dropping", entity_id);
        self.pass.entities_removed += 1;
        if !record.policies.contains(InterestPolicies::CLIENT_INDEPENDENT) {
            self.send(ServerMessage::EntityDestroy { entity_id });
        }
    }

    /// Re-evaluate one entity outside of a pass (status change, inventory
    /// move, new player). Messages are flushed immediately.
    pub fn consider_entity(&mut self, view: &WorldView<'_>, entity_id: EntityId) -> Result<(), InterestError> {
        if self.region_id.is_none() {
            return Err(InterestError::NoRegion);
        }
        match view.entities.get(entity_id) {
            Some(entity) => {
                let new = self.resolve(view, entity);
                self.apply_transition(view, entity_id, new, 0)?;
            }
            None => self.drop_vanished_entity(entity_id),
        }
        self.outbox.flush();
        Ok(())
    }

    /// Re-evaluate an entity that changed container or slot. A client that
    /// keeps tracking it is told the new location once the container is
    /// visible.
    pub fn on_inventory_moved(&mut self, view: &WorldView<'_>, entity_id: EntityId) -> Result<(), InterestError> {
        if self.region_id.is_none() {
            return Err(InterestError::NoRegion);
        }
        if let Some(record) = self.tracked_entities.get_mut(&entity_id) {
            record.inventory_location_sent = false;
        }
        match view.entities.get(entity_id) {
            Some(entity) => {
                let new = self.resolve(view, entity);
                self.apply_transition(view, entity_id, new, 0)?;
                if !new.is_empty() {
                    self.send_pending_inventory_location(view.entities, entity);
                }
            }
            None => self.drop_vanished_entity(entity_id),
        }
        self.outbox.flush();
        Ok(())
    }

    fn resolve(&self, view: &WorldView<'_>, entity: &Entity) -> InterestPolicies {
        resolve_policies(entity, &self.resolve_context(view.entities))
    }

    fn resolve_context<'a>(&'a self, entities: &'a EntityManager) -> ResolveContext<'a> {
        ResolveContext {
            entities,
            player_id: self.player_entity_id,
            volumes: &self.volumes,
            tracked_entities: &self.tracked_entities,
            tracked_cells: &self.tracked_cells,
            max_container_depth: self.max_container_depth,
        }
    }

    fn apply_transition(
        &mut self,
        view: &WorldView<'_>,
        entity_id: EntityId,
        new: InterestPolicies,
        depth: usize,
    ) -> Result<(), InterestError> {
        let previous = self.tracked_policies(entity_id);
        match PendingLifecycleOp::between(entity_id, previous, new).map(|op| op.kind) {
            Some(LifecycleKind::Add) => self.add_entity_at(view, entity_id, new, depth),
            Some(LifecycleKind::Remove) => self.remove_entity_at(view, entity_id, depth, true),
            Some(LifecycleKind::Modify) => self.modify_entity_at(view, entity_id, new, depth),
            None => {
                self.stamp_entity(entity_id);
                Ok(())
            }
        }
    }

    fn stamp_entity(&mut self, entity_id: EntityId) {
        if let Some(record) = self.tracked_entities.get_mut(&entity_id) {
            record.frame = self.current_frame;
        }
    }

    // ------------------------------------------------------------------------
    // Entity lifecycle
    // ------------------------------------------------------------------------

    /// Start tracking an entity through `policies`
    pub fn add_entity(
        &mut self,
        view: &WorldView<'_>,
        entity_id: EntityId,
        policies: InterestPolicies,
    ) -> Result<(), InterestError> {
        self.add_entity_at(view, entity_id, policies, 0)
    }

    /// Stop tracking an entity
    pub fn remove_entity(&mut self, view: &WorldView<'_>, entity_id: EntityId) -> Result<(), InterestError> {
        self.remove_entity_at(view, entity_id, 0, true)
    }

    /// Change the channels an entity is tracked through
    pub fn modify_entity(
        &mut self,
        view: &WorldView<'_>,
        entity_id: EntityId,
        policies: InterestPolicies,
    ) -> Result<(), InterestError> {
        self.modify_entity_at(view, entity_id, policies, 0)
    }

    fn add_entity_at(
        &mut self,
        view: &WorldView<'_>,
        entity_id: EntityId,
        policies: InterestPolicies,
        depth: usize,
    ) -> Result<(), InterestError> {
        if policies.is_empty() {
            error!("Player {} tried to add entity {} with no policies", self.player_entity_id, entity_id);
            return Err(InterestError::EmptyPolicies(entity_id));
        }
        if self.tracked_entities.contains_key(&entity_id) {
            error!("Player {} already tracks entity {}", self.player_entity_id, entity_id);
            return Err(InterestError::AlreadyTracked(entity_id));
        }
        let Some(entity) = view.entities.get(entity_id) else {
            error!("Player {} tried to add missing entity {}", self.player_entity_id, entity_id);
            return Err(InterestError::EntityNotFound(entity_id));
        };

        let include_inventory_location = self.container_visible(view.entities, entity);
        let settings = EntitySettings::from_entity(entity);
        let message = build_entity_create(entity, policies, include_inventory_location, &settings).map_err(|e| {
            error!("Failed to build create message for entity {}: {}", entity_id, e);
            e
        })?;

        self.tracked_entities.insert(
            entity_id,
            TrackedEntity {
                frame: self.current_frame,
                policies,
                inventory_location_sent: include_inventory_location,
            },
        );
        view.observer.before_add(self.player_entity_id, entity, policies);
        self.send(message);
        self.pass.entities_added += 1;
        trace!("Player {} added entity {} ({:?})", self.player_entity_id, entity_id, policies);

        self.update_contained(view, entity, depth + 1);

        if entity.is_avatar() && policies.contains(InterestPolicies::PROXIMITY) {
            self.send(ServerMessage::FullInWorldHierarchyUpdateEnd { entity_id });
        }
        view.observer.after_add(self.player_entity_id, entity, policies);
        Ok(())
    }

    fn remove_entity_at(
        &mut self,
        view: &WorldView<'_>,
        entity_id: EntityId,
        depth: usize,
        recurse: bool,
    ) -> Result<(), InterestError> {
        let Some(record) = self.tracked_entities.get(&entity_id).copied() else {
            error!("Player {} tried to remove untracked entity {}", self.player_entity_id, entity_id);
            return Err(InterestError::NotTracked(entity_id));
        };
        let Some(entity) = view.entities.get(entity_id) else {
            self.drop_vanished_entity(entity_id);
            return Ok(());
        };
        let previous = record.policies;

        if entity.is_avatar() && entity.is_in_world() {
            self.send(ServerMessage::FullInWorldHierarchyUpdateBegin { entity_id });
        }
        view.observer.before_remove(self.player_entity_id, entity, previous);
        self.tracked_entities.remove(&entity_id);
        if recurse {
            self.update_contained(view, entity, depth + 1);
        }
        if !previous.contains(InterestPolicies::CLIENT_INDEPENDENT) {
            self.send(ServerMessage::EntityDestroy { entity_id });
        }
        self.pass.entities_removed += 1;
        trace!("Player {} removed entity {} ({:?})", self.player_entity_id, entity_id, previous);
        view.observer.after_remove(self.player_entity_id, entity, previous);
        Ok(())
    }

    fn modify_entity_at(
        &mut self,
        view: &WorldView<'_>,
        entity_id: EntityId,
        policies: InterestPolicies,
        depth: usize,
    ) -> Result<(), InterestError> {
        if policies.is_empty() {
            error!("Player {} tried to modify entity {} to no policies", self.player_entity_id, entity_id);
            return Err(InterestError::EmptyPolicies(entity_id));
        }
        let Some(previous) = self.tracked_entities.get(&entity_id).map(|record| record.policies) else {
            error!("Player {} tried to modify untracked entity {}", self.player_entity_id, entity_id);
            return Err(InterestError::NotTracked(entity_id));
        };
        let Some(entity) = view.entities.get(entity_id) else {
            error!("Player {} tried to modify missing entity {}", self.player_entity_id, entity_id);
            return Err(InterestError::EntityNotFound(entity_id));
        };

        let frame = self.current_frame;
        if let Some(record) = self.tracked_entities.get_mut(&entity_id) {
            record.frame = frame;
            record.policies = policies;
        }
        if previous == policies {
            return Ok(());
        }

        let delta = PolicyDelta::between(previous, policies);
        view.observer.before_modify(self.player_entity_id, entity, policies, previous);
        if !delta.removed.is_empty() {
            self.send(ServerMessage::AoiPolicyForget {
                entity_id,
                new_policies: policies,
                removed_policies: delta.removed,
                exit_game_world: delta.removed.contains(InterestPolicies::PROXIMITY) && entity.is_in_world(),
            });
        }
        if delta.added.contains(InterestPolicies::PROXIMITY) && entity.is_in_world() {
            if let Some(message) = build_enter_game_world(entity) {
                self.send(message);
            }
        }
        view.observer.after_modify(self.player_entity_id, entity, policies, previous);
        self.send(ServerMessage::AoiPolicyChange {
            entity_id,
            new_policies: policies,
            previous_policies: previous,
        });
        self.pass.entities_modified += 1;
        trace!(
            "Player {} modified entity {} ({:?} -> {:?})",
            self.player_entity_id,
            entity_id,
            previous,
            policies
        );

        self.update_contained(view, entity, depth + 1);
        Ok(())
    }

    /// Re-resolve everything stored in `container`'s inventories
    fn update_contained(&mut self, view: &WorldView<'_>, container: &Entity, depth: usize) {
        if depth > self.max_container_depth {
            warn!(
                "Inventory nesting under entity {} exceeds depth {}",
                container.id, self.max_container_depth
            );
            return;
        }

        for child_id in container.contained_entity_ids() {
            let Some(child) = view.entities.get(child_id) else {
                trace!("Contained entity {} vanished", child_id);
                continue;
            };
            let new = self.resolve(view, child);
            let previous = self.tracked_policies(child_id);

            if new == previous {
                if !new.is_empty() {
                    self.send_pending_inventory_location(view.entities, child);
                }
                self.stamp_entity(child_id);
                continue;
            }
            match self.apply_transition(view, child_id, new, depth) {
                Ok(()) if !new.is_empty() => self.send_pending_inventory_location(view.entities, child),
                Ok(()) => {}
                Err(e) => debug!("Contained entity {} transition failed: {}", child_id, e),
            }
        }
    }

    /// Tell the client where a tracked entity sits once its container
    /// becomes visible
    fn send_pending_inventory_location(&mut self, entities: &EntityManager, entity: &Entity) {
        let Some(location) = entity.inventory_location else {
            return;
        };
        if self
            .tracked_entities
            .get(&entity.id)
            .map_or(true, |record| record.inventory_location_sent)
        {
            return;
        }
        if !self.container_visible(entities, entity) {
            return;
        }
        if let Some(record) = self.tracked_entities.get_mut(&entity.id) {
            record.inventory_location_sent = true;
        }
        self.send(ServerMessage::InventoryMove {
            entity_id: entity.id,
            location,
        });
    }

    /// Container is tracked and exposes its contents to this connection
    fn container_visible(&self, entities: &EntityManager, entity: &Entity) -> bool {
        let Some(location) = entity.inventory_location else {
            return false;
        };
        self.tracked_entities.contains_key(&location.container_id)
            && !resolve_container_mask(entity, &self.resolve_context(entities), 0).is_empty()
    }

    fn send(&mut self, message: ServerMessage) {
        self.outbox.send_message(message);
    }

    // ------------------------------------------------------------------------
    // Cell loading
    // ------------------------------------------------------------------------

    /// Client finished loading a cell
    pub fn on_cell_loaded(&mut self, cell_id: CellId) -> Result<(), InterestError> {
        let Some(record) = self.tracked_cells.get_mut(&cell_id) else {
            warn!("Player {} loaded untracked cell {}", self.player_entity_id, cell_id);
            return Err(InterestError::CellNotTracked(cell_id));
        };
        if !record.is_loaded {
            record.is_loaded = true;
            self.loaded_cell_count += 1;
        }
        Ok(())
    }

    /// Treat every tracked cell as loaded
    pub fn force_cell_load(&mut self) {
        for record in self.tracked_cells.values_mut() {
            record.is_loaded = true;
        }
        self.loaded_cell_count = self.tracked_cells.len();
    }

    /// Whether the client still has to load the cell under `position`
    /// before it can be moved there
    pub fn is_cell_pending_load(&self, region: &Region, position: Vector3) -> bool {
        region
            .cell_at(position)
            .is_some_and(|cell| self.tracked_cells.get(&cell.id).map_or(true, |record| !record.is_loaded))
    }

    /// Cells the client acknowledged and still tracks
    pub fn loaded_cell_count(&self) -> usize {
        self.loaded_cell_count
    }

    // ------------------------------------------------------------------------
    // Queries and settings
    // ------------------------------------------------------------------------

    /// Tracked through any of `channels`
    pub fn interested_in_entity(&self, entity_id: EntityId, channels: InterestPolicies) -> bool {
        self.tracked_policies(entity_id).intersects(channels)
    }

    /// Tracked through at least one channel
    pub fn is_entity_tracked(&self, entity_id: EntityId) -> bool {
        self.tracked_entities.contains_key(&entity_id)
    }

    /// Channels the entity is tracked through, empty if untracked
    pub fn tracked_policies(&self, entity_id: EntityId) -> InterestPolicies {
        self.tracked_entities
            .get(&entity_id)
            .map_or(InterestPolicies::NONE, |record| record.policies)
    }

    /// Tracking record of an entity, if any
    pub fn tracked_entity(&self, entity_id: EntityId) -> Option<&TrackedEntity> {
        self.tracked_entities.get(&entity_id)
    }

    pub fn is_area_tracked(&self, area_id: AreaId) -> bool {
        self.tracked_areas.contains_key(&area_id)
    }

    pub fn is_cell_tracked(&self, cell_id: CellId) -> bool {
        self.tracked_cells.contains_key(&cell_id)
    }

    pub fn tracked_area_count(&self) -> usize {
        self.tracked_areas.len()
    }

    pub fn tracked_cell_count(&self) -> usize {
        self.tracked_cells.len()
    }

    pub fn tracked_entity_count(&self) -> usize {
        self.tracked_entities.len()
    }

    pub fn player_entity_id(&self) -> EntityId {
        self.player_entity_id
    }

    pub fn region_id(&self) -> Option<RegionId> {
        self.region_id
    }

    /// Frame of the last pass; bumped once per `update`
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Volumes from the last recompute
    pub fn volumes(&self) -> &InterestVolumes {
        &self.volumes
    }

    /// Revealed minimap of the attached region
    pub fn minimap(&self) -> Option<&LowResMap> {
        self.minimap.as_ref()
    }

    pub fn outbox_mut(&mut self) -> &mut ConnectionOutbox {
        &mut self.outbox
    }

    /// Total messages queued on this connection
    pub fn messages_sent(&self) -> u64 {
        self.outbox.messages_sent()
    }

    /// Current footprint size, for persisting with the player
    pub fn aoi_volume(&self) -> f32 {
        self.volume_calc.aoi_volume()
    }

    /// Resize the footprint; volumes are recomputed on the next pass.
    /// Returns the size actually applied.
    pub fn set_aoi_volume(&mut self, aoi_volume: f32) -> f32 {
        self.volumes_dirty = true;
        self.volume_calc.configure_footprint(aoi_volume)
    }

    /// Point the footprint along the camera direction (None resets it)
    pub fn set_camera_direction(&mut self, direction: Option<Vector3>) {
        self.volume_calc.set_camera_direction(direction);
        self.volumes_dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{status, EntityKind, RegionLocation};
    use crate::game::inventory::{Inventory, InventoryCategory, InventoryLocation};
    use crate::game::region::build_grid_region;
    use crate::net::connection::Outbound;
    use crate::util::vector::Orientation;
    use crossbeam_channel::Receiver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PLAYER: EntityId = 1;
    const AVATAR: EntityId = 2;
    const AVATAR_LIBRARY: u64 = 50;
    const EQUIPMENT: u64 = 51;
    const START: Vector3 = Vector3::new(1000.0, 1000.0, 0.0);

    struct World {
        region: Region,
        entities: EntityManager,
    }

    impl World {
        /// 4x4 areas of 2048, each split into 2x2 cells
        fn new() -> Self {
            let region = build_grid_region(1, 10, 4, 4, 2048.0, 2).unwrap();
            let mut entities = EntityManager::new();
            entities
                .insert(
                    Entity::new(PLAYER, 100, EntityKind::Player)
                        .with_status(status::IN_GAME)
                        .with_inventory(Inventory::new(AVATAR_LIBRARY, InventoryCategory::Storage)),
                )
                .unwrap();
            entities
                .insert(
                    Entity::new(AVATAR, 200, EntityKind::Avatar)
                        .with_inventory(Inventory::new(EQUIPMENT, InventoryCategory::OnPerson)),
                )
                .unwrap();
            entities
                .move_to_inventory(AVATAR, InventoryLocation::new(PLAYER, AVATAR_LIBRARY, 0))
                .unwrap();
            Self { region, entities }
        }

        fn view(&self) -> WorldView<'_> {
            WorldView::new(&self.region, &self.entities)
        }

        fn place(&mut self, entity_id: EntityId, position: Vector3) {
            let cell = self.region.cell_at(position).unwrap();
            let location = RegionLocation {
                position,
                orientation: Orientation::ZERO,
                area_id: cell.area_id,
                cell_id: cell.id,
            };
            let entity = self.entities.get_mut(entity_id).unwrap();
            entity.location = Some(location);
            entity.set_status(status::IN_WORLD, true);
            self.region.index_entity(entity_id, position);
        }

        fn spawn(&mut self, entity: Entity, position: Vector3) -> EntityId {
            let id = self.entities.insert(entity).unwrap();
            self.place(id, position);
            id
        }
    }

    fn connection() -> (AreaOfInterest, Receiver<Outbound>) {
        let (outbox, receiver) = ConnectionOutbox::channel();
        (AreaOfInterest::new(PLAYER, outbox, &InterestConfig::default()), receiver)
    }

    fn drain(receiver: &Receiver<Outbound>) -> Vec<ServerMessage> {
        receiver
            .try_iter()
            .filter_map(|outbound| match outbound {
                Outbound::Message(message) => Some(message),
                Outbound::Flush => None,
            })
            .collect()
    }

    fn names(messages: &[ServerMessage]) -> Vec<&'static str> {
        messages.iter().map(ServerMessage::name).collect()
    }

    /// Attach and run the start pass plus one regular pass
    fn attached(world: &World) -> (AreaOfInterest, Receiver<Outbound>) {
        let (mut aoi, receiver) = connection();
        aoi.attach(&world.view());
        aoi.update(&world.view(), START, false).unwrap();
        aoi.update(&world.view(), START, false).unwrap();
        (aoi, receiver)
    }

    #[test]
    fn test_update_requires_region() {
        let world = World::new();
        let (mut aoi, _rx) = connection();
        assert_eq!(aoi.update(&world.view(), START, false), Err(InterestError::NoRegion));
    }

    #[test]
    fn test_start_pass() {
        let mut world = World::new();
        world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = connection();
        aoi.attach(&world.view());
        let summary = aoi.update(&world.view(), START, false).unwrap();
        let messages = drain(&receiver);

        assert_eq!(messages[0].name(), "RegionChange");
        assert_eq!(
            messages[1],
            ServerMessage::AddArea {
                area_id: 1,
                area_prototype: 1001,
                area_origin: Vector3::ZERO,
                is_start_area: true,
            }
        );
        // Visible volume (-800..3600) spans areas 1, 2, 5 and 6
        assert_eq!(summary.areas_added, 4);
        assert_eq!(summary.cells_created, 16);
        assert_eq!(summary.entities_added, 0, "start pass skips entities");
        assert!(summary.environment_changed);
        assert_eq!(&names(&messages)[messages.len() - 2..], &["EnvironmentUpdate", "UpdateMiniMap"]);
        assert!(aoi.minimap().unwrap().revealed_count() > 0);
    }

    #[test]
    fn test_volumes_contain_each_other() {
        let world = World::new();
        let (mut aoi, _rx) = connection();
        aoi.attach(&world.view());
        for position in [START, Vector3::new(4000.0, 6000.0, 0.0), Vector3::new(7900.0, 10.0, 0.0)] {
            aoi.update(&world.view(), position, true).unwrap();
            let volumes = aoi.volumes();
            assert!(volumes.visible.contains(&volumes.entity));
            assert!(volumes.invisible.contains(&volumes.visible));
        }
    }

    #[test]
    fn test_second_pass_adds_entities() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let far = world.spawn(Entity::new(11, 1, EntityKind::Agent), Vector3::new(7000.0, 7000.0, 0.0));
        let (mut aoi, receiver) = connection();
        aoi.attach(&world.view());
        aoi.update(&world.view(), START, false).unwrap();
        drain(&receiver);

        let summary = aoi.update(&world.view(), START, false).unwrap();
        assert!(!summary.volumes_recomputed);
        assert_eq!(summary.entities_added, 1);
        assert_eq!(names(&drain(&receiver)), vec!["EntityCreate"]);
        assert_eq!(aoi.tracked_policies(near), InterestPolicies::PROXIMITY);
        assert!(!aoi.is_entity_tracked(far));
    }

    #[test]
    fn test_stable_mask_sends_nothing() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        // Small moves stay under the update distance
        let summary = aoi.update(&world.view(), START + Vector3::new(100.0, 0.0, 0.0), false).unwrap();
        assert!(!summary.volumes_recomputed);
        assert_eq!(summary.messages_sent, 0);
        assert!(drain(&receiver).is_empty());
        assert_eq!(aoi.tracked_entity(near).unwrap().frame, aoi.current_frame());
    }

    #[test]
    fn test_add_then_remove_is_symmetric() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        world.entities.get_mut(near).unwrap().set_status(status::DESTROYED, true);
        aoi.update(&world.view(), START, false).unwrap();
        assert_eq!(drain(&receiver), vec![ServerMessage::EntityDestroy { entity_id: near }]);
        assert_eq!(aoi.tracked_entity_count(), 0);
    }

    #[test]
    fn test_owner_gains_proximity() {
        let mut world = World::new();
        let (mut aoi, receiver) = connection();
        aoi.attach(&world.view());
        aoi.update(&world.view(), START, false).unwrap();
        aoi.consider_entity(&world.view(), PLAYER).unwrap();
        assert_eq!(aoi.tracked_policies(PLAYER), InterestPolicies::OWNER);
        // The avatar comes along as owned content of the player
        assert_eq!(aoi.tracked_policies(AVATAR), InterestPolicies::OWNER);
        drain(&receiver);

        world.place(AVATAR, START);
        aoi.update(&world.view(), START, false).unwrap();
        let messages = drain(&receiver);
        assert_eq!(names(&messages), vec!["EntityEnterGameWorld", "AoiPolicyChange"]);
        assert_eq!(
            messages[1],
            ServerMessage::AoiPolicyChange {
                entity_id: AVATAR,
                new_policies: InterestPolicies::OWNER | InterestPolicies::PROXIMITY,
                previous_policies: InterestPolicies::OWNER,
            }
        );
    }

    #[test]
    fn test_proximity_lost_sends_forget() {
        let mut world = World::new();
        world.place(AVATAR, START);
        let (mut aoi, receiver) = attached(&world);
        aoi.consider_entity(&world.view(), PLAYER).unwrap();
        assert_eq!(
            aoi.tracked_policies(AVATAR),
            InterestPolicies::OWNER | InterestPolicies::PROXIMITY
        );
        drain(&receiver);

        world.entities.get_mut(AVATAR).unwrap().set_status(status::EXITING_WORLD, true);
        aoi.update(&world.view(), START, false).unwrap();
        let messages = drain(&receiver);
        assert_eq!(
            messages[0],
            ServerMessage::AoiPolicyForget {
                entity_id: AVATAR,
                new_policies: InterestPolicies::OWNER,
                removed_policies: InterestPolicies::PROXIMITY,
                exit_game_world: true,
            }
        );
        assert_eq!(messages[1].name(), "AoiPolicyChange");
    }

    #[test]
    fn test_cell_leaving_invisible_volume() {
        let world = World::new();
        let (mut aoi, receiver) = attached(&world);
        assert!(aoi.is_cell_tracked(1));
        drain(&receiver);

        // Invisible volume now starts at x = 1100: cell 1 (x 0..1024) leaves
        // while its area stays tracked
        let summary = aoi.update(&world.view(), Vector3::new(3500.0, 1000.0, 0.0), false).unwrap();
        let messages = drain(&receiver);
        assert!(messages.contains(&ServerMessage::CellDestroy { area_id: 1, cell_id: 1 }));
        assert!(aoi.is_area_tracked(1));
        assert!(!aoi.is_cell_tracked(1));
        assert!(summary.environment_changed);
        assert!(!messages.iter().any(|m| matches!(m, ServerMessage::RemoveArea { .. })));
    }

    #[test]
    fn test_far_move_drops_everything_behind() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        aoi.update(&world.view(), Vector3::new(7000.0, 7000.0, 0.0), false).unwrap();
        let messages = drain(&receiver);
        // Entities go first, then areas; cells of untracked areas vanish silently
        assert_eq!(messages[0], ServerMessage::EntityDestroy { entity_id: near });
        for area_id in [1, 2, 5, 6] {
            assert!(messages.contains(&ServerMessage::RemoveArea { area_id }));
            assert!(!aoi.is_area_tracked(area_id));
        }
        assert!(!messages.iter().any(|m| matches!(m, ServerMessage::CellDestroy { .. })));
        for cell_id in 1..=4 {
            assert!(!aoi.is_cell_tracked(cell_id));
        }
    }

    #[test]
    fn test_tracked_cells_belong_to_tracked_areas() {
        let world = World::new();
        let (mut aoi, _rx) = attached(&world);
        for position in [
            Vector3::new(3000.0, 2500.0, 0.0),
            Vector3::new(6000.0, 6000.0, 0.0),
            Vector3::new(500.0, 7000.0, 0.0),
        ] {
            aoi.update(&world.view(), position, false).unwrap();
            for (cell_id, record) in &aoi.tracked_cells {
                assert!(aoi.is_area_tracked(record.area_id), "cell {} has no area", cell_id);
            }
        }
    }

    #[test]
    fn test_on_person_item_follows_avatar() {
        let mut world = World::new();
        // Another player's avatar with a worn item and a hidden one
        let other = world.spawn(
            Entity::new(20, 200, EntityKind::Avatar)
                .with_inventory(Inventory::new(EQUIPMENT, InventoryCategory::OnPerson))
                .with_inventory(Inventory::new(52, InventoryCategory::Internal)),
            Vector3::new(1500.0, 1500.0, 0.0),
        );
        world.entities.insert(Entity::new(21, 300, EntityKind::Item)).unwrap();
        world.entities.insert(Entity::new(22, 300, EntityKind::Item)).unwrap();
        world
            .entities
            .move_to_inventory(21, InventoryLocation::new(other, EQUIPMENT, 0))
            .unwrap();
        world.entities.move_to_inventory(22, InventoryLocation::new(other, 52, 0)).unwrap();

        let (aoi, receiver) = attached(&world);
        let messages = drain(&receiver);
        let creates: Vec<_> = messages
            .iter()
            .skip_while(|m| m.name() != "EntityCreate")
            .map(ServerMessage::name)
            .take(3)
            .collect();
        assert_eq!(creates, vec!["EntityCreate", "EntityCreate", "FullInWorldHierarchyUpdateEnd"]);
        assert_eq!(aoi.tracked_policies(21), InterestPolicies::PROXIMITY);
        assert!(aoi.tracked_entity(21).unwrap().inventory_location_sent);
        assert!(!aoi.is_entity_tracked(22));
    }

    #[test]
    fn test_avatar_removal_wraps_hierarchy() {
        let mut world = World::new();
        let other = world.spawn(
            Entity::new(20, 200, EntityKind::Avatar).with_inventory(Inventory::new(EQUIPMENT, InventoryCategory::OnPerson)),
            Vector3::new(1500.0, 1500.0, 0.0),
        );
        world.entities.insert(Entity::new(21, 300, EntityKind::Item)).unwrap();
        world
            .entities
            .move_to_inventory(21, InventoryLocation::new(other, EQUIPMENT, 0))
            .unwrap();
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        aoi.remove_entity(&world.view(), other).unwrap();
        assert_eq!(
            drain(&receiver),
            vec![
                ServerMessage::FullInWorldHierarchyUpdateBegin { entity_id: other },
                ServerMessage::EntityDestroy { entity_id: 21 },
                ServerMessage::EntityDestroy { entity_id: other },
            ]
        );
    }

    #[test]
    fn test_inventory_move_once_container_visible() {
        let mut world = World::new();
        world.entities.insert(Entity::new(30, 300, EntityKind::Item)).unwrap();
        world
            .entities
            .move_to_inventory(30, InventoryLocation::new(AVATAR, EQUIPMENT, 0))
            .unwrap();
        let (mut aoi, receiver) = attached(&world);

        // Item first, container later
        aoi.tracked_entities.insert(
            30,
            TrackedEntity {
                frame: 0,
                policies: InterestPolicies::OWNER,
                inventory_location_sent: false,
            },
        );
        aoi.add_entity(&world.view(), AVATAR, InterestPolicies::OWNER).unwrap();
        let messages = drain(&receiver);
        assert!(messages.contains(&ServerMessage::InventoryMove {
            entity_id: 30,
            location: InventoryLocation::new(AVATAR, EQUIPMENT, 0),
        }));
        assert!(aoi.tracked_entity(30).unwrap().inventory_location_sent);
    }

    #[test]
    fn test_slot_change_resends_location() {
        let mut world = World::new();
        world.entities.insert(Entity::new(30, 300, EntityKind::Item)).unwrap();
        world
            .entities
            .move_to_inventory(30, InventoryLocation::new(AVATAR, EQUIPMENT, 0))
            .unwrap();
        let (mut aoi, receiver) = attached(&world);
        aoi.consider_entity(&world.view(), PLAYER).unwrap();
        assert!(aoi.is_entity_tracked(30));
        drain(&receiver);

        world
            .entities
            .move_to_inventory(30, InventoryLocation::new(AVATAR, EQUIPMENT, 3))
            .unwrap();
        aoi.on_inventory_moved(&world.view(), 30).unwrap();
        assert!(drain(&receiver).contains(&ServerMessage::InventoryMove {
            entity_id: 30,
            location: InventoryLocation::new(AVATAR, EQUIPMENT, 3),
        }));
        assert!(aoi.tracked_entity(30).unwrap().inventory_location_sent);
    }

    #[test]
    fn test_changed_mask_sends_pending_location() {
        let mut world = World::new();
        world.entities.insert(Entity::new(30, 300, EntityKind::Item)).unwrap();
        world
            .entities
            .move_to_inventory(30, InventoryLocation::new(AVATAR, EQUIPMENT, 0))
            .unwrap();
        let (mut aoi, receiver) = attached(&world);

        // Known through a wider mask than the container will grant
        aoi.tracked_entities.insert(
            30,
            TrackedEntity {
                frame: 0,
                policies: InterestPolicies::PROXIMITY | InterestPolicies::OWNER,
                inventory_location_sent: false,
            },
        );
        aoi.add_entity(&world.view(), AVATAR, InterestPolicies::OWNER).unwrap();
        let messages = drain(&receiver);
        assert!(messages.contains(&ServerMessage::InventoryMove {
            entity_id: 30,
            location: InventoryLocation::new(AVATAR, EQUIPMENT, 0),
        }));
        let record = aoi.tracked_entity(30).unwrap();
        assert_eq!(record.policies, InterestPolicies::OWNER);
        assert!(record.inventory_location_sent);
    }

    #[test]
    fn test_lifecycle_errors_change_nothing() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);
        let view = world.view();

        assert_eq!(
            aoi.add_entity(&view, 99, InterestPolicies::NONE),
            Err(InterestError::EmptyPolicies(99))
        );
        assert_eq!(
            aoi.add_entity(&view, near, InterestPolicies::PROXIMITY),
            Err(InterestError::AlreadyTracked(near))
        );
        assert_eq!(aoi.remove_entity(&view, PLAYER), Err(InterestError::NotTracked(PLAYER)));
        assert_eq!(
            aoi.modify_entity(&view, PLAYER, InterestPolicies::OWNER),
            Err(InterestError::NotTracked(PLAYER))
        );
        assert_eq!(
            aoi.add_entity(&view, 404, InterestPolicies::PROXIMITY),
            Err(InterestError::EntityNotFound(404))
        );
        assert!(drain(&receiver).is_empty());
        assert_eq!(aoi.tracked_entity_count(), 1);
    }

    #[test]
    fn test_client_independent_missile() {
        let mut world = World::new();
        let mut missile = Entity::new(40, 1, EntityKind::Missile);
        missile.is_client_independent = true;
        let missile = world.spawn(missile, Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        assert_eq!(aoi.tracked_policies(missile), InterestPolicies::CLIENT_INDEPENDENT);
        drain(&receiver);

        // Flying out of view changes nothing
        world.place(missile, Vector3::new(7000.0, 200.0, 0.0));
        aoi.update(&world.view(), START, false).unwrap();
        assert!(drain(&receiver).is_empty());

        // Destruction forgets it without a destroy message
        world.entities.get_mut(missile).unwrap().set_status(status::DESTROYED, true);
        aoi.update(&world.view(), START, false).unwrap();
        assert!(drain(&receiver).is_empty());
        assert!(!aoi.is_entity_tracked(missile));
    }

    #[test]
    fn test_discovered_entity_stays_on_map() {
        let mut world = World::new();
        let mut waypoint = Entity::new(50, 1, EntityKind::Transition);
        waypoint.track_after_discovery = true;
        let waypoint = world.spawn(waypoint, Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        aoi.update(&world.view(), Vector3::new(7000.0, 7000.0, 0.0), false).unwrap();
        let messages = drain(&receiver);
        assert_eq!(
            messages[0],
            ServerMessage::AoiPolicyForget {
                entity_id: waypoint,
                new_policies: InterestPolicies::DISCOVERY,
                removed_policies: InterestPolicies::PROXIMITY,
                exit_game_world: true,
            }
        );
        assert_eq!(aoi.tracked_policies(waypoint), InterestPolicies::DISCOVERY);
    }

    #[test]
    fn test_vanished_entity_dropped() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        world.region.unindex_entity(near);
        world.entities.remove(near);
        aoi.update(&world.view(), START, false).unwrap();
        assert_eq!(drain(&receiver), vec![ServerMessage::EntityDestroy { entity_id: near }]);
        assert!(!aoi.is_entity_tracked(near));
    }

    #[test]
    fn test_cell_loading() {
        let world = World::new();
        let (mut aoi, _rx) = attached(&world);
        assert_eq!(aoi.loaded_cell_count(), 0);
        assert!(aoi.is_cell_pending_load(&world.region, START));

        let cell_id = world.region.cell_at(START).unwrap().id;
        aoi.on_cell_loaded(cell_id).unwrap();
        aoi.on_cell_loaded(cell_id).unwrap();
        assert_eq!(aoi.loaded_cell_count(), 1);
        assert!(!aoi.is_cell_pending_load(&world.region, START));
        assert_eq!(aoi.on_cell_loaded(9999), Err(InterestError::CellNotTracked(9999)));

        aoi.force_cell_load();
        assert_eq!(aoi.loaded_cell_count(), aoi.tracked_cell_count());
        // Far away cell is not even tracked yet
        assert!(aoi.is_cell_pending_load(&world.region, Vector3::new(7000.0, 7000.0, 0.0)));
    }

    #[test]
    fn test_detach_removes_everything() {
        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let (mut aoi, receiver) = attached(&world);
        drain(&receiver);

        aoi.detach(&world.view());
        assert_eq!(drain(&receiver), vec![ServerMessage::EntityDestroy { entity_id: near }]);
        assert_eq!(aoi.tracked_area_count(), 0);
        assert_eq!(aoi.tracked_cell_count(), 0);
        assert_eq!(aoi.tracked_entity_count(), 0);
        assert_eq!(aoi.region_id(), None);
    }

    #[test]
    fn test_aoi_volume_change_forces_recompute() {
        let world = World::new();
        let (mut aoi, _rx) = attached(&world);
        assert_eq!(aoi.set_aoi_volume(100.0), 3200.0);
        assert_eq!(aoi.set_aoi_volume(2000.0), 2000.0);
        let summary = aoi.update(&world.view(), START, false).unwrap();
        assert!(summary.volumes_recomputed);
        assert_eq!(aoi.aoi_volume(), 2000.0);
    }

    #[test]
    fn test_observer_hooks() {
        #[derive(Default)]
        struct Counting {
            adds: AtomicUsize,
            removes: AtomicUsize,
        }
        impl InterestObserver for Counting {
            fn after_add(&self, _player: EntityId, _entity: &Entity, _policies: InterestPolicies) {
                self.adds.fetch_add(1, Ordering::Relaxed);
            }
            fn after_remove(&self, _player: EntityId, _entity: &Entity, _previous: InterestPolicies) {
                self.removes.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut world = World::new();
        let near = world.spawn(Entity::new(10, 1, EntityKind::Agent), Vector3::new(1500.0, 1500.0, 0.0));
        let observer = Counting::default();
        let (mut aoi, _rx) = connection();
        let view = world.view().with_observer(&observer);
        aoi.attach(&view);
        aoi.update(&view, START, false).unwrap();
        aoi.update(&view, START, false).unwrap();
        aoi.remove_entity(&view, near).unwrap();

        assert_eq!(observer.adds.load(Ordering::Relaxed), 1);
        assert_eq!(observer.removes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_pending_op_between() {
        use InterestPolicies as P;
        assert_eq!(PendingLifecycleOp::between(1, P::NONE, P::NONE), None);
        assert_eq!(PendingLifecycleOp::between(1, P::OWNER, P::OWNER), None);
        assert_eq!(
            PendingLifecycleOp::between(1, P::NONE, P::OWNER).map(|op| op.kind),
            Some(LifecycleKind::Add)
        );
        assert_eq!(
            PendingLifecycleOp::between(1, P::OWNER, P::NONE).map(|op| op.kind),
            Some(LifecycleKind::Remove)
        );
        assert_eq!(
            PendingLifecycleOp::between(1, P::OWNER, P::OWNER | P::PARTY).map(|op| op.kind),
            Some(LifecycleKind::Modify)
        );
    }
}
