//! Game session: one region, its entities and every connected player
//!
//! The session is the only place that mutates the world. Each mutation
//! that can change visibility (entering or leaving the world, inventory
//! moves, destruction) re-evaluates the entity on every attached
//! connection right away; everything else is picked up by the next tick.
//!
//! `tick` runs one visibility pass per attached connection on the rayon
//! pool. Passes only read the region and the entity store, so they share
//! them without locks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::config::InterestConfig;
use crate::game::entity::{status, Entity, EntityError, EntityId, EntityKind, EntityManager, RegionLocation, INVALID_ENTITY_ID};
use crate::game::inventory::InventoryLocation;
use crate::game::locomotion::LocomotionState;
use crate::game::region::{CellId, Region, RegionError};
use crate::game::replication::{
    ArchiveMessageHandler, ReplicationError, ReplicationId, ReplicationRegistry, ReplicationUpdate,
};
use crate::metrics::Metrics;
use crate::net::aoi::{InterestError, InterestObserver, NoopObserver, PassSummary, WorldView};
use crate::net::archive_builder::build_locomotion_state_update;
use crate::net::connection::{ConnectionId, ConnectionManager, ConnectionOutbox, ConnectionState, Outbound, PlayerConnection};
use crate::net::policy::InterestPolicies;
use crate::net::protocol::ServerMessage;
use crate::util::vector::{Orientation, Vector3};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),
    #[error("Player {0} already has a connection")]
    PlayerAlreadyConnected(EntityId),
    #[error("Entity {0} is not a player")]
    NotAPlayer(EntityId),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Interest(#[from] InterestError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// What one tick did over all connections
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub passes: usize,
    pub failed_passes: usize,
    pub messages_sent: u64,
    pub environment_updates: usize,
    pub duration: Duration,
}

pub struct GameSession {
    region: Region,
    entities: EntityManager,
    replication: ReplicationRegistry,
    connections: ConnectionManager,
    observer: Arc<dyn InterestObserver>,
    metrics: Arc<Metrics>,
    config: InterestConfig,
    tick_count: u64,
}

impl GameSession {
    pub fn new(region: Region, config: InterestConfig, metrics: Arc<Metrics>) -> Self {
        info!(
            "Game session created for region {} ({} areas, {} cells)",
            region.id,
            region.area_count(),
            region.cell_count()
        );
        Self {
            region,
            entities: EntityManager::new(),
            replication: ReplicationRegistry::seeded_from_clock(),
            connections: ConnectionManager::new(),
            observer: Arc::new(NoopObserver),
            metrics,
            config,
            tick_count: 0,
        }
    }

    /// Route lifecycle hooks of every connection to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn InterestObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    pub fn replication(&self) -> &ReplicationRegistry {
        &self.replication
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&PlayerConnection> {
        self.connections.get(id)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Open a connection for a player entity. The receiver is the
    /// transport's end of the connection's message stream.
    pub fn add_connection(&mut self, player_id: EntityId) -> Result<(ConnectionId, Receiver<Outbound>), SessionError> {
        let player = self.entities.get(player_id).ok_or(EntityError::NotFound(player_id))?;
        if player.kind != EntityKind::Player {
            return Err(SessionError::NotAPlayer(player_id));
        }
        let (outbox, receiver) = ConnectionOutbox::channel();
        let id = self
            .connections
            .create(player_id, outbox, &self.config)
            .ok_or(SessionError::PlayerAlreadyConnected(player_id))?;
        debug!("Connection {} created for player {}", id, player_id);
        Ok((id, receiver))
    }

    /// Put the player in game and attach its connection to the region. The
    /// view follows `avatar` once it is in the world.
    pub fn attach(&mut self, connection_id: ConnectionId, avatar: Option<EntityId>) -> Result<PassSummary, SessionError> {
        let player_id = self
            .connections
            .get(connection_id)
            .ok_or(SessionError::ConnectionNotFound(connection_id))?
            .player_entity_id;
        self.entities
            .get_mut(player_id)
            .ok_or(EntityError::NotFound(player_id))?
            .set_status(status::IN_GAME, true);

        let summary = {
            let view = WorldView::new(&self.region, &self.entities).with_observer(self.observer.as_ref());
            let connection = self
                .connections
                .get_mut(connection_id)
                .ok_or(SessionError::ConnectionNotFound(connection_id))?;
            connection.avatar_entity_id = avatar;
            connection.state = ConnectionState::Connected;
            connection.aoi.attach(&view);
            let position = focus_position(&view, connection.avatar_entity_id);
            connection.aoi.update(&view, position, true)?
        };

        // Other players may see this one through party or trade
        self.consider_everywhere(player_id);
        Ok(summary)
    }

    /// Detach a connection from the region and take its player out of game
    pub fn detach(&mut self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let (player_id, avatar) = {
            let view = WorldView::new(&self.region, &self.entities).with_observer(self.observer.as_ref());
            let connection = self
                .connections
                .get_mut(connection_id)
                .ok_or(SessionError::ConnectionNotFound(connection_id))?;
            if connection.state != ConnectionState::Connected {
                return Ok(());
            }
            connection.state = ConnectionState::Disconnecting;
            connection.aoi.detach(&view);
            connection.state = ConnectionState::Disconnected;
            (connection.player_entity_id, connection.avatar_entity_id)
        };

        if let Some(player) = self.entities.get_mut(player_id) {
            player.set_status(status::IN_GAME, false);
        }
        self.consider_everywhere(player_id);
        if let Some(avatar) = avatar {
            self.consider_everywhere(avatar);
        }
        Ok(())
    }

    /// Detach (if needed) and drop a connection
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Result<PlayerConnection, SessionError> {
        self.detach(connection_id)?;
        let connection = self
            .connections
            .remove(connection_id)
            .ok_or(SessionError::ConnectionNotFound(connection_id))?;
        info!(
            "Connection {} for player {} removed after {:.1}s",
            connection_id,
            connection.player_entity_id,
            connection.age().as_secs_f32()
        );
        Ok(connection)
    }

    /// Attached connections interested in `entity_id` through any of
    /// `channels`, in ascending id order
    pub fn interested_connections(&self, entity_id: EntityId, channels: InterestPolicies) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|connection| connection.is_connected())
            .filter(|connection| connection.aoi.interested_in_entity(entity_id, channels))
            .map(|connection| connection.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The client finished loading a cell
    pub fn on_cell_loaded(&mut self, connection_id: ConnectionId, cell_id: CellId) -> Result<(), SessionError> {
        let connection = self
            .connections
            .get_mut(connection_id)
            .ok_or(SessionError::ConnectionNotFound(connection_id))?;
        connection.aoi.on_cell_loaded(cell_id)?;
        Ok(())
    }

    /// Change a connection's view size. Returns the size actually applied.
    pub fn set_aoi_volume(&mut self, connection_id: ConnectionId, aoi_volume: f32) -> Result<f32, SessionError> {
        let connection = self
            .connections
            .get_mut(connection_id)
            .ok_or(SessionError::ConnectionNotFound(connection_id))?;
        Ok(connection.aoi.set_aoi_volume(aoi_volume))
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Register an entity and bind its property collection. An invalid id
    /// is replaced by a fresh one.
    pub fn insert_entity(&mut self, mut entity: Entity) -> Result<EntityId, SessionError> {
        if entity.id == INVALID_ENTITY_ID {
            entity.id = self.entities.next_entity_id();
        }
        if self.entities.get(entity.id).is_some() {
            return Err(EntityError::DuplicateId(entity.id).into());
        }
        let owner = entity.id;
        let channels = entity.compatible_channels;
        self.replication.bind(&mut entity.properties, owner, channels, None)?;
        Ok(self.entities.insert(entity)?)
    }

    /// Register an entity and place it in the world
    pub fn spawn(&mut self, entity: Entity, position: Vector3, orientation: Orientation) -> Result<EntityId, SessionError> {
        let id = self.insert_entity(entity)?;
        self.enter_world(id, position, orientation)?;
        Ok(id)
    }

    pub fn enter_world(&mut self, entity_id: EntityId, position: Vector3, orientation: Orientation) -> Result<(), SessionError> {
        let location = self.locate(position, orientation)?;
        let entity = self.entities.get_mut(entity_id).ok_or(EntityError::NotFound(entity_id))?;
        entity.location = Some(location);
        entity.set_status(status::IN_WORLD, true);
        entity.set_status(status::EXITING_WORLD, false);
        self.region.index_entity(entity_id, position);
        trace!("Entity {} entered world at {:?}", entity_id, position);

        self.consider_everywhere(entity_id);
        Ok(())
    }

    pub fn exit_world(&mut self, entity_id: EntityId) -> Result<(), SessionError> {
        let entity = self.entities.get_mut(entity_id).ok_or(EntityError::NotFound(entity_id))?;
        if !entity.is_in_world() {
            return Ok(());
        }
        entity.set_status(status::EXITING_WORLD, true);
        self.consider_everywhere(entity_id);
        self.take_out_of_world(entity_id);
        trace!("Entity {} exited world", entity_id);
        Ok(())
    }

    /// Move an in-world entity. Visibility follows on the next tick.
    pub fn move_entity(&mut self, entity_id: EntityId, position: Vector3, orientation: Orientation) -> Result<(), SessionError> {
        let location = self.locate(position, orientation)?;
        let entity = self.entities.get_mut(entity_id).ok_or(EntityError::NotFound(entity_id))?;
        if !entity.is_in_world() {
            warn!("move_entity(): entity {} is not in the world", entity_id);
            return Ok(());
        }
        entity.location = Some(location);
        self.region.index_entity(entity_id, position);
        Ok(())
    }

    /// Store an entity in a container, taking it out of the world first if
    /// it was lying there. Every connection re-evaluates it.
    pub fn move_to_inventory(&mut self, entity_id: EntityId, location: InventoryLocation) -> Result<(), SessionError> {
        self.entities.move_to_inventory(entity_id, location)?;
        let was_in_world = match self.entities.get_mut(entity_id) {
            Some(entity) if entity.is_in_world() => {
                entity.set_status(status::EXITING_WORLD, true);
                true
            }
            _ => false,
        };

        {
            let view = WorldView::new(&self.region, &self.entities).with_observer(self.observer.as_ref());
            for connection in self.connections.iter_mut().filter(|c| c.is_connected()) {
                if let Err(e) = connection.aoi.on_inventory_moved(&view, entity_id) {
                    debug!("Connection {} could not follow inventory move of {}: {}", connection.id, entity_id, e);
                }
            }
        }

        if was_in_world {
            self.take_out_of_world(entity_id);
        }
        Ok(())
    }

    /// Destroy an entity and everything it carries. Connections forget
    /// them before they leave the entity store.
    pub fn destroy_entity(&mut self, entity_id: EntityId) -> Result<(), SessionError> {
        if self.entities.get(entity_id).is_none() {
            return Err(EntityError::NotFound(entity_id).into());
        }
        let mut doomed: SmallVec<[EntityId; 16]> = SmallVec::new();
        doomed.push(entity_id);
        self.collect_contained(entity_id, 0, &mut doomed);

        for &id in &doomed {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.set_status(status::DESTROYED, true);
            }
        }
        for &id in &doomed {
            self.consider_everywhere(id);
        }

        // Contents first so containers still exist while they are emptied
        for &id in doomed.iter().rev() {
            if let Some(entity) = self.entities.get_mut(id) {
                if entity.properties.is_bound() {
                    if let Err(e) = self.replication.unbind(&mut entity.properties) {
                        warn!("Entity {} properties could not be unbound: {}", id, e);
                    }
                }
            }
            self.region.unindex_entity(id);
            self.entities.remove(id);
        }
        debug!("Destroyed entity {} ({} contained)", entity_id, doomed.len() - 1);
        Ok(())
    }

    /// Replace an entity's locomotion state and stream it to connections
    /// that see it. Returns how many connections got the update.
    pub fn set_locomotion(&mut self, entity_id: EntityId, state: LocomotionState) -> Result<usize, SessionError> {
        let entity = self.entities.get_mut(entity_id).ok_or(EntityError::NotFound(entity_id))?;
        let previous = entity.locomotion.replace(state);

        let Some(entity) = self.entities.get(entity_id) else {
            return Ok(0);
        };
        let Some(message) = entity
            .locomotion
            .as_ref()
            .and_then(|state| build_locomotion_state_update(entity, previous.as_ref(), state, true))
        else {
            return Ok(0);
        };
        Ok(self.broadcast_locomotion(entity_id, message))
    }

    /// Send a locomotion update to every connection tracking the entity
    /// through proximity. Client-simulated entities are skipped.
    pub fn broadcast_locomotion(&mut self, entity_id: EntityId, message: ServerMessage) -> usize {
        let mut sent = 0;
        for connection in self.connections.iter_mut().filter(|c| c.is_connected()) {
            let policies = connection.aoi.tracked_policies(entity_id);
            if !policies.contains(InterestPolicies::PROXIMITY)
                || policies.contains(InterestPolicies::CLIENT_INDEPENDENT)
            {
                continue;
            }
            let outbox = connection.aoi.outbox_mut();
            if outbox.send_message(message.clone()) {
                outbox.flush();
                sent += 1;
            }
        }
        sent
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Bind a replicated object owned by `owner` to a fresh replication id
    pub fn bind_handler<H: ArchiveMessageHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        owner: EntityId,
        policies: InterestPolicies,
    ) -> Result<ReplicationId, SessionError> {
        Ok(self.replication.bind(handler, owner, policies, None)?)
    }

    pub fn unbind_handler<H: ArchiveMessageHandler + ?Sized>(&mut self, handler: &mut H) -> Result<ReplicationId, SessionError> {
        Ok(self.replication.unbind(handler)?)
    }

    /// Set one property of an entity. Returns how many connections were
    /// told about the change.
    pub fn set_entity_property(&mut self, entity_id: EntityId, property_id: u32, value: i64) -> Result<usize, SessionError> {
        let entity = self.entities.get_mut(entity_id).ok_or(EntityError::NotFound(entity_id))?;
        Ok(match entity.properties.set(property_id, value) {
            Some(update) => self.publish(&update),
            None => 0,
        })
    }

    /// Deliver a value change to every connection interested in the
    /// handler's owner through the handler's channels
    pub fn publish(&mut self, update: &ReplicationUpdate) -> usize {
        let replication_id = update.replication_id();
        let Some(owner) = self.replication.binding(replication_id).map(|binding| binding.owner_entity) else {
            trace!("Dropping update for unregistered replication id {}", replication_id);
            return 0;
        };
        let message = match update {
            ReplicationUpdate::Value { data, .. } => ServerMessage::SetReplicatedValue {
                replication_id,
                data: data.clone(),
            },
            ReplicationUpdate::Property { property_id, value, .. } => ServerMessage::SetProperty {
                replication_id,
                property_id: *property_id,
                value: *value,
            },
        };

        let channels = update.policies();
        let mut sent = 0;
        for connection in self.connections.iter_mut().filter(|c| c.is_connected()) {
            if !connection.aoi.interested_in_entity(owner, channels) {
                continue;
            }
            if connection.aoi.outbox_mut().send_message(message.clone()) {
                sent += 1;
            }
        }
        sent
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one visibility pass for every attached connection
    pub fn tick(&mut self) -> TickSummary {
        let start = Instant::now();
        self.tick_count += 1;

        let view = WorldView::new(&self.region, &self.entities).with_observer(self.observer.as_ref());
        let results: Vec<(ConnectionId, Result<PassSummary, InterestError>)> = self
            .connections
            .par_iter_mut()
            .filter(|connection| connection.is_connected())
            .map(|connection| {
                let position = focus_position(&view, connection.avatar_entity_id);
                (connection.id, connection.aoi.update(&view, position, false))
            })
            .collect();

        let mut summary = TickSummary::default();
        for (connection_id, result) in results {
            match result {
                Ok(pass) => {
                    summary.passes += 1;
                    summary.messages_sent += pass.messages_sent;
                    if pass.environment_changed {
                        summary.environment_updates += 1;
                    }
                    self.metrics.record_pass(&pass);
                }
                Err(e) => {
                    summary.failed_passes += 1;
                    warn!("Pass for connection {} failed: {}", connection_id, e);
                }
            }
        }

        summary.duration = start.elapsed();
        self.record_gauges();
        self.metrics.record_tick_time(summary.duration);
        summary
    }

    fn record_gauges(&self) {
        let (mut connected, mut areas, mut cells, mut loaded, mut entities) = (0u64, 0u64, 0u64, 0u64, 0u64);
        for connection in self.connections.iter().filter(|c| c.is_connected()) {
            connected += 1;
            areas += connection.aoi.tracked_area_count() as u64;
            cells += connection.aoi.tracked_cell_count() as u64;
            loaded += connection.aoi.loaded_cell_count() as u64;
            entities += connection.aoi.tracked_entity_count() as u64;
        }
        self.metrics.connections_active.store(connected, Ordering::Relaxed);
        self.metrics.tracked_areas.store(areas, Ordering::Relaxed);
        self.metrics.tracked_cells.store(cells, Ordering::Relaxed);
        self.metrics.loaded_cells.store(loaded, Ordering::Relaxed);
        self.metrics.tracked_entities.store(entities, Ordering::Relaxed);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn locate(&self, position: Vector3, orientation: Orientation) -> Result<RegionLocation, RegionError> {
        let cell = self.region.cell_at(position).ok_or(RegionError::NoCellAtPosition)?;
        Ok(RegionLocation {
            position,
            orientation,
            area_id: cell.area_id,
            cell_id: cell.id,
        })
    }

    fn take_out_of_world(&mut self, entity_id: EntityId) {
        if let Some(entity) = self.entities.get_mut(entity_id) {
            entity.set_status(status::EXITING_WORLD | status::IN_WORLD, false);
            entity.location = None;
        }
        self.region.unindex_entity(entity_id);
    }

    fn collect_contained(&self, entity_id: EntityId, depth: usize, out: &mut SmallVec<[EntityId; 16]>) {
        if depth >= self.config.max_container_depth {
            warn!("Inventory nesting under entity {} exceeds depth {}", entity_id, depth);
            return;
        }
        let Some(entity) = self.entities.get(entity_id) else {
            return;
        };
        for child in entity.contained_entity_ids() {
            out.push(child);
            self.collect_contained(child, depth + 1, out);
        }
    }

    /// Re-evaluate one entity on every attached connection
    fn consider_everywhere(&mut self, entity_id: EntityId) {
        let view = WorldView::new(&self.region, &self.entities).with_observer(self.observer.as_ref());
        for connection in self.connections.iter_mut().filter(|c| c.is_connected()) {
            if let Err(e) = connection.aoi.consider_entity(&view, entity_id) {
                debug!("Connection {} could not consider entity {}: {}", connection.id, entity_id, e);
            }
        }
    }
}

/// Where a connection's view is centred: its avatar when in the world,
/// otherwise the middle of the start area
fn focus_position(view: &WorldView<'_>, avatar: Option<EntityId>) -> Vector3 {
    avatar
        .and_then(|id| view.entities.get(id))
        .and_then(Entity::position)
        .or_else(|| {
            view.region.start_area().map(|area| {
                let center = area.bounds.center();
                Vector3::new(center.x, center.y, 0.0)
            })
        })
        .unwrap_or(Vector3::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::inventory::{Inventory, InventoryCategory};
    use crate::game::region::build_grid_region;
    use crate::game::replication::ReplicatedVariable;

    const PLAYER: EntityId = 1;
    const AVATAR: EntityId = 2;
    const AVATAR_LIBRARY: u64 = 50;
    const BAG: u64 = 52;
    const START: Vector3 = Vector3::new(1000.0, 1000.0, 0.0);

    /// Session with one attached player whose avatar stands at START
    fn session() -> (GameSession, ConnectionId, Receiver<Outbound>) {
        let region = build_grid_region(1, 10, 4, 4, 2048.0, 2).unwrap();
        let mut session = GameSession::new(region, InterestConfig::default(), Arc::new(Metrics::new()));
        session
            .insert_entity(
                Entity::new(PLAYER, 100, EntityKind::Player)
                    .with_inventory(Inventory::new(AVATAR_LIBRARY, InventoryCategory::Storage)),
            )
            .unwrap();
        session
            .insert_entity(Entity::new(AVATAR, 200, EntityKind::Avatar).with_inventory(Inventory::new(BAG, InventoryCategory::Bag)))
            .unwrap();
        session
            .move_to_inventory(AVATAR, InventoryLocation::new(PLAYER, AVATAR_LIBRARY, 0))
            .unwrap();
        session.enter_world(AVATAR, START, Orientation::ZERO).unwrap();

        let (connection_id, receiver) = session.add_connection(PLAYER).unwrap();
        session.attach(connection_id, Some(AVATAR)).unwrap();
        (session, connection_id, receiver)
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

    fn agent(id: EntityId) -> Entity {
        Entity::new(id, 300, EntityKind::Agent)
    }

    #[test]
    fn test_add_connection_checks_player() {
        let (mut session, _, _rx) = session();
        assert_eq!(session.add_connection(AVATAR).unwrap_err(), SessionError::NotAPlayer(AVATAR));
        assert_eq!(
            session.add_connection(PLAYER).unwrap_err(),
            SessionError::PlayerAlreadyConnected(PLAYER)
        );
        assert_eq!(
            session.add_connection(99).unwrap_err(),
            SessionError::Entity(EntityError::NotFound(99))
        );
    }

    #[test]
    fn test_attach_tracks_player_and_avatar() {
        let (mut session, connection_id, receiver) = session();
        let messages = drain(&receiver);
        assert_eq!(messages[0].name(), "RegionChange");
        assert!(session.entities().get(PLAYER).unwrap().test_status(status::IN_GAME));

        session.tick();
        let aoi = &session.connection(connection_id).unwrap().aoi;
        assert_eq!(aoi.tracked_policies(PLAYER), InterestPolicies::OWNER);
        assert_eq!(
            aoi.tracked_policies(AVATAR),
            InterestPolicies::OWNER | InterestPolicies::PROXIMITY
        );
    }

    #[test]
    fn test_spawn_and_destroy() {
        let (mut session, connection_id, receiver) = session();
        session.tick();
        let agent_id = session.spawn(agent(10), Vector3::new(1500.0, 1500.0, 0.0), Orientation::ZERO).unwrap();
        assert!(drain(&receiver).iter().any(|m| m.name() == "EntityCreate"));
        assert_eq!(session.interested_connections(agent_id, InterestPolicies::PROXIMITY), vec![connection_id]);

        session.destroy_entity(agent_id).unwrap();
        assert!(drain(&receiver).contains(&ServerMessage::EntityDestroy { entity_id: agent_id }));
        assert!(session.entities().get(agent_id).is_none());
        assert!(!session.region().entity_grid().contains(agent_id));
        assert!(session.interested_connections(agent_id, InterestPolicies::ALL_CHANNELS).is_empty());
    }

    #[test]
    fn test_exit_world_forgets_proximity_entity() {
        let (mut session, connection_id, receiver) = session();
        let agent_id = session.spawn(agent(10), Vector3::new(1500.0, 1500.0, 0.0), Orientation::ZERO).unwrap();
        session.tick();
        drain(&receiver);

        session.exit_world(agent_id).unwrap();
        assert_eq!(drain(&receiver), vec![ServerMessage::EntityDestroy { entity_id: agent_id }]);
        assert!(!session.connection(connection_id).unwrap().aoi.is_entity_tracked(agent_id));
        assert!(!session.entities().get(agent_id).unwrap().is_in_world());
    }

    #[test]
    fn test_far_entity_not_interesting() {
        let (mut session, _, _rx) = session();
        let far = session.spawn(agent(11), Vector3::new(7000.0, 7000.0, 0.0), Orientation::ZERO).unwrap();
        session.tick();
        assert!(session.interested_connections(far, InterestPolicies::ALL_CHANNELS).is_empty());
        assert_eq!(session.set_entity_property(far, 1, 5).unwrap(), 0);
    }

    #[test]
    fn test_property_change_reaches_interested_connection() {
        let (mut session, _, receiver) = session();
        let agent_id = session.spawn(agent(10), Vector3::new(1500.0, 1500.0, 0.0), Orientation::ZERO).unwrap();
        session.tick();
        drain(&receiver);

        assert_eq!(session.set_entity_property(agent_id, 7, 42).unwrap(), 1);
        let replication_id = session.entities().get(agent_id).unwrap().properties.replication_id();
        assert_eq!(
            drain(&receiver),
            vec![ServerMessage::SetProperty {
                replication_id,
                property_id: 7,
                value: 42,
            }]
        );
        // Same value again is not replicated
        assert_eq!(session.set_entity_property(agent_id, 7, 42).unwrap(), 0);
    }

    #[test]
    fn test_replicated_variable_publish() {
        let (mut session, _, receiver) = session();
        session.tick();
        drain(&receiver);

        let mut health = ReplicatedVariable::new(100u32);
        let replication_id = session
            .bind_handler(&mut health, AVATAR, InterestPolicies::OWNER)
            .unwrap();
        let update = health.set(80).unwrap().unwrap();
        assert_eq!(session.publish(&update), 1);
        match drain(&receiver).as_slice() {
            [ServerMessage::SetReplicatedValue { replication_id: id, .. }] => assert_eq!(*id, replication_id),
            other => panic!("unexpected messages {:?}", other),
        }

        assert_eq!(session.unbind_handler(&mut health).unwrap(), replication_id);
        assert_eq!(session.publish(&update), 0);
    }

    #[test]
    fn test_locomotion_broadcast() {
        let (mut session, _, receiver) = session();
        let agent_id = session.spawn(agent(10), Vector3::new(1500.0, 1500.0, 0.0), Orientation::ZERO).unwrap();
        session.tick();
        drain(&receiver);

        assert_eq!(session.set_locomotion(agent_id, LocomotionState::new(300.0)).unwrap(), 1);
        assert_eq!(
            drain(&receiver).iter().map(ServerMessage::name).collect::<Vec<_>>(),
            vec!["LocomotionStateUpdate"]
        );
    }

    #[test]
    fn test_pickup_moves_item_into_bag() {
        let (mut session, connection_id, receiver) = session();
        let item = session
            .spawn(Entity::new(30, 400, EntityKind::Item), Vector3::new(1200.0, 1200.0, 0.0), Orientation::ZERO)
            .unwrap();
        session.tick();
        assert_eq!(
            session.connection(connection_id).unwrap().aoi.tracked_policies(item),
            InterestPolicies::PROXIMITY
        );
        drain(&receiver);

        let location = InventoryLocation::new(AVATAR, BAG, 0);
        session.move_to_inventory(item, location).unwrap();
        let messages = drain(&receiver);
        assert!(messages.contains(&ServerMessage::AoiPolicyForget {
            entity_id: item,
            new_policies: InterestPolicies::OWNER,
            removed_policies: InterestPolicies::PROXIMITY,
            exit_game_world: true,
        }));
        assert!(messages.contains(&ServerMessage::InventoryMove { entity_id: item, location }));
        assert!(!session.entities().get(item).unwrap().is_in_world());
    }

    #[test]
    fn test_destroy_avatar_takes_contents() {
        let (mut session, connection_id, receiver) = session();
        session.insert_entity(Entity::new(30, 400, EntityKind::Item)).unwrap();
        session.move_to_inventory(30, InventoryLocation::new(AVATAR, BAG, 0)).unwrap();
        session.tick();
        assert!(session.connection(connection_id).unwrap().aoi.is_entity_tracked(30));
        drain(&receiver);

        session.destroy_entity(AVATAR).unwrap();
        let messages = drain(&receiver);
        assert!(messages.contains(&ServerMessage::EntityDestroy { entity_id: 30 }));
        assert!(messages.contains(&ServerMessage::EntityDestroy { entity_id: AVATAR }));
        assert!(session.entities().get(30).is_none());
        assert!(session.entities().get(PLAYER).unwrap().inventory(AVATAR_LIBRARY).unwrap().is_empty());
    }

    #[test]
    fn test_detach_and_remove_connection() {
        let (mut session, connection_id, receiver) = session();
        session.tick();
        session.detach(connection_id).unwrap();
        let aoi = &session.connection(connection_id).unwrap().aoi;
        assert_eq!(aoi.tracked_entity_count(), 0);
        assert_eq!(aoi.tracked_area_count(), 0);
        assert!(!session.entities().get(PLAYER).unwrap().test_status(status::IN_GAME));
        drain(&receiver);

        // Detached connections are skipped by the tick
        assert_eq!(session.tick().passes, 0);
        let removed = session.remove_connection(connection_id).unwrap();
        assert_eq!(removed.state, ConnectionState::Disconnected);
        assert_eq!(session.connections().count(), 0);
        assert!(session.add_connection(PLAYER).is_ok());
    }

    #[test]
    fn test_tick_records_metrics() {
        let (mut session, _, _rx) = session();
        let summary = session.tick();
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.failed_passes, 0);

        let metrics = session.metrics();
        assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.tracked_areas.load(Ordering::Relaxed), 4);
        assert!(metrics.tracked_entities.load(Ordering::Relaxed) >= 2);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 1);
        assert_eq!(session.tick_count(), 1);
    }

    #[test]
    fn test_moving_avatar_changes_view() {
        let (mut session, connection_id, _rx) = session();
        session.tick();
        session.move_entity(AVATAR, Vector3::new(7000.0, 7000.0, 0.0), Orientation::ZERO).unwrap();
        session.tick();
        let aoi = &session.connection(connection_id).unwrap().aoi;
        assert!(!aoi.is_area_tracked(1));
        assert!(aoi.is_area_tracked(16));
    }

    #[test]
    fn test_enter_world_outside_region() {
        let (mut session, _, _rx) = session();
        session.insert_entity(agent(12)).unwrap();
        assert_eq!(
            session.enter_world(12, Vector3::new(-500.0, 0.0, 0.0), Orientation::ZERO),
            Err(SessionError::Region(RegionError::NoCellAtPosition))
        );
    }
}
