use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::config::InterestConfig;
use crate::game::entity::EntityId;
use crate::net::aoi::AreaOfInterest;
use crate::net::protocol::ServerMessage;

pub type ConnectionId = u64;

/// What a connection hands to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// End of one visibility pass; the transport may write out its batch
    Flush,
}

/// Sending half of a connection's ordered message stream
#[derive(Debug)]
pub struct ConnectionOutbox {
    sender: Sender<Outbound>,
    messages_sent: u64,
    flushes: u64,
}

impl ConnectionOutbox {
    /// Create an outbox and the receiver the transport drains
    pub fn channel() -> (Self, Receiver<Outbound>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (
            Self {
                sender,
                messages_sent: 0,
                flushes: 0,
            },
            receiver,
        )
    }

    /// Queue a message. Returns false once the transport side is gone.
    pub fn send_message(&mut self, message: ServerMessage) -> bool {
        trace!("-> {}", message.name());
        if self.sender.send(Outbound::Message(message)).is_err() {
            trace!("Outbox receiver dropped, message discarded");
            return false;
        }
        self.messages_sent += 1;
        true
    }

    pub fn flush(&mut self) {
        if self.sender.send(Outbound::Flush).is_ok() {
            self.flushes += 1;
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet attached to a region
    Connecting,
    /// Attached to a region and receiving passes
    Connected,
    /// Being detached
    Disconnecting,
    /// Fully detached
    Disconnected,
}

/// One client as seen by the game: its player entity and its view
#[derive(Debug)]
pub struct PlayerConnection {
    pub id: ConnectionId,
    pub player_entity_id: EntityId,
    /// In-world entity the view follows
    pub avatar_entity_id: Option<EntityId>,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub aoi: AreaOfInterest,
}

impl PlayerConnection {
    pub fn new(id: ConnectionId, player_entity_id: EntityId, outbox: ConnectionOutbox, config: &InterestConfig) -> Self {
        Self {
            id,
            player_entity_id,
            avatar_entity_id: None,
            state: ConnectionState::Connecting,
            created_at: Instant::now(),
            aoi: AreaOfInterest::new(player_entity_id, outbox, config),
        }
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Connection manager
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: FxHashMap<ConnectionId, PlayerConnection>,
    player_connections: FxHashMap<EntityId, ConnectionId>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connection for `player_entity_id` with a random id.
    /// Returns None if the player already has a connection.
    pub fn create(
        &mut self,
        player_entity_id: EntityId,
        outbox: ConnectionOutbox,
        config: &InterestConfig,
    ) -> Option<ConnectionId> {
        if self.player_connections.contains_key(&player_entity_id) {
            return None;
        }
        // Generate random connection ID (avoid collisions)
        let id = loop {
            let candidate = rand::random::<ConnectionId>();
            if candidate != 0 && !self.connections.contains_key(&candidate) {
                break candidate;
            }
        };

        self.connections
            .insert(id, PlayerConnection::new(id, player_entity_id, outbox, config));
        self.player_connections.insert(player_entity_id, id);
        Some(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&PlayerConnection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut PlayerConnection> {
        self.connections.get_mut(&id)
    }

    pub fn get_by_player(&self, player_entity_id: EntityId) -> Option<&PlayerConnection> {
        self.player_connections
            .get(&player_entity_id)
            .and_then(|id| self.connections.get(id))
    }

    pub fn get_by_player_mut(&mut self, player_entity_id: EntityId) -> Option<&mut PlayerConnection> {
        let id = self.player_connections.get(&player_entity_id).copied()?;
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<PlayerConnection> {
        let connection = self.connections.remove(&id)?;
        self.player_connections.remove(&connection.player_entity_id);
        Some(connection)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Connection ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerConnection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerConnection> {
        self.connections.values_mut()
    }

    /// Every connection, for passes run on the rayon pool
    pub fn par_iter_mut(&mut self) -> impl ParallelIterator<Item = &mut PlayerConnection> + '_ {
        self.connections.par_iter_mut().map(|(_, connection)| connection)
    }
}
