//! Replication id registry
//!
//! Every individually replicated object (a property collection, a single
//! replicated variable) gets a session-unique replication id. Clients route
//! value updates by that id.
//!
//! - One counter and one id → handler table per game session
//! - Ids come from `++counter`; 0 is never handed out
//! - Caller-supplied ids are accepted when free (snapshot restore)

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::game::constants::session::REPLICATION_SEED_MASK;
use crate::game::entity::{EntityId, INVALID_ENTITY_ID};
use crate::net::policy::InterestPolicies;
use crate::net::protocol::{self, EncodeError};

pub type ReplicationId = u64;

pub const INVALID_REPLICATION_ID: ReplicationId = 0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error("Handler is already bound with replication id {0}")]
    AlreadyBound(ReplicationId),
    #[error("Replication id {0} is already in use")]
    IdInUse(ReplicationId),
    #[error("Replication id {0} is not registered")]
    NotRegistered(ReplicationId),
    #[error("Handler is not bound")]
    NotBound,
}

/// Something that can be bound to a replication id
pub trait ArchiveMessageHandler {
    fn replication_id(&self) -> ReplicationId;
    fn set_replication_id(&mut self, id: ReplicationId);
    fn interest_policies(&self) -> InterestPolicies;
    fn set_interest_policies(&mut self, policies: InterestPolicies);

    /// Short name for logs
    fn kind(&self) -> &'static str;

    #[inline]
    fn is_bound(&self) -> bool {
        self.replication_id() != INVALID_REPLICATION_ID
    }
}

/// What the registry remembers about a bound handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerBinding {
    pub owner_entity: EntityId,
    pub policies: InterestPolicies,
    pub kind: &'static str,
}

#[derive(Debug)]
pub struct ReplicationRegistry {
    current_id: ReplicationId,
    handlers: FxHashMap<ReplicationId, HandlerBinding>,
}

impl ReplicationRegistry {
    pub fn new(initial_id: ReplicationId) -> Self {
        Self {
            current_id: initial_id,
            handlers: FxHashMap::default(),
        }
    }

    /// Seed the counter from the low 16 bits of the current UTC seconds
    pub fn seeded_from_clock() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let registry = Self::new(seconds & REPLICATION_SEED_MASK);
        info!("Replication registry seeded, initial replication id: {}", registry.current_id);
        registry
    }

    /// Last id handed out by the counter
    pub fn current_id(&self) -> ReplicationId {
        self.current_id
    }

    /// Bind `handler`, either to the next counter id or to `requested`.
    pub fn bind<H: ArchiveMessageHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        owner_entity: EntityId,
        policies: InterestPolicies,
        requested: Option<ReplicationId>,
    ) -> Result<ReplicationId, ReplicationError> {
        if handler.is_bound() {
            warn!(
                "bind(): {} already bound with replication id {}",
                handler.kind(),
                handler.replication_id()
            );
            return Err(ReplicationError::AlreadyBound(handler.replication_id()));
        }

        let id = match requested {
            Some(id) if id != INVALID_REPLICATION_ID => {
                if self.handlers.contains_key(&id) {
                    warn!("bind(): requested replication id {} is already in use", id);
                    return Err(ReplicationError::IdInUse(id));
                }
                id
            }
            _ => self.next_free_id(),
        };

        self.handlers.insert(
            id,
            HandlerBinding {
                owner_entity,
                policies,
                kind: handler.kind(),
            },
        );
        handler.set_replication_id(id);
        handler.set_interest_policies(policies);
        debug!("Bound {} to replication id {}", handler.kind(), id);
        Ok(id)
    }

    /// Release `handler`'s id and mark it unbound
    pub fn unbind<H: ArchiveMessageHandler + ?Sized>(&mut self, handler: &mut H) -> Result<ReplicationId, ReplicationError> {
        let id = handler.replication_id();
        if id == INVALID_REPLICATION_ID {
            return Err(ReplicationError::NotBound);
        }
        if self.handlers.remove(&id).is_none() {
            warn!("unbind(): replication id {} is not registered", id);
            return Err(ReplicationError::NotRegistered(id));
        }
        handler.set_replication_id(INVALID_REPLICATION_ID);
        Ok(id)
    }

    pub fn binding(&self, id: ReplicationId) -> Option<&HandlerBinding> {
        self.handlers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn next_free_id(&mut self) -> ReplicationId {
        loop {
            self.current_id = self.current_id.wrapping_add(1);
            if self.current_id != INVALID_REPLICATION_ID && !self.handlers.contains_key(&self.current_id) {
                return self.current_id;
            }
        }
    }
}

// ============================================================================
// Replicated objects
// ============================================================================

/// Value change to push to interested connections
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationUpdate {
    Value {
        replication_id: ReplicationId,
        policies: InterestPolicies,
        data: Vec<u8>,
    },
    Property {
        replication_id: ReplicationId,
        policies: InterestPolicies,
        property_id: u32,
        value: i64,
    },
}

impl ReplicationUpdate {
    pub fn replication_id(&self) -> ReplicationId {
        match self {
            ReplicationUpdate::Value { replication_id, .. } | ReplicationUpdate::Property { replication_id, .. } => {
                *replication_id
            }
        }
    }

    pub fn policies(&self) -> InterestPolicies {
        match self {
            ReplicationUpdate::Value { policies, .. } | ReplicationUpdate::Property { policies, .. } => *policies,
        }
    }
}

/// A single replicated scalar
#[derive(Debug, Clone)]
pub struct ReplicatedVariable<T> {
    value: T,
    replication_id: ReplicationId,
    policies: InterestPolicies,
}

impl<T: Serialize + PartialEq> ReplicatedVariable<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            replication_id: INVALID_REPLICATION_ID,
            policies: InterestPolicies::NONE,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Store `value`. Returns the update to send when bound and changed.
    pub fn set(&mut self, value: T) -> Result<Option<ReplicationUpdate>, EncodeError> {
        if self.value == value {
            return Ok(None);
        }
        self.value = value;
        if !self.is_bound() {
            return Ok(None);
        }
        Ok(Some(ReplicationUpdate::Value {
            replication_id: self.replication_id,
            policies: self.policies,
            data: protocol::encode(&self.value)?,
        }))
    }
}

impl<T> ArchiveMessageHandler for ReplicatedVariable<T> {
    fn replication_id(&self) -> ReplicationId {
        self.replication_id
    }

    fn set_replication_id(&mut self, id: ReplicationId) {
        self.replication_id = id;
    }

    fn interest_policies(&self) -> InterestPolicies {
        self.policies
    }

    fn set_interest_policies(&mut self, policies: InterestPolicies) {
        self.policies = policies;
    }

    fn kind(&self) -> &'static str {
        "ReplicatedVariable"
    }
}

/// Entity property values replicated as one handler
#[derive(Debug, Clone, Default)]
pub struct ReplicatedPropertyCollection {
    values: BTreeMap<u32, i64>,
    replication_id: ReplicationId,
    policies: InterestPolicies,
    owner_entity: EntityId,
}

impl ReplicatedPropertyCollection {
    pub fn new(owner_entity: EntityId) -> Self {
        Self {
            values: BTreeMap::new(),
            replication_id: INVALID_REPLICATION_ID,
            policies: InterestPolicies::NONE,
            owner_entity,
        }
    }

    pub fn owner_entity(&self) -> EntityId {
        self.owner_entity
    }

    pub fn get(&self, property_id: u32) -> Option<i64> {
        self.values.get(&property_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.values.iter().map(|(id, value)| (*id, *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set a property. Returns the update to send when bound and changed.
    pub fn set(&mut self, property_id: u32, value: i64) -> Option<ReplicationUpdate> {
        if self.values.insert(property_id, value) == Some(value) {
            return None;
        }
        if !self.is_bound() || self.owner_entity == INVALID_ENTITY_ID {
            return None;
        }
        Some(ReplicationUpdate::Property {
            replication_id: self.replication_id,
            policies: self.policies,
            property_id,
            value,
        })
    }
}

impl ArchiveMessageHandler for ReplicatedPropertyCollection {
    fn replication_id(&self) -> ReplicationId {
        self.replication_id
    }

    fn set_replication_id(&mut self, id: ReplicationId) {
        self.replication_id = id;
    }

    fn interest_policies(&self) -> InterestPolicies {
        self.policies
    }

    fn set_interest_policies(&mut self, policies: InterestPolicies) {
        self.policies = policies;
    }

    fn kind(&self) -> &'static str {
        "ReplicatedPropertyCollection"
    }
}
