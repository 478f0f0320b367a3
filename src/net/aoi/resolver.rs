//! Entity interest resolution
//!
//! Computes the channel mask one connection should track an entity
//! through. Pure with respect to its inputs: the connection's volumes and
//! tracking tables are read, never written.

use rustc_hash::FxHashMap;
use tracing::warn;

use super::volumes::InterestVolumes;
use super::{TrackedCell, TrackedEntity};
use crate::game::entity::{status, Entity, EntityId, EntityKind, EntityManager};
use crate::game::region::CellId;
use crate::net::policy::InterestPolicies;

/// Everything the resolver reads for one connection
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    pub entities: &'a EntityManager,
    pub player_id: EntityId,
    pub volumes: &'a InterestVolumes,
    pub tracked_entities: &'a FxHashMap<EntityId, TrackedEntity>,
    pub tracked_cells: &'a FxHashMap<CellId, TrackedCell>,
    pub max_container_depth: usize,
}

impl ResolveContext<'_> {
    fn previous_policies(&self, entity_id: EntityId) -> InterestPolicies {
        self.tracked_entities
            .get(&entity_id)
            .map_or(InterestPolicies::NONE, |record| record.policies)
    }

    fn player_party(&self) -> Option<u64> {
        self.entities.get(self.player_id).and_then(|player| player.party_id)
    }
}

/// Channel mask `entity` should be tracked with. NONE means "not tracked".
pub fn resolve_policies(entity: &Entity, ctx: &ResolveContext<'_>) -> InterestPolicies {
    use InterestPolicies as P;

    if entity.is_destroyed() || !entity.is_simulated() {
        return P::NONE;
    }
    if let Some(owner) = ctx.entities.owning_player(entity.id, ctx.max_container_depth) {
        if !owner.test_status(status::IN_GAME) {
            return P::NONE;
        }
    }

    let previous = ctx.previous_policies(entity.id);
    if entity.is_dead() && previous.is_empty() {
        return P::NONE;
    }
    if previous.contains(P::CLIENT_INDEPENDENT) {
        return P::CLIENT_INDEPENDENT;
    }

    let container_mask = resolve_container_mask(entity, ctx, 0);
    if let Some(location) = entity.inventory_location {
        let on_person = ctx
            .entities
            .get(location.container_id)
            .and_then(|container| container.inventory(location.inventory_ref))
            .is_some_and(|inventory| inventory.category.is_on_person());
        if on_person && container_mask.is_empty() {
            return P::NONE;
        }
    }

    if entity.restricted_to_player.is_some_and(|player| player != ctx.player_id) {
        return P::NONE;
    }

    let mut policies = P::NONE;
    if is_in_proximity(entity, ctx) {
        policies |= P::PROXIMITY;
        if entity.track_after_discovery && !entity.is_pickup {
            policies |= P::DISCOVERY;
        }
    } else {
        policies |= container_mask & P::PROXIMITY;
    }

    policies |= previous & P::DISCOVERY;

    // Contained entities are only owner-visible through an owner-visible inventory
    let owner_visible = entity.inventory_location.is_none() || container_mask.contains(P::OWNER);
    if owner_visible && ctx.entities.is_owned_by(entity.id, ctx.player_id, ctx.max_container_depth) {
        policies |= P::OWNER;
    }

    if is_party_member(entity, ctx) {
        policies |= P::PARTY;
    }

    let compatible = entity.compatible_channels;
    if entity.is_client_independent
        && compatible.contains(P::CLIENT_INDEPENDENT)
        && policies.contains(P::PROXIMITY)
    {
        return P::CLIENT_INDEPENDENT;
    }

    policies & compatible
}

/// Channels the container of `entity` exposes its contents through.
/// NONE for entities that are not stored in an inventory.
pub fn resolve_container_mask(entity: &Entity, ctx: &ResolveContext<'_>, depth: usize) -> InterestPolicies {
    use InterestPolicies as P;

    if depth > ctx.max_container_depth {
        warn!(
            "Container chain of entity {} exceeds depth {}",
            entity.id, ctx.max_container_depth
        );
        return P::NONE;
    }
    let Some(location) = entity.inventory_location else {
        return P::NONE;
    };
    let Some(container) = ctx.entities.get(location.container_id) else {
        return P::NONE;
    };
    let Some(inventory) = container.inventory(location.inventory_ref) else {
        return P::NONE;
    };

    let mut mask = P::NONE;
    if inventory.visible_to_owner && ctx.entities.is_owned_by(container.id, ctx.player_id, ctx.max_container_depth) {
        mask |= P::OWNER;
    }
    if inventory.visible_to_proximity {
        let container_in_proximity = ctx.previous_policies(container.id).contains(P::PROXIMITY)
            || resolve_container_mask(container, ctx, depth + 1).contains(P::PROXIMITY);
        if container_in_proximity {
            mask |= P::PROXIMITY;
        }
    }
    mask
}

fn is_in_proximity(entity: &Entity, ctx: &ResolveContext<'_>) -> bool {
    if !entity.is_in_world() || entity.is_exiting_world() {
        return false;
    }
    entity.location.is_some_and(|location| {
        ctx.volumes.visible.contains_point(location.position.xy()) && ctx.tracked_cells.contains_key(&location.cell_id)
    })
}

/// Players and avatars of the connection's party, other than its own
fn is_party_member(entity: &Entity, ctx: &ResolveContext<'_>) -> bool {
    let Some(party_id) = ctx.player_party() else {
        return false;
    };
    let entity_party = match entity.kind {
        EntityKind::Player => entity.party_id,
        EntityKind::Avatar => ctx
            .entities
            .owning_player(entity.id, ctx.max_container_depth)
            .and_then(|player| player.party_id),
        _ => return false,
    };
    entity_party == Some(party_id) && !ctx.entities.is_owned_by(entity.id, ctx.player_id, ctx.max_container_depth)
}
