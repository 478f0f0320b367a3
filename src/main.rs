use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use rand::Rng;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use worldsync_server::config::ServerConfig;
use worldsync_server::game::entity::{Entity, EntityId, EntityKind};
use worldsync_server::game::inventory::{Inventory, InventoryCategory, InventoryLocation};
use worldsync_server::game::region::build_grid_region;
use worldsync_server::game::session::GameSession;
use worldsync_server::metrics::{self, Metrics};
use worldsync_server::net::connection::{ConnectionId, Outbound};
use worldsync_server::net::protocol::{self, ServerMessage};
use worldsync_server::util::vector::{Orientation, Vector3};

/// Demo region layout
const AREAS_PER_SIDE: u32 = 8;
const AREA_SIZE: f32 = 2048.0;
const CELLS_PER_SIDE: u32 = 4;

const AVATAR_LIBRARY: u64 = 50;
const EQUIPMENT: u64 = 51;

/// World units an avatar walks per second
const WALK_SPEED: f32 = 600.0;
/// Ticks between status log lines
const STATUS_INTERVAL: u64 = 200;

/// A simulated client: one player walking its avatar between waypoints
struct DemoClient {
    connection_id: ConnectionId,
    avatar: EntityId,
    waypoint: Vector3,
    receiver: Receiver<Outbound>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("WorldSync Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: tick_rate={}, aoi_volume={}, connections={}, entities={}",
        config.tick_rate, config.interest.aoi_volume, config.demo_connections, config.demo_entities
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let region = build_grid_region(1, 1, AREAS_PER_SIDE, AREAS_PER_SIDE, AREA_SIZE, CELLS_PER_SIDE)?;
    let mut session = GameSession::new(region, config.interest.clone(), metrics.clone());
    let mut rng = rand::thread_rng();

    let agents = populate(&mut session, &mut rng, config.demo_entities);
    info!("Spawned {} world entities", agents.len());

    let mut clients = Vec::with_capacity(config.demo_connections);
    for _ in 0..config.demo_connections {
        match connect_client(&mut session, &mut rng) {
            Ok(client) => clients.push(client),
            Err(e) => warn!("Demo client could not connect: {}", e),
        }
    }
    info!("{} demo connections attached", clients.len());

    let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate as f64);
    let mut ticker = tokio::time::interval(tick_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_tick(&mut session, &mut clients, &agents, &mut rng, tick_duration.as_secs_f32());
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Cleanup
    for client in &clients {
        if let Err(e) = session.remove_connection(client.connection_id) {
            debug!("Connection {} cleanup: {}", client.connection_id, e);
        }
    }
    info!("Server stopped after {} ticks", session.tick_count());
    Ok(())
}

/// Scatter agents, items and props over the region
fn populate(session: &mut GameSession, rng: &mut impl Rng, count: usize) -> Vec<EntityId> {
    let mut spawned = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = match rng.gen_range(0..10) {
            0..=5 => EntityKind::Agent,
            6..=8 => EntityKind::Item,
            _ => EntityKind::Prop,
        };
        let mut entity = Entity::new(0, 300 + rng.gen_range(0..16), kind);
        entity.track_after_discovery = kind == EntityKind::Agent && rng.gen_bool(0.05);
        entity.is_pickup = kind == EntityKind::Item;

        let orientation = Orientation::from_yaw(rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI));
        match session.spawn(entity, random_position(rng), orientation) {
            Ok(id) => spawned.push(id),
            Err(e) => warn!("Failed to spawn demo entity: {}", e),
        }
    }
    spawned
}

/// Create a player with an avatar in the world and attach its connection
fn connect_client(session: &mut GameSession, rng: &mut impl Rng) -> anyhow::Result<DemoClient> {
    let player = session.insert_entity(
        Entity::new(0, 100, EntityKind::Player).with_inventory(Inventory::new(AVATAR_LIBRARY, InventoryCategory::Storage)),
    )?;
    let avatar = session.insert_entity(
        Entity::new(0, 200, EntityKind::Avatar).with_inventory(Inventory::new(EQUIPMENT, InventoryCategory::OnPerson)),
    )?;
    session.move_to_inventory(avatar, InventoryLocation::new(player, AVATAR_LIBRARY, 0))?;
    session.enter_world(avatar, random_position(rng), Orientation::ZERO)?;

    let (connection_id, receiver) = session.add_connection(player)?;
    session.attach(connection_id, Some(avatar))?;
    Ok(DemoClient {
        connection_id,
        avatar,
        waypoint: random_position(rng),
        receiver,
    })
}

fn run_tick(
    session: &mut GameSession,
    clients: &mut [DemoClient],
    agents: &[EntityId],
    rng: &mut impl Rng,
    dt: f32,
) {
    for client in clients.iter_mut() {
        walk_avatar(session, client, rng, dt);
    }

    // Some property churn so replication traffic shows up
    if !agents.is_empty() && session.tick_count() % 10 == 0 {
        let agent = agents[rng.gen_range(0..agents.len())];
        if let Err(e) = session.set_entity_property(agent, 1, rng.gen_range(0..1000)) {
            debug!("Property update for {} skipped: {}", agent, e);
        }
    }

    let summary = session.tick();

    for client in clients.iter() {
        drain_client(session, client);
    }

    if session.tick_count() % STATUS_INTERVAL == 0 {
        info!(
            "Tick {}: {} passes, {} messages, {:?}",
            session.tick_count(),
            summary.passes,
            summary.messages_sent,
            summary.duration
        );
    }
}

fn walk_avatar(session: &mut GameSession, client: &mut DemoClient, rng: &mut impl Rng, dt: f32) {
    let Some(position) = session.entities().get(client.avatar).and_then(Entity::position) else {
        return;
    };
    let to_waypoint = client.waypoint - position;
    let distance = to_waypoint.length_sq().sqrt();
    let step = WALK_SPEED * dt;

    let next = if distance <= step {
        client.waypoint = random_position(rng);
        position + to_waypoint
    } else {
        position + to_waypoint * (step / distance)
    };
    if let Err(e) = session.move_entity(client.avatar, next, Orientation::from_yaw(to_waypoint.yaw())) {
        debug!("Avatar {} could not move: {}", client.avatar, e);
    }
}

/// Play the client: encode everything it was sent and acknowledge cells
fn drain_client(session: &mut GameSession, client: &DemoClient) {
    let mut loaded_cells = Vec::new();
    for outbound in client.receiver.try_iter() {
        let Outbound::Message(message) = outbound else {
            continue;
        };
        match protocol::encode(&message) {
            Ok(bytes) => session.metrics().record_bytes_sent(bytes.len()),
            Err(e) => warn!("Failed to encode {}: {}", message.name(), e),
        }
        if let ServerMessage::CellCreate { cell_id, .. } = message {
            loaded_cells.push(cell_id);
        }
    }
    for cell_id in loaded_cells {
        if let Err(e) = session.on_cell_loaded(client.connection_id, cell_id) {
            debug!("Cell {} ack ignored: {}", cell_id, e);
        }
    }
}

fn random_position(rng: &mut impl Rng) -> Vector3 {
    let extent = AREAS_PER_SIDE as f32 * AREA_SIZE;
    Vector3::new(rng.gen_range(0.0..extent), rng.gen_range(0.0..extent), 0.0)
}
