use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::game::constants::aoi::{AOI_VOLUME_DEFAULT, AOI_VOLUME_MAX, AOI_VOLUME_MIN, MAX_CONTAINER_DEPTH, UPDATE_DISTANCE};
use crate::game::constants::session::{METRICS_PORT, TICK_RATE};

/// Per-connection interest settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestConfig {
    /// Side of the square view footprint
    pub aoi_volume: f32,
    /// Distance the player must move before volumes are recomputed
    pub update_distance: f32,
    /// Inventory nesting walked by the resolver and lifecycle recursion
    pub max_container_depth: usize,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            aoi_volume: AOI_VOLUME_DEFAULT,
            update_distance: UPDATE_DISTANCE,
            max_container_depth: MAX_CONTAINER_DEPTH,
        }
    }
}

impl InterestConfig {
    /// Read a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
        serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(AOI_VOLUME_MIN..=AOI_VOLUME_MAX).contains(&self.aoi_volume) {
            return Err(format!(
                "aoi_volume must be within {}..={}",
                AOI_VOLUME_MIN, AOI_VOLUME_MAX
            ));
        }
        if !(self.update_distance > 0.0) {
            return Err("update_distance must be positive".to_string());
        }
        if self.max_container_depth == 0 {
            return Err("max_container_depth must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the metrics endpoint binds to
    pub bind_address: IpAddr,
    /// Port of the Prometheus metrics endpoint
    pub metrics_port: u16,
    /// Visibility passes per second
    pub tick_rate: u32,
    /// Simulated connections in the demo harness
    pub demo_connections: usize,
    /// Wandering agents spawned in the demo region
    pub demo_entities: usize,
    pub interest: InterestConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            metrics_port: METRICS_PORT,
            tick_rate: TICK_RATE,
            demo_connections: 8,
            demo_entities: 2000,
            interest: InterestConfig::default(),
        }
    }
}

/// Parse an env var, keeping `current` when it is unset, malformed or
/// rejected by `accept`
fn env_or<T>(name: &str, current: T, accept: impl Fn(&T) -> bool) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => parsed,
        Ok(parsed) => {
            tracing::warn!("{} value {} out of range, using {}", name, parsed, current);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using {}", name, raw, current);
            current
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        config.metrics_port = env_or("METRICS_PORT", config.metrics_port, |port| *port > 0);
        config.tick_rate = env_or("TICK_RATE", config.tick_rate, |rate| (1..=240).contains(rate));
        config.demo_connections = env_or("DEMO_CONNECTIONS", config.demo_connections, |n| *n <= 10_000);
        config.demo_entities = env_or("DEMO_ENTITIES", config.demo_entities, |n| *n <= 1_000_000);

        if let Ok(path) = std::env::var("INTEREST_CONFIG_PATH") {
            match InterestConfig::from_json_file(&path) {
                Ok(interest) => config.interest = interest,
                Err(e) => tracing::warn!("Could not load interest config {}, using defaults", e),
            }
        }

        // Individual env vars win over the file
        let interest = &mut config.interest;
        interest.aoi_volume = env_or("AOI_VOLUME", interest.aoi_volume, |v| {
            (AOI_VOLUME_MIN..=AOI_VOLUME_MAX).contains(v)
        });
        interest.update_distance = env_or("AOI_UPDATE_DISTANCE", interest.update_distance, |d| *d > 0.0);
        interest.max_container_depth = env_or("MAX_CONTAINER_DEPTH", interest.max_container_depth, |d| {
            (1..=64).contains(d)
        });

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.metrics_port == 0 {
            return Err("Metrics port cannot be 0".to_string());
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        self.interest.validate()
    }
}
