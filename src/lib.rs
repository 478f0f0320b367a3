//! WorldSync Server Library
//!
//! Per-connection interest management for a region-based game server:
//! which areas, cells and entities each client knows about, and the
//! messages that keep the client's view in step with the world.
//!
//! # Features
//!
//! - `metrics_extended` - Per-transition lifecycle counters in the metrics endpoint (enabled by default)

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
