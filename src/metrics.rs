//! Prometheus-compatible metrics endpoint
//!
//! Exposes interest-management metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::net::aoi::PassSummary;

/// Samples kept for pass time percentiles
const PASS_HISTORY_LEN: usize = 1000;

/// Metrics registry for the interest engine
#[derive(Debug)]
pub struct Metrics {
    // Connections and tracking gauges (sum over all connections)
    pub connections_active: AtomicU64,
    pub tracked_areas: AtomicU64,
    pub tracked_cells: AtomicU64,
    pub tracked_entities: AtomicU64,
    pub loaded_cells: AtomicU64,

    // Tick timing (microseconds, whole tick over every connection)
    pub pass_time_us: AtomicU64,
    pub pass_time_p95_us: AtomicU64,
    pub pass_time_p99_us: AtomicU64,
    pub pass_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Network stats
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub environment_updates: AtomicU64,

    // Lifecycle counters
    #[cfg(feature = "metrics_extended")]
    pub entities_added: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub entities_removed: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub entities_modified: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub stale_ops_skipped: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub areas_added: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub areas_removed: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub cells_created: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub cells_destroyed: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation (VecDeque for O(1) pop_front)
    pass_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            tracked_areas: AtomicU64::new(0),
            tracked_cells: AtomicU64::new(0),
            tracked_entities: AtomicU64::new(0),
            loaded_cells: AtomicU64::new(0),
            pass_time_us: AtomicU64::new(0),
            pass_time_p95_us: AtomicU64::new(0),
            pass_time_p99_us: AtomicU64::new(0),
            pass_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            environment_updates: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            entities_added: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            entities_removed: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            entities_modified: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            stale_ops_skipped: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            areas_added: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            areas_removed: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            cells_created: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            cells_destroyed: AtomicU64::new(0),
            start_time: Instant::now(),
            pass_history: RwLock::new(VecDeque::with_capacity(PASS_HISTORY_LEN)),
        }
    }

    /// Fold one connection's pass into the counters
    pub fn record_pass(&self, summary: &PassSummary) {
        self.messages_sent.fetch_add(summary.messages_sent, Ordering::Relaxed);
        if summary.environment_changed {
            self.environment_updates.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics_extended")]
        {
            self.entities_added.fetch_add(summary.entities_added as u64, Ordering::Relaxed);
            self.entities_removed.fetch_add(summary.entities_removed as u64, Ordering::Relaxed);
            self.entities_modified.fetch_add(summary.entities_modified as u64, Ordering::Relaxed);
            self.stale_ops_skipped.fetch_add(summary.ops_skipped as u64, Ordering::Relaxed);
            self.areas_added.fetch_add(summary.areas_added as u64, Ordering::Relaxed);
            self.areas_removed.fetch_add(summary.areas_removed as u64, Ordering::Relaxed);
            self.cells_created.fetch_add(summary.cells_created as u64, Ordering::Relaxed);
            self.cells_destroyed.fetch_add(summary.cells_destroyed as u64, Ordering::Relaxed);
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.pass_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.pass_history.write();
        history.push_back(us);
        while history.len() > PASS_HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.pass_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.pass_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.pass_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("worldsync_connections_active", "Connections attached to a region", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("worldsync_tracked_areas", "Areas tracked over all connections", "gauge",
            self.tracked_areas.load(Ordering::Relaxed));
        metric!("worldsync_tracked_cells", "Cells tracked over all connections", "gauge",
            self.tracked_cells.load(Ordering::Relaxed));
        metric!("worldsync_loaded_cells", "Cells acknowledged as loaded by clients", "gauge",
            self.loaded_cells.load(Ordering::Relaxed));
        metric!("worldsync_tracked_entities", "Entities tracked over all connections", "gauge",
            self.tracked_entities.load(Ordering::Relaxed));

        metric!("worldsync_pass_time_us", "Last tick's visibility pass time in microseconds", "gauge",
            self.pass_time_us.load(Ordering::Relaxed));
        metric!("worldsync_pass_time_p95_us", "95th percentile pass time", "gauge",
            self.pass_time_p95_us.load(Ordering::Relaxed));
        metric!("worldsync_pass_time_p99_us", "99th percentile pass time", "gauge",
            self.pass_time_p99_us.load(Ordering::Relaxed));
        metric!("worldsync_pass_time_max_us", "Maximum pass time in recent history", "gauge",
            self.pass_time_max_us.load(Ordering::Relaxed));
        metric!("worldsync_ticks_total", "Ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("worldsync_messages_sent_total", "Messages queued to connections", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("worldsync_bytes_sent_total", "Encoded message bytes drained by the transport", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("worldsync_environment_updates_total", "Environment updates sent", "counter",
            self.environment_updates.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("worldsync_entities_added_total", "Entity add transitions", "counter",
                self.entities_added.load(Ordering::Relaxed));
            metric!("worldsync_entities_removed_total", "Entity remove transitions", "counter",
                self.entities_removed.load(Ordering::Relaxed));
            metric!("worldsync_entities_modified_total", "Entity policy changes", "counter",
                self.entities_modified.load(Ordering::Relaxed));
            metric!("worldsync_stale_ops_skipped_total", "Queued transitions dropped as stale", "counter",
                self.stale_ops_skipped.load(Ordering::Relaxed));
            metric!("worldsync_areas_added_total", "Areas added", "counter",
                self.areas_added.load(Ordering::Relaxed));
            metric!("worldsync_areas_removed_total", "Areas removed", "counter",
                self.areas_removed.load(Ordering::Relaxed));
            metric!("worldsync_cells_created_total", "Cells created", "counter",
                self.cells_created.load(Ordering::Relaxed));
            metric!("worldsync_cells_destroyed_total", "Cells destroyed", "counter",
                self.cells_destroyed.load(Ordering::Relaxed));
        }

        metric!("worldsync_uptime_seconds", "Server uptime in seconds", "counter", self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        #[allow(unused_mut)]
        let mut value = serde_json::json!({
            "tracking": {
                "connections": load(&self.connections_active),
                "areas": load(&self.tracked_areas),
                "cells": load(&self.tracked_cells),
                "loaded_cells": load(&self.loaded_cells),
                "entities": load(&self.tracked_entities),
            },
            "performance": {
                "pass_time_us": load(&self.pass_time_us),
                "pass_time_p95_us": load(&self.pass_time_p95_us),
                "pass_time_p99_us": load(&self.pass_time_p99_us),
                "pass_time_max_us": load(&self.pass_time_max_us),
                "tick_count": load(&self.tick_count),
            },
            "network": {
                "messages_sent": load(&self.messages_sent),
                "bytes_sent": load(&self.bytes_sent),
                "environment_updates": load(&self.environment_updates),
            },
            "uptime_seconds": self.uptime_seconds(),
        });

        #[cfg(feature = "metrics_extended")]
        {
            value["lifecycle"] = serde_json::json!({
                "entities_added": load(&self.entities_added),
                "entities_removed": load(&self.entities_removed),
                "entities_modified": load(&self.entities_modified),
                "stale_ops_skipped": load(&self.stale_ops_skipped),
                "areas_added": load(&self.areas_added),
                "areas_removed": load(&self.areas_removed),
                "cells_created": load(&self.cells_created),
                "cells_destroyed": load(&self.cells_destroyed),
            });
        }

        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
                        http_response("200 OK", "application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("200 OK", "text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
                        http_response("200 OK", "text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}
