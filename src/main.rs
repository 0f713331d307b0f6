//! Emergency Mesh node
//!
//! Runs one Admin or User node on the host Bluetooth adapter and logs
//! everything the mesh delivers until interrupted.
//!
//! Usage: `emergency-mesh [config.json]`

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use emergency_mesh::bluetooth::BleTransport;
use emergency_mesh::message::pump;
use emergency_mesh::{MeshHandler, MeshSession, Role, SessionConfig};

/// How often the admin logs the location picture
const LOCATION_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Writes mesh notifications to the log
struct ConsoleHandler;

impl MeshHandler for ConsoleHandler {
    fn on_message(&mut self, sender_id: &str, text: &str) {
        info!("[{}] {}", sender_id, text);
    }

    fn on_sos(&mut self, sender_id: &str, latitude: f64, longitude: f64) {
        warn!("SOS from {} at {:.6}, {:.6}", sender_id, latitude, longitude);
    }

    fn on_alert(&mut self, text: &str) {
        warn!("ALERT: {}", text);
    }

    fn on_location(&mut self, sender_id: &str, latitude: f64, longitude: f64) {
        info!("{} is at {:.6}, {:.6}", sender_id, latitude, longitude);
    }

    fn on_peer_connected(&mut self, address: &str) {
        info!("Peer connected: {}", address);
    }

    fn on_peer_disconnected(&mut self, address: &str) {
        info!("Peer disconnected: {}", address);
    }
}

fn load_config() -> Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => {
            info!("No configuration file given, running as a field user");
            Ok(SessionConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("=== Emergency Mesh: Offline Bluetooth LE Emergency Messaging ===");

    let config = load_config()?;
    let role = config.role;

    let transport = Arc::new(BleTransport::new().await);
    let (session, events) = MeshSession::new(transport);
    let deliveries = tokio::spawn(pump(events, ConsoleHandler));

    session
        .start(config)
        .await
        .context("Failed to start mesh session")?;
    info!("Node {} running as {}", session.node_id(), role);

    let mut report = time::interval(LOCATION_REPORT_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            _ = report.tick(), if role == Role::Admin => {
                match session.status().await {
                    Ok(status) => info!(
                        "{} peers, {} connected, {} located",
                        status.peers.total_peers, status.peers.connected_peers, status.peers.located_peers
                    ),
                    Err(e) => warn!("Status unavailable: {}", e),
                }
                for (address, point) in session.locations().await.unwrap_or_default() {
                    info!("  {} -> {:.6}, {:.6}", address, point.latitude, point.longitude);
                }
            }
        }
    }

    info!("Shutting down");
    if let Err(e) = session.stop().await {
        warn!("Mesh session did not stop cleanly: {}", e);
    }

    drop(session);
    deliveries.await.context("Event delivery task failed")?;
    Ok(())
}
