//! Session Configuration
//!
//! Role and radio settings for one mesh node, loadable from JSON.

use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Default time the transport gets to confirm start/stop
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a single connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Peers not heard from within this window are unreliable for display
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(90);

/// Role of a node in the star topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin, // Hub: receives SOS and locations, issues alerts
    User,  // Spoke: reports to the admin, receives alerts
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::User => f.write_str("user"),
        }
    }
}

/// Settings for one session lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub role: Role,
    /// Name shown in advertisements; empty means derive one from the node id
    pub visible_name: String,
    pub advertise: bool,
    pub scan: bool,
    /// Connect to newly discovered peers (star topology pull-in)
    pub connect_on_discovery: bool,
    #[serde(with = "duration_ms")]
    pub transport_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub staleness_window: Duration,
}

impl SessionConfig {
    /// Hub configuration: advertises so users can find it, and scans
    pub fn admin(visible_name: impl Into<String>) -> Self {
        Self {
            role: Role::Admin,
            visible_name: visible_name.into(),
            advertise: true,
            ..Self::default()
        }
    }

    /// Spoke configuration: scans for the hub without advertising
    pub fn user(visible_name: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            visible_name: visible_name.into(),
            advertise: false,
            ..Self::default()
        }
    }

    pub fn with_advertise(mut self, advertise: bool) -> Self {
        self.advertise = advertise;
        self
    }

    pub fn with_scan(mut self, scan: bool) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_connect_on_discovery(mut self, connect: bool) -> Self {
        self.connect_on_discovery = connect;
        self
    }

    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    /// Parse a configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&contents)?;
        info!("Loaded {} session config from {}", config.role, path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::User,
            visible_name: String::new(),
            advertise: false,
            scan: true,
            connect_on_discovery: true,
            transport_timeout: DEFAULT_TRANSPORT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            staleness_window: DEFAULT_STALENESS_WINDOW,
        }
    }
}

// Durations are written as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
