//! Configuration structs with sensible defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and per-peer transport settings.
    pub network: NetworkConfig,
    /// Tick cadence and housekeeping intervals.
    pub server: ServerConfig,
    /// Block emerge and send scheduling knobs.
    pub streaming: StreamingConfig,
    /// Accepted serialization versions.
    pub protocol: ProtocolConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds to.
    pub bind_address: String,
    /// Listener port.
    pub port: u16,
    /// Maximum concurrently connected peers.
    pub max_clients: usize,
    /// Largest frame accepted or emitted, in bytes.
    pub max_frame_size: u32,
    /// Frames buffered per peer before `send` reports backpressure.
    pub outbound_queue_frames: usize,
    /// Seconds of inbound silence after which a peer is dropped as timed out.
    pub peer_timeout_s: f32,
}

/// Tick and housekeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Seconds between periodic status log lines (0 disables them).
    pub print_info_interval_s: f32,
    /// Seconds between worker re-triggers while emerge requests are pending.
    pub emerge_trigger_interval_s: f32,
}

/// Scheduling configuration for emerging and sending blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Upper bound on any client's requested view radius, in blocks.
    pub max_view_radius: i16,
    /// Sends plus emerges planned for one client in a single tick.
    pub max_blocks_planned_per_client: usize,
    /// Emerge requests issued for one client in a single tick.
    pub max_emerges_per_client: usize,
    /// Block sends drained across all clients in a single tick.
    pub max_sends_per_tick: usize,
    /// Block sends drained for one client in a single tick.
    pub max_sends_per_client_per_tick: usize,
    /// Encoded bytes transmitted to one client in a single tick.
    pub bytes_per_client_per_tick: usize,
    /// Seconds after which a queued send counts as overdue.
    pub block_send_timeout_s: f32,
    /// Seconds after which the nearest-unsent sweep restarts from the center.
    pub nearest_unsent_reset_s: f32,
    /// Pause applied after repeated sweeps that found nothing to do.
    pub nothing_to_send_pause_s: f32,
    /// A client that built more recently than this gets a shortened sweep.
    pub full_send_min_time_from_building_s: f32,
    /// Sweep distance cap used while a client is building.
    pub max_distance_while_building: i16,
    /// Seconds before a failed emerge may be requested again.
    pub emerge_retry_backoff_s: f32,
}

/// Serialization version negotiation bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Oldest serialization version the server can still write.
    pub min_serialization_version: u8,
    /// Newest serialization version the server can write.
    pub max_serialization_version: u8,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 30000,
            max_clients: 32,
            max_frame_size: 1_048_576,
            outbound_queue_frames: 64,
            peer_timeout_s: 30.0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            print_info_interval_s: 60.0,
            emerge_trigger_interval_s: 2.0,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_view_radius: 10,
            max_blocks_planned_per_client: 20,
            max_emerges_per_client: 4,
            max_sends_per_tick: 40,
            max_sends_per_client_per_tick: 4,
            bytes_per_client_per_tick: 65_536,
            block_send_timeout_s: 5.0,
            nearest_unsent_reset_s: 20.0,
            nothing_to_send_pause_s: 2.0,
            full_send_min_time_from_building_s: 2.0,
            max_distance_while_building: 2,
            emerge_retry_backoff_s: 5.0,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_serialization_version: 22,
            max_serialization_version: 25,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Resolve `bind_address:port` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

impl ServerConfig {
    /// Length of one tick in seconds.
    pub fn tick_seconds(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }
}

/// Platform config directory for the server, e.g. `~/.config/cairn`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cairn")
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
