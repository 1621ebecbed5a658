//! Command-line argument parsing for the cairn server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// cairn server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "cairn-server", about = "Authoritative voxel world server")]
pub struct CliArgs {
    /// Address to bind the listener to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum connected clients.
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Simulation ticks per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Maximum view radius in blocks.
    #[arg(long)]
    pub view_radius: Option<i16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.bind {
            self.network.bind_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_clients {
            self.network.max_clients = max;
        }
        if let Some(rate) = args.tick_rate {
            self.server.tick_rate = rate;
        }
        if let Some(radius) = args.view_radius {
            self.streaming.max_view_radius = radius;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
