//! cairn server binary.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p cairn-server -- --port 30001` to pick another port.

mod world;

use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cairn_config::{CliArgs, Config, default_config_dir};
use cairn_net::{TcpTransport, TransportConfig, WireCodec};
use cairn_sched::{
    PeerLifecycleQueue, ServerError, ServerLoop, ServerState, Transport, TransportError,
    WorldStorage,
};
use clap::Parser;
use tracing::{error, info, warn};

use crate::world::GeneratedWorld;

/// Seed for the generated terrain.
const WORLD_SEED: u32 = 0x00C4_A1F2;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    cairn_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), ServerError> {
    let transport_config = TransportConfig::from_network(&config.network).map_err(|e| {
        ServerError::Transport(TransportError::Bind(io::Error::new(
            io::ErrorKind::InvalidInput,
            e,
        )))
    })?;

    let lifecycle = PeerLifecycleQueue::new();
    let transport = Arc::new(TcpTransport::new(transport_config, lifecycle.sender()));
    let world = Arc::new(GeneratedWorld::new(WORLD_SEED));
    let tick = Duration::from_secs_f32(config.server.tick_seconds());

    let mut server = ServerLoop::new(
        config,
        lifecycle,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&world) as Arc<dyn WorldStorage>,
        Arc::new(WireCodec),
    );
    server.start()?;

    let shutdown = server.shutdown_handle();
    if let Err(e) = transport.on_interrupt(move || shutdown.request()) {
        warn!(error = %e, "Ctrl-C will not stop the server cleanly");
    }
    if let Some(addr) = transport.local_addr() {
        info!(%addr, "accepting connections, press Ctrl-C to stop");
    }

    let mut last = Instant::now();
    let mut next_tick = last + tick;
    while server.state() == ServerState::Running {
        let now = Instant::now();
        let dtime = now.duration_since(last).as_secs_f32();
        last = now;
        server.step(dtime)?;

        // Fixed cadence; an overrun tick starts the next one immediately.
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
            next_tick += tick;
        } else {
            next_tick = now + tick;
        }
    }

    info!(
        status = %server.status(),
        generated_blocks = world.cached_blocks(),
        "server exited"
    );
    Ok(())
}
