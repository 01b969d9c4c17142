//! SkyMesh repeater daemon.
//!
//! Loads configuration and identity, brings up the development UDP radio,
//! and drives the repeater's cooperative loop. Stdin doubles as the serial
//! REPL: each completed line goes to the same command parser as CLI text
//! over radio, with no sender timestamp (so `clock sync` is refused).

use clap::Parser;
use skymesh::radio::udp::{UdpRadio, DEFAULT_CHANNEL_PORT};
use skymesh::radio::{Board, Radio, SystemMillis, SystemRtc};
use skymesh::{Config, IdentityStore, Mesh, Repeater};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// SkyMesh store-and-forward repeater
#[derive(Parser, Debug)]
#[command(name = "skymeshd", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP channel port for the development radio
    #[arg(long, value_name = "PORT", default_value_t = DEFAULT_CHANNEL_PORT)]
    port: u16,
}

/// Host-process stand-in for an embedded board.
struct HostBoard;

impl Board for HostBoard {
    fn batt_milli_volts(&self) -> u16 {
        0 // no battery on a host process
    }

    fn reboot(&mut self) {
        info!("Reboot requested, exiting");
        std::process::exit(0);
    }
}

fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load_file(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded config file");
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    let store = IdentityStore::new(&config.node.identity_dir);
    let identity = match store.load_or_create("_main") {
        Ok(identity) => identity,
        Err(e) => {
            error!("Failed to load identity: {}", e);
            std::process::exit(1);
        }
    };
    info!("Repeater ID: {}", identity.peer());

    let mut radio = UdpRadio::with_port(args.port);
    if let Err(e) = radio.begin(&config.radio) {
        error!("Radio init failed: {}", e);
        std::process::exit(1);
    }

    let mesh = Mesh::new(
        identity,
        Box::new(radio),
        Box::new(SystemMillis::new()),
        Box::new(SystemRtc::new()),
        &config,
    );
    let mut repeater = Repeater::new(mesh, Box::new(HostBoard), &config);

    // initial advertisement to the mesh, slightly delayed
    if let Err(e) = repeater.send_self_advert(800) {
        error!("Failed to send initial advert: {}", e);
    }

    // serial REPL: a helper thread feeds completed lines to the main loop
    let (line_tx, line_rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    info!(name = %config.node.name, "Repeater up");
    loop {
        let deadline = repeater.poll();

        while let Ok(line) = line_rx.try_recv() {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            let reply = repeater.handle_serial_line(line);
            if !reply.is_empty() {
                println!("  -> {reply}");
            }
        }

        // idle until the next engine deadline, but keep polling the radio
        let now = repeater.mesh().millis();
        let sleep_ms = deadline
            .map(|d| d.saturating_sub(now))
            .unwrap_or(50)
            .clamp(1, 50);
        std::thread::sleep(Duration::from_millis(sleep_ms));
    }
}
