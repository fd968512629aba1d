use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use tokio::time;
use tracing::{error, info};

use vacbus::config::{default_config, SystemConfig};
use vacbus::gas::NullGas;
use vacbus::link::{DeviceLink, LinkSettings, TcpConnector};
use vacbus::procedure::OrchestratorSettings;
use vacbus::supervisor::Supervisor;

const STATUS_LOG_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("vacbusd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Headless supervisor for the sputter deposition vacuum system")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the system configuration document")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("board")
                .short("b")
                .long("board")
                .value_name("ADDR")
                .help("Override the board address from the config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match matches.value_of("config") {
        Some(path) => SystemConfig::load(Path::new(path))?,
        None => default_config()?,
    };
    if let Some(addr) = matches.value_of("board") {
        config.board.address = addr.to_string();
    }

    info!(
        board = %config.board.address,
        relays = config.relays.len(),
        rules = config.rules.len(),
        procedures = config.procedures.len(),
        "configuration loaded"
    );

    let connector = TcpConnector::new(&config.board.address);
    let link = DeviceLink::spawn(connector, &config, LinkSettings::default());
    let (supervisor, mut emergencies) = Supervisor::new(
        &config,
        link,
        Arc::new(NullGas),
        OrchestratorSettings::default(),
    );

    let mut status_tick = time::interval(Duration::from_secs(STATUS_LOG_INTERVAL_SECS));
    loop {
        tokio::select! {
            event = emergencies.recv() => match event {
                Some(event) => error!(message = %event.message, "EMERGENCY"),
                None => break,
            },
            _ = status_tick.tick() => {
                let report = supervisor.status_report();
                info!(
                    connected = report.connected,
                    state = %report.state,
                    mode = ?report.mode,
                    active = report.active_runs.len(),
                    "status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
