//! Collaboration hub server binary.
//!
//! Binds the listen port, registers the built-in protocol plugins, and
//! drives the fan-out tick until SIGINT asks for a clean shutdown.

mod config;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};

use conclave_media::{AudioServer, VideoServer};
use conclave_net::{Server, ServerConfig};
use conclave_plugins::{DevicesServer, SketchServer};

use config::HubConfig;

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .expect("failed to initialize logger");
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("conclave.toml"));
    let mut config = HubConfig::load_or_default(&config_path)
        .map_err(|err| format!("cannot load configuration: {}", err))?;

    if let Some(port) = args
        .iter()
        .position(|a| a == "--port")
        .and_then(|i| args.get(i + 1))
        .and_then(|p| p.parse().ok())
    {
        config.collaboration.server_port_id = port;
    }

    let server_config = ServerConfig {
        listen_addr: format!("0.0.0.0:{}", config.collaboration.server_port_id),
    };
    let mut server =
        Server::bind(&server_config).map_err(|err| format!("cannot bind listen socket: {}", err))?;

    server.register_plugin(Box::new(DevicesServer::new()));
    server.register_plugin(Box::new(SketchServer::new()));
    server.register_plugin(Box::new(AudioServer::new()));
    server.register_plugin(Box::new(VideoServer::new()));
    server.start();

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| format!("cannot install signal handler: {}", err))?;

    let tick = Duration::from_secs_f64(config.collaboration.tick_time.max(0.001));
    info!(
        "hub running on port {} (tick {:?})",
        config.collaboration.server_port_id, tick
    );

    while running.load(Ordering::SeqCst) {
        server.update();
        std::thread::sleep(tick);
    }

    info!("interrupted, disconnecting clients");
    server.shutdown();
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        error!("{}", err);
        eprintln!("conclave-hub: {}", err);
        process::exit(1);
    }
}
