//! `airmeter` – environmental sensor agent.
//!
//! Wires the pieces together and runs until stopped:
//!
//! 1. Loads `~/.airmeter/config.toml` (or `$AIRMETER_CONFIG`); every field
//!    has a default, so no file is required.
//! 2. Opens the configured sensor driver.
//! 3. Optionally starts an in-process bus broker and connects to the bus.
//! 4. Starts the coordination loop and the HTTP front end.
//! 5. Stops on Ctrl-C / SIGTERM or `POST /api/shutdown`.
//!
//! `airmeter init` writes the default configuration file and exits;
//! `airmeter --version` (or `-V`) prints the version and exits.
//!
//! Exit codes: `0` orderly stop, `1` fatal startup error, `2` configuration
//! error.

mod config;

use std::sync::Arc;

use airmeter_cockpit::CockpitServer;
use airmeter_middleware::{Broker, BusConnector, LocalConnector, SchemeConnector};
use airmeter_runtime::{Agent, LoopExit, init_tracing};
use colored::Colorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    // ── Structured logging ────────────────────────────────────────────────
    // Dropped at the end of run(), before process::exit, so spans flush.
    let _tracing = init_tracing("airmeter");

    let command = std::env::args().nth(1);
    if matches!(command.as_deref(), Some("--version" | "-V")) {
        println!("{}", version_line());
        return EXIT_OK;
    }

    print_banner();

    if command.as_deref() == Some("init") {
        return write_default_config();
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(cfg) => {
            println!(
                "  Config: {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            error!(error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return EXIT_FATAL;
        }
    };

    // ── Shutdown signal ───────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Shutdown signal received – stopping …".yellow().bold());
        on_signal.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop with POST /api/shutdown");
    }

    runtime.block_on(serve(cfg, shutdown))
}

async fn serve(cfg: Config, shutdown: CancellationToken) -> i32 {
    // ── Sensor ────────────────────────────────────────────────────────────
    let sensor = match airmeter_hal::open_sampler(&cfg.sensor_config()) {
        Ok(sensor) => {
            println!("  Sensor: {} on {}", cfg.sensor.driver.to_string().bold(), cfg.sensor.i2c_device.display());
            sensor
        }
        Err(e) => {
            println!("{}: {}", "Sensor error".red(), e);
            error!(error = %e, "failed to open sensor");
            return EXIT_FATAL;
        }
    };

    // ── Bus ───────────────────────────────────────────────────────────────
    // The agent reaches an embedded broker in-process; remote clients use
    // its WebSocket listener.  Otherwise the endpoint scheme picks MQTT
    // (tcp://, mqtt://) or WebSocket (ws://, wss://).
    let mut embedded: Option<(Broker, TcpListener)> = None;
    let connector: Box<dyn BusConnector> = if cfg.bus.embedded_broker {
        let broker = Broker::new();
        let listener = match bind(&cfg.bus.broker_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %cfg.bus.broker_addr, error = %e, "failed to bind broker");
                return EXIT_FATAL;
            }
        };
        println!("  Broker: {}", cfg.bus.broker_addr.bold());
        let connector = LocalConnector::new(broker.bus());
        embedded = Some((broker, listener));
        Box::new(connector)
    } else {
        Box::new(SchemeConnector)
    };

    if cfg.bus.enabled {
        println!(
            "  Bus:    {} → {}",
            config::redact_endpoint(&cfg.bus.endpoint).dimmed(),
            cfg.topic().bold()
        );
    } else {
        println!("  Bus:    {}", "disabled (readings are logged)".dimmed());
    }

    // ── Agent ─────────────────────────────────────────────────────────────
    let agent = match Agent::start(
        Arc::new(cfg.agent_config()),
        sensor,
        connector.as_ref(),
        shutdown.clone(),
    )
    .await
    {
        Ok(agent) => agent,
        Err(e) => {
            println!("{}: {}", "Startup failed".red(), e);
            error!(error = %e, "agent failed to start");
            return EXIT_FATAL;
        }
    };

    if let Some((broker, listener)) = embedded {
        agent.spawn(broker.serve(listener, shutdown.clone()));
    }

    // ── HTTP front end ────────────────────────────────────────────────────
    let mut code = EXIT_OK;
    if cfg.http.enabled {
        match bind(&cfg.http.addr).await {
            Ok(listener) => {
                println!("  HTTP:   http://{}", cfg.http.addr.bold());
                let server = CockpitServer::new(agent.commands(), shutdown.clone())
                    .with_read_timeout(cfg.read_timeout());
                agent.spawn(server.serve(listener));
            }
            Err(e) => {
                error!(addr = %cfg.http.addr, error = %e, "failed to bind http server");
                shutdown.cancel();
                code = EXIT_FATAL;
            }
        }
    }

    println!();
    println!("  {}", "Running. Press Ctrl-C to stop.".green());
    println!();

    let code = match agent.wait().await {
        Ok(exit) => {
            let how = match exit {
                LoopExit::ShutdownRequested => "shutdown requested",
                LoopExit::Cancelled => "stopped",
            };
            println!("  {} {}", "✓".green().bold(), how);
            code
        }
        Err(e) => {
            error!(error = %e, "agent stopped abnormally");
            EXIT_FATAL
        }
    };

    info!(code, "exiting");
    code
}

async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

fn write_default_config() -> i32 {
    let path = config::config_path();
    if path.exists() {
        println!("  {} already exists; leaving it alone.", path.display().to_string().bold());
        return EXIT_OK;
    }
    match config::save_to(&Config::default(), &path) {
        Ok(()) => {
            println!(
                "  {} Config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            EXIT_OK
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            EXIT_CONFIG
        }
    }
}

fn version_line() -> String {
    format!("airmeter {}", env!("CARGO_PKG_VERSION"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    _   _     __  __     _           "#.bold().cyan());
    println!("{}", r#"   /_\ (_)_ _|  \/  |___| |_ ___ _ _ "#.bold().cyan());
    println!("{}", r#"  / _ \| | '_| |\/| / -_)  _/ -_) '_|"#.bold().cyan());
    println!("{}", r#" /_/ \_\_|_| |_|  |_\___|\__\___|_|  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "AirMeter".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Temperature, humidity and pressure agent");
    println!();
}
