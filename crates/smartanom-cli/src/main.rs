//! `smartanom-cli` – SmartAnom command line interface
//!
//! Entry point for the live telemetry stack:
//!
//! 1. `smartanom serve` opens the SQLite store, wires the broadcaster in as
//!    the store's post-commit hook and runs the gateway until **Ctrl-C**.
//! 2. `smartanom seed` fills the database with sample hydroponic devices,
//!    sensors and a week of readings.
//! 3. `smartanom init-config` writes `~/.smartanom/config.toml`.
//!
//! Settings come from the config file, then `SMARTANOM_*` environment
//! variables, then command-line flags, each overriding the previous.

mod config;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use smartanom_gateway::GatewayServer;
use smartanom_hub::Hub;
use smartanom_store::{SqliteStore, seed};
use smartanom_types::SmartanomError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// SmartAnom – real-time IoT telemetry fan-out server
#[derive(Parser, Debug)]
#[command(name = "smartanom")]
#[command(version)]
#[command(about = "Real-time IoT sensor telemetry over WebSocket", long_about = None)]
struct Cli {
    /// Config file (default: ~/.smartanom/config.toml)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP + WebSocket server
    Serve {
        /// Bind address
        #[arg(long = "host")]
        host: Option<String>,

        /// Listening port
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// SQLite database file
        #[arg(short = 'd', long = "database")]
        database: Option<PathBuf>,
    },
    /// Populate the database with sample data
    Seed {
        /// SQLite database file
        #[arg(short = 'd', long = "database")]
        database: Option<PathBuf>,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long = "force")]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Tracing first: the runtime is built afterwards, inside each command.
    let _guard = telemetry::init_tracing("smartanom");

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = match config::load_from(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Serve {
            host,
            port,
            database,
        } => {
            if let Some(host) = host {
                cfg.host = host;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(database) = database {
                cfg.database_path = database;
            }
            serve(cfg)
        }
        Command::Seed { database } => {
            if let Some(database) = database {
                cfg.database_path = database;
            }
            run_seed(&cfg)
        }
        Command::InitConfig { force } => init_config(&config_path, force),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "smartanom exited with an error");
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn serve(cfg: Config) -> Result<(), SmartanomError> {
    print_banner();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| SmartanomError::Transport(format!("failed to start runtime: {e}")))?;

    runtime.block_on(async move {
        let store = Arc::new(SqliteStore::open(&cfg.database_path)?);
        let hub = Hub::from_sqlite(Arc::clone(&store), cfg.hub_settings());
        info!(
            database = %cfg.database_path.display(),
            outbound_buffer = cfg.outbound_buffer,
            max_connections = cfg.max_connections,
            "store opened"
        );

        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    println!();
                    println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
                    on_signal.cancel();
                }
                Err(e) => {
                    warn!(error = %e, "failed to listen for Ctrl-C; graceful shutdown unavailable");
                }
            }
        });

        println!(
            "  Live telemetry on {}",
            format!("ws://{}:{}/ws/sensor-data/", cfg.host, cfg.port).bold()
        );
        println!(
            "  Test page at      {}\n",
            format!("http://{}:{}/websocket-test/", cfg.host, cfg.port).bold()
        );

        GatewayServer::new(hub, store)
            .with_host(cfg.host.clone())
            .with_port(cfg.port)
            .run(shutdown)
            .await?;

        println!("{}", "  ✓ All connections closed.".green());
        Ok::<(), SmartanomError>(())
    })
}

fn run_seed(cfg: &Config) -> Result<(), SmartanomError> {
    let store = SqliteStore::open(&cfg.database_path)?;
    let summary = seed::seed(&store, chrono::Utc::now())?;
    println!(
        "  {} Seeded {} device(s), {} sensor(s), {} reading(s) into {}",
        "✓".green().bold(),
        summary.devices,
        summary.sensors,
        summary.readings,
        cfg.database_path.display().to_string().bold()
    );
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), SmartanomError> {
    if path.exists() && !force {
        return Err(SmartanomError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config::save_to(&Config::default(), path).map_err(SmartanomError::Config)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().green());
    println!("{}", "  ║     SmartAnom · Live Telemetry       ║".bold().green());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().green());
    println!();
    println!(
        "  {} {}",
        "SmartAnom".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Live IoT sensor telemetry");
    println!();
}
