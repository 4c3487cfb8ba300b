//! edgeshare - one keyboard and mouse across networked machines
//!
//! A controller owns the physical input devices. Pushing the cursor through
//! a screen edge hands input to the node laid out beyond that edge; pushing
//! back through the node's facing edge returns it.

mod config;
mod discovery;
mod input;
mod network;
mod protocol;
mod registry;
mod router;
mod screen;
mod session;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use discovery::{Announcement, Discovery, DiscoveryEvent, Role, Sighting};
use input::{select_backends, InputEvent};
use session::{Controller, NodeService};

/// edgeshare - share one keyboard and mouse across machines
#[derive(Parser)]
#[command(name = "edgeshare")]
#[command(author = "edgeshare Contributors")]
#[command(version)]
#[command(about = "Share one keyboard and mouse across networked machines", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as controller (the machine with the keyboard and mouse)
    Controller {
        /// Override the display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run as node (receives input from a controller)
    Node {
        /// Port to accept links on
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Listen for announcements and list what answers
    Discover {
        /// How long to scan (seconds)
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },

    /// Show system information
    Info,
}

fn init_logging(verbose: bool) {
    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    init_logging(cli.verbose || config.general.verbose);

    match cli.command {
        Commands::Controller { name } => {
            if let Some(name) = name {
                config.general.name = name;
            }
            run_controller(config, cli.config.as_deref()).await?;
        }
        Commands::Node { port, name } => {
            if let Some(port) = port {
                config.network.link_port = port;
            }
            if let Some(name) = name {
                config.general.name = name;
            }
            run_node(config, cli.config.as_deref()).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Discover { timeout } => {
            run_discovery(config, timeout).await?;
        }
        Commands::Info => {
            print_system_info(&mut config);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

/// Feed JSON-encoded input events from stdin, one per line
fn spawn_stdin_feed(feed: mpsc::Sender<InputEvent>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<InputEvent>(&line) {
                    Ok(event) => {
                        if feed.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring stdin line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin read failed: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("stdin feed ended");
    });
}

/// Generate a node id when none is configured, keeping it in the config
/// file when one was given
fn ensure_identity(config: &mut Config, path: Option<&Path>) {
    if config.general.node_id.is_some() {
        return;
    }
    let id = config.ensure_node_id().to_string();
    match path {
        Some(path) => match config.save(path) {
            Ok(()) => tracing::info!("Generated node id {} and saved it to {}", id, path.display()),
            Err(e) => tracing::warn!("Generated node id {} but could not save it: {}", id, e),
        },
        None => tracing::warn!(
            "No general.node_id configured; using {} for this run. Set it to keep the id stable.",
            id
        ),
    }
}

/// Run the controller
async fn run_controller(mut config: Config, path: Option<&Path>) -> anyhow::Result<()> {
    config.validate()?;
    ensure_identity(&mut config, path);
    let (capture, injector, feed) = select_backends(config.input.backend);
    if let Some(feed) = feed {
        spawn_stdin_feed(feed);
    }

    let controller = Controller::new(&mut config, capture, injector)?;
    let screen = config.screen_rect();

    println!("\n========================================");
    println!("  edgeshare controller");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Screen: {}x{}", screen.width, screen.height);
    for (edge, node) in controller.registry().layout() {
        println!("  {:>6}: {}", edge.to_string(), node);
    }
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let mut status = controller.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            tracing::info!(owner = %current.owner, linked = ?current.linked, "status");
        }
    });

    controller.run(shutdown_signal()).await?;
    Ok(())
}

/// Run a node
async fn run_node(mut config: Config, path: Option<&Path>) -> anyhow::Result<()> {
    config.validate()?;
    ensure_identity(&mut config, path);
    let (_capture, injector, _feed) = select_backends(config.input.backend);
    let node = NodeService::bind(&mut config, injector).await?;
    let screen = config.screen_rect();

    println!("\n========================================");
    println!("  edgeshare node");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Id: {}", config.ensure_node_id());
    println!("  Listening: {}", node.local_addr());
    println!("  Screen: {}x{}", screen.width, screen.height);
    println!("========================================");
    println!("\nWaiting for a controller. Press Ctrl+C to stop.\n");

    node.run(shutdown_signal()).await?;
    Ok(())
}

/// Listen for announcements for a while and print what was seen
async fn run_discovery(mut config: Config, timeout_secs: u64) -> anyhow::Result<()> {
    let local = config.local_screen();
    let announcement = Announcement::new(&local, Role::Controller, config.network.link_port);
    let mut discovery = Discovery::new(config.discovery_config()?, announcement);
    let (tx, mut rx) = mpsc::channel(64);

    println!("Scanning for edgeshare instances ({} seconds)...\n", timeout_secs);
    discovery.start(tx);

    let mut seen: BTreeMap<String, Sighting> = BTreeMap::new();
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = rx.recv() => match event {
                DiscoveryEvent::Sighting(sighting) => {
                    seen.insert(sighting.announcement.node_id.clone(), sighting);
                }
                DiscoveryEvent::Inactive(e) => println!("Discovery unavailable: {}", e),
            },
            _ = &mut deadline => break,
        }
    }
    discovery.stop().await;

    if seen.is_empty() {
        println!("No instances found.");
        return Ok(());
    }
    println!("{:<38} {:<20} {:<10} {:<22} {}", "ID", "NAME", "ROLE", "LINK", "SCREEN");
    for sighting in seen.values() {
        let a = &sighting.announcement;
        let compat = if a.is_compatible() { "" } else { " (incompatible)" };
        println!(
            "{:<38} {:<20} {:<10} {:<22} {}x{}{}",
            a.node_id,
            a.name,
            a.role.to_string(),
            sighting.link_addr().to_string(),
            a.width,
            a.height,
            compat
        );
    }
    Ok(())
}

/// Print system information
fn print_system_info(config: &mut Config) {
    let screen = config.screen_rect();

    println!("edgeshare System Information");
    println!("============================\n");

    println!("Platform: {}", input::platform_name());
    println!("Node id: {}", config.ensure_node_id());
    println!("Name: {}", config.general.name);
    println!("Screen: {}x{}", screen.width, screen.height);
    println!("Input backend: {:?}", config.input.backend);

    println!("\nProtocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Link Port: {}", config.network.link_port);
    println!("Discovery Port: {}", config.network.discovery_port);
    if let Err(e) = config.validate() {
        println!("\nConfiguration problem: {}", e);
    }
}
