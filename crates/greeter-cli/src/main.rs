use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use greeter_core::RegistryCache;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "greeter", about = "Greeter kiosk station CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a verification session
    Verify,
    /// Cancel the running verification session
    Cancel,
    /// Show station status
    Status,
    /// Reload the identity registry
    Reload,
    /// List V4L2 capture devices (bypasses the daemon)
    Devices,
    /// List enrolled identities in a registry (bypasses the daemon)
    Identities {
        /// Registry file (.json or SQLite)
        #[arg(short, long)]
        registry: PathBuf,
    },
}

#[zbus::proxy(
    interface = "org.greeter.Station1",
    default_service = "org.greeter.Station1",
    default_path = "/org/greeter/Station1"
)]
trait Station {
    async fn verify(&self) -> zbus::Result<String>;
    async fn cancel(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
}

async fn station() -> Result<StationProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    StationProxy::new(&connection)
        .await
        .context("greeterd is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify => {
            let state = station().await?.verify().await?;
            println!("Verification session {state}");
        }
        Commands::Cancel => {
            if station().await?.cancel().await? {
                println!("Verification session cancelled");
            } else {
                println!("No verification session running");
            }
        }
        Commands::Status => {
            let raw = station().await?.status().await?;
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{raw}"),
            }
        }
        Commands::Reload => {
            let count = station().await?.reload().await?;
            println!("Registry reloaded: {count} identities");
        }
        Commands::Devices => {
            let devices = greeter_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for device in devices {
                println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
            }
        }
        Commands::Identities { registry } => {
            let store = greeter_core::open_registry(&registry)
                .with_context(|| format!("failed to open {}", registry.display()))?;
            let cache = RegistryCache::load(store.as_ref())?;
            if cache.is_empty() {
                println!("No identities enrolled");
            }
            for identity in cache.identities() {
                println!("{}\t{} signature(s)", identity.name, identity.signatures.len());
            }
        }
    }

    Ok(())
}
