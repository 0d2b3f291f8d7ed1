//! ykacc Client
//!
//! Drives the accessory session stack against a simulated YubiKey.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;
use ykacc_client::{ClientConfig, ConnectionFacade, StaticCapabilities};
use ykacc_protocol::ApplicationKind;
use ykacc_transport::AccessoryRegistry;
use ykacc_transport::simulator::{SimulatedAccessory, SimulatedProvider};

/// ykacc - YubiKey application sessions over an accessory transport
#[derive(Parser, Debug)]
#[command(name = "ykacc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached accessories
    List {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Open a session to an application (piv, oath, management, otp)
    Select { app: ApplicationKind },

    /// Send a raw APDU (hex) within an application session
    Transmit {
        apdu: String,

        #[arg(long, default_value = "piv")]
        app: ApplicationKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path))?,
        None => ClientConfig::default(),
    };

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::from_str(&config.logging.level).unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("ykacc v{}", env!("CARGO_PKG_VERSION"));

    let sim = SimulatedProvider::new();
    sim.attach(SimulatedAccessory::yubikey(1));

    let registry = AccessoryRegistry::new(Arc::new(sim));
    let facade = ConnectionFacade::new(
        registry.clone(),
        Arc::new(StaticCapabilities::simulated()),
        config,
    );

    match args.command {
        Command::List { json } => {
            let accessories = registry.list_connected_accessories();
            if json {
                println!("{}", serde_json::to_string_pretty(&accessories)?);
            } else {
                for d in accessories {
                    let protocols: Vec<&str> =
                        d.protocol_strings.iter().map(String::as_str).collect();
                    println!(
                        "{}  {} {} (serial {}, firmware {}) [{}]",
                        d.connection_id,
                        d.manufacturer,
                        d.name,
                        d.serial_number,
                        d.firmware_revision,
                        protocols.join(", ")
                    );
                }
            }
        }
        Command::Select { app } => {
            let session = facade.request_application_session(app).await?;
            println!(
                "{} selected (SW {:04X})",
                app,
                session.select_response().sw()
            );
        }
        Command::Transmit { apdu, app } => {
            let command = hex::decode(apdu.replace([' ', ':'], ""))
                .with_context(|| format!("invalid hex APDU: {}", apdu))?;
            let session = facade.request_application_session(app).await?;
            let response = session.transmit(&command).await?;
            println!("{}", hex::encode_upper(response));
        }
    }

    facade.release_session().await;
    Ok(())
}
