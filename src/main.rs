//! hap-accessory - HomeKit accessory daemon.
//!
//! Serves pair-setup, pair-verify and pairing management over TCP and
//! advertises itself as `_hap._tcp`.

mod advertise;
mod handler;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use hap_core::AccessoryConfig;
use hap_pairing::{AccessoryIdentity, FilePairingStore, PairingContext, SetupSecret};
use hap_transport::{AccessoryServer, AccessoryServices, FileFirmwareSink};
use tracing::info;
use tracing_subscriber::EnvFilter;

use advertise::Advertisement;
use handler::AccessoryHandler;

/// Command-line arguments
#[derive(Default)]
struct Args {
    /// JSON config file
    config: Option<PathBuf>,
    /// Listen port override
    port: Option<u16>,
    /// Setup code override
    setup_code: Option<String>,
    /// Enable debug logging
    debug: bool,
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = iter.next() {
                    args.config = Some(PathBuf::from(path));
                }
            }
            "--port" | "-p" => match iter.next().map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => args.port = Some(port),
                _ => {
                    eprintln!("--port needs a number between 0 and 65535");
                    std::process::exit(1);
                }
            },
            "--setup-code" | "-s" => {
                args.setup_code = iter.next();
            }
            "--debug" | "-d" => {
                args.debug = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
    }

    args
}

fn print_help() {
    println!("hap-accessory - HomeKit accessory pairing server");
    println!();
    println!("Usage: hap-accessory [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH        Load settings from a JSON file");
    println!("  -p, --port N             Listen on port N (0 picks one)");
    println!("  -s, --setup-code CODE    Setup code in NNN-NN-NNN form");
    println!("  -d, --debug              Enable debug logging");
    println!("  -h, --help               Show this help message");
    println!();
    println!("RUST_LOG overrides the log filter, e.g. RUST_LOG=hap_transport=trace");
}

fn setup_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &Args) -> Result<AccessoryConfig> {
    let mut config = match &args.config {
        Some(path) => AccessoryConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AccessoryConfig::default(),
    };
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(code) = &args.setup_code {
        config = config.with_setup_code(code.clone());
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Terminal line with the setup code, shown only while no controller is
/// paired. The code is kept out of the log.
fn setup_banner(paired: bool, code: &str) -> Option<String> {
    (!paired).then(|| format!("Setup code: {}", code))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    setup_logging(args.debug);
    let config = load_config(&args)?;

    let identity =
        AccessoryIdentity::load_or_generate(&config.identity_file, config.device_id.as_deref())
            .context("loading accessory identity")?;
    let device_id = identity.device_id().to_string();
    let store = FilePairingStore::open(&config.pairing_file, config.max_pairings)
        .await
        .context("opening pairing store")?;

    let pairing = PairingContext::new(
        identity,
        SetupSecret::code(config.setup_code.clone()),
        Arc::new(store),
    );
    let handler = Arc::new(AccessoryHandler::new(&config, &device_id));
    let services = AccessoryServices::new(&config, pairing, handler)
        .await?
        .with_firmware_sink(Arc::new(FileFirmwareSink::new(config.firmware_file.clone())));
    let paired = services.subscribe_paired();
    let already_paired = *paired.borrow();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let mut server = AccessoryServer::start(addr, services)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let advertisement = Advertisement::new(&config, &device_id, server.port());
    let _advertiser = advertise::spawn(advertisement, paired).context("starting advertisement")?;

    info!(device_id = %device_id, port = server.port(), "Accessory ready");
    if let Some(banner) = setup_banner(already_paired, &config.setup_code) {
        println!("{}", banner);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;
    Ok(())
}
