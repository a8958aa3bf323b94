use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onewire_core::adapter::{AnyAdapter, Capability, PortAdapter, enumerate};
use onewire_core::config::BridgeConfig;
use onewire_core::net::{DiscoveryBeacon, ProxyServer, discover};
use onewire_core::transport::SerialPortLink;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "1-Wire bus bridge and network proxy", long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the devices on the local bus
    Scan {
        /// Only devices that answer an alarm search
        #[arg(long)]
        alarming: bool,
        /// Restrict to these family codes (hex)
        #[arg(long, value_parser = parse_family)]
        family: Vec<u8>,
    },
    /// Share the local adapter over TCP
    Serve {
        /// Override the configured listen address
        #[arg(long)]
        listen: Option<String>,
    },
    /// Talk to an adapter shared by another host
    Remote {
        /// Proxy address, host:port
        addr: String,
        /// Override the configured shared secret
        #[arg(long)]
        secret: Option<String>,
        #[command(subcommand)]
        command: RemoteCommands,
    },
    /// Find proxies on the local network
    Discover {
        /// How long to wait for replies
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// List serial ports
    Ports,
    /// Write a configuration file with every default filled in
    InitConfig { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum RemoteCommands {
    /// List the devices on the remote bus
    Scan,
    /// Show the remote adapter's capabilities
    Info,
}

fn parse_family(value: &str) -> Result<u8, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("bad family code {value:?}: {e}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    match args.command {
        Commands::Scan { alarming, family } => {
            let mut adapter = AnyAdapter::from_config(&config)?;
            scan(&mut adapter, alarming, &family)
        }
        Commands::Serve { listen } => serve(&config, listen),
        Commands::Remote {
            addr,
            secret,
            command,
        } => {
            let secret = secret.unwrap_or_else(|| config.proxy.secret.clone());
            let mut adapter = AnyAdapter::remote(addr.as_str(), &secret)
                .with_context(|| format!("connecting to {addr}"))?;
            match command {
                RemoteCommands::Scan => scan(&mut adapter, false, &[]),
                RemoteCommands::Info => describe(&mut adapter),
            }
        }
        Commands::Discover { timeout_ms } => {
            let target = SocketAddr::from((config.discovery.group, config.discovery.port));
            let found = discover(target, Duration::from_millis(timeout_ms))?;
            if found.is_empty() {
                info!("No proxies answered");
            }
            for proxy in found {
                println!("{proxy}");
            }
            Ok(())
        }
        Commands::Ports => {
            for port in SerialPortLink::available_ports()? {
                println!("{port}");
            }
            Ok(())
        }
        Commands::InitConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
            Ok(())
        }
    }
}

fn scan(adapter: &mut dyn PortAdapter, alarming: bool, families: &[u8]) -> Result<()> {
    if alarming {
        adapter.set_search_only_alarming()?;
    }
    if !families.is_empty() {
        adapter.target_families(families)?;
    }
    let devices = enumerate(adapter)?;
    info!(
        adapter = adapter.adapter_name(),
        port = adapter.port_name(),
        count = devices.len(),
        "Search complete"
    );
    for address in devices {
        println!("{address}  family 0x{:02X}", address.family());
    }
    Ok(())
}

fn describe(adapter: &mut dyn PortAdapter) -> Result<()> {
    println!("{} on {}", adapter.adapter_version()?, adapter.port_name());
    for capability in Capability::ALL {
        let supported = adapter.has_capability(capability)?;
        println!("  {capability:<20} {}", if supported { "yes" } else { "no" });
    }
    Ok(())
}

fn serve(config: &BridgeConfig, listen: Option<String>) -> Result<()> {
    let adapter = AnyAdapter::from_config(config)?;
    let listen = listen.unwrap_or_else(|| config.proxy.listen.clone());
    let server = ProxyServer::bind(listen.as_str(), Box::new(adapter), config.proxy.server_options())
        .with_context(|| format!("binding {listen}"))?;
    let handle = server.spawn()?;

    let _beacon = if config.discovery.enabled {
        match DiscoveryBeacon::start(
            config.discovery.group,
            config.discovery.port,
            handle.local_addr().port(),
        ) {
            Ok(beacon) => Some(beacon),
            Err(e) => {
                warn!(error = %e, "Discovery beacon not started");
                None
            }
        }
    } else {
        None
    };

    info!(addr = %handle.local_addr(), "Serving adapter");
    handle.wait();
    Ok(())
}
