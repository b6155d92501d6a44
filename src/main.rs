//! Sockbridge - Socket-over-Tunnel Bridge
//!
//! Runs the tunnel-terminating relay that bridges sandboxed database
//! clients to real TCP/TLS sockets, and offers DNS seed-list lookups over
//! DNS-over-HTTPS for debugging.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use sockbridge::{DohConfig, HeaderDecoder, Relay, RelayConfig, Resolver};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "sockbridge")]
#[command(author = "Sina Rabbani")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Socket-over-tunnel bridge for sandboxed database clients", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel-terminating relay
    Relay {
        /// Tunnel listen address
        #[arg(short, long, default_value = "0.0.0.0:1337")]
        bind: SocketAddr,

        /// Client certificate (PEM) for outbound TLS; forces TLS for all
        /// sessions
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Private key (PEM) for --cert; defaults to the cert file
        #[arg(long)]
        key: Option<PathBuf>,

        /// Additional CA certificates (PEM) to trust
        #[arg(long)]
        extra_ca: Option<PathBuf>,
    },

    /// Resolve SRV or TXT records over DNS-over-HTTPS
    Resolve {
        /// Hostname to look up
        hostname: String,

        /// Record type (srv, txt)
        #[arg(short, long, default_value = "srv")]
        record: String,

        /// DNS-over-HTTPS endpoint
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Relay {
            bind,
            cert,
            key,
            extra_ca,
        } => {
            run_relay(cli.config, bind, cert, key, extra_ca).await?;
        }
        Commands::Resolve {
            hostname,
            record,
            endpoint,
        } => {
            run_resolve(&hostname, &record, endpoint).await?;
        }
    }

    Ok(())
}

async fn run_relay(
    config_path: Option<PathBuf>,
    bind: SocketAddr,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    extra_ca: Option<PathBuf>,
) -> Result<()> {
    let mut config = if let Some(path) = config_path {
        RelayConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?
    } else {
        RelayConfig::default()
    };

    // CLI flags override the config file
    config.listen = bind;
    if cert.is_some() {
        config.cert = cert;
    }
    if key.is_some() {
        config.key = key;
    }
    if extra_ca.is_some() {
        config.extra_ca = extra_ca;
    }

    let relay = Relay::new(config, Arc::new(HeaderDecoder))
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let listener = relay.bind().await.map_err(|e| anyhow::anyhow!("{}", e))?;

    info!("sockbridge relay ready");
    listener.run().await.map_err(|e| anyhow::anyhow!("{}", e))
}

async fn run_resolve(hostname: &str, record: &str, endpoint: Option<String>) -> Result<()> {
    let mut doh = DohConfig::default();
    if let Some(endpoint) = endpoint {
        doh.endpoint = endpoint;
    }

    let resolver = Resolver::new(&doh).map_err(|e| anyhow::anyhow!("{}", e))?;

    match record {
        "srv" => {
            let records = resolver
                .resolve_srv(hostname)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            for record in records {
                println!(
                    "{} {} priority={} weight={}",
                    record.name, record.port, record.priority, record.weight
                );
            }
        }
        "txt" => {
            let records = resolver
                .resolve_txt(hostname)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            for entry in records {
                println!("{}", entry.join(" "));
            }
        }
        _ => anyhow::bail!("Unknown record type: {}", record),
    }

    Ok(())
}
