use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use causeway::{LocalBus, LocalPort, MemStore, OverlayServer};

/// A bootstrap peer given as `IP:PORT/HEXPUBKEY`.
#[derive(Clone, Debug)]
struct Beacon {
    addr: SocketAddr,
    sign_pub: VerifyingKey,
}

impl FromStr for Beacon {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, key_part) = s
            .rsplit_once('/')
            .context("beacon must include a public key (format: IP:PORT/HEXKEY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        let key_bytes = hex::decode(key_part).context("invalid hex public key")?;
        let key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("public key must be 64 hex characters (32 bytes)"))?;
        let sign_pub = VerifyingKey::from_bytes(&key).context("invalid Ed25519 public key")?;

        Ok(Beacon { addr, sign_pub })
    }
}

#[derive(Parser, Debug)]
#[command(name = "causeway")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Bus port the overlay attaches under.
    #[arg(short = 'p', long, default_value = "1")]
    bus_port: u32,

    /// Bootstrap beacons to add at startup.
    #[arg(short = 'B', long = "beacon", value_name = "PEER")]
    beacons: Vec<Beacon>,

    /// Keep the identity key across restarts.
    #[arg(long)]
    static_key: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let bus = Arc::new(LocalBus::new());
    let store = Arc::new(MemStore::new());
    let server = OverlayServer::bind(
        &args.bind.to_string(),
        bus,
        LocalPort(args.bus_port),
        store,
    )
    .await?;

    // Bootstrap identity key material before announcing anything.
    server
        .set_static_key(args.static_key)
        .context("storing static key flag failed")?;
    server.set_key().await.context("identity key setup failed")?;

    info!(
        "causeway {} listening on {}",
        server.identity().await,
        server.local_addr()
    );

    for beacon in &args.beacons {
        info!(addr = %beacon.addr, "adding beacon");
        server.add_beacon(beacon.sign_pub, beacon.addr).await;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting");
        }
        _ = server.wait_shutdown() => {
            info!("terminate command received over the bus, exiting");
        }
    }
    Ok(())
}
