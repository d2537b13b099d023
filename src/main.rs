//! blocka-engine CLI
//!
//! Key utilities, an in-memory self test, and a UDP packet loop for a
//! single peer driven from a WireGuard-style configuration file.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use blocka_engine::crypto::{generate_keypair, validate_key_string};
use blocka_engine::driver::{self, PeerDriver};
use blocka_engine::error::NetworkError;
use blocka_engine::{Action, EngineConfig, EngineError, SecretKey, Tunn, TunnelConfig};

/// WireGuard-compatible tunnel engine
#[derive(Parser, Debug)]
#[command(name = "blocka-engine")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a new base64 private key
    Genkey,

    /// Print the public key for a base64 private key
    Pubkey {
        /// Base64 private key
        key: String,
    },

    /// Check that a string is a base64 encoded 32-byte key
    CheckKey { key: String },

    /// Run a handshake and data exchange between two in-memory tunnels
    Selftest {
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Handshake once with the configured peer and report the RTT
    Probe {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run the packet loop until Ctrl+C, logging delivered packets
    Listen {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<EngineError>() {
            Some(engine) => {
                eprintln!("Error: {}", engine.user_message());
                ExitCode::from(engine.exit_code() as u8)
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Genkey => {
            let (secret, _) = generate_keypair();
            println!("{}", secret.to_base64());
        }
        Command::Pubkey { key } => {
            let secret = SecretKey::from_base64(&key).map_err(EngineError::from)?;
            println!("{}", secret.public_key());
        }
        Command::CheckKey { key } => {
            if !validate_key_string(&key) {
                bail!("not a base64 encoded 32-byte key");
            }
            println!("ok");
        }
        Command::Selftest { json } => selftest(json)?,
        Command::Probe { config } => probe(config).await?,
        Command::Listen { config } => listen(config).await?,
    }
    Ok(())
}

fn load(path: &PathBuf) -> Result<EngineConfig, EngineError> {
    tracing::info!("Loading configuration from: {}", path.display());
    Ok(EngineConfig::from_file(path)?)
}

async fn bind(port: Option<u16>) -> Result<UdpSocket, EngineError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port.unwrap_or(0)));
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| NetworkError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    Ok(socket)
}

fn selftest(json: bool) -> anyhow::Result<()> {
    let config = TunnelConfig::default();
    let (a_secret, a_public) = generate_keypair();
    let (b_secret, b_public) = generate_keypair();
    let mut a = Tunn::new(a_secret, b_public, config.clone()).map_err(EngineError::from)?;
    let mut b = Tunn::new(b_secret, a_public, config).map_err(EngineError::from)?;

    let mut buf = [0u8; 2048];
    let mut out = [0u8; 2048];

    let Action::WriteToNetwork(n) = a.force_handshake(&mut buf) else {
        bail!("initiator produced no handshake initiation");
    };
    let Action::WriteToNetwork(m) = b.on_inbound_datagram(&buf[..n], &mut out) else {
        bail!("responder did not answer the initiation");
    };
    if a.on_inbound_datagram(&out[..m], &mut buf) != Action::Done {
        bail!("initiator rejected the handshake response");
    }

    let mut packet = [0u8; 20];
    packet[0] = 0x45;
    packet[3] = 20;
    let Action::WriteToNetwork(n) = a.on_outbound_packet(&packet, &mut buf) else {
        bail!("initiator did not encrypt the test packet");
    };
    match b.on_inbound_datagram(&buf[..n], &mut out) {
        Action::WriteToTunnelV4(len) if out[..len] == packet => {}
        other => bail!("test packet did not round-trip: {:?}", other),
    }

    if json {
        let report = serde_json::json!({
            "ok": true,
            "initiator": a.stats(),
            "responder": b.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Handshake: ok");
        println!("Data round trip: ok ({} bytes)", packet.len());
        println!("Initiator: {:?}", a.stats());
        println!("Responder: {:?}", b.stats());
    }
    Ok(())
}

async fn probe(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    let endpoint = config
        .peer
        .endpoint
        .ok_or(EngineError::Network(NetworkError::NoEndpoint))?;

    let mut tunnel = Tunn::from_config(&config).map_err(EngineError::from)?;
    let socket = bind(config.interface.listen_port).await?;
    let timeout = tunnel.config().rekey_timeout;

    let rtt = driver::probe(&mut tunnel, &socket, endpoint, timeout).await?;
    println!("Handshake with {} completed in {:?}", endpoint, rtt);
    tunnel.destroy();
    Ok(())
}

async fn listen(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    let tunnel = Tunn::from_config(&config).map_err(EngineError::from)?;
    let socket = bind(config.interface.listen_port).await?;
    tracing::info!(
        "Listening on {} as {}",
        socket.local_addr().context("socket has no local address")?,
        config.public_key()
    );

    let (delivered_tx, mut delivered_rx) = mpsc::channel::<Vec<u8>>(256);
    // Nothing feeds the outbound side here; keep the sender alive for the
    // lifetime of the loop.
    let (_outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(256);

    let driver = PeerDriver::new(tunnel, socket, config.peer.endpoint, delivered_tx);

    let logger = tokio::spawn(async move {
        while let Some(packet) = delivered_rx.recv().await {
            tracing::info!("Delivered {} byte packet", packet.len());
        }
    });

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, shutting down...");
    };

    let tunnel = driver.run(outbound_rx, shutdown).await?;
    let stats = tunnel.stats();
    tunnel.destroy();
    logger.abort();

    tracing::info!(
        "Sent {} packets ({} bytes), received {} packets ({} bytes)",
        stats.tx_packets,
        stats.tx_bytes,
        stats.rx_packets,
        stats.rx_bytes
    );
    Ok(())
}
