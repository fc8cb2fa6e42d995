mod cli;
mod config;
mod log_layer;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bc_core::{Broadcaster, BroadcastConfig, Multiplexer};
use bc_envelope::Message;
use bc_identity::{Identity, Protocol};
use bc_store::EvidenceStore;
use bc_transport::{IrohDriver, MqttDriver, NostrDriver, Transport, WakuDriver, XmtpDriver};
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let loaded = match config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let identity = Identity::generate();
    let magnet = identity.encode();
    tracing::info!(user = %cli.user, magnet = %magnet, "identity ready");

    if let Some(parent) = loaded.store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating store directory {}", parent.display()))?;
    }
    let store = Arc::new(
        EvidenceStore::open(&loaded.store_path)
            .with_context(|| format!("opening evidence store at {}", loaded.store_path.display()))?,
    );

    let active = active_protocols(&cli, &loaded.broadcast);
    let drivers = build_drivers(&active, &identity, &loaded.broadcast, &loaded.store_path);

    let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&store), drivers.clone()));

    let mux = Arc::new(Multiplexer::new(Arc::clone(&store), Arc::clone(&broadcaster), magnet.clone()));
    mux.on_message(|msg| {
        println!("[{}] {}: {}", msg.timestamp, msg.from_magnet_link, msg.content);
    });
    mux.on_receipt(|msg| {
        tracing::debug!(ack_of = ?msg.ack_of_uuid, from = %msg.from_magnet_link, "received acknowledgment");
    });
    wire_inbound(&drivers, &mux);

    broadcaster.initialize().await;

    if let Some(recipient) = &cli.chat {
        let payload = Message::new_text("hello from broadcast-dm", magnet.clone())?.serialize();
        match broadcaster.send(recipient, &payload).await {
            Ok(results) => {
                for r in &results {
                    println!(
                        "{:<8} {:<5} {:>6}ms  {}",
                        r.protocol.as_str(),
                        if r.success { "ok" } else { "fail" },
                        r.latency_ms,
                        r.detail
                    );
                }
                broadcaster.shutdown().await;
                return Ok(());
            }
            Err(e) => {
                eprintln!("send failed: {e}");
                broadcaster.shutdown().await;
                std::process::exit(1);
            }
        }
    }

    println!("listening as {magnet}");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    broadcaster.shutdown().await;
    Ok(())
}

/// `--protocols` overrides which drivers come up this run; with no override,
/// every protocol the loaded configuration enables is used.
fn active_protocols(cli: &Cli, cfg: &BroadcastConfig) -> Vec<Protocol> {
    if !cli.protocols.is_empty() {
        return cli.protocols.clone();
    }
    Protocol::ALL
        .iter()
        .copied()
        .filter(|p| match p {
            Protocol::Xmtp => cfg.xmtp_enabled,
            Protocol::Nostr => cfg.nostr_enabled,
            Protocol::Mqtt => cfg.mqtt_enabled,
            Protocol::Waku => cfg.waku_enabled,
            Protocol::Iroh => cfg.iroh_enabled,
        })
        .collect()
}

fn build_drivers(
    active: &[Protocol],
    identity: &Identity,
    cfg: &BroadcastConfig,
    store_path: &Path,
) -> Vec<(Protocol, Arc<dyn Transport>)> {
    let mut drivers: Vec<(Protocol, Arc<dyn Transport>)> = Vec::new();

    for protocol in active {
        let transport: Arc<dyn Transport> = match protocol {
            Protocol::Xmtp => {
                let inbox_path = store_path.with_file_name(format!("xmtp-{}.sqlite3", identity.eth_address()));
                Arc::new(XmtpDriver::new(
                    identity.eth_address(),
                    hex::encode(identity.secp256k1_secret().secret_bytes()),
                    inbox_path,
                ))
            }
            Protocol::Nostr => {
                Arc::new(NostrDriver::new(identity.secp256k1_secret().clone(), cfg.nostr_relays.clone()))
            }
            Protocol::Mqtt => Arc::new(MqttDriver::new(identity.public().pubsub_id(), cfg.mqtt_brokers.clone())),
            Protocol::Waku => Arc::new(WakuDriver::new(identity.public().pubsub_id(), Vec::new())),
            Protocol::Iroh => {
                let secret = iroh::SecretKey::from_bytes(&identity.ed25519_signing().to_bytes());
                Arc::new(IrohDriver::new(secret))
            }
        };
        drivers.push((*protocol, transport));
    }

    drivers
}

/// Feeds every driver's raw inbound payloads into the multiplexer's
/// dedup/evidence/dispatch/auto-ack pipeline. Without this, received
/// traffic never reaches `Multiplexer::handle_inbound` at all.
fn wire_inbound(drivers: &[(Protocol, Arc<dyn Transport>)], mux: &Arc<Multiplexer>) {
    for (protocol, transport) in drivers {
        let mux = Arc::clone(mux);
        let name = protocol.as_str();
        transport.on_inbound(Box::new(move |payload, server_tag| {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move {
                mux.handle_inbound(name, payload, server_tag).await;
            });
        }));
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (capture_layer, _log_rx) = log_layer::build_log_channel();

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(capture_layer)
        .with(filter)
        .try_init();
}
