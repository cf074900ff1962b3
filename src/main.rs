//! Binary entrypoint for the meshlink CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `run [--tcp <addr>] [--serial <path>] [--broker]` - start the radio and/or
//!   broker paths, log model events and send each stdin line as a broadcast
//!
//! See the library crate docs for module-level details: `meshlink::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use meshlink::broker::BrokerBridge;
use meshlink::client::MeshClient;
use meshlink::config::Config;
use meshlink::ingest::Ingestor;
use meshlink::logutil::{escape_log, truncate_for_log};
use meshlink::model::{MeshModel, ModelEvent};
use meshlink::protobuf::{new_packet_id, node_id_string};
use meshlink::radio::{
    ConnectionManager, DefaultTransportProvider, Destination, StreamDeviceFactory, TransportKind,
};
use meshlink::storage::{spawn_persister, JsonStore, MeshStore};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Resilient Meshtastic radio session manager with an MQTT broker bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Connect and stay running until Ctrl-C
    Run {
        /// Network-attached radio (host[:port], default port 4403)
        #[arg(long, conflicts_with = "serial")]
        tcp: Option<String>,
        /// Serial-attached radio (e.g. /dev/ttyUSB0)
        #[arg(long)]
        serial: Option<String>,
        /// Start the broker bridge even if `[broker] enabled = false`
        #[arg(long)]
        broker: bool,
        /// Channel index used for stdin broadcasts
        #[arg(long, default_value_t = 0)]
        channel: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!(
                    "{} already exists; remove it first to regenerate",
                    cli.config
                ));
            }
            Config::create_default(&cli.config).await?;
            info!("Wrote default configuration to {}", cli.config);
        }
        Commands::Run {
            tcp,
            serial,
            broker,
            channel,
        } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshlink v{}", env!("CARGO_PKG_VERSION"));
            run(config, tcp, serial, broker, channel).await?;
        }
    }

    Ok(())
}

async fn run(
    config: Config,
    tcp: Option<String>,
    serial: Option<String>,
    force_broker: bool,
    channel: u32,
) -> Result<()> {
    let store: Arc<dyn MeshStore> = Arc::new(JsonStore::new(&config.storage.data_dir).await?);
    let model = Arc::new(MeshModel::new());
    model.load(store.load_nodes().await?, store.load_messages().await?);
    info!(
        "Loaded {} nodes and {} messages from {}",
        model.nodes().len(),
        model.messages().len(),
        config.storage.data_dir
    );
    let (persist_tx, persister) = spawn_persister(store);
    let ingest = Ingestor::new(model.clone())
        .with_persistence(persist_tx)
        .with_retention(config.storage.retention());

    let provider = DefaultTransportProvider {
        baud_rate: Some(config.radio.baud_rate),
    };
    let radio = ConnectionManager::new(
        Arc::new(StreamDeviceFactory::new(provider)),
        ingest.clone(),
        config.radio.settings()?,
    );
    let bridge = BrokerBridge::new(ingest.clone());
    let client = MeshClient::new(radio, bridge, ingest);

    let events = tokio::spawn(log_model_events(client.clone()));
    let statuses = tokio::spawn(log_status_changes(client.clone()));

    let target = match (tcp, serial) {
        (Some(addr), _) => Some((TransportKind::Tcp, Some(addr))),
        (None, Some(path)) => Some((TransportKind::Serial, Some(path))),
        (None, None) => config
            .radio
            .transport
            .map(|kind| (kind, config.radio.address.clone())),
    };
    if let Some((kind, address)) = target {
        if let Err(e) = client.connect(kind, address.as_deref()).await {
            warn!("Radio connect over {} failed: {} (continuing without radio)", kind, e);
        }
    } else {
        info!("No radio transport configured; starting without radio");
    }

    if force_broker || config.broker.enabled {
        let settings = config.broker.settings(new_packet_id())?;
        info!(
            "Broker identity {} on channel {}",
            node_id_string(settings.local_node),
            settings.channel_name
        );
        client.connect_broker(settings).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match client.send_message(text, Destination::Broadcast, channel, false).await {
                        Ok(receipt) => info!("Sent message {} via {:?}", receipt.id, receipt.path),
                        Err(e) => warn!("Send failed: {}", e),
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    client.shutdown().await;
    events.abort();
    statuses.abort();
    // Dropping the last ingestors closes the persistence queue so it can drain.
    drop(client);
    match tokio::time::timeout(std::time::Duration::from_secs(5), persister).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("persistence task ended abnormally: {}", e),
        Err(_) => warn!("persistence queue did not drain within 5s"),
    }

    let m = meshlink::metrics::snapshot();
    info!(
        "metrics: radio_packets={} broker_packets={} radio_dups={} broker_dups={} radio_reconnects={} broker_reconnects={} decode_failures={} radio_sent={} broker_sent={} heartbeat_failures={}",
        m.radio_packets,
        m.broker_packets,
        m.radio_duplicates,
        m.broker_duplicates,
        m.radio_reconnect_attempts,
        m.broker_reconnect_attempts,
        m.decode_failures,
        m.radio_sent,
        m.broker_sent,
        m.heartbeat_failures
    );
    Ok(())
}

async fn log_model_events(client: MeshClient) {
    let mut events = client.subscribe();
    loop {
        match events.recv().await {
            Ok(ModelEvent::MessageAdded(msg)) => info!(
                "[{}] {}{}: {}",
                msg.channel,
                node_id_string(msg.from),
                if msg.via_broker { " (mqtt)" } else { "" },
                escape_log(&truncate_for_log(&msg.text, 200))
            ),
            Ok(ModelEvent::MessageStatusChanged { id, status }) => {
                info!("message {} is now {:?}", id, status)
            }
            Ok(ModelEvent::NodeUpdated(node)) => debug!(
                "node {} ({}) updated",
                node_id_string(node.num),
                escape_log(&node.display_name())
            ),
            Ok(ModelEvent::NodeRemoved(num)) => info!("node {} removed", node_id_string(num)),
            Ok(ModelEvent::ReactionAdded { reply_id, reaction }) => info!(
                "{} reacted to {}",
                node_id_string(reaction.from),
                reply_id
            ),
            Ok(ModelEvent::ChannelUpdated(ch)) => {
                info!("channel {} '{}' ({:?})", ch.index, escape_log(&ch.name), ch.role)
            }
            Ok(ModelEvent::TraceRoute { from, route }) => {
                let hops: Vec<String> = route.iter().map(|n| node_id_string(*n)).collect();
                info!("trace route from {}: {}", node_id_string(from), hops.join(" -> "))
            }
            Err(RecvError::Lagged(n)) => warn!("model event log lagged by {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_status_changes(client: MeshClient) {
    let mut radio = client.watch_radio();
    let mut broker = client.watch_broker();
    loop {
        tokio::select! {
            changed = radio.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = radio.borrow_and_update().clone();
                info!(
                    "radio: {:?} (attempt {}){}",
                    snap.status,
                    snap.reconnect_attempt,
                    snap.last_error.map(|e| format!(" last error: {}", e)).unwrap_or_default()
                );
            }
            changed = broker.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = broker.borrow_and_update().clone();
                info!(
                    "broker: {:?} (retry {}){}",
                    snap.status,
                    snap.retry_count,
                    snap.last_error.map(|e| format!(" last error: {}", e)).unwrap_or_default()
                );
            }
        }
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(file) = log_file {
        let file = std::sync::Mutex::new(file);
        // Mirror to the console only in the foreground
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
