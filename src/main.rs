use clap::Parser;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meshbridge::config::{self, Config};
use meshbridge::crypto::{parse_key, public_key_from_private};
use meshbridge::events::ConnectionState;
use meshbridge::network::{MqttTransport, MulticastTransport};
use meshbridge::shutdown::ShutdownManager;
use meshbridge::{AppError, MeshClient, MeshEvent, NodeId};

#[derive(Parser, Debug)]
#[command(name = "meshbridge")]
#[command(about = "Mesh radio chat bridge", long_about = None)]
struct Args {
    /// Config file (defaults to ~/.meshbridge/meshbridge.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Write a default config file and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);

    if args.generate_config {
        match Config::default().save_to_file(&config_path) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", config_path.display());
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&config_path) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", config_path.display());
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");
    tracing::info!("🚀 meshbridge v{} ({}, built {})", version, git_hash, build_date);

    if let Err(e) = run(config).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let node_id = config.node_id()?;
    let client = MeshClient::with_config(config.client_config()?);
    let mut shutdown_manager = ShutdownManager::new();

    let private_key = config
        .node
        .private_key
        .clone()
        .filter(|k| !k.is_empty());
    let own_public_key = match (&config.node.public_key, &private_key) {
        (Some(public), _) if !public.is_empty() => Some(parse_key(public)?),
        (_, Some(private)) => Some(
            public_key_from_private(&parse_key(private)?)
                .map_err(meshbridge::MeshError::from)?
                .to_vec(),
        ),
        _ => None,
    };
    if own_public_key.is_none() {
        tracing::warn!("⚠️  No private key configured, direct messages are disabled");
    }

    // Keys learned from NodeInfo broadcasts
    let public_keys: Arc<DashMap<NodeId, String>> = Arc::new(DashMap::new());
    {
        let public_keys = public_keys.clone();
        client.set_public_key_handler(Arc::new(move |node: NodeId| {
            public_keys.get(&node).map(|k| k.value().clone())
        }));
        client.set_private_key_handler(Arc::new(move |node: NodeId| {
            (node == node_id).then(|| private_key.clone()).flatten()
        }));
    }

    let announced = Arc::new(AtomicBool::new(false));
    {
        let announcer = client.clone();
        let public_keys = public_keys.clone();
        let long_name = config.node.long_name.clone();
        let short_name = config.node.short_name.clone();
        client.add_event_handler(Arc::new(move |event: &MeshEvent| {
            match serde_json::to_string(event) {
                Ok(json) => tracing::info!(target: "meshbridge::events", "{}", json),
                Err(e) => tracing::warn!("⚠️  Failed to serialize {} event: {}", event.kind(), e),
            }

            match event {
                MeshEvent::NodeInfo(info) => {
                    if let Some(key) = &info.public_key {
                        public_keys.insert(info.envelope.from, key.clone());
                    }
                }
                MeshEvent::ConnectionState(ConnectionState::Connected { .. }) => {
                    if announced.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    let client = announcer.clone();
                    let long_name = long_name.clone();
                    let short_name = short_name.clone();
                    let public_key = own_public_key.clone();
                    tokio::spawn(async move {
                        let result = client
                            .send_node_info(
                                client.node_id(),
                                NodeId::BROADCAST,
                                &long_name,
                                &short_name,
                                false,
                                public_key.as_deref(),
                            )
                            .await;
                        match result {
                            Ok(_) => tracing::info!("📻 Announced node info for {}", client.node_id()),
                            Err(e) => tracing::warn!("⚠️  Failed to announce node info: {}", e),
                        }
                    });
                }
                _ => {}
            }
        }));
    }

    if config.mqtt.enabled {
        tracing::info!(
            "📡 MQTT transport: {}:{} ({})",
            config.mqtt.host,
            config.mqtt.port,
            config.mqtt.root_topic
        );
        client.add_transport(Arc::new(MqttTransport::new(config.mqtt_config()?)));
    }
    if config.multicast.enabled {
        let group: Ipv4Addr = config.multicast.group.parse().map_err(|_| {
            AppError::Config(format!("invalid multicast group '{}'", config.multicast.group))
        })?;
        let interface = match &config.multicast.interface {
            Some(addr) => addr
                .parse()
                .map_err(|_| AppError::Config(format!("invalid multicast interface '{}'", addr)))?,
            None => Ipv4Addr::UNSPECIFIED,
        };
        tracing::info!("📡 Multicast transport: {}:{}", group, config.multicast.port);
        client.add_transport(Arc::new(MulticastTransport::with_interface(
            group,
            config.multicast.port,
            interface,
        )));
    }

    for channel in config.channel_defs()? {
        client.add_channel_def(channel).await?;
    }
    client.set_primary_channel(config.primary_channel_def()?).await?;

    client.connect().await?;
    tracing::info!("✅ Bridge {} running", node_id);

    shutdown_manager.register_task(spawn_neighbor_broadcast(client.clone(), shutdown_manager.token()));
    shutdown_manager.wait_for_shutdown(&client).await;
    Ok(())
}

/// Periodically advertise the bridge's (empty) neighbor list
fn spawn_neighbor_broadcast(
    client: MeshClient,
    token: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = client.neighbor_broadcast_interval();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = client
                .send_neighbor_info(client.node_id(), &[], interval.as_secs() as u32)
                .await
            {
                tracing::debug!("Neighbor info broadcast failed: {}", e);
            }
        }
    })
}

fn setup_logging(
    config: &config::LoggingConfig,
    verbose: bool,
) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let (writer, guard) = if config.output == "file" {
        let path = Path::new(&config.file_path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "meshbridge.log".to_string());
        let appender = tracing_appender::rolling::daily(dir, file_name);
        tracing_appender::non_blocking(appender)
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(config.output != "file")
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
    guard
}

// UTC time followed by the short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
