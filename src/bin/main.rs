use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{filter::Directive, fmt::format::FmtSpan, EnvFilter};

use raftlink::config::{ConfigError, LogFormat, RaftlinkConfig};
use raftlink::RaftlinkNode;

#[derive(Parser)]
#[command(name = "raftlink-node")]
#[command(about = "A replicated key-value node with leader-only writes")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Node address, scheme://host:port (overrides config file)
    #[arg(long)]
    pub address: Option<String>,

    /// Peer addresses to join at startup, comma separated (overrides config file)
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<String>>,

    /// Storage directory (overrides config file)
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Generate default configuration file and exit
    #[arg(long)]
    pub generate_config: Option<PathBuf>,

    /// Validate configuration file and exit
    #[arg(long)]
    pub validate_config: bool,

    /// List default configuration file locations
    #[arg(long)]
    pub list_config_paths: bool,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    // Handle utility commands first
    if let Some(config_path) = args.generate_config {
        return generate_default_config(config_path);
    }

    if args.list_config_paths {
        return list_config_paths();
    }

    let config = load_configuration(&args).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Configuration error: {}", e),
        )
    })?;

    if args.validate_config {
        println!("✅ Configuration is valid");
        println!("📍 Node address: {}", config.node.address);
        println!("👥 Peers: {}", config.cluster.peers.join(", "));
        println!("🚪 Gateway port offset: {}", config.gateway.port_offset);
        println!("💾 Storage path: {}", config.storage.path.display());
        println!("📊 Log Level: {}", config.logging.level);
        return Ok(());
    }

    setup_logging(&config)?;

    tracing::info!(
        "🚀 Starting raftlink node {}",
        config.node.name.as_deref().unwrap_or(&config.node.address)
    );
    tracing::info!(
        "📁 Configuration loaded from: {}",
        args.config
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string())
    );
    tracing::info!("🏷️  Cluster: {}", config.cluster.name);
    for peer in &config.cluster.peers {
        tracing::info!("   Peer: {}", peer);
    }

    let node = RaftlinkNode::start(config).await.map_err(|e| {
        tracing::error!("❌ Failed to start node: {}", e);
        std::io::Error::other(e.to_string())
    })?;
    tracing::info!("🌐 Packet channel: {}", node.address());
    tracing::info!("🚪 Client gateway: {}", node.gateway_address());

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Received Ctrl-C");
    node.shutdown().await;

    Ok(())
}

/// Load configuration with CLI overrides
fn load_configuration(args: &Args) -> Result<RaftlinkConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => RaftlinkConfig::from_file(path)?,
        None => RaftlinkConfig::load_default()?,
    };

    if let Some(ref address) = args.address {
        config.node.address = address.clone();
    }

    if let Some(ref peers) = args.peers {
        config.cluster.peers = peers.clone();
    }

    if let Some(ref storage_path) = args.storage_path {
        config.storage.path = storage_path.clone();
    }

    if let Some(ref log_level) = args.log_level {
        config.logging.level = log_level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn directive(spec: String) -> std::io::Result<Directive> {
    spec.parse().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid log directive '{}': {}", spec, e),
        )
    })
}

/// Setup logging based on configuration
fn setup_logging(config: &RaftlinkConfig) -> std::io::Result<()> {
    use tracing_subscriber::fmt::time::ChronoUtc;

    let level = config
        .logging
        .level
        .parse::<tracing::Level>()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid log level: {}", e),
            )
        })?;

    let openraft_level = if level >= tracing::Level::DEBUG {
        "debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(directive(format!("raftlink={}", level))?)
        .add_directive(directive(format!("openraft={}", openraft_level))?);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(ChronoUtc::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_target(config.logging.structured);

    match (&config.logging.format, config.logging.enable_colors) {
        (LogFormat::Json, _) => subscriber.json().init(),
        (LogFormat::Compact, colors) => subscriber.compact().with_ansi(colors).init(),
        (LogFormat::Pretty, colors) => subscriber.pretty().with_ansi(colors).init(),
    }

    Ok(())
}

/// Generate a default configuration file
fn generate_default_config(path: PathBuf) -> std::io::Result<()> {
    let config = RaftlinkConfig::default();

    config
        .to_file(&path)
        .map_err(|e| std::io::Error::other(format!("Failed to write config: {}", e)))?;

    println!(
        "✅ Generated default configuration file: {}",
        path.display()
    );
    println!("📝 Edit the file to customize your raftlink node settings");
    println!("🚀 Start with: raftlink-node --config {}", path.display());

    Ok(())
}

/// List default configuration file locations
fn list_config_paths() -> std::io::Result<()> {
    println!("📍 raftlink looks for its config in this order:");
    for (i, path) in RaftlinkConfig::default_config_paths().iter().enumerate() {
        let marker = if path.exists() { "found" } else { "-" };
        println!("  {}. [{}] {}", i + 1, marker, path.display());
    }
    println!("💡 Pass --config <path> to use another file");

    Ok(())
}
