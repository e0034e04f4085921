use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use desync::capture::system_provider;
use desync::net::gateway::{GatewayResolver, GatewayTarget};
use desync::net::hop_tracker::{HopCache, HopEstimator};
use desync::net::interface::{self, InterfaceInfo};
use desync::protocols::tls::{ClientHelloBuilder, locate_sni};
use desync::tunnel::transport::{FragmentationStats, SplitMode, fragment};
use desync::EvasionConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Inspect what the ClientHello desync machinery sees on this host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,

    /// YAML configuration file
    #[arg(long, global = true, value_name = "FILE_PATH", env = "DESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Control the log verbosity. i.e: TRACE, DEBUG, INFO, WARN, ERROR, OFF
    /// for more details: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax
    #[arg(long, global = true, value_name = "LOG_LEVEL", default_value = "INFO")]
    log_lvl: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the outbound interface and default gateway
    Detect {
        /// Also resolve the gateway MAC over ARP (needs raw socket privilege)
        #[arg(long)]
        arp: bool,
    },
    /// Sniff SYN+ACKs and report hop estimates
    Watch {
        #[arg(long, default_value_t = 30)]
        secs: u64,
    },
    /// Show how a synthetic ClientHello would be split
    Plan {
        #[arg(long, default_value = "sni")]
        mode: SplitMode,
        #[arg(long, default_value_t = 0)]
        chunk_size: usize,
        #[arg(long, default_value = "www.w3.org")]
        sni: String,
    },
}

fn outbound_interface(config: &EvasionConfig) -> anyhow::Result<InterfaceInfo> {
    let iface = match &config.interface {
        Some(name) => interface::interface_by_name(name),
        None => interface::detect_outbound_interface(config.probe_addr),
    };
    iface.context("cannot find outbound interface")
}

async fn detect(config: &EvasionConfig, arp: bool) -> anyhow::Result<()> {
    let iface = outbound_interface(config)?;
    let gateway_ip = interface::default_gateway(&iface.name).context("cannot find default gateway")?;

    println!("interface: {} (index {})", iface.name, iface.index);
    println!("mac:       {}", iface.mac);
    println!("local ip:  {}", iface.local_ip);
    println!("gateway:   {}", gateway_ip);

    if arp {
        let provider = system_provider().context("raw link access is not available")?;
        let resolver = GatewayResolver::new(
            provider,
            GatewayTarget::Fixed {
                interface: iface,
                gateway_ip,
            },
            config.arp_timeout(),
        );
        let gateway = resolver.resolve().await.context("cannot resolve gateway MAC")?;
        println!("gateway mac: {}", gateway.gateway_mac);
    }

    Ok(())
}

async fn watch(config: &EvasionConfig, secs: u64) -> anyhow::Result<()> {
    let iface = outbound_interface(config)?;
    let provider = system_provider().context("raw link access is not available")?;
    let link = provider
        .open(&iface.name)
        .with_context(|| format!("cannot open capture handle on {}", iface.name))?;

    let cancel = CancellationToken::new();
    let estimator = Arc::new(HopEstimator::new(HopCache::new(config.hop_cache_ttl())));
    estimator.start(link, &cancel)?;
    info!("Watching SYN+ACKs on {} for {}s", iface.name, secs);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
    }

    cancel.cancel();
    let stopper = estimator.clone();
    if tokio::task::spawn_blocking(move || stopper.stop()).await.is_err() {
        warn!("Hop estimator did not stop cleanly");
    }

    let stats = estimator.cache().stats();
    println!(
        "hop records: {} ({} valid, {} expired)",
        stats.total_entries, stats.valid_entries, stats.expired_entries
    );
    Ok(())
}

fn plan(mode: SplitMode, chunk_size: usize, sni: &str) -> anyhow::Result<()> {
    let hello = ClientHelloBuilder::new(sni)
        .build()
        .with_context(|| format!("cannot build a ClientHello for {}", sni))?;
    match locate_sni(&hello) {
        Ok(location) => println!("ClientHello: {} bytes, SNI at {:?}", hello.len(), location.range()),
        Err(err) => println!("ClientHello: {} bytes, no SNI ({})", hello.len(), err),
    }

    let plan = fragment(&hello, mode, chunk_size);
    let mut offset = 0;
    for (i, segment) in plan.iter().enumerate() {
        println!("  #{:<3} {:>5}..{:<5} {} bytes", i, offset, offset + segment.len(), segment.len());
        offset += segment.len();
    }
    println!("{}: {}", mode, FragmentationStats::from_plan(&plan));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let mut env_filter = tracing_subscriber::EnvFilter::builder().parse_lossy(&args.log_lvl);
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        env_filter = tracing_subscriber::EnvFilter::builder().parse_lossy(rust_log);
    }
    tracing_subscriber::fmt()
        .with_ansi(true)
        .with_env_filter(env_filter)
        .init();

    let config = match &args.config {
        Some(path) => EvasionConfig::load(path)?,
        None => EvasionConfig::default(),
    };

    match args.commands {
        Commands::Detect { arp } => detect(&config, arp).await,
        Commands::Watch { secs } => watch(&config, secs).await,
        Commands::Plan { mode, chunk_size, sni } => plan(mode, chunk_size, &sni),
    }
}
