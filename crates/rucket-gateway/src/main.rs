//! Rucket gateway: cluster bootstrap and primary coordination.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rucket_cluster::{
    bootstrap, BootstrapOutcome, BootstrapSettings, ClusterNode, FileMetaStore, LocalNetwork,
    MemoryMetaStore, MetaStoreExt,
};
use rucket_core::config::{Config, LogFormat};
use rucket_core::meta::{BucketMetadata, ClusterMap, GlobalConfig, RebalanceMetadata};
use rucket_core::NodeDescriptor;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;

use cli::{Cli, Commands, ShowMetaArgs, SimulateArgs, StartArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_node(args).await,
        Commands::Simulate(args) => run_simulation(args).await,
        Commands::ShowMeta(args) => show_meta(&args),
        Commands::Version => {
            println!("rucket-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_node(args: StartArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;

    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(pid) = args.primary_id.filter(|pid| !pid.is_empty()) {
        config.bootstrap.primary_id = Some(pid);
    }
    if args.is_primary {
        config.bootstrap.is_primary = true;
    }
    if let Some(ntargets) = args.ntargets {
        config.bootstrap.expected_targets = ntargets;
    }
    if args.skip_startup {
        config.bootstrap.skip_startup = true;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config)?;

    let store = FileMetaStore::open(&config.node.data_dir)
        .context("Failed to open metadata directory")?;
    let network = LocalNetwork::new();
    let si = config.node.descriptor();
    let node = ClusterNode::new(
        si.clone(),
        BootstrapSettings::from(&config),
        Arc::new(store),
        network.transport(si.id()),
    );
    network.register(&node);

    info!(
        node_id = %si.id(),
        role = %si.role(),
        data_dir = %config.node.data_dir.display(),
        "Starting gateway"
    );

    let ctx = node.context().clone();
    let handle = bootstrap::start(node.clone()).await.context("Bootstrap failed")?;
    info!(role = ?handle.role(), "Bootstrap running");

    let wait = handle.wait();
    tokio::pin!(wait);

    tokio::select! {
        outcome = &mut wait => {
            match outcome {
                Ok(BootstrapOutcome::Cancelled) => return Ok(()),
                Ok(outcome) => info!(?outcome, "Cluster started"),
                Err(e) => {
                    error!(error = %e, "Bootstrap failed");
                    return Err(e).context("Bootstrap failed");
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, cancelling bootstrap");
            ctx.shutdown();
            if let Err(e) = wait.await {
                warn!(error = %e, "Bootstrap ended with error during shutdown");
            }
            return Ok(());
        }
    }

    shutdown_signal().await;
    info!("Shutdown signal received");
    ctx.shutdown();
    Ok(())
}

/// Bootstraps `proxies + targets` nodes over one in-process network and
/// prints the map the primary agreed on.
async fn run_simulation(args: SimulateArgs) -> Result<()> {
    let mut config = Config::default();
    config.logging.level = "warn".to_string();
    init_logging(&config)?;

    let startup = Duration::from_millis(args.startup_ms.max(100));
    let primary = sim_node("p1", true);
    let base = BootstrapSettings {
        expected_targets: usize::from(args.targets),
        primary_url: Some(primary.control_url().to_string()),
        skip_startup: args.targets == 0,
        startup,
        cplane_operation: startup / 40,
        max_host_busy: startup / 4,
        call_timeout: startup / 10,
        ..BootstrapSettings::from(&config)
    };

    let network = LocalNetwork::new();
    let spawn = |si: NodeDescriptor, settings: BootstrapSettings| {
        let node = ClusterNode::new(
            si.clone(),
            settings,
            Arc::new(MemoryMetaStore::new()),
            network.transport(si.id()),
        );
        network.register(&node);
        node
    };

    let leader = spawn(primary, BootstrapSettings { is_primary: true, ..base.clone() });
    let mut others = Vec::new();
    for i in 2..=args.proxies {
        others.push(spawn(sim_node(&format!("p{i}"), true), base.clone()));
    }
    for i in 1..=args.targets {
        others.push(spawn(sim_node(&format!("t{i}"), false), base.clone()));
    }

    let handle = bootstrap::start(leader.clone()).await.context("Primary failed to start")?;

    let mut tasks = JoinSet::new();
    for node in others {
        tasks.spawn(async move {
            let id = node.id().to_string();
            let outcome = match bootstrap::start(node).await {
                Ok(handle) => handle.wait().await,
                Err(e) => Err(e),
            };
            (id, outcome)
        });
    }

    handle.wait().await.context("Primary failed to form the cluster")?;
    while let Some(joined) = tasks.join_next().await {
        let (id, outcome) = joined.context("Bootstrap task panicked")?;
        outcome.with_context(|| format!("Node {id} failed to join"))?;
    }

    let map = leader.owners().cluster_map.get();
    println!("{}", serde_json::to_string_pretty(&*map)?);
    Ok(())
}

fn sim_node(id: &str, proxy: bool) -> NodeDescriptor {
    let control = format!("http://{id}.sim:9080");
    let public = format!("http://{id}.sim:8080");
    if proxy {
        NodeDescriptor::proxy(id, control, public)
    } else {
        NodeDescriptor::target(id, control, public)
    }
}

fn show_meta(args: &ShowMetaArgs) -> Result<()> {
    if !args.data_dir.is_dir() {
        bail!("Data directory {} does not exist", args.data_dir.display());
    }
    let store = FileMetaStore::open(&args.data_dir).context("Failed to open metadata directory")?;

    let docs = serde_json::json!({
        "cluster_map": store.load::<ClusterMap>().context("Failed to load cluster map")?,
        "bucket_md": store.load::<BucketMetadata>().context("Failed to load bucket metadata")?,
        "rebalance_md": store
            .load::<RebalanceMetadata>()
            .context("Failed to load rebalance metadata")?,
        "global_config": store.load::<GlobalConfig>().context("Failed to load global config")?,
    });
    println!("{}", serde_json::to_string_pretty(&docs)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    Config::load(path.as_deref()).context("Failed to load configuration")
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}
