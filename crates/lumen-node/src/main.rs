//! lumend: the lumen ledger node daemon.
//!
//! Loads the node configuration, wires the core components over an SQLite
//! store, optionally runs genesis bootstrap, then serves the JSON-RPC
//! front-end until SIGINT or SIGTERM. Exit code 0 on a clean stop, 1 on a
//! startup error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::crypto::NodeKeypair;
use lumen_core::id::Reference;
use lumen_core::jet::Role;
use lumen_core::storage::SqliteStore;
use lumen_node::config::NodeConfig;
use lumen_node::dispatch::{LocalOnlyJetQuery, Node, NodeDeps};
use lumen_node::genesis::{self, GenesisConfig};
use lumen_node::roster::{StaticRoster, parse_role, reference_hex};
use lumen_node::rpc::{RequesterGateway, router};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// lumen ledger node
#[derive(Parser, Debug)]
#[command(name = "lumend", version, about)]
struct Args {
    /// Path to the node configuration file
    #[arg(long)]
    config: PathBuf,

    /// Force trace-level logging
    #[arg(long)]
    trace: bool,

    /// Path to the genesis configuration file
    #[arg(long)]
    genesis_config: Option<PathBuf>,

    /// Directory generated genesis keys are written to
    #[arg(long)]
    genesis_key_out: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.trace);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("trace")
    } else {
        // LUMEN_LOG_LEVEL in {debug, info, warn, error}; default info
        let level =
            std::env::var("LUMEN_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let config = NodeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Some(parent) = config.storage_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteStore::open(&config.storage_path)
            .with_context(|| format!("opening {}", config.storage_path.display()))?,
    );

    let keys = Arc::new(load_or_generate_keys(&config)?);
    info!(node = %reference_hex(&keys.reference()), "node identity");

    let roles = config
        .roles
        .iter()
        .map(|name| parse_role(name))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing node roles")?;
    let roster = Arc::new(
        StaticRoster::from_config(&config.roster, keys.reference(), &roles)
            .context("building roster")?,
    );

    let shutdown = CancellationToken::new();
    let node = Arc::new(
        Node::build(
            store,
            NodeDeps {
                keys,
                roster,
                roles,
                jet_query: Arc::new(LocalOnlyJetQuery),
                call_sender: None,
                jet_fetch_timeout: config.jet_fetch_timeout,
                call_timeout: config.call_timeout,
                pending_limit: config.pending_limit,
                shutdown: shutdown.clone(),
            },
        )
        .context("wiring node components")?,
    );

    let genesis_config = match &args.genesis_config {
        Some(path) => GenesisConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GenesisConfig::default(),
    };
    if args.genesis_config.is_some() || args.genesis_key_out.is_some() {
        let key_out = args
            .genesis_key_out
            .clone()
            .unwrap_or_else(|| PathBuf::from("lumen-data/genesis-keys"));
        let report =
            genesis::run(&node, &genesis_config, &key_out).context("genesis bootstrap")?;
        info!(
            seeded = report.seeded,
            root_domain = %report.root_domain,
            "genesis bootstrap done"
        );
    }

    // light eviction follows the keeper's top-sync advances; a node that is
    // itself the heavy store keeps everything
    if !node.has_role(Role::HeavyExecutor) {
        let cleaner = node.cleaner.clone();
        let top_sync = node.keeper.watch_top_sync();
        let cleaner_token = shutdown.child_token();
        tokio::spawn(async move {
            cleaner.run(top_sync, cleaner_token).await;
        });
    }

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        stop.cancel();
    });

    let gateway = Arc::new(RequesterGateway::new(
        node.requester.clone(),
        node.pulses.clone(),
        Reference::from_object(genesis::root_domain_id(&genesis_config.root_domain)),
        shutdown.clone(),
    ));
    let app = router(gateway);
    let listener = tokio::net::TcpListener::bind(config.rpc_listen)
        .await
        .with_context(|| format!("binding {}", config.rpc_listen))?;
    info!(listen = %config.rpc_listen, "rpc front-end up");

    let serve_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await
        .context("rpc server")?;

    info!("clean stop");
    Ok(())
}

fn load_or_generate_keys(config: &NodeConfig) -> Result<NodeKeypair> {
    if config.key_file.exists() {
        return NodeKeypair::load(&config.key_file)
            .with_context(|| format!("loading {}", config.key_file.display()));
    }
    if let Some(parent) = config.key_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let keys = NodeKeypair::generate();
    keys.save(&config.key_file)
        .with_context(|| format!("writing {}", config.key_file.display()))?;
    info!(path = %config.key_file.display(), "generated node key");
    Ok(keys)
}
