use crate::classifier::HttpClassifier;
use crate::config_loader::{load_config, VeilConfig};
use crate::content_tree::{read_feed, ContentTree};
use crate::decision::Policy;
use crate::logging::init_logging;
use crate::mutator::ItemState;
use crate::persistence::{KeyValueStore, PersistenceBridge, SledStore};
use crate::pipeline::{HostEvent, ModerationPipeline};
use crate::settings_web;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Top-level CLI interface for feedveil
#[derive(Parser)]
#[command(
    name = "feedveil",
    version,
    about = "Classify feed items and conceal the risky ones"
)]
pub struct Cli {
    /// Config file (defaults to ./feedveil.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline over a feed snapshot and print a summary
    Scan {
        /// JSON feed snapshot (a node or an array of nodes)
        feed: PathBuf,
        /// Further snapshots appended one after another as incremental updates
        #[arg(long)]
        append: Vec<PathBuf>,
        /// Also print the moderated feed as HTML
        #[arg(long)]
        html: bool,
    },

    /// Run the pipeline and the settings API together over one store, so
    /// threshold changes made over HTTP re-decide the feed immediately
    Watch {
        /// JSON feed snapshot (a node or an array of nodes)
        feed: PathBuf,
        /// Further snapshots appended one after another as incremental updates
        #[arg(long)]
        append: Vec<PathBuf>,
        /// Host/IP to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve the settings API
    Serve {
        /// Host/IP to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show thresholds, or update them when values are given
    Thresholds {
        #[arg(long)]
        ai: Option<f64>,
        #[arg(long)]
        misinfo: Option<f64>,
    },

    /// Show the concealment counters
    Stats,

    /// Clear the concealment record
    Clear,

    /// Print the effective configuration as TOML
    Config,
}

fn open_bridge(config: &VeilConfig) -> anyhow::Result<PersistenceBridge> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    // sled holds an exclusive lock; while `watch` or `serve` runs, use the settings API.
    let store: Arc<dyn KeyValueStore> = Arc::new(
        SledStore::open(config.store_path())
            .with_context(|| format!("opening store {}", config.store_path().display()))?,
    );
    Ok(PersistenceBridge::new(store, config.policy))
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level);

    match cli.command {
        Commands::Scan { feed, append, html } => scan(&config, feed, append, html).await,
        Commands::Watch {
            feed,
            append,
            host,
            port,
        } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            watch(&config, feed, append, host, port).await
        }
        Commands::Serve { host, port } => {
            let bridge = Arc::new(open_bridge(&config)?);
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            settings_web::serve(bridge, &host, port).await?;
            Ok(())
        }
        Commands::Thresholds { ai, misinfo } => {
            let bridge = open_bridge(&config)?;
            let current = bridge.load_policy().await?;
            if ai.is_some() || misinfo.is_some() {
                let next = Policy::new(
                    ai.unwrap_or(current.ai_threshold),
                    misinfo.unwrap_or(current.misinfo_threshold),
                );
                bridge.save_policy(&next).await?;
            }
            let policy = bridge.load_policy().await?;
            println!("ai_threshold      = {}", policy.ai_threshold);
            println!("misinfo_threshold = {}", policy.misinfo_threshold);
            Ok(())
        }
        Commands::Stats => {
            let stats = open_bridge(&config)?.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Clear => {
            open_bridge(&config)?.clear_record().await?;
            println!("Concealment record cleared");
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn start_pipeline(config: &VeilConfig, feed: &Path) -> anyhow::Result<ModerationPipeline> {
    let tree = ContentTree::load_feed(feed)?;
    let bridge = open_bridge(config)?;
    let classifier = Arc::new(HttpClassifier::from_config(&config.classifier)?);
    let mut pipeline = ModerationPipeline::new(tree, config, classifier, bridge);
    pipeline.start().await?;
    Ok(pipeline)
}

fn queue_updates(append: &[PathBuf]) -> anyhow::Result<(mpsc::UnboundedSender<HostEvent>, mpsc::UnboundedReceiver<HostEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for path in append {
        for node in read_feed(path)? {
            tx.send(HostEvent::Append(node))
                .context("queueing feed update")?;
        }
    }
    Ok((tx, rx))
}

async fn scan(config: &VeilConfig, feed: PathBuf, append: Vec<PathBuf>, html: bool) -> anyhow::Result<()> {
    let mut pipeline = start_pipeline(config, &feed).await?;
    let (tx, rx) = queue_updates(&append)?;
    drop(tx);
    pipeline.run(rx).await?;
    print_summary(&pipeline, html)
}

async fn watch(
    config: &VeilConfig,
    feed: PathBuf,
    append: Vec<PathBuf>,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    let mut pipeline = start_pipeline(config, &feed).await?;
    let settings = Arc::new(pipeline.bridge().clone());
    let server = tokio::spawn(async move { settings_web::serve(settings, &host, port).await });

    let (tx, rx) = queue_updates(&append)?;
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable, stopping");
        }
        drop(tx);
    };
    let (outcome, ()) = tokio::join!(pipeline.run(rx), shutdown);
    server.abort();
    outcome?;
    print_summary(&pipeline, false)
}

fn print_summary(pipeline: &ModerationPipeline, html: bool) -> anyhow::Result<()> {
    let summary = serde_json::json!({
        "stats": pipeline.stats(),
        "concealedNodes": pipeline.tree().descendants(pipeline.tree().root())
            .into_iter()
            .filter(|n| pipeline.state_of(*n) == ItemState::Concealed)
            .count(),
        "recordedIdentities": pipeline.record().len(),
        "totalRemovedCount": pipeline.record().total_concealed_count(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if html {
        let root = pipeline.tree().root();
        println!("{}", pipeline.tree().inner_html(root));
    }
    Ok(())
}
