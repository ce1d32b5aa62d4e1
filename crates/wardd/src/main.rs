//! wardd — the Ward node agent.
//!
//! Runs the listener daemon, and doubles as a client for sending requests
//! to a local or remote listener.
//!
//! # Usage
//!
//! ```text
//! wardd run --config /etc/ward/node.toml
//! wardd request --action daemon_status
//! wardd request --dest n2 --action node_logs --options '{"follow": true}'
//! wardd gen-certs --out /etc/ward/pki --cluster prod --node n1=10.0.0.1
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use ward_codec::{Codec, Decrypted, Keyring};
use ward_core::{ActionRequest, ConfigStore, Ledger, NodeSelector};
use ward_listener::Listener;
use ward_transport::{Requester, StreamItem};

const DEFAULT_CONFIG: &str = "/etc/ward/node.toml";

#[derive(Parser)]
#[command(name = "wardd", about = "Ward node agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the listener daemon until stopped.
    Run {
        /// Node configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Send one request and print the reply.
    Request {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Destination: node name, URL or socket path. Empty for the
        /// local listener.
        #[arg(long, default_value = "")]
        dest: String,

        #[arg(long)]
        action: String,

        /// Action options as a JSON object.
        #[arg(long, default_value = "{}")]
        options: String,

        /// Run on these nodes (comma separated, or `*`).
        #[arg(long)]
        node: Option<String>,

        /// Print every frame until the listener closes the stream.
        #[arg(long)]
        stream: bool,
    },

    /// Generate a cluster CA and node certificates.
    GenCerts {
        /// Output directory.
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        cluster: String,

        /// `name=addr[,addr...]`, repeatable.
        #[arg(long = "node", required = true)]
        nodes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,wardd=debug,ward=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Request {
            config,
            dest,
            action,
            options,
            node,
            stream,
        } => request(&config, &dest, &action, &options, node.as_deref(), stream).await,
        Command::GenCerts {
            out,
            cluster,
            nodes,
        } => gen_certs(&out, &cluster, &nodes),
    }
}

async fn run(config: &Path) -> anyhow::Result<()> {
    let store = Arc::new(
        ConfigStore::open(config)
            .with_context(|| format!("loading config {}", config.display()))?,
    );
    let listener = Listener::new(store).bind()?;
    let ctx = listener.context().clone();

    // Graceful shutdown on Ctrl-C.
    let stop = ctx.stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            stop.signal();
        }
    });

    listener.run().await?;
    ctx.components.shutdown_ordered().await;
    info!("wardd exited");
    Ok(())
}

fn requester(config: &Path) -> anyhow::Result<Requester> {
    let store = Arc::new(
        ConfigStore::open(config)
            .with_context(|| format!("loading config {}", config.display()))?,
    );
    let nodename = store.get().nodename();
    let keyring = Arc::new(Keyring::from_store(store.clone()));
    let codec = Arc::new(Codec::new(&nodename, keyring, Arc::new(Ledger::new())));
    Ok(Requester::new(store, codec))
}

async fn request(
    config: &Path,
    dest: &str,
    action: &str,
    options: &str,
    node: Option<&str>,
    stream: bool,
) -> anyhow::Result<()> {
    let options: Value = serde_json::from_str(options).context("options must be JSON")?;
    let Value::Object(options) = options else {
        bail!("options must be a JSON object");
    };
    let mut req = ActionRequest::new(action);
    req.options = options;
    if let Some(node) = node {
        req = req.with_node(NodeSelector::One(node.to_string()));
    }
    let requester = requester(config)?;

    if !stream {
        let reply = requester.request(dest, &req.to_value()).await?;
        println!("{}", serde_json::to_string_pretty(&reply)?);
        return Ok(());
    }

    let mut frames = requester.open(dest, &req.to_value()).await?;
    while let Some(item) = frames.next().await? {
        match item {
            StreamItem::Heartbeat => {}
            StreamItem::Message(Decrypted::Structured { value, .. }) => {
                println!("{}", serde_json::to_string(&value)?);
            }
            StreamItem::Message(Decrypted::Raw { bytes, .. }) => {
                print!("{}", String::from_utf8_lossy(&bytes));
            }
            StreamItem::Message(Decrypted::Rejected) => bail!("reply rejected"),
        }
    }
    Ok(())
}

fn gen_certs(out: &Path, cluster: &str, nodes: &[String]) -> anyhow::Result<()> {
    let mut specs = Vec::new();
    for spec in nodes {
        let (name, addrs) = spec.split_once('=').unwrap_or((spec.as_str(), ""));
        if name.is_empty() {
            bail!("invalid node spec '{spec}'");
        }
        let addrs = addrs
            .split(',')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        specs.push((name.to_string(), addrs));
    }
    ward_transport::tls::write_cluster_certs(out, cluster, &specs)?;
    info!(dir = %out.display(), nodes = specs.len(), "cluster certificates written");
    Ok(())
}
