//! DSLink — Main Entry Point
//!
//! Serves a small demo tree to a broker and, optionally, mirrors one
//! remote value into the log.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │   TcpTransport (Transport)        LogEventSink (EventSink)   │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ───────────────────    │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  Link  →  Session (Requester · Responder · Queue)      │  │
//! │  │  MemoryTree (NodeResolver)                             │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use dslink::adapters::log_sink::LogEventSink;
use dslink::app::tree::MemoryTree;
use dslink::rpc::codec::CodecKind;
use dslink::rpc::frame::ValueUpdate;
use dslink::rpc::permission::Permission;
use dslink::rpc::requester::SubscriptionHandler;
use dslink::rpc::responder::ActionResult;
use dslink::{Link, LinkConfig, Value};

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "dslink", version, about = "DSA link serving an in-memory tree")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker address (host:port), overrides the config file
    #[arg(long)]
    broker: Option<String>,

    /// Link name, overrides the config file
    #[arg(long)]
    name: Option<String>,

    /// Payload codec, overrides the config file
    #[arg(long, value_parser = parse_codec)]
    codec: Option<CodecKind>,

    /// Remote path whose value is logged as it changes
    #[arg(long)]
    subscribe: Option<String>,
}

fn parse_codec(s: &str) -> Result<CodecKind, String> {
    match s {
        "json" => Ok(CodecKind::Json),
        "postcard" => Ok(CodecKind::Postcard),
        other => Err(format!("unknown codec '{other}' (json|postcard)")),
    }
}

struct LogValue(String);

impl SubscriptionHandler for LogValue {
    fn on_update(&self, update: &ValueUpdate) {
        info!("{} = {}", self.0, update.value);
    }
}

fn build_tree(started: Instant) -> Result<Arc<MemoryTree>> {
    let tree = MemoryTree::new();
    let build = || -> Result<(), dslink::DsError> {
        tree.add_node("/sys", dslink::app::ports::NodeInfo::node())?;
        tree.add_value("/sys/uptime", "number", 0, None)?;
        tree.add_value("/sys/version", "string", env!("CARGO_PKG_VERSION"), None)?;
        tree.add_value("/setpoint", "number", 0, Some(Permission::Write))?;
        tree.add_action(
            "/echo",
            Permission::Read,
            vec![Value::map().with("name", "text").with("type", "string")],
            vec![Value::map().with("name", "text").with("type", "string")],
            |params, _stream| {
                let text = params.get("text").cloned().unwrap_or_default();
                Ok(ActionResult::Row(vec![text]))
            },
        )?;
        tree.add_action(
            "/sys/uptimeLog",
            Permission::Read,
            Vec::new(),
            vec![Value::map().with("name", "uptime").with("type", "number")],
            move |_params, stream| {
                std::thread::spawn(move || {
                    while stream.append(vec![vec![Value::from(started.elapsed().as_secs() as i64)]]) {
                        std::thread::sleep(Duration::from_secs(1));
                    }
                });
                Ok(ActionResult::stream(vec![
                    Value::map().with("name", "uptime").with("type", "number"),
                ]))
            },
        )?;
        Ok(())
    };
    build().map_err(|e| anyhow::anyhow!("building tree: {e}"))?;
    Ok(tree)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LinkConfig::default(),
    };
    if let Some(broker) = args.broker {
        config.broker = broker;
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(codec) = args.codec {
        config.codec = codec;
    }
    config.validate()?;

    info!("DSLink {} v{} → {}", config.name, env!("CARGO_PKG_VERSION"), config.broker);

    let started = Instant::now();
    let tree = build_tree(started)?;
    {
        let tree = tree.clone();
        std::thread::Builder::new()
            .name("uptime".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(1));
                if tree.update("/sys/uptime", started.elapsed().as_secs() as i64).is_err() {
                    break;
                }
            })?;
    }

    let link = Link::new(config, tree, Arc::new(LogEventSink::new()))?;
    if args.subscribe.is_some() {
        if let Err(e) = link.requester() {
            warn!("--subscribe ignored: {}", e);
        }
    }

    loop {
        match link.connect() {
            Ok(()) => {
                // A disconnect ends every subscription, so each connection
                // subscribes afresh.
                let _subscription = match (&args.subscribe, link.requester()) {
                    (Some(path), Ok(requester)) => {
                        Some(requester.subscribe(path, 0, Arc::new(LogValue(path.clone()))))
                    }
                    _ => None,
                };
                link.wait();
            }
            Err(e) => warn!("LINK | connect to {} failed: {}", link.config().broker, e),
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
}
